// Copyright (c) 2024-present, dedup-index contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-zone glue: owns an open chapter, advances `oldest`/`newest`, and
//! reports cache-coherency intents back to the controller.
//!
//! A zone-to-controller back-pointer is deliberately not modeled here: a
//! zone never reaches out to the controller. Instead `open_next_chapter`
//! returns `ZoneIntent`s describing what the controller should do next,
//! the same way `segment/mod.rs`'s `Segment` is an opaque `Arc<Inner>`
//! handle rather than something that phones home to its owning tree.

use crate::chapter_writer::{open_chapter_capacity, snapshot_for_handoff, WritingChapter};
use crate::geometry::Geometry;
use crate::open_chapter::OpenChapter;

/// A control-plane action the controller must take on behalf of a zone,
/// returned rather than performed directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneIntent {
    /// Broadcast `ANNOUNCE_CHAPTER_CLOSED{vc}` to every other zone — sent
    /// by whichever zone is first to close it.
    AnnounceChapterClosed(u64),
    /// Enqueue a sparse-cache barrier for `vc` on every zone queue, for
    /// cross-zone cache coherency.
    SparseCacheBarrier(u64),
}

/// Per-zone state: the open chapter accepting puts, and bookkeeping
/// shared with the writer handoff.
pub struct IndexZone {
    pub id: u32,
    open_chapter: OpenChapter,
    newest: u64,
    oldest_known_closed: u64,
}

impl IndexZone {
    #[must_use]
    pub fn new(id: u32, geometry: &Geometry) -> Self {
        Self {
            id,
            open_chapter: OpenChapter::new(open_chapter_capacity(geometry)),
            newest: 0,
            oldest_known_closed: 0,
        }
    }

    /// Rebuilds a zone around an already-populated open chapter, restored
    /// from a prior `save`.
    #[must_use]
    pub fn from_restored(id: u32, open_chapter: OpenChapter, newest: u64) -> Self {
        Self {
            id,
            open_chapter,
            newest,
            oldest_known_closed: 0,
        }
    }

    #[must_use]
    pub fn open_chapter(&self) -> &OpenChapter {
        &self.open_chapter
    }

    pub fn open_chapter_mut(&mut self) -> &mut OpenChapter {
        &mut self.open_chapter
    }

    #[must_use]
    pub fn newest(&self) -> u64 {
        self.newest
    }

    /// Swaps the open chapter out for handoff, advances `newest`, and
    /// resets a fresh open chapter.
    ///
    /// Returns the `WritingChapter` to hand to `ChapterWriter`, plus an
    /// `AnnounceChapterClosed` intent if this is the first zone (by id)
    /// to observe this handoff in a multi-zone index.
    pub fn open_next_chapter(&mut self, zone_count: u32) -> (WritingChapter, Option<ZoneIntent>) {
        let closed_vc = self.newest;
        let writing = snapshot_for_handoff(&self.open_chapter, closed_vc);

        self.open_chapter.clear();
        self.newest += 1;

        let intent = if zone_count > 1 && self.id == 0 {
            Some(ZoneIntent::AnnounceChapterClosed(closed_vc))
        } else {
            None
        };

        log::debug!("zone {} closed chapter {closed_vc}, opened {}", self.id, self.newest);

        (writing, intent)
    }

    /// Reacts to a peer zone closing chapter `vc`: skew control — if this
    /// zone's `newest` matches, it closes too so zones don't drift apart.
    ///
    /// Returns the same tuple as `open_next_chapter` if this zone also
    /// closes as a result, `None` otherwise.
    pub fn handle_chapter_closed(&mut self, vc: u64, zone_count: u32) -> Option<(WritingChapter, Option<ZoneIntent>)> {
        if self.newest == vc {
            Some(self.open_next_chapter(zone_count))
        } else {
            None
        }
    }

    /// Records that this zone has observed the sparse cache barrier for
    /// `vc`. The actual cache update is performed by the controller
    /// against the shared `SparseCache`; this only tracks the zone-local
    /// watermark used to detect a stale barrier.
    pub fn handle_sparse_cache_barrier(&mut self, vc: u64) {
        self.oldest_known_closed = self.oldest_known_closed.max(vc);
    }
}
