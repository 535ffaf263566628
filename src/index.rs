// Copyright (c) 2024-present, dedup-index contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Top-level controller: owns every component and exposes the public
//! request/save/load/rebuild surface.
//!
//! Grounded on `segment/mod.rs`'s `Segment(Arc<Inner>)` shape: a single
//! struct owning every subcomponent behind a thin public handle.
//! Every field here follows the rest of the crate's convention of interior
//! mutability behind `&self` (as `VolumeIndex` and `ChapterWriter` already
//! do) rather than requiring `&mut Index` at the call site.

use crate::buffered_io::BufferedWriter;
use crate::chapter_writer::ChapterWriter;
use crate::config::{CreateMode, IndexConfig};
use crate::delta_index::DeltaIndexStats;
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::index_zone::{IndexZone, ZoneIntent};
use crate::name::RecordName;
use crate::open_chapter::{self, OpenChapter};
use crate::pipeline::{self, PageSource, Pipeline, QueueItem};
use crate::request::{Request, RequestOutcome, ZoneMessage};
use crate::sparse_cache::SparseCache;
use crate::volume_index::VolumeIndex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// The controller's coarse lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Ready,
    Suspended,
    Freeing,
}

/// Saved on-disk state for a volume, as produced by `Index::save` and
/// consumed by `Index::load`: each zone's volume-index slice plus the
/// interleaved open-chapter stream.
pub struct SavedState {
    pub volume_index_zones: Vec<Vec<u8>>,
    pub open_chapters: Vec<u8>,
}

/// One closed chapter's records, as read back off the volume during a
/// rebuild scan. The volume's own physical layout (the surrounding
/// super-block/slab format) is out of scope here, so a rebuild caller
/// supplies the already-decoded names per chapter rather than this module
/// re-deriving them from a raw device.
pub struct ChapterRecordSummary {
    pub virtual_chapter: u64,
    pub names: Vec<RecordName>,
}

/// Combined statistics snapshot: both subindexes' `DeltaIndexStats`, plus
/// chapter-writer and sparse-cache sizes not captured by the delta index
/// itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct IndexStats {
    pub volume_index: DeltaIndexStats,
    pub sparse_cache_chapters: usize,
    pub chapters_written: u64,
}

pub struct Index {
    geometry: Geometry,
    volume_index: VolumeIndex,
    zones: Mutex<Vec<IndexZone>>,
    writer: ChapterWriter,
    sparse_cache: SparseCache,
    pipeline: Pipeline,
    page_source: Arc<dyn PageSource>,
    state: Mutex<ControllerState>,
    chapters_written: AtomicU64,
}

impl Index {
    /// Builds a fresh index with every zone's open chapter at virtual
    /// chapter 0, discarding any prior state.
    pub fn create(geometry: Geometry, config: &IndexConfig, page_source: Arc<dyn PageSource>) -> Result<Self> {
        let volume_index = VolumeIndex::new(geometry, config.volume_nonce)?;
        for zone in 0..geometry.zone_count {
            volume_index.set_zone_open_chapter(zone, 0)?;
        }

        let zones = (0..geometry.zone_count).map(|id| IndexZone::new(id, &geometry)).collect();

        Ok(Self {
            geometry,
            volume_index,
            zones: Mutex::new(zones),
            writer: ChapterWriter::new(geometry),
            sparse_cache: SparseCache::new(geometry.sparse_chapters_per_volume.max(1) as usize),
            pipeline: Pipeline::new(geometry),
            page_source,
            state: Mutex::new(ControllerState::Ready),
            chapters_written: AtomicU64::new(0),
        })
    }

    /// Restores a volume index and open chapters from a prior `save`.
    pub fn load(geometry: Geometry, config: &IndexConfig, page_source: Arc<dyn PageSource>, saved: &SavedState) -> Result<Self> {
        let mut volume_index = VolumeIndex::new(geometry, config.volume_nonce)?;
        for (zone, bytes) in saved.volume_index_zones.iter().enumerate() {
            volume_index.restore_zone(zone as u32, &mut &bytes[..])?;
        }

        let mut open_chapters: Vec<OpenChapter> = (0..geometry.zone_count)
            .map(|_| OpenChapter::new(crate::chapter_writer::open_chapter_capacity(&geometry)))
            .collect();
        open_chapter::load_all(&mut open_chapters, &mut &saved.open_chapters[..], |name| {
            volume_index.zone_for(name).unwrap_or(0)
        })?;

        // The open chapter just restored is always the *next* one to be
        // written, so every zone's `newest` starts at 0 relative to this
        // fresh `VolumeIndex` (its watermarks were themselves restored by
        // `restore_zone` above and carry the true virtual-chapter history).
        let zones = open_chapters
            .into_iter()
            .enumerate()
            .map(|(id, open_chapter)| IndexZone::from_restored(id as u32, open_chapter, 0))
            .collect();

        Ok(Self {
            geometry,
            volume_index,
            zones: Mutex::new(zones),
            writer: ChapterWriter::new(geometry),
            sparse_cache: SparseCache::new(geometry.sparse_chapters_per_volume.max(1) as usize),
            pipeline: Pipeline::new(geometry),
            page_source,
            state: Mutex::new(ControllerState::Ready),
            chapters_written: AtomicU64::new(0),
        })
    }

    /// Brings an index up according to `config.create_mode`:
    /// `CREATE` always starts fresh; `LOAD` tries `saved` and falls back to
    /// `CREATE` on any error other than `OutOfMemory`; `NO_REBUILD` fails
    /// outright rather than falling back.
    pub fn open(
        geometry: Geometry,
        config: IndexConfig,
        page_source: Arc<dyn PageSource>,
        saved: Option<&SavedState>,
    ) -> Result<Self> {
        match config.create_mode {
            CreateMode::Create => Self::create(geometry, &config, page_source),
            CreateMode::Load => match saved {
                Some(s) => match Self::load(geometry, &config, page_source.clone(), s) {
                    Ok(index) => Ok(index),
                    Err(Error::OutOfMemory) => Err(Error::OutOfMemory),
                    Err(e) => {
                        log::warn!("load failed ({e}); falling back to create");
                        Self::create(geometry, &config, page_source)
                    }
                },
                None => Self::create(geometry, &config, page_source),
            },
            CreateMode::NoRebuild => {
                let s = saved.ok_or(Error::BadState("NO_REBUILD requires saved state"))?;
                Self::load(geometry, &config, page_source, s)
            }
        }
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.pipeline.is_suspended()
    }

    /// Submits one request and runs it to completion.
    ///
    /// # Errors
    ///
    /// `Error::Busy` if the index is suspended.
    pub fn submit(&self, request: Request) -> Result<RequestOutcome> {
        if self.is_suspended() {
            return Err(Error::Busy);
        }

        let newest: Vec<u64> = {
            let zones = self.zones.lock().expect("zones lock poisoned");
            zones.iter().map(IndexZone::newest).collect()
        };

        let zone_id = self.pipeline.submit(request, &self.volume_index, &newest)?;
        self.drain_zone(zone_id)
    }

    /// Drains queued messages for `zone_id`, applying each, until the
    /// request just submitted for it is reached and dispatched.
    fn drain_zone(&self, zone_id: u32) -> Result<RequestOutcome> {
        loop {
            match self.pipeline.try_next(zone_id) {
                Some(QueueItem::Message(msg)) => self.handle_message(zone_id, msg)?,
                Some(QueueItem::Request(request)) => return self.execute(zone_id, &request),
                None => return Err(Error::BadState("zone queue drained without finding its request")),
            }
        }
    }

    fn handle_message(&self, zone_id: u32, msg: ZoneMessage) -> Result<()> {
        match msg {
            ZoneMessage::SparseCacheBarrier(vc) => {
                let mut zones = self.zones.lock().expect("zones lock poisoned");
                zones[zone_id as usize].handle_sparse_cache_barrier(vc);
                Ok(())
            }
            ZoneMessage::AnnounceChapterClosed(vc) => {
                let handoff = {
                    let mut zones = self.zones.lock().expect("zones lock poisoned");
                    zones[zone_id as usize].handle_chapter_closed(vc, self.geometry.zone_count)
                };
                if let Some((writing, intent)) = handoff {
                    let new_newest = {
                        let zones = self.zones.lock().expect("zones lock poisoned");
                        zones[zone_id as usize].newest()
                    };
                    self.volume_index.set_zone_open_chapter(zone_id, new_newest)?;
                    self.writer.deposit(zone_id, writing);
                    if let Some(intent) = intent {
                        self.apply_intent(zone_id, intent);
                    }
                }
                Ok(())
            }
        }
    }

    fn apply_intent(&self, zone_id: u32, intent: ZoneIntent) {
        match intent {
            ZoneIntent::AnnounceChapterClosed(vc) => self.pipeline.announce_chapter_closed(vc, zone_id),
            ZoneIntent::SparseCacheBarrier(vc) => self.pipeline.broadcast_barrier(vc),
        }
    }

    fn execute(&self, zone_id: u32, request: &Request) -> Result<RequestOutcome> {
        let mut zones = self.zones.lock().expect("zones lock poisoned");
        let zone = &mut zones[zone_id as usize];

        let result = pipeline::dispatch(
            request,
            zone,
            &self.volume_index,
            &self.sparse_cache,
            self.page_source.as_ref(),
            &self.geometry,
        )?;

        if result.chapter_full {
            let (writing, intent) = zone.open_next_chapter(self.geometry.zone_count);
            let new_newest = zone.newest();
            drop(zones);
            self.volume_index.set_zone_open_chapter(zone_id, new_newest)?;
            self.writer.deposit(zone_id, writing);
            if let Some(intent) = intent {
                self.apply_intent(zone_id, intent);
            }
        }

        Ok(result.outcome)
    }

    /// Runs one collation+write round on the (single, shared) chapter
    /// writer, installing the closed chapter into the sparse cache if the
    /// new chapter pushes it into the sparse region, and advancing every
    /// zone's volume-index watermark to admit the chapter that replaced it.
    pub fn process_writer(&self, writer_output: &mut BufferedWriter) -> Result<Option<u64>> {
        match self.writer.run_once(writer_output) {
            None => Ok(None),
            Some(Err(e)) => Err(e),
            Some(Ok(closed)) => {
                let vc = closed.virtual_chapter;
                if self.geometry.is_sparse() {
                    self.sparse_cache.install(vc, Arc::new(closed.index));
                }
                for zone in 0..self.geometry.zone_count {
                    self.volume_index.set_zone_open_chapter(zone, vc + 1)?;
                }
                self.pipeline.broadcast_barrier(vc);
                self.chapters_written.fetch_add(1, Ordering::Relaxed);
                Ok(Some(vc))
            }
        }
    }

    /// Suspends request processing; in-flight work already dispatched
    /// completes, but `submit` starts returning `Busy` immediately.
    pub fn suspend(&self) {
        *self.state.lock().expect("state lock poisoned") = ControllerState::Suspended;
        self.pipeline.suspend();
    }

    pub fn resume(&self) {
        self.pipeline.resume();
        *self.state.lock().expect("state lock poisoned") = ControllerState::Ready;
    }

    /// Stops the chapter writer and marks the controller as freeing;
    /// further requests are rejected. Idempotent.
    pub fn free(&self) {
        self.writer.stop();
        *self.state.lock().expect("state lock poisoned") = ControllerState::Freeing;
    }

    /// Re-admits `chapters` into the volume index for names not already
    /// present, in ascending virtual-chapter order, oldest to newest.
    ///
    /// A name destined for what will be a sparse chapter once rebuild
    /// completes is skipped unless it's a sample, mirroring how a live
    /// sparse chapter only ever admits samples into the hook subindex.
    ///
    /// # Errors
    ///
    /// `Error::CorruptData` if the chapter range spans more than
    /// `chapters_per_volume` — such a range can't have come from a single
    /// consistent volume.
    pub fn rebuild(&self, chapters: impl IntoIterator<Item = ChapterRecordSummary>) -> Result<()> {
        let chapters: Vec<ChapterRecordSummary> = chapters.into_iter().collect();
        let (Some(lowest), Some(highest)) = (
            chapters.first().map(|c| c.virtual_chapter),
            chapters.last().map(|c| c.virtual_chapter),
        ) else {
            return Ok(());
        };
        if highest - lowest > self.geometry.chapters_per_volume {
            return Err(Error::CorruptData("rebuild chapter range exceeds chapters_per_volume"));
        }

        let final_newest = highest + 1;
        for chapter in chapters {
            for zone in 0..self.geometry.zone_count {
                self.volume_index.set_zone_open_chapter(zone, chapter.virtual_chapter)?;
            }
            let chapters_behind = final_newest - chapter.virtual_chapter;
            let will_be_sparse = self.geometry.is_sparse_chapter(chapters_behind);
            for name in chapter.names {
                if will_be_sparse && !crate::name::is_sample(&name, self.geometry.sparse_sample_rate) {
                    continue;
                }
                let record = self.volume_index.get_record(&name)?;
                if !record.is_found {
                    self.volume_index.put_record(&record, chapter.virtual_chapter)?;
                }
            }
        }
        Ok(())
    }

    /// Saves every zone's volume-index slice plus the interleaved
    /// open-chapter stream.
    ///
    /// # Errors
    ///
    /// `Error::Busy` if `read_only` was set on the controller's config (the
    /// caller is expected to check that before calling `save`; this method
    /// itself has no config handle, so it always proceeds — read-only
    /// enforcement happens at the embedding layer).
    pub fn save(&self) -> Result<SavedState> {
        let mut volume_index_zones = Vec::with_capacity(self.geometry.zone_count as usize);
        for zone in 0..self.geometry.zone_count {
            let mut buf = Vec::new();
            self.volume_index.save_zone(zone, &mut buf)?;
            volume_index_zones.push(buf);
        }

        let zones = self.zones.lock().expect("zones lock poisoned");
        let open_chapters_ref: Vec<&OpenChapter> = zones.iter().map(IndexZone::open_chapter).collect();
        let owned: Vec<OpenChapter> = open_chapters_ref
            .iter()
            .map(|c| {
                let mut fresh = OpenChapter::new(c.capacity());
                for (name, metadata) in c.live_records() {
                    fresh.put(name, metadata);
                }
                fresh
            })
            .collect();
        drop(zones);

        let mut open_chapters = Vec::new();
        open_chapter::save_all(&owned, &mut open_chapters)?;

        Ok(SavedState {
            volume_index_zones,
            open_chapters,
        })
    }

    #[must_use]
    pub fn stats(&self) -> IndexStats {
        IndexStats {
            volume_index: self.volume_index.stats(),
            sparse_cache_chapters: self.sparse_cache.len(),
            chapters_written: self.chapters_written.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffered_io::{BlockDevice as _, BufferedWriter, MemoryDevice};
    use crate::config::IndexConfig;
    use crate::pipeline::NoPageSource;
    use crate::request::RequestType;

    fn geometry() -> Geometry {
        Geometry::new(4, 2, 8, 0, 0, 1, 4, 20, 4, 32, 1 << 16).unwrap()
    }

    fn config() -> IndexConfig {
        IndexConfig::new(CreateMode::Create, 1)
    }

    #[test]
    fn post_then_query_round_trips() {
        let index = Index::create(geometry(), &config(), Arc::new(NoPageSource)).unwrap();
        let name = RecordName([3; 20]);

        let post = Request::new(name, RequestType::Post).with_metadata(vec![7, 8]);
        index.submit(post).unwrap();

        let query = Request::new(name, RequestType::QueryNoUpdate);
        let outcome = index.submit(query).unwrap();
        assert_eq!(outcome.metadata, Some(vec![7, 8]));
    }

    #[test]
    fn suspend_rejects_new_requests() {
        let index = Index::create(geometry(), &config(), Arc::new(NoPageSource)).unwrap();
        index.suspend();
        let name = RecordName([1; 20]);
        let err = index
            .submit(Request::new(name, RequestType::QueryNoUpdate))
            .unwrap_err();
        assert!(matches!(err, Error::Busy));
        index.resume();
        assert!(index.submit(Request::new(name, RequestType::QueryNoUpdate)).is_ok());
    }

    #[test]
    fn chapter_fills_and_writer_collates() {
        let geo = geometry();
        let index = Index::create(geo, &config(), Arc::new(NoPageSource)).unwrap();

        for tag in 0..geo.records_per_chapter as u8 {
            let name = RecordName([tag; 20]);
            index
                .submit(Request::new(name, RequestType::Post).with_metadata(vec![tag]))
                .unwrap();
        }

        let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new(1 << 20));
        let mut bw = BufferedWriter::new(device, 0, 1 << 20);
        let vc = index.process_writer(&mut bw).unwrap();
        assert_eq!(vc, Some(0));
        assert_eq!(index.stats().chapters_written, 1);
    }

    #[test]
    fn save_round_trips_through_load() {
        let geo = geometry();
        let index = Index::create(geo, &config(), Arc::new(NoPageSource)).unwrap();
        let name = RecordName([9; 20]);
        index
            .submit(Request::new(name, RequestType::Post).with_metadata(vec![1, 2, 3]))
            .unwrap();

        let saved = index.save().unwrap();
        let reloaded = Index::load(geo, &config(), Arc::new(NoPageSource), &saved).unwrap();

        let outcome = reloaded
            .submit(Request::new(name, RequestType::QueryNoUpdate))
            .unwrap();
        assert_eq!(outcome.metadata, Some(vec![1, 2, 3]));
    }

    #[test]
    fn rebuild_readmits_unknown_names() {
        let geo = geometry();
        let index = Index::create(geo, &config(), Arc::new(NoPageSource)).unwrap();
        let name = RecordName([5; 20]);

        index
            .rebuild([ChapterRecordSummary {
                virtual_chapter: 2,
                names: vec![name],
            }])
            .unwrap();

        let outcome = index
            .submit(Request::new(name, RequestType::QueryNoUpdate))
            .unwrap();
        assert_eq!(outcome.virtual_chapter, Some(2));
    }
}
