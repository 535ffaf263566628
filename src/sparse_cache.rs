// Copyright (c) 2024-present, dedup-index contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! LRU cache of closed sparse-chapter index pages, updated only via
//! barrier messages.
//!
//! Grounded on the `BlockCache`/`Cache` pattern used throughout
//! `flush.rs` and `segment/mod.rs` (`Arc<Cache>`, `cache.get_data_block`,
//! `cache.insert_block`): same "LRU keyed by id, shared via `Arc`" shape,
//! backed here by `quick_cache` rather than hand-rolled eviction
//! bookkeeping.

use crate::delta_index::DeltaIndex;
use quick_cache::sync::Cache;
use std::sync::Arc;

/// An immutable, single-zone `DeltaIndex` view over one closed sparse
/// chapter's index pages.
pub type SparseChapterIndex = Arc<DeltaIndex>;

/// LRU-evicted cache of sparse chapter indexes, keyed by virtual chapter
/// number. Entries are inserted only in response to a
/// `SPARSE_CACHE_BARRIER{vc}` message, never opportunistically by a
/// reader.
pub struct SparseCache {
    cache: Cache<u64, SparseChapterIndex>,
}

impl SparseCache {
    #[must_use]
    pub fn new(capacity_chapters: usize) -> Self {
        Self {
            cache: Cache::new(capacity_chapters.max(1)),
        }
    }

    /// Installs `index` as the cached page set for virtual chapter `vc`,
    /// in response to a barrier message.
    pub fn install(&self, vc: u64, index: SparseChapterIndex) {
        self.cache.insert(vc, index);
    }

    /// Looks up the cached index for `vc`, if present.
    #[must_use]
    pub fn get(&self, vc: u64) -> Option<SparseChapterIndex> {
        self.cache.get(&vc)
    }

    #[must_use]
    pub fn contains(&self, vc: u64) -> bool {
        self.cache.get(&vc).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len() as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
