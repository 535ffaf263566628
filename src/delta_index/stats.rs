// Copyright (c) 2024-present, dedup-index contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::time::Duration;

/// Aggregate counters for a delta index.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeltaIndexStats {
    pub memory_allocated: u64,
    pub rebalance_count: u64,
    pub rebalance_time: Duration,
    pub record_count: u64,
    pub collision_count: u64,
    pub discard_count: u64,
    pub overflow_count: u64,
    pub list_count: u32,
    pub early_flushes: u64,
}

impl DeltaIndexStats {
    #[must_use]
    pub fn combine(self, other: Self) -> Self {
        Self {
            memory_allocated: self.memory_allocated + other.memory_allocated,
            rebalance_count: self.rebalance_count + other.rebalance_count,
            rebalance_time: self.rebalance_time + other.rebalance_time,
            record_count: self.record_count + other.record_count,
            collision_count: self.collision_count + other.collision_count,
            discard_count: self.discard_count + other.discard_count,
            overflow_count: self.overflow_count + other.overflow_count,
            list_count: self.list_count + other.list_count,
            early_flushes: self.early_flushes + other.early_flushes,
        }
    }
}
