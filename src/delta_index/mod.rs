// Copyright (c) 2024-present, dedup-index contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Packed, sorted, delta-compressed key -> value store over a set of
//! delta lists, partitioned across zones.
//!
//! Every search, insert, and remove fully decodes its list into a
//! `Vec<ListEntry>`, operates on the decoded form, and (for mutations)
//! re-encodes the whole list rather than splicing bits in place or
//! memoizing a cursor position between calls on the same list — see
//! `list.rs` for why that's no less correct, and no slower in practice,
//! given list sizes bounded by a chapter's record count.

mod list;
mod stats;

pub use list::ListEntry;
pub use stats::DeltaIndexStats;

use crate::bits::DeltaCode;
use crate::error::{Error, Result};
use crate::name::RecordName;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use list::DeltaList;
use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::Instant;

/// The result of positioning a cursor on a delta list.
#[derive(Debug, Clone)]
pub struct DeltaIndexEntry {
    pub list: u32,
    pub key: u64,
    pub value: u64,
    pub found: bool,
    pub is_collision: bool,
    pub at_end: bool,
}

struct DeltaZone {
    first_list: u32,
    lists: Vec<DeltaList>,
    bits_budget: u64,
}

/// A multi-zone delta index.
///
/// In mutable (volume-index) mode it owns `zone_count` zones, each with a
/// contiguous range of lists and its own bit budget. Immutable
/// (chapter-index-page) mode is realized by constructing with
/// `zone_count = 1` and reusing the same search/encode code paths.
pub struct DeltaIndex {
    code: DeltaCode,
    value_bits: u8,
    list_count: u32,
    zones: Vec<DeltaZone>,
    stats: Mutex<DeltaIndexStats>,
}

fn choose_incr_keys(mean_delta: u32) -> u8 {
    let bits = 32 - mean_delta.max(1).leading_zeros();
    (bits as u8).clamp(1, 32)
}

impl DeltaIndex {
    /// Computes per-list and per-zone bit budgets and allocates memory.
    ///
    /// `memory_size` is the total number of bytes available across all
    /// zones and lists; it is split evenly across zones and, within a
    /// zone, evenly across that zone's lists.
    pub fn initialize(
        zone_count: u32,
        list_count: u32,
        mean_delta: u32,
        payload_bits: u8,
        memory_size: usize,
    ) -> Result<Self> {
        if zone_count == 0 {
            return Err(Error::InvalidArgument("zone_count must be nonzero"));
        }
        if list_count < zone_count {
            return Err(Error::InvalidArgument(
                "list_count must be >= zone_count",
            ));
        }

        let total_bits = (memory_size as u64) * 8;
        let per_zone_bits = total_bits / u64::from(zone_count);

        let mut zones = Vec::with_capacity(zone_count as usize);
        let base_lists_per_zone = list_count / zone_count;
        let extra = list_count % zone_count;

        let mut first_list = 0u32;
        for zone_idx in 0..zone_count {
            let lists_in_zone = base_lists_per_zone + u32::from(zone_idx < extra);
            let per_list_bits = per_zone_bits / u64::from(lists_in_zone.max(1));

            let lists = (0..lists_in_zone)
                .map(|_| DeltaList::with_allocated_bits(per_list_bits))
                .collect();

            zones.push(DeltaZone {
                first_list,
                lists,
                bits_budget: per_zone_bits,
            });

            first_list += lists_in_zone;
        }

        Ok(Self {
            code: DeltaCode::new(choose_incr_keys(mean_delta)),
            value_bits: payload_bits,
            list_count,
            zones,
            stats: Mutex::new(DeltaIndexStats {
                list_count,
                memory_allocated: total_bits / 8,
                ..Default::default()
            }),
        })
    }

    #[must_use]
    pub fn list_count(&self) -> u32 {
        self.list_count
    }

    fn zone_and_local(&self, list: u32) -> Result<(usize, usize)> {
        for (zi, zone) in self.zones.iter().enumerate() {
            let count = zone.lists.len() as u32;
            if list >= zone.first_list && list < zone.first_list + count {
                return Ok((zi, (list - zone.first_list) as usize));
            }
        }
        Err(Error::InvalidArgument("list number out of range"))
    }

    /// Decodes all entries of `list`, in ascending key order.
    pub fn list_entries(&self, list: u32) -> Result<Vec<ListEntry>> {
        let (zi, li) = self.zone_and_local(list)?;
        Ok(self.zones[zi].lists[li].decode(&self.code, self.value_bits))
    }

    /// Replaces the contents of `list` with `entries` (already sorted
    /// ascending by key), re-encoding in place. Used by the volume index's
    /// lazy LRU flush to drop stale entries before a search.
    pub fn replace_list_entries(&mut self, list: u32, entries: &[ListEntry]) -> Result<()> {
        let (zi, li) = self.zone_and_local(list)?;
        self.zones[zi].lists[li].encode(entries, &self.code, self.value_bits)
    }

    /// The zone that owns `list`.
    pub fn zone_of(&self, list: u32) -> Result<u32> {
        let (zi, _) = self.zone_and_local(list)?;
        Ok(zi as u32)
    }

    /// The `(first_list, list_count)` range owned by `zone`.
    pub fn zone_range(&self, zone: u32) -> Result<(u32, u32)> {
        let z = self
            .zones
            .get(zone as usize)
            .ok_or(Error::InvalidArgument("zone number out of range"))?;
        Ok((z.first_list, z.lists.len() as u32))
    }

    #[must_use]
    pub fn zone_count(&self) -> u32 {
        self.zones.len() as u32
    }

    /// Positions a cursor at the first entry with `key >= target`; if that
    /// entry is a collision, its name is compared (and its collision
    /// siblings walked) against `name` to determine `found`.
    pub fn get_entry(&self, list: u32, target: u64, name: Option<&RecordName>) -> Result<DeltaIndexEntry> {
        let entries = self.list_entries(list)?;
        Ok(Self::search_decoded(&entries, list, target, name))
    }

    fn search_decoded(
        entries: &[ListEntry],
        list: u32,
        target: u64,
        name: Option<&RecordName>,
    ) -> DeltaIndexEntry {
        let start = entries.partition_point(|e| e.key < target);

        if start >= entries.len() || entries[start].key != target {
            return DeltaIndexEntry {
                list,
                key: target,
                value: 0,
                found: false,
                is_collision: false,
                at_end: start >= entries.len(),
            };
        }

        // Entries with the same key: at most one is a non-collision
        // "primary"; the rest are collision entries carrying a name.
        let run_end = entries[start..]
            .iter()
            .take_while(|e| e.key == target)
            .count()
            + start;

        let any_collisions = entries[start..run_end].iter().any(ListEntry::is_collision);

        if !any_collisions {
            let entry = &entries[start];
            return DeltaIndexEntry {
                list,
                key: target,
                value: entry.value,
                found: true,
                is_collision: false,
                at_end: false,
            };
        }

        for entry in &entries[start..run_end] {
            if let Some(entry_name) = &entry.name {
                if Some(entry_name) == name {
                    return DeltaIndexEntry {
                        list,
                        key: target,
                        value: entry.value,
                        found: true,
                        is_collision: true,
                        at_end: false,
                    };
                }
            }
        }

        DeltaIndexEntry {
            list,
            key: target,
            value: 0,
            found: false,
            is_collision: true,
            at_end: false,
        }
    }

    /// Inserts `(key, value)`. If `name` is `Some`, the entry is inserted
    /// as a collision entry.
    ///
    /// # Errors
    ///
    /// `Error::Overflow` if the list cannot accommodate the entry even
    /// after a rebalance attempt; the entry is dropped (not inserted) —
    /// this is not treated as a fatal error.
    pub fn put_entry(
        &mut self,
        list: u32,
        key: u64,
        value: u64,
        name: Option<&RecordName>,
    ) -> Result<()> {
        let (zi, li) = self.zone_and_local(list)?;
        let mut entries = self.zones[zi].lists[li].decode(&self.code, self.value_bits);

        let pos = entries.partition_point(|e| e.key < key);
        let insert_at = entries[pos..]
            .iter()
            .take_while(|e| e.key == key)
            .count()
            + pos;

        entries.insert(
            insert_at,
            ListEntry {
                key,
                value,
                name: name.copied(),
            },
        );

        match self.zones[zi].lists[li].encode(&entries, &self.code, self.value_bits) {
            Ok(()) => {
                let mut stats = self.stats.lock().expect("stats lock poisoned");
                stats.record_count += 1;
                if name.is_some() {
                    stats.collision_count += 1;
                }
                Ok(())
            }
            Err(Error::Overflow) => {
                if self.try_rebalance(zi, li, &entries) {
                    let mut stats = self.stats.lock().expect("stats lock poisoned");
                    stats.record_count += 1;
                    if name.is_some() {
                        stats.collision_count += 1;
                    }
                    Ok(())
                } else {
                    let mut stats = self.stats.lock().expect("stats lock poisoned");
                    stats.overflow_count += 1;
                    stats.discard_count += 1;
                    log::warn!(
                        "delta list {list} overflowed (rate-limited); dropping entry"
                    );
                    Err(Error::Overflow)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Redistributes free space among the lists of zone `zi` so that list
    /// `li` can fit `entries`.
    ///
    /// Each list's allocation shrinks to its actual content size, then the
    /// freed slack is handed to `li`. If the zone's total budget still
    /// can't fit everyone, rebalance fails and the caller reports
    /// overflow.
    fn try_rebalance(&mut self, zi: usize, li: usize, entries: &[ListEntry]) -> bool {
        let started = Instant::now();

        let zone = &mut self.zones[zi];
        let needed = DeltaList::encoded_size(entries, &self.code, self.value_bits);

        let mut used_by_others = 0u64;
        for (idx, list) in zone.lists.iter().enumerate() {
            if idx != li {
                used_by_others += list.bit_count();
            }
        }

        if used_by_others + needed > zone.bits_budget {
            return false;
        }

        for (idx, list) in zone.lists.iter_mut().enumerate() {
            list.allocated_bits = if idx == li { needed } else { list.bit_count() };
        }

        let ok = zone.lists[li].encode(entries, &self.code, self.value_bits).is_ok();

        if ok {
            let mut stats = self.stats.lock().expect("stats lock poisoned");
            stats.rebalance_count += 1;
            stats.rebalance_time += started.elapsed();
        }

        ok
    }

    /// Removes the entry matching `(key, name)`, returning whether one was
    /// found and removed.
    pub fn remove_entry(&mut self, list: u32, key: u64, name: Option<&RecordName>) -> Result<bool> {
        let (zi, li) = self.zone_and_local(list)?;
        let mut entries = self.zones[zi].lists[li].decode(&self.code, self.value_bits);

        let found = Self::search_decoded(&entries, list, key, name);
        if !found.found {
            return Ok(false);
        }

        let remove_idx = entries
            .iter()
            .position(|e| e.key == key && e.name.as_ref() == name)
            .or_else(|| entries.iter().position(|e| e.key == key && e.name.is_none()))
            .expect("search said found, so an entry must match");

        entries.remove(remove_idx);
        self.zones[zi].lists[li]
            .encode(&entries, &self.code, self.value_bits)
            .expect("removing an entry can only shrink the encoded size");

        Ok(true)
    }

    /// Updates the payload of the entry matching `(key, name)` in place,
    /// without changing its key.
    pub fn set_entry_value(
        &mut self,
        list: u32,
        key: u64,
        name: Option<&RecordName>,
        value: u64,
    ) -> Result<bool> {
        let (zi, li) = self.zone_and_local(list)?;
        let mut entries = self.zones[zi].lists[li].decode(&self.code, self.value_bits);

        let found = Self::search_decoded(&entries, list, key, name);
        if !found.found {
            return Ok(false);
        }

        let idx = entries
            .iter()
            .position(|e| e.key == key && e.name.as_ref() == name)
            .or_else(|| entries.iter().position(|e| e.key == key && e.name.is_none()))
            .expect("search said found, so an entry must match");

        entries[idx].value = value;
        self.zones[zi].lists[li]
            .encode(&entries, &self.code, self.value_bits)
            .expect("rewriting the same entry set can't grow past capacity");

        Ok(true)
    }

    #[must_use]
    pub fn stats(&self) -> DeltaIndexStats {
        *self.stats.lock().expect("stats lock poisoned")
    }

    /// Streams all lists belonging to `zone` to `writer`, terminated by a
    /// guard list record.
    ///
    /// The header's `bit_offset` byte is repurposed to carry the number of
    /// valid bits in the list's final byte (1..=8, or 0 for an empty
    /// list) — without it `byte_count` alone can't distinguish real
    /// trailing content from zero padding on restore.
    pub fn save_zone<W: Write>(&self, zone: u32, writer: &mut W) -> Result<()> {
        let z = &self.zones[zone as usize];

        for (i, list) in z.lists.iter().enumerate() {
            let index = z.first_list + i as u32;
            let byte_count = list.bit_count().div_ceil(8);
            if byte_count > u64::from(u16::MAX) {
                return Err(Error::InvalidArgument("delta list too large to save"));
            }

            writer.write_u8(0)?; // tag (reserved)
            writer.write_u8(list.trailing_bits())?;
            writer.write_u16::<LittleEndian>(byte_count as u16)?;
            writer.write_u32::<LittleEndian>(index)?;
            writer.write_all(&list.raw_bytes())?;
        }

        // Guard list.
        writer.write_u8(0)?;
        writer.write_u8(0)?;
        writer.write_u16::<LittleEndian>(0)?;
        writer.write_u32::<LittleEndian>(self.list_count)?;

        Ok(())
    }

    /// Restores all lists belonging to `zone` from `reader`, verifying the
    /// trailing guard list; a mismatch is `Error::CorruptData`.
    pub fn restore_zone<R: Read>(&mut self, zone: u32, reader: &mut R) -> Result<()> {
        let z = &mut self.zones[zone as usize];
        let zone_first = z.first_list;
        let zone_len = z.lists.len() as u32;

        loop {
            let _tag = reader.read_u8()?;
            let trailing_bits = reader.read_u8()?;
            let byte_count = reader.read_u16::<LittleEndian>()?;
            let index = reader.read_u32::<LittleEndian>()?;

            if index == self.list_count && byte_count == 0 {
                return Ok(()); // guard reached
            }

            if index < zone_first || index >= zone_first + zone_len {
                return Err(Error::CorruptData("list index outside zone range"));
            }

            let mut buf = vec![0u8; byte_count as usize];
            reader.read_exact(&mut buf)?;

            let bit_count = if byte_count == 0 {
                0
            } else {
                (u64::from(byte_count) - 1) * 8 + u64::from(trailing_bits)
            };

            let li = (index - zone_first) as usize;
            z.lists[li] = DeltaList::from_raw(buf, bit_count);
        }
    }
}
