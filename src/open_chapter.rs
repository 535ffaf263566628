// Copyright (c) 2024-present, dedup-index contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! In-memory newest-chapter record store, one per zone.
//!
//! Storage is a 1-based record array plus a power-of-two slot table with
//! quadratic probing; slot `0` means "empty". Grounded on `flush.rs`'s
//! "accumulate in memory, drain into a segment" shape, adapted here from
//! an ordered memtable to an open-addressed table.

use crate::error::{Error, Result};
use crate::name::{RecordName, RECORD_NAME_SIZE};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

const SAVE_MAGIC: &[u8; 5] = b"ALBOC";
const SAVE_VERSION: &[u8; 5] = b"02.00";

#[derive(Clone)]
struct StoredRecord {
    name: RecordName,
    metadata: Vec<u8>,
    deleted: bool,
}

#[derive(Clone, Copy, Default)]
struct Slot {
    /// 1-based index into `records`; `0` means empty.
    record_number: u32,
}

/// A single zone's open chapter: the newest, still-mutable chapter.
pub struct OpenChapter {
    capacity: usize,
    /// 1-based: `records[0]` is unused padding so slot `0` can mean empty.
    records: Vec<Option<StoredRecord>>,
    slots: Vec<Slot>,
    size: usize,
    deletions: u64,
}

impl OpenChapter {
    /// `capacity` is `records_per_chapter / zone_count`.
    /// The slot table is sized to the next power of two `>= 2*capacity`
    /// (load factor `<= 1/2`).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let slot_count = (2 * capacity.max(1)).next_power_of_two();
        Self {
            capacity,
            records: vec![None], // index 0 reserved
            slots: vec![Slot::default(); slot_count],
            size: 0,
            deletions: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.size >= self.capacity
    }

    fn slot_mask(&self) -> u32 {
        self.slots.len() as u32 - 1
    }

    fn hash(&self, name: &RecordName) -> u32 {
        let h = xxhash_rust::xxh3::xxh3_64(&name.0);
        (h as u32) & self.slot_mask()
    }

    /// Quadratic probe for `name`: returns the slot index that either
    /// holds it (live or deleted) or is the first empty slot found.
    fn probe(&self, name: &RecordName) -> usize {
        let mask = self.slot_mask();
        let mut slot = self.hash(name);
        let mut attempts: u32 = 0;

        loop {
            let idx = (slot & mask) as usize;
            let s = self.slots[idx];
            if s.record_number == 0 {
                return idx;
            }
            if let Some(record) = &self.records[s.record_number as usize] {
                if record.name == *name {
                    return idx;
                }
            }
            attempts += 1;
            slot = slot.wrapping_add(attempts);

            debug_assert!((attempts as usize) <= self.slots.len(), "probe looped the whole table");
        }
    }

    /// Inserts or updates `name -> metadata`.
    ///
    /// Returns `capacity - size` after the operation; if the chapter is
    /// already full, returns `0` *without* inserting.
    pub fn put(&mut self, name: &RecordName, metadata: &[u8]) -> usize {
        let idx = self.probe(name);
        let slot = self.slots[idx];

        if slot.record_number != 0 {
            let record = self.records[slot.record_number as usize]
                .as_mut()
                .expect("slot points at a live record array entry");
            record.metadata = metadata.to_vec();
            record.deleted = false;
            return self.capacity - self.size;
        }

        if self.is_full() {
            return 0;
        }

        self.records.push(Some(StoredRecord {
            name: *name,
            metadata: metadata.to_vec(),
            deleted: false,
        }));
        let record_number = (self.records.len() - 1) as u32;
        self.slots[idx] = Slot { record_number };
        self.size += 1;

        self.capacity - self.size
    }

    /// Looks up `name`, returning its metadata if present and not
    /// deleted.
    #[must_use]
    pub fn search(&self, name: &RecordName) -> Option<&[u8]> {
        let idx = self.probe(name);
        let slot = self.slots[idx];
        if slot.record_number == 0 {
            return None;
        }
        let record = self.records[slot.record_number as usize].as_ref()?;
        if record.deleted {
            None
        } else {
            Some(&record.metadata)
        }
    }

    /// Marks `name`'s record deleted, if present. Returns whether a live
    /// record was found.
    pub fn remove(&mut self, name: &RecordName) -> bool {
        let idx = self.probe(name);
        let slot = self.slots[idx];
        if slot.record_number == 0 {
            return false;
        }
        let record = self.records[slot.record_number as usize]
            .as_mut()
            .expect("slot points at a live record array entry");
        if record.deleted {
            return false;
        }
        record.deleted = true;
        self.deletions += 1;
        true
    }

    /// All live (non-deleted) `(name, metadata)` pairs, 1-based record
    /// order.
    #[must_use]
    pub fn live_records(&self) -> Vec<(&RecordName, &[u8])> {
        self.records
            .iter()
            .skip(1)
            .filter_map(|r| r.as_ref())
            .filter(|r| !r.deleted)
            .map(|r| (&r.name, r.metadata.as_slice()))
            .collect()
    }

    /// The record at 1-based index `index`, if present and live.
    #[must_use]
    pub fn record_at(&self, index: usize) -> Option<(&RecordName, &[u8])> {
        let record = self.records.get(index)?.as_ref()?;
        if record.deleted {
            None
        } else {
            Some((&record.name, record.metadata.as_slice()))
        }
    }

    /// Resets this chapter to empty, for reuse as the new open chapter
    /// after a handoff.
    pub fn clear(&mut self) {
        self.records.truncate(1);
        self.slots.iter_mut().for_each(|s| *s = Slot::default());
        self.size = 0;
        self.deletions = 0;
    }
}

/// Saves every zone's open chapter in one interleaved stream: zone `z`,
/// index `i`, visiting zones `0..Z`, then `i++`.
pub fn save_all<W: Write>(chapters: &[OpenChapter], writer: &mut W) -> Result<()> {
    let total: usize = chapters.iter().map(OpenChapter::size).sum();
    if total > u32::MAX as usize {
        return Err(Error::InvalidArgument("too many open-chapter records to save"));
    }

    writer.write_all(SAVE_MAGIC)?;
    writer.write_all(SAVE_VERSION)?;
    writer.write_u32::<LittleEndian>(total as u32)?;

    let max_records = chapters.iter().map(|c| c.records.len()).max().unwrap_or(1);
    for i in 1..max_records {
        for chapter in chapters {
            if let Some((name, metadata)) = chapter.record_at(i) {
                writer.write_all(&name.0)?;
                writer.write_u32::<LittleEndian>(metadata.len() as u32)?;
                writer.write_all(metadata)?;
            }
        }
    }

    Ok(())
}

/// Loads a stream produced by `save_all`, dispatching each record to its
/// owning zone via `zone_of`. Stops admitting records into a zone once
/// its chapter would drop to `<= 1` remaining slot, avoiding filling a
/// zone exactly, which would cause an immediate spurious close.
pub fn load_all<R: Read>(
    chapters: &mut [OpenChapter],
    reader: &mut R,
    zone_of: impl Fn(&RecordName) -> u32,
) -> Result<()> {
    let mut magic = [0u8; 5];
    reader.read_exact(&mut magic)?;
    if &magic != SAVE_MAGIC {
        return Err(Error::CorruptData("open chapter magic mismatch"));
    }

    let mut version = [0u8; 5];
    reader.read_exact(&mut version)?;
    if &version != SAVE_VERSION {
        return Err(Error::CorruptData("open chapter version mismatch"));
    }

    let count = reader.read_u32::<LittleEndian>()?;

    for _ in 0..count {
        let mut name_bytes = [0u8; RECORD_NAME_SIZE];
        reader.read_exact(&mut name_bytes)?;
        let name = RecordName(name_bytes);

        let meta_len = reader.read_u32::<LittleEndian>()? as usize;
        let mut metadata = vec![0u8; meta_len];
        reader.read_exact(&mut metadata)?;

        let zone = zone_of(&name) as usize;
        if zone >= chapters.len() {
            return Err(Error::CorruptData("open chapter record names an unknown zone"));
        }

        let chapter = &mut chapters[zone];
        if chapter.capacity - chapter.size <= 1 {
            continue;
        }
        chapter.put(&name, &metadata);
    }

    Ok(())
}
