// Copyright (c) 2024-present, dedup-index contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Single background writer serving all zones: collates per-zone open
//! chapters into record pages plus a closed-chapter delta index, then
//! writes both to the volume.
//!
//! Grounded on `flush.rs::flush_to_segment`'s "collate a memtable into a
//! segment + index, then register it" shape, generalized here to collate
//! *per-zone* open chapters instead of a single memtable.

use crate::buffered_io::BufferedWriter;
use crate::delta_index::DeltaIndex;
use crate::error::Result;
use crate::geometry::Geometry;
use crate::name::RecordName;
use crate::open_chapter::OpenChapter;
use std::sync::{Condvar, Mutex};

/// A single zone's deposited writing chapter, handed off by `IndexZone`.
pub struct WritingChapter {
    pub virtual_chapter: u64,
    pub records: Vec<(RecordName, Vec<u8>)>,
}

struct Inner {
    zones_to_write: u32,
    chapters: Vec<Option<WritingChapter>>,
    stop: bool,
    /// Set once a collation round completes; cleared when the next round
    /// starts.
    last_result: Option<Result<u64>>,
}

/// One closed chapter, ready to be written to the volume: records then
/// index pages.
pub struct ClosedChapter {
    pub virtual_chapter: u64,
    pub records: Vec<(RecordName, Vec<u8>)>,
    pub index: DeltaIndex,
}

/// The background chapter writer.
///
/// A single writer serves every zone; zones deposit their writing
/// chapter and block (via `wait_for_idle`) until the writer has drained
/// all of them.
pub struct ChapterWriter {
    geometry: Geometry,
    state: Mutex<Inner>,
    condvar: Condvar,
}

impl ChapterWriter {
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        let zone_count = geometry.zone_count as usize;
        Self {
            geometry,
            state: Mutex::new(Inner {
                zones_to_write: 0,
                chapters: (0..zone_count).map(|_| None).collect(),
                stop: false,
                last_result: None,
            }),
            condvar: Condvar::new(),
        }
    }

    /// A zone deposits its writing chapter for collation.
    pub fn deposit(&self, zone: u32, chapter: WritingChapter) {
        let mut inner = self.state.lock().expect("chapter writer lock poisoned");
        inner.chapters[zone as usize] = Some(chapter);
        inner.zones_to_write += 1;
        self.condvar.notify_all();
    }

    /// Blocks until every zone's writing chapter has been deposited and
    /// drained.
    fn wait_for_all_zones<'a>(&self, mut guard: std::sync::MutexGuard<'a, Inner>) -> std::sync::MutexGuard<'a, Inner> {
        let zone_count = self.geometry.zone_count;
        while guard.zones_to_write < zone_count && !guard.stop {
            guard = self.condvar.wait(guard).expect("chapter writer condvar poisoned");
        }
        guard
    }

    /// Runs one collation + write round once every zone has deposited.
    /// Returns `None` if asked to stop with nothing pending.
    pub fn run_once(&self, writer: &mut BufferedWriter) -> Option<Result<ClosedChapter>> {
        let guard = self.state.lock().expect("chapter writer lock poisoned");
        let mut guard = self.wait_for_all_zones(guard);

        if guard.stop && guard.zones_to_write == 0 {
            return None;
        }

        let chapters: Vec<WritingChapter> = guard
            .chapters
            .iter_mut()
            .map(|c| c.take().expect("zones_to_write reached Z; every slot is Some"))
            .collect();
        guard.zones_to_write = 0;
        drop(guard);

        let virtual_chapter = chapters[0].virtual_chapter;
        let result = self.collate_and_write(chapters, writer);

        let mut guard = self.state.lock().expect("chapter writer lock poisoned");
        guard.last_result = Some(result.as_ref().map(|_| virtual_chapter).map_err(clone_err));
        self.condvar.notify_all();

        Some(result)
    }

    /// Collates `records_per_chapter` output positions round-robin across
    /// zones, substituting a fill record for absent/deleted slots so
    /// record pages contain no holes, then writes records followed by
    /// index pages.
    fn collate_and_write(&self, chapters: Vec<WritingChapter>, writer: &mut BufferedWriter) -> Result<ClosedChapter> {
        let zone_count = chapters.len() as u32;
        let records_per_chapter = self.geometry.records_per_chapter;
        let records_per_page = self.geometry.records_per_page;
        let virtual_chapter = chapters[0].virtual_chapter;

        let mut fill_record: Option<(RecordName, Vec<u8>)> = chapters
            .iter()
            .find(|c| c.records.len() as u32 >= self.geometry.records_per_chapter_per_zone())
            .and_then(|c| c.records.last().cloned());

        let mut collated = Vec::with_capacity(records_per_chapter as usize);
        let mut index = DeltaIndex::initialize(1, 1, 4, 32, (records_per_chapter as usize) * 64)?;

        for r in 0..records_per_chapter {
            let zone = (r % zone_count) as usize;
            let local = (r / zone_count) as usize;

            let record = chapters[zone]
                .records
                .get(local)
                .cloned()
                .or_else(|| fill_record.clone())
                .ok_or(crate::error::Error::CorruptData(
                    "no fill record available to pad closed chapter",
                ))?;

            if fill_record.is_none() {
                fill_record = Some(record.clone());
            }

            let page_number = r / records_per_page;
            let key = u64::from(crate::name::extract_address(&record.0, 24));
            index.put_entry(0, key, u64::from(page_number), Some(&record.0))?;

            collated.push(record);
        }

        writer.write(&collated.iter().flat_map(|(n, _)| n.0).collect::<Vec<u8>>())?;
        let mut index_bytes = Vec::new();
        index.save_zone(0, &mut index_bytes)?;
        writer.write(&index_bytes)?;
        writer.flush()?;

        log::debug!("wrote chapter {virtual_chapter} ({} records)", collated.len());

        Ok(ClosedChapter {
            virtual_chapter,
            records: collated,
            index,
        })
    }

    /// Signals the writer to exit once any pending round drains.
    pub fn stop(&self) {
        let mut inner = self.state.lock().expect("chapter writer lock poisoned");
        inner.stop = true;
        self.condvar.notify_all();
    }
}

fn clone_err(e: &crate::error::Error) -> crate::error::Error {
    match e {
        crate::error::Error::InvalidArgument(m) => crate::error::Error::InvalidArgument(m),
        crate::error::Error::Overflow => crate::error::Error::Overflow,
        crate::error::Error::CorruptData(m) => crate::error::Error::CorruptData(m),
        crate::error::Error::OutOfMemory => crate::error::Error::OutOfMemory,
        crate::error::Error::Io(e) => crate::error::Error::Io(std::io::Error::new(e.kind(), e.to_string())),
        crate::error::Error::BadState(m) => crate::error::Error::BadState(m),
        crate::error::Error::Busy => crate::error::Error::Busy,
    }
}

/// Builds the per-zone capacity an `OpenChapter` should use, given the
/// geometry: `records_per_chapter / Z`.
#[must_use]
pub fn open_chapter_capacity(geometry: &Geometry) -> usize {
    geometry.records_per_chapter_per_zone() as usize
}

/// Turns a zone's open chapter into a `WritingChapter` snapshot for
/// handoff.
#[must_use]
pub fn snapshot_for_handoff(chapter: &OpenChapter, virtual_chapter: u64) -> WritingChapter {
    WritingChapter {
        virtual_chapter,
        records: chapter
            .live_records()
            .into_iter()
            .map(|(n, m)| (*n, m.to_vec()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffered_io::{BufferedWriter, MemoryDevice};
    use std::sync::Arc;

    fn geometry() -> Geometry {
        Geometry::new(8, 4, 4, 0, 0, 2, 64, 20, 4, 32, 1 << 16).unwrap()
    }

    fn fill_chapter(zone_records: usize, tag: u8) -> WritingChapter {
        WritingChapter {
            virtual_chapter: 0,
            records: (0..zone_records)
                .map(|i| (RecordName([tag.wrapping_add(i as u8); 20]), vec![tag]))
                .collect(),
        }
    }

    #[test]
    fn collates_and_writes_closed_chapter() {
        let geo = geometry();
        let writer = ChapterWriter::new(geo);
        writer.deposit(0, fill_chapter(4, 1));
        writer.deposit(1, fill_chapter(4, 100));

        let device: Arc<dyn crate::buffered_io::BlockDevice> = Arc::new(MemoryDevice::new(1 << 20));
        let mut bw = BufferedWriter::new(device, 0, 1 << 20);

        let result = writer.run_once(&mut bw).expect("both zones deposited");
        let closed = result.unwrap();
        assert_eq!(closed.records.len(), geo.records_per_chapter as usize);
    }

    #[test]
    fn stop_with_nothing_pending_returns_none() {
        let writer = ChapterWriter::new(geometry());
        writer.stop();
        let device: Arc<dyn crate::buffered_io::BlockDevice> = Arc::new(MemoryDevice::new(1 << 16));
        let mut bw = BufferedWriter::new(device, 0, 1 << 16);
        assert!(writer.run_once(&mut bw).is_none());
    }
}
