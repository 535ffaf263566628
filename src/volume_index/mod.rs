// Copyright (c) 2024-present, dedup-index contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Two-subindex (dense + sparse/hook) routing layer over `delta_index`.

use crate::delta_index::{DeltaIndex, DeltaIndexStats};
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::name::{extract_address, extract_list_number, is_sample, RecordName};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::sync::Mutex;

const NON_HOOK_MAGIC: &[u8; 8] = b"MI5-0005";
const HOOK_MAGIC: &[u8; 8] = b"MI5-0005";
const OUTER_MAGIC: &[u8; 8] = b"MI6-0001";

#[derive(Clone, Copy, Debug, Default)]
struct ZoneWatermark {
    virtual_chapter_low: u64,
    virtual_chapter_high: u64,
}

/// The result of resolving a name against the volume index.
#[derive(Clone, Debug)]
pub struct VolumeIndexRecord {
    pub name: RecordName,
    pub is_found: bool,
    pub is_collision: bool,
    pub virtual_chapter: u64,
    pub in_sparse: bool,
    list_number: u32,
}

/// Splits `total_lists` between the hook and non-hook subindexes — the
/// hook gets `records_per_chapter / sample_rate` records, the non-hook
/// subindex gets the remainder — keeping both halves `>= zone_count`.
fn split_lists(total_lists: u32, zone_count: u32, sample_rate: u32) -> (u32, u32) {
    if sample_rate == 0 {
        return (total_lists, 0);
    }

    let hook = (total_lists / sample_rate).max(zone_count);
    let hook = hook.min(total_lists.saturating_sub(zone_count));
    let non_hook = total_lists - hook;
    (non_hook, hook)
}

pub struct VolumeIndex {
    geometry: Geometry,
    non_hook: Mutex<DeltaIndex>,
    /// `Some` iff the geometry calls for a sparse/hook subindex.
    hook: Option<Mutex<DeltaIndex>>,
    /// Per-zone guard for the hook subindex; the hook `DeltaIndex` is
    /// already behind one crate-wide `Mutex` in this implementation, so
    /// these are held for fidelity with the documented locking contract
    /// (lookup_name vs. a zone's own writes) rather than for additional
    /// safety (see DESIGN.md).
    hook_zone_mutex: Vec<Mutex<()>>,
    zones: Mutex<Vec<ZoneWatermark>>,
    flush_chapter_non_hook: Mutex<Vec<u64>>,
    flush_chapter_hook: Mutex<Vec<u64>>,
    volume_nonce: u64,
}

impl VolumeIndex {
    /// Builds a fresh volume index per `geometry`, with every zone's
    /// watermarks at `[0, 0)`.
    pub fn new(geometry: Geometry, volume_nonce: u64) -> Result<Self> {
        let (non_hook_lists, hook_lists) = split_lists(
            geometry.num_delta_lists,
            geometry.zone_count,
            geometry.sparse_sample_rate,
        );

        let mean_delta = 1u32 << geometry.mean_delta_incr_keys.min(20);

        let non_hook = DeltaIndex::initialize(
            geometry.zone_count,
            non_hook_lists,
            mean_delta,
            geometry.chapter_bits,
            geometry.volume_index_memory_size * (non_hook_lists as usize).max(1)
                / (geometry.num_delta_lists as usize).max(1),
        )?;

        let hook = if geometry.is_sparse() {
            Some(Mutex::new(DeltaIndex::initialize(
                geometry.zone_count,
                hook_lists,
                mean_delta,
                geometry.chapter_bits,
                geometry.volume_index_memory_size * (hook_lists as usize)
                    / (geometry.num_delta_lists as usize).max(1),
            )?))
        } else {
            None
        };

        Ok(Self {
            geometry,
            non_hook: Mutex::new(non_hook),
            hook,
            hook_zone_mutex: (0..geometry.zone_count).map(|_| Mutex::new(())).collect(),
            zones: Mutex::new(vec![ZoneWatermark::default(); geometry.zone_count as usize]),
            flush_chapter_non_hook: Mutex::new(vec![0u64; non_hook_lists as usize]),
            flush_chapter_hook: Mutex::new(vec![0u64; hook_lists as usize]),
            volume_nonce,
        })
    }

    fn is_hook_name(&self, name: &RecordName) -> bool {
        self.geometry.is_sparse() && is_sample(name, self.geometry.sparse_sample_rate)
    }

    /// Removes entries whose index-chapter, lifted to virtual, falls in
    /// `[flush_chapter, virtual_chapter_low)`.
    fn flush_list_if_stale(
        index: &mut DeltaIndex,
        geometry: &Geometry,
        flush_chapters: &mut [u64],
        list: u32,
        virtual_chapter_low: u64,
    ) -> Result<()> {
        let flush_chapter = flush_chapters[list as usize];
        if flush_chapter >= virtual_chapter_low {
            return Ok(());
        }

        let entries = index.list_entries(list)?;
        let mut survivors = Vec::with_capacity(entries.len());
        let mut new_flush = flush_chapter;

        for entry in entries {
            let virtual_chapter = geometry.lift_to_virtual(entry.value, virtual_chapter_low);
            if virtual_chapter < virtual_chapter_low {
                new_flush = new_flush.max(virtual_chapter + 1);
                continue;
            }
            survivors.push(entry);
        }

        index.replace_list_entries(list, &survivors)?;
        flush_chapters[list as usize] = new_flush.max(flush_chapter);
        Ok(())
    }

    /// Resolves `name`, applying the lazy LRU flush to its list first.
    pub fn get_record(&self, name: &RecordName) -> Result<VolumeIndexRecord> {
        let hook_hit = self.is_hook_name(name);

        if hook_hit {
            if let Some(hook) = &self.hook {
                let mut hook = hook.lock().expect("hook index lock poisoned");
                let list = extract_list_number(name, self.geometry.address_bits, hook.list_count());
                let zone = hook.zone_of(list)?;
                let _guard = self.hook_zone_mutex[zone as usize]
                    .lock()
                    .expect("hook zone mutex poisoned");

                let low = self.zones.lock().expect("zone watermarks poisoned")[zone as usize]
                    .virtual_chapter_low;
                let mut flush = self.flush_chapter_hook.lock().expect("flush chapters poisoned");
                Self::flush_list_if_stale(&mut hook, &self.geometry, &mut flush, list, low)?;
                drop(flush);

                let address = extract_address(name, self.geometry.address_bits);
                let entry = hook.get_entry(list, u64::from(address), Some(name))?;
                return Ok(Self::record_from_entry(name, &entry, &self.geometry, low, true));
            }
        }

        let mut non_hook = self.non_hook.lock().expect("non-hook index lock poisoned");
        let list = extract_list_number(name, self.geometry.address_bits, non_hook.list_count());
        let zone = non_hook.zone_of(list)?;
        let low = self.zones.lock().expect("zone watermarks poisoned")[zone as usize]
            .virtual_chapter_low;

        let mut flush = self
            .flush_chapter_non_hook
            .lock()
            .expect("flush chapters poisoned");
        Self::flush_list_if_stale(&mut non_hook, &self.geometry, &mut flush, list, low)?;
        drop(flush);

        let address = extract_address(name, self.geometry.address_bits);
        let entry = non_hook.get_entry(list, u64::from(address), Some(name))?;
        Ok(Self::record_from_entry(name, &entry, &self.geometry, low, false))
    }

    fn record_from_entry(
        name: &RecordName,
        entry: &crate::delta_index::DeltaIndexEntry,
        geometry: &Geometry,
        virtual_chapter_low: u64,
        in_sparse: bool,
    ) -> VolumeIndexRecord {
        VolumeIndexRecord {
            name: *name,
            is_found: entry.found,
            is_collision: entry.is_collision,
            virtual_chapter: if entry.found {
                geometry.lift_to_virtual(entry.value, virtual_chapter_low)
            } else {
                0
            },
            in_sparse,
            list_number: entry.list,
        }
    }

    /// Inserts `name -> virtual_chapter`.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` if `virtual_chapter` falls outside the
    /// owning zone's `[low, high]` watermark window. Delta-list overflow
    /// is logged (rate-limited) and reported as success-with-drop.
    pub fn put_record(&self, record: &VolumeIndexRecord, virtual_chapter: u64) -> Result<()> {
        let hook_hit = self.is_hook_name(&record.name);
        let index_chapter = self.geometry.index_chapter(virtual_chapter);
        let address = extract_address(&record.name, self.geometry.address_bits);

        if hook_hit {
            if let Some(hook) = &self.hook {
                let mut hook = hook.lock().expect("hook index lock poisoned");
                let list = extract_list_number(&record.name, self.geometry.address_bits, hook.list_count());
                let zone = hook.zone_of(list)?;
                let _guard = self.hook_zone_mutex[zone as usize]
                    .lock()
                    .expect("hook zone mutex poisoned");

                Self::check_watermarks(&self.zones, zone, virtual_chapter)?;
                return Self::insert(&mut hook, list, address, index_chapter, &record.name);
            }
            return Ok(());
        }

        let mut non_hook = self.non_hook.lock().expect("non-hook index lock poisoned");
        let list = extract_list_number(&record.name, self.geometry.address_bits, non_hook.list_count());
        let zone = non_hook.zone_of(list)?;
        Self::check_watermarks(&self.zones, zone, virtual_chapter)?;
        Self::insert(&mut non_hook, list, address, index_chapter, &record.name)
    }

    fn check_watermarks(zones: &Mutex<Vec<ZoneWatermark>>, zone: u32, virtual_chapter: u64) -> Result<()> {
        let zones = zones.lock().expect("zone watermarks poisoned");
        let w = &zones[zone as usize];
        if virtual_chapter < w.virtual_chapter_low || virtual_chapter > w.virtual_chapter_high {
            return Err(Error::InvalidArgument(
                "virtual_chapter outside zone's watermark window",
            ));
        }
        Ok(())
    }

    fn insert(
        index: &mut DeltaIndex,
        list: u32,
        address: u32,
        index_chapter: u64,
        name: &RecordName,
    ) -> Result<()> {
        let entries = index.list_entries(list)?;
        let has_primary = entries
            .iter()
            .any(|e| e.key == u64::from(address) && e.name.is_none());

        let insert_name = if has_primary { Some(name) } else { None };

        match index.put_entry(list, u64::from(address), index_chapter, insert_name) {
            Ok(()) => Ok(()),
            Err(Error::Overflow) => {
                log::warn!("volume index list {list} overflowed; entry dropped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Rewrites the chapter number of an existing record.
    pub fn set_record_chapter(&self, record: &VolumeIndexRecord, virtual_chapter: u64) -> Result<bool> {
        let index_chapter = self.geometry.index_chapter(virtual_chapter);
        let address = extract_address(&record.name, self.geometry.address_bits);

        if record.in_sparse {
            if let Some(hook) = &self.hook {
                let mut hook = hook.lock().expect("hook index lock poisoned");
                return hook.set_entry_value(
                    record.list_number,
                    u64::from(address),
                    Some(&record.name),
                    index_chapter,
                );
            }
            return Ok(false);
        }

        let mut non_hook = self.non_hook.lock().expect("non-hook index lock poisoned");
        non_hook.set_entry_value(record.list_number, u64::from(address), Some(&record.name), index_chapter)
    }

    /// Removes `record` from whichever subindex it was resolved against.
    pub fn remove_record(&self, record: &VolumeIndexRecord) -> Result<bool> {
        let address = extract_address(&record.name, self.geometry.address_bits);

        if record.in_sparse {
            if let Some(hook) = &self.hook {
                let mut hook = hook.lock().expect("hook index lock poisoned");
                return hook.remove_entry(record.list_number, u64::from(address), Some(&record.name));
            }
            return Ok(false);
        }

        let mut non_hook = self.non_hook.lock().expect("non-hook index lock poisoned");
        non_hook.remove_entry(record.list_number, u64::from(address), Some(&record.name))
    }

    /// Updates zone `zone`'s watermark window to admit up to
    /// `virtual_chapter`.
    pub fn set_zone_open_chapter(&self, zone: u32, virtual_chapter: u64) -> Result<()> {
        let mut zones = self.zones.lock().expect("zone watermarks poisoned");
        let w = zones
            .get_mut(zone as usize)
            .ok_or(Error::InvalidArgument("zone number out of range"))?;
        w.virtual_chapter_high = virtual_chapter;
        if w.virtual_chapter_low == 0 && virtual_chapter > self.geometry.chapters_per_volume {
            w.virtual_chapter_low = virtual_chapter - self.geometry.chapters_per_volume;
        }
        Ok(())
    }

    /// Raises a zone's `virtual_chapter_low`, expiring chapters early if
    /// the zone's used bits exceed `max_zone_bits`.
    pub fn maybe_early_flush(&self, zone: u32, used_bits: u64, max_zone_bits: u64, chapter_zone_bits: u64) -> u64 {
        if used_bits <= max_zone_bits || chapter_zone_bits == 0 {
            return 0;
        }

        let over = used_bits - max_zone_bits;
        let to_expire = 1 + over / chapter_zone_bits;

        let mut zones = self.zones.lock().expect("zone watermarks poisoned");
        let w = &mut zones[zone as usize];
        let clamped = (w.virtual_chapter_low + to_expire).min(w.virtual_chapter_high);
        let actually_expired = clamped - w.virtual_chapter_low;
        w.virtual_chapter_low = clamped;

        if actually_expired > 0 {
            log::warn!("zone {zone} early-flushed {actually_expired} chapters");
        }
        actually_expired
    }

    /// Computes which zone owns `name`'s open chapter, via the non-hook
    /// subindex's list partitioning. Used for
    /// request routing regardless of whether `name` is itself a sample.
    pub fn zone_for(&self, name: &RecordName) -> Result<u32> {
        let non_hook = self.non_hook.lock().expect("non-hook index lock poisoned");
        let list = extract_list_number(name, self.geometry.address_bits, non_hook.list_count());
        non_hook.zone_of(list)
    }

    /// Read-only lookup against the hook subindex only, for sparse-cache
    /// coherency. Returns `None` if `name` is not a sample or there is no
    /// hook subindex.
    pub fn lookup_name(&self, name: &RecordName) -> Option<u64> {
        let hook = self.hook.as_ref()?;
        if !self.is_hook_name(name) {
            return None;
        }

        let hook = hook.lock().expect("hook index lock poisoned");
        let list = extract_list_number(name, self.geometry.address_bits, hook.list_count());
        let address = extract_address(name, self.geometry.address_bits);
        let entry = hook.get_entry(list, u64::from(address), Some(name)).ok()?;
        if !entry.found {
            return None;
        }

        let zone = hook.zone_of(list).ok()?;
        let low = self.zones.lock().expect("zone watermarks poisoned")[zone as usize].virtual_chapter_low;
        Some(self.geometry.lift_to_virtual(entry.value, low))
    }

    #[must_use]
    pub fn stats(&self) -> DeltaIndexStats {
        let non_hook = self.non_hook.lock().expect("non-hook index lock poisoned").stats();
        match &self.hook {
            Some(hook) => non_hook.combine(hook.lock().expect("hook index lock poisoned").stats()),
            None => non_hook,
        }
    }

    /// Saves zone `zone`'s slice of both subindexes.
    pub fn save_zone<W: Write>(&self, zone: u32, writer: &mut W) -> Result<()> {
        if self.geometry.is_sparse() {
            writer.write_all(OUTER_MAGIC)?;
            writer.write_u32::<LittleEndian>(self.geometry.sparse_sample_rate)?;
        }

        let zones = self.zones.lock().expect("zone watermarks poisoned");
        let w = zones[zone as usize];
        drop(zones);

        {
            let non_hook = self.non_hook.lock().expect("non-hook index lock poisoned");
            let (first_list, num_lists) = non_hook.zone_range(zone)?;
            Self::write_subindex_header(writer, NON_HOOK_MAGIC, self.volume_nonce, w, first_list, num_lists)?;

            let flush = self.flush_chapter_non_hook.lock().expect("flush chapters poisoned");
            Self::write_flush_chapters(writer, &flush, first_list, num_lists)?;
            non_hook.save_zone(zone, writer)?;
        }

        if let Some(hook) = &self.hook {
            let hook = hook.lock().expect("hook index lock poisoned");
            let (first_list, num_lists) = hook.zone_range(zone)?;
            Self::write_subindex_header(writer, HOOK_MAGIC, self.volume_nonce, w, first_list, num_lists)?;

            let flush = self.flush_chapter_hook.lock().expect("flush chapters poisoned");
            Self::write_flush_chapters(writer, &flush, first_list, num_lists)?;
            hook.save_zone(zone, writer)?;
        }

        Ok(())
    }

    fn write_subindex_header<W: Write>(
        writer: &mut W,
        magic: &[u8; 8],
        nonce: u64,
        watermark: ZoneWatermark,
        first_list: u32,
        num_lists: u32,
    ) -> Result<()> {
        writer.write_all(magic)?;
        writer.write_u64::<LittleEndian>(nonce)?;
        writer.write_u64::<LittleEndian>(watermark.virtual_chapter_low)?;
        writer.write_u64::<LittleEndian>(watermark.virtual_chapter_high)?;
        writer.write_u32::<LittleEndian>(first_list)?;
        writer.write_u32::<LittleEndian>(num_lists)?;
        Ok(())
    }

    fn write_flush_chapters<W: Write>(writer: &mut W, flush: &[u64], first_list: u32, num_lists: u32) -> Result<()> {
        for i in 0..num_lists {
            writer.write_u64::<LittleEndian>(flush[(first_list + i) as usize])?;
        }
        Ok(())
    }

    /// Restores zone `zone`'s slice of both subindexes, verifying magics,
    /// nonce and (for the hook subindex) the sparse sample rate.
    pub fn restore_zone<R: Read>(&mut self, zone: u32, reader: &mut R) -> Result<()> {
        if self.geometry.is_sparse() {
            let mut magic = [0u8; 8];
            reader.read_exact(&mut magic)?;
            if &magic != OUTER_MAGIC {
                return Err(Error::CorruptData("outer magic mismatch"));
            }
            let sample_rate = reader.read_u32::<LittleEndian>()?;
            if sample_rate != self.geometry.sparse_sample_rate {
                return Err(Error::CorruptData("sparse sample rate mismatch"));
            }
        }

        {
            let mut non_hook = self.non_hook.lock().expect("non-hook index lock poisoned");
            let (first_list, num_lists) = non_hook.zone_range(zone)?;
            let w = Self::read_subindex_header(reader, NON_HOOK_MAGIC, self.volume_nonce, first_list, num_lists)?;

            let mut flush = self.flush_chapter_non_hook.lock().expect("flush chapters poisoned");
            Self::read_flush_chapters(reader, &mut flush, first_list, num_lists)?;
            drop(flush);

            non_hook.restore_zone(zone, reader)?;
            self.set_watermark(zone, w);
        }

        if self.hook.is_some() {
            let mut hook = self.hook.as_ref().unwrap().lock().expect("hook index lock poisoned");
            let (first_list, num_lists) = hook.zone_range(zone)?;
            let w = Self::read_subindex_header(reader, HOOK_MAGIC, self.volume_nonce, first_list, num_lists)?;

            let mut flush = self.flush_chapter_hook.lock().expect("flush chapters poisoned");
            Self::read_flush_chapters(reader, &mut flush, first_list, num_lists)?;
            drop(flush);

            hook.restore_zone(zone, reader)?;
            self.set_watermark(zone, w);
        }

        Ok(())
    }

    fn set_watermark(&self, zone: u32, w: ZoneWatermark) {
        let mut zones = self.zones.lock().expect("zone watermarks poisoned");
        zones[zone as usize] = w;
    }

    fn read_subindex_header<R: Read>(
        reader: &mut R,
        expected_magic: &[u8; 8],
        expected_nonce: u64,
        expected_first_list: u32,
        expected_num_lists: u32,
    ) -> Result<ZoneWatermark> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != expected_magic {
            return Err(Error::CorruptData("sub-index magic mismatch"));
        }

        let nonce = reader.read_u64::<LittleEndian>()?;
        if nonce != expected_nonce {
            return Err(Error::CorruptData("volume nonce mismatch"));
        }

        let virtual_chapter_low = reader.read_u64::<LittleEndian>()?;
        let virtual_chapter_high = reader.read_u64::<LittleEndian>()?;
        let first_list = reader.read_u32::<LittleEndian>()?;
        let num_lists = reader.read_u32::<LittleEndian>()?;

        if first_list != expected_first_list || num_lists != expected_num_lists {
            return Err(Error::CorruptData("zone list range mismatch on restore"));
        }

        Ok(ZoneWatermark {
            virtual_chapter_low,
            virtual_chapter_high,
        })
    }

    fn read_flush_chapters<R: Read>(reader: &mut R, flush: &mut [u64], first_list: u32, num_lists: u32) -> Result<()> {
        for i in 0..num_lists {
            flush[(first_list + i) as usize] = reader.read_u64::<LittleEndian>()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense_geometry() -> Geometry {
        Geometry::new(64, 16, 8, 0, 0, 2, 64, 20, 4, 32, 1 << 18).unwrap()
    }

    fn sparse_geometry() -> Geometry {
        Geometry::new(64, 16, 8, 2, 4, 2, 64, 20, 4, 32, 1 << 18).unwrap()
    }

    fn name(seed: u64) -> RecordName {
        let mut bytes = [0u8; crate::name::RECORD_NAME_SIZE];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x9E37_79B9).to_le_bytes());
        RecordName(bytes)
    }

    #[test]
    fn put_then_get_round_trips() {
        let vi = VolumeIndex::new(dense_geometry(), 42).unwrap();
        for zone in 0..2 {
            vi.set_zone_open_chapter(zone, 10).unwrap();
        }

        let n = name(7);
        let rec = vi.get_record(&n).unwrap();
        assert!(!rec.is_found);

        vi.put_record(&rec, 3).unwrap();
        let found = vi.get_record(&n).unwrap();
        assert!(found.is_found);
        assert_eq!(found.virtual_chapter, 3);
    }

    #[test]
    fn put_rejects_chapter_outside_watermarks() {
        let vi = VolumeIndex::new(dense_geometry(), 1).unwrap();
        let n = name(1);
        let rec = vi.get_record(&n).unwrap();
        let err = vi.put_record(&rec, 999).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn sample_isolation_lookup_name() {
        let vi = VolumeIndex::new(sparse_geometry(), 1).unwrap();
        for zone in 0..2 {
            vi.set_zone_open_chapter(zone, 20).unwrap();
        }

        let mut sample = None;
        let mut non_sample = None;
        for seed in 0..64u64 {
            let n = name(seed);
            if is_sample(&n, 4) {
                sample = Some(n);
            } else {
                non_sample = Some(n);
            }
            if sample.is_some() && non_sample.is_some() {
                break;
            }
        }
        let sample = sample.expect("fixture should contain a sample name");
        let non_sample = non_sample.expect("fixture should contain a non-sample name");

        let rec = vi.get_record(&sample).unwrap();
        vi.put_record(&rec, 5).unwrap();
        assert_eq!(vi.lookup_name(&sample), Some(5));
        assert_eq!(vi.lookup_name(&non_sample), None);
    }

    #[test]
    fn remove_then_get_misses() {
        let vi = VolumeIndex::new(dense_geometry(), 1).unwrap();
        vi.set_zone_open_chapter(0, 10).unwrap();
        vi.set_zone_open_chapter(1, 10).unwrap();

        let n = name(3);
        let rec = vi.get_record(&n).unwrap();
        vi.put_record(&rec, 2).unwrap();
        let found = vi.get_record(&n).unwrap();
        assert!(vi.remove_record(&found).unwrap());
        assert!(!vi.get_record(&n).unwrap().is_found);
    }

    #[test]
    fn save_restore_round_trip() {
        let vi = VolumeIndex::new(dense_geometry(), 99).unwrap();
        for zone in 0..2 {
            vi.set_zone_open_chapter(zone, 10).unwrap();
        }

        let mut names = Vec::new();
        for seed in 0..30u64 {
            let n = name(seed);
            let rec = vi.get_record(&n).unwrap();
            vi.put_record(&rec, seed % 5).unwrap();
            names.push(n);
        }

        let mut buf0 = Vec::new();
        vi.save_zone(0, &mut buf0).unwrap();
        let mut buf1 = Vec::new();
        vi.save_zone(1, &mut buf1).unwrap();

        let mut restored = VolumeIndex::new(dense_geometry(), 99).unwrap();
        restored.restore_zone(0, &mut &buf0[..]).unwrap();
        restored.restore_zone(1, &mut &buf1[..]).unwrap();

        for n in names {
            let original = vi.get_record(&n).unwrap();
            let loaded = restored.get_record(&n).unwrap();
            assert_eq!(original.is_found, loaded.is_found);
            assert_eq!(original.virtual_chapter, loaded.virtual_chapter);
        }
    }

    #[test]
    fn restore_detects_nonce_mismatch() {
        let vi = VolumeIndex::new(dense_geometry(), 1).unwrap();
        let mut buf = Vec::new();
        vi.save_zone(0, &mut buf).unwrap();

        let mut restored = VolumeIndex::new(dense_geometry(), 2).unwrap();
        let err = restored.restore_zone(0, &mut &buf[..]).unwrap_err();
        assert!(matches!(err, Error::CorruptData(_)));
    }
}
