// Copyright (c) 2024-present, dedup-index contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A single packed, sorted, delta-compressed delta list.

use crate::bits::{get_bit_bytes, get_bits, set_bit_bytes, set_bits, DeltaCode};
use crate::error::{Error, Result};
use crate::name::{RecordName, RECORD_NAME_SIZE};

/// One decoded entry of a delta list.
///
/// `name` is `Some` only for collision entries, which share a key with a
/// preceding non-collision entry and carry a full-name tag; the primary
/// entry at an address carries no name at all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListEntry {
    pub key: u64,
    pub value: u64,
    pub name: Option<RecordName>,
}

impl ListEntry {
    #[must_use]
    pub fn is_collision(&self) -> bool {
        self.name.is_some()
    }
}

/// A packed delta list: entries stored back-to-back as bit-level
/// `(delta, is_collision, value[, name])` tuples, self-terminating at
/// `bit_count` (no separate entry count is persisted; decoding stops when
/// the cursor reaches the end of the packed region).
///
/// Mutation goes through decode -> modify the decoded `Vec<ListEntry>` ->
/// re-encode; lists are small enough in practice (bounded by
/// `records_per_chapter`) that this is simpler and no less correct than
/// splicing bits in place, and it's where `move_bits`/`get_bits`/`set_bits`
/// actually get exercised.
#[derive(Clone, Default)]
pub struct DeltaList {
    data: Vec<u8>,
    bit_count: u64,
    /// Soft capacity in bits; exceeding it on encode is reported as
    /// overflow rather than growing unboundedly.
    pub allocated_bits: u64,
}

impl DeltaList {
    #[must_use]
    pub fn with_allocated_bits(allocated_bits: u64) -> Self {
        Self {
            data: Vec::new(),
            bit_count: 0,
            allocated_bits,
        }
    }

    #[must_use]
    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    /// Decodes the whole list into an ascending `Vec<ListEntry>`.
    pub fn decode(&self, code: &DeltaCode, value_bits: u8) -> Vec<ListEntry> {
        let mut entries = Vec::new();
        let mut offset = 0u64;
        let mut key = 0u64;

        while offset < self.bit_count {
            let (delta, after_delta) = code.decode_delta(&self.data, offset);
            key += delta;

            let is_collision = get_bits(&self.data, after_delta, 1) == 1;
            let after_flag = after_delta + 1;

            let value = get_bits(&self.data, after_flag, value_bits);
            let mut after_value = after_flag + u64::from(value_bits);

            let name = if is_collision {
                let bytes = get_bit_bytes(&self.data, after_value, RECORD_NAME_SIZE);
                after_value += (RECORD_NAME_SIZE * 8) as u64;
                let mut arr = [0u8; RECORD_NAME_SIZE];
                arr.copy_from_slice(&bytes);
                Some(RecordName(arr))
            } else {
                None
            };

            entries.push(ListEntry { key, value, name });
            offset = after_value;
        }

        entries
    }

    /// Computes the bit size required to encode `entries`, without writing
    /// anything.
    #[must_use]
    pub fn encoded_size(entries: &[ListEntry], code: &DeltaCode, value_bits: u8) -> u64 {
        let mut scratch = Vec::new();
        let mut offset = 0u64;
        let mut prev_key = 0u64;

        for entry in entries {
            let delta = entry.key - prev_key;
            offset = code.encode_delta(&mut scratch, offset, delta);
            offset += 1; // collision flag
            offset += u64::from(value_bits);
            if entry.name.is_some() {
                offset += (RECORD_NAME_SIZE * 8) as u64;
            }
            prev_key = entry.key;
        }

        offset
    }

    /// Re-encodes `entries` (must already be sorted ascending by key) into
    /// this list's backing buffer, replacing its current contents.
    ///
    /// # Errors
    ///
    /// Returns `Error::Overflow` if the encoded size exceeds
    /// `self.allocated_bits`; the would-be entry is dropped rather than
    /// treated as fatal. The list is left unmodified in that case.
    pub fn encode(&mut self, entries: &[ListEntry], code: &DeltaCode, value_bits: u8) -> Result<()> {
        let needed = Self::encoded_size(entries, code, value_bits);
        if needed > self.allocated_bits {
            return Err(Error::Overflow);
        }

        let mut data = Vec::new();
        let mut offset = 0u64;
        let mut prev_key = 0u64;

        for entry in entries {
            let delta = entry.key - prev_key;
            offset = code.encode_delta(&mut data, offset, delta);

            set_bits(&mut data, offset, 1, u64::from(entry.is_collision()));
            offset += 1;

            set_bits(&mut data, offset, value_bits, entry.value);
            offset += u64::from(value_bits);

            if let Some(name) = &entry.name {
                set_bit_bytes(&mut data, offset, &name.0);
                offset += (RECORD_NAME_SIZE * 8) as u64;
            }

            prev_key = entry.key;
        }

        self.data = data;
        self.bit_count = offset;

        Ok(())
    }

    /// Raw packed bytes, padded with zero bits to a byte boundary. Used by
    /// `save_zone`.
    #[must_use]
    pub(crate) fn raw_bytes(&self) -> Vec<u8> {
        let byte_count = self.bit_count.div_ceil(8) as usize;
        let mut out = self.data.clone();
        out.resize(byte_count, 0);
        out
    }

    /// The number of bits used in the final (possibly partial) byte of the
    /// packed region; `0` if the list is empty. Used by `save_zone` to let
    /// `restore_zone` recover the exact `bit_count` from a byte count.
    #[must_use]
    pub(crate) fn trailing_bits(&self) -> u8 {
        if self.bit_count == 0 {
            0
        } else {
            let rem = self.bit_count % 8;
            if rem == 0 {
                8
            } else {
                rem as u8
            }
        }
    }

    /// Reconstructs a list from raw bytes plus the exact bit count (spec
    /// §6 restore path).
    #[must_use]
    pub(crate) fn from_raw(data: Vec<u8>, bit_count: u64) -> Self {
        Self {
            allocated_bits: bit_count,
            data,
            bit_count,
        }
    }
}
