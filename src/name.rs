// Copyright (c) 2024-present, dedup-index contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Record names: 160-bit content fingerprints.

use byteorder::{ByteOrder, LittleEndian};

pub const RECORD_NAME_SIZE: usize = 20;

/// A 160-bit opaque content fingerprint.
///
/// Certain byte ranges of the name serve distinct roles: address bits
/// (within a delta list), delta-list number, and sample bits (hook test).
/// `RecordName` itself is opaque; extraction lives in `extract_*`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordName(pub [u8; RECORD_NAME_SIZE]);

impl RecordName {
    #[must_use]
    pub fn from_bytes(bytes: [u8; RECORD_NAME_SIZE]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; RECORD_NAME_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for RecordName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..")
    }
}

/// The first 8 bytes of the name, used as the source for both the address
/// bits and the delta-list number.
fn extract_volume_index_bytes(name: &RecordName) -> u64 {
    LittleEndian::read_u64(&name.0[0..8])
}

/// `address = B & address_mask`, where `address_mask = (1 << address_bits) - 1`.
#[must_use]
pub fn extract_address(name: &RecordName, address_bits: u8) -> u32 {
    debug_assert!(address_bits <= 31);
    let mask = (1u64 << address_bits) - 1;
    (extract_volume_index_bytes(name) & mask) as u32
}

/// `list_number = (B >> address_bits) mod num_delta_lists`.
#[must_use]
pub fn extract_list_number(name: &RecordName, address_bits: u8, num_delta_lists: u32) -> u32 {
    let shifted = extract_volume_index_bytes(name) >> address_bits;
    (shifted % u64::from(num_delta_lists)) as u32
}

/// The sampling bytes used by the hook/sample test. Distinct byte range
/// from the volume-index bytes so sampling is independent of address/list
/// placement.
fn extract_sampling_bytes(name: &RecordName) -> u64 {
    LittleEndian::read_u64(&name.0[8..16])
}

/// A name is a "hook"/sample iff `extract_sampling % sparse_sample_rate == 0`.
/// `sparse_sample_rate == 0` disables sampling entirely (no name is ever a
/// sample, matching "only present when `sparse_sample_rate > 0`").
#[must_use]
pub fn is_sample(name: &RecordName, sparse_sample_rate: u32) -> bool {
    if sparse_sample_rate == 0 {
        return false;
    }
    extract_sampling_bytes(name) % u64::from(sparse_sample_rate) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_from_u64(lo: u64, hi: u64) -> RecordName {
        let mut bytes = [0u8; RECORD_NAME_SIZE];
        LittleEndian::write_u64(&mut bytes[0..8], lo);
        LittleEndian::write_u64(&mut bytes[8..16], hi);
        RecordName(bytes)
    }

    #[test]
    fn address_and_list_split_bits() {
        let name = name_from_u64(0b1011_0000_1111, 0);
        let address_bits = 8;
        assert_eq!(extract_address(&name, address_bits), 0b0000_1111);
        assert_eq!(extract_list_number(&name, address_bits, 16), 0b1011 % 16);
    }

    #[test]
    fn sampling_disabled_when_rate_zero() {
        let name = name_from_u64(0, 0);
        assert!(!is_sample(&name, 0));
    }

    #[test]
    fn sampling_follows_modulo() {
        let name = name_from_u64(0, 8);
        assert!(is_sample(&name, 4));
        assert!(is_sample(&name, 8));
        assert!(!is_sample(&name, 3));
    }
}
