// Copyright (c) 2024-present, dedup-index contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Little-endian fixed-width codecs shared by every on-disk structure.
//!
//! This is the serialization boundary (see spec DESIGN NOTES: "bit-exact
//! persistence"); components that write bytes to a volume go through
//! `Encode`/`Decode` rather than rolling their own byte-fiddling, so the
//! header formats in `§6` stay in one place.

use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub trait Encode {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<()>;
}

pub trait Decode: Sized {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self>;
}

impl Encode for u32 {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(*self)?;
        Ok(())
    }
}

impl Decode for u32 {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(reader.read_u32::<LittleEndian>()?)
    }
}

impl Encode for u64 {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u64::<LittleEndian>(*self)?;
        Ok(())
    }
}

impl Decode for u64 {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(reader.read_u64::<LittleEndian>()?)
    }
}

/// Reads exactly `bytes` worth of magic and compares against `expected`.
///
/// Mirrors the buffered-I/O `verify` contract from §6: on mismatch, an
/// error is returned describing which magic failed.
pub fn verify_magic<R: Read>(reader: &mut R, expected: &[u8]) -> Result<()> {
    let mut buf = vec![0u8; expected.len()];
    reader.read_exact(&mut buf)?;
    if buf != expected {
        return Err(Error::CorruptData("magic mismatch"));
    }
    Ok(())
}
