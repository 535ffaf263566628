// Copyright (c) 2024-present, dedup-index contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Page-aligned buffered I/O over a block device region.
//!
//! The surrounding volume's geometry/super-block codec, slab manager, and
//! CLI are out of scope; this module only needs a way to read and write
//! bytes at a byte offset within some backing store, so it is expressed
//! against a small `BlockDevice` trait rather than assuming a real block
//! device is mounted. Grounded on `segment/block/mod.rs`'s direct
//! `FileExt::read_at`/`read_exact` positioned-I/O pattern.

use crate::error::{Error, Result};
use std::fs::File;
use std::io;
use std::sync::Arc;

pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// A byte-addressable backing store. Implemented for `std::fs::File`
/// (via positioned reads/writes) so tests can use a real temp file, the
/// way `segment/block/mod.rs`'s I/O does.
pub trait BlockDevice: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;
    fn sync(&self) -> io::Result<()>;
}

impl BlockDevice for File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.read_exact_at(buf, offset)
        }
        #[cfg(not(unix))]
        {
            compile_error!("unsupported OS");
        }
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.write_all_at(buf, offset)
        }
        #[cfg(not(unix))]
        {
            compile_error!("unsupported OS");
        }
    }

    fn sync(&self) -> io::Result<()> {
        self.sync_all()
    }
}

/// An in-memory `BlockDevice`, used in tests and scenarios that don't need
/// a real file.
#[derive(Default)]
pub struct MemoryDevice {
    data: std::sync::Mutex<Vec<u8>>,
}

impl MemoryDevice {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            data: std::sync::Mutex::new(vec![0u8; size]),
        }
    }
}

impl BlockDevice for MemoryDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let data = self.data.lock().expect("memory device lock poisoned");
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > data.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past end"));
        }
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut data = self.data.lock().expect("memory device lock poisoned");
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Buffered, page-sized reader over a region `[region_offset, region_offset
/// + region_size)` of a `BlockDevice`. Reads are non-sticky: a failed
/// operation does not poison later reads.
pub struct BufferedReader {
    device: Arc<dyn BlockDevice>,
    region_offset: u64,
    region_size: u64,
    page_size: usize,
    pos: u64,
    buffer: Vec<u8>,
    buffer_start: u64,
}

impl BufferedReader {
    #[must_use]
    pub fn new(device: Arc<dyn BlockDevice>, region_offset: u64, region_size: u64) -> Self {
        Self::with_page_size(device, region_offset, region_size, DEFAULT_PAGE_SIZE)
    }

    #[must_use]
    pub fn with_page_size(
        device: Arc<dyn BlockDevice>,
        region_offset: u64,
        region_size: u64,
        page_size: usize,
    ) -> Self {
        Self {
            device,
            region_offset,
            region_size,
            page_size,
            pos: 0,
            buffer: Vec::new(),
            buffer_start: 0,
        }
    }

    fn ensure_buffered(&mut self, needed_from: u64) -> Result<()> {
        let covers = self.pos >= self.buffer_start
            && needed_from < self.buffer_start + self.buffer.len() as u64;
        if covers {
            return Ok(());
        }

        let page_aligned_start = (self.pos / self.page_size as u64) * self.page_size as u64;
        let remaining = self.region_size.saturating_sub(page_aligned_start);
        let read_len = remaining.min(self.page_size as u64) as usize;

        if read_len == 0 {
            return Err(Error::InvalidArgument("read past end of region"));
        }

        let mut buf = vec![0u8; read_len];
        self.device
            .read_at(self.region_offset + page_aligned_start, &mut buf)?;

        self.buffer = buf;
        self.buffer_start = page_aligned_start;
        Ok(())
    }

    /// Reads `data.len()` bytes, advancing the cursor.
    pub fn read(&mut self, data: &mut [u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            self.ensure_buffered(self.pos)?;
            let in_buf_offset = (self.pos - self.buffer_start) as usize;
            let available = self.buffer.len() - in_buf_offset;
            let take = available.min(data.len() - written);

            data[written..written + take]
                .copy_from_slice(&self.buffer[in_buf_offset..in_buf_offset + take]);

            written += take;
            self.pos += take as u64;
        }
        Ok(())
    }

    /// Reads `bytes.len()` bytes and compares to `bytes`. On success,
    /// consumes those bytes. On mismatch, the reader's position is left
    /// exactly where it was.
    pub fn verify(&mut self, bytes: &[u8]) -> Result<bool> {
        let start_pos = self.pos;
        let mut scratch = vec![0u8; bytes.len()];
        self.read(&mut scratch)?;

        if scratch == bytes {
            Ok(true)
        } else {
            self.pos = start_pos;
            Ok(false)
        }
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }
}

/// Buffered, page-sized writer over a region of a `BlockDevice`.
///
/// Once an I/O error occurs, the writer is sticky: the same error is
/// returned on every subsequent call.
pub struct BufferedWriter {
    device: Arc<dyn BlockDevice>,
    region_offset: u64,
    region_size: u64,
    page_size: usize,
    buffer: Vec<u8>,
    flushed_len: u64,
    sticky_error: Option<String>,
}

impl BufferedWriter {
    #[must_use]
    pub fn new(device: Arc<dyn BlockDevice>, region_offset: u64, region_size: u64) -> Self {
        Self::with_page_size(device, region_offset, region_size, DEFAULT_PAGE_SIZE)
    }

    #[must_use]
    pub fn with_page_size(
        device: Arc<dyn BlockDevice>,
        region_offset: u64,
        region_size: u64,
        page_size: usize,
    ) -> Self {
        Self {
            device,
            region_offset,
            region_size,
            page_size,
            buffer: Vec::new(),
            flushed_len: 0,
            sticky_error: None,
        }
    }

    fn check_sticky(&self) -> Result<()> {
        if let Some(msg) = &self.sticky_error {
            return Err(Error::Io(io::Error::new(io::ErrorKind::Other, msg.clone())));
        }
        Ok(())
    }

    fn record_error(&mut self, e: Error) -> Error {
        if let Error::Io(ref io_err) = e {
            self.sticky_error = Some(io_err.to_string());
        }
        e
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.check_sticky()?;
        self.buffer.extend_from_slice(data);

        // Flush whole pages eagerly so the buffer doesn't grow unbounded.
        while self.buffer.len() >= self.page_size {
            let page: Vec<u8> = self.buffer.drain(..self.page_size).collect();
            if let Err(e) = self.write_raw(&page) {
                return Err(self.record_error(e));
            }
        }

        Ok(())
    }

    pub fn write_zeros(&mut self, len: usize) -> Result<()> {
        let zeros = vec![0u8; len];
        self.write(&zeros)
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let write_offset = self.region_offset + self.flushed_len;
        if self.flushed_len + data.len() as u64 > self.region_size {
            return Err(Error::InvalidArgument("write past end of region"));
        }
        self.device.write_at(write_offset, data)?;
        self.flushed_len += data.len() as u64;
        Ok(())
    }

    /// Flushes any buffered partial page and fsyncs the underlying device.
    pub fn flush(&mut self) -> Result<()> {
        self.check_sticky()?;

        if !self.buffer.is_empty() {
            let pending = std::mem::take(&mut self.buffer);
            if let Err(e) = self.write_raw(&pending) {
                return Err(self.record_error(e));
            }
        }

        if let Err(e) = self.device.sync().map_err(Error::from) {
            return Err(self.record_error(e));
        }

        Ok(())
    }

    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.flushed_len + self.buffer.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() -> Result<()> {
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new(1 << 16));

        let mut writer = BufferedWriter::new(device.clone(), 0, 1 << 16);
        writer.write(b"hello")?;
        writer.write(b" world")?;
        writer.flush()?;

        let mut reader = BufferedReader::new(device, 0, 1 << 16);
        let mut buf = vec![0u8; 11];
        reader.read(&mut buf)?;
        assert_eq!(&buf, b"hello world");

        Ok(())
    }

    #[test]
    fn verify_leaves_position_on_mismatch() -> Result<()> {
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new(1 << 16));
        {
            let mut writer = BufferedWriter::new(device.clone(), 0, 1 << 16);
            writer.write(b"ABCDEFGH")?;
            writer.flush()?;
        }

        let mut reader = BufferedReader::new(device, 0, 1 << 16);
        assert!(!reader.verify(b"WRONGMAG")?);
        assert_eq!(reader.position(), 0);
        assert!(reader.verify(b"ABCDEFGH")?);
        assert_eq!(reader.position(), 8);

        Ok(())
    }

    #[test]
    fn write_past_region_end_is_invalid_argument() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new(4));
        let mut writer = BufferedWriter::new(device, 0, 4);
        let err = writer.write(b"too many bytes for this region").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn spans_multiple_pages() -> Result<()> {
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new(1 << 20));
        let payload = vec![0xAB; DEFAULT_PAGE_SIZE * 3 + 17];

        {
            let mut writer = BufferedWriter::new(device.clone(), 0, 1 << 20);
            writer.write(&payload)?;
            writer.flush()?;
        }

        let mut reader = BufferedReader::new(device, 0, 1 << 20);
        let mut out = vec![0u8; payload.len()];
        reader.read(&mut out)?;
        assert_eq!(out, payload);

        Ok(())
    }
}
