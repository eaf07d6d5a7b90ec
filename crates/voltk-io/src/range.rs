//! Byte-range access on top of the block cache
//!
//! A byte range is split at block boundaries. Blocks the range covers
//! completely are checked out in zero mode, so they are never read; the
//! partial blocks at either end are checked out in dirty mode with exactly
//! the touched sectors in the mask, which reads them first and preserves
//! everything outside the range. Writeback is left to the cache.

use crate::block::{GetMode, full_mask, sector_mask};
use crate::cache::IoManager;
use crate::device::DeviceHandle;
use std::ops::Range;
use voltk_common::{Error, Result, SECTOR_SIZE};

/// The part of one block a byte range covers
#[derive(Debug, Clone, PartialEq, Eq)]
struct Chunk {
    /// Block index on the device
    index: u64,
    /// Byte range within the block
    range: Range<usize>,
    /// Offset of the chunk within the caller's buffer
    offset: usize,
}

impl Chunk {
    fn is_whole(&self, block_size: usize) -> bool {
        self.range.start == 0 && self.range.end == block_size
    }

    /// Sectors of the block the chunk touches
    fn sectors(&self) -> Range<u32> {
        let sector = SECTOR_SIZE as usize;
        let first = self.range.start / sector;
        let last = self.range.end.div_ceil(sector);
        (first as u32)..(last as u32)
    }

    fn buf_range(&self) -> Range<usize> {
        self.offset..self.offset + self.range.len()
    }
}

/// Split `start..start + len` into per-block chunks
fn chunks(block_size: usize, start: u64, len: u64) -> Result<Vec<Chunk>> {
    let end = start
        .checked_add(len)
        .ok_or_else(|| Error::invalid_argument(format!("byte range {start}+{len} overflows")))?;
    let bs = block_size as u64;

    let mut chunks = Vec::new();
    let mut pos = start;
    while pos < end {
        let index = pos / bs;
        let block_start = index * bs;
        let block_end = (block_start + bs).min(end);
        chunks.push(Chunk {
            index,
            range: (pos - block_start) as usize..(block_end - block_start) as usize,
            offset: (pos - start) as usize,
        });
        pos = block_end;
    }
    Ok(chunks)
}

impl IoManager {
    /// Read `buf.len()` bytes starting at byte `start`.
    ///
    /// Every block of the range is prefetched first so the reads overlap.
    pub fn read_bytes(&mut self, handle: &DeviceHandle, start: u64, buf: &mut [u8]) -> Result<()> {
        let chunks = chunks(self.block_size(), start, buf.len() as u64)?;
        for chunk in &chunks {
            self.prefetch(handle, chunk.index)?;
        }

        for chunk in chunks {
            let block = self.get_block(handle, chunk.index, GetMode::Read)?;
            let copied = self.data(&block).map(|data| {
                buf[chunk.buf_range()].copy_from_slice(&data[chunk.range.clone()]);
            });
            self.put_block(block);
            copied?;
        }
        Ok(())
    }

    /// Write `data` starting at byte `start`
    pub fn write_bytes(&mut self, handle: &DeviceHandle, start: u64, data: &[u8]) -> Result<()> {
        self.modify_bytes(handle, start, data.len() as u64, |chunk, offset| {
            chunk.copy_from_slice(&data[offset..offset + chunk.len()]);
        })
    }

    /// Set `len` bytes starting at byte `start` to `value`
    pub fn set_bytes(&mut self, handle: &DeviceHandle, start: u64, len: u64, value: u8) -> Result<()> {
        self.modify_bytes(handle, start, len, |chunk, _| chunk.fill(value))
    }

    /// Zero `len` bytes starting at byte `start`
    pub fn zero_bytes(&mut self, handle: &DeviceHandle, start: u64, len: u64) -> Result<()> {
        self.set_bytes(handle, start, len, 0)
    }

    /// Start reading every block of a byte range without waiting.
    ///
    /// Blocks already cached, or that cannot be obtained without waiting,
    /// are skipped.
    pub fn prefetch_bytes(&mut self, handle: &DeviceHandle, start: u64, len: u64) -> Result<()> {
        for chunk in chunks(self.block_size(), start, len)? {
            self.prefetch(handle, chunk.index)?;
        }
        Ok(())
    }

    fn modify_bytes(
        &mut self,
        handle: &DeviceHandle,
        start: u64,
        len: u64,
        mut apply: impl FnMut(&mut [u8], usize),
    ) -> Result<()> {
        let block_size = self.block_size();
        let full = full_mask(self.sectors_per_block());

        for chunk in chunks(block_size, start, len)? {
            let mode = if chunk.is_whole(block_size) {
                GetMode::Zero { sectors: full }
            } else {
                GetMode::Dirty {
                    sectors: sector_mask(chunk.sectors()),
                }
            };
            let block = self.get_block(handle, chunk.index, mode)?;
            let applied = self
                .data_mut(&block)
                .map(|data| apply(&mut data[chunk.range.clone()], chunk.offset));
            self.put_block(block);
            applied?;
        }
        Ok(())
    }
}
