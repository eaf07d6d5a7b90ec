//! Cache block slots, handles and sector masks

use crate::buffer::AlignedBuffer;
use crate::device::DeviceId;
use crate::engine::{IoDirection, IoToken};
use std::collections::VecDeque;
use std::ops::Range;
use tracing::error;

/// One bit per sector of a block; bit `n` covers sector `n` of the block.
pub type SectorMask = u64;

/// Mask with every sector of a `sectors_per_block` block set
pub const fn full_mask(sectors_per_block: u32) -> SectorMask {
    if sectors_per_block >= 64 {
        u64::MAX
    } else {
        (1u64 << sectors_per_block) - 1
    }
}

/// Mask covering sectors `range.start..range.end`
pub const fn sector_mask(range: Range<u32>) -> SectorMask {
    if range.start >= range.end {
        return 0;
    }
    full_mask(range.end) & !full_mask(range.start)
}

/// Split a mask into maximal runs of consecutive set sectors, in order
pub fn dirty_runs(mask: SectorMask, sectors_per_block: u32) -> Vec<Range<u32>> {
    let mut runs = Vec::new();
    let mut sector = 0;
    while sector < sectors_per_block {
        if mask & (1 << sector) == 0 {
            sector += 1;
            continue;
        }
        let start = sector;
        while sector < sectors_per_block && mask & (1 << sector) != 0 {
            sector += 1;
        }
        runs.push(start..sector);
    }
    runs
}

/// How a block is wanted by [`get_block`](crate::IoManager::get_block)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetMode {
    /// Read only; no mutation intended
    Read,
    /// The caller will modify `sectors`; the rest of the block is preserved
    Dirty { sectors: SectorMask },
    /// `sectors` are zeroed and dirtied; a fully covered block is not read
    Zero { sectors: SectorMask },
}

impl GetMode {
    /// True for modes that dirty the block
    pub const fn is_write(self) -> bool {
        !matches!(self, Self::Read)
    }

    /// Sectors the mode dirties
    pub const fn sectors(self) -> SectorMask {
        match self {
            Self::Read => 0,
            Self::Dirty { sectors } | Self::Zero { sectors } => sectors,
        }
    }
}

/// Index of a slot in the block pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct BlockId(pub(crate) usize);

/// Identity of a cached block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BlockKey {
    pub device: DeviceId,
    pub index: u64,
}

/// Which collection a slot belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockState {
    /// In the free pool, no key
    Free,
    /// Holds valid data matching the device
    Clean,
    /// Holds sectors not yet written back
    Dirty,
    /// Dirty, and the last writeback failed
    Errored,
    /// An I/O is in flight; the buffer is owned by the engine
    Pending,
}

impl BlockState {
    pub const COUNT: usize = 5;

    pub const fn slot(self) -> usize {
        match self {
            Self::Free => 0,
            Self::Clean => 1,
            Self::Dirty => 2,
            Self::Errored => 3,
            Self::Pending => 4,
        }
    }
}

/// The transfer a pending block is waiting on
#[derive(Debug)]
pub(crate) struct PendingIo {
    pub direction: IoDirection,
    /// Dirty runs still to be written after the one in flight
    pub remaining: VecDeque<Range<u32>>,
}

/// A slot of the block pool
#[derive(Debug)]
pub(crate) struct Block {
    pub key: Option<BlockKey>,
    pub state: BlockState,
    /// `None` while the engine owns the buffer
    pub buf: Option<AlignedBuffer>,
    pub refs: u32,
    pub write_locked: bool,
    pub dirty: SectorMask,
    pub io: Option<PendingIo>,
    /// Sticky description of the last failed transfer
    pub error: Option<String>,
    pub last_used: u64,
    pub generation: u32,
}

impl Block {
    pub fn new(block_size: usize) -> Self {
        Self {
            key: None,
            state: BlockState::Free,
            buf: Some(AlignedBuffer::new(block_size)),
            refs: 0,
            write_locked: false,
            dirty: 0,
            io: None,
            error: None,
            last_used: 0,
            generation: 0,
        }
    }

    pub fn token(&self, id: BlockId) -> IoToken {
        IoToken((u64::from(self.generation) << 32) | id.0 as u64)
    }
}

/// Split a token back into slot and generation
pub(crate) const fn decode_token(token: IoToken) -> (BlockId, u32) {
    (BlockId((token.0 & 0xFFFF_FFFF) as usize), (token.0 >> 32) as u32)
}

/// A checked-out cache block.
///
/// Obtained from [`get_block`](crate::IoManager::get_block) and returned with
/// [`put_block`](crate::IoManager::put_block). The block stays resident and
/// is never written back or evicted while any reference is out.
#[derive(Debug)]
pub struct BlockRef {
    pub(crate) id: BlockId,
    pub(crate) generation: u32,
    pub(crate) index: u64,
    pub(crate) write: bool,
    pub(crate) released: bool,
}

impl BlockRef {
    /// Block index within the device
    pub const fn index(&self) -> u64 {
        self.index
    }

    /// True if the reference was taken in a dirtying mode
    pub const fn is_write(&self) -> bool {
        self.write
    }
}

impl Drop for BlockRef {
    fn drop(&mut self) {
        if !self.released {
            error!(index = self.index, "block reference dropped without put_block");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks() {
        assert_eq!(full_mask(8), 0xFF);
        assert_eq!(full_mask(64), u64::MAX);
        assert_eq!(sector_mask(0..8), 0xFF);
        assert_eq!(sector_mask(2..4), 0b1100);
        assert_eq!(sector_mask(63..64), 1 << 63);
        assert_eq!(sector_mask(3..3), 0);
        assert_eq!(sector_mask(0..64), u64::MAX);
    }

    #[test]
    fn test_dirty_runs() {
        assert_eq!(dirty_runs(0, 8), Vec::<Range<u32>>::new());
        assert_eq!(dirty_runs(0xFF, 8), vec![0..8]);
        assert_eq!(dirty_runs(0b1011_0001, 8), vec![0..1, 4..6, 7..8]);
        assert_eq!(dirty_runs(u64::MAX, 64), vec![0..64]);
        assert_eq!(dirty_runs(1 << 63 | 1, 64), vec![0..1, 63..64]);
    }

    #[test]
    fn test_token_roundtrip() {
        let mut block = Block::new(4096);
        block.generation = 7;
        let token = block.token(BlockId(42));
        assert_eq!(decode_token(token), (BlockId(42), 7));
    }

    #[test]
    fn test_get_mode() {
        assert!(!GetMode::Read.is_write());
        assert_eq!(GetMode::Read.sectors(), 0);
        assert!(GetMode::Zero { sectors: 1 }.is_write());
        assert_eq!(GetMode::Dirty { sectors: 6 }.sectors(), 6);
    }
}
