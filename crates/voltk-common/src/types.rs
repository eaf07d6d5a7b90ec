//! Core types used throughout voltk

use serde::{Deserialize, Serialize};

/// Size of a sector in bytes. All engine offsets are in these units.
pub const SECTOR_SIZE: u64 = 512;

/// log2 of [`SECTOR_SIZE`]
pub const SECTOR_SHIFT: u32 = 9;

/// Largest block the cache supports; the per-block dirty mask is one `u64`.
pub const MAX_SECTORS_PER_BLOCK: u32 = 64;

/// Convert a byte count to sectors, rounding up
#[must_use]
pub const fn bytes_to_sectors(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR_SIZE)
}

/// Convert sectors to bytes
#[must_use]
pub const fn sectors_to_bytes(sectors: u64) -> u64 {
    sectors << SECTOR_SHIFT
}

/// Access flags requested when a device is acquired.
///
/// These map onto `O_RDONLY`/`O_RDWR` and `O_EXCL` at the engine layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessFlags {
    /// The holder will dirty blocks
    pub write: bool,
    /// No other holder may share the device
    pub exclusive: bool,
}

impl AccessFlags {
    /// Shared, read-only access
    pub const READ: Self = Self {
        write: false,
        exclusive: false,
    };

    /// Shared, read-write access
    pub const WRITE: Self = Self {
        write: true,
        exclusive: false,
    };

    /// Exclusive, read-write access
    pub const EXCLUSIVE: Self = Self {
        write: true,
        exclusive: true,
    };

    /// True if a device opened with `self` also satisfies `wanted`
    #[must_use]
    pub const fn satisfies(self, wanted: Self) -> bool {
        (self.write || !wanted.write) && (self.exclusive || !wanted.exclusive)
    }

    /// The union of two sets of flags
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            write: self.write || other.write,
            exclusive: self.exclusive || other.exclusive,
        }
    }
}

/// Sector geometry reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    /// Smallest addressable unit (`BLKSSZGET`)
    pub logical_sector_size: u32,
    /// Smallest unit written without read-modify-write (`BLKPBSZGET`)
    pub physical_block_size: u32,
}

impl Default for BlockGeometry {
    fn default() -> Self {
        Self {
            logical_sector_size: SECTOR_SIZE as u32,
            physical_block_size: SECTOR_SIZE as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_conversion() {
        assert_eq!(bytes_to_sectors(0), 0);
        assert_eq!(bytes_to_sectors(1), 1);
        assert_eq!(bytes_to_sectors(512), 1);
        assert_eq!(bytes_to_sectors(513), 2);
        assert_eq!(sectors_to_bytes(8), 4096);
    }

    #[test]
    fn test_access_flags_satisfies() {
        assert!(AccessFlags::WRITE.satisfies(AccessFlags::READ));
        assert!(AccessFlags::EXCLUSIVE.satisfies(AccessFlags::WRITE));
        assert!(!AccessFlags::READ.satisfies(AccessFlags::WRITE));
        assert!(!AccessFlags::WRITE.satisfies(AccessFlags::EXCLUSIVE));
        assert_eq!(
            AccessFlags::READ.union(AccessFlags::WRITE),
            AccessFlags::WRITE
        );
    }
}
