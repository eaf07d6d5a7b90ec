//! voltk I/O - Block cache and asynchronous I/O manager
//!
//! This crate implements the I/O layer the volume tools read and write
//! devices through:
//! - Pluggable I/O engines (io_uring, synchronous, dry-run)
//! - Page-aligned buffers for O_DIRECT
//! - A device registry sharing open devices between holders
//! - A block cache with partial-block writeback
//! - Byte-range helpers and a batch reader over the cache

pub mod batch;
pub mod block;
pub mod buffer;
pub mod cache;
pub mod device;
pub mod engine;
mod range;

#[cfg(test)]
mod testing;

// Re-exports
pub use batch::{BatchProcessor, BatchReport, Job};
pub use block::{BlockRef, GetMode, SectorMask, full_mask, sector_mask};
pub use buffer::AlignedBuffer;
pub use cache::{CacheStats, IoManager};
pub use device::DeviceHandle;
#[cfg(target_os = "linux")]
pub use engine::AioEngine;
pub use engine::{DryRunEngine, IoEngine, SyncEngine, create_engine};
