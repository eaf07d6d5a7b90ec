//! Block cache
//!
//! [`IoManager`] owns a fixed pool of block-sized aligned buffers and maps
//! (device, block index) pairs onto them. Callers check blocks out with
//! [`get_block`](IoManager::get_block) and return them with
//! [`put_block`](IoManager::put_block); a checked-out block is never written
//! back, evicted or invalidated.
//!
//! Every slot is in exactly one [`BlockState`]. All state changes go through
//! `set_state`, and all dirty-mask changes through `set_dirty`, which keep
//! the per-state and dirty counters exact.
//!
//! Writeback splits a block's dirty mask into contiguous sector runs and
//! writes them one after another. A run that does not cover the whole block
//! forces its device off O_DIRECT for good.

use crate::block::{
    Block, BlockId, BlockKey, BlockRef, BlockState, GetMode, PendingIo, SectorMask, decode_token,
    dirty_runs, full_mask,
};
use crate::device::{DeviceHandle, DeviceId, DeviceTable};
use crate::engine::{
    IoCompletion, IoDirection, IoEngine, IoRequest, clear_direct, create_engine,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};
use voltk_common::{Error, IoConfig, Result, SECTOR_SIZE};

/// Dirty blocks written back per round while waiting for a free block
const ALLOC_WRITEBACK_BATCH: usize = 16;

/// Cache statistics for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Blocks found resident and idle
    pub hits: u64,
    /// Blocks that had to be read, or waited on
    pub misses: u64,
    /// Misses served without a read because the whole block was zeroed
    pub zeroes: u64,
    /// Reads started by prefetch
    pub prefetches: u64,
    /// Reads issued to the engine
    pub reads: u64,
    /// Writes issued to the engine, one per dirty run
    pub writes: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    /// Clean blocks recycled for another key
    pub evictions: u64,
    /// Devices closed to stay under the device cap
    pub device_evictions: u64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Block cache and device registry over one I/O engine.
///
/// Single-threaded: overlap comes from issuing several requests before
/// waiting on any of them, never from threads.
pub struct IoManager {
    pub(crate) engine: Box<dyn IoEngine>,
    pub(crate) config: IoConfig,
    sectors_per_block: u32,
    blocks: Vec<Block>,
    free: Vec<BlockId>,
    index: HashMap<BlockKey, BlockId>,
    pub(crate) devices: DeviceTable,
    /// Logical clock for LRU ordering
    clock: u64,
    /// Blocks with a non-zero dirty mask
    dirty_blocks: usize,
    state_counts: [usize; BlockState::COUNT],
    /// Blocks with at least one reference out
    locked_blocks: usize,
    pub(crate) stats: CacheStats,
    shut_down: bool,
}

impl std::fmt::Debug for IoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoManager")
            .field("engine", &self.engine.name())
            .field("blocks", &self.blocks.len())
            .field("block_size", &self.config.block_size())
            .field("dirty", &self.dirty_blocks)
            .field("locked", &self.locked_blocks)
            .field("devices", &self.devices.len())
            .finish_non_exhaustive()
    }
}

impl IoManager {
    /// Create a manager on the engine selected by `config`
    pub fn new(config: IoConfig) -> Result<Self> {
        config.validate()?;
        let engine = create_engine(&config)?;
        Self::with_engine(engine, config)
    }

    /// Create a manager on an explicit engine
    pub fn with_engine(engine: Box<dyn IoEngine>, config: IoConfig) -> Result<Self> {
        config.validate()?;
        let block_size = config.block_size();
        let nr_blocks = config.cache_blocks;

        let blocks = (0..nr_blocks).map(|_| Block::new(block_size)).collect();
        // Hand out low slots first
        let free = (0..nr_blocks).rev().map(BlockId).collect();
        let mut state_counts = [0; BlockState::COUNT];
        state_counts[BlockState::Free.slot()] = nr_blocks;

        debug!(
            engine = engine.name(),
            blocks = nr_blocks,
            block_size,
            "created I/O manager"
        );

        Ok(Self {
            engine,
            sectors_per_block: config.sectors_per_block,
            config,
            blocks,
            free,
            index: HashMap::new(),
            devices: DeviceTable::default(),
            clock: 0,
            dirty_blocks: 0,
            state_counts,
            locked_blocks: 0,
            stats: CacheStats::default(),
            shut_down: false,
        })
    }

    /// Block size in bytes
    pub const fn block_size(&self) -> usize {
        self.config.block_size()
    }

    pub const fn sectors_per_block(&self) -> u32 {
        self.sectors_per_block
    }

    /// Number of blocks in the pool
    pub fn nr_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Blocks holding data not yet written back
    pub const fn dirty_count(&self) -> usize {
        self.dirty_blocks
    }

    /// Blocks currently checked out
    pub const fn locked_count(&self) -> usize {
        self.locked_blocks
    }

    /// Requests issued and not yet reaped
    pub fn in_flight(&self) -> usize {
        self.engine.in_flight()
    }

    pub fn max_concurrent_io(&self) -> usize {
        self.engine.max_concurrent_io()
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Snapshot of the statistics
    pub const fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = CacheStats::default();
    }

    /// Advance the logical clock and return the new value
    pub(crate) const fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Check out block `index` of a device.
    ///
    /// Waits for any I/O in flight on the block, reads it on a miss unless
    /// `mode` zeroes all of it, then applies the mode's sector mask. Write
    /// modes require a writable handle and fail with [`Error::BlockBusy`] if
    /// another write reference to the block is out.
    pub fn get_block(
        &mut self,
        handle: &DeviceHandle,
        index: u64,
        mode: GetMode,
    ) -> Result<BlockRef> {
        let path = self.device(handle)?.path.display().to_string();
        if mode.is_write() && !handle.access.write {
            return Err(Error::ReadOnly { path });
        }
        let sectors = mode.sectors();
        if sectors & !full_mask(self.sectors_per_block) != 0 {
            return Err(Error::invalid_argument(format!(
                "sector mask {sectors:#x} exceeds a {}-sector block",
                self.sectors_per_block
            )));
        }
        self.check_index(index)?;

        let key = BlockKey {
            device: handle.id,
            index,
        };
        let id = match self.index.get(&key).copied() {
            Some(id) => {
                let block = &self.blocks[id.0];
                if mode.is_write() && block.write_locked {
                    return Err(Error::BlockBusy { path, block: index });
                }
                if block.state == BlockState::Pending {
                    self.stats.misses += 1;
                    let generation = block.generation;
                    self.wait_for_block(id, generation)?;
                    if self.blocks[id.0].generation != generation {
                        return Err(self.read_error(id, &path, index));
                    }
                } else {
                    self.stats.hits += 1;
                }
                id
            }
            None => {
                self.stats.misses += 1;
                self.load_block(key, mode, &path)?
            }
        };

        let clock = self.tick();
        let block = &mut self.blocks[id.0];
        block.last_used = clock;
        if let (GetMode::Zero { sectors }, Some(buf)) = (mode, block.buf.as_mut()) {
            for run in dirty_runs(sectors, self.sectors_per_block) {
                buf.zero(sector_bytes(run.start)..sector_bytes(run.end));
            }
        }
        if block.refs == 0 {
            self.locked_blocks += 1;
        }
        block.refs += 1;
        block.write_locked |= mode.is_write();
        let generation = block.generation;
        let dirty = block.dirty;

        if sectors != 0 {
            self.set_dirty(id, dirty | sectors);
            if self.blocks[id.0].state == BlockState::Clean {
                self.set_state(id, BlockState::Dirty);
            }
        }

        Ok(BlockRef {
            id,
            generation,
            index,
            write: mode.is_write(),
            released: false,
        })
    }

    /// Return a checked-out block.
    ///
    /// Returning a reference that is not held is logged and otherwise
    /// ignored. If the block is dirty this may start writeback of idle dirty
    /// blocks so free blocks stay available.
    pub fn put_block(&mut self, mut block: BlockRef) {
        block.released = true;
        let Some(slot) = self
            .blocks
            .get_mut(block.id.0)
            .filter(|b| b.generation == block.generation && b.refs > 0)
        else {
            error!(index = block.index, "put_block of a block that is not held");
            return;
        };

        slot.refs -= 1;
        if block.write {
            slot.write_locked = false;
        }
        let dirty = slot.dirty != 0;
        if slot.refs == 0 {
            self.locked_blocks -= 1;
        }
        if dirty {
            self.preemptive_writeback();
        }
    }

    /// Contents of a checked-out block
    pub fn data(&self, block: &BlockRef) -> Result<&[u8]> {
        self.held(block)?
            .buf
            .as_deref()
            .ok_or_else(|| Error::internal("held block has no buffer"))
    }

    /// Mutable contents of a block checked out in a write mode.
    ///
    /// Only the sectors named by the mask given to `get_block` are written
    /// back; changes elsewhere in the buffer are lost on eviction.
    pub fn data_mut(&mut self, block: &BlockRef) -> Result<&mut [u8]> {
        if !block.write {
            return Err(Error::invalid_argument(format!(
                "block {} was not checked out for writing",
                block.index
            )));
        }
        let index = block.index;
        self.blocks
            .get_mut(block.id.0)
            .filter(|b| b.generation == block.generation && b.refs > 0)
            .ok_or_else(|| Error::StaleHandle(format!("block {index}")))?
            .buf
            .as_deref_mut()
            .ok_or_else(|| Error::internal("held block has no buffer"))
    }

    /// Start reading a block without waiting for it.
    ///
    /// Does nothing if the block is already cached, the engine is at
    /// capacity, or no block can be freed without waiting.
    pub fn prefetch(&mut self, handle: &DeviceHandle, index: u64) -> Result<()> {
        self.device(handle)?;
        self.check_index(index)?;

        let key = BlockKey {
            device: handle.id,
            index,
        };
        if self.index.contains_key(&key)
            || self.engine.in_flight() >= self.engine.max_concurrent_io()
        {
            return Ok(());
        }
        let Some(id) = self.alloc_block(false)? else {
            trace!(index, "no free block for prefetch");
            return Ok(());
        };
        self.attach(id, key)?;
        self.issue_read(id)?;
        self.stats.prefetches += 1;
        Ok(())
    }

    /// Write back every idle dirty block and wait for all I/O.
    ///
    /// Blocks whose writeback failed earlier are retried. Fails with
    /// [`Error::FlushFailed`] if any block is still unwritten afterwards;
    /// their data stays cached and dirty, so calling `flush` again retries
    /// exactly those blocks.
    pub fn flush(&mut self) -> Result<()> {
        for id in self.slots_in(BlockState::Errored) {
            self.set_state(id, BlockState::Dirty);
        }

        for id in self.idle_dirty() {
            self.wait_for_capacity()?;
            // Waiting may have changed the block
            let block = &self.blocks[id.0];
            if block.state == BlockState::Dirty && block.refs == 0 {
                self.start_writeback(id);
            }
        }
        self.drain()?;

        let failed = self.count(BlockState::Errored);
        if failed > 0 {
            warn!(blocks = failed, "flush left blocks unwritten");
            return Err(Error::FlushFailed { blocks: failed });
        }
        Ok(())
    }

    /// Drop one block from the cache, writing it back first if dirty.
    ///
    /// Fails without discarding anything if the block is checked out or its
    /// writeback fails.
    pub fn invalidate_block(&mut self, handle: &DeviceHandle, index: u64) -> Result<()> {
        self.device(handle)?;
        let key = BlockKey {
            device: handle.id,
            index,
        };
        let Some(id) = self.index.get(&key).copied() else {
            return Ok(());
        };
        self.invalidate_slots(vec![id], &handle.path.display().to_string())
    }

    /// Drop every cached block of a device, writing dirty ones back first
    pub fn invalidate_device(&mut self, handle: &DeviceHandle) -> Result<()> {
        self.device(handle)?;
        self.invalidate_device_id(handle.id)
    }

    /// Drop every cached block, writing dirty ones back first.
    ///
    /// Devices whose holders have all released them are closed.
    pub fn invalidate_all(&mut self) -> Result<()> {
        if self.locked_blocks > 0 {
            return Err(Error::Busy(format!(
                "{} checked-out block(s)",
                self.locked_blocks
            )));
        }
        for id in self.devices.ids() {
            self.invalidate_device_id(id)?;
        }
        Ok(())
    }

    /// Flush and drain all I/O, reporting the flush result
    pub fn shutdown(mut self) -> Result<()> {
        self.shut_down = true;
        let flushed = self.flush();
        self.drain()?;
        flushed
    }

    pub(crate) fn invalidate_device_id(&mut self, device: DeviceId) -> Result<()> {
        let path = self
            .devices
            .get(device)
            .map(|d| d.path.display().to_string())
            .unwrap_or_default();
        let ids: Vec<BlockId> = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.key.is_some_and(|k| k.device == device))
            .map(|(i, _)| BlockId(i))
            .collect();
        self.invalidate_slots(ids, &path)
    }

    /// Write back and discard a set of blocks, all or nothing on refs
    fn invalidate_slots(&mut self, ids: Vec<BlockId>, path: &str) -> Result<()> {
        if ids.iter().any(|id| self.blocks[id.0].refs > 0) {
            return Err(Error::Busy(path.to_string()));
        }

        let slots: Vec<(BlockId, u32)> = ids
            .into_iter()
            .map(|id| (id, self.blocks[id.0].generation))
            .collect();

        for &(id, generation) in &slots {
            self.wait_for_block(id, generation)?;
            let block = &self.blocks[id.0];
            if block.generation != generation {
                continue;
            }
            if matches!(block.state, BlockState::Dirty | BlockState::Errored) {
                self.set_state(id, BlockState::Dirty);
                self.wait_for_capacity()?;
                self.start_writeback(id);
            }
        }
        for &(id, generation) in &slots {
            self.wait_for_block(id, generation)?;
        }

        let failed = slots
            .iter()
            .filter(|(id, generation)| {
                let block = &self.blocks[id.0];
                block.generation == *generation && block.state == BlockState::Errored
            })
            .count();
        if failed > 0 {
            return Err(Error::FlushFailed { blocks: failed });
        }

        for (id, generation) in slots {
            if self.blocks[id.0].generation == generation {
                self.discard(id);
            }
        }
        trace!(path, "invalidated blocks");
        Ok(())
    }

    /// The end of the block in bytes must fit an `off_t`
    fn check_index(&self, index: u64) -> Result<()> {
        index
            .checked_add(1)
            .and_then(|n| n.checked_mul(u64::from(self.sectors_per_block)))
            .and_then(|sectors| sectors.checked_mul(SECTOR_SIZE))
            .filter(|end| i64::try_from(*end).is_ok())
            .map(|_| ())
            .ok_or_else(|| Error::invalid_argument(format!("block index {index} out of range")))
    }

    fn held(&self, block: &BlockRef) -> Result<&Block> {
        self.blocks
            .get(block.id.0)
            .filter(|b| b.generation == block.generation && b.refs > 0)
            .ok_or_else(|| Error::StaleHandle(format!("block {}", block.index)))
    }

    fn count(&self, state: BlockState) -> usize {
        self.state_counts[state.slot()]
    }

    fn set_state(&mut self, id: BlockId, state: BlockState) {
        let block = &mut self.blocks[id.0];
        self.state_counts[block.state.slot()] -= 1;
        self.state_counts[state.slot()] += 1;
        block.state = state;
    }

    fn set_dirty(&mut self, id: BlockId, mask: SectorMask) {
        let block = &mut self.blocks[id.0];
        match (block.dirty != 0, mask != 0) {
            (false, true) => self.dirty_blocks += 1,
            (true, false) => self.dirty_blocks -= 1,
            _ => {}
        }
        block.dirty = mask;
    }

    fn slots_in(&self, state: BlockState) -> Vec<BlockId> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.state == state)
            .map(|(i, _)| BlockId(i))
            .collect()
    }

    /// Unreferenced dirty blocks, least recently used first
    fn idle_dirty(&self) -> Vec<BlockId> {
        let mut ids: Vec<(u64, BlockId)> = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.state == BlockState::Dirty && b.refs == 0)
            .map(|(i, b)| (b.last_used, BlockId(i)))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Least recently used unreferenced clean block
    fn lru_clean(&self) -> Option<BlockId> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.state == BlockState::Clean && b.refs == 0)
            .min_by_key(|(_, b)| b.last_used)
            .map(|(i, _)| BlockId(i))
    }

    /// Take a block from the free pool, evicting the LRU clean block if
    /// the pool is empty. With `can_block`, writes back dirty blocks and
    /// waits until one comes free.
    fn alloc_block(&mut self, can_block: bool) -> Result<Option<BlockId>> {
        loop {
            if let Some(id) = self.free.pop() {
                return Ok(Some(id));
            }
            if let Some(id) = self.lru_clean() {
                trace!(block = id.0, "evicting clean block");
                self.stats.evictions += 1;
                self.discard(id);
                continue;
            }
            if !can_block {
                return Ok(None);
            }
            self.writeback_lru(ALLOC_WRITEBACK_BATCH);
            if self.engine.in_flight() == 0 {
                return Err(Error::CacheExhausted {
                    blocks: self.blocks.len(),
                });
            }
            self.wait_io()?;
        }
    }

    /// Give a free slot a key and attribute it to its device
    fn attach(&mut self, id: BlockId, key: BlockKey) -> Result<()> {
        let Some(device) = self.devices.get_mut(key.device) else {
            self.free.push(id);
            return Err(Error::internal("attaching a block to a closed device"));
        };
        device.blocks += 1;
        let block = &mut self.blocks[id.0];
        block.key = Some(key);
        block.error = None;
        self.index.insert(key, id);
        self.set_state(id, BlockState::Clean);
        Ok(())
    }

    /// Return a slot to the free pool. Bumping the generation invalidates
    /// outstanding tokens and references.
    fn discard(&mut self, id: BlockId) {
        let block = &mut self.blocks[id.0];
        debug_assert!(block.buf.is_some() && block.refs == 0);
        let key = block.key.take();
        block.generation = block.generation.wrapping_add(1);
        block.io = None;
        block.write_locked = false;
        self.set_dirty(id, 0);
        self.set_state(id, BlockState::Free);
        self.free.push(id);

        if let Some(key) = key {
            self.index.remove(&key);
            if let Some(device) = self.devices.get_mut(key.device) {
                device.blocks = device.blocks.saturating_sub(1);
            }
            self.devices.remove_if_unused(key.device);
        }
    }

    /// Allocate and read a block on a miss
    fn load_block(&mut self, key: BlockKey, mode: GetMode, path: &str) -> Result<BlockId> {
        let skip_read =
            matches!(mode, GetMode::Zero { sectors } if sectors == full_mask(self.sectors_per_block));

        let id = self
            .alloc_block(true)?
            .ok_or_else(|| Error::internal("blocking allocation returned nothing"))?;
        self.attach(id, key)?;

        if skip_read {
            self.stats.zeroes += 1;
            return Ok(id);
        }
        if let Err(e) = self.wait_for_capacity() {
            self.discard(id);
            return Err(e);
        }

        let generation = self.blocks[id.0].generation;
        self.issue_read(id)?;
        self.wait_for_block(id, generation)?;
        if self.blocks[id.0].generation != generation {
            return Err(self.read_error(id, path, key.index));
        }
        Ok(id)
    }

    fn read_error(&self, id: BlockId, path: &str, index: u64) -> Error {
        Error::Read {
            path: path.to_string(),
            block: index,
            reason: self.blocks[id.0]
                .error
                .clone()
                .unwrap_or_else(|| "read failed".to_string()),
        }
    }

    /// Issue a read for an attached block. On failure the block is
    /// discarded.
    fn issue_read(&mut self, id: BlockId) -> Result<()> {
        let key = self.blocks[id.0]
            .key
            .ok_or_else(|| Error::internal("read of a detached block"))?;
        let device = self
            .devices
            .get(key.device)
            .ok_or_else(|| Error::internal("read from a closed device"))?;
        let path = device.path.display().to_string();

        let spb = u64::from(self.sectors_per_block);
        let mut sectors = key.index * spb..(key.index + 1) * spb;
        // Block devices cannot be read past the end; files read short
        if device.identity.is_block_device() {
            sectors.end = sectors.end.min(device.size / SECTOR_SIZE);
            if sectors.start >= sectors.end {
                self.discard(id);
                return Err(Error::Read {
                    path,
                    block: key.index,
                    reason: "beyond end of device".to_string(),
                });
            }
        }
        let file = match device.file() {
            Ok(file) => Arc::clone(file),
            Err(e) => {
                self.discard(id);
                return Err(e);
            }
        };

        let block = &mut self.blocks[id.0];
        let Some(mut buf) = block.buf.take() else {
            return Err(Error::internal("read into a block without a buffer"));
        };
        buf.fill(0);
        let token = block.token(id);
        block.io = Some(PendingIo {
            direction: IoDirection::Read,
            remaining: VecDeque::new(),
        });
        self.set_state(id, BlockState::Pending);

        let request = IoRequest {
            direction: IoDirection::Read,
            file,
            sectors,
            buf,
            buf_offset: 0,
            token,
        };
        match self.engine.issue(request) {
            Ok(()) => {
                self.stats.reads += 1;
                Ok(())
            }
            Err(rejected) => {
                let reason = describe(rejected.result);
                self.blocks[id.0].buf = Some(rejected.buf);
                self.stats.read_errors += 1;
                self.discard(id);
                Err(Error::Rejected(format!(
                    "read of block {} on {path}: {reason}",
                    key.index
                )))
            }
        }
    }

    /// Write back enough idle dirty blocks to bring the available share of
    /// the pool up to the high watermark, once it drops below the low one.
    /// Never waits.
    fn preemptive_writeback(&mut self) {
        let total = self.blocks.len();
        let busy = self.count(BlockState::Dirty)
            + self.count(BlockState::Errored)
            + self.count(BlockState::Pending);
        let available = total.saturating_sub(busy);
        let low = total * usize::from(self.config.writeback_low_percent) / 100;
        if available >= low {
            return;
        }
        let high = total * usize::from(self.config.writeback_high_percent) / 100;
        let wanted = high.saturating_sub(available);
        let issued = self.writeback_lru(wanted);
        debug!(available, wanted, issued, "preemptive writeback");
    }

    /// Start writeback of up to `limit` idle dirty blocks, LRU first,
    /// without exceeding engine capacity
    fn writeback_lru(&mut self, limit: usize) -> usize {
        let mut issued = 0;
        for id in self.idle_dirty() {
            if issued >= limit || self.engine.in_flight() >= self.engine.max_concurrent_io() {
                break;
            }
            self.start_writeback(id);
            issued += 1;
        }
        issued
    }

    /// Begin writing a dirty block's runs. Failures mark it errored.
    fn start_writeback(&mut self, id: BlockId) {
        let block = &self.blocks[id.0];
        let Some(key) = block.key else {
            return;
        };
        let mask = block.dirty;
        let runs: VecDeque<_> = dirty_runs(mask, self.sectors_per_block).into();
        if runs.is_empty() {
            self.set_state(id, BlockState::Clean);
            return;
        }

        if mask != full_mask(self.sectors_per_block)
            && let Err(e) = self.allow_unaligned(key.device)
        {
            self.writeback_failed(id, &e.to_string());
            return;
        }

        self.blocks[id.0].io = Some(PendingIo {
            direction: IoDirection::Write,
            remaining: runs,
        });
        self.set_state(id, BlockState::Pending);
        self.issue_next_run(id);
    }

    /// Partial writes cannot go through O_DIRECT on devices with large
    /// logical sectors; move the device to buffered I/O for good.
    fn allow_unaligned(&mut self, device: DeviceId) -> Result<()> {
        let dev = self
            .devices
            .get_mut(device)
            .ok_or_else(|| Error::internal("writeback to a closed device"))?;
        dev.needs_unaligned = true;
        if !dev.direct {
            return Ok(());
        }
        // A second O_EXCL open of a block device fails with EBUSY
        if dev.access.exclusive && dev.identity.is_block_device() {
            warn!(path = %dev.path.display(), "partial block write, clearing direct I/O");
            clear_direct(dev.file()?)?;
            dev.direct = false;
            return Ok(());
        }
        let access = dev.access;
        warn!(path = %dev.path.display(), "partial block write, reopening without direct I/O");
        self.reopen_in_place(device, access, false)
    }

    /// Issue the next dirty run of a block under writeback, or finish the
    /// writeback if none is left
    fn issue_next_run(&mut self, id: BlockId) {
        let spb = u64::from(self.sectors_per_block);
        loop {
            let block = &mut self.blocks[id.0];
            let Some(key) = block.key else {
                return;
            };
            let Some(run) = block.io.as_mut().and_then(|io| io.remaining.pop_front()) else {
                self.finish_writeback(id);
                return;
            };
            let Some(device) = self.devices.get(key.device) else {
                self.writeback_failed(id, "device closed with dirty blocks");
                return;
            };

            let base = key.index * spb;
            let mut sectors = base + u64::from(run.start)..base + u64::from(run.end);
            if device.identity.is_block_device() {
                sectors.end = sectors.end.min(device.size / SECTOR_SIZE);
                if sectors.start >= sectors.end {
                    warn!(path = %device.path.display(), block = key.index, "dirty sectors beyond end of device dropped");
                    continue;
                }
            }
            let Some(file) = device.file.as_ref().map(Arc::clone) else {
                self.writeback_failed(id, "device has no open descriptor");
                return;
            };

            let block = &mut self.blocks[id.0];
            let Some(buf) = block.buf.take() else {
                error!(block = id.0, "writeback of a block without a buffer");
                return;
            };
            let request = IoRequest {
                direction: IoDirection::Write,
                file,
                sectors,
                buf,
                buf_offset: sector_bytes(run.start),
                token: block.token(id),
            };
            match self.engine.issue(request) {
                Ok(()) => self.stats.writes += 1,
                Err(rejected) => {
                    let reason = describe(rejected.result);
                    self.blocks[id.0].buf = Some(rejected.buf);
                    self.writeback_failed(id, &format!("submission rejected: {reason}"));
                }
            }
            return;
        }
    }

    fn finish_writeback(&mut self, id: BlockId) {
        let block = &mut self.blocks[id.0];
        block.io = None;
        block.error = None;
        self.set_dirty(id, 0);
        self.set_state(id, BlockState::Clean);
    }

    fn writeback_failed(&mut self, id: BlockId, reason: &str) {
        self.stats.write_errors += 1;
        let block = &mut self.blocks[id.0];
        block.io = None;
        block.error = Some(reason.to_string());
        if let Some(key) = block.key {
            let path = self
                .devices
                .get(key.device)
                .map(|d| d.path.display().to_string())
                .unwrap_or_default();
            warn!(path, block = key.index, "writeback failed: {reason}");
        }
        self.set_state(id, BlockState::Errored);
    }

    /// Route a completion back to its block
    fn complete(&mut self, completion: IoCompletion) {
        let (id, generation) = decode_token(completion.token);
        let Some(block) = self.blocks.get_mut(id.0) else {
            error!(token = completion.token.0, "completion for an unknown block");
            return;
        };
        if block.generation != generation
            || block.state != BlockState::Pending
            || block.buf.is_some()
        {
            error!(block = id.0, "completion does not match a pending block");
            if block.buf.is_none() {
                block.buf = Some(completion.buf);
            }
            return;
        }
        block.buf = Some(completion.buf);

        match (completion.direction, completion.result) {
            (IoDirection::Read, result) => self.read_done(id, result),
            (IoDirection::Write, Ok(())) => self.issue_next_run(id),
            (IoDirection::Write, Err(e)) => self.writeback_failed(id, &e.to_string()),
        }
    }

    fn read_done(&mut self, id: BlockId, result: std::io::Result<()>) {
        let block = &mut self.blocks[id.0];
        block.io = None;
        let device = block.key.and_then(|k| self.devices.get(k.device));
        let result = match result {
            // Past the end of a regular file reads as zeros
            Err(e)
                if e.kind() == std::io::ErrorKind::UnexpectedEof
                    && device.is_some_and(|d| !d.identity.is_block_device()) =>
            {
                Ok(())
            }
            other => other,
        };

        match result {
            Ok(()) => self.set_state(id, BlockState::Clean),
            Err(e) => {
                self.stats.read_errors += 1;
                if let Some(device) = device {
                    warn!(path = %device.path.display(), "read failed: {e}");
                }
                self.blocks[id.0].error = Some(e.to_string());
                self.discard(id);
            }
        }
    }

    /// Block for at least one completion and process everything reaped
    fn wait_io(&mut self) -> Result<()> {
        if self.engine.in_flight() == 0 {
            return Err(Error::internal("waiting with no I/O in flight"));
        }
        for completion in self.engine.wait()? {
            self.complete(completion);
        }
        Ok(())
    }

    /// Wait until the engine accepts another request
    fn wait_for_capacity(&mut self) -> Result<()> {
        while self.engine.in_flight() >= self.engine.max_concurrent_io() {
            self.wait_io()?;
        }
        Ok(())
    }

    /// Wait until a block is no longer pending, or has been discarded
    fn wait_for_block(&mut self, id: BlockId, generation: u32) -> Result<()> {
        while self.blocks[id.0].generation == generation
            && self.blocks[id.0].state == BlockState::Pending
        {
            self.wait_io()?;
        }
        Ok(())
    }

    /// Wait for every request in flight
    pub(crate) fn drain(&mut self) -> Result<()> {
        while self.engine.in_flight() > 0 {
            self.wait_io()?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let dirty = self.blocks.iter().filter(|b| b.dirty != 0).count();
        assert_eq!(self.dirty_blocks, dirty, "dirty counter out of sync");

        for state in [
            BlockState::Free,
            BlockState::Clean,
            BlockState::Dirty,
            BlockState::Errored,
            BlockState::Pending,
        ] {
            let n = self.blocks.iter().filter(|b| b.state == state).count();
            assert_eq!(self.count(state), n, "{state:?} counter out of sync");
        }
        assert_eq!(self.free.len(), self.count(BlockState::Free));

        let locked = self.blocks.iter().filter(|b| b.refs > 0).count();
        assert_eq!(self.locked_blocks, locked);

        for (key, id) in &self.index {
            assert_eq!(self.blocks[id.0].key, Some(*key));
        }
        for block in &self.blocks {
            match block.state {
                BlockState::Dirty | BlockState::Errored => assert_ne!(block.dirty, 0),
                BlockState::Free | BlockState::Clean => assert_eq!(block.dirty, 0),
                BlockState::Pending => {}
            }
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        if self.shut_down {
            return;
        }
        if let Err(e) = self.flush() {
            error!("flush on drop failed: {e}");
        }
        if let Err(e) = self.drain() {
            error!("draining I/O on drop failed: {e}");
        }
    }
}

const fn sector_bytes(sector: u32) -> usize {
    sector as usize * SECTOR_SIZE as usize
}

fn describe(result: std::io::Result<()>) -> String {
    result.err().map_or_else(|| "rejected".to_string(), |e| e.to_string())
}
