//! Device registry
//!
//! Open devices are cached by path and shared between holders. Each device
//! tracks two counts: holders (callers with a [`DeviceHandle`] out) and
//! blocks (cache blocks attributed to it). The device is closed and dropped
//! from the registry only once both reach zero.
//!
//! The open file moves through a small state machine:
//!
//! ```text
//!   (absent) --open--> OpenShared{ro|rw} --destructive reopen--> OpenExclusive
//!                           |   ^
//!                           +---+ in-place reopen (ro -> rw, drop O_DIRECT)
//! ```
//!
//! An in-place reopen checks that the path still names the same device; a
//! destructive reopen first writes back and discards every cached block.

use crate::cache::IoManager;
use crate::engine::OpenMode;
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use voltk_common::{AccessFlags, Error, Result};

/// Registry key of an open device. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct DeviceId(u64);

/// What a path resolved to when it was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Identity {
    BlockDevice { rdev: u64 },
    Regular,
    Other,
}

impl Identity {
    pub fn of(file: &File) -> Result<Self> {
        let metadata = file.metadata()?;
        let file_type = metadata.file_type();
        Ok(if file_type.is_block_device() {
            Self::BlockDevice {
                rdev: metadata.rdev(),
            }
        } else if file_type.is_file() {
            Self::Regular
        } else {
            Self::Other
        })
    }

    /// True if a reopened file may stand in for one with identity `self`
    pub fn matches(self, reopened: Self) -> bool {
        match self {
            Self::BlockDevice { rdev } => reopened == Self::BlockDevice { rdev },
            Self::Regular => reopened == Self::Regular,
            Self::Other => true,
        }
    }

    pub const fn is_block_device(self) -> bool {
        matches!(self, Self::BlockDevice { .. })
    }
}

/// Internal state of an open device
#[derive(Debug)]
pub(crate) struct Device {
    pub path: PathBuf,
    /// `None` only between closing and reopening during an exclusive upgrade
    pub file: Option<Arc<File>>,
    /// Flags the descriptor was opened with
    pub access: AccessFlags,
    /// O_DIRECT in effect
    pub direct: bool,
    /// A partial write forced a buffered reopen; never go direct again
    pub needs_unaligned: bool,
    pub identity: Identity,
    /// Size in bytes as of the last query
    pub size: u64,
    pub holders: u32,
    /// A current holder asked for exclusive access
    pub exclusive_held: bool,
    pub blocks: u32,
    pub last_used: u64,
}

impl Device {
    pub fn file(&self) -> Result<&Arc<File>> {
        self.file.as_ref().ok_or_else(|| {
            Error::internal(format!("{} has no open descriptor", self.path.display()))
        })
    }
}

/// Path-indexed table of open devices
#[derive(Debug, Default)]
pub(crate) struct DeviceTable {
    devices: HashMap<DeviceId, Device>,
    by_path: HashMap<PathBuf, DeviceId>,
    next_id: u64,
}

impl DeviceTable {
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn lookup(&self, path: &Path) -> Option<DeviceId> {
        self.by_path.get(path).copied()
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(&id)
    }

    pub fn insert(&mut self, device: Device) -> DeviceId {
        let id = DeviceId(self.next_id);
        self.next_id += 1;
        self.by_path.insert(device.path.clone(), id);
        self.devices.insert(id, device);
        id
    }

    /// Drop the device if nothing holds it and no block belongs to it.
    /// The file closes once in-flight requests release their references.
    pub fn remove_if_unused(&mut self, id: DeviceId) -> bool {
        let unused = self
            .devices
            .get(&id)
            .is_some_and(|d| d.holders == 0 && d.blocks == 0);
        if unused && let Some(device) = self.devices.remove(&id) {
            self.by_path.remove(&device.path);
            debug!(path = %device.path.display(), "closed device");
        }
        unused
    }

    /// Unheld devices, least recently used first
    pub fn eviction_candidates(&self) -> Vec<DeviceId> {
        let mut candidates: Vec<(u64, DeviceId)> = self
            .devices
            .iter()
            .filter(|(_, d)| d.holders == 0)
            .map(|(id, d)| (d.last_used, *id))
            .collect();
        candidates.sort_unstable();
        candidates.into_iter().map(|(_, id)| id).collect()
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.devices.keys().copied().collect()
    }
}

/// A holder's claim on an open device.
///
/// Obtained from [`IoManager::acquire_device`] and returned with
/// [`IoManager::release_device`]. Dropping a handle without releasing it
/// leaks a holder count and is logged.
#[derive(Debug)]
pub struct DeviceHandle {
    pub(crate) id: DeviceId,
    pub(crate) access: AccessFlags,
    pub(crate) path: PathBuf,
    pub(crate) released: bool,
}

impl DeviceHandle {
    /// Path the device was acquired by
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Access this holder asked for
    pub const fn access(&self) -> AccessFlags {
        self.access
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if !self.released {
            error!(path = %self.path.display(), "device handle dropped without release");
        }
    }
}

impl IoManager {
    /// Acquire a handle on `path` with the given access.
    ///
    /// Shares an already open device when its mode is sufficient, otherwise
    /// upgrades it. Upgrades involving exclusivity discard the device's
    /// cached blocks and reopen it; a plain read-only to read-write upgrade
    /// reopens in place after checking the path still names the same device.
    pub fn acquire_device(
        &mut self,
        path: impl AsRef<Path>,
        access: AccessFlags,
    ) -> Result<DeviceHandle> {
        let path = path.as_ref();
        let id = match self.devices.lookup(path) {
            Some(id) => {
                self.acquire_existing(id, access)?;
                id
            }
            None => {
                self.make_room_for_device()?;
                self.open_device(path, access)?
            }
        };

        let clock = self.tick();
        if let Some(device) = self.devices.get_mut(id) {
            device.last_used = clock;
        }

        Ok(DeviceHandle {
            id,
            access,
            path: path.to_path_buf(),
            released: false,
        })
    }

    /// Give up a holder's claim. The device closes once nothing holds it and
    /// none of its blocks remain cached.
    pub fn release_device(&mut self, mut handle: DeviceHandle) {
        handle.released = true;
        let Some(device) = self.devices.get_mut(handle.id) else {
            error!(path = %handle.path.display(), "released a handle on a closed device");
            return;
        };
        if device.holders == 0 {
            error!(path = %handle.path.display(), "released a device that has no holders");
            return;
        }
        device.holders -= 1;
        if device.holders == 0 {
            device.exclusive_held = false;
        }
        self.devices.remove_if_unused(handle.id);
    }

    /// Size of the device in bytes
    pub fn device_size(&mut self, handle: &DeviceHandle) -> Result<u64> {
        self.refresh_size(handle.id)
    }

    /// Sector geometry of the device
    pub fn block_geometry(&self, handle: &DeviceHandle) -> Result<voltk_common::BlockGeometry> {
        let device = self.device(handle)?;
        self.engine.block_geometry(device.file()?)
    }

    /// Number of devices currently open
    pub fn open_devices(&self) -> usize {
        self.devices.len()
    }

    /// Resolve a handle to its device
    pub(crate) fn device(&self, handle: &DeviceHandle) -> Result<&Device> {
        self.devices
            .get(handle.id)
            .filter(|d| d.holders > 0)
            .ok_or_else(|| Error::StaleHandle(handle.path.display().to_string()))
    }

    /// Re-query the size of a device; regular files grow as they are written
    pub(crate) fn refresh_size(&mut self, id: DeviceId) -> Result<u64> {
        let device = self
            .devices
            .get(id)
            .ok_or_else(|| Error::internal("size of a closed device"))?;
        let size = self.engine.device_size(device.file()?)?;
        if let Some(device) = self.devices.get_mut(id) {
            device.size = size;
        }
        Ok(size)
    }

    fn acquire_existing(&mut self, id: DeviceId, access: AccessFlags) -> Result<()> {
        let device = self
            .devices
            .get_mut(id)
            .ok_or_else(|| Error::internal("registry lookup returned a closed device"))?;

        let others = device.holders;
        if others > 0 && (device.exclusive_held || access.exclusive) {
            return Err(Error::ExclusiveConflict {
                path: device.path.display().to_string(),
                holders: others,
            });
        }

        // Pin the device so invalidation cannot close it under us
        device.holders += 1;
        let needs_reopen = !device.access.satisfies(access);
        let destructive = device.access.exclusive || access.exclusive;

        let result = if !needs_reopen {
            Ok(())
        } else if others > 0 {
            Err(Error::UpgradeConflict {
                path: device.path.display().to_string(),
                holders: others,
            })
        } else if destructive {
            self.reopen_exclusive(id, access)
        } else {
            let direct = self.config.use_direct_io && !device.needs_unaligned;
            let access = device.access.union(access);
            self.reopen_in_place(id, access, direct)
        };

        match result {
            Ok(()) => {
                if let Some(device) = self.devices.get_mut(id) {
                    device.exclusive_held |= access.exclusive;
                }
                Ok(())
            }
            Err(e) => {
                self.unpin(id);
                Err(e)
            }
        }
    }

    fn unpin(&mut self, id: DeviceId) {
        if let Some(device) = self.devices.get_mut(id) {
            device.holders = device.holders.saturating_sub(1);
        }
        self.devices.remove_if_unused(id);
    }

    /// Write back and drop every cached block of the device, close it, then
    /// reopen it with the combined flags.
    ///
    /// The old descriptor is closed first: a block device already held with
    /// O_EXCL refuses a second O_EXCL open with EBUSY. If the reopen fails
    /// the device is left without a descriptor and closes once unpinned.
    fn reopen_exclusive(&mut self, id: DeviceId, access: AccessFlags) -> Result<()> {
        self.invalidate_device_id(id)?;
        self.drain()?;

        let device = self
            .devices
            .get_mut(id)
            .ok_or_else(|| Error::internal("device closed during upgrade"))?;
        let access = device.access.union(access);
        let direct = self.config.use_direct_io && !device.needs_unaligned;
        let path = device.path.clone();
        if let Some(old) = device.file.take()
            && Arc::strong_count(&old) > 1
        {
            warn!(path = %path.display(), "descriptor still referenced while reopening");
        }

        let opened = self.engine.open(&path, OpenMode { access, direct })?;
        let identity = Identity::of(&opened.file)?;
        let size = self.engine.device_size(&opened.file)?;

        if let Some(device) = self.devices.get_mut(id) {
            device.file = Some(Arc::new(opened.file));
            device.access = access;
            device.direct = opened.direct;
            device.identity = identity;
            device.size = size;
        }
        info!(path = %path.display(), ?access, "reopened device");
        Ok(())
    }

    /// Replace the device's descriptor without touching its cached blocks.
    ///
    /// Fails with [`Error::DeviceChanged`] if the path now names a different
    /// device, in which case the old descriptor stays in use.
    pub(crate) fn reopen_in_place(
        &mut self,
        id: DeviceId,
        access: AccessFlags,
        direct: bool,
    ) -> Result<()> {
        let device = self
            .devices
            .get(id)
            .ok_or_else(|| Error::internal("reopen of a closed device"))?;
        let path = device.path.clone();
        let expected = device.identity;

        let opened = self.engine.open(&path, OpenMode { access, direct })?;
        let identity = Identity::of(&opened.file)?;
        if !expected.matches(identity) {
            warn!(path = %path.display(), ?expected, found = ?identity, "device changed under reopen");
            return Err(Error::DeviceChanged {
                path: path.display().to_string(),
            });
        }

        if let Some(device) = self.devices.get_mut(id) {
            device.file = Some(Arc::new(opened.file));
            device.access = access;
            device.direct = opened.direct;
        }
        debug!(path = %path.display(), ?access, direct = opened.direct, "reopened device in place");
        Ok(())
    }

    fn open_device(&mut self, path: &Path, access: AccessFlags) -> Result<DeviceId> {
        let direct = self.config.use_direct_io;
        let opened = self.engine.open(path, OpenMode { access, direct })?;
        let identity = Identity::of(&opened.file)?;
        let size = self.engine.device_size(&opened.file)?;

        let id = self.devices.insert(Device {
            path: path.to_path_buf(),
            file: Some(Arc::new(opened.file)),
            access,
            direct: opened.direct,
            needs_unaligned: false,
            identity,
            size,
            holders: 1,
            exclusive_held: access.exclusive,
            blocks: 0,
            last_used: 0,
        });
        debug!(path = %path.display(), ?access, direct = opened.direct, size, "opened device");
        Ok(id)
    }

    /// Evict the least recently used unheld device if the cap is reached
    fn make_room_for_device(&mut self) -> Result<()> {
        let cap = self.config.max_open_devices;
        if self.devices.len() < cap {
            return Ok(());
        }

        for id in self.devices.eviction_candidates() {
            let path = self.devices.get(id).map(|d| d.path.clone());
            match self.invalidate_device_id(id) {
                Ok(()) => {
                    self.stats.device_evictions += 1;
                    debug!(path = ?path, "evicted device");
                    if self.devices.len() < cap {
                        return Ok(());
                    }
                }
                Err(e) => warn!(path = ?path, "cannot evict device: {e}"),
            }
        }
        Err(Error::NoEvictableDevice { cap })
    }
}
