//! Pluggable I/O engines
//!
//! An engine performs raw sector-range transfers against open files and
//! reports their completions. Submission never blocks; [`IoEngine::wait`]
//! is the only call that suspends the caller, and it returns once at least
//! one previously issued request has completed.
//!
//! - [`SyncEngine`]: every request is performed inline with `pread`/`pwrite`
//!   and its completion is queued for the next `wait`.
//! - `AioEngine` (Linux): requests go through io_uring; requests whose buffer
//!   or offset is not page-aligned are performed inline instead, since
//!   O_DIRECT transfers require alignment.
//! - [`DryRunEngine`]: wraps another engine and discards writes, reporting
//!   them as completed without touching the device.
//!
//! Requests own their buffer and a reference to their file while in flight,
//! so neither can be freed or closed under the kernel.

#[cfg(target_os = "linux")]
mod aio;
mod dry_run;
mod sync;

#[cfg(target_os = "linux")]
pub use aio::AioEngine;
pub use dry_run::DryRunEngine;
pub use sync::SyncEngine;

use crate::buffer::AlignedBuffer;
use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::os::unix::fs::{FileExt, FileTypeExt, OpenOptionsExt};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use voltk_common::{
    AccessFlags, BlockGeometry, EngineKind, Error, IoConfig, Result, SECTOR_SIZE, sectors_to_bytes,
};

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoDirection {
    Read,
    Write,
}

impl std::fmt::Display for IoDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Opaque value returned with a request's completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoToken(pub u64);

/// How a file should be opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub access: AccessFlags,
    /// Request O_DIRECT (F_NOCACHE on macOS)
    pub direct: bool,
}

/// A file opened by an engine
#[derive(Debug)]
pub struct OpenedFile {
    pub file: File,
    /// Whether direct I/O is actually in effect
    pub direct: bool,
}

/// A single sector-range transfer.
///
/// The buffer bytes `buf_offset..buf_offset + len()` are read into or written
/// from device sectors `sectors`.
#[derive(Debug)]
pub struct IoRequest {
    pub direction: IoDirection,
    pub file: Arc<File>,
    pub sectors: Range<u64>,
    pub buf: AlignedBuffer,
    pub buf_offset: usize,
    pub token: IoToken,
}

impl IoRequest {
    /// Byte offset on the device
    pub const fn offset(&self) -> u64 {
        sectors_to_bytes(self.sectors.start)
    }

    /// Transfer length in bytes
    pub const fn len(&self) -> usize {
        sectors_to_bytes(self.sectors.end - self.sectors.start) as usize
    }

    /// True for an empty transfer
    pub const fn is_empty(&self) -> bool {
        self.sectors.end <= self.sectors.start
    }

    /// Byte range of the buffer taking part in the transfer
    pub const fn buf_range(&self) -> Range<usize> {
        self.buf_offset..self.buf_offset + self.len()
    }

    /// Turn the request into its completion, handing the buffer back
    pub fn complete(self, result: std::io::Result<()>) -> IoCompletion {
        IoCompletion {
            token: self.token,
            direction: self.direction,
            buf: self.buf,
            result,
        }
    }
}

/// Outcome of a request, carrying its buffer back to the issuer
#[derive(Debug)]
pub struct IoCompletion {
    pub token: IoToken,
    pub direction: IoDirection,
    pub buf: AlignedBuffer,
    pub result: std::io::Result<()>,
}

/// Pluggable I/O engine interface.
pub trait IoEngine: Send {
    /// Engine name for diagnostics.
    fn name(&self) -> &'static str;

    /// Open `path` for use with this engine.
    fn open(&mut self, path: &Path, mode: OpenMode) -> Result<OpenedFile> {
        open_file(path, mode)
    }

    /// Submit a request without blocking.
    ///
    /// On rejection the request comes straight back as a failed completion;
    /// no completion for it will be reported by [`wait`](Self::wait).
    #[allow(clippy::result_large_err)]
    fn issue(&mut self, request: IoRequest) -> std::result::Result<(), IoCompletion>;

    /// Block until at least one issued request completes, then return every
    /// completion available. Returns an empty list if nothing is in flight.
    fn wait(&mut self) -> Result<Vec<IoCompletion>>;

    /// Requests issued whose completion has not yet been returned by `wait`.
    fn in_flight(&self) -> usize;

    /// Maximum number of requests the engine accepts at once.
    fn max_concurrent_io(&self) -> usize;

    /// Size of an open device or file in bytes.
    fn device_size(&self, file: &File) -> Result<u64> {
        device_size(file)
    }

    /// Sector geometry of an open device.
    fn block_geometry(&self, file: &File) -> Result<BlockGeometry> {
        block_geometry(file)
    }
}

impl<E: IoEngine + ?Sized> IoEngine for Box<E> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn open(&mut self, path: &Path, mode: OpenMode) -> Result<OpenedFile> {
        (**self).open(path, mode)
    }

    fn issue(&mut self, request: IoRequest) -> std::result::Result<(), IoCompletion> {
        (**self).issue(request)
    }

    fn wait(&mut self) -> Result<Vec<IoCompletion>> {
        (**self).wait()
    }

    fn in_flight(&self) -> usize {
        (**self).in_flight()
    }

    fn max_concurrent_io(&self) -> usize {
        (**self).max_concurrent_io()
    }

    fn device_size(&self, file: &File) -> Result<u64> {
        (**self).device_size(file)
    }

    fn block_geometry(&self, file: &File) -> Result<BlockGeometry> {
        (**self).block_geometry(file)
    }
}

/// Build the engine selected by `config`.
///
/// If the kernel refuses to create an io_uring instance the synchronous
/// engine is used instead.
pub fn create_engine(config: &IoConfig) -> Result<Box<dyn IoEngine>> {
    let engine: Box<dyn IoEngine> = match config.engine {
        #[cfg(target_os = "linux")]
        EngineKind::Async => match AioEngine::new(config.max_concurrent_io) {
            Ok(engine) => Box::new(engine),
            Err(e) => {
                warn!("async engine unavailable ({e}), falling back to synchronous I/O");
                Box::new(SyncEngine::new(config.max_concurrent_io))
            }
        },
        #[cfg(not(target_os = "linux"))]
        EngineKind::Async => {
            warn!("async engine requires Linux, falling back to synchronous I/O");
            Box::new(SyncEngine::new(config.max_concurrent_io))
        }
        EngineKind::Sync => Box::new(SyncEngine::new(config.max_concurrent_io)),
    };

    if config.dry_run {
        return Ok(Box::new(DryRunEngine::new(engine)));
    }
    Ok(engine)
}

/// Perform a request inline. Shared by the synchronous engine and the
/// async engine's misaligned fallback.
pub(crate) fn perform(request: &mut IoRequest) -> std::io::Result<()> {
    let offset = request.offset();
    let range = request.buf_range();
    match request.direction {
        IoDirection::Read => request
            .file
            .read_exact_at(&mut request.buf.as_mut_slice()[range], offset),
        IoDirection::Write => request
            .file
            .write_all_at(&request.buf.as_slice()[range], offset),
    }
}

/// Check if path is a block device
fn is_block_device(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

/// Open a file with POSIX semantics for `mode`.
///
/// `O_EXCL` is only passed for block devices, where it means "fail if the
/// device is in use". If the filesystem rejects `O_DIRECT` (tmpfs) the file
/// is reopened without it and reported as non-direct.
pub fn open_file(path: &Path, mode: OpenMode) -> Result<OpenedFile> {
    let is_block = is_block_device(path);

    let mut flags = 0;
    if mode.access.exclusive && is_block {
        flags |= libc::O_EXCL;
    }

    let open = |flags: i32| {
        let mut options = OpenOptions::new();
        options.read(true).write(mode.access.write).custom_flags(flags);
        options.open(path)
    };

    #[cfg(target_os = "linux")]
    if mode.direct {
        match open(flags | libc::O_DIRECT) {
            Ok(file) => return Ok(OpenedFile { file, direct: true }),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                debug!(path = %path.display(), "O_DIRECT not supported, opening buffered");
            }
            Err(source) => {
                return Err(Error::Open {
                    path: path.display().to_string(),
                    source,
                });
            }
        }
    }

    let file = open(flags).map_err(|source| Error::Open {
        path: path.display().to_string(),
        source,
    })?;

    // On macOS, use F_NOCACHE after opening
    #[cfg(target_os = "macos")]
    if mode.direct {
        use std::os::unix::io::AsRawFd;
        // SAFETY: fcntl on a descriptor we own.
        if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) } != -1 {
            return Ok(OpenedFile { file, direct: true });
        }
    }

    Ok(OpenedFile {
        file,
        direct: false,
    })
}

/// Switch an open descriptor to buffered I/O without reopening it
#[cfg(target_os = "linux")]
pub fn clear_direct(file: &File) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    // SAFETY: fcntl on a descriptor we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: as above; only O_DIRECT changes.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_DIRECT) } == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(target_os = "macos")]
pub fn clear_direct(file: &File) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: fcntl on a descriptor we own.
    if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 0) } == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn clear_direct(_file: &File) -> Result<()> {
    Ok(())
}

/// Get the size of a device or regular file
pub fn device_size(file: &File) -> Result<u64> {
    let metadata = file.metadata()?;
    if metadata.file_type().is_block_device() {
        block_device_size(file)
    } else {
        Ok(metadata.len())
    }
}

/// Get block device size using ioctl
#[cfg(target_os = "linux")]
fn block_device_size(file: &File) -> Result<u64> {
    use std::os::unix::io::AsRawFd;

    // BLKGETSIZE64 ioctl
    const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

    let mut size: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes one u64 through the pointer.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
    if ret == -1 {
        return Err(Error::DiskIo(std::io::Error::last_os_error()));
    }
    Ok(size)
}

/// Get block device size (non-Linux fallback)
#[cfg(not(target_os = "linux"))]
fn block_device_size(file: &File) -> Result<u64> {
    use std::io::{Seek, SeekFrom};
    let mut f = file;
    let size = f.seek(SeekFrom::End(0))?;
    f.seek(SeekFrom::Start(0))?;
    Ok(size)
}

/// Get the logical/physical sector sizes of a device.
///
/// Regular files report 512-byte sectors and their filesystem block size.
pub fn block_geometry(file: &File) -> Result<BlockGeometry> {
    use std::os::unix::fs::MetadataExt;

    let metadata = file.metadata()?;
    if !metadata.file_type().is_block_device() {
        return Ok(BlockGeometry {
            logical_sector_size: SECTOR_SIZE as u32,
            physical_block_size: u32::try_from(metadata.blksize()).unwrap_or(SECTOR_SIZE as u32),
        });
    }
    block_device_geometry(file)
}

#[cfg(target_os = "linux")]
fn block_device_geometry(file: &File) -> Result<BlockGeometry> {
    use std::os::unix::io::AsRawFd;

    const BLKSSZGET: libc::c_ulong = 0x1268;
    const BLKPBSZGET: libc::c_ulong = 0x127b;

    let fd = file.as_raw_fd();
    let mut logical: libc::c_int = 0;
    let mut physical: libc::c_uint = 0;
    // SAFETY: both ioctls write one integer through the pointer.
    unsafe {
        if libc::ioctl(fd, BLKSSZGET, &mut logical) == -1 {
            return Err(Error::DiskIo(std::io::Error::last_os_error()));
        }
        if libc::ioctl(fd, BLKPBSZGET, &mut physical) == -1 {
            return Err(Error::DiskIo(std::io::Error::last_os_error()));
        }
    }
    Ok(BlockGeometry {
        logical_sector_size: u32::try_from(logical).unwrap_or(SECTOR_SIZE as u32),
        physical_block_size: physical,
    })
}

#[cfg(not(target_os = "linux"))]
fn block_device_geometry(_file: &File) -> Result<BlockGeometry> {
    Ok(BlockGeometry::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn scratch(len: usize) -> NamedTempFile {
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().set_len(len as u64).unwrap();
        temp
    }

    #[test]
    fn test_open_modes() {
        let temp = scratch(8192);
        let ro = open_file(
            temp.path(),
            OpenMode {
                access: AccessFlags::READ,
                direct: false,
            },
        )
        .unwrap();
        assert!(!ro.direct);
        assert!(ro.file.write_at(b"x", 0).is_err());

        let rw = open_file(
            temp.path(),
            OpenMode {
                access: AccessFlags::WRITE,
                direct: true,
            },
        )
        .unwrap();
        // Either O_DIRECT took, or the filesystem refused it and we fell back
        let mut buf = AlignedBuffer::new(4096);
        rw.file.read_exact_at(&mut buf, 0).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_clear_direct_keeps_descriptor() {
        use std::os::unix::io::AsRawFd;

        // tmpfs refuses O_DIRECT; the build tree usually sits on a disk
        let temp = NamedTempFile::new_in(env!("CARGO_MANIFEST_DIR")).unwrap();
        temp.as_file().set_len(8192).unwrap();
        let opened = open_file(
            temp.path(),
            OpenMode {
                access: AccessFlags::WRITE,
                direct: true,
            },
        )
        .unwrap();
        if !opened.direct {
            eprintln!("skipping: O_DIRECT unsupported here");
            return;
        }
        let fd = opened.file.as_raw_fd();

        clear_direct(&opened.file).unwrap();
        // SAFETY: fcntl on a descriptor the test owns.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert_eq!(flags & libc::O_DIRECT, 0);

        // Unaligned transfers now go through the page cache
        opened.file.write_all_at(b"LABELONE", 512 + 3).unwrap();
        let mut check = [0u8; 8];
        opened.file.read_exact_at(&mut check, 512 + 3).unwrap();
        assert_eq!(&check, b"LABELONE");
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_file(
            &dir.path().join("missing"),
            OpenMode {
                access: AccessFlags::READ,
                direct: false,
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Open { .. }));
    }

    #[test]
    fn test_regular_file_size_and_geometry() {
        let temp = scratch(3 * 4096);
        assert_eq!(device_size(temp.as_file()).unwrap(), 3 * 4096);
        let geometry = block_geometry(temp.as_file()).unwrap();
        assert_eq!(geometry.logical_sector_size, 512);
        assert!(geometry.physical_block_size >= 512);
    }

    #[test]
    fn test_request_ranges() {
        let temp = scratch(8192);
        let request = IoRequest {
            direction: IoDirection::Write,
            file: Arc::new(temp.reopen().unwrap()),
            sectors: 10..13,
            buf: AlignedBuffer::new(4096),
            buf_offset: 1024,
            token: IoToken(7),
        };
        assert_eq!(request.offset(), 5120);
        assert_eq!(request.len(), 1536);
        assert_eq!(request.buf_range(), 1024..2560);

        let done = request.complete(Ok(()));
        assert_eq!(done.token, IoToken(7));
        assert_eq!(done.direction, IoDirection::Write);
    }

    #[test]
    fn test_create_sync_engine() {
        let config = IoConfig {
            engine: EngineKind::Sync,
            max_concurrent_io: 8,
            ..IoConfig::default()
        };
        let engine = create_engine(&config).unwrap();
        assert_eq!(engine.name(), "sync");
        assert_eq!(engine.max_concurrent_io(), 8);

        let dry = create_engine(&IoConfig {
            dry_run: true,
            ..config
        })
        .unwrap();
        assert_eq!(dry.name(), "dry-run");
    }
}
