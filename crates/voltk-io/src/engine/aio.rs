//! Native asynchronous engine on io_uring
//!
//! Aligned requests are pushed to the submission queue and submitted at
//! once; [`wait`](IoEngine::wait) blocks in `io_uring_enter` until at least
//! one completion arrives. Requests whose buffer address, offset or length
//! are not page-aligned cannot go through O_DIRECT, so they are performed
//! inline and queued as already complete.
//!
//! A completion that moved fewer bytes than asked for is resumed from where
//! it stopped: through the ring again when the remainder is still aligned,
//! inline otherwise. Only a completion that moves nothing ends a transfer
//! early.

use super::{IoCompletion, IoDirection, IoEngine, IoRequest, perform};
use crate::buffer::page_size;
use io_uring::{IoUring, opcode, types};
use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use tracing::{debug, error, warn};
use voltk_common::{Error, Result};

/// Largest ring we ask the kernel for
const MAX_RING_ENTRIES: usize = 4096;

/// A submitted request and how far it has got
struct InFlight {
    request: IoRequest,
    /// Bytes already transferred
    done: usize,
}

pub struct AioEngine {
    ring: IoUring,
    /// Submitted requests by user_data; owning them keeps buffers and fds alive
    in_flight: HashMap<u64, InFlight>,
    /// Completions reaped or performed inline, not yet returned by `wait`
    ready: VecDeque<IoCompletion>,
    next_id: u64,
    max_io: usize,
    alignment: usize,
}

impl std::fmt::Debug for AioEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AioEngine")
            .field("in_flight", &self.in_flight.len())
            .field("ready", &self.ready.len())
            .field("max_io", &self.max_io)
            .finish_non_exhaustive()
    }
}

impl AioEngine {
    pub fn new(max_io: usize) -> Result<Self> {
        let max_io = max_io.clamp(1, MAX_RING_ENTRIES);
        let entries = u32::try_from(max_io.next_power_of_two()).unwrap_or(4096);
        let ring = IoUring::new(entries).map_err(|e| {
            Error::configuration(format!("cannot create io_uring with {entries} entries: {e}"))
        })?;

        Ok(Self {
            ring,
            in_flight: HashMap::new(),
            ready: VecDeque::new(),
            next_id: 0,
            max_io,
            alignment: page_size(),
        })
    }

    fn is_aligned(&self, request: &IoRequest) -> bool {
        request.offset() % self.alignment as u64 == 0
            && request
                .buf
                .is_range_aligned(&request.buf_range(), self.alignment)
    }

    /// Submit queued SQEs, retrying on `EINTR`. Other failures leave the
    /// entries queued; `wait` submits them again.
    fn submit(&mut self) {
        loop {
            match self.ring.submit() {
                Ok(_) => return,
                Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => {}
                Err(e) => {
                    warn!("io_uring submit failed: {e}");
                    return;
                }
            }
        }
    }

    /// Queue an SQE moving `range` of the request's buffer at byte `offset`.
    /// Returns false if the submission queue is full.
    fn push(
        &mut self,
        id: u64,
        request: &mut IoRequest,
        offset: u64,
        range: Range<usize>,
    ) -> bool {
        let Ok(len) = u32::try_from(range.len()) else {
            return false;
        };
        let fd = types::Fd(request.file.as_raw_fd());
        let entry = match request.direction {
            IoDirection::Read => {
                let ptr = request.buf.as_mut_slice()[range].as_mut_ptr();
                opcode::Read::new(fd, ptr, len).offset(offset).build()
            }
            IoDirection::Write => {
                let ptr = request.buf.as_slice()[range].as_ptr();
                opcode::Write::new(fd, ptr, len).offset(offset).build()
            }
        }
        .user_data(id);

        // SAFETY: the buffer and the file are owned by `request`, which the
        // caller keeps in `in_flight` until its CQE is reaped. The allocation
        // never moves.
        unsafe { self.ring.submission().push(&entry).is_ok() }
    }

    /// Continue a transfer that stopped short
    fn resume(&mut self, id: u64, mut pending: InFlight) {
        let request = &mut pending.request;
        let offset = request.offset() + pending.done as u64;
        let range = request.buf_offset + pending.done..request.buf_range().end;
        debug!(
            direction = %request.direction,
            done = pending.done,
            left = range.len(),
            "short transfer, resuming"
        );

        if offset % self.alignment as u64 == 0
            && request.buf.is_range_aligned(&range, self.alignment)
            && self.push(id, request, offset, range.clone())
        {
            self.in_flight.insert(id, pending);
            return;
        }

        let result = match request.direction {
            IoDirection::Read => request
                .file
                .read_exact_at(&mut request.buf.as_mut_slice()[range], offset),
            IoDirection::Write => request.file.write_all_at(&request.buf.as_slice()[range], offset),
        };
        self.ready.push_back(pending.request.complete(result));
    }

    /// Move every available CQE onto the ready queue, resuming short ones
    fn reap(&mut self) {
        let cqes: Vec<(u64, i32)> = self
            .ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();

        let mut resubmitted = false;
        for (id, res) in cqes {
            let Some(mut pending) = self.in_flight.remove(&id) else {
                warn!(id, "completion for unknown io_uring request");
                continue;
            };
            let expected = pending.request.len();
            let n = match usize::try_from(res) {
                Ok(n) => n,
                Err(_) => {
                    let result = Err(std::io::Error::from_raw_os_error(-res));
                    self.ready.push_back(pending.request.complete(result));
                    continue;
                }
            };
            pending.done += n;

            if pending.done >= expected {
                self.ready.push_back(pending.request.complete(Ok(())));
            } else if n == 0 {
                let kind = match pending.request.direction {
                    IoDirection::Read => std::io::ErrorKind::UnexpectedEof,
                    IoDirection::Write => std::io::ErrorKind::WriteZero,
                };
                let result = Err(std::io::Error::new(
                    kind,
                    format!(
                        "short {}: {} of {expected} bytes",
                        pending.request.direction, pending.done
                    ),
                ));
                self.ready.push_back(pending.request.complete(result));
            } else {
                self.resume(id, pending);
                resubmitted = true;
            }
        }
        if resubmitted {
            self.submit();
        }
    }

    /// Block until every submitted request has completed
    fn drain(&mut self) {
        while !self.in_flight.is_empty() {
            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => {
                    // The kernel may still write into the buffers we own
                    error!(
                        in_flight = self.in_flight.len(),
                        "io_uring wait failed with transfers outstanding, aborting: {e}"
                    );
                    std::process::abort();
                }
            }
            self.reap();
        }
    }
}

impl IoEngine for AioEngine {
    fn name(&self) -> &'static str {
        "async"
    }

    fn issue(&mut self, mut request: IoRequest) -> std::result::Result<(), IoCompletion> {
        if self.in_flight() >= self.max_io {
            return Err(request.complete(Err(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "engine at max concurrent I/O",
            ))));
        }

        if !self.is_aligned(&request) {
            debug!(
                direction = %request.direction,
                sectors = ?request.sectors,
                "misaligned request, performing synchronously"
            );
            let result = perform(&mut request);
            self.ready.push_back(request.complete(result));
            return Ok(());
        }

        if u32::try_from(request.len()).is_err() {
            return Err(request.complete(Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "request too large for io_uring",
            ))));
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let offset = request.offset();
        let range = request.buf_range();
        if !self.push(id, &mut request, offset, range) {
            return Err(request.complete(Err(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "io_uring submission queue is full",
            ))));
        }

        self.in_flight.insert(id, InFlight { request, done: 0 });
        self.submit();
        Ok(())
    }

    fn wait(&mut self) -> Result<Vec<IoCompletion>> {
        self.reap();
        // A reaped CQE may only have resubmitted the rest of its transfer
        while self.ready.is_empty() && !self.in_flight.is_empty() {
            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(Error::DiskIo(e)),
            }
            self.reap();
        }
        Ok(self.ready.drain(..).collect())
    }

    fn in_flight(&self) -> usize {
        self.in_flight.len() + self.ready.len()
    }

    fn max_concurrent_io(&self) -> usize {
        self.max_io
    }
}

impl Drop for AioEngine {
    fn drop(&mut self) {
        // Buffers must outlive every transfer the kernel still holds
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AlignedBuffer;
    use crate::engine::{IoToken, OpenMode};
    use std::os::unix::fs::FileExt;
    use std::sync::Arc;
    use tempfile::NamedTempFile;
    use voltk_common::AccessFlags;

    fn engine() -> Option<AioEngine> {
        // Sandboxes commonly forbid io_uring; nothing to test there
        AioEngine::new(8).ok()
    }

    fn open(temp: &NamedTempFile) -> Arc<std::fs::File> {
        let opened = crate::engine::open_file(
            temp.path(),
            OpenMode {
                access: AccessFlags::WRITE,
                direct: true,
            },
        )
        .unwrap();
        Arc::new(opened.file)
    }

    #[test]
    fn test_aligned_roundtrip() {
        let Some(mut engine) = engine() else { return };
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().set_len(16384).unwrap();
        let file = open(&temp);

        let mut buf = AlignedBuffer::new(8192);
        buf.fill(0x42);
        engine
            .issue(IoRequest {
                direction: IoDirection::Write,
                file: Arc::clone(&file),
                sectors: 8..24,
                buf,
                buf_offset: 0,
                token: IoToken(1),
            })
            .unwrap();

        let mut done = Vec::new();
        while done.is_empty() {
            done = engine.wait().unwrap();
        }
        assert_eq!(done[0].token, IoToken(1));
        assert!(done[0].result.is_ok(), "{:?}", done[0].result);

        let mut check = vec![0u8; 8192];
        temp.as_file().read_exact_at(&mut check, 4096).unwrap();
        assert!(check.iter().all(|b| *b == 0x42));
    }

    #[test]
    fn test_misaligned_request_falls_back() {
        let Some(mut engine) = engine() else { return };
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().write_all_at(&[0x77; 4096], 0).unwrap();
        let file = Arc::new(temp.reopen().unwrap());

        // One sector at a 512-byte offset is never page-aligned
        engine
            .issue(IoRequest {
                direction: IoDirection::Read,
                file,
                sectors: 1..2,
                buf: AlignedBuffer::new(4096),
                buf_offset: 512,
                token: IoToken(3),
            })
            .unwrap();
        assert_eq!(engine.in_flight(), 1);

        let done = engine.wait().unwrap();
        assert_eq!(done.len(), 1);
        assert!(done[0].result.is_ok());
        assert!(done[0].buf[512..1024].iter().all(|b| *b == 0x77));
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn test_many_reads_overlap() {
        let Some(mut engine) = engine() else { return };
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().set_len(8 * 4096).unwrap();
        let file = Arc::new(temp.reopen().unwrap());

        for i in 0..8u64 {
            engine
                .issue(IoRequest {
                    direction: IoDirection::Read,
                    file: Arc::clone(&file),
                    sectors: i * 8..(i + 1) * 8,
                    buf: AlignedBuffer::new(4096),
                    buf_offset: 0,
                    token: IoToken(i),
                })
                .unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 8 {
            for done in engine.wait().unwrap() {
                assert!(done.result.is_ok());
                seen.push(done.token.0);
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    fn read_all(engine: &mut AioEngine, request: IoRequest) -> IoCompletion {
        engine.issue(request).unwrap();
        loop {
            if let Some(done) = engine.wait().unwrap().pop() {
                return done;
            }
        }
    }

    #[test]
    fn test_short_read_finishes_remainder_inline() {
        let Some(mut engine) = engine() else { return };
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().write_all_at(&[0x5a; 6000], 0).unwrap();
        let file = Arc::new(temp.reopen().unwrap());

        // The ring stops at end of file; the unaligned rest goes inline
        let done = read_all(
            &mut engine,
            IoRequest {
                direction: IoDirection::Read,
                file,
                sectors: 0..16,
                buf: AlignedBuffer::new(8192),
                buf_offset: 0,
                token: IoToken(9),
            },
        );
        let err = done.result.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
        assert!(done.buf[..6000].iter().all(|b| *b == 0x5a));
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn test_short_read_resubmits_aligned_remainder() {
        let Some(mut engine) = engine() else { return };
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().write_all_at(&[0x6b; 4096], 0).unwrap();
        let file = Arc::new(temp.reopen().unwrap());

        // The second half is retried through the ring and comes back empty
        let done = read_all(
            &mut engine,
            IoRequest {
                direction: IoDirection::Read,
                file,
                sectors: 0..16,
                buf: AlignedBuffer::new(8192),
                buf_offset: 0,
                token: IoToken(10),
            },
        );
        let err = done.result.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
        assert!(done.buf[..4096].iter().all(|b| *b == 0x6b));
        assert!(done.buf[4096..].iter().all(|b| *b == 0));
        assert_eq!(engine.in_flight(), 0);
    }
}
