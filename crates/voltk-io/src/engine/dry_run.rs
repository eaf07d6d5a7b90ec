//! Engine wrapper that discards writes

use super::{IoCompletion, IoDirection, IoEngine, IoRequest, OpenMode, OpenedFile};
use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;
use tracing::trace;
use voltk_common::{BlockGeometry, Result};

/// Wraps an engine so reads go to the device and writes are reported as
/// completed without being issued. Used for validation runs that must not
/// modify anything.
#[derive(Debug)]
pub struct DryRunEngine<E> {
    inner: E,
    discarded: VecDeque<IoCompletion>,
    writes_discarded: u64,
}

impl<E: IoEngine> DryRunEngine<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            discarded: VecDeque::new(),
            writes_discarded: 0,
        }
    }

    /// Number of writes dropped so far
    pub const fn writes_discarded(&self) -> u64 {
        self.writes_discarded
    }
}

impl<E: IoEngine> IoEngine for DryRunEngine<E> {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    fn open(&mut self, path: &Path, mode: OpenMode) -> Result<OpenedFile> {
        self.inner.open(path, mode)
    }

    fn issue(&mut self, request: IoRequest) -> std::result::Result<(), IoCompletion> {
        match request.direction {
            IoDirection::Read => self.inner.issue(request),
            IoDirection::Write => {
                trace!(sectors = ?request.sectors, "discarding write");
                self.writes_discarded += 1;
                self.discarded.push_back(request.complete(Ok(())));
                Ok(())
            }
        }
    }

    fn wait(&mut self) -> Result<Vec<IoCompletion>> {
        // Discarded writes are already complete; only block on the inner
        // engine when there is nothing else to report.
        if !self.discarded.is_empty() {
            return Ok(self.discarded.drain(..).collect());
        }
        self.inner.wait()
    }

    fn in_flight(&self) -> usize {
        self.inner.in_flight() + self.discarded.len()
    }

    fn max_concurrent_io(&self) -> usize {
        self.inner.max_concurrent_io()
    }

    fn device_size(&self, file: &File) -> Result<u64> {
        self.inner.device_size(file)
    }

    fn block_geometry(&self, file: &File) -> Result<BlockGeometry> {
        self.inner.block_geometry(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AlignedBuffer;
    use crate::engine::{IoToken, SyncEngine};
    use std::os::unix::fs::FileExt;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    #[test]
    fn test_writes_never_reach_the_file() {
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().write_all_at(&[0x11; 4096], 0).unwrap();
        let file = Arc::new(temp.reopen().unwrap());
        let mut engine = DryRunEngine::new(SyncEngine::new(8));

        let mut buf = AlignedBuffer::new(4096);
        buf.fill(0xFF);
        engine
            .issue(IoRequest {
                direction: IoDirection::Write,
                file: Arc::clone(&file),
                sectors: 0..8,
                buf,
                buf_offset: 0,
                token: IoToken(1),
            })
            .unwrap();
        let done = engine.wait().unwrap();
        assert!(done[0].result.is_ok());
        assert_eq!(engine.writes_discarded(), 1);

        // Reads still hit the device
        engine
            .issue(IoRequest {
                direction: IoDirection::Read,
                file,
                sectors: 0..8,
                buf: AlignedBuffer::new(4096),
                buf_offset: 0,
                token: IoToken(2),
            })
            .unwrap();
        let done = engine.wait().unwrap();
        assert!(done[0].buf.iter().all(|b| *b == 0x11));
    }
}
