//! Synchronous pread/pwrite engine

use super::{IoCompletion, IoEngine, IoRequest, perform};
use std::collections::VecDeque;
use voltk_common::Result;

/// Standard `pread`/`pwrite` I/O engine.
///
/// Each request is performed inside [`issue`](IoEngine::issue); its result
/// is queued and handed out by the next [`wait`](IoEngine::wait). Simple and
/// portable, but cannot overlap operations.
#[derive(Debug)]
pub struct SyncEngine {
    completed: VecDeque<IoCompletion>,
    max_io: usize,
}

impl SyncEngine {
    pub fn new(max_io: usize) -> Self {
        Self {
            completed: VecDeque::new(),
            max_io: max_io.max(1),
        }
    }
}

impl IoEngine for SyncEngine {
    fn name(&self) -> &'static str {
        "sync"
    }

    fn issue(&mut self, mut request: IoRequest) -> std::result::Result<(), IoCompletion> {
        if self.completed.len() >= self.max_io {
            return Err(request.complete(Err(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "engine at max concurrent I/O",
            ))));
        }
        let result = perform(&mut request);
        self.completed.push_back(request.complete(result));
        Ok(())
    }

    fn wait(&mut self) -> Result<Vec<IoCompletion>> {
        Ok(self.completed.drain(..).collect())
    }

    fn in_flight(&self) -> usize {
        self.completed.len()
    }

    fn max_concurrent_io(&self) -> usize {
        self.max_io
    }
}
