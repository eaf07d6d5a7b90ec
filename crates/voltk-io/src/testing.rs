//! Fault injection for cache tests

use crate::engine::{IoCompletion, IoDirection, IoEngine, IoRequest, OpenMode, OpenedFile};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::File;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use voltk_common::{BlockGeometry, Result};

/// Which requests a [`FaultyEngine`] fails
#[derive(Debug, Default)]
pub struct FaultPlan {
    /// Writes touching any of these sectors complete with EIO
    pub fail_writes: Vec<Range<u64>>,
    /// Reads touching any of these sectors complete with EIO
    pub fail_reads: Vec<Range<u64>>,
    /// Reject every submission
    pub reject_all: bool,
    /// Requests seen, failed or not
    pub reads: u64,
    pub writes: u64,
}

impl FaultPlan {
    fn fails(&self, request: &IoRequest) -> bool {
        let ranges = match request.direction {
            IoDirection::Read => &self.fail_reads,
            IoDirection::Write => &self.fail_writes,
        };
        ranges
            .iter()
            .any(|r| r.start < request.sectors.end && request.sectors.start < r.end)
    }
}

pub type FaultHandle = Arc<Mutex<FaultPlan>>;

/// Engine wrapper that fails requests according to a shared [`FaultPlan`]
pub struct FaultyEngine<E> {
    inner: E,
    plan: FaultHandle,
    failed: VecDeque<IoCompletion>,
}

impl<E: IoEngine> FaultyEngine<E> {
    pub fn new(inner: E) -> (Self, FaultHandle) {
        let plan = FaultHandle::default();
        let engine = Self {
            inner,
            plan: Arc::clone(&plan),
            failed: VecDeque::new(),
        };
        (engine, plan)
    }
}

impl<E: IoEngine> IoEngine for FaultyEngine<E> {
    fn name(&self) -> &'static str {
        "faulty"
    }

    fn open(&mut self, path: &Path, mode: OpenMode) -> Result<OpenedFile> {
        self.inner.open(path, mode)
    }

    fn issue(&mut self, request: IoRequest) -> std::result::Result<(), IoCompletion> {
        let mut plan = self.plan.lock();
        if plan.reject_all {
            return Err(request.complete(Err(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "injected rejection",
            ))));
        }
        match request.direction {
            IoDirection::Read => plan.reads += 1,
            IoDirection::Write => plan.writes += 1,
        }
        if plan.fails(&request) {
            let error = std::io::Error::from_raw_os_error(libc::EIO);
            self.failed.push_back(request.complete(Err(error)));
            return Ok(());
        }
        drop(plan);
        self.inner.issue(request)
    }

    fn wait(&mut self) -> Result<Vec<IoCompletion>> {
        let mut done: Vec<IoCompletion> = self.failed.drain(..).collect();
        if self.inner.in_flight() > 0 {
            done.extend(self.inner.wait()?);
        }
        Ok(done)
    }

    fn in_flight(&self) -> usize {
        self.inner.in_flight() + self.failed.len()
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
