//! Batched byte-range reads across many devices
//!
//! Jobs are run in batches of the engine's concurrency. Each batch first
//! prefetches every job's range, so reads on different devices are in
//! flight together, then reads each job's bytes and hands them to the
//! caller. A job that fails at either step is reported through the error
//! callback and dropped; the other jobs carry on.

use crate::cache::IoManager;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::debug;
use voltk_common::{AccessFlags, Error, Result};

/// One queued read
#[derive(Debug)]
pub struct Job<C> {
    pub path: PathBuf,
    pub start: u64,
    pub len: usize,
    pub context: C,
}

/// Outcome counts of [`BatchProcessor::exec`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub completed: usize,
    pub failed: usize,
}

/// Queue of byte-range reads carrying a caller context each
#[derive(Debug)]
pub struct BatchProcessor<C> {
    jobs: VecDeque<Job<C>>,
}

impl<C> Default for BatchProcessor<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> BatchProcessor<C> {
    pub const fn new() -> Self {
        Self {
            jobs: VecDeque::new(),
        }
    }

    /// Queue a read of `len` bytes at `start` on `path`
    pub fn add_job(&mut self, path: impl Into<PathBuf>, start: u64, len: usize, context: C) {
        self.jobs.push_back(Job {
            path: path.into(),
            start,
            len,
            context,
        });
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Run every queued job.
    ///
    /// `task` receives each job's bytes; `fail` receives the error of each
    /// job that could not be read. Each job reaches exactly one of them.
    pub fn exec(
        &mut self,
        io: &mut IoManager,
        mut task: impl FnMut(&Path, C, &[u8]),
        mut fail: impl FnMut(&Path, C, Error),
    ) -> BatchReport {
        let batch_size = io.max_concurrent_io().max(1);
        let mut report = BatchReport::default();
        let mut scratch = Vec::new();

        while !self.jobs.is_empty() {
            let take = batch_size.min(self.jobs.len());
            let batch: Vec<Job<C>> = self.jobs.drain(..take).collect();
            let largest = batch.iter().map(|job| job.len).max().unwrap_or(0);
            if scratch.len() < largest {
                scratch.resize(largest, 0);
            }
            debug!(jobs = batch.len(), largest, "running batch");

            let mut prefetched = Vec::with_capacity(batch.len());
            for job in batch {
                match prefetch(io, &job) {
                    Ok(()) => prefetched.push(job),
                    Err(e) => {
                        report.failed += 1;
                        fail(&job.path, job.context, e);
                    }
                }
            }

            for job in prefetched {
                let data = &mut scratch[..job.len];
                match read(io, &job, data) {
                    Ok(()) => {
                        report.completed += 1;
                        task(&job.path, job.context, data);
                    }
                    Err(e) => {
                        report.failed += 1;
                        fail(&job.path, job.context, e);
                    }
                }
            }
        }
        report
    }
}

fn prefetch<C>(io: &mut IoManager, job: &Job<C>) -> Result<()> {
    let handle = io.acquire_device(&job.path, AccessFlags::READ)?;
    let result = io.prefetch_bytes(&handle, job.start, job.len as u64);
    io.release_device(handle);
    result
}

fn read<C>(io: &mut IoManager, job: &Job<C>, data: &mut [u8]) -> Result<()> {
    let handle = io.acquire_device(&job.path, AccessFlags::READ)?;
    let result = io.read_bytes(&handle, job.start, data);
    io.release_device(handle);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SyncEngine;
    use crate::testing::FaultyEngine;
    use std::os::unix::fs::FileExt;
    use tempfile::{NamedTempFile, TempDir};
    use voltk_common::{EngineKind, IoConfig};

    fn config() -> IoConfig {
        IoConfig {
            engine: EngineKind::Sync,
            sectors_per_block: 8,
            cache_blocks: 16,
            use_direct_io: false,
            max_concurrent_io: 2,
            ..IoConfig::default()
        }
    }

    fn device(fill: u8) -> NamedTempFile {
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().write_all_at(&[fill; 8192], 0).unwrap();
        temp
    }

    #[test]
    fn test_failed_job_does_not_stop_the_batch() {
        let dir = TempDir::new().unwrap();
        let first = device(1);
        let third = device(3);
        let mut io = IoManager::with_engine(Box::new(SyncEngine::new(8)), config()).unwrap();

        let mut batch = BatchProcessor::new();
        batch.add_job(first.path(), 0, 16, 1);
        batch.add_job(dir.path().join("missing"), 0, 16, 2);
        batch.add_job(third.path(), 100, 16, 3);

        let mut done = Vec::new();
        let mut failed = Vec::new();
        let report = batch.exec(
            &mut io,
            |_, job, data| done.push((job, data.to_vec())),
            |_, job, e| failed.push((job, e)),
        );

        assert_eq!(report, BatchReport { completed: 2, failed: 1 });
        assert_eq!(done, vec![(1, vec![1; 16]), (3, vec![3; 16])]);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, 2);
        assert!(matches!(failed[0].1, Error::Open { .. }));
        assert!(batch.is_empty());
    }

    #[test]
    fn test_jobs_beyond_batch_size() {
        let devices: Vec<NamedTempFile> = (0..5).map(device).collect();
        let mut io = IoManager::with_engine(Box::new(SyncEngine::new(2)), config()).unwrap();

        let mut batch = BatchProcessor::new();
        for (i, temp) in devices.iter().enumerate() {
            // Varying lengths share one scratch buffer
            batch.add_job(temp.path(), 4096, 100 * (i + 1), i);
        }
        assert_eq!(batch.len(), 5);

        let mut seen = Vec::new();
        let report = batch.exec(
            &mut io,
            |_, i, data| {
                assert_eq!(data.len(), 100 * (i + 1));
                assert!(data.iter().all(|b| usize::from(*b) == i));
                seen.push(i);
            },
            |path, _, e| panic!("{}: {e}", path.display()),
        );
        assert_eq!(report.completed, 5);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_read_failure_reaches_error_callback() {
        let good = device(0xAA);
        let bad = device(0xBB);
        let (engine, plan) = FaultyEngine::new(SyncEngine::new(8));
        let mut io = IoManager::with_engine(Box::new(engine), config()).unwrap();

        let mut batch = BatchProcessor::new();
        batch.add_job(good.path(), 0, 64, "good");
        let report = batch.exec(&mut io, |_, _, _| {}, |_, _, e| panic!("{e}"));
        assert_eq!(report.completed, 1);

        // Fault ranges are not per device, so fail everything from here on
        plan.lock().fail_reads.push(0..u64::MAX);
        let mut errors = 0;
        batch.add_job(bad.path(), 0, 64, "bad");
        let report = batch.exec(
            &mut io,
            |_, _, _| panic!("read of a failing device succeeded"),
            |_, context, e| {
                assert_eq!(context, "bad");
                assert!(matches!(e, Error::Read { .. }));
                errors += 1;
            },
        );
        assert_eq!(report, BatchReport { completed: 0, failed: 1 });
        assert_eq!(errors, 1);
    }
}
