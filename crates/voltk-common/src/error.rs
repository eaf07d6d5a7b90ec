//! Error types for voltk
//!
//! Every fallible operation of the I/O manager returns [`Error`]. The
//! variants follow the failure classes of the manager: submission
//! rejections, completion errors, access-mode conflicts, resource
//! exhaustion and internal consistency problems.

use thiserror::Error;

/// Common result type for voltk operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for voltk
#[derive(Debug, Error)]
pub enum Error {
    // Device errors
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("{path} no longer refers to the device that was opened")]
    DeviceChanged { path: String },

    // Submission and completion errors
    #[error("I/O submission rejected: {0}")]
    Rejected(String),

    #[error("read of block {block} on {path} failed: {reason}")]
    Read {
        path: String,
        block: u64,
        reason: String,
    },

    #[error("writeback of block {block} on {path} failed: {reason}")]
    Write {
        path: String,
        block: u64,
        reason: String,
    },

    #[error("flush left {blocks} block(s) unwritten")]
    FlushFailed { blocks: usize },

    // Access-mode conflicts
    #[error("{path} is held read-only")]
    ReadOnly { path: String },

    #[error("{path} is held by {holders} other holder(s); exclusive access refused")]
    ExclusiveConflict { path: String, holders: u32 },

    #[error("cannot reopen {path} for writing while {holders} other holder(s) have it open")]
    UpgradeConflict { path: String, holders: u32 },

    #[error("block {block} on {path} is already locked for writing")]
    BlockBusy { path: String, block: u64 },

    #[error("{0} is still referenced")]
    Busy(String),

    // Resource exhaustion
    #[error("no cache block can be freed ({blocks} blocks, all referenced)")]
    CacheExhausted { blocks: usize },

    #[error("device cap of {cap} reached and no device can be evicted")]
    NoEvictableDevice { cap: usize },

    // Programming errors
    #[error("stale handle: {0}")]
    StaleHandle(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if the caller may succeed by retrying after releasing resources
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CacheExhausted { .. }
                | Self::NoEvictableDevice { .. }
                | Self::BlockBusy { .. }
                | Self::Busy(_)
                | Self::FlushFailed { .. }
        )
    }

    /// Check if this error is an access-mode conflict, refused before any I/O
    #[must_use]
    pub const fn is_access_conflict(&self) -> bool {
        matches!(
            self,
            Self::ReadOnly { .. }
                | Self::ExclusiveConflict { .. }
                | Self::UpgradeConflict { .. }
                | Self::BlockBusy { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::CacheExhausted { blocks: 4 }.is_retryable());
        assert!(Error::FlushFailed { blocks: 1 }.is_retryable());
        assert!(!Error::Rejected("queue full".into()).is_retryable());
        assert!(!Error::DeviceChanged { path: "/dev/x".into() }.is_retryable());
    }

    #[test]
    fn test_error_access_conflict() {
        assert!(Error::ReadOnly { path: "/dev/x".into() }.is_access_conflict());
        assert!(
            Error::ExclusiveConflict {
                path: "/dev/x".into(),
                holders: 1
            }
            .is_access_conflict()
        );
        assert!(!Error::internal("oops").is_access_conflict());
    }

    #[test]
    fn test_error_display() {
        let err = Error::Write {
            path: "/dev/sdb".into(),
            block: 7,
            reason: "EIO".into(),
        };
        assert_eq!(err.to_string(), "writeback of block 7 on /dev/sdb failed: EIO");
    }
}
