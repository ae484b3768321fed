//! Status codes returned by cache and eviction operations
//!
//! Transient conditions (busy pages, locked refs, empty queues) are retried
//! inside the cache and only surface as `NotFound`/`Restart`/`Busy` with the
//! meanings documented on each variant.

use std::fmt;

/// Status code returned by cache operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// Operation completed successfully
    #[default]
    Ok = 0,
    /// Page is not resident and the caller asked not to read or wait
    NotFound = 1,
    /// Tree shape changed underneath the caller; retry from the parent
    Restart = 2,
    /// Page is pinned or locked by another thread
    Busy = 3,
    /// Eviction cannot make progress; roll back the active transaction
    CacheStuck = 4,
    /// I/O error from the backing store
    IoError = 5,
    /// Data corruption detected in a page image or delta
    Corruption = 6,
    /// Invalid argument provided
    InvalidArgument = 7,
    /// Operation was aborted (connection closing, reconciliation refused)
    Aborted = 8,
}

impl Status {
    /// Check if the status indicates success
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Check if the page was not found
    #[inline]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Status::NotFound)
    }

    /// Check if the caller should retry from the parent page
    #[inline]
    pub const fn is_restart(&self) -> bool {
        matches!(self, Status::Restart)
    }

    /// Check if the status signals that the transaction should roll back
    #[inline]
    pub const fn is_rollback(&self) -> bool {
        matches!(self, Status::CacheStuck)
    }

    /// Check if the status indicates an error
    #[inline]
    pub const fn is_error(&self) -> bool {
        matches!(
            self,
            Status::IoError | Status::Corruption | Status::InvalidArgument | Status::Aborted
        )
    }

    /// Get the status as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::NotFound => "NotFound",
            Status::Restart => "Restart",
            Status::Busy => "Busy",
            Status::CacheStuck => "CacheStuck",
            Status::IoError => "IoError",
            Status::Corruption => "Corruption",
            Status::InvalidArgument => "InvalidArgument",
            Status::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
                Status::Corruption
            }
            std::io::ErrorKind::InvalidInput => Status::InvalidArgument,
            _ => Status::IoError,
        }
    }
}
