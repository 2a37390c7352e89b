//! Error kinds shared by every component, plus the thread-local "errno"
//! slot (see [`crate::tls`]).
//!
//! Each component (buffer, hash table, scheduler) has its own error enum so
//! that a buffer overflow can never be silently confused with a hash-table
//! miss, but all three enums map onto the same [`ErrorKind`] so a caller who
//! only cares about the *kind* of failure (for logging, for a status code)
//! doesn't need to match on three different types.

use std::fmt;

/// The errno-style kind of the last failure. `rt_errno` (see
/// [`crate::tls`]) always holds one of these, updated by the last
/// fallible operation on the current thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Ok,
    OutOfMemory,
    InvalidArgument,
    Overflow,
    Eof,
    NotFound,
    NotValid,
    Unreachable,
    Limit,
    AlreadyExists,
    NoSuchFile,
    Err,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Ok => "ok",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::Overflow => "overflow",
            ErrorKind::Eof => "end of file",
            ErrorKind::NotFound => "not found",
            ErrorKind::NotValid => "not valid",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::Limit => "limit reached",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::NoSuchFile => "no such file",
            ErrorKind::Err => "error",
        };
        f.write_str(s)
    }
}

/// Errors from [`crate::buffer::Buffer`] cursor operations.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    #[error("requested {requested} bytes but only {available} were available")]
    Overflow { requested: usize, available: usize },
    #[error("buffer allocation of {0} bytes failed")]
    OutOfMemory(usize),
}

impl BufferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BufferError::Overflow { .. } => ErrorKind::Overflow,
            BufferError::OutOfMemory(_) => ErrorKind::OutOfMemory,
        }
    }
}

/// Errors from [`crate::hash_table::HashTable`] (spec §4.B).
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum HashError {
    #[error("hash table allocation failed")]
    OutOfMemory,
    #[error("no matching entry")]
    NotFound,
}

impl HashError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HashError::OutOfMemory => ErrorKind::OutOfMemory,
            HashError::NotFound => ErrorKind::NotFound,
        }
    }
}

/// Errors from the scheduler (spec §4.D).
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("schedule is no longer valid (already stopped/uninit)")]
    NotValid,
    #[error("max_descriptors ({0}) would be exceeded")]
    Limit(usize),
    #[error("invalid argument")]
    InvalidArgument,
    #[error("an event named {0:?} already exists")]
    AlreadyExists(String),
    #[error("no event named {0:?}")]
    NotFound(String),
    #[error("allocation failed")]
    OutOfMemory,
}

impl ScheduleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScheduleError::NotValid => ErrorKind::NotValid,
            ScheduleError::Limit(_) => ErrorKind::Limit,
            ScheduleError::InvalidArgument => ErrorKind::InvalidArgument,
            ScheduleError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            ScheduleError::NotFound(_) => ErrorKind::NotFound,
            ScheduleError::OutOfMemory => ErrorKind::OutOfMemory,
        }
    }
}
