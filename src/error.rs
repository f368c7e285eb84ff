//! Error types shared by every component of the store.
//!
//! Every failure mode enumerated by the format (a corrupt node, an
//! oversized value, a missing key, ...) is collapsed into a single
//! [`Error`] enum rather than one type per module, since callers only
//! ever need to match on the *kind* of failure, never on which component
//! raised it.

use std::fmt;
use std::io;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while operating on a database file.
#[derive(Debug)]
pub enum Error {
    /// The block I/O port reported a failure, or a read/write came back
    /// short of the requested length.
    Io(io::Error),

    /// A host-memory allocation failed, or a file resize was refused by
    /// the underlying storage.
    Oom,

    /// A node's start and end marks differ, the header magic does not
    /// match, or the header cursors are inconsistent with the file size.
    Corrupt(String),

    /// `find` was called for a key that is not present in the tree.
    NotFound,

    /// `add` was called without `replace` for a key that already exists.
    Duplicate,

    /// The caller passed a value larger than 2^31 - 1 bytes, or a key
    /// that isn't exactly 16 bytes wide.
    Invalid(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "i/o error: {e}"),
            Error::Oom => write!(f, "out of memory"),
            Error::Corrupt(msg) => write!(f, "corrupt database: {msg}"),
            Error::NotFound => write!(f, "key not found"),
            Error::Duplicate => write!(f, "key already exists"),
            Error::Invalid(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl Error {
    /// Builds a [`Error::Io`] from a short read/write, which this format
    /// always treats as fatal (spec section 9, "known source
    /// ambiguities").
    pub(crate) fn short_transfer(op: &'static str, want: usize, got: usize) -> Self {
        Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short {op}: wanted {want} bytes, got {got}"),
        ))
    }
}
