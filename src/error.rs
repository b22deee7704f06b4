//! Error types for the persistent heap allocator.
//!
//! Per the error-handling design: invalid-argument, out-of-space, I/O and
//! corruption failures are reported through `Result`. Allocation-level
//! sentinel returns (null offset, `None`) are kept at the `SegmentAllocator`
//! and `find` layer where the original API shape calls for them; everything
//! above that surfaces as an `Error`.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("segment out of space: requested {requested} bytes, {available} available")]
    OutOfSpace { requested: usize, available: usize },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("datastore at {0:?} is corrupt: {1}")]
    Corrupt(PathBuf, String),

    #[error("datastore at {0:?} was not properly closed")]
    NotProperlyClosed(PathBuf),

    #[error("metadata version mismatch: datastore is version {found}, this build supports {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("datastore is open read-only; cannot {0}")]
    ReadOnly(&'static str),

    #[error("key already exists: {0}")]
    DuplicateKey(String),

    #[error("segment storage is broken and rejects further operations")]
    Broken,
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }
}
