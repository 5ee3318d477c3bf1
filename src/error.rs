use std::path::PathBuf;
use thiserror::Error;

use crate::hashing::HashKind;

/// The input could not be turned into pixel data.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image decode failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("Image has no pixels ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },
}

/// A hash grid whose bit count is not a whole number of bytes. The hash
/// bytes would be zero-padded and every similarity score inflated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid hash size {size}: a {size}x{size} grid does not fill whole bytes (use a positive multiple of 4)")]
pub struct HashSizeError {
    pub size: u32,
}

/// Why a store came up empty. Never fatal; the caller gets an empty store.
#[derive(Debug, Error)]
pub enum StoreLoadError {
    #[error("No fingerprint database at {path:?}; a new one will be created")]
    Missing { path: PathBuf },

    #[error("Failed to read fingerprint database {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Fingerprint database {path:?} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        backup: Option<PathBuf>,
        #[source]
        source: serde_json::Error,
    },
}

/// Persisting the store failed. The previously written file is left untouched.
#[derive(Debug, Error)]
pub enum StoreWriteError {
    #[error("Failed to create directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to stage database write in {dir:?}: {source}")]
    TempFile {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize fingerprint database: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Refusing to overwrite {path:?}: it could not be read when the database was loaded")]
    Unreadable { path: PathBuf },

    #[error("Failed to replace {path:?}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A stored fingerprint cannot be compared against the query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IncomparableHashError {
    #[error("Malformed fingerprint {fingerprint:?}")]
    Malformed { fingerprint: String },

    #[error("{kind} hash length differs: query has {query_bits} bits, stored has {stored_bits}")]
    LengthMismatch {
        kind: HashKind,
        query_bits: usize,
        stored_bits: usize,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Clearing the fingerprint database requires confirmation")]
    ConfirmationRequired,

    #[error(transparent)]
    Write(#[from] StoreWriteError),
}

/// Failure of a single import; other imports and the process carry on.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("File does not exist: {0:?}")]
    NotFound(PathBuf),

    #[error("Unsupported image format: {0:?}")]
    UnsupportedFormat(PathBuf),

    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },

    #[error("Failed to write image {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error(transparent)]
    Store(#[from] StoreWriteError),
}
