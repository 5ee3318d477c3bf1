//! Near-duplicate image detection against a persisted fingerprint history.
//!
//! An image is reduced to three perceptual hashes ([`hashing`]), combined into
//! a [`Fingerprint`] and a short [`GroupKey`] ([`fingerprint`]), compared with
//! every stored record ([`similarity`]) and recorded in a JSON database
//! ([`store`]). [`pipeline`] wires these together for callers.

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod hashing;
pub mod logging;
pub mod pipeline;
pub mod similarity;
pub mod store;

pub use config::Config;
pub use error::{
    DecodeError, HashSizeError, ImportError, IncomparableHashError, StoreError, StoreLoadError,
    StoreWriteError,
};
pub use fingerprint::{Fingerprint, GroupKey};
pub use hashing::{DEFAULT_HASH_SIZE, HashComputer, HashKind, HashToken, PerceptualHashes, validate_hash_size};
pub use pipeline::{ImageWriter, ImportOptions, ImportOutcome, ImportPipeline, PixelWriter};
pub use similarity::{DEFAULT_THRESHOLD, Similarity, SimilarityReport, find_similar};
pub use store::{FingerprintRecord, FingerprintStore, LocationEntry, StoreInfo};
