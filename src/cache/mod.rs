// Re-export modules
pub mod disk;
pub mod key;

pub use disk::TransformationResultCache;
pub use key::{normalize_accept, CacheFingerprint, CacheKeyBuilder};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Identifier cannot be used as a cache path segment: {0:?}")]
    InvalidIdentifier(String),
    #[error("I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Corrupt cache entry {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io { path: path.into(), source }
    }
}
