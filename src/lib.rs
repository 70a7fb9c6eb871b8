//! Derived-artifact caching for an image server.
//!
//! Two components live here: the variation engine, which keeps a pool of
//! pre-scaled renditions per image and substitutes one as the input of a
//! transformation chain when the chain downsizes anyway, and the
//! transformation result cache, which persists fully rendered responses on
//! disk keyed by a fingerprint of the request.

use thiserror::Error;

pub mod cache;
pub mod config;
pub mod hooks;
pub mod model;
pub mod transform;
pub mod variations;

pub use crate::cache::{CacheError, CacheFingerprint, CacheKeyBuilder, TransformationResultCache};
pub use crate::config::{ConfigError, MediaCacheConfig};
pub use crate::hooks::{Flow, Hook, HookChain, Stage};
pub use crate::model::{Image, RequestContext, Response, ResponseModel, TransformationChain, TransformationStep, VariationSize};
pub use crate::variations::{ImageVariations, VariationGenerator, VariationSelector};

/// Response header telling whether the transformation cache served the request.
pub const CACHE_STATUS_HEADER: &str = "x-transformation-cache";
/// Response header naming the variation used as transformation input.
pub const VARIATION_HEADER: &str = "x-image-variation";

#[derive(Error, Debug)]
pub enum MediaCacheError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Storage error: {0}")]
    Storage(#[from] variations::StorageError),
    #[error("Database error: {0}")]
    Database(#[from] variations::DatabaseError),
    #[error("Transformation error: {0}")]
    Transformation(#[from] transform::TransformationError),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

pub type Result<T> = std::result::Result<T, MediaCacheError>;
