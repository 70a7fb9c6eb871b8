//! Pre-scaled renditions of stored images.
//!
//! A variation is kept as two independent records: its dimensions in a
//! [`VariationDatabase`] and its bytes in a [`VariationBlobStore`]. Both are
//! written separately, so readers must tolerate one existing without the other.

pub mod generator;
pub mod memory;
pub mod selector;
pub mod sled_store;

pub use generator::{target_widths, GenerationReport, VariationGenerator, VariationPolicy};
pub use memory::MemoryVariationStore;
pub use selector::VariationSelector;
pub use sled_store::SledVariationStore;

use crate::config::{AdapterConfig, ConfigError, VariationsConfig};
use crate::hooks::{Flow, Hook, Stage};
use crate::model::{RequestContext, VariationSize};
use crate::transform::{ImageProcessor, TransformationPipeline};
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Error, Debug, Clone)]
pub enum DatabaseError {
    #[error("Database backend error: {0}")]
    Backend(String),
    #[error("Malformed variation record: {0}")]
    Malformed(String),
}

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Image not found: {owner}/{image_id}")]
    NotFound { owner: String, image_id: String },
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Dimension records of the stored variations.
#[async_trait::async_trait]
pub trait VariationDatabase: Send + Sync {
    /// The smallest stored variation at least `min_width` wide.
    async fn best_match(&self, owner: &str, image_id: &str, min_width: u32) -> Result<Option<VariationSize>, DatabaseError>;

    async fn store_metadata(&self, owner: &str, image_id: &str, width: u32, height: u32) -> Result<(), DatabaseError>;

    /// Removes one width, or every width when `width` is `None`. Missing records are not an error.
    async fn delete_variations(&self, owner: &str, image_id: &str, width: Option<u32>) -> Result<(), DatabaseError>;
}

/// Encoded bytes of the stored variations, addressed by width.
#[async_trait::async_trait]
pub trait VariationBlobStore: Send + Sync {
    async fn get(&self, owner: &str, image_id: &str, width: u32) -> Result<Option<Bytes>, StorageError>;

    async fn store(&self, owner: &str, image_id: &str, blob: Bytes, width: u32) -> Result<(), StorageError>;

    /// Removes one width, or every width when `width` is `None`. Missing blobs are not an error.
    async fn delete_variations(&self, owner: &str, image_id: &str, width: Option<u32>) -> Result<(), StorageError>;
}

/// The store holding original images.
#[async_trait::async_trait]
pub trait PrimaryBlobStore: Send + Sync {
    async fn last_modified(&self, owner: &str, image_id: &str) -> Result<OffsetDateTime, StorageError>;
}

impl AdapterConfig {
    pub fn build_database(&self) -> Result<Arc<dyn VariationDatabase>, ConfigError> {
        match self {
            AdapterConfig::Sled { path } => Ok(Arc::new(SledVariationStore::open(path)?)),
            AdapterConfig::Memory => Ok(Arc::new(MemoryVariationStore::new())),
        }
    }

    pub fn build_storage(&self) -> Result<Arc<dyn VariationBlobStore>, ConfigError> {
        match self {
            AdapterConfig::Sled { path } => Ok(Arc::new(SledVariationStore::open(path)?)),
            AdapterConfig::Memory => Ok(Arc::new(MemoryVariationStore::new())),
        }
    }
}

/// Both variation stores, resolved once from configuration.
#[derive(Clone)]
pub struct VariationStores {
    pub database: Arc<dyn VariationDatabase>,
    pub storage: Arc<dyn VariationBlobStore>,
}

impl VariationStores {
    pub fn new(database: Arc<dyn VariationDatabase>, storage: Arc<dyn VariationBlobStore>) -> Self {
        Self { database, storage }
    }

    /// A sled database opened twice from the same path fails, so identical
    /// adapter settings share one store instance.
    pub fn from_config(config: &VariationsConfig) -> Result<Self, ConfigError> {
        let database = config.database.as_ref().ok_or(ConfigError::MissingAdapter("database"))?;
        let storage = config.storage.as_ref().ok_or(ConfigError::MissingAdapter("storage"))?;

        match (database, storage) {
            (AdapterConfig::Sled { path: a }, AdapterConfig::Sled { path: b }) if a == b => {
                let store = Arc::new(SledVariationStore::open(a)?);
                Ok(Self::new(store.clone(), store))
            }
            _ => Ok(Self::new(database.build_database()?, storage.build_storage()?)),
        }
    }
}

/// Generation, selection and cleanup of variations wired as request hooks.
#[derive(Clone)]
pub struct ImageVariations {
    generator: VariationGenerator,
    selector: VariationSelector,
}

impl ImageVariations {
    pub fn new(generator: VariationGenerator, selector: VariationSelector) -> Self {
        Self { generator, selector }
    }

    pub fn from_config(
        config: &VariationsConfig,
        processor: Arc<dyn ImageProcessor>,
        pipeline: Arc<dyn TransformationPipeline>,
        primary: Arc<dyn PrimaryBlobStore>,
    ) -> Result<Self, ConfigError> {
        let policy = VariationPolicy::from_config(config)?;
        let stores = VariationStores::from_config(config)?;
        Ok(Self {
            generator: VariationGenerator::new(policy, stores.clone(), processor)?,
            selector: VariationSelector::new(stores, pipeline, primary),
        })
    }

    pub fn generator(&self) -> &VariationGenerator {
        &self.generator
    }

    pub fn selector(&self) -> &VariationSelector {
        &self.selector
    }
}

#[async_trait::async_trait]
impl Hook for ImageVariations {
    fn name(&self) -> &'static str {
        "image-variations"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::ImageStored, Stage::ImageLoad, Stage::ImageDelete]
    }

    async fn handle(&self, stage: Stage, ctx: &mut RequestContext) -> Flow {
        match stage {
            Stage::ImageLoad => self.selector.choose_variation(ctx).await,
            Stage::ImageStored => {
                match ctx.source.clone() {
                    Some(image) => {
                        self.generator.spawn_generate(ctx.owner().to_string(), ctx.image_id().to_string(), image);
                    }
                    None => tracing::warn!("No source image on request for {}/{}, skipping variations", ctx.owner(), ctx.image_id()),
                }
                Flow::Continue
            }
            Stage::ImageDelete => {
                self.generator.delete_variations(ctx.owner(), ctx.image_id()).await;
                Flow::Continue
            }
            Stage::ImageGet | Stage::ResponseSend => Flow::Continue,
        }
    }
}
