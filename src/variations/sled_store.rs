use crate::config::ConfigError;
use crate::model::VariationSize;
use crate::variations::{DatabaseError, StorageError, VariationBlobStore, VariationDatabase};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sled::{Batch, Db, Tree};
use std::path::Path;
use time::OffsetDateTime;

const METADATA_TREE: &str = "variation_metadata";
const BLOB_TREE: &str = "variation_blobs";

/// Metadata stored for each variation
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VariationRecord {
    pub width: u32,
    pub height: u32,
    pub added: i64,
}

/// Sled-backed store for both variation records and blobs.
///
/// Keys are the length prefixed owner and image id followed by the zero padded
/// width, so the variations of an image sort by width and a best match is one
/// range scan.
pub struct SledVariationStore {
    db: Db,
    metadata: Tree,
    blobs: Tree,
}

impl SledVariationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let unavailable = |e: sled::Error| ConfigError::AdapterUnavailable { kind: "sled", reason: e.to_string() };
        let db = sled::open(path).map_err(unavailable)?;
        Self::from_db(db).map_err(unavailable)
    }

    /// Wraps an already opened database, e.g. a temporary one in tests.
    pub fn from_db(db: Db) -> Result<Self, sled::Error> {
        Ok(Self {
            metadata: db.open_tree(METADATA_TREE)?,
            blobs: db.open_tree(BLOB_TREE)?,
            db,
        })
    }

    // Each segment is length prefixed, so no owner or image id can run into the next.
    fn prefix(owner: &str, image_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(owner.len() + image_id.len() + 8);
        for segment in [owner, image_id] {
            key.extend_from_slice(&(segment.len() as u32).to_be_bytes());
            key.extend_from_slice(segment.as_bytes());
        }
        key
    }

    fn key(owner: &str, image_id: &str, width: u32) -> Vec<u8> {
        let mut key = Self::prefix(owner, image_id);
        key.extend_from_slice(format!("{:010}", width).as_bytes());
        key
    }

    fn remove(tree: &Tree, owner: &str, image_id: &str, width: Option<u32>) -> Result<usize, sled::Error> {
        let mut batch = Batch::default();
        let mut count = 0;
        match width {
            Some(width) => {
                batch.remove(Self::key(owner, image_id, width));
                count += 1;
            }
            None => {
                for item in tree.scan_prefix(Self::prefix(owner, image_id)) {
                    let (key, _) = item?;
                    batch.remove(key);
                    count += 1;
                }
            }
        }
        tree.apply_batch(batch)?;
        Ok(count)
    }

    pub async fn flush(&self) -> Result<(), sled::Error> {
        self.db.flush_async().await.map(|_| ())
    }
}

fn db_err(e: sled::Error) -> DatabaseError {
    DatabaseError::Backend(e.to_string())
}

fn storage_err(e: sled::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

#[async_trait::async_trait]
impl VariationDatabase for SledVariationStore {
    async fn best_match(&self, owner: &str, image_id: &str, min_width: u32) -> Result<Option<VariationSize>, DatabaseError> {
        let prefix = Self::prefix(owner, image_id);
        let start = Self::key(owner, image_id, min_width);

        let Some(item) = self.metadata.range(start..).next() else {
            return Ok(None);
        };
        let (key, value) = item.map_err(db_err)?;
        if !key.starts_with(&prefix) {
            return Ok(None);
        }

        let record: VariationRecord =
            serde_json::from_slice(&value).map_err(|e| DatabaseError::Malformed(e.to_string()))?;
        Ok(Some(VariationSize { width: record.width, height: record.height }))
    }

    async fn store_metadata(&self, owner: &str, image_id: &str, width: u32, height: u32) -> Result<(), DatabaseError> {
        let record = VariationRecord {
            width,
            height,
            added: OffsetDateTime::now_utc().unix_timestamp(),
        };
        let value = serde_json::to_vec(&record).map_err(|e| DatabaseError::Malformed(e.to_string()))?;
        self.metadata
            .insert(Self::key(owner, image_id, width), value)
            .map_err(|e| DatabaseError::Backend(format!("Failed to write variation metadata: {}", e)))?;
        self.metadata.flush_async().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete_variations(&self, owner: &str, image_id: &str, width: Option<u32>) -> Result<(), DatabaseError> {
        let removed = Self::remove(&self.metadata, owner, image_id, width).map_err(db_err)?;
        tracing::debug!("Removed {} variation records for {}/{}", removed, owner, image_id);
        self.metadata.flush_async().await.map_err(db_err)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl VariationBlobStore for SledVariationStore {
    async fn get(&self, owner: &str, image_id: &str, width: u32) -> Result<Option<Bytes>, StorageError> {
        let blob = self.blobs.get(Self::key(owner, image_id, width)).map_err(storage_err)?;
        Ok(blob.map(|b| Bytes::copy_from_slice(&b)))
    }

    async fn store(&self, owner: &str, image_id: &str, blob: Bytes, width: u32) -> Result<(), StorageError> {
        self.blobs
            .insert(Self::key(owner, image_id, width), blob.as_ref())
            .map_err(|e| StorageError::Backend(format!("Failed to write variation blob: {}", e)))?;
        self.blobs.flush_async().await.map_err(storage_err)?;
        Ok(())
    }

    async fn delete_variations(&self, owner: &str, image_id: &str, width: Option<u32>) -> Result<(), StorageError> {
        let removed = Self::remove(&self.blobs, owner, image_id, width).map_err(storage_err)?;
        tracing::debug!("Removed {} variation blobs for {}/{}", removed, owner, image_id);
        self.blobs.flush_async().await.map_err(storage_err)?;
        Ok(())
    }
}
