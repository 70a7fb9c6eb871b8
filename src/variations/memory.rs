use crate::model::VariationSize;
use crate::variations::{DatabaseError, StorageError, VariationBlobStore, VariationDatabase};
use bytes::Bytes;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

type Key = (String, String);

/// Process-local variation store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryVariationStore {
    records: RwLock<BTreeMap<Key, BTreeMap<u32, u32>>>,
    blobs: RwLock<BTreeMap<Key, BTreeMap<u32, Bytes>>>,
}

impl MemoryVariationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(owner: &str, image_id: &str) -> Key {
        (owner.to_string(), image_id.to_string())
    }

    /// Widths with a metadata record, ascending.
    pub async fn widths(&self, owner: &str, image_id: &str) -> Vec<u32> {
        self.records
            .read()
            .await
            .get(&Self::key(owner, image_id))
            .map(|w| w.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Widths with a stored blob, ascending.
    pub async fn blob_widths(&self, owner: &str, image_id: &str) -> Vec<u32> {
        self.blobs
            .read()
            .await
            .get(&Self::key(owner, image_id))
            .map(|w| w.keys().copied().collect())
            .unwrap_or_default()
    }
}

fn remove<V>(map: &mut BTreeMap<Key, BTreeMap<u32, V>>, key: &Key, width: Option<u32>) {
    match width {
        Some(width) => {
            if let Some(widths) = map.get_mut(key) {
                widths.remove(&width);
                if widths.is_empty() {
                    map.remove(key);
                }
            }
        }
        None => {
            map.remove(key);
        }
    }
}

#[async_trait::async_trait]
impl VariationDatabase for MemoryVariationStore {
    async fn best_match(&self, owner: &str, image_id: &str, min_width: u32) -> Result<Option<VariationSize>, DatabaseError> {
        let records = self.records.read().await;
        Ok(records
            .get(&Self::key(owner, image_id))
            .and_then(|widths| widths.range(min_width..).next())
            .map(|(width, height)| VariationSize { width: *width, height: *height }))
    }

    async fn store_metadata(&self, owner: &str, image_id: &str, width: u32, height: u32) -> Result<(), DatabaseError> {
        self.records
            .write()
            .await
            .entry(Self::key(owner, image_id))
            .or_default()
            .insert(width, height);
        Ok(())
    }

    async fn delete_variations(&self, owner: &str, image_id: &str, width: Option<u32>) -> Result<(), DatabaseError> {
        remove(&mut *self.records.write().await, &Self::key(owner, image_id), width);
        Ok(())
    }
}

#[async_trait::async_trait]
impl VariationBlobStore for MemoryVariationStore {
    async fn get(&self, owner: &str, image_id: &str, width: u32) -> Result<Option<Bytes>, StorageError> {
        let blobs = self.blobs.read().await;
        Ok(blobs.get(&Self::key(owner, image_id)).and_then(|w| w.get(&width)).cloned())
    }

    async fn store(&self, owner: &str, image_id: &str, blob: Bytes, width: u32) -> Result<(), StorageError> {
        self.blobs
            .write()
            .await
            .entry(Self::key(owner, image_id))
            .or_default()
            .insert(width, blob);
        Ok(())
    }

    async fn delete_variations(&self, owner: &str, image_id: &str, width: Option<u32>) -> Result<(), StorageError> {
        remove(&mut *self.blobs.write().await, &Self::key(owner, image_id), width);
        Ok(())
    }
}
