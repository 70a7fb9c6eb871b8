use crate::cache::{CacheError, CacheKeyBuilder};
use crate::config::{ConfigError, TransformationCacheConfig};
use crate::hooks::{Flow, Hook, Stage};
use crate::model::{Image, RequestContext, ResponseModel};
use crate::CACHE_STATUS_HEADER;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;

/// Bump when the entry layout changes; older entries then read as corrupt and are dropped.
const ENTRY_VERSION: u32 = 2;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Header line stored in front of the raw image bytes of every entry.
#[derive(Serialize, Deserialize, Debug)]
struct EntryHeader {
    version: u32,
    width: u32,
    height: u32,
    mime_type: String,
    extension: String,
    /// Values are kept as raw bytes, they are not required to be UTF-8.
    headers: Vec<(String, Vec<u8>)>,
    blob_len: u64,
}

/// On-disk cache of fully rendered transformation results.
///
/// Entries live at `root/<owner shards>/<image shards>/<fingerprint shards>`,
/// so all renditions of one image share a subtree that can be dropped at once.
/// No locking is done: concurrent writers each rename a complete file over the
/// target and the last one wins.
#[derive(Debug, Clone)]
pub struct TransformationResultCache {
    keys: CacheKeyBuilder,
}

impl TransformationResultCache {
    pub fn new(config: &TransformationCacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { keys: CacheKeyBuilder::new(config.path.clone()) })
    }

    pub fn root(&self) -> &Path {
        self.keys.root()
    }

    pub fn keys(&self) -> &CacheKeyBuilder {
        &self.keys
    }

    /// Serves the response from cache when an entry exists for the request fingerprint.
    ///
    /// The entry path is remembered on `ctx.cache_entry`, so the later store
    /// writes under the chain as requested even if a hook rescales its parameters.
    ///
    /// # Parameters
    /// * `ctx` - Request state; receives the cached image, headers and the
    ///   `x-transformation-cache` status
    ///
    /// # Returns
    /// `Flow::Stop` on a hit, with `ctx.cache_hit` set. `Flow::Continue` on a
    /// miss, including unusable identifiers and unreadable entries. Corrupt
    /// entries are removed before reporting the miss.
    pub async fn load_from_cache(&self, ctx: &mut RequestContext) -> Flow {
        let path = match self.keys.entry_path(&ctx.chain) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Transformation cache lookup skipped: {}", e);
                mark(ctx, "Miss");
                return Flow::Continue;
            }
        };
        ctx.cache_entry = Some(path.clone());

        match fs::read(&path).await {
            Ok(raw) => match decode_entry(&path, raw.into()) {
                Ok((image, headers)) => {
                    tracing::debug!("Transformation cache hit for {}", path.display());
                    ctx.response.headers = headers;
                    ctx.response.model = ResponseModel::Image(image);
                    ctx.cache_hit = true;
                    mark(ctx, "Hit");
                    return Flow::Stop;
                }
                Err(e) => {
                    tracing::warn!("{}, removing it", e);
                    if let Err(e) = fs::remove_file(&path).await {
                        if e.kind() != ErrorKind::NotFound {
                            tracing::warn!("Could not remove corrupt cache entry {}: {}", path.display(), e);
                        }
                    }
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Could not read cache entry {}: {}", path.display(), e),
        }

        tracing::debug!("Transformation cache miss for {}", path.display());
        mark(ctx, "Miss");
        Flow::Continue
    }

    /// Persists the rendered image and headers of the response.
    ///
    /// The entry goes to `ctx.cache_entry` when a lookup resolved it, otherwise
    /// to the path of the current chain. The complete entry is written to a
    /// temporary sibling and renamed over the target, so concurrent writers
    /// never leave a partial file and the last rename wins.
    ///
    /// # Parameters
    /// * `ctx` - Request state holding the rendered response
    ///
    /// # Returns
    /// `Ok(true)` when an entry was written. `Ok(false)` without touching disk
    /// when the model is not an image or the request was served from the cache.
    ///
    /// # Errors
    /// Returns `CacheError::InvalidIdentifier` for owner or image ids that
    /// cannot be path segments, and `CacheError::Io` when the shard
    /// directories or the entry cannot be written.
    pub async fn store_in_cache(&self, ctx: &RequestContext) -> Result<bool, CacheError> {
        let image = match &ctx.response.model {
            ResponseModel::Image(image) if !ctx.cache_hit => image,
            _ => return Ok(false),
        };

        let path = match &ctx.cache_entry {
            Some(path) => path.clone(),
            None => self.keys.entry_path(&ctx.chain)?,
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await.map_err(|e| CacheError::io(dir, e))?;
        }

        let data = encode_entry(image, &ctx.response.headers)?;
        let tmp = tmp_path(&path);
        fs::write(&tmp, &data).await.map_err(|e| CacheError::io(&tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(CacheError::io(&path, e));
        }

        tracing::debug!("Stored transformation result at {} ({} bytes)", path.display(), image.blob.len());
        Ok(true)
    }

    /// Drops every cached rendition of an image, then prunes ancestors left empty.
    ///
    /// Pruning stops at the first ancestor still holding other images and never
    /// removes the cache root. Deleting an image with no entries is not an error.
    ///
    /// # Errors
    /// Returns `CacheError::InvalidIdentifier` for unusable ids and
    /// `CacheError::Io` when the image directory cannot be removed.
    pub async fn delete_from_cache(&self, owner: &str, image_id: &str) -> Result<(), CacheError> {
        let dir = self.keys.image_dir(owner, image_id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => tracing::debug!("Removed transformation cache dir {}", dir.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::io(&dir, e)),
        }
        self.prune_empty_ancestors(&dir).await;
        Ok(())
    }

    async fn prune_empty_ancestors(&self, dir: &Path) {
        let root = self.keys.root();
        let mut current = dir.parent();
        while let Some(p) = current {
            if p == root || !p.starts_with(root) {
                break;
            }
            match fs::remove_dir(p).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                // Still holds other images
                Err(_) => break,
            }
            current = p.parent();
        }
    }
}

#[async_trait::async_trait]
impl Hook for TransformationResultCache {
    fn name(&self) -> &'static str {
        "transformation-cache"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::ImageGet, Stage::ResponseSend, Stage::ImageDelete]
    }

    async fn handle(&self, stage: Stage, ctx: &mut RequestContext) -> Flow {
        match stage {
            Stage::ImageGet => self.load_from_cache(ctx).await,
            Stage::ResponseSend => {
                if let Err(e) = self.store_in_cache(ctx).await {
                    tracing::warn!("Failed to cache transformed image: {}", e);
                }
                Flow::Continue
            }
            Stage::ImageDelete => {
                if let Err(e) = self.delete_from_cache(ctx.owner(), ctx.image_id()).await {
                    tracing::warn!("Could not clear transformation cache for {}/{}: {}", ctx.owner(), ctx.image_id(), e);
                }
                Flow::Continue
            }
            Stage::ImageLoad | Stage::ImageStored => Flow::Continue,
        }
    }
}

fn mark(ctx: &mut RequestContext, status: &'static str) {
    ctx.response
        .headers
        .insert(HeaderName::from_static(CACHE_STATUS_HEADER), HeaderValue::from_static(status));
}

fn tmp_path(path: &Path) -> PathBuf {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}.{}.tmp", std::process::id(), n));
    path.with_file_name(name)
}

fn encode_entry(image: &Image, headers: &HeaderMap) -> Result<Vec<u8>, CacheError> {
    let headers = headers
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
        .collect();

    let header = EntryHeader {
        version: ENTRY_VERSION,
        width: image.width,
        height: image.height,
        mime_type: image.mime_type.clone(),
        extension: image.extension.clone(),
        headers,
        blob_len: image.blob.len() as u64,
    };

    let mut out = serde_json::to_vec(&header).map_err(|e| CacheError::Corrupt {
        path: PathBuf::new(),
        reason: e.to_string(),
    })?;
    out.push(b'\n');
    out.extend_from_slice(&image.blob);
    Ok(out)
}

fn decode_entry(path: &Path, raw: Bytes) -> Result<(Image, HeaderMap), CacheError> {
    let corrupt = |reason: String| CacheError::Corrupt { path: path.to_path_buf(), reason };

    let split = raw
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| corrupt("missing header line".into()))?;
    let header: EntryHeader = serde_json::from_slice(&raw[..split]).map_err(|e| corrupt(e.to_string()))?;
    if header.version != ENTRY_VERSION {
        return Err(corrupt(format!("unsupported version {}", header.version)));
    }

    let blob = raw.slice(split + 1..);
    if blob.len() as u64 != header.blob_len {
        return Err(corrupt(format!("expected {} image bytes, found {}", header.blob_len, blob.len())));
    }

    let mut headers = HeaderMap::with_capacity(header.headers.len());
    for (name, value) in &header.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| corrupt(e.to_string()))?;
        let value = HeaderValue::from_bytes(value).map_err(|e| corrupt(e.to_string()))?;
        headers.append(name, value);
    }

    let image = Image {
        blob,
        width: header.width,
        height: header.height,
        mime_type: header.mime_type,
        extension: header.extension,
        transformed: false,
    };
    Ok((image, headers))
}
