use crate::cache::CacheError;
use crate::model::TransformationChain;
use mime::Mime;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

/// Number of one-character directory levels taken from each identifier.
pub const SHARD_DEPTH: usize = 3;

const DEFAULT_ACCEPT: &str = "*/*";

/// Hex encoded SHA-256 over the identity and transformation chain of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheFingerprint(String);

impl CacheFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives cache fingerprints and their sharded locations below a root.
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    root: PathBuf,
}

impl CacheKeyBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fingerprint(chain: &TransformationChain) -> CacheFingerprint {
        let mut hasher = Sha256::new();
        let accept = normalize_accept(chain.accept.as_deref());

        // Length prefixes keep ("ab", "c") and ("a", "bc") apart
        let mut field = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };
        field(chain.owner.as_bytes());
        field(chain.image_id.as_bytes());
        field(accept.as_bytes());
        field(chain.extension.as_deref().unwrap_or("").as_bytes());
        field(&(chain.steps.len() as u64).to_le_bytes());
        for step in &chain.steps {
            field(step.name.as_bytes());
            field(&(step.params.len() as u64).to_le_bytes());
            for (k, v) in &step.params {
                field(k.as_bytes());
                field(v.as_bytes());
            }
        }

        CacheFingerprint(hex::encode(hasher.finalize()))
    }

    /// Directory holding every cached rendition of one image.
    pub fn image_dir(&self, owner: &str, image_id: &str) -> Result<PathBuf, CacheError> {
        let mut path = self.root.clone();
        push_sharded(&mut path, owner)?;
        push_sharded(&mut path, image_id)?;
        Ok(path)
    }

    pub fn entry_path(&self, chain: &TransformationChain) -> Result<PathBuf, CacheError> {
        let mut path = self.image_dir(&chain.owner, &chain.image_id)?;
        push_sharded(&mut path, Self::fingerprint(chain).as_str())?;
        Ok(path)
    }
}

/// Reduces an Accept header to the sorted image and wildcard ranges, without parameters.
pub fn normalize_accept(accept: Option<&str>) -> String {
    let raw = accept.map(str::trim).filter(|a| !a.is_empty()).unwrap_or(DEFAULT_ACCEPT);

    let mut ranges: Vec<String> = raw
        .split(',')
        .filter_map(|part| part.trim().parse::<Mime>().ok())
        .filter(|m| matches!(m.type_().as_str(), "*" | "image"))
        .map(|m| m.essence_str().to_string())
        .collect();
    ranges.sort();
    ranges.dedup();
    ranges.join(",")
}

/// Splits an identifier into fixed short prefix directories followed by the full value,
/// e.g. `ab` becomes `0/a/b/ab`.
pub fn shard_segments(identifier: &str) -> Result<Vec<String>, CacheError> {
    validate_identifier(identifier)?;

    let chars: Vec<char> = identifier.chars().collect();
    let padding = SHARD_DEPTH.saturating_sub(chars.len());
    let mut segments: Vec<String> = std::iter::repeat('0')
        .take(padding)
        .chain(chars.iter().copied())
        .take(SHARD_DEPTH)
        .map(String::from)
        .collect();
    segments.push(identifier.to_string());
    Ok(segments)
}

fn push_sharded(path: &mut PathBuf, identifier: &str) -> Result<(), CacheError> {
    for segment in shard_segments(identifier)? {
        path.push(segment);
    }
    Ok(())
}

fn validate_identifier(identifier: &str) -> Result<(), CacheError> {
    let bad = identifier.is_empty()
        || identifier == "."
        || identifier == ".."
        || identifier.chars().any(|c| c == '/' || c == '\\' || c == '\0');
    if bad {
        return Err(CacheError::InvalidIdentifier(identifier.to_string()));
    }
    Ok(())
}
