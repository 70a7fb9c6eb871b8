use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable overriding the transformation cache root.
pub const CACHE_PATH_ENV: &str = "MEDIACACHE_CACHE_PATH";

/// Which backend holds variation records or blobs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "adapter", rename_all = "lowercase")]
pub enum AdapterConfig {
    Sled { path: PathBuf },
    Memory,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VariationsConfig {
    /// Convert variations to PNG before resizing
    pub lossless: bool,
    pub auto_scale: bool,
    pub scale_factor: f64,
    /// Auto scaling stops once two consecutive widths differ by less than this
    pub min_diff: u32,
    pub min_width: u32,
    /// Auto scaled widths above this are skipped
    pub max_width: u32,
    /// Explicit widths generated in addition to the auto scaled ones
    pub widths: Vec<u32>,
    pub database: Option<AdapterConfig>,
    pub storage: Option<AdapterConfig>,
}

impl Default for VariationsConfig {
    fn default() -> Self {
        Self {
            lossless: false,
            auto_scale: true,
            scale_factor: 0.5,
            min_diff: 100,
            min_width: 100,
            max_width: 1024,
            widths: Vec::new(),
            database: None,
            storage: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TransformationCacheConfig {
    pub path: PathBuf,
}

impl Default for TransformationCacheConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("./cache") }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MediaCacheConfig {
    pub variations: VariationsConfig,
    pub transformation_cache: TransformationCacheConfig,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Scale factor must be between 0 and 1 (exclusive), got {0}")]
    InvalidScaleFactor(f64),
    #[error("Minimum width {min} is larger than maximum width {max}")]
    InvalidWidthRange { min: u32, max: u32 },
    #[error("Missing {0} adapter configuration for image variations")]
    MissingAdapter(&'static str),
    #[error("Could not open {kind} adapter: {reason}")]
    AdapterUnavailable { kind: &'static str, reason: String },
    #[error("The transformation cache path is missing from the configuration")]
    MissingCachePath,
    #[error("Transformation cache path is not writable: {0}")]
    CachePathNotWritable(PathBuf),
    #[error("Could not read configuration file {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
}

impl VariationsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_scaling(self.scale_factor, self.auto_scale, self.min_width, self.max_width)
    }
}

/// Shared by the config and the generator policy built from it.
pub(crate) fn validate_scaling(scale_factor: f64, auto_scale: bool, min_width: u32, max_width: u32) -> Result<(), ConfigError> {
    if !(scale_factor > 0.0 && scale_factor < 1.0) {
        return Err(ConfigError::InvalidScaleFactor(scale_factor));
    }
    if auto_scale && min_width > max_width {
        return Err(ConfigError::InvalidWidthRange { min: min_width, max: max_width });
    }
    Ok(())
}

impl TransformationCacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::MissingCachePath);
        }
        if !is_writable(&self.path) {
            return Err(ConfigError::CachePathNotWritable(self.path.clone()));
        }
        Ok(())
    }
}

impl MediaCacheConfig {
    /// Reads a JSON config file. Missing keys fall back to defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let unreadable = |reason: String| ConfigError::Unreadable { path: path.to_path_buf(), reason };
        let raw = std::fs::read(path).map_err(|e| unreadable(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| unreadable(e.to_string()))
    }

    pub fn apply_env(mut self) -> Self {
        if let Ok(path) = std::env::var(CACHE_PATH_ENV) {
            if !path.trim().is_empty() {
                self.transformation_cache.path = PathBuf::from(path);
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.variations.validate()?;
        self.transformation_cache.validate()
    }
}

// Walks up to the nearest existing ancestor when the directory is not created yet.
fn is_writable(path: &Path) -> bool {
    let mut current = Some(path);
    while let Some(p) = current {
        let probe = if p.as_os_str().is_empty() { Path::new(".") } else { p };
        if let Ok(meta) = std::fs::metadata(probe) {
            return meta.is_dir() && !meta.permissions().readonly();
        }
        current = p.parent();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(VariationsConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_scale_factor_outside_open_interval() {
        for factor in [1.0, 1.5, 0.0, -0.3] {
            let cfg = VariationsConfig { scale_factor: factor, ..Default::default() };
            assert!(matches!(cfg.validate(), Err(ConfigError::InvalidScaleFactor(_))));
        }
    }

    #[test]
    fn parses_camel_case_json() {
        let raw = r#"{
            "variations": {
                "widths": [25, 100],
                "autoScale": false,
                "scaleFactor": 0.65,
                "database": { "adapter": "sled", "path": "/tmp/variations" },
                "storage": { "adapter": "memory" }
            },
            "transformationCache": { "path": "/tmp/transformations" }
        }"#;
        let cfg: MediaCacheConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.variations.widths, vec![25, 100]);
        assert!(!cfg.variations.auto_scale);
        assert_eq!(cfg.variations.min_width, 100);
        assert_eq!(cfg.variations.database, Some(AdapterConfig::Sled { path: "/tmp/variations".into() }));
        assert_eq!(cfg.variations.storage, Some(AdapterConfig::Memory));
        assert_eq!(cfg.transformation_cache.path, PathBuf::from("/tmp/transformations"));
    }

    #[test]
    fn cache_path_must_be_set() {
        let cfg = TransformationCacheConfig { path: PathBuf::new() };
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingCachePath)));
    }

    #[test]
    fn missing_cache_dir_under_writable_parent_is_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = TransformationCacheConfig { path: tmp.path().join("not/yet/created") };
        assert!(cfg.validate().is_ok());
    }
}
