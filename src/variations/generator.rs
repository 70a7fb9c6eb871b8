use crate::config::{validate_scaling, ConfigError, VariationsConfig};
use crate::model::{Image, VariationSize};
use crate::transform::{ImageProcessor, OutputFormat, TransformationError};
use crate::variations::VariationStores;
use crate::MediaCacheError;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Which widths to pre-generate for an image.
#[derive(Debug, Clone, PartialEq)]
pub struct VariationPolicy {
    pub widths: Vec<u32>,
    pub auto_scale: bool,
    pub min_width: u32,
    pub max_width: u32,
    pub min_diff: u32,
    pub scale_factor: f64,
    pub lossless: bool,
}

impl Default for VariationPolicy {
    fn default() -> Self {
        let cfg = VariationsConfig::default();
        Self {
            widths: cfg.widths,
            auto_scale: cfg.auto_scale,
            min_width: cfg.min_width,
            max_width: cfg.max_width,
            min_diff: cfg.min_diff,
            scale_factor: cfg.scale_factor,
            lossless: cfg.lossless,
        }
    }
}

impl VariationPolicy {
    pub fn from_config(config: &VariationsConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            widths: config.widths.clone(),
            auto_scale: config.auto_scale,
            min_width: config.min_width,
            max_width: config.max_width,
            min_diff: config.min_diff,
            scale_factor: config.scale_factor,
            lossless: config.lossless,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_scaling(self.scale_factor, self.auto_scale, self.min_width, self.max_width)
    }
}

/// Computes the widths to generate for an original `original_width` pixels wide.
///
/// The auto scaled walk multiplies by the scale factor until a width drops
/// below `min_width` or is less than `min_diff` narrower than the last one
/// kept. Widths above `max_width` are skipped without ending the walk. The
/// result never contains a width `>= original_width` and is sorted descending.
pub fn target_widths(policy: &VariationPolicy, original_width: u32) -> Vec<u32> {
    let mut widths: Vec<u32> = policy.widths.clone();

    if policy.auto_scale {
        let (min_width, max_width, min_diff) = (policy.min_width as f64, policy.max_width as f64, policy.min_diff as f64);
        let mut variation = original_width as f64;
        let mut previous = variation;

        while variation > min_width {
            let next = (variation * policy.scale_factor).round();
            if next >= variation {
                // Rounding no longer shrinks the width
                break;
            }
            variation = next;

            if variation > max_width {
                continue;
            }
            if previous - variation < min_diff || variation < min_width {
                break;
            }

            previous = variation;
            widths.push(variation as u32);
        }
    }

    widths.retain(|w| *w > 0 && *w < original_width);
    widths.sort_unstable_by(|a, b| b.cmp(a));
    widths.dedup();
    widths
}

/// Outcome of one generation pass.
#[derive(Debug, Default)]
pub struct GenerationReport {
    pub generated: Vec<VariationSize>,
    pub failed: Vec<(u32, MediaCacheError)>,
}

/// Produces and removes the variation pool of an image.
#[derive(Clone)]
pub struct VariationGenerator {
    policy: Arc<VariationPolicy>,
    stores: VariationStores,
    processor: Arc<dyn ImageProcessor>,
}

impl VariationGenerator {
    pub fn new(policy: VariationPolicy, stores: VariationStores, processor: Arc<dyn ImageProcessor>) -> Result<Self, ConfigError> {
        policy.validate()?;
        Ok(Self { policy: Arc::new(policy), stores, processor })
    }

    pub fn policy(&self) -> &VariationPolicy {
        &self.policy
    }

    /// Generates every target width independently. A failing width is logged
    /// and reported; the remaining widths are still attempted.
    pub async fn generate(&self, owner: &str, image_id: &str, original: &Image) -> GenerationReport {
        let mut report = GenerationReport::default();
        let widths = target_widths(&self.policy, original.width);
        if widths.is_empty() {
            tracing::debug!("No variations to generate for {}/{} ({}px wide)", owner, image_id, original.width);
            return report;
        }

        for width in widths {
            match self.generate_width(owner, image_id, original, width).await {
                Ok(size) => report.generated.push(size),
                Err(e) => {
                    tracing::warn!("Could not generate image variation for {} ({}), width: {}: {}", owner, image_id, width, e);
                    report.failed.push((width, e));
                }
            }
        }

        tracing::info!(
            "Generated {} image variations for {} ({}), {} failed",
            report.generated.len(),
            owner,
            image_id,
            report.failed.len()
        );
        report
    }

    /// Runs [`generate`](Self::generate) on the tokio runtime without waiting for it.
    pub fn spawn_generate(&self, owner: String, image_id: String, original: Image) -> JoinHandle<GenerationReport> {
        let this = self.clone();
        tokio::spawn(async move { this.generate(&owner, &image_id, &original).await })
    }

    async fn generate_width(&self, owner: &str, image_id: &str, original: &Image, width: u32) -> Result<VariationSize, MediaCacheError> {
        let processor = self.processor.clone();
        let source = original.clone();
        let lossless = self.policy.lossless;

        let variation = tokio::task::spawn_blocking(move || -> Result<Image, TransformationError> {
            let input = if lossless { processor.convert(&source, OutputFormat::Png)? } else { source };
            processor.resize(&input, width)
        })
        .await
        .map_err(|e| TransformationError::Task(e.to_string()))??;

        let size = VariationSize { width: variation.width, height: variation.height };
        if size.width != width {
            tracing::debug!("Requested variation width {} came out as {}", width, size.width);
        }

        self.stores.storage.store(owner, image_id, variation.blob, size.width).await?;

        if let Err(e) = self.stores.database.store_metadata(owner, image_id, size.width, size.height).await {
            // Do not leave a blob behind that no record points to
            if let Err(cleanup) = self.stores.storage.delete_variations(owner, image_id, Some(size.width)).await {
                tracing::warn!("Could not remove the stored variation {} for {} ({}): {}", size.width, owner, image_id, cleanup);
            }
            return Err(e.into());
        }

        Ok(size)
    }

    /// Removes every variation record and blob of an image. Failures are logged only.
    pub async fn delete_variations(&self, owner: &str, image_id: &str) {
        if let Err(e) = self.stores.database.delete_variations(owner, image_id, None).await {
            tracing::warn!("Could not delete image variation metadata for {} ({}): {}", owner, image_id, e);
        }
        if let Err(e) = self.stores.storage.delete_variations(owner, image_id, None).await {
            tracing::warn!("Could not delete image variations from storage for {} ({}): {}", owner, image_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(widths: &[u32], auto_scale: bool) -> VariationPolicy {
        VariationPolicy { widths: widths.to_vec(), auto_scale, ..Default::default() }
    }

    #[test]
    fn explicit_widths_drop_sizes_not_below_original() {
        let p = policy(&[25, 100, 400, 800, 1024, 1700, 3000], false);
        assert_eq!(target_widths(&p, 2048), vec![1700, 1024, 800, 400, 100, 25]);
        assert_eq!(target_widths(&p, 1024), vec![800, 400, 100, 25]);
    }

    #[test]
    fn auto_scale_skips_widths_above_max() {
        let p = VariationPolicy {
            min_diff: 100,
            min_width: 320,
            max_width: 1300,
            scale_factor: 0.65,
            ..Default::default()
        };
        assert_eq!(target_widths(&p, 2048), vec![865, 562, 365]);
    }

    #[test]
    fn auto_scale_defaults() {
        assert_eq!(target_widths(&VariationPolicy::default(), 2048), vec![1024, 512, 256, 128]);
    }

    #[test]
    fn auto_scale_stops_on_small_diff() {
        let p = VariationPolicy { min_diff: 300, min_width: 10, max_width: 5000, scale_factor: 0.5, ..Default::default() };
        // 1000 -> 500 (diff 500), 250 (diff 250 < 300) stops
        assert_eq!(target_widths(&p, 1000), vec![500]);
    }

    #[test]
    fn generated_widths_respect_bounds() {
        for (factor, min_w, max_w, diff) in [(0.5, 100, 1024, 100), (0.8, 50, 900, 10), (0.3, 1, 4000, 0), (0.99, 0, 10, 0)] {
            let p = VariationPolicy {
                scale_factor: factor,
                min_width: min_w,
                max_width: max_w,
                min_diff: diff,
                ..Default::default()
            };
            for original in [1u32, 99, 640, 2048, 5000] {
                let widths = target_widths(&p, original);
                for pair in widths.windows(2) {
                    assert!(pair[0] - pair[1] >= diff);
                }
                for w in &widths {
                    assert!(*w >= min_w && *w <= max_w && *w < original);
                }
            }
        }
    }

    #[test]
    fn merges_and_dedups_explicit_and_auto_widths() {
        let p = VariationPolicy { widths: vec![512, 300], ..Default::default() };
        assert_eq!(target_widths(&p, 2048), vec![1024, 512, 300, 256, 128]);
    }

    #[test]
    fn rejects_scale_factor_of_one() {
        let p = VariationPolicy { scale_factor: 1.0, ..Default::default() };
        assert!(matches!(p.validate(), Err(ConfigError::InvalidScaleFactor(_))));
    }

    #[test]
    fn policy_and_config_validate_alike() {
        let cfg = VariationsConfig { min_width: 900, max_width: 300, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidWidthRange { min: 900, max: 300 })));
        assert!(matches!(VariationPolicy::from_config(&cfg), Err(ConfigError::InvalidWidthRange { .. })));

        let p = VariationPolicy { min_width: 900, max_width: 300, ..Default::default() };
        assert!(matches!(p.validate(), Err(ConfigError::InvalidWidthRange { min: 900, max: 300 })));
        // Without auto scaling the range is unused
        let p = VariationPolicy { auto_scale: false, ..p };
        assert!(p.validate().is_ok());
    }
}
