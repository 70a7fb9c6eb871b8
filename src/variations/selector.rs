use crate::hooks::Flow;
use crate::model::{RequestContext, VariationSize};
use crate::transform::TransformationPipeline;
use crate::variations::{PrimaryBlobStore, VariationStores};
use crate::VARIATION_HEADER;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use std::sync::Arc;

/// Picks a stored variation as the transformation input when the chain
/// downsizes far enough that the original is not needed.
#[derive(Clone)]
pub struct VariationSelector {
    stores: VariationStores,
    pipeline: Arc<dyn TransformationPipeline>,
    primary: Arc<dyn PrimaryBlobStore>,
}

impl VariationSelector {
    pub fn new(stores: VariationStores, pipeline: Arc<dyn TransformationPipeline>, primary: Arc<dyn PrimaryBlobStore>) -> Self {
        Self { stores, pipeline, primary }
    }

    /// Substitutes the working image with the best matching variation.
    ///
    /// The response model must already carry the original dimensions. Returns
    /// `Flow::Stop` when a variation was loaded, so the original is never
    /// fetched; any lookup failure leaves the request untouched.
    pub async fn choose_variation(&self, ctx: &mut RequestContext) -> Flow {
        if ctx.chain.steps.is_empty() {
            return Flow::Continue;
        }
        let Some((width, height)) = ctx.response.image().map(|i| (i.width, i.height)) else {
            return Flow::Continue;
        };
        let Some(minimum) = self.pipeline.minimum_input_size(&ctx.chain, width, height) else {
            return Flow::Continue;
        };
        if minimum.width >= width {
            return Flow::Continue;
        }

        let owner = ctx.owner().to_string();
        let image_id = ctx.image_id().to_string();
        let Some((variation, blob)) = self.find(&owner, &image_id, minimum.width, width).await else {
            return Flow::Continue;
        };

        let ratio = width as f64 / variation.width as f64;
        let adjusted = self.pipeline.adjust_parameters(&mut ctx.chain, minimum.index, ratio);
        tracing::debug!(
            "Using variation {} for {}/{} (needs {}px, ratio {:.3}, {} steps adjusted)",
            variation,
            owner,
            image_id,
            minimum.width,
            ratio,
            adjusted
        );

        // The primary store load is skipped, so stamp what it would have set
        match self.primary.last_modified(&owner, &image_id).await {
            Ok(ts) => ctx.response.last_modified = Some(ts),
            Err(e) => tracing::warn!("Could not read last modified for {} ({}): {}", owner, image_id, e),
        }

        if let Some(image) = ctx.response.image_mut() {
            image.blob = blob;
            image.width = variation.width;
            image.height = variation.height;
        }
        if let Ok(value) = HeaderValue::from_str(&variation.to_string()) {
            ctx.response.headers.insert(HeaderName::from_static(VARIATION_HEADER), value);
        }
        ctx.response.variation = Some(variation);

        Flow::Stop
    }

    async fn find(&self, owner: &str, image_id: &str, min_width: u32, original_width: u32) -> Option<(VariationSize, Bytes)> {
        let variation = match self.stores.database.best_match(owner, image_id, min_width).await {
            Ok(Some(v)) => v,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Variation lookup failed for {} ({}): {}", owner, image_id, e);
                return None;
            }
        };

        // Whatever the adapter returns, never feed a narrower or full-size input
        if variation.width < min_width || variation.width >= original_width {
            tracing::warn!(
                "Ignoring variation {} for {} ({}): outside {}..{}",
                variation,
                owner,
                image_id,
                min_width,
                original_width
            );
            return None;
        }

        match self.stores.storage.get(owner, image_id, variation.width).await {
            Ok(Some(blob)) => Some((variation, blob)),
            Ok(None) => {
                tracing::warn!(
                    "Image variation storage is not in sync with the image variation database: {} ({}) width {}",
                    owner,
                    image_id,
                    variation.width
                );
                None
            }
            Err(e) => {
                tracing::warn!("Could not load image variation for {} ({}), width {}: {}", owner, image_id, variation.width, e);
                None
            }
        }
    }
}
