use mediacache::config::{AdapterConfig, MediaCacheConfig};
use mediacache::transform::{decode_image, ImageCrateProcessor, OutputFormat};
use mediacache::variations::{VariationGenerator, VariationPolicy, VariationStores};
use mediacache::{Image, TransformationResultCache};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;

const USAGE: &str = "usage: mediacache generate <owner> <file>...\n       mediacache purge <owner> <image-id>";

/// Maintenance tool for the variation pool and transformation cache.
///
/// # Configuration
/// Environment variables:
/// - `MEDIACACHE_CONFIG`: JSON config file (optional, defaults otherwise)
/// - `MEDIACACHE_CACHE_PATH`: overrides the transformation cache root
/// - `RUST_LOG`: logging verbosity (default: "mediacache=debug")
///
/// Without adapter settings, variations go to a sled database in `./variations`.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mediacache=debug".into()),
        )
        .init();

    let mut cfg = match std::env::var("MEDIACACHE_CONFIG") {
        Ok(path) => MediaCacheConfig::from_file(path)?,
        Err(_) => MediaCacheConfig::default(),
    }
    .apply_env();

    let fallback = AdapterConfig::Sled { path: PathBuf::from("./variations") };
    cfg.variations.database.get_or_insert_with(|| fallback.clone());
    cfg.variations.storage.get_or_insert(fallback);
    cfg.variations.validate()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["generate", owner, files @ ..] if !files.is_empty() => {
            let generator = VariationGenerator::new(
                VariationPolicy::from_config(&cfg.variations)?,
                VariationStores::from_config(&cfg.variations)?,
                Arc::new(ImageCrateProcessor::default()),
            )?;

            for file in files {
                let bytes = tokio::fs::read(file).await?;
                let (decoded, format) = decode_image(&bytes)?;
                let format = format.unwrap_or(OutputFormat::Png);
                let image_id = hex::encode(Sha256::digest(&bytes));
                let image = Image::new(bytes, decoded.width(), decoded.height(), format.mime_type(), format.extension());

                let report = generator.generate(owner, &image_id, &image).await;
                let widths: Vec<String> = report.generated.iter().map(|s| s.to_string()).collect();
                println!("{} {} [{}]", file, image_id, widths.join(", "));
                for (width, e) in &report.failed {
                    eprintln!("{} width {}: {}", file, width, e);
                }
            }
        }
        ["purge", owner, image_id] => {
            cfg.transformation_cache.validate()?;
            let stores = VariationStores::from_config(&cfg.variations)?;
            let generator = VariationGenerator::new(
                VariationPolicy::from_config(&cfg.variations)?,
                stores,
                Arc::new(ImageCrateProcessor::default()),
            )?;
            generator.delete_variations(owner, image_id).await;

            let cache = TransformationResultCache::new(&cfg.transformation_cache)?;
            cache.delete_from_cache(owner, image_id).await?;
            tracing::info!("Purged variations and cached transformations for {}/{}", owner, image_id);
        }
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }

    Ok(())
}
