pub mod params;
pub mod pipeline;

pub use params::OutputFormat;
pub use pipeline::{MinimumInputSize, StandardPipeline, TransformationPipeline};

use crate::model::Image;
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageEncoder};
use std::io::Cursor;
use thiserror::Error;

pub const DEFAULT_QUALITY: u8 = 90;

#[derive(Error, Debug)]
pub enum TransformationError {
    #[error("Could not decode image: {0}")]
    Decode(String),
    #[error("Could not encode image as {format}: {reason}")]
    Encode { format: OutputFormat, reason: String },
    #[error("Invalid transformation parameters: {0}")]
    InvalidParameters(String),
    #[error("Transformation task failed: {0}")]
    Task(String),
}

/// Pixel operations the variation generator needs from an image library.
///
/// Implementations are called from blocking worker threads, once per
/// generated width, so they must not rely on the async runtime.
pub trait ImageProcessor: Send + Sync {
    /// Re-encodes the image in `format` without changing its dimensions.
    ///
    /// # Errors
    /// Returns `TransformationError::Decode` for unreadable input and
    /// `TransformationError::Encode` when `format` cannot be written.
    fn convert(&self, image: &Image, format: OutputFormat) -> Result<Image, TransformationError>;

    /// Scales the image to `width`, keeping the aspect ratio.
    ///
    /// The result keeps the encoding of the input and reports its actual
    /// dimensions, which may differ from `width` by rounding.
    fn resize(&self, image: &Image, width: u32) -> Result<Image, TransformationError>;
}

/// [`ImageProcessor`] backed by the `image` crate.
#[derive(Debug, Clone)]
pub struct ImageCrateProcessor {
    quality: u8,
}

impl Default for ImageCrateProcessor {
    fn default() -> Self {
        Self { quality: DEFAULT_QUALITY }
    }
}

impl ImageCrateProcessor {
    /// Creates a processor encoding lossy formats at `quality`, clamped to 1-100.
    pub fn new(quality: u8) -> Self {
        Self { quality: quality.clamp(1, 100) }
    }

    fn output_format(image: &Image, detected: Option<OutputFormat>) -> Result<OutputFormat, TransformationError> {
        image
            .extension
            .parse::<OutputFormat>()
            .ok()
            .or(detected)
            .ok_or_else(|| TransformationError::InvalidParameters(format!("unsupported output format {:?}", image.extension)))
    }
}

impl ImageProcessor for ImageCrateProcessor {
    fn convert(&self, image: &Image, format: OutputFormat) -> Result<Image, TransformationError> {
        let (img, _) = decode_image(&image.blob)?;
        let blob = encode_image(&img, format, self.quality)?;
        let (width, height) = img.dimensions();
        Ok(Image {
            blob: blob.into(),
            width,
            height,
            mime_type: format.mime_type().to_string(),
            extension: format.extension().to_string(),
            transformed: true,
        })
    }

    fn resize(&self, image: &Image, width: u32) -> Result<Image, TransformationError> {
        if width == 0 {
            return Err(TransformationError::InvalidParameters("width must be positive".into()));
        }
        let (img, detected) = decode_image(&image.blob)?;
        let format = Self::output_format(image, detected)?;
        let resized = resize_image(img, Some(width), None);
        let blob = encode_image(&resized, format, self.quality)?;
        let (width, height) = resized.dimensions();
        Ok(Image {
            blob: blob.into(),
            width,
            height,
            mime_type: format.mime_type().to_string(),
            extension: format.extension().to_string(),
            transformed: true,
        })
    }
}

/// Decodes raw image bytes, detecting the format from magic bytes.
///
/// # Parameters
/// * `bytes` - Raw encoded image data
///
/// # Returns
/// Tuple of `(DynamicImage, Option<OutputFormat>)`. The format is `None` when
/// the input decodes but is not one we can also write.
///
/// # Errors
/// Returns `TransformationError::Decode` if:
/// - Format cannot be detected from magic bytes
/// - Image data is corrupted or malformed
pub fn decode_image(bytes: &[u8]) -> Result<(DynamicImage, Option<OutputFormat>), TransformationError> {
    let guessed = image::guess_format(bytes).map_err(|e| TransformationError::Decode(e.to_string()))?;
    let img = image::load_from_memory_with_format(bytes, guessed)
        .map_err(|e| TransformationError::Decode(e.to_string()))?;
    Ok((img, OutputFormat::from_image_format(guessed)))
}

/// Resizes with Lanczos3, scaling the missing dimension proportionally.
///
/// # Parameters
/// * `img` - Source image to resize
/// * `w` - Target width (optional)
/// * `h` - Target height (optional)
///
/// # Behavior
/// - Both specified: resize to exact dimensions
/// - Only width: scale height proportionally, rounded
/// - Only height: scale width proportionally, rounded
/// - Neither: return the original
///
/// Dimensions are clamped to at least one pixel.
pub fn resize_image(img: DynamicImage, w: Option<u32>, h: Option<u32>) -> DynamicImage {
    let (orig_w, orig_h) = img.dimensions();
    let (target_w, target_h) = match (w, h) {
        (None, None) => return img,
        (Some(w), Some(h)) => (w, h),
        (Some(w), None) => (w, (orig_h as f64 * w as f64 / orig_w as f64).round() as u32),
        (None, Some(h)) => ((orig_w as f64 * h as f64 / orig_h as f64).round() as u32, h),
    };

    img.resize_exact(target_w.max(1), target_h.max(1), image::imageops::FilterType::Lanczos3)
}

/// Encodes the image for storage or transmission.
///
/// # Parameters
/// * `img` - Image to encode
/// * `fmt` - Target output format
/// * `quality` - Compression quality for JPEG and AVIF, clamped to 1-100
///
/// PNG and WebP are written lossless through `image`'s own encoders.
///
/// # Errors
/// Returns `TransformationError::Encode` on encoder failures.
pub fn encode_image(img: &DynamicImage, fmt: OutputFormat, quality: u8) -> Result<Vec<u8>, TransformationError> {
    let mut out = Vec::new();
    let encode_err = |e: image::ImageError| TransformationError::Encode { format: fmt, reason: e.to_string() };
    let q = quality.clamp(1, 100);

    match fmt {
        OutputFormat::Jpeg => {
            let rgb = img.to_rgb8();
            let (w, h) = rgb.dimensions();
            JpegEncoder::new_with_quality(&mut out, q)
                .write_image(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)
                .map_err(encode_err)?;
        }
        OutputFormat::Avif => {
            let rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            // Speed 4 balances encoding time and compression ratio
            AvifEncoder::new_with_speed_quality(&mut out, 4, q)
                .write_image(rgba.as_raw(), w, h, ExtendedColorType::Rgba8)
                .map_err(encode_err)?;
        }
        OutputFormat::Png | OutputFormat::Webp => {
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            rgba.write_to(&mut Cursor::new(&mut out), fmt.image_format()).map_err(encode_err)?;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png(width: u32, height: u32) -> Image {
        let img = DynamicImage::new_rgb8(width, height);
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png).unwrap();
        Image::new(buf, width, height, "image/png", "png")
    }

    #[test]
    fn resize_keeps_aspect_ratio() {
        let processor = ImageCrateProcessor::default();
        let out = processor.resize(&png(200, 100), 50).unwrap();
        assert_eq!((out.width, out.height), (50, 25));
        assert_eq!(out.extension, "png");
        let (decoded, format) = decode_image(&out.blob).unwrap();
        assert_eq!(decoded.dimensions(), (50, 25));
        assert_eq!(format, Some(OutputFormat::Png));
    }

    #[test]
    fn convert_switches_encoding() {
        let processor = ImageCrateProcessor::default();
        let jpeg = processor.convert(&png(16, 16), OutputFormat::Jpeg).unwrap();
        assert_eq!(jpeg.mime_type, "image/jpeg");
        let back = processor.convert(&jpeg, OutputFormat::Png).unwrap();
        assert_eq!(back.extension, "png");
        assert_eq!((back.width, back.height), (16, 16));
    }

    #[test]
    fn garbage_fails_to_decode() {
        let processor = ImageCrateProcessor::default();
        let broken = Image::new(vec![1u8, 2, 3], 10, 10, "image/png", "png");
        assert!(matches!(processor.resize(&broken, 5), Err(TransformationError::Decode(_))));
    }
}
