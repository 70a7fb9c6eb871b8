use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Encodings a variation or transformed image can be written in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Jpeg,
    Webp,
    Avif,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Webp => "webp",
            OutputFormat::Avif => "avif",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Webp => "image/webp",
            OutputFormat::Avif => "image/avif",
        }
    }

    pub fn image_format(self) -> image::ImageFormat {
        match self {
            OutputFormat::Png => image::ImageFormat::Png,
            OutputFormat::Jpeg => image::ImageFormat::Jpeg,
            OutputFormat::Webp => image::ImageFormat::WebP,
            OutputFormat::Avif => image::ImageFormat::Avif,
        }
    }

    /// Maps a detected input format, if it is one we can also write.
    pub fn from_image_format(format: image::ImageFormat) -> Option<Self> {
        match format {
            image::ImageFormat::Png => Some(OutputFormat::Png),
            image::ImageFormat::Jpeg => Some(OutputFormat::Jpeg),
            image::ImageFormat::WebP => Some(OutputFormat::Webp),
            image::ImageFormat::Avif => Some(OutputFormat::Avif),
            _ => None,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "png" | "image/png" => Ok(OutputFormat::Png),
            "jpg" | "jpeg" | "image/jpeg" => Ok(OutputFormat::Jpeg),
            "webp" | "image/webp" => Ok(OutputFormat::Webp),
            "avif" | "image/avif" => Ok(OutputFormat::Avif),
            _ => Err(format!("Invalid format: {}", s)),
        }
    }
}
