use bytes::Bytes;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use time::OffsetDateTime;

/// The working image as it flows through a request.
///
/// Before the source has been loaded `blob` may be empty while `width` and
/// `height` already hold the stored dimensions of the original.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub blob: Bytes,
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
    pub extension: String,
    pub transformed: bool,
}

impl Image {
    pub fn new(blob: impl Into<Bytes>, width: u32, height: u32, mime_type: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            blob: blob.into(),
            width,
            height,
            mime_type: mime_type.into(),
            extension: extension.into(),
            transformed: false,
        }
    }
}

/// Width and height of a stored variation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariationSize {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for VariationSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A single named transformation with its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformationStep {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl TransformationStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), params: BTreeMap::new() }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    /// Parses the query string notation `name:key=value,key=value`.
    pub fn parse(input: &str) -> Option<Self> {
        let (name, rest) = match input.split_once(':') {
            Some((name, rest)) => (name, Some(rest)),
            None => (input, None),
        };
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut step = Self::new(name);
        if let Some(rest) = rest {
            for pair in rest.split(',').filter(|p| !p.is_empty()) {
                let (k, v) = pair.split_once('=')?;
                step.params.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
        Some(step)
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn param_u32(&self, key: &str) -> Option<u32> {
        self.param(key).and_then(|v| v.parse().ok())
    }

    pub fn param_i64(&self, key: &str) -> Option<i64> {
        self.param(key).and_then(|v| v.parse().ok())
    }

    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.param(key).and_then(|v| v.parse().ok())
    }

    pub fn set_param(&mut self, key: &str, value: impl ToString) {
        self.params.insert(key.to_string(), value.to_string());
    }
}

impl fmt::Display for TransformationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for (i, (k, v)) in self.params.iter().enumerate() {
            let sep = if i == 0 { ':' } else { ',' };
            write!(f, "{}{}={}", sep, k, v)?;
        }
        Ok(())
    }
}

/// The ordered transformations requested for one image, plus the output
/// negotiation values that affect the rendered bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransformationChain {
    pub owner: String,
    pub image_id: String,
    pub extension: Option<String>,
    pub accept: Option<String>,
    pub steps: Vec<TransformationStep>,
}

impl TransformationChain {
    pub fn new(owner: impl Into<String>, image_id: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            image_id: image_id.into(),
            ..Default::default()
        }
    }

    pub fn with_step(mut self, step: TransformationStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = Some(accept.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseModel {
    Image(Image),
    Metadata(serde_json::Value),
    Error { status: u16, message: String },
    Empty,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub model: ResponseModel,
    pub headers: HeaderMap,
    pub last_modified: Option<OffsetDateTime>,
    /// Set when the chain was fed from a stored variation instead of the original.
    pub variation: Option<VariationSize>,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            model: ResponseModel::Empty,
            headers: HeaderMap::new(),
            last_modified: None,
            variation: None,
        }
    }
}

impl Response {
    pub fn image(&self) -> Option<&Image> {
        match &self.model {
            ResponseModel::Image(image) => Some(image),
            _ => None,
        }
    }

    pub fn image_mut(&mut self) -> Option<&mut Image> {
        match &mut self.model {
            ResponseModel::Image(image) => Some(image),
            _ => None,
        }
    }
}

/// Per-request state shared by every hook invoked for one request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub chain: TransformationChain,
    /// Image attached to the inbound request (uploads).
    pub source: Option<Image>,
    pub response: Response,
    /// Set once the response was served from the transformation cache.
    pub cache_hit: bool,
    /// Cache entry of the chain as requested. Resolved on lookup, before any
    /// hook rewrites the chain parameters.
    pub cache_entry: Option<PathBuf>,
}

impl RequestContext {
    pub fn new(chain: TransformationChain) -> Self {
        Self {
            chain,
            source: None,
            response: Response::default(),
            cache_hit: false,
            cache_entry: None,
        }
    }

    pub fn with_model(mut self, model: ResponseModel) -> Self {
        self.response.model = model;
        self
    }

    pub fn with_source(mut self, image: Image) -> Self {
        self.source = Some(image);
        self
    }

    pub fn owner(&self) -> &str {
        &self.chain.owner
    }

    pub fn image_id(&self) -> &str {
        &self.chain.image_id
    }
}
