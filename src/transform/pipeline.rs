use crate::model::{TransformationChain, TransformationStep};

/// Smallest source dimensions that still satisfy a chain, and the index of the
/// step that decided them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinimumInputSize {
    pub index: usize,
    pub width: u32,
    pub height: u32,
}

/// What variation selection needs to know about the transformation chain.
pub trait TransformationPipeline: Send + Sync {
    /// Returns `None` when the chain needs the full original.
    fn minimum_input_size(&self, chain: &TransformationChain, width: u32, height: u32) -> Option<MinimumInputSize>;

    /// Rescales the size dependent parameters of steps `0..=index` for an input
    /// that is `ratio` times smaller than the original. Returns how many steps changed.
    fn adjust_parameters(&self, chain: &mut TransformationChain, index: usize, ratio: f64) -> usize;
}

enum Constraint {
    /// The step does not change the size
    NoTransformation,
    /// Nothing after this step can be resolved against the input size
    StopResolving,
    Size { width: f64, height: f64 },
    Rotation(f64),
}

/// Resolves the built-in transformations: `maxSize`, `resize`, `thumbnail`,
/// `crop`, `rotate`, `border`, `watermark`, `canvas` and `autoRotate`. Other
/// steps are treated as size neutral.
#[derive(Debug, Clone, Default)]
pub struct StandardPipeline;

impl StandardPipeline {
    pub fn new() -> Self {
        Self
    }

    fn constraint(step: &TransformationStep, input: (f64, f64)) -> Constraint {
        let (iw, ih) = input;
        match step.name.as_str() {
            "maxSize" => {
                let rw = step.param_f64("width").filter(|w| *w > 0.0 && *w < iw).map(|w| w / iw);
                let rh = step.param_f64("height").filter(|h| *h > 0.0 && *h < ih).map(|h| h / ih);
                match (rw, rh) {
                    (None, None) => Constraint::NoTransformation,
                    (Some(r), None) | (None, Some(r)) => Constraint::Size { width: iw * r, height: ih * r },
                    (Some(a), Some(b)) => {
                        let r = a.min(b);
                        Constraint::Size { width: iw * r, height: ih * r }
                    }
                }
            }
            "resize" => match (step.param_f64("width"), step.param_f64("height")) {
                (Some(w), Some(h)) => Constraint::Size { width: w, height: h },
                (Some(w), None) if iw > 0.0 => Constraint::Size { width: w, height: ih * w / iw },
                (None, Some(h)) if ih > 0.0 => Constraint::Size { width: iw * h / ih, height: h },
                _ => Constraint::NoTransformation,
            },
            "thumbnail" => {
                let w = step.param_f64("width").unwrap_or(50.0);
                let h = step.param_f64("height").unwrap_or(50.0);
                if iw <= 0.0 || ih <= 0.0 {
                    return Constraint::NoTransformation;
                }
                let r = match step.param("fit") {
                    Some("inset") => (w / iw).min(h / ih),
                    _ => (w / iw).max(h / ih),
                };
                Constraint::Size { width: iw * r, height: ih * r }
            }
            "rotate" => match step.param_f64("angle") {
                Some(angle) if angle % 90.0 == 0.0 => Constraint::Rotation(angle),
                _ => Constraint::StopResolving,
            },
            "canvas" | "autoRotate" => Constraint::StopResolving,
            _ => Constraint::NoTransformation,
        }
    }

    fn extracted_region(step: &TransformationStep, input: (f64, f64)) -> Option<(f64, f64)> {
        if step.name != "crop" {
            return None;
        }
        let w = step.param_f64("width")?;
        let h = step.param_f64("height")?;
        (w > 0.0 && h > 0.0 && (w < input.0 || h < input.1)).then_some((w, h))
    }
}

impl TransformationPipeline for StandardPipeline {
    fn minimum_input_size(&self, chain: &TransformationChain, width: u32, height: u32) -> Option<MinimumInputSize> {
        if chain.steps.is_empty() || width == 0 || height == 0 {
            return None;
        }

        let (orig_w, orig_h) = (width as f64, height as f64);
        let (mut min_w, mut min_h, mut index) = (orig_w, orig_h, 0usize);
        let mut input = (orig_w, orig_h);
        let mut region: Option<(f64, f64)> = None;
        let mut flipped = false;

        for (i, step) in chain.steps.iter().enumerate() {
            // Only the first region matters for the input size
            if region.is_none() {
                if let Some(r) = Self::extracted_region(step, input) {
                    region = Some(r);
                    index = i;
                }
            }

            match Self::constraint(step, input) {
                Constraint::NoTransformation => continue,
                Constraint::StopResolving => break,
                Constraint::Size { width, height } => {
                    if width < min_w || height < min_h {
                        min_w = width;
                        min_h = height;
                        if region.is_none() {
                            index = i;
                        }
                    }
                }
                Constraint::Rotation(angle) => {
                    if angle % 180.0 != 0.0 {
                        input = (input.1, input.0);
                        flipped = !flipped;
                    }
                }
            }
        }

        match region {
            Some((region_w, _)) if min_w > 0.0 => {
                min_w *= orig_w / region_w;
                min_h = min_w / (orig_w / orig_h);
            }
            _ if flipped => std::mem::swap(&mut min_w, &mut min_h),
            _ => {}
        }

        if min_w >= orig_w || min_h >= orig_h {
            return None;
        }

        Some(MinimumInputSize {
            index,
            width: min_w.ceil() as u32,
            height: min_h.ceil() as u32,
        })
    }

    fn adjust_parameters(&self, chain: &mut TransformationChain, index: usize, ratio: f64) -> usize {
        if !(ratio.is_finite() && ratio > 0.0) {
            return 0;
        }

        let keys: &[&str] = &["x", "y", "width", "height"];
        let mut adjusted = 0;
        for step in chain.steps.iter_mut().take(index.saturating_add(1)) {
            let params: &[&str] = match step.name.as_str() {
                "crop" | "watermark" => keys,
                "border" => &keys[2..],
                _ => continue,
            };
            let mut changed = false;
            for key in params {
                if let Some(value) = step.param_f64(key) {
                    step.set_param(key, (value / ratio).round() as i64);
                    changed = true;
                }
            }
            if changed {
                adjusted += 1;
            }
        }
        adjusted
    }
}
