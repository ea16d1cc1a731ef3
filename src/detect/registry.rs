use std::path::PathBuf;

use anyhow::{anyhow, Result};

use super::backend::Classifier;
use super::backends::{ReplayClassifier, StubClassifier};

/// Names accepted by [`build_classifier`].
pub const BACKEND_NAMES: &[&str] = &["stub", "replay", "tract"];

/// Classifier selection and model settings.
#[derive(Clone, Debug)]
pub struct ClassifierConfig {
    /// `stub`, `replay`, or `tract`.
    pub backend: String,
    /// ONNX model for the tract backend.
    pub model_path: Option<PathBuf>,
    /// Tried when `model_path` fails to load.
    pub fallback_model_path: Option<PathBuf>,
    /// Newline-separated class names, in model output order.
    pub labels_path: Option<PathBuf>,
    /// JSON Lines recording for the replay backend.
    pub replay_path: Option<PathBuf>,
    /// Square model input edge in pixels.
    pub input_size: u32,
    /// Detections below this score are never reported by the model backend.
    pub score_floor: f32,
    pub iou_threshold: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            backend: "stub".to_string(),
            model_path: None,
            fallback_model_path: None,
            labels_path: None,
            replay_path: None,
            input_size: 640,
            score_floor: 0.25,
            iou_threshold: 0.45,
        }
    }
}

/// Build the configured classifier. Unknown or unavailable backends are startup errors.
pub fn build_classifier(config: &ClassifierConfig) -> Result<Box<dyn Classifier>> {
    match config.backend.as_str() {
        "stub" => Ok(Box::new(StubClassifier::new())),
        "replay" => {
            let path = config
                .replay_path
                .as_ref()
                .ok_or_else(|| anyhow!("replay backend requires classifier.replay_path"))?;
            Ok(Box::new(ReplayClassifier::open(path)?))
        }
        "tract" => build_tract(config),
        other => Err(anyhow!(
            "unknown classifier backend '{}'; expected one of {}",
            other,
            BACKEND_NAMES.join(", ")
        )),
    }
}

#[cfg(feature = "backend-tract")]
fn build_tract(config: &ClassifierConfig) -> Result<Box<dyn Classifier>> {
    use super::backends::TractClassifier;

    let model_path = config
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow!("tract backend requires classifier.model_path"))?;
    let load = |path: &PathBuf| {
        TractClassifier::load(path, config.labels_path.as_ref(), config.input_size)
            .map(|backend| backend.with_thresholds(config.score_floor, config.iou_threshold))
    };
    match load(model_path) {
        Ok(backend) => Ok(Box::new(backend)),
        Err(err) => {
            let Some(fallback) = config.fallback_model_path.as_ref() else {
                return Err(err);
            };
            log::warn!(
                "model {} failed to load ({:#}); falling back to {}",
                model_path.display(),
                err,
                fallback.display()
            );
            Ok(Box::new(load(fallback)?))
        }
    }
}

#[cfg(not(feature = "backend-tract"))]
fn build_tract(_config: &ClassifierConfig) -> Result<Box<dyn Classifier>> {
    Err(anyhow!("tract backend requires the backend-tract feature"))
}
