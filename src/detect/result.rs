use serde::{Deserialize, Serialize};

/// One labeled, scored bounding box from a classifier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Product label as named by the model.
    pub label: String,
    /// Confidence in [0, 1].
    pub confidence: f32,
    /// Normalized `[x1, y1, x2, y2]` in 0..1 image coordinates.
    #[serde(default)]
    pub bbox: [f32; 4],
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: [f32; 4]) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
        }
    }
}

/// Mean confidence of a detection list, `None` when empty.
pub fn mean_confidence(detections: &[Detection]) -> Option<f32> {
    if detections.is_empty() {
        return None;
    }
    let sum: f32 = detections.iter().map(|d| d.confidence).sum();
    Some(sum / detections.len() as f32)
}
