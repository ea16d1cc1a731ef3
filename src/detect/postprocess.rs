//! Decoding of YOLOv8-style detection heads.
//!
//! The head emits `[1, 4 + classes, anchors]` (channel-major) or the
//! transposed `[1, anchors, 4 + classes]`. Each anchor carries a center-format
//! box in model input pixels followed by one score per class.

use anyhow::{anyhow, Result};
use std::cmp::Ordering;

use super::result::Detection;

/// Intersection over union of two `[x1, y1, x2, y2]` boxes.
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);
    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Per-label greedy non-maximum suppression. Output is sorted by confidence, descending.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = kept.iter().any(|k| {
            k.label == candidate.label && iou(&k.bbox, &candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

/// Decode a raw YOLOv8 head into normalized detections above `score_floor`.
///
/// `labels` names the classes in output order; missing names become `class_<n>`.
pub fn decode_yolov8(
    output: &[f32],
    shape: &[usize],
    labels: &[String],
    input_size: u32,
    score_floor: f32,
) -> Result<Vec<Detection>> {
    if shape.len() != 3 || shape[0] != 1 {
        return Err(anyhow!("unexpected detection head shape {:?}", shape));
    }
    let expected: usize = shape.iter().product();
    if output.len() != expected {
        return Err(anyhow!(
            "detection head has {} values, shape {:?} needs {}",
            output.len(),
            shape,
            expected
        ));
    }
    // Anchors always outnumber channels for real heads (8400 vs 4 + classes).
    let channel_major = shape[1] <= shape[2];
    let (channels, anchors) = if channel_major {
        (shape[1], shape[2])
    } else {
        (shape[2], shape[1])
    };
    if channels <= 4 {
        return Err(anyhow!("detection head has no class channels"));
    }
    let at = |channel: usize, anchor: usize| -> f32 {
        if channel_major {
            output[channel * anchors + anchor]
        } else {
            output[anchor * channels + channel]
        }
    };

    let scale = input_size.max(1) as f32;
    let mut detections = Vec::new();
    for anchor in 0..anchors {
        let mut best_class = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for class in 0..channels - 4 {
            let score = at(4 + class, anchor);
            if score > best_score {
                best_score = score;
                best_class = class;
            }
        }
        if !best_score.is_finite() || best_score < score_floor {
            continue;
        }

        let (cx, cy, w, h) = (at(0, anchor), at(1, anchor), at(2, anchor), at(3, anchor));
        let bbox = [
            ((cx - w / 2.0) / scale).clamp(0.0, 1.0),
            ((cy - h / 2.0) / scale).clamp(0.0, 1.0),
            ((cx + w / 2.0) / scale).clamp(0.0, 1.0),
            ((cy + h / 2.0) / scale).clamp(0.0, 1.0),
        ];
        let label = labels
            .get(best_class)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", best_class));
        detections.push(Detection::new(label, best_score.min(1.0), bbox));
    }
    Ok(detections)
}
