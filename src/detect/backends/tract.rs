#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::Classifier;
use crate::detect::postprocess::{decode_yolov8, non_max_suppression};
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// Loads a local model file once and runs inference on RGB frames resized to
/// the square model input. No network I/O.
pub struct TractClassifier {
    model: TypedRunnableModel<TypedModel>,
    labels: Vec<String>,
    input_size: u32,
    score_floor: f32,
    iou_threshold: f32,
}

impl TractClassifier {
    /// Load an ONNX model and its labels file (one class name per line).
    pub fn load<P: AsRef<Path>, L: AsRef<Path>>(
        model_path: P,
        labels_path: Option<L>,
        input_size: u32,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(0, f32::fact([1, 3, size, size]).into())
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        let labels = match labels_path {
            Some(path) => read_labels(path.as_ref())?,
            None => Vec::new(),
        };

        Ok(Self {
            model,
            labels,
            input_size,
            score_floor: 0.25,
            iou_threshold: 0.45,
        })
    }

    /// Override the default score floor and NMS IoU threshold.
    pub fn with_thresholds(mut self, score_floor: f32, iou_threshold: f32) -> Self {
        self.score_floor = score_floor;
        self.iou_threshold = iou_threshold;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let image = RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", frame.width, frame.height))?;
        let resized = if frame.width == self.input_size && frame.height == self.input_size {
            image
        } else {
            image::imageops::resize(&image, self.input_size, self.input_size, FilterType::Triangle)
        };

        let size = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, channel, y, x)| {
            resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }
}

impl Classifier for TractClassifier {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let head = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let values = head
            .as_slice::<f32>()
            .context("model output tensor was not f32")?;
        let detections = decode_yolov8(
            values,
            head.shape(),
            &self.labels,
            self.input_size,
            self.score_floor,
        )?;
        Ok(non_max_suppression(detections, self.iou_threshold))
    }

    fn warm_up(&mut self) -> Result<()> {
        let size = self.input_size;
        let blank = Frame::from_rgb(vec![0u8; (size * size * 3) as usize], size, size)?;
        self.detect(&blank).map(|_| ())
    }
}

fn read_labels(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read labels file {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
