//! Per-frame processing: classify, window, stabilize, publish.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::detect::{Classifier, Detection};
use crate::frame::Frame;
use crate::stabilizer::{Stabilization, Stabilizer};
use crate::sync::{SyncDecision, SyncPublisher, SyncStats};
use crate::uncertain::{CaptureStats, TriggerReason, UncertainCapturePublisher};
use crate::window::{DetectionWindow, FrameSnapshot};

/// Window and consensus parameters.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub window_size: usize,
    pub stability_threshold: f64,
    /// Detections below this confidence are not counted into the snapshot.
    pub min_confidence: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_size: 30,
            stability_threshold: 0.9,
            min_confidence: 0.5,
        }
    }
}

/// What one processed frame produced.
#[derive(Clone, Debug)]
pub struct TickReport {
    pub detections: usize,
    pub counted: usize,
    pub stabilization: Stabilization,
    pub sync: Option<SyncDecision>,
    pub capture: Option<TriggerReason>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub classifier_failures: u64,
    pub stable_ticks: u64,
    pub sync: SyncStats,
    pub capture: CaptureStats,
}

pub struct Pipeline {
    classifier: Box<dyn Classifier>,
    window: DetectionWindow,
    stabilizer: Stabilizer,
    min_confidence: f32,
    sync: SyncPublisher,
    uncertain: Option<UncertainCapturePublisher>,
    frames_processed: u64,
    classifier_failures: u64,
    stable_ticks: u64,
}

impl Pipeline {
    pub fn new(
        config: &PipelineConfig,
        classifier: Box<dyn Classifier>,
        sync: SyncPublisher,
        uncertain: Option<UncertainCapturePublisher>,
    ) -> Result<Self> {
        Ok(Self {
            classifier,
            window: DetectionWindow::new(config.window_size)?,
            stabilizer: Stabilizer::new(config.stability_threshold)?,
            min_confidence: config.min_confidence,
            sync,
            uncertain,
            frames_processed: 0,
            classifier_failures: 0,
            stable_ticks: 0,
        })
    }

    pub fn classifier_name(&self) -> &'static str {
        self.classifier.name()
    }

    pub fn warm_up(&mut self) -> Result<()> {
        self.classifier
            .warm_up()
            .with_context(|| format!("warm up {} classifier", self.classifier.name()))
    }

    /// Run one frame through the pipeline.
    ///
    /// A classifier error is returned before anything is modified; the
    /// caller treats it as a skipped tick.
    pub fn process_frame(&mut self, frame: &Arc<Frame>) -> Result<TickReport> {
        let detections = match self.classifier.detect(frame) {
            Ok(detections) => detections,
            Err(err) => {
                self.classifier_failures += 1;
                return Err(err).with_context(|| {
                    format!("{} classifier failed on frame {}", self.classifier.name(), frame.sequence())
                });
            }
        };
        self.frames_processed += 1;

        let capture = match self.uncertain.as_mut() {
            Some(uncertain) => uncertain.offer(frame, &detections),
            None => None,
        };

        let counted: Vec<&Detection> = detections
            .iter()
            .filter(|d| d.confidence >= self.min_confidence)
            .collect();
        self.window
            .push(FrameSnapshot::from_detections(counted.iter().copied()));

        let stabilization = self.stabilizer.stabilize(&self.window);
        let sync = match stabilization.inventory() {
            Some(inventory) => {
                self.stable_ticks += 1;
                Some(self.sync.offer(inventory))
            }
            None => None,
        };

        Ok(TickReport {
            detections: detections.len(),
            counted: counted.len(),
            stabilization,
            sync,
            capture,
        })
    }

    pub fn window(&self) -> &DetectionWindow {
        &self.window
    }

    pub fn sync_publisher(&self) -> &SyncPublisher {
        &self.sync
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            frames_processed: self.frames_processed,
            classifier_failures: self.classifier_failures,
            stable_ticks: self.stable_ticks,
            sync: self.sync.stats(),
            capture: self
                .uncertain
                .as_ref()
                .map(|u| u.stats())
                .unwrap_or_default(),
        }
    }
}
