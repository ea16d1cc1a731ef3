//! Opportunistic sampling of frames the classifier is unsure about.
//!
//! A frame is captured when it holds at least one low-confidence detection,
//! the minimum interval since the previous capture has passed, and its
//! detections differ from the previously captured ones (another label
//! multiset, or a mean-confidence shift beyond `confidence_delta`).
//!
//! Each capture writes two objects, `{prefix}/{device}/{id}.jpg` and
//! `{prefix}/{device}/{id}.json`, from a background task. Upload failures are
//! logged and otherwise ignored.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::clock::{epoch_millis, Clock};
use crate::detect::{mean_confidence, Detection};
use crate::frame::Frame;
use crate::storage::{ObjectStore, CONTENT_TYPE_JPEG, CONTENT_TYPE_JSON};
use crate::task::TaskExecutor;
use crate::window::FrameSnapshot;

#[derive(Clone, Debug)]
pub struct UncertainConfig {
    /// Detections below this confidence make a frame a capture candidate.
    pub threshold: f32,
    pub min_interval: Duration,
    /// Mean-confidence shift that counts as a different composition.
    pub confidence_delta: f32,
    pub jpeg_quality: u8,
    pub key_prefix: String,
}

impl Default for UncertainConfig {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            min_interval: Duration::from_secs(10),
            confidence_delta: 0.05,
            jpeg_quality: 85,
            key_prefix: "uncertain".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    /// Nothing captured yet.
    FirstCapture,
    LabelsChanged,
    ConfidenceShift,
}

/// What was captured last; used only to dedupe captures.
#[derive(Clone, Debug, Default)]
pub struct UncertainCaptureState {
    pub last_capture_at: Option<Instant>,
    pub last_capture_detections: Vec<Detection>,
}

/// Decide whether `detections` should be captured now.
pub fn evaluate_trigger(
    config: &UncertainConfig,
    state: &UncertainCaptureState,
    detections: &[Detection],
    now: Instant,
) -> Option<TriggerReason> {
    if !detections.iter().any(|d| d.confidence < config.threshold) {
        return None;
    }
    let Some(last_at) = state.last_capture_at else {
        return Some(TriggerReason::FirstCapture);
    };
    if now.saturating_duration_since(last_at) <= config.min_interval {
        return None;
    }

    let previous = &state.last_capture_detections;
    if FrameSnapshot::from_detections(detections).canonical()
        != FrameSnapshot::from_detections(previous).canonical()
    {
        return Some(TriggerReason::LabelsChanged);
    }
    let shift = match (mean_confidence(detections), mean_confidence(previous)) {
        (Some(current), Some(last)) => (current - last).abs(),
        _ => 0.0,
    };
    if shift > config.confidence_delta {
        return Some(TriggerReason::ConfidenceShift);
    }
    None
}

/// Collision-free object id: capture time in epoch millis plus a random suffix.
pub fn capture_id(captured_at: SystemTime) -> String {
    let millis = epoch_millis(captured_at).unwrap_or(0);
    let mut suffix = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!("{}-{}", millis, hex::encode(suffix))
}

pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder
        .encode(
            frame.pixels(),
            frame.width,
            frame.height,
            image::ExtendedColorType::Rgb8,
        )
        .context("encode jpeg")?;
    Ok(out)
}

#[derive(Debug, Serialize)]
struct CaptureMetadata<'a> {
    captured_at_ms: u64,
    device_code: &'a str,
    reason: TriggerReason,
    detections: &'a [Detection],
    mean_confidence: Option<f32>,
    width: u32,
    height: u32,
    image_key: &'a str,
    image_sha256: String,
}

#[derive(Debug, Default)]
struct CaptureCounters {
    triggered: AtomicU64,
    uploaded: AtomicU64,
    failed: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub triggered: u64,
    pub uploaded: u64,
    pub failed: u64,
}

pub struct UncertainCapturePublisher {
    device_code: String,
    config: UncertainConfig,
    store: Arc<dyn ObjectStore>,
    executor: Arc<dyn TaskExecutor>,
    clock: Arc<dyn Clock>,
    state: UncertainCaptureState,
    counters: Arc<CaptureCounters>,
}

impl UncertainCapturePublisher {
    pub fn new(
        device_code: impl Into<String>,
        config: UncertainConfig,
        store: Arc<dyn ObjectStore>,
        executor: Arc<dyn TaskExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            device_code: device_code.into(),
            config,
            store,
            executor,
            clock,
            state: UncertainCaptureState::default(),
            counters: Arc::new(CaptureCounters::default()),
        }
    }

    /// Evaluate this tick's detections and dispatch an upload when triggered.
    ///
    /// The dedupe state advances at dispatch, so a failed upload is not retried.
    pub fn offer(&mut self, frame: &Arc<Frame>, detections: &[Detection]) -> Option<TriggerReason> {
        let now = self.clock.now();
        let reason = evaluate_trigger(&self.config, &self.state, detections, now)?;
        self.state = UncertainCaptureState {
            last_capture_at: Some(now),
            last_capture_detections: detections.to_vec(),
        };
        self.counters.triggered.fetch_add(1, Ordering::Relaxed);

        let stem = format!(
            "{}/{}/{}",
            self.config.key_prefix.trim_matches('/'),
            self.device_code,
            capture_id(frame.captured_at)
        );
        let capture = PendingCapture {
            frame: frame.clone(),
            detections: detections.to_vec(),
            reason,
            device_code: self.device_code.clone(),
            stem,
            jpeg_quality: self.config.jpeg_quality,
        };
        let store = self.store.clone();
        let counters = self.counters.clone();
        self.executor.spawn(
            "cart-uncertain",
            Box::new(move || match capture.upload(store.as_ref()) {
                Ok(key) => {
                    counters.uploaded.fetch_add(1, Ordering::Relaxed);
                    log::info!("uploaded uncertain capture {} ({:?})", key, reason);
                }
                Err(err) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    log::warn!("uncertain capture upload failed: {:#}", err);
                }
            }),
        );
        Some(reason)
    }

    pub fn state(&self) -> &UncertainCaptureState {
        &self.state
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            triggered: self.counters.triggered.load(Ordering::Relaxed),
            uploaded: self.counters.uploaded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

struct PendingCapture {
    frame: Arc<Frame>,
    detections: Vec<Detection>,
    reason: TriggerReason,
    device_code: String,
    stem: String,
    jpeg_quality: u8,
}

impl PendingCapture {
    /// Encode and write both objects. Returns the image key.
    fn upload(&self, store: &dyn ObjectStore) -> Result<String> {
        let jpeg = encode_jpeg(&self.frame, self.jpeg_quality)?;
        let image_key = format!("{}.jpg", self.stem);
        let metadata = CaptureMetadata {
            captured_at_ms: epoch_millis(self.frame.captured_at).unwrap_or(0),
            device_code: &self.device_code,
            reason: self.reason,
            detections: &self.detections,
            mean_confidence: mean_confidence(&self.detections),
            width: self.frame.width,
            height: self.frame.height,
            image_key: &image_key,
            image_sha256: hex::encode(Sha256::digest(&jpeg)),
        };
        let metadata = serde_json::to_vec_pretty(&metadata).context("serialize capture metadata")?;

        store
            .put(&image_key, &jpeg, CONTENT_TYPE_JPEG)
            .with_context(|| format!("put {}", image_key))?;
        let metadata_key = format!("{}.json", self.stem);
        store
            .put(&metadata_key, &metadata, CONTENT_TYPE_JSON)
            .with_context(|| format!("put {}", metadata_key))?;
        Ok(image_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::FilesystemObjectStore;
    use crate::task::InlineExecutor;
    use anyhow::anyhow;
    use std::path::Path;

    fn det(label: &str, confidence: f32) -> Detection {
        Detection::new(label, confidence, [0.1, 0.1, 0.5, 0.5])
    }

    fn frame() -> Arc<Frame> {
        Arc::new(Frame::from_rgb(vec![128; 8 * 8 * 3], 8, 8).unwrap())
    }

    fn files_with_extension(root: &Path, ext: &str) -> Vec<std::path::PathBuf> {
        let mut out = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().map_or(false, |e| e == ext) {
                    out.push(path);
                }
            }
        }
        out
    }

    #[test]
    fn confident_frames_never_trigger() {
        let config = UncertainConfig::default();
        let state = UncertainCaptureState::default();
        let now = Instant::now();
        assert_eq!(evaluate_trigger(&config, &state, &[], now), None);
        assert_eq!(
            evaluate_trigger(&config, &state, &[det("apple", 0.95)], now),
            None
        );
        assert_eq!(
            evaluate_trigger(&config, &state, &[det("apple", 0.95), det("spam", 0.3)], now),
            Some(TriggerReason::FirstCapture)
        );
    }

    #[test]
    fn composition_must_change_after_interval() {
        let config = UncertainConfig::default();
        let t0 = Instant::now();
        let state = UncertainCaptureState {
            last_capture_at: Some(t0),
            last_capture_detections: vec![det("apple", 0.40)],
        };
        let later = t0 + Duration::from_secs(11);

        // Inside the interval nothing triggers, even a new label.
        assert_eq!(
            evaluate_trigger(&config, &state, &[det("spam", 0.4)], t0 + Duration::from_secs(5)),
            None
        );
        assert_eq!(
            evaluate_trigger(&config, &state, &[det("apple", 0.42)], later),
            None
        );
        assert_eq!(
            evaluate_trigger(&config, &state, &[det("apple", 0.55)], later),
            Some(TriggerReason::ConfidenceShift)
        );
        assert_eq!(
            evaluate_trigger(&config, &state, &[det("apple", 0.4), det("apple", 0.4)], later),
            Some(TriggerReason::LabelsChanged)
        );
    }

    #[test]
    fn repeated_uncertain_frames_upload_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FilesystemObjectStore::new(dir.path()).unwrap());
        let clock = Arc::new(ManualClock::new());
        let mut publisher = UncertainCapturePublisher::new(
            "CART-TEST",
            UncertainConfig::default(),
            store,
            Arc::new(InlineExecutor),
            clock.clone(),
        );

        let frame = frame();
        assert_eq!(
            publisher.offer(&frame, &[det("apple", 0.40)]),
            Some(TriggerReason::FirstCapture)
        );
        clock.advance(Duration::from_millis(50));
        assert_eq!(publisher.offer(&frame, &[det("apple", 0.41)]), None);

        assert_eq!(files_with_extension(dir.path(), "jpg").len(), 1);
        let metadata = files_with_extension(dir.path(), "json");
        assert_eq!(metadata.len(), 1);
        assert!(metadata[0].starts_with(dir.path().join("uncertain").join("CART-TEST")));

        let parsed: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&metadata[0]).unwrap()).unwrap();
        assert_eq!(parsed["device_code"], "CART-TEST");
        assert_eq!(parsed["reason"], "first_capture");
        assert_eq!(parsed["detections"][0]["label"], "apple");
        assert_eq!(parsed["width"], 8);
        assert_eq!(parsed["image_sha256"].as_str().unwrap().len(), 64);
        assert_eq!(publisher.stats().uploaded, 1);
    }

    struct FailingStore;

    impl ObjectStore for FailingStore {
        fn put(&self, key: &str, _bytes: &[u8], _content_type: &str) -> Result<()> {
            Err(anyhow!("storage offline for {}", key))
        }

        fn describe(&self) -> String {
            "failing".to_string()
        }
    }

    #[test]
    fn upload_failure_is_counted_and_not_retried() {
        let clock = Arc::new(ManualClock::new());
        let mut publisher = UncertainCapturePublisher::new(
            "CART-TEST",
            UncertainConfig::default(),
            Arc::new(FailingStore),
            Arc::new(InlineExecutor),
            clock.clone(),
        );
        let frame = frame();
        assert!(publisher.offer(&frame, &[det("apple", 0.3)]).is_some());
        clock.advance(Duration::from_secs(1));
        assert!(publisher.offer(&frame, &[det("apple", 0.3)]).is_none());
        assert_eq!(
            publisher.stats(),
            CaptureStats {
                triggered: 1,
                uploaded: 0,
                failed: 1
            }
        );
    }

    #[test]
    fn capture_ids_do_not_collide() {
        let at = SystemTime::now();
        let a = capture_id(at);
        let b = capture_id(at);
        assert_ne!(a, b);
        assert!(a.starts_with(&epoch_millis(at).unwrap().to_string()));
    }

    #[test]
    fn jpeg_encoding_produces_jfif() {
        let jpeg = encode_jpeg(&frame(), 85).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
