use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::detect::{ClassifierConfig, BACKEND_NAMES};
use crate::ingest::CameraConfig;
use crate::pipeline::PipelineConfig;
use crate::storage::{validate_key, StorageConfig};
use crate::sync::SyncConfig;
use crate::uncertain::UncertainConfig;

pub const CONFIG_PATH_ENV: &str = "CART_AGENT_CONFIG";

const DEFAULT_DEVICE_CODE: &str = "CART-DEVICE-001";
const DEFAULT_TICK_INTERVAL_MS: u64 = 50;
const DEVICE_CODE_PATTERN: &str = r"^[A-Za-z0-9._-]{1,64}$";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AgentConfigFile {
    device_code: Option<String>,
    tick_interval_ms: Option<u64>,
    camera: Option<CameraConfigFile>,
    classifier: Option<ClassifierConfigFile>,
    stabilizer: Option<StabilizerConfigFile>,
    sync: Option<SyncConfigFile>,
    uncertain: Option<UncertainConfigFile>,
    storage: Option<StorageConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CameraConfigFile {
    device: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ClassifierConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    fallback_model_path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    replay_path: Option<PathBuf>,
    input_size: Option<u32>,
    score_floor: Option<f32>,
    iou_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StabilizerConfigFile {
    window_size: Option<usize>,
    threshold: Option<f64>,
    min_confidence: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SyncConfigFile {
    backend_url: Option<String>,
    sync_path: Option<String>,
    api_token: Option<String>,
    heartbeat_secs: Option<u64>,
    timeout_ms: Option<u64>,
    max_in_flight: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct UncertainConfigFile {
    threshold: Option<f32>,
    min_interval_secs: Option<u64>,
    confidence_delta: Option<f32>,
    jpeg_quality: Option<u8>,
    key_prefix: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StorageConfigFile {
    endpoint: Option<String>,
    bucket: Option<String>,
    token: Option<String>,
    local_dir: Option<PathBuf>,
    timeout_ms: Option<u64>,
}

/// Everything the agent needs, resolved from file, environment, and defaults.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub device_code: String,
    pub tick_interval: Duration,
    pub camera: CameraConfig,
    pub classifier: ClassifierConfig,
    pub pipeline: PipelineConfig,
    pub sync: SyncConfig,
    pub uncertain: UncertainConfig,
    pub storage: StorageConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_code: DEFAULT_DEVICE_CODE.to_string(),
            tick_interval: Duration::from_millis(DEFAULT_TICK_INTERVAL_MS),
            camera: CameraConfig::default(),
            classifier: ClassifierConfig::default(),
            pipeline: PipelineConfig::default(),
            sync: SyncConfig::default(),
            uncertain: UncertainConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Read `CART_AGENT_CONFIG` (if set), apply environment overrides, validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|path| !path.trim().is_empty());
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like [`AgentConfig::load`] with an explicit config path.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => AgentConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AgentConfigFile) -> Self {
        let mut cfg = Self::default();
        if let Some(device_code) = file.device_code {
            cfg.device_code = device_code;
        }
        if let Some(ms) = file.tick_interval_ms {
            cfg.tick_interval = Duration::from_millis(ms);
        }
        if let Some(camera) = file.camera {
            let target = &mut cfg.camera;
            target.device = camera.device.unwrap_or_else(|| target.device.clone());
            target.target_fps = camera.target_fps.unwrap_or(target.target_fps);
            target.width = camera.width.unwrap_or(target.width);
            target.height = camera.height.unwrap_or(target.height);
        }
        if let Some(classifier) = file.classifier {
            let target = &mut cfg.classifier;
            if let Some(backend) = classifier.backend {
                target.backend = backend;
            }
            target.model_path = classifier.model_path.or(target.model_path.take());
            target.fallback_model_path = classifier.fallback_model_path;
            target.labels_path = classifier.labels_path;
            target.replay_path = classifier.replay_path;
            target.input_size = classifier.input_size.unwrap_or(target.input_size);
            target.score_floor = classifier.score_floor.unwrap_or(target.score_floor);
            target.iou_threshold = classifier.iou_threshold.unwrap_or(target.iou_threshold);
        }
        if let Some(stabilizer) = file.stabilizer {
            let target = &mut cfg.pipeline;
            target.window_size = stabilizer.window_size.unwrap_or(target.window_size);
            target.stability_threshold = stabilizer.threshold.unwrap_or(target.stability_threshold);
            target.min_confidence = stabilizer.min_confidence.unwrap_or(target.min_confidence);
        }
        if let Some(sync) = file.sync {
            let target = &mut cfg.sync;
            if let Some(url) = sync.backend_url {
                target.backend_url = url;
            }
            if let Some(path) = sync.sync_path {
                target.sync_path = path;
            }
            target.api_token = sync.api_token;
            if let Some(secs) = sync.heartbeat_secs {
                target.heartbeat = Duration::from_secs(secs);
            }
            if let Some(ms) = sync.timeout_ms {
                target.request_timeout = Duration::from_millis(ms);
            }
            target.max_in_flight = sync.max_in_flight.unwrap_or(target.max_in_flight);
        }
        if let Some(uncertain) = file.uncertain {
            let target = &mut cfg.uncertain;
            target.threshold = uncertain.threshold.unwrap_or(target.threshold);
            if let Some(secs) = uncertain.min_interval_secs {
                target.min_interval = Duration::from_secs(secs);
            }
            target.confidence_delta = uncertain.confidence_delta.unwrap_or(target.confidence_delta);
            target.jpeg_quality = uncertain.jpeg_quality.unwrap_or(target.jpeg_quality);
            if let Some(prefix) = uncertain.key_prefix {
                target.key_prefix = prefix;
            }
        }
        if let Some(storage) = file.storage {
            let target = &mut cfg.storage;
            target.endpoint = storage.endpoint;
            if let Some(bucket) = storage.bucket {
                target.bucket = bucket;
            }
            target.token = storage.token;
            target.local_dir = storage.local_dir;
            if let Some(ms) = storage.timeout_ms {
                target.request_timeout = Duration::from_millis(ms);
            }
        }
        cfg
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(code) = env_string("DEVICE_CODE") {
            self.device_code = code;
        }
        if let Some(url) = env_string("BACKEND_URL") {
            self.sync.backend_url = url;
        }
        if let Some(token) = env_string("BACKEND_API_TOKEN") {
            self.sync.api_token = Some(token);
        }
        if let Some(path) = env_string("MODEL_PATH") {
            self.classifier.model_path = Some(PathBuf::from(path));
        }
        if let Some(camera) = env_string("CAMERA_INDEX") {
            self.camera.device = camera;
        }
        if let Some(size) = env_parse::<usize>("CART_WINDOW_SIZE")? {
            self.pipeline.window_size = size;
        }
        if let Some(threshold) = env_parse::<f64>("CART_STABILITY_THRESHOLD")? {
            self.pipeline.stability_threshold = threshold;
        }
        if let Some(secs) = env_parse::<u64>("CART_HEARTBEAT_SECS")? {
            self.sync.heartbeat = Duration::from_secs(secs);
        }
        if let Some(threshold) = env_parse::<f32>("CART_UNCERTAIN_THRESHOLD")? {
            self.uncertain.threshold = threshold;
        }
        if let Some(secs) = env_parse::<u64>("CART_CAPTURE_INTERVAL_SECS")? {
            self.uncertain.min_interval = Duration::from_secs(secs);
        }
        if let Some(endpoint) = env_string("STORAGE_ENDPOINT") {
            self.storage.endpoint = Some(endpoint);
        }
        if let Some(bucket) = env_string("STORAGE_BUCKET") {
            self.storage.bucket = bucket;
        }
        if let Some(token) = env_string("STORAGE_TOKEN") {
            self.storage.token = Some(token);
        }
        if let Some(dir) = env_string("STORAGE_LOCAL_DIR") {
            self.storage.local_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        validate_device_code(&self.device_code)?;

        if self.pipeline.window_size == 0 {
            return Err(anyhow!("window size must be at least 1"));
        }
        let threshold = self.pipeline.stability_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(anyhow!("stability threshold must be in (0, 1], got {}", threshold));
        }
        validate_unit("min_confidence", self.pipeline.min_confidence)?;
        validate_unit("uncertain threshold", self.uncertain.threshold)?;
        validate_unit("confidence_delta", self.uncertain.confidence_delta)?;
        validate_unit("score_floor", self.classifier.score_floor)?;
        validate_unit("iou_threshold", self.classifier.iou_threshold)?;

        if self.tick_interval.is_zero() {
            return Err(anyhow!("tick interval must be greater than zero"));
        }
        if self.sync.heartbeat.is_zero() {
            return Err(anyhow!("heartbeat interval must be greater than zero"));
        }
        if self.sync.request_timeout.is_zero() || self.storage.request_timeout.is_zero() {
            return Err(anyhow!("request timeouts must be greater than zero"));
        }
        if self.sync.max_in_flight == 0 {
            return Err(anyhow!("max_in_flight must be at least 1"));
        }
        self.sync.endpoint()?;
        if let Some(endpoint) = &self.storage.endpoint {
            url::Url::parse(endpoint)
                .with_context(|| format!("parse storage endpoint {}", endpoint))?;
        }

        self.classifier.backend = self.classifier.backend.trim().to_lowercase();
        if !BACKEND_NAMES.contains(&self.classifier.backend.as_str()) {
            return Err(anyhow!(
                "unknown classifier backend {:?} (expected one of {})",
                self.classifier.backend,
                BACKEND_NAMES.join(", ")
            ));
        }
        if !(1..=100).contains(&self.uncertain.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be in 1..=100"));
        }
        validate_key(self.uncertain.key_prefix.trim_matches('/'))
            .context("invalid uncertain key_prefix")?;
        Ok(())
    }
}

/// Device codes end up in object keys, so only path-safe characters are allowed.
pub fn validate_device_code(code: &str) -> Result<()> {
    let pattern = Regex::new(DEVICE_CODE_PATTERN)?;
    if !pattern.is_match(code) || code == "." || code == ".." {
        return Err(anyhow!("invalid device code {:?}", code));
    }
    Ok(())
}

fn validate_unit(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("{} must be in [0, 1], got {}", name, value));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<AgentConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value: {:?}", key, raw)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_codes_must_be_path_safe() {
        assert!(validate_device_code("CART-DEVICE-001").is_ok());
        assert!(validate_device_code("cart_7.b").is_ok());
        let too_long = "x".repeat(65);
        for bad in ["", "..", "cart/1", "cart 1", too_long.as_str()] {
            assert!(validate_device_code(bad).is_err(), "{:?}", bad);
        }
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let file: AgentConfigFile =
            serde_json::from_str(r#"{"stabilizer": {"window_size": 6}}"#).unwrap();
        let cfg = AgentConfig::from_file(file);
        assert_eq!(cfg.pipeline.window_size, 6);
        assert_eq!(cfg.pipeline.stability_threshold, 0.9);
        assert_eq!(cfg.sync.heartbeat, Duration::from_secs(15));
        assert_eq!(cfg.device_code, DEFAULT_DEVICE_CODE);
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let mut cfg = AgentConfig::default();
        cfg.pipeline.stability_threshold = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = AgentConfig::default();
        cfg.uncertain.threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = AgentConfig::default();
        cfg.classifier.backend = "opencv".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = AgentConfig::default();
        cfg.classifier.backend = " Replay ".to_string();
        cfg.validate().unwrap();
        assert_eq!(cfg.classifier.backend, "replay");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<AgentConfigFile>(r#"{"windw": 3}"#).is_err());
    }
}
