use anyhow::Result;

use super::synthetic::SyntheticDevice;
use crate::frame::Frame;

/// Camera configuration shared by all device backends.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Device path (`/dev/video0`), bare index (`0`), or `stub://name`.
    pub device: String,
    /// Target frame rate. Synthetic devices pace themselves to this rate.
    pub target_fps: u32,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "0".to_string(),
            target_fps: 30,
            width: 640,
            height: 480,
        }
    }
}

/// A capture device with an internal frame queue.
///
/// `FrameSource` owns the device on its drain thread. Implementations only
/// need to be `Send`; they are never shared.
pub trait CaptureDevice: Send {
    /// Human-readable device identifier for logs.
    fn describe(&self) -> String;

    /// Acquire the device handle. Called exactly once before any read.
    fn open(&mut self) -> Result<()>;

    /// Fetch the next frame from the device queue, blocking until one is ready.
    fn read_frame(&mut self) -> Result<Frame>;

    /// True when more frames are already queued behind the one just read.
    ///
    /// Must not block.
    fn frames_pending(&mut self) -> bool;

    /// Release the device handle. Must be idempotent.
    fn close(&mut self);
}

/// Map a bare camera index to its device node; other values pass through.
pub fn resolve_device_path(device: &str) -> String {
    let trimmed = device.trim();
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        return format!("/dev/video{}", trimmed);
    }
    trimmed.to_string()
}

/// Build an unopened device for the configured camera.
pub fn open_device(config: &CameraConfig) -> Result<Box<dyn CaptureDevice>> {
    let path = resolve_device_path(&config.device);
    if path.starts_with("stub://") {
        let mut config = config.clone();
        config.device = path;
        return Ok(Box::new(SyntheticDevice::new(config)));
    }
    #[cfg(feature = "ingest-v4l2")]
    {
        let mut config = config.clone();
        config.device = path;
        Ok(Box::new(super::v4l2::V4l2Device::new(config)))
    }
    #[cfg(not(feature = "ingest-v4l2"))]
    {
        anyhow::bail!(
            "camera device {} requires the ingest-v4l2 feature (use stub:// for synthetic frames)",
            path
        )
    }
}
