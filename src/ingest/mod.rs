//! Frame ingestion.
//!
//! This module provides the capture devices and the draining frame source:
//! - Synthetic device (`stub://` paths, testing and demos)
//! - USB/V4L2 devices (feature: ingest-v4l2)
//! - `FrameSource`: background drain thread publishing only the freshest frame
//!
//! The ingestion layer is responsible for:
//! - Opening the device once at startup (failure is fatal)
//! - Discarding backlog so the loop always classifies the newest image
//! - Retrying mid-run read failures with a short backoff
//! - Releasing the device handle on every exit path

mod device;
mod source;
mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use device::{open_device, resolve_device_path, CameraConfig, CaptureDevice};
pub use source::{FrameSource, SourceStats, READ_RETRY_BACKOFF};
pub use synthetic::SyntheticDevice;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Device;
