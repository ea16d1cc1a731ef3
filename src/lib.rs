//! Cart Agent
//!
//! Edge agent for a camera-equipped shopping cart. It watches the cart
//! contents, settles noisy per-frame detections into a stable inventory, and
//! keeps the backend's record of the cart in sync.
//!
//! # Architecture
//!
//! Frame source → classifier → detection window → stabilizer → publishers.
//!
//! - The frame source drains the camera on its own thread so the loop always
//!   sees the freshest frame.
//! - The loop classifies one frame per tick and pushes its label counts into a
//!   fixed-size window.
//! - The stabilizer reports an inventory only when one whole-frame state holds
//!   at least `threshold` of the window.
//! - Publishers run fire-and-forget. Sync pushes are debounced with a
//!   heartbeat and guarded so older results never overwrite newer ones.
//!   Low-confidence frames are sampled to object storage for review.
//!
//! # Module Structure
//!
//! - `frame`, `ingest`: captured images and the draining frame source
//! - `detect`: classifier trait, backends, detection types
//! - `window`, `stabilizer`, `inventory`: consensus over recent frames
//! - `sync`, `uncertain`, `storage`: outbound publishers and their sinks
//! - `pipeline`, `agent`: per-frame processing and the orchestrating loop
//! - `config`, `clock`, `task`: configuration and injectable seams

pub mod agent;
pub mod clock;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod inventory;
pub mod pipeline;
pub mod stabilizer;
pub mod storage;
pub mod sync;
pub mod task;
pub mod uncertain;
pub mod window;

pub use agent::{AgentStats, CartAgent, Tick};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AgentConfig;
pub use detect::{build_classifier, Classifier, ClassifierConfig, Detection};
pub use frame::Frame;
pub use ingest::{open_device, CameraConfig, CaptureDevice, FrameSource};
pub use inventory::{InventoryItem, StabilizedInventory};
pub use pipeline::{Pipeline, PipelineConfig, TickReport};
pub use stabilizer::{Stabilization, Stabilizer};
pub use storage::{open_object_store, FilesystemObjectStore, HttpObjectStore, ObjectStore};
pub use sync::{HttpSyncBackend, InventoryPush, SyncBackend, SyncDecision, SyncPublisher};
pub use task::{InlineExecutor, TaskExecutor, ThreadExecutor};
pub use uncertain::{TriggerReason, UncertainCapturePublisher};
pub use window::{DetectionWindow, FrameSnapshot};

use anyhow::Result;
use std::sync::Arc;

/// Wire a complete agent from configuration: connect both publishers, warm
/// up the classifier, then open the camera.
pub fn build_agent(
    config: &AgentConfig,
    classifier: Box<dyn Classifier>,
    clock: Arc<dyn Clock>,
    executor: Arc<dyn TaskExecutor>,
) -> Result<CartAgent> {
    let backend: Arc<dyn SyncBackend> = Arc::new(HttpSyncBackend::new(&config.sync)?);
    let sync = SyncPublisher::new(
        config.device_code.clone(),
        backend,
        executor.clone(),
        clock.clone(),
        config.sync.heartbeat,
        config.sync.max_in_flight,
    );

    let uncertain = match open_object_store(&config.storage)? {
        Some(store) => {
            log::info!("uncertain captures go to {}", store.describe());
            Some(UncertainCapturePublisher::new(
                config.device_code.clone(),
                config.uncertain.clone(),
                Arc::from(store),
                executor,
                clock.clone(),
            ))
        }
        None => {
            log::info!("no object storage configured; uncertain capture disabled");
            None
        }
    };

    let mut pipeline = Pipeline::new(&config.pipeline, classifier, sync, uncertain)?;
    pipeline.warm_up()?;
    let source = FrameSource::start(open_device(&config.camera)?)?;
    Ok(CartAgent::new(source, pipeline, clock, config.tick_interval))
}
