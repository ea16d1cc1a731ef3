//! cart_agent - smart cart edge daemon
//!
//! 1. Opens the camera and drains it on a background thread
//! 2. Classifies the freshest frame every tick
//! 3. Settles detections into a stable inventory over a sliding window
//! 4. Syncs the inventory to the backend (on change, or on heartbeat)
//! 5. Samples low-confidence frames to object storage

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cart_agent::{build_agent, build_classifier, task, AgentConfig, SystemClock};

#[derive(Parser, Debug)]
#[command(author, version, about = "Smart cart edge agent")]
struct Args {
    /// JSON or TOML config file. Environment variables override its values.
    #[arg(long, env = "CART_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Classifier backend override: stub, replay, or tract.
    #[arg(long, env = "CART_CLASSIFIER_BACKEND")]
    backend: Option<String>,

    /// JSON Lines detection recording for the replay backend.
    #[arg(long, env = "CART_REPLAY_PATH")]
    replay: Option<PathBuf>,

    /// Camera override: index, device path, or stub:// URL.
    #[arg(long)]
    camera: Option<String>,

    /// Stop after this many ticks.
    #[arg(long)]
    max_ticks: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = AgentConfig::load_from(args.config.as_deref())?;
    if let Some(backend) = args.backend {
        config.classifier.backend = backend.trim().to_lowercase();
    }
    if let Some(replay) = args.replay {
        config.classifier.replay_path = Some(replay);
    }
    if let Some(camera) = args.camera {
        config.camera.device = camera;
    }
    log::info!(
        "cart agent {} starting: device_code={} camera={} window={} threshold={} heartbeat={}s",
        env!("CARGO_PKG_VERSION"),
        config.device_code,
        config.camera.device,
        config.pipeline.window_size,
        config.pipeline.stability_threshold,
        config.sync.heartbeat.as_secs()
    );

    let classifier = build_classifier(&config.classifier)?;
    let agent = build_agent(
        &config,
        classifier,
        Arc::new(SystemClock),
        task::thread_executor(),
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("set ctrl-c handler: {}", e))?;

    let stats = agent.run(&shutdown, args.max_ticks)?;
    log::info!(
        "shutdown: processed={} classifier_failures={} syncs={}/{} captures={}",
        stats.pipeline.frames_processed,
        stats.pipeline.classifier_failures,
        stats.pipeline.sync.succeeded,
        stats.pipeline.sync.dispatched,
        stats.pipeline.capture.uploaded
    );
    Ok(())
}
