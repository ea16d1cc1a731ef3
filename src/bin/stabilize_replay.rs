//! stabilize_replay - run the window and stabilizer over a detection recording.
//!
//! Prints every change of the settled inventory, with the frame index it
//! happened at. Useful for choosing window size and threshold offline.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use cart_agent::detect::ReplayClassifier;
use cart_agent::{DetectionWindow, FrameSnapshot, StabilizedInventory, Stabilization, Stabilizer};

#[derive(Parser, Debug)]
#[command(author, version, about = "Replay recorded detections through the stabilizer")]
struct Args {
    /// JSON Lines file, one detection array per frame.
    recording: PathBuf,

    /// Window size N.
    #[arg(long, env = "CART_WINDOW_SIZE", default_value_t = 30)]
    window: usize,

    /// Consensus threshold in (0, 1].
    #[arg(long, env = "CART_STABILITY_THRESHOLD", default_value_t = 0.9)]
    threshold: f64,

    /// Detections below this confidence are not counted.
    #[arg(long, default_value_t = 0.5)]
    min_confidence: f32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut replay = ReplayClassifier::open(&args.recording)?;
    let mut window = DetectionWindow::new(args.window)?;
    let stabilizer = Stabilizer::new(args.threshold)?;

    let mut settled: Option<StabilizedInventory> = None;
    let mut unstable_frames = 0usize;
    let mut bad_lines = 0usize;
    let mut transitions = 0usize;

    for index in 0..replay.len() {
        let detections = match replay.next_detections() {
            Ok(detections) => detections,
            Err(err) => {
                log::warn!("frame {}: {:#}", index, err);
                bad_lines += 1;
                continue;
            }
        };
        window.push(FrameSnapshot::from_detections(
            detections
                .iter()
                .filter(|d| d.confidence >= args.min_confidence),
        ));

        match stabilizer.stabilize(&window) {
            Stabilization::Stable { inventory, score } => {
                let changed = settled
                    .as_ref()
                    .map_or(true, |previous| !previous.same_contents(&inventory));
                if changed {
                    println!("frame {:>6}  score {:.2}  {}", index, score, inventory);
                    transitions += 1;
                    settled = Some(inventory);
                }
            }
            Stabilization::Unstable { .. } => unstable_frames += 1,
            Stabilization::Filling { .. } => {}
        }
    }

    println!(
        "{} frames, {} transitions, {} unstable, {} unreadable (N={}, threshold={})",
        replay.len(),
        transitions,
        unstable_frames,
        bad_lines,
        args.window,
        args.threshold
    );
    Ok(())
}
