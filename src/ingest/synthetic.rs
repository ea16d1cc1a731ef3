use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use super::device::{CameraConfig, CaptureDevice};
use crate::frame::{Frame, RGB_CHANNELS};

/// Synthetic device for `stub://` paths.
///
/// Paces itself to `target_fps` like a real camera and never queues, so the
/// drain loop publishes every frame it produces.
pub struct SyntheticDevice {
    config: CameraConfig,
    opened: bool,
    frame_count: u64,
    /// Simulated "scene" state; bumps occasionally to vary the gradient.
    scene_state: u8,
    next_frame_at: Option<Instant>,
}

impl SyntheticDevice {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            opened: false,
            frame_count: 0,
            scene_state: 0,
            next_frame_at: None,
        }
    }

    fn frame_interval(&self) -> Duration {
        if self.config.target_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis((1000 / self.config.target_fps).max(1) as u64)
        }
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count =
            self.config.width as usize * self.config.height as usize * RGB_CHANNELS;

        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl CaptureDevice for SyntheticDevice {
    fn describe(&self) -> String {
        format!("{} (synthetic)", self.config.device)
    }

    fn open(&mut self) -> Result<()> {
        self.opened = true;
        log::info!("SyntheticDevice: opened {}", self.config.device);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        if !self.opened {
            return Err(anyhow!("synthetic device {} not open", self.config.device));
        }
        let interval = self.frame_interval();
        let now = Instant::now();
        if let Some(due) = self.next_frame_at {
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_frame_at = Some(Instant::now() + interval);

        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::from_rgb(pixels, self.config.width, self.config.height)
    }

    fn frames_pending(&mut self) -> bool {
        false
    }

    fn close(&mut self) {
        if self.opened {
            log::info!("SyntheticDevice: closed {}", self.config.device);
        }
        self.opened = false;
    }
}
