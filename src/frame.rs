//! Captured frames.
//!
//! - `Frame`: an RGB8 image with its capture time and a source-assigned sequence number.
//! - Frames are shared as `Arc<Frame>` between the drain thread, the loop, and
//!   uncertain-capture uploads. They are never mutated after capture.

use anyhow::{anyhow, Result};
use std::time::SystemTime;

/// Bytes per pixel for the RGB8 layout every source produces.
pub const RGB_CHANNELS: usize = 3;

// ----------------------------------------------------------------------------
// Frame: one decoded camera image
// ----------------------------------------------------------------------------

/// A single captured image.
///
/// Pixels are tightly packed RGB8, row-major, `width * height * 3` bytes.
#[derive(Debug)]
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Wall-clock capture time. Used for capture metadata only.
    pub captured_at: SystemTime,
    /// Assigned by `FrameSource` when the frame is published. Zero until then.
    pub(crate) sequence: u64,
}

impl Frame {
    /// Build a frame from packed RGB8 pixels. Fails if the length does not match.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(RGB_CHANNELS))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            captured_at: SystemTime::now(),
            sequence: 0,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}
