use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Per-frame object classifier.
///
/// # Contract
///
/// `detect` is called synchronously once per loop tick and bounds tick
/// latency. An `Err` means "no usable result for this frame": the loop skips
/// the tick and leaves the detection window untouched.
pub trait Classifier: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Classify the objects visible in `frame`.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once before the loop starts.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
