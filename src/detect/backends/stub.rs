use anyhow::Result;

use crate::detect::backend::Classifier;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Stub backend. Always sees an empty cart.
#[derive(Default)]
pub struct StubClassifier {
    frames_seen: u64,
}

impl StubClassifier {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Classifier for StubClassifier {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        self.frames_seen += 1;
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_reports_empty_cart() {
        let mut backend = StubClassifier::new();
        let frame = Frame::from_rgb(vec![0u8; 3], 1, 1).unwrap();
        assert!(backend.detect(&frame).unwrap().is_empty());
        assert_eq!(backend.frames_seen, 1);
    }
}
