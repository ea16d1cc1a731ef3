use std::path::Path;

use anyhow::{anyhow, Context, Result};

use crate::detect::backend::Classifier;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Replays recorded classifier output.
///
/// The recording is JSON Lines: one JSON array of detections per frame.
/// Blank lines are ignored. Playback wraps around at the end of the file.
/// A line that does not parse fails that tick only.
pub struct ReplayClassifier {
    lines: Vec<String>,
    cursor: usize,
}

impl ReplayClassifier {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read replay file {}", path.display()))?;
        Self::from_jsonl(&raw).with_context(|| format!("load replay file {}", path.display()))
    }

    pub fn from_jsonl(raw: &str) -> Result<Self> {
        let lines: Vec<String> = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        if lines.is_empty() {
            return Err(anyhow!("replay recording contains no frames"));
        }
        Ok(Self { lines, cursor: 0 })
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Next recorded frame, advancing the cursor even when the line is malformed.
    pub fn next_detections(&mut self) -> Result<Vec<Detection>> {
        let index = self.cursor;
        self.cursor = (self.cursor + 1) % self.lines.len();
        serde_json::from_str(&self.lines[index])
            .map_err(|e| anyhow!("replay line {} is not a detection list: {}", index + 1, e))
    }
}

impl Classifier for ReplayClassifier {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        self.next_detections()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORDING: &str = r#"
[]
[{"label":"apple","confidence":0.91,"bbox":[0.1,0.1,0.3,0.3]}]

not json
"#;

    #[test]
    fn replay_cycles_and_reports_bad_lines() {
        let mut replay = ReplayClassifier::from_jsonl(RECORDING).unwrap();
        assert_eq!(replay.len(), 3);

        assert!(replay.next_detections().unwrap().is_empty());
        let second = replay.next_detections().unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].label, "apple");
        assert!(replay.next_detections().is_err());
        // Wrapped around.
        assert!(replay.next_detections().unwrap().is_empty());
    }

    #[test]
    fn empty_recording_is_rejected() {
        assert!(ReplayClassifier::from_jsonl("\n\n").is_err());
    }
}
