//! The orchestrating loop.
//!
//! Each tick takes the freshest frame, runs it through the [`Pipeline`] if it
//! has not been classified yet, then sleeps out the rest of the tick interval.
//! Nothing inside the loop is fatal; the frame source is released whenever
//! the loop returns.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::ingest::FrameSource;
use crate::pipeline::{Pipeline, PipelineStats, TickReport};

pub const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Result of a single tick.
#[derive(Debug)]
pub enum Tick {
    /// No frame yet, or the latest frame was already classified.
    Idle,
    Processed(TickReport),
    /// The classifier failed; the window was not touched.
    Skipped,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AgentStats {
    pub ticks: u64,
    pub idle_ticks: u64,
    pub pipeline: PipelineStats,
}

pub struct CartAgent {
    source: FrameSource,
    pipeline: Pipeline,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    last_sequence: Option<u64>,
    ticks: u64,
    idle_ticks: u64,
}

impl CartAgent {
    pub fn new(
        source: FrameSource,
        pipeline: Pipeline,
        clock: Arc<dyn Clock>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            source,
            pipeline,
            clock,
            tick_interval,
            last_sequence: None,
            ticks: 0,
            idle_ticks: 0,
        }
    }

    pub fn tick(&mut self) -> Tick {
        self.ticks += 1;
        let Some(frame) = self.source.read() else {
            self.idle_ticks += 1;
            return Tick::Idle;
        };
        if self.last_sequence == Some(frame.sequence()) {
            self.idle_ticks += 1;
            return Tick::Idle;
        }
        self.last_sequence = Some(frame.sequence());

        match self.pipeline.process_frame(&frame) {
            Ok(report) => Tick::Processed(report),
            Err(err) => {
                log::warn!("skipping tick: {:#}", err);
                Tick::Skipped
            }
        }
    }

    /// Tick until `shutdown` is set or `max_ticks` have run, then release the source.
    pub fn run(mut self, shutdown: &AtomicBool, max_ticks: Option<u64>) -> Result<AgentStats> {
        log::info!(
            "cart agent running: classifier={} tick={}ms",
            self.pipeline.classifier_name(),
            self.tick_interval.as_millis()
        );
        let mut last_health = self.clock.now();

        while !shutdown.load(Ordering::SeqCst) {
            if max_ticks.map_or(false, |max| self.ticks >= max) {
                break;
            }
            let started = Instant::now();
            self.tick();

            let now = self.clock.now();
            if now.saturating_duration_since(last_health) >= HEALTH_LOG_INTERVAL {
                self.log_health();
                last_health = now;
            }

            let elapsed = started.elapsed();
            if elapsed < self.tick_interval {
                std::thread::sleep(self.tick_interval - elapsed);
            }
        }

        let stats = self.stats();
        log::info!(
            "cart agent stopping after {} ticks ({} frames processed)",
            stats.ticks,
            stats.pipeline.frames_processed
        );
        self.source.release()?;
        Ok(stats)
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            ticks: self.ticks,
            idle_ticks: self.idle_ticks,
            pipeline: self.pipeline.stats(),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    fn log_health(&self) {
        let source = self.source.stats();
        let pipeline = self.pipeline.stats();
        log::info!(
            "health: device={} captured={} dropped={} read_errors={} ticks={} processed={} classifier_failures={} sync={}/{} (failed {}) captures={}/{}",
            source.device,
            source.frames_captured,
            source.frames_dropped,
            source.read_errors,
            self.ticks,
            pipeline.frames_processed,
            pipeline.classifier_failures,
            pipeline.sync.succeeded,
            pipeline.sync.dispatched,
            pipeline.sync.failed,
            pipeline.capture.uploaded,
            pipeline.capture.triggered,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::detect::{Classifier, Detection};
    use crate::frame::Frame;
    use crate::ingest::CaptureDevice;
    use crate::pipeline::PipelineConfig;
    use crate::sync::{InventoryPush, SyncBackend, SyncPublisher};
    use crate::task::InlineExecutor;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;

    /// Delivers a single frame, then behaves like a camera that stopped producing.
    struct OneShotDevice {
        delivered: bool,
    }

    impl CaptureDevice for OneShotDevice {
        fn describe(&self) -> String {
            "one-shot".to_string()
        }

        fn open(&mut self) -> Result<()> {
            Ok(())
        }

        fn read_frame(&mut self) -> Result<Frame> {
            if !self.delivered {
                self.delivered = true;
                return Frame::from_rgb(vec![0; 2 * 2 * 3], 2, 2);
            }
            std::thread::sleep(Duration::from_millis(5));
            Err(anyhow!("no new frame"))
        }

        fn frames_pending(&mut self) -> bool {
            false
        }

        fn close(&mut self) {}
    }

    struct CountingClassifier {
        calls: Arc<AtomicUsize>,
    }

    impl Classifier for CountingClassifier {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Detection::new("apple", 0.9, [0.0; 4])])
        }
    }

    struct NullBackend;

    impl SyncBackend for NullBackend {
        fn push(&self, _payload: &InventoryPush) -> Result<()> {
            Ok(())
        }
    }

    fn agent(calls: Arc<AtomicUsize>) -> CartAgent {
        let clock = Arc::new(ManualClock::new());
        let sync = SyncPublisher::new(
            "CART-TEST",
            Arc::new(NullBackend),
            Arc::new(InlineExecutor),
            clock.clone(),
            Duration::from_secs(15),
            4,
        );
        let pipeline = Pipeline::new(
            &PipelineConfig {
                window_size: 3,
                stability_threshold: 1.0,
                min_confidence: 0.5,
            },
            Box::new(CountingClassifier { calls }),
            sync,
            None,
        )
        .unwrap();
        let source = FrameSource::start_with_backoff(
            Box::new(OneShotDevice { delivered: false }),
            Duration::from_millis(1),
        )
        .unwrap();
        CartAgent::new(source, pipeline, clock, Duration::from_millis(1))
    }

    fn wait_for_frame(agent: &CartAgent) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if agent.source.read().is_some() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn stale_frame_is_classified_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut agent = agent(calls.clone());
        assert!(wait_for_frame(&agent));

        assert!(matches!(agent.tick(), Tick::Processed(_)));
        for _ in 0..5 {
            assert!(matches!(agent.tick(), Tick::Idle));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(agent.pipeline().window().len(), 1);
        let stats = agent.stats();
        assert_eq!(stats.ticks, 6);
        assert_eq!(stats.idle_ticks, 5);
        assert_eq!(stats.pipeline.frames_processed, 1);
    }

    #[test]
    fn ticks_before_first_frame_are_idle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let clock = Arc::new(ManualClock::new());
        let sync = SyncPublisher::new(
            "CART-TEST",
            Arc::new(NullBackend),
            Arc::new(InlineExecutor),
            clock.clone(),
            Duration::from_secs(15),
            4,
        );
        let pipeline = Pipeline::new(
            &PipelineConfig::default(),
            Box::new(CountingClassifier { calls: calls.clone() }),
            sync,
            None,
        )
        .unwrap();
        let source = FrameSource::start_with_backoff(
            Box::new(OneShotDevice { delivered: true }),
            Duration::from_millis(1),
        )
        .unwrap();
        let mut agent = CartAgent::new(source, pipeline, clock, Duration::from_millis(1));

        assert!(matches!(agent.tick(), Tick::Idle));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(agent.stats().idle_ticks, 1);
    }
}
