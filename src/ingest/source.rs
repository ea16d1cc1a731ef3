//! Draining frame source.
//!
//! `FrameSource` owns a `CaptureDevice` on a dedicated thread that reads as
//! fast as the device delivers. When the device reports a backlog, the frame
//! just read is held and superseded by the next one; only the last frame of a
//! drain burst reaches the shared latest-frame cell. The loop therefore never
//! classifies a queued, stale image, at the cost of dropping intermediate
//! frames.

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::device::CaptureDevice;
use crate::frame::Frame;

/// Pause after a failed device read before retrying.
pub const READ_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Log every Nth consecutive read failure after the first.
const READ_FAILURE_LOG_EVERY: u64 = 50;

type LatestCell = Arc<Mutex<Option<Arc<Frame>>>>;

#[derive(Debug, Default)]
struct SourceCounters {
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    read_errors: AtomicU64,
}

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub device: String,
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub read_errors: u64,
}

/// Freshest-frame source backed by a background drain thread.
pub struct FrameSource {
    device: String,
    latest: LatestCell,
    counters: Arc<SourceCounters>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl FrameSource {
    /// Open the device and start draining it.
    ///
    /// Open failure is returned to the caller; nothing is spawned in that case.
    pub fn start(device: Box<dyn CaptureDevice>) -> Result<Self> {
        Self::start_with_backoff(device, READ_RETRY_BACKOFF)
    }

    pub fn start_with_backoff(mut device: Box<dyn CaptureDevice>, backoff: Duration) -> Result<Self> {
        let description = device.describe();
        device
            .open()
            .with_context(|| format!("open capture device {}", description))?;

        let latest: LatestCell = Arc::new(Mutex::new(None));
        let counters = Arc::new(SourceCounters::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let drain = DrainLoop {
            device: DeviceGuard(device),
            latest: latest.clone(),
            counters: counters.clone(),
            shutdown: shutdown.clone(),
            backoff,
        };
        let join = std::thread::Builder::new()
            .name("cart-frame-drain".to_string())
            .spawn(move || drain.run());
        let join = match join {
            Ok(join) => join,
            // The closure (and the device guard inside it) was dropped, closing the device.
            Err(err) => return Err(anyhow!("spawn frame drain thread: {}", err)),
        };

        log::info!("frame source started on {}", description);
        Ok(Self {
            device: description,
            latest,
            counters,
            shutdown,
            join: Some(join),
        })
    }

    /// Latest completed frame, or `None` if no read has succeeded yet.
    pub fn read(&self) -> Option<Arc<Frame>> {
        let guard = self
            .latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone()
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            device: self.device.clone(),
            frames_captured: self.counters.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
            read_errors: self.counters.read_errors.load(Ordering::Relaxed),
        }
    }

    /// True while the drain thread is alive.
    pub fn is_running(&self) -> bool {
        self.join
            .as_ref()
            .map(|join| !join.is_finished())
            .unwrap_or(false)
    }

    /// Stop the drain thread and release the device.
    pub fn release(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("frame drain thread panicked"))?;
            log::info!("frame source released {}", self.device);
        }
        Ok(())
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("frame source teardown: {}", err);
        }
    }
}

/// Closes the device when the drain thread exits, including by panic.
struct DeviceGuard(Box<dyn CaptureDevice>);

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

struct DrainLoop {
    device: DeviceGuard,
    latest: LatestCell,
    counters: Arc<SourceCounters>,
    shutdown: Arc<AtomicBool>,
    backoff: Duration,
}

impl DrainLoop {
    fn run(mut self) {
        let mut sequence = 0u64;
        let mut held: Option<Frame> = None;
        let mut consecutive_failures = 0u64;

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.device.0.read_frame() {
                Ok(frame) => {
                    consecutive_failures = 0;
                    self.counters.frames_captured.fetch_add(1, Ordering::Relaxed);
                    if held.replace(frame).is_some() {
                        self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    if self.device.0.frames_pending() {
                        continue;
                    }
                    if let Some(frame) = held.take() {
                        sequence += 1;
                        self.publish(frame, sequence);
                    }
                }
                Err(err) => {
                    consecutive_failures += 1;
                    self.counters.read_errors.fetch_add(1, Ordering::Relaxed);
                    if let Some(frame) = held.take() {
                        sequence += 1;
                        self.publish(frame, sequence);
                    }
                    if consecutive_failures == 1 {
                        log::warn!("frame read failed on {}: {:#}", self.device.0.describe(), err);
                    } else if consecutive_failures % READ_FAILURE_LOG_EVERY == 0 {
                        log::warn!(
                            "frame reads still failing on {} ({} consecutive): {:#}",
                            self.device.0.describe(),
                            consecutive_failures,
                            err
                        );
                    }
                    std::thread::sleep(self.backoff);
                }
            }
        }
    }

    fn publish(&self, mut frame: Frame, sequence: u64) {
        frame.sequence = sequence;
        let mut cell = self
            .latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cell = Some(Arc::new(frame));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Instant;

    /// One scripted device read.
    enum Step {
        /// A frame whose first pixel byte is the given marker; `pending` is the backlog flag after it.
        Frame { marker: u8, pending: bool },
        Fail,
        /// A read that blocks until the device's dequeue timeout, then fails.
        Stall(Duration),
    }

    struct ScriptedDevice {
        steps: VecDeque<Step>,
        pending: bool,
        open_fails: bool,
        closed: Arc<AtomicBool>,
    }

    impl ScriptedDevice {
        fn new(steps: Vec<Step>, closed: Arc<AtomicBool>) -> Self {
            Self {
                steps: steps.into(),
                pending: false,
                open_fails: false,
                closed,
            }
        }
    }

    impl CaptureDevice for ScriptedDevice {
        fn describe(&self) -> String {
            "scripted".to_string()
        }

        fn open(&mut self) -> Result<()> {
            if self.open_fails {
                return Err(anyhow!("no such device"));
            }
            Ok(())
        }

        fn read_frame(&mut self) -> Result<Frame> {
            match self.steps.pop_front() {
                Some(Step::Frame { marker, pending }) => {
                    self.pending = pending;
                    Frame::from_rgb(vec![marker, 0, 0], 1, 1)
                }
                Some(Step::Fail) => {
                    self.pending = false;
                    Err(anyhow!("transient read failure"))
                }
                Some(Step::Stall(timeout)) => {
                    self.pending = false;
                    std::thread::sleep(timeout);
                    Err(anyhow!("dequeue timed out"))
                }
                None => {
                    // Script exhausted: behave like an idle camera.
                    std::thread::sleep(Duration::from_millis(5));
                    Err(anyhow!("no frame"))
                }
            }
        }

        fn frames_pending(&mut self) -> bool {
            self.pending
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn drain_burst_publishes_only_last_frame() {
        let closed = Arc::new(AtomicBool::new(false));
        let device = ScriptedDevice::new(
            vec![
                Step::Frame { marker: 1, pending: true },
                Step::Frame { marker: 2, pending: true },
                Step::Frame { marker: 3, pending: false },
            ],
            closed.clone(),
        );
        let source = FrameSource::start_with_backoff(Box::new(device), Duration::from_millis(1))
            .expect("start source");

        assert!(wait_for(|| source.read().is_some()));
        let frame = source.read().expect("frame published");
        assert_eq!(frame.pixels()[0], 3);
        assert_eq!(frame.sequence(), 1);
        assert_eq!(source.stats().frames_dropped, 2);

        source.release().unwrap();
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn release_returns_while_camera_stalls() {
        let closed = Arc::new(AtomicBool::new(false));
        let timeout = Duration::from_millis(300);
        let mut steps = vec![Step::Frame { marker: 4, pending: false }];
        steps.extend((0..100).map(|_| Step::Stall(timeout)));
        let device = ScriptedDevice::new(steps, closed.clone());
        let source = FrameSource::start_with_backoff(Box::new(device), Duration::from_millis(1))
            .expect("start source");

        assert!(wait_for(|| source.read().is_some()));
        assert!(wait_for(|| source.stats().read_errors >= 1));

        let started = Instant::now();
        source.release().unwrap();
        assert!(started.elapsed() < timeout * 3, "release waited {:?}", started.elapsed());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn read_failures_keep_last_good_frame() {
        let closed = Arc::new(AtomicBool::new(false));
        let device = ScriptedDevice::new(
            vec![
                Step::Frame { marker: 7, pending: false },
                Step::Fail,
                Step::Fail,
            ],
            closed.clone(),
        );
        let source = FrameSource::start_with_backoff(Box::new(device), Duration::from_millis(1))
            .expect("start source");

        assert!(wait_for(|| source.stats().read_errors >= 2));
        let frame = source.read().expect("last good frame");
        assert_eq!(frame.pixels()[0], 7);
        assert!(source.is_running());
    }

    #[test]
    fn failure_mid_burst_publishes_held_frame() {
        let closed = Arc::new(AtomicBool::new(false));
        let device = ScriptedDevice::new(
            vec![Step::Frame { marker: 9, pending: true }, Step::Fail],
            closed,
        );
        let source = FrameSource::start_with_backoff(Box::new(device), Duration::from_millis(1))
            .expect("start source");

        assert!(wait_for(|| source.read().is_some()));
        assert_eq!(source.read().unwrap().pixels()[0], 9);
    }

    #[test]
    fn no_frame_before_first_successful_read() {
        let closed = Arc::new(AtomicBool::new(false));
        let device = ScriptedDevice::new(vec![Step::Fail], closed);
        let source = FrameSource::start_with_backoff(Box::new(device), Duration::from_millis(1))
            .expect("start source");

        assert!(wait_for(|| source.stats().read_errors >= 1));
        assert!(source.read().is_none());
    }

    #[test]
    fn open_failure_is_fatal_and_spawns_nothing() {
        let closed = Arc::new(AtomicBool::new(false));
        let mut device = ScriptedDevice::new(vec![], closed);
        device.open_fails = true;
        let err = FrameSource::start(Box::new(device)).err().expect("open must fail");
        assert!(format!("{:#}", err).contains("no such device"));
    }

    #[test]
    fn drop_releases_device() {
        let closed = Arc::new(AtomicBool::new(false));
        let device = ScriptedDevice::new(vec![Step::Frame { marker: 1, pending: false }], closed.clone());
        {
            let _source =
                FrameSource::start_with_backoff(Box::new(device), Duration::from_millis(1))
                    .expect("start source");
        }
        assert!(closed.load(Ordering::SeqCst));
    }
}
