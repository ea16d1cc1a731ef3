//! Inventory sync to the cart backend.
//!
//! Every tick that yields a stabilized inventory is offered to the
//! [`SyncPublisher`]. It pushes when the contents changed since the last
//! confirmed push, or when the heartbeat interval has elapsed without one.
//! Pushes run as fire-and-forget tasks with their own request timeout;
//! failures are logged and dropped, and the next eligible tick tries again.
//!
//! Each push is numbered when dispatched. A completed push only writes
//! [`SyncState`] if its number is higher than the push that last wrote it, so
//! a slow success for an older inventory can never replace a newer one.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::inventory::StabilizedInventory;
use crate::task::TaskExecutor;

pub const DEFAULT_SYNC_PATH: &str = "/api/carts/sync-by-device";

/// Wire payload: a full-state snapshot of the device's cart.
#[derive(Clone, Debug, Serialize)]
pub struct InventoryPush {
    pub device_code: String,
    pub items: StabilizedInventory,
}

/// Destination for inventory snapshots.
pub trait SyncBackend: Send + Sync {
    /// Deliver one snapshot. `Ok` only on a confirmed 2xx-equivalent success.
    fn push(&self, payload: &InventoryPush) -> Result<()>;
}

/// Backend connection settings.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub backend_url: String,
    pub sync_path: String,
    pub api_token: Option<String>,
    pub heartbeat: Duration,
    pub request_timeout: Duration,
    pub max_in_flight: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backend_url: "https://bapsim.site".to_string(),
            sync_path: DEFAULT_SYNC_PATH.to_string(),
            api_token: None,
            heartbeat: Duration::from_secs(15),
            request_timeout: Duration::from_secs(2),
            max_in_flight: 4,
        }
    }
}

impl SyncConfig {
    /// Absolute sync endpoint. `sync_path` is appended to any path already on `backend_url`.
    pub fn endpoint(&self) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.backend_url)
            .with_context(|| format!("parse backend url {}", self.backend_url))?;
        if url.cannot_be_a_base() {
            return Err(anyhow!("backend url cannot be a base url: {}", self.backend_url));
        }
        let path = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            self.sync_path.trim_start_matches('/')
        );
        url.set_path(&path);
        Ok(url)
    }
}

/// HTTP POST backend.
pub struct HttpSyncBackend {
    agent: ureq::Agent,
    endpoint: String,
    api_token: Option<String>,
}

impl HttpSyncBackend {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let endpoint = config.endpoint()?.to_string();
        let agent = ureq::AgentBuilder::new()
            .timeout(config.request_timeout)
            .build();
        Ok(Self {
            agent,
            endpoint,
            api_token: config.api_token.clone(),
        })
    }
}

impl SyncBackend for HttpSyncBackend {
    fn push(&self, payload: &InventoryPush) -> Result<()> {
        let mut request = self.agent.post(&self.endpoint);
        if let Some(token) = &self.api_token {
            request = request.set("Authorization", &format!("Bearer {}", token));
        }
        match request.send_json(payload) {
            Ok(response) if (200..300).contains(&response.status()) => Ok(()),
            Ok(response) => Err(anyhow!(
                "sync backend returned status {}",
                response.status()
            )),
            Err(ureq::Error::Status(code, _)) => {
                Err(anyhow!("sync backend returned status {}", code))
            }
            Err(ureq::Error::Transport(err)) => {
                Err(anyhow!("sync transport error: {}", err))
            }
        }
    }
}

/// Last confirmed push. Starts empty so the first stable inventory is always sent.
#[derive(Clone, Debug, Default)]
pub struct SyncState {
    pub last_sent: Option<StabilizedInventory>,
    pub last_sent_at: Option<Instant>,
    /// Number of the push that last wrote this state.
    pub applied_attempt: u64,
}

/// Why an offered inventory was or was not pushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncDecision {
    /// Contents differ from the last confirmed push (or nothing was pushed yet).
    Changed,
    /// Contents unchanged but the heartbeat interval elapsed.
    Heartbeat,
    /// Nothing to do.
    Unchanged,
    /// Eligible, but too many pushes are already in flight.
    Saturated,
}

impl SyncDecision {
    pub fn dispatched(self) -> bool {
        matches!(self, SyncDecision::Changed | SyncDecision::Heartbeat)
    }
}

#[derive(Debug, Default)]
struct SyncCounters {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    stale: AtomicU64,
}

/// Snapshot of publisher counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub stale: u64,
    pub in_flight: usize,
}

pub struct SyncPublisher {
    device_code: String,
    backend: Arc<dyn SyncBackend>,
    executor: Arc<dyn TaskExecutor>,
    clock: Arc<dyn Clock>,
    heartbeat: Duration,
    max_in_flight: usize,
    state: Arc<Mutex<SyncState>>,
    next_attempt: u64,
    in_flight: Arc<AtomicUsize>,
    counters: Arc<SyncCounters>,
}

impl SyncPublisher {
    pub fn new(
        device_code: impl Into<String>,
        backend: Arc<dyn SyncBackend>,
        executor: Arc<dyn TaskExecutor>,
        clock: Arc<dyn Clock>,
        heartbeat: Duration,
        max_in_flight: usize,
    ) -> Self {
        Self {
            device_code: device_code.into(),
            backend,
            executor,
            clock,
            heartbeat,
            max_in_flight: max_in_flight.max(1),
            state: Arc::new(Mutex::new(SyncState::default())),
            next_attempt: 0,
            in_flight: Arc::new(AtomicUsize::new(0)),
            counters: Arc::new(SyncCounters::default()),
        }
    }

    /// Debounce rule, evaluated against the last confirmed push.
    pub fn decide(&self, inventory: &StabilizedInventory, now: Instant) -> SyncDecision {
        let state = lock_state(&self.state);
        match (&state.last_sent, state.last_sent_at) {
            (Some(last), Some(at)) if last.same_contents(inventory) => {
                if now.saturating_duration_since(at) > self.heartbeat {
                    SyncDecision::Heartbeat
                } else {
                    SyncDecision::Unchanged
                }
            }
            _ => SyncDecision::Changed,
        }
    }

    /// Offer this tick's stabilized inventory; dispatches a push when due.
    pub fn offer(&mut self, inventory: &StabilizedInventory) -> SyncDecision {
        let now = self.clock.now();
        let decision = self.decide(inventory, now);
        if !decision.dispatched() {
            return decision;
        }
        if self.in_flight.load(Ordering::SeqCst) >= self.max_in_flight {
            log::debug!(
                "sync skipped: {} pushes already in flight",
                self.max_in_flight
            );
            return SyncDecision::Saturated;
        }

        self.next_attempt += 1;
        let attempt = SyncAttempt {
            number: self.next_attempt,
            attempted_at: now,
            payload: InventoryPush {
                device_code: self.device_code.clone(),
                items: inventory.clone(),
            },
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        let task = SyncTask {
            backend: self.backend.clone(),
            state: self.state.clone(),
            counters: self.counters.clone(),
            in_flight: InFlightSlot(self.in_flight.clone()),
            attempt,
        };
        self.executor.spawn("cart-sync", Box::new(move || task.run()));
        decision
    }

    pub fn state(&self) -> SyncState {
        lock_state(&self.state).clone()
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            stale: self.counters.stale.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::SeqCst),
        }
    }
}

fn lock_state(state: &Mutex<SyncState>) -> std::sync::MutexGuard<'_, SyncState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct SyncAttempt {
    number: u64,
    attempted_at: Instant,
    payload: InventoryPush,
}

/// Releases an in-flight slot when the task ends, however it ends.
struct InFlightSlot(Arc<AtomicUsize>);

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct SyncTask {
    backend: Arc<dyn SyncBackend>,
    state: Arc<Mutex<SyncState>>,
    counters: Arc<SyncCounters>,
    in_flight: InFlightSlot,
    attempt: SyncAttempt,
}

impl SyncTask {
    fn run(self) {
        let SyncTask {
            backend,
            state,
            counters,
            in_flight,
            attempt,
        } = self;

        match backend.push(&attempt.payload) {
            Ok(()) => {
                counters.succeeded.fetch_add(1, Ordering::Relaxed);
                let mut state = lock_state(&state);
                if attempt.number > state.applied_attempt {
                    log::info!(
                        "synced {} product lines for {}: {}",
                        attempt.payload.items.len(),
                        attempt.payload.device_code,
                        attempt.payload.items
                    );
                    state.applied_attempt = attempt.number;
                    state.last_sent = Some(attempt.payload.items);
                    state.last_sent_at = Some(attempt.attempted_at);
                } else {
                    counters.stale.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "sync #{} confirmed after #{}; keeping newer state",
                        attempt.number,
                        state.applied_attempt
                    );
                }
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("inventory sync #{} failed: {:#}", attempt.number, err);
            }
        }
        drop(in_flight);
    }
}
