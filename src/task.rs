//! Fire-and-forget task execution for the publishers.
//!
//! Publishers hand owned closures to a [`TaskExecutor`] and never wait on the
//! result. The loop must not stall on a slow backend, so the production
//! executor runs every task on its own short-lived OS thread.

use std::sync::Arc;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait TaskExecutor: Send + Sync {
    /// Run `task` without blocking the caller beyond the cost of dispatch.
    fn spawn(&self, name: &str, task: Task);
}

/// One named thread per task. Threads are detached; shutdown does not wait.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadExecutor;

impl TaskExecutor for ThreadExecutor {
    fn spawn(&self, name: &str, task: Task) {
        let builder = std::thread::Builder::new().name(name.to_string());
        if let Err(err) = builder.spawn(task) {
            log::warn!("failed to spawn background task {}: {}", name, err);
        }
    }
}

/// Runs tasks immediately on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineExecutor;

impl TaskExecutor for InlineExecutor {
    fn spawn(&self, _name: &str, task: Task) {
        task();
    }
}

pub fn thread_executor() -> Arc<dyn TaskExecutor> {
    Arc::new(ThreadExecutor)
}
