//! Progress reporting for long-running engine operations.
//!
//! A [`Progress`] is a cheap handle over an optional callback. Nested stages
//! are created with [`Progress::child`]; the callback receives the full stage
//! path. [`Progress::none`] makes every call a no-op.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::SharedFn;

/// A progress notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// Slash separated stage path, e.g. `"consensus/iteration 2"`.
    pub stage: Arc<str>,
    /// Completion in `[0, 1]`.
    pub fraction: f64,
    pub message: String,
    pub completed: bool,
}

/// Callback type for progress reporting.
pub type ProgressCallback = SharedFn<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Hierarchical progress handle.
#[derive(Debug, Clone)]
pub struct Progress {
    callback: ProgressCallback,
    stage: Arc<str>,
}

impl Default for Progress {
    fn default() -> Self {
        Self::none()
    }
}

impl Progress {
    pub fn none() -> Self {
        Self {
            callback: SharedFn::none(),
            stage: Arc::from(""),
        }
    }

    pub fn new(callback: impl Fn(&ProgressEvent) + Send + Sync + 'static) -> Self {
        Self {
            callback: SharedFn::new(Arc::new(callback)),
            stage: Arc::from(""),
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Create a nested stage.
    pub fn child(&self, name: &str) -> Progress {
        let stage = if self.stage.is_empty() {
            Arc::from(name)
        } else {
            Arc::from(format!("{}/{}", self.stage, name))
        };
        Progress {
            callback: self.callback.clone(),
            stage,
        }
    }

    pub fn update(&self, fraction: f64, message: &str) {
        self.emit(fraction.clamp(0.0, 1.0), message, false);
    }

    pub fn complete(&self) {
        self.emit(1.0, "", true);
    }

    /// Counter for parallel workers reporting `done / total`.
    pub fn counter(&self, total: usize) -> ProgressCounter<'_> {
        ProgressCounter {
            progress: self,
            done: AtomicUsize::new(0),
            total: total.max(1),
        }
    }

    fn emit(&self, fraction: f64, message: &str, completed: bool) {
        if let Some(f) = self.callback.get() {
            f(&ProgressEvent {
                stage: Arc::clone(&self.stage),
                fraction,
                message: message.to_string(),
                completed,
            });
        }
    }
}

/// Atomic progress counter shared by worker threads.
#[derive(Debug)]
pub struct ProgressCounter<'a> {
    progress: &'a Progress,
    done: AtomicUsize,
    total: usize,
}

impl ProgressCounter<'_> {
    pub fn tick(&self, amount: usize) {
        let done = self.done.fetch_add(amount, Ordering::Relaxed) + amount;
        if self.progress.callback.is_some() {
            self.progress.update(done as f64 / self.total as f64, "");
        }
    }
}
