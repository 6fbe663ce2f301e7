//! Cooperative cancellation for long-running workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A per-worker run flag.
///
/// Every worker loop checks [`RunFlag::is_running`] once per cycle; the
/// orchestrator clears the flag and then joins the task. A worker in the
/// middle of a sleep finishes that sleep before it notices.
#[derive(Debug, Clone)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}
