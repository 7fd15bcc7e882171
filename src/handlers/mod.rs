//! HTTP handlers for the worker endpoint and health probes.

pub mod health_handlers;
pub mod worker_handlers;

use crate::operations::Worker;
use tokio_util::task::TaskTracker;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub worker: Worker,
    /// Worker requests still running in the background.
    pub tasks: TaskTracker,
}

impl AppState {
    pub fn new(worker: Worker) -> Self {
        Self {
            worker,
            tasks: TaskTracker::new(),
        }
    }
}
