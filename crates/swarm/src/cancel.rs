//! Soft-cancel registry
//!
//! `/agent-stop` sets a flag here; in-flight pipelines check it at their
//! suspension points and abort. Held file locks are left to expire on TTL.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;

/// Process-wide set of task ids with a pending stop request
#[derive(Debug, Clone, Default)]
pub struct CancelRegistry {
    stopped: Arc<Mutex<HashSet<String>>>,
}

impl CancelRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that agents working on `task_id` stop
    pub async fn request_stop(&self, task_id: &str) {
        self.stopped.lock().await.insert(task_id.to_string());
    }

    /// Check whether a stop was requested
    pub async fn is_stopped(&self, task_id: &str) -> bool {
        self.stopped.lock().await.contains(task_id)
    }

    /// Clear a stop request, e.g. when new work is enqueued
    pub async fn clear(&self, task_id: &str) {
        self.stopped.lock().await.remove(task_id);
    }
}
