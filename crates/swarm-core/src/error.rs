//! Error types for swarm-core

use thiserror::Error;

use crate::task::TaskState;

/// Core error type for swarm operations
#[derive(Debug, Error)]
pub enum Error {
    /// The persistence store could not be reached
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// No task exists under the given id
    #[error("task {0} not found")]
    TaskNotFound(String),

    /// A task already exists for the issue
    #[error("task already exists for {repo}#{issue_number}")]
    DuplicateTask {
        /// Repository in `owner/name` form
        repo: String,
        /// Issue number the duplicate was keyed on
        issue_number: u64,
    },

    /// The requested state change is not in the transition table
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// State the task was in
        from: TaskState,
        /// State that was requested
        to: TaskState,
    },

    /// Webhook body failed HMAC verification
    #[error("invalid webhook signature")]
    SignatureInvalid,

    /// A required file is locked by another task
    #[error("file {path} is locked by task {task}")]
    LockConflict {
        /// Task holding the lock
        task: String,
        /// Path that conflicted
        path: String,
    },

    /// The remote code-hosting API returned an error
    #[error("remote API failure: {0}")]
    RemoteApi(String),

    /// An agent invocation failed
    #[error("agent failure: {0}")]
    Agent(String),
}

/// Result type alias for swarm-core operations
pub type Result<T> = std::result::Result<T, Error>;
