//! Executor Error Types

use thiserror::Error;

/// Errors surfaced by executors and actor contexts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The executor no longer accepts work. Distinguished from ordinary
    /// task failures so callers can tell "actor stopped" apart from
    /// business errors.
    #[error("executor '{label}' stopped")]
    Stopped { label: String },

    /// A posted task panicked; the panic payload is captured as text.
    #[error("task failed: {message}")]
    Task { message: String },
}

/// Result type alias for executor operations
pub type Result<T> = std::result::Result<T, ExecutorError>;

impl ExecutorError {
    /// Create a stopped error for the given executor label
    pub fn stopped(label: impl Into<String>) -> Self {
        Self::Stopped {
            label: label.into(),
        }
    }

    /// Create a task failure error
    pub fn task(message: impl Into<String>) -> Self {
        Self::Task {
            message: message.into(),
        }
    }

    /// True if this error means the executor reached its terminal state
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped { .. })
    }
}

/// Extract a printable message from a panic payload
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
