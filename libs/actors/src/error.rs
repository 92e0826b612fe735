//! Actor System Error Types

use runtime::ExecutorError;
use thiserror::Error;

/// Errors raised by actor creation, lookup and teardown
#[derive(Error, Debug)]
pub enum ActorError {
    /// Name rejected by validation
    #[error("invalid actor name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Another actor already owns this path
    #[error("duplicate actor name: '{path}' is already registered")]
    DuplicateName { path: String },

    /// Path lookup failed
    #[error("no actor registered at '{path}'")]
    NotFound { path: String },

    /// An actor is registered at the path, but under a different type
    #[error("actor at '{path}' does not expose the requested interface")]
    CapabilityMismatch { path: String },

    /// The parent is tearing down and rejects new children
    #[error("actor at '{path}' is stopping and does not accept new children")]
    Stopping { path: String },

    /// The `started` hook failed; the actor was rolled back atomically
    #[error("actor '{path}' failed to start: {message}")]
    StartFailed { path: String, message: String },

    /// Underlying executor rejected or lost the work
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// Result type alias for actor operations
pub type Result<T> = std::result::Result<T, ActorError>;

impl ActorError {
    /// Create a not-found error
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// True if the failure means the target actor no longer accepts work
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Executor(e) if e.is_stopped())
    }
}
