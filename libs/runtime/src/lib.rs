//! Serialized Execution Runtime
//!
//! Single-worker executors and the actor contexts built on top of them.
//! An executor guarantees that at most one work item runs at any instant
//! and that items run in submission order; a context binds one executor to
//! one actor and layers scheduling and an awaitable re-entry point on it.
//!
//! ```text
//! callers ──post/post_task──▶ ┌─────────────┐
//!                             │  FIFO queue │──▶ worker (one at a time)
//! wakers ──requeue──────────▶ └─────────────┘        │
//!                                    ▲               ▼
//!                                    └── suspended items re-enter
//! ```

pub mod context;
pub mod error;
pub mod executor;

pub use context::{ActorContext, ScheduledTask};
pub use error::{ExecutorError, Result};
pub use executor::{ContextSwitch, Executor, StopHandle, StopMode, TaskHandle};
