//! Actor Context
//!
//! Binds one executor to one actor. Everything posted through the context
//! executes serially on the actor's queue, including scheduled actions and
//! continuations re-entering through [`ContextSwitch`].

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{ExecutorError, Result};
use crate::executor::{ContextSwitch, Executor, StopHandle, StopMode, TaskHandle};

/// Serialized execution context owned by exactly one actor
#[derive(Clone, Debug)]
pub struct ActorContext {
    executor: Executor,
}

/// Cancellable handle for a scheduled action
///
/// Dropping the handle detaches the timer (the action still fires);
/// cancellation is explicit.
pub struct ScheduledTask {
    timer: JoinHandle<()>,
}

impl ScheduledTask {
    /// Cancel the pending timer. A no-op once the action has been posted.
    pub fn cancel(&self) {
        self.timer.abort();
    }
}

impl ActorContext {
    /// Create a context with its own executor
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            executor: Executor::new(label),
        }
    }

    /// The underlying executor
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Context label, used in errors and logs
    pub fn label(&self) -> &str {
        self.executor.label()
    }

    /// Fire-and-forget post onto the actor's queue
    pub fn post(&self, f: impl FnOnce() + Send + 'static) -> Result<()> {
        self.executor.post(f)
    }

    /// Post a closure and capture its result into an awaitable handle
    pub fn post_task<T, F>(&self, f: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.executor.post_task(f)
    }

    /// Post an async work item
    pub fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        self.executor.spawn(future)
    }

    /// Post an async work item and capture its output
    pub fn spawn_task<T>(
        &self,
        future: impl Future<Output = T> + Send + 'static,
    ) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
    {
        self.executor.spawn_task(future)
    }

    /// Awaitable suspension point: the continuation re-enters through this
    /// context's queue. See [`ContextSwitch`].
    pub fn switch(&self) -> ContextSwitch {
        self.executor.switch()
    }

    /// Run the action on the queue as soon as its turn comes
    pub fn schedule_now(&self, f: impl FnOnce() + Send + 'static) -> Result<()> {
        self.executor.post(f)
    }

    /// Run the action on the queue after `delay`
    pub fn schedule_after(
        &self,
        delay: Duration,
        f: impl FnOnce() + Send + 'static,
    ) -> ScheduledTask {
        self.schedule_at(Instant::now() + delay, f)
    }

    /// Run the action on the queue at `deadline`
    pub fn schedule_at(&self, deadline: Instant, f: impl FnOnce() + Send + 'static) -> ScheduledTask {
        let executor = self.executor.clone();
        trace!(context = %executor.label(), ?deadline, "scheduling action");
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Err(ExecutorError::Stopped { label }) = executor.post(f) {
                debug!(context = %label, "scheduled action dropped: context stopped");
            }
        });
        ScheduledTask { timer }
    }

    /// Stop the context's executor. Idempotent; see [`Executor::stop`].
    pub fn stop(&self, mode: StopMode) -> StopHandle {
        self.executor.stop(mode)
    }

    /// True once stop has been initiated
    pub fn is_stopped(&self) -> bool {
        self.executor.is_stopped()
    }
}
