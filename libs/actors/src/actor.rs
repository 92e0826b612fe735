//! Actor Trait and References
//!
//! An actor is a unit of state owned by exactly one [`ActorContext`]: all
//! access to the instance is marshalled onto that context's executor, so
//! the state is only ever touched serially. [`ActorRef`] is the cheap,
//! cloneable handle callers invoke through; the instance itself never
//! escapes.
//!
//! Actors are created through the [`ActorSystem`](crate::system::ActorSystem)
//! factory only; the handle types cannot be constructed directly.

use std::any::Any;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use runtime::{ActorContext, StopMode};
use tokio::sync::watch;
use tracing::info;

use crate::error::Result;
use crate::path::ActorPath;
use crate::system::SystemShared;

/// Lifecycle state machine: Created → Started → Stopping → Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Started,
    Stopping,
    Stopped,
}

/// Behavior hooks every actor implementation may provide
#[async_trait]
pub trait Actor: Send + 'static {
    /// Runs on the actor's own executor as part of creation. A failure
    /// aborts the creation atomically: the actor is unregistered and the
    /// factory call fails.
    async fn started(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs during stop, after the actor's queue has drained.
    async fn stopped(&mut self) {}
}

/// Bookkeeping shared by all handles to one actor
pub(crate) struct ActorCell {
    pub(crate) path: ActorPath,
    pub(crate) parent: Option<ActorPath>,
    pub(crate) context: ActorContext,
    pub(crate) state: Mutex<LifecycleState>,
    /// Paths of children this actor owns; index-based back-references keep
    /// the ownership graph acyclic.
    pub(crate) children: Mutex<Vec<ActorPath>>,
    pub(crate) stopped_flag: watch::Sender<bool>,
}

impl ActorCell {
    pub(crate) fn new(path: ActorPath, parent: Option<ActorPath>) -> Arc<Self> {
        let (stopped_flag, _) = watch::channel(false);
        Arc::new(Self {
            context: ActorContext::new(path.as_str()),
            path,
            parent,
            state: Mutex::new(LifecycleState::Created),
            children: Mutex::new(Vec::new()),
            stopped_flag,
        })
    }

    pub(crate) fn lifecycle(&self) -> LifecycleState {
        *self.state.lock()
    }
}

/// Type-erased registry entry
pub(crate) trait AnyActor: Send + Sync + 'static {
    fn cell(&self) -> &Arc<ActorCell>;
    fn as_any(&self) -> &dyn Any;
    fn stop_boxed(&self) -> BoxFuture<'static, ()>;
}

/// Handle to a running actor
///
/// Cheap to clone; every invocation goes through the actor's executor
/// queue, preserving the one-message-at-a-time guarantee.
pub struct ActorRef<A: Actor> {
    cell: Arc<ActorCell>,
    instance: Arc<tokio::sync::Mutex<A>>,
    system: Weak<SystemShared>,
}

impl<A: Actor> Clone for ActorRef<A> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            instance: Arc::clone(&self.instance),
            system: Weak::clone(&self.system),
        }
    }
}

impl<A: Actor> std::fmt::Debug for ActorRef<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorRef")
            .field("path", &self.cell.path)
            .field("state", &self.cell.lifecycle())
            .finish()
    }
}

impl<A: Actor> ActorRef<A> {
    pub(crate) fn new(
        cell: Arc<ActorCell>,
        instance: A,
        system: Weak<SystemShared>,
    ) -> Self {
        Self {
            cell,
            instance: Arc::new(tokio::sync::Mutex::new(instance)),
            system,
        }
    }

    /// The actor's unique path
    pub fn path(&self) -> &ActorPath {
        &self.cell.path
    }

    /// Current lifecycle state
    pub fn lifecycle(&self) -> LifecycleState {
        self.cell.lifecycle()
    }

    /// The actor's execution context, for scheduling on its own queue
    pub fn context(&self) -> &ActorContext {
        &self.cell.context
    }

    /// Fire-and-forget invocation, serialized on the actor's queue
    pub fn tell<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut A) + Send + 'static,
    {
        let instance = Arc::clone(&self.instance);
        self.cell.context.spawn(async move {
            let mut actor = instance.lock().await;
            f(&mut actor);
        })?;
        Ok(())
    }

    /// Enqueue an invocation immediately and hand back a future for its
    /// result. [`ask`](Self::ask) is this plus the await; use this form
    /// when the enqueue order relative to other work must be fixed before
    /// anything is awaited.
    pub fn enqueue<R, F>(&self, f: F) -> Result<runtime::TaskHandle<R>>
    where
        R: Send + 'static,
        F: FnOnce(&mut A) -> R + Send + 'static,
    {
        let instance = Arc::clone(&self.instance);
        Ok(self.cell.context.spawn_task(async move {
            let mut actor = instance.lock().await;
            f(&mut actor)
        })?)
    }

    /// Async-method form of [`enqueue`](Self::enqueue)
    pub fn enqueue_async<R, F>(&self, f: F) -> Result<runtime::TaskHandle<R>>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(&'a mut A) -> BoxFuture<'a, R> + Send + 'static,
    {
        let instance = Arc::clone(&self.instance);
        Ok(self.cell.context.spawn_task(async move {
            let mut actor = instance.lock().await;
            f(&mut actor).await
        })?)
    }

    /// Invoke on the actor's queue and await the result
    ///
    /// A suspended invocation keeps exclusive access to the state until it
    /// completes, so an actor must not `ask` itself from inside its own
    /// handler; that call would wait on itself.
    pub async fn ask<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut A) -> R + Send + 'static,
    {
        Ok(self.enqueue(f)?.await?)
    }

    /// Fire-and-forget async invocation, serialized on the actor's queue
    pub fn tell_async<F>(&self, f: F) -> Result<()>
    where
        F: for<'a> FnOnce(&'a mut A) -> BoxFuture<'a, ()> + Send + 'static,
    {
        let instance = Arc::clone(&self.instance);
        self.cell.context.spawn(async move {
            let mut actor = instance.lock().await;
            f(&mut actor).await;
        })?;
        Ok(())
    }

    /// Invoke an async method on the actor's queue and await the result.
    /// The method body runs inside the executor; a suspension inside it
    /// re-enters through the same queue.
    pub async fn ask_async<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(&'a mut A) -> BoxFuture<'a, R> + Send + 'static,
    {
        Ok(self.enqueue_async(f)?.await?)
    }

    /// Invoke directly on the calling task, bypassing the executor queue.
    ///
    /// This skips the actor's serialization guarantee: a call made here can
    /// overlap with queued work. Only for callers that accept that risk;
    /// prefer [`ask`](Self::ask).
    pub async fn invoke_direct<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut A) -> R,
    {
        let mut actor = self.instance.lock().await;
        f(&mut actor)
    }

    /// Async-method form of [`invoke_direct`](Self::invoke_direct); the
    /// same warning applies.
    pub async fn invoke_direct_async<R, F>(&self, f: F) -> R
    where
        F: for<'a> FnOnce(&'a mut A) -> BoxFuture<'a, R>,
    {
        let mut actor = self.instance.lock().await;
        f(&mut actor).await
    }

    /// Stop this actor: children first (depth-first), then drain the
    /// queue, run the `stopped` hook and unregister. Idempotent: repeated
    /// calls await the same terminal outcome.
    pub async fn stop(&self) {
        let claimed = {
            let mut state = self.cell.state.lock();
            match *state {
                LifecycleState::Created | LifecycleState::Started => {
                    *state = LifecycleState::Stopping;
                    true
                }
                LifecycleState::Stopping | LifecycleState::Stopped => false,
            }
        };
        if !claimed {
            let mut rx = self.cell.stopped_flag.subscribe();
            let _ = rx.wait_for(|done| *done).await;
            return;
        }

        info!(actor = %self.cell.path, "stopping actor");
        let system = self.system.upgrade();

        // Children before parent. Loop until the set stays empty: a child
        // creation that raced the state flip may attach one more batch.
        loop {
            let children = { self.cell.children.lock().clone() };
            if children.is_empty() {
                break;
            }
            for child_path in children {
                match system.as_ref().and_then(|s| s.lookup(&child_path)) {
                    Some(child) => child.stop_boxed().await,
                    None => self.cell.children.lock().retain(|p| p != &child_path),
                }
            }
        }

        // Drain in-flight work, then run the hook with the queue dead; the
        // instance lock keeps the access exclusive.
        self.cell.context.stop(StopMode::Drain).wait().await;
        {
            let mut instance = self.instance.lock().await;
            instance.stopped().await;
        }

        if let Some(system) = &system {
            {
                let instance = self.instance.lock().await;
                system.resolver().release(&self.cell.path, &*instance);
            }
            system.unregister(&self.cell.path);
            if let Some(parent) = &self.cell.parent {
                system.detach_child(parent, &self.cell.path);
            }
        }

        *self.cell.state.lock() = LifecycleState::Stopped;
        let _ = self.cell.stopped_flag.send(true);
        info!(actor = %self.cell.path, "actor stopped");
    }

    pub(crate) fn cell_arc(&self) -> &Arc<ActorCell> {
        &self.cell
    }

    pub(crate) fn mark_started(&self) {
        *self.cell.state.lock() = LifecycleState::Started;
    }

    /// Tear down a half-created actor whose `started` hook failed
    pub(crate) async fn abort_creation(&self) {
        self.cell.context.stop(StopMode::Immediate).wait().await;
        *self.cell.state.lock() = LifecycleState::Stopped;
        let _ = self.cell.stopped_flag.send(true);
    }
}

impl<A: Actor> AnyActor for ActorRef<A> {
    fn cell(&self) -> &Arc<ActorCell> {
        &self.cell
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn stop_boxed(&self) -> BoxFuture<'static, ()> {
        let this = self.clone();
        async move { this.stop().await }.boxed()
    }
}
