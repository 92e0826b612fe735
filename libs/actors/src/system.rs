//! Actor System
//!
//! Process-wide (or test-scoped) registry mapping paths to actor handles.
//! The system owns the implicit root sentinel, enforces name uniqueness,
//! runs the `started` hook atomically as part of creation and cascades
//! stops depth-first through the hierarchy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actor::{Actor, ActorCell, ActorRef, AnyActor, LifecycleState};
use crate::error::{ActorError, Result};
use crate::path::{auto_name, validate_name, ActorPath};
use crate::resolver::{ConstructorResolver, Resolver};

/// Shared state behind every [`ActorSystem`] handle
pub(crate) struct SystemShared {
    pub(crate) registry: RwLock<HashMap<ActorPath, Arc<dyn AnyActor>>>,
    pub(crate) auto_names: AtomicU64,
    pub(crate) resolver: RwLock<Arc<dyn Resolver>>,
    pub(crate) system_id: Uuid,
}

impl SystemShared {
    pub(crate) fn lookup(&self, path: &ActorPath) -> Option<Arc<dyn AnyActor>> {
        self.registry.read().get(path).cloned()
    }

    pub(crate) fn unregister(&self, path: &ActorPath) {
        if self.registry.write().remove(path).is_none() {
            warn!(path = %path, "unregister of unknown path");
        }
    }

    pub(crate) fn detach_child(&self, parent: &ActorPath, child: &ActorPath) {
        let registry = self.registry.read();
        if let Some(parent) = registry.get(parent) {
            parent.cell().children.lock().retain(|p| p != child);
        }
    }

    pub(crate) fn resolver(&self) -> Arc<dyn Resolver> {
        Arc::clone(&self.resolver.read())
    }
}

/// Implicit sentinel at the top of the hierarchy
struct RootGuardian;

#[async_trait]
impl Actor for RootGuardian {}

/// Placement options for a new actor
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Explicit name; auto-generated when absent
    pub name: Option<String>,
    /// Parent path; the root when absent
    pub parent: Option<ActorPath>,
}

impl CreateOptions {
    /// Anonymous actor under the root
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Named actor under the root
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            parent: None,
        }
    }

    /// Place under the given parent instead of the root
    pub fn under(mut self, parent: &ActorPath) -> Self {
        self.parent = Some(parent.clone());
        self
    }
}

/// Registry and factory for actors
///
/// Cheap to clone; all clones share the same registry and root.
#[derive(Clone)]
pub struct ActorSystem {
    shared: Arc<SystemShared>,
}

impl Default for ActorSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorSystem {
    /// Create a system with the default resolver. Must run inside a tokio
    /// runtime: the root's executor worker is spawned here.
    pub fn new() -> Self {
        Self::with_resolver(ConstructorResolver)
    }

    /// Create a system with an explicit resolver
    pub fn with_resolver(resolver: impl Resolver) -> Self {
        let shared = Arc::new(SystemShared {
            registry: RwLock::new(HashMap::new()),
            // First auto-generated code is "$a".
            auto_names: AtomicU64::new(10),
            resolver: RwLock::new(Arc::new(resolver)),
            system_id: Uuid::new_v4(),
        });
        let system = Self { shared };
        system.install_root();
        info!(system_id = %system.shared.system_id, "actor system created");
        system
    }

    /// Unique id of this system instance
    pub fn system_id(&self) -> Uuid {
        self.shared.system_id
    }

    /// Swap the resolver used for subsequent releases
    pub fn set_resolver(&self, resolver: impl Resolver) {
        *self.shared.resolver.write() = Arc::new(resolver);
    }

    /// Create, register and start an actor
    ///
    /// The instance comes from `factory` (constructor injection); the path
    /// is registered atomically, and the `started` hook runs on the
    /// actor's own executor before the handle is returned. If the hook
    /// fails the actor is unregistered again; a failed creation is never
    /// observable through the registry.
    pub async fn create_actor<A, F>(&self, factory: F, options: CreateOptions) -> Result<ActorRef<A>>
    where
        A: Actor,
        F: FnOnce() -> A + Send,
    {
        let name = match options.name {
            Some(name) => {
                validate_name(&name)?;
                name
            }
            None => auto_name(self.shared.auto_names.fetch_add(1, Ordering::Relaxed)),
        };
        let parent_path = options.parent.unwrap_or_else(ActorPath::root);
        let instance = factory();

        let actor_ref = {
            let mut registry = self.shared.registry.write();
            let parent = registry
                .get(&parent_path)
                .ok_or_else(|| ActorError::not_found(parent_path.as_str()))?;
            match parent.cell().lifecycle() {
                LifecycleState::Created | LifecycleState::Started => {}
                LifecycleState::Stopping | LifecycleState::Stopped => {
                    return Err(ActorError::Stopping {
                        path: parent_path.to_string(),
                    })
                }
            }
            let path = parent_path.child(&name);
            if registry.contains_key(&path) {
                return Err(ActorError::DuplicateName {
                    path: path.to_string(),
                });
            }
            let cell = ActorCell::new(path.clone(), Some(parent_path.clone()));
            let actor_ref = ActorRef::new(cell, instance, Arc::downgrade(&self.shared));
            let parent_cell = Arc::clone(parent.cell());
            registry.insert(path.clone(), Arc::new(actor_ref.clone()));
            parent_cell.children.lock().push(path);
            actor_ref
        };

        debug!(actor = %actor_ref.path(), "registered, running started hook");
        let hook = actor_ref.ask_async(|actor: &mut A| actor.started()).await;
        match hook {
            Ok(Ok(())) => {
                actor_ref.mark_started();
                info!(actor = %actor_ref.path(), "actor started");
                Ok(actor_ref)
            }
            Ok(Err(hook_err)) => {
                let err = ActorError::StartFailed {
                    path: actor_ref.path().to_string(),
                    message: hook_err.to_string(),
                };
                self.rollback_creation(&actor_ref).await;
                Err(err)
            }
            Err(exec_err) => {
                let err = ActorError::StartFailed {
                    path: actor_ref.path().to_string(),
                    message: exec_err.to_string(),
                };
                self.rollback_creation(&actor_ref).await;
                Err(err)
            }
        }
    }

    /// Look up a registered actor by path and capability
    pub fn get_actor<A: Actor>(&self, path: &ActorPath) -> Result<ActorRef<A>> {
        let registry = self.shared.registry.read();
        let entry = registry
            .get(path)
            .ok_or_else(|| ActorError::not_found(path.as_str()))?;
        entry
            .as_any()
            .downcast_ref::<ActorRef<A>>()
            .cloned()
            .ok_or_else(|| ActorError::CapabilityMismatch {
                path: path.to_string(),
            })
    }

    /// Non-throwing lookup
    pub fn try_get_actor<A: Actor>(&self, path: &ActorPath) -> Option<ActorRef<A>> {
        self.get_actor(path).ok()
    }

    /// Stop the actor at `path`, cascading through its children first.
    /// A path that is already gone counts as stopped.
    pub async fn stop_actor(&self, path: &ActorPath) {
        match self.shared.lookup(path) {
            Some(entry) => entry.stop_boxed().await,
            None => debug!(path = %path, "stop of unregistered path ignored"),
        }
    }

    /// Stop the entire tree and reinitialize the registry and root.
    /// Establishes test isolation; also valid as restart semantics.
    pub async fn reset(&self) {
        info!(system_id = %self.shared.system_id, "resetting actor system");
        if let Some(root) = self.shared.lookup(&ActorPath::root()) {
            root.stop_boxed().await;
        }
        self.shared.registry.write().clear();
        self.install_root();
    }

    /// Paths of all registered actors, including the root
    pub fn list_actors(&self) -> Vec<ActorPath> {
        self.shared.registry.read().keys().cloned().collect()
    }

    fn install_root(&self) {
        let cell = ActorCell::new(ActorPath::root(), None);
        *cell.state.lock() = LifecycleState::Started;
        let root = ActorRef::new(cell, RootGuardian, Arc::downgrade(&self.shared));
        self.shared
            .registry
            .write()
            .insert(ActorPath::root(), Arc::new(root));
    }

    /// Undo a registration whose `started` hook failed
    async fn rollback_creation<A: Actor>(&self, actor_ref: &ActorRef<A>) {
        let path = actor_ref.path().clone();
        warn!(actor = %path, "started hook failed, rolling back creation");
        {
            let mut registry = self.shared.registry.write();
            registry.remove(&path);
            if let Some(parent) = actor_ref.cell_arc().parent.clone() {
                if let Some(parent) = registry.get(&parent) {
                    parent.cell().children.lock().retain(|p| p != &path);
                }
            }
        }
        actor_ref.abort_creation().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Counter {
        count: i64,
    }

    #[async_trait]
    impl Actor for Counter {}

    struct Recorder {
        events: Arc<parking_lot::Mutex<Vec<String>>>,
        fail_start: bool,
    }

    #[async_trait]
    impl Actor for Recorder {
        async fn started(&mut self) -> anyhow::Result<()> {
            self.events.lock().push("started".to_string());
            if self.fail_start {
                anyhow::bail!("refusing to start");
            }
            Ok(())
        }

        async fn stopped(&mut self) {
            self.events.lock().push("stopped".to_string());
        }
    }

    #[tokio::test]
    async fn test_create_get_and_ask() {
        let system = ActorSystem::new();
        let counter = system
            .create_actor(Counter::default, CreateOptions::named("counter"))
            .await
            .unwrap();
        assert_eq!(counter.path().as_str(), "/root/counter/");

        counter.tell(|c| c.count += 5).unwrap();
        let value = counter.ask(|c| c.count).await.unwrap();
        assert_eq!(value, 5);

        let looked_up: ActorRef<Counter> = system.get_actor(counter.path()).unwrap();
        assert_eq!(looked_up.ask(|c| c.count).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_get_actor_capability_mismatch() {
        let system = ActorSystem::new();
        system
            .create_actor(Counter::default, CreateOptions::named("counter"))
            .await
            .unwrap();

        let path = ActorPath::root().child("counter");
        let wrong: Result<ActorRef<RootGuardian>> = system.get_actor(&path);
        assert!(matches!(wrong, Err(ActorError::CapabilityMismatch { .. })));
        assert!(system.try_get_actor::<RootGuardian>(&path).is_none());
        assert!(system.try_get_actor::<Counter>(&path).is_some());
    }

    #[tokio::test]
    async fn test_missing_actor_lookup_fails() {
        let system = ActorSystem::new();
        let path = ActorPath::root().child("ghost");
        assert!(matches!(
            system.get_actor::<Counter>(&path),
            Err(ActorError::NotFound { .. })
        ));
        assert!(system.try_get_actor::<Counter>(&path).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_under_same_parent_fails() {
        let system = ActorSystem::new();
        system
            .create_actor(Counter::default, CreateOptions::named("twin"))
            .await
            .unwrap();
        let second = system
            .create_actor(Counter::default, CreateOptions::named("twin"))
            .await;
        assert!(matches!(second, Err(ActorError::DuplicateName { .. })));
    }

    #[tokio::test]
    async fn test_same_name_under_different_parents() {
        let system = ActorSystem::new();
        let left = system
            .create_actor(Counter::default, CreateOptions::named("left"))
            .await
            .unwrap();
        let right = system
            .create_actor(Counter::default, CreateOptions::named("right"))
            .await
            .unwrap();

        let a = system
            .create_actor(
                Counter::default,
                CreateOptions::named("worker").under(left.path()),
            )
            .await
            .unwrap();
        let b = system
            .create_actor(
                Counter::default,
                CreateOptions::named("worker").under(right.path()),
            )
            .await
            .unwrap();

        assert_eq!(a.path().as_str(), "/root/left/worker/");
        assert_eq!(b.path().as_str(), "/root/right/worker/");
        assert!(system.try_get_actor::<Counter>(a.path()).is_some());
        assert!(system.try_get_actor::<Counter>(b.path()).is_some());
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let system = ActorSystem::new();
        for bad in ["", "$x", "with space", "a/b", "a\\b"] {
            let result = system
                .create_actor(Counter::default, CreateOptions::named(bad))
                .await;
            assert!(
                matches!(result, Err(ActorError::InvalidName { .. })),
                "name {bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_anonymous_actors_get_unique_paths() {
        let system = ActorSystem::new();
        let a = system
            .create_actor(Counter::default, CreateOptions::anonymous())
            .await
            .unwrap();
        let b = system
            .create_actor(Counter::default, CreateOptions::anonymous())
            .await
            .unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().name().starts_with('$'));
    }

    #[tokio::test]
    async fn test_failed_started_hook_rolls_back() {
        let system = ActorSystem::new();
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let sink = Arc::clone(&events);
        let result = system
            .create_actor(
                move || Recorder {
                    events: sink,
                    fail_start: true,
                },
                CreateOptions::named("flaky"),
            )
            .await;

        let err = result.err().unwrap();
        assert!(matches!(err, ActorError::StartFailed { .. }));
        assert!(err.to_string().contains("refusing to start"));

        // No partial visibility, and the parent holds no stale child.
        let path = ActorPath::root().child("flaky");
        assert!(system.try_get_actor::<Recorder>(&path).is_none());
        let root = system.shared.lookup(&ActorPath::root()).unwrap();
        assert!(root.cell().children.lock().is_empty());

        // The name is free again.
        let sink = Arc::clone(&events);
        system
            .create_actor(
                move || Recorder {
                    events: sink,
                    fail_start: false,
                },
                CreateOptions::named("flaky"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_hierarchy_teardown_unregisters_descendants() {
        let system = ActorSystem::new();
        let parent = system
            .create_actor(Counter::default, CreateOptions::named("parent"))
            .await
            .unwrap();
        let child = system
            .create_actor(
                Counter::default,
                CreateOptions::named("child").under(parent.path()),
            )
            .await
            .unwrap();
        let grandchild = system
            .create_actor(
                Counter::default,
                CreateOptions::named("grandchild").under(child.path()),
            )
            .await
            .unwrap();
        let bystander = system
            .create_actor(Counter::default, CreateOptions::named("bystander"))
            .await
            .unwrap();

        parent.stop().await;

        for path in [parent.path(), child.path(), grandchild.path()] {
            assert!(
                system.try_get_actor::<Counter>(path).is_none(),
                "{path} should be unregistered"
            );
        }
        assert!(system.try_get_actor::<Counter>(bystander.path()).is_some());
        assert_eq!(grandchild.lifecycle(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let system = ActorSystem::new();
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let actor = system
            .create_actor(
                move || Recorder {
                    events: sink,
                    fail_start: false,
                },
                CreateOptions::named("once"),
            )
            .await
            .unwrap();

        actor.stop().await;
        actor.stop().await;
        system.stop_actor(actor.path()).await;

        let seen = events.lock().clone();
        assert_eq!(seen, vec!["started", "stopped"]);
    }

    #[tokio::test]
    async fn test_stopped_actor_rejects_work() {
        let system = ActorSystem::new();
        let actor = system
            .create_actor(Counter::default, CreateOptions::named("gone"))
            .await
            .unwrap();
        actor.stop().await;

        let err = actor.ask(|c| c.count).await.unwrap_err();
        assert!(err.is_stopped());
        assert!(actor.tell(|c| c.count += 1).is_err());
    }

    struct SlowStopper {
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl Actor for SlowStopper {
        async fn stopped(&mut self) {
            self.gate.notified().await;
        }
    }

    #[tokio::test]
    async fn test_stopping_parent_rejects_new_children() {
        let system = ActorSystem::new();
        let gate = Arc::new(tokio::sync::Notify::new());
        let parent = system
            .create_actor(
                {
                    let gate = Arc::clone(&gate);
                    move || SlowStopper { gate }
                },
                CreateOptions::named("slow"),
            )
            .await
            .unwrap();

        let stopping = tokio::spawn({
            let parent = parent.clone();
            async move { parent.stop().await }
        });
        // Wait until the stop has flipped the state.
        while parent.lifecycle() != LifecycleState::Stopping {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let result = system
            .create_actor(
                Counter::default,
                CreateOptions::named("late").under(parent.path()),
            )
            .await;
        assert!(matches!(result, Err(ActorError::Stopping { .. })));

        gate.notify_one();
        stopping.await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_reinitializes_registry() {
        let system = ActorSystem::new();
        system
            .create_actor(Counter::default, CreateOptions::named("a"))
            .await
            .unwrap();
        system
            .create_actor(Counter::default, CreateOptions::named("b"))
            .await
            .unwrap();

        system.reset().await;

        assert_eq!(system.list_actors(), vec![ActorPath::root()]);
        // The tree is usable again after the reset.
        system
            .create_actor(Counter::default, CreateOptions::named("a"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ask_serializes_against_tell() {
        let system = ActorSystem::new();
        let actor = system
            .create_actor(Counter::default, CreateOptions::named("serial"))
            .await
            .unwrap();

        for _ in 0..100 {
            actor.tell(|c| c.count += 1).unwrap();
        }
        // The ask queues behind all the tells.
        assert_eq!(actor.ask(|c| c.count).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_ask_async_runs_on_the_queue() {
        let system = ActorSystem::new();
        let actor = system
            .create_actor(Counter::default, CreateOptions::named("async"))
            .await
            .unwrap();

        let value = actor
            .ask_async(|c: &mut Counter| {
                async move {
                    c.count += 1;
                    c.count
                }
                .boxed()
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn test_resolver_release_runs_on_stop() {
        struct CountingResolver(Arc<AtomicUsize>);
        impl Resolver for CountingResolver {
            fn release(&self, _path: &ActorPath, _instance: &dyn std::any::Any) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let released = Arc::new(AtomicUsize::new(0));
        let system = ActorSystem::with_resolver(CountingResolver(Arc::clone(&released)));
        let actor = system
            .create_actor(Counter::default, CreateOptions::named("held"))
            .await
            .unwrap();
        actor.stop().await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
