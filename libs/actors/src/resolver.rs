//! Pluggable Dependency Resolver
//!
//! Construction goes through the typed factory passed to
//! [`create_actor`](crate::system::ActorSystem::create_actor): plain
//! constructor injection from an explicit argument list, no container
//! required. The resolver capability hooks the other end of the lifecycle:
//! `release` runs when an actor stops, so a container-backed
//! implementation can reclaim whatever it handed to the factory.

use std::any::Any;

use crate::path::ActorPath;

/// Capability interface for resolver-held resources
pub trait Resolver: Send + Sync + 'static {
    /// Called when an actor stops, with the instance about to be dropped
    fn release(&self, path: &ActorPath, instance: &dyn Any);
}

/// Default resolver: constructor injection only, nothing to release
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstructorResolver;

impl Resolver for ConstructorResolver {
    fn release(&self, _path: &ActorPath, _instance: &dyn Any) {}
}
