//! Actor Layer
//!
//! Actor lifecycle, hierarchical naming and the path registry. Actors are
//! created through the [`ActorSystem`] factory, addressed by paths like
//! `/root/workers/a/`, and owned by their parents: stopping a parent
//! cascades depth-first through its children before the parent itself
//! finishes tearing down.
//!
//! Each actor owns one executor, so actors run concurrently with each
//! other but never concurrently with themselves.

pub mod actor;
pub mod error;
pub mod path;
pub mod resolver;
pub mod system;

pub use actor::{Actor, ActorRef, LifecycleState};
pub use error::{ActorError, Result};
pub use path::{validate_name, ActorPath, ROOT_PATH};
pub use resolver::{ConstructorResolver, Resolver};
pub use system::{ActorSystem, CreateOptions};
