//! Remote Protocol
//!
//! Network transparency for the actor layer: a [`RemoteClient`] exposes a
//! served interface over one framed connection, correlating request and
//! response by connection-scoped ids; a [`RemoteServer`] dispatches
//! inbound calls onto the target actors' executors, answers protocol
//! control out-of-band and broadcasts observable streams to every
//! connected client.
//!
//! ```text
//! caller ──call()──▶ RemoteClient ══frames══▶ RemoteServer ──ask()──▶ actor
//!        ◀──future──        ▲                      │
//!  subscribe()──────────────┘◀═══observable════════┘ publish()
//! ```

pub mod client;
pub mod dispatch;
pub mod error;
pub mod observable;
pub mod server;
pub mod session;

pub use client::{ClientConfig, RemoteClient, RemoteSubscription};
pub use dispatch::DispatchTable;
pub use error::{RemotingError, Result};
pub use observable::{ObservableChannel, ObservableSubscription};
pub use server::{RemoteServer, ServerConfig};
pub use session::ActorSession;
