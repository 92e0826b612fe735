//! Network Transport Layer
//!
//! Raw byte transports and the framed connections built on them. A
//! [`FramedConnection`] owns the socket through a reader/writer task pair;
//! consumers receive reassembled frame payloads and a single terminal
//! disconnect event through a channel, so transport callbacks never touch
//! consumer state directly.

pub mod error;
pub mod framed;
pub mod tcp;

pub use error::{Result, TransportError};
pub use framed::{
    ConnectionEvent, ConnectionStats, DisconnectCause, FramedConfig, FramedConnection,
};
pub use tcp::{connect, TcpAcceptor, TcpConfig};
