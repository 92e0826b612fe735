//! Remoting Error Types

use actors::ActorError;
use codec::CodecError;
use network::TransportError;
use thiserror::Error;

/// Errors surfaced by remote proxies and the server
#[derive(Error, Debug)]
pub enum RemotingError {
    /// Underlying transport failure (connect refused, reset, timeout)
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Frame or value could not be encoded/decoded
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The remote method failed; the message equals the remote error's
    /// message text (stack traces do not cross the wire)
    #[error("{message}")]
    Remote { message: String },

    /// The connection went away; pending calls fail with this
    #[error("disconnected: {cause}")]
    Disconnected { cause: String },

    /// Handshake versions did not match
    #[error("protocol version mismatch: client {client_version}, server {server_version}")]
    VersionMismatch {
        client_version: u32,
        server_version: u32,
    },

    /// Peer violated the wire protocol
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// A control exchange exceeded its deadline
    #[error("timeout waiting for {operation}")]
    Timeout { operation: String },

    /// Local actor-side failure during dispatch
    #[error(transparent)]
    Actor(#[from] ActorError),
}

/// Result type alias for remoting operations
pub type Result<T> = std::result::Result<T, RemotingError>;

impl RemotingError {
    /// Create a remote-failure error carrying the original message
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Create a disconnected error
    pub fn disconnected(cause: impl Into<String>) -> Self {
        Self::Disconnected {
            cause: cause.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }
}
