//! Protocol Control Payloads
//!
//! Out-of-band messages exchanged inside [`ControlFrame`] envelopes,
//! keyed by a small fixed control-id namespace.
//!
//! [`ControlFrame`]: crate::wire::ControlFrame

use serde::{Deserialize, Serialize};

/// Protocol version spoken by this implementation
pub const PROTOCOL_VERSION: u32 = 1;

/// Control id for the version handshake
pub const CONTROL_HANDSHAKE: i32 = 1;

/// Control id for the liveness/latency probe
pub const CONTROL_PING: i32 = 2;

/// Client-initiated version exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub client_version: u32,
}

/// Server's answer to a [`Handshake`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReply {
    /// Version the client asked for, echoed back
    pub requested_version: u32,
    pub server_version: u32,
    pub matched: bool,
}

/// Liveness probe; the server echoes the timestamp untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub timestamp_ns: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::{BincodeSerializer, Serializer};

    #[test]
    fn test_control_payloads_round_trip() {
        let serializer = BincodeSerializer;

        let handshake = Handshake { client_version: 1 };
        let bytes = serializer.to_bytes(&handshake).unwrap();
        assert_eq!(serializer.from_bytes::<Handshake>(&bytes).unwrap(), handshake);

        let reply = HandshakeReply {
            requested_version: 1,
            server_version: 1,
            matched: true,
        };
        let bytes = serializer.to_bytes(&reply).unwrap();
        assert_eq!(
            serializer.from_bytes::<HandshakeReply>(&bytes).unwrap(),
            reply
        );

        let ping = Ping {
            timestamp_ns: 123_456_789,
        };
        let bytes = serializer.to_bytes(&ping).unwrap();
        assert_eq!(serializer.from_bytes::<Ping>(&bytes).unwrap(), ping);
    }
}
