//! Wire Protocol Codec
//!
//! The "rules" layer of the remoting stack: outer length-prefixed framing,
//! typed message envelopes and the pluggable value serializer. This crate
//! deliberately carries no network dependencies; transports feed it bytes
//! and send the bytes it produces.
//!
//! ```text
//! remoting ──▶ [codec] ──▶ network
//!    ▲       envelopes,      ▲
//!    │       framing         │
//!    └── typed values        └── raw byte stream
//! ```

pub mod control;
pub mod error;
pub mod frame;
pub mod serializer;
pub mod wire;

pub use control::{
    Handshake, HandshakeReply, Ping, CONTROL_HANDSHAKE, CONTROL_PING, PROTOCOL_VERSION,
};
pub use error::{CodecError, Result};
pub use frame::{encode_frame, FrameBuffer, DEFAULT_MAX_FRAME, LENGTH_PREFIX};
pub use serializer::{BincodeSerializer, Serializer};
pub use wire::{
    decode_client_frame, decode_reply, decode_server_frame, flags, ClientFrame, ControlFrame,
    ObservableFrame, ReplyEnvelope, RequestFrame, ResponseFrame, ServerFrame,
};
