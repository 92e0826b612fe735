//! Wire Message Envelopes
//!
//! Every frame payload starts with a `u32` little-endian discriminator
//! identifying its purpose: application request/response, protocol control
//! or observable broadcast. The discriminators are bit-flags; each frame
//! currently carries exactly one.
//!
//! Request and response share a discriminator and are told apart by
//! direction: a server decodes application frames as requests, a client
//! decodes them as responses.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, Result};

/// Framing discriminator bit-flags
pub mod flags {
    /// Application request or response
    pub const REQUEST_RESPONSE: u32 = 0x1;
    /// Unsolicited observable broadcast
    pub const OBSERVABLE: u32 = 0x2;
    /// Protocol control (handshake, ping)
    pub const PROTOCOL: u32 = 0x4;
}

/// Application call: `[disc][i64 request_id][u32 method_len][method][args]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub request_id: i64,
    pub method: String,
    pub args: Bytes,
}

/// Application reply: `[disc][i64 request_id][reply envelope]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub request_id: i64,
    pub envelope: Bytes,
}

/// Protocol control: `[disc][i32 control_id][payload]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    pub control_id: i32,
    pub payload: Bytes,
}

/// Observable broadcast: `[disc][i32 name_len][name][value]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservableFrame {
    pub name: String,
    pub value: Bytes,
}

/// Frames a client may receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Response(ResponseFrame),
    Control(ControlFrame),
    Observable(ObservableFrame),
}

/// Frames a server may receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Request(RequestFrame),
    Control(ControlFrame),
}

/// Result-or-error carrier inside a response frame
///
/// Exactly one of `value` / `error` is set; the error slot holds the
/// remote error's message text (stack traces do not cross the wire).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyEnvelope<T> {
    pub value: Option<T>,
    pub error: Option<String>,
}

impl<T> ReplyEnvelope<T> {
    /// Successful reply
    pub fn ok(value: T) -> Self {
        Self {
            value: Some(value),
            error: None,
        }
    }

    /// Failed reply carrying the error message
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            value: None,
            error: Some(message.into()),
        }
    }

    /// Unpack into a result, treating an empty envelope as an error
    pub fn into_result(self) -> std::result::Result<T, String> {
        match (self.value, self.error) {
            (Some(value), None) => Ok(value),
            (_, Some(message)) => Err(message),
            (None, None) => Err("empty reply envelope".to_string()),
        }
    }
}

impl RequestFrame {
    pub fn new(request_id: i64, method: impl Into<String>, args: impl Into<Bytes>) -> Self {
        Self {
            request_id,
            method: method.into(),
            args: args.into(),
        }
    }

    /// Encode as a frame payload (framing prefix not included)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + self.method.len() + self.args.len());
        buf.put_u32_le(flags::REQUEST_RESPONSE);
        buf.put_i64_le(self.request_id);
        buf.put_u32_le(self.method.len() as u32);
        buf.put_slice(self.method.as_bytes());
        buf.put_slice(&self.args);
        buf.freeze()
    }
}

impl ResponseFrame {
    pub fn new(request_id: i64, envelope: impl Into<Bytes>) -> Self {
        Self {
            request_id,
            envelope: envelope.into(),
        }
    }

    /// Encode as a frame payload (framing prefix not included)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12 + self.envelope.len());
        buf.put_u32_le(flags::REQUEST_RESPONSE);
        buf.put_i64_le(self.request_id);
        buf.put_slice(&self.envelope);
        buf.freeze()
    }
}

impl ControlFrame {
    pub fn new(control_id: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            control_id,
            payload: payload.into(),
        }
    }

    /// Encode as a frame payload (framing prefix not included)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.payload.len());
        buf.put_u32_le(flags::PROTOCOL);
        buf.put_i32_le(self.control_id);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

impl ObservableFrame {
    pub fn new(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Encode as a frame payload (framing prefix not included)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.name.len() + self.value.len());
        buf.put_u32_le(flags::OBSERVABLE);
        buf.put_i32_le(self.name.len() as i32);
        buf.put_slice(self.name.as_bytes());
        buf.put_slice(&self.value);
        buf.freeze()
    }
}

/// Decode a frame payload arriving at a client
pub fn decode_client_frame(mut payload: Bytes) -> Result<ClientFrame> {
    match read_discriminator(&mut payload)? {
        flags::REQUEST_RESPONSE => {
            let request_id = read_i64(&mut payload, "response request id")?;
            Ok(ClientFrame::Response(ResponseFrame {
                request_id,
                envelope: payload,
            }))
        }
        flags::PROTOCOL => Ok(ClientFrame::Control(decode_control(payload)?)),
        flags::OBSERVABLE => {
            let name = read_string(&mut payload, "observable name")?;
            Ok(ClientFrame::Observable(ObservableFrame {
                name,
                value: payload,
            }))
        }
        value => Err(CodecError::UnknownDiscriminator { value }),
    }
}

/// Decode a frame payload arriving at a server
pub fn decode_server_frame(mut payload: Bytes) -> Result<ServerFrame> {
    match read_discriminator(&mut payload)? {
        flags::REQUEST_RESPONSE => {
            let request_id = read_i64(&mut payload, "request id")?;
            let method = read_string(&mut payload, "method name")?;
            Ok(ServerFrame::Request(RequestFrame {
                request_id,
                method,
                args: payload,
            }))
        }
        flags::PROTOCOL => Ok(ServerFrame::Control(decode_control(payload)?)),
        value => Err(CodecError::UnknownDiscriminator { value }),
    }
}

fn decode_control(mut payload: Bytes) -> Result<ControlFrame> {
    if payload.remaining() < 4 {
        return Err(CodecError::Truncated {
            need: 4,
            got: payload.remaining(),
            context: "control id",
        });
    }
    let control_id = payload.get_i32_le();
    Ok(ControlFrame {
        control_id,
        payload,
    })
}

fn read_discriminator(payload: &mut Bytes) -> Result<u32> {
    if payload.remaining() < 4 {
        return Err(CodecError::Truncated {
            need: 4,
            got: payload.remaining(),
            context: "discriminator",
        });
    }
    Ok(payload.get_u32_le())
}

fn read_i64(payload: &mut Bytes, context: &'static str) -> Result<i64> {
    if payload.remaining() < 8 {
        return Err(CodecError::Truncated {
            need: 8,
            got: payload.remaining(),
            context,
        });
    }
    Ok(payload.get_i64_le())
}

fn read_string(payload: &mut Bytes, context: &'static str) -> Result<String> {
    if payload.remaining() < 4 {
        return Err(CodecError::Truncated {
            need: 4,
            got: payload.remaining(),
            context,
        });
    }
    let len = payload.get_u32_le() as usize;
    if payload.remaining() < len {
        return Err(CodecError::Truncated {
            need: len,
            got: payload.remaining(),
            context,
        });
    }
    let raw = payload.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8 { context })
}

/// Deserialize a typed value out of a reply envelope's bytes
pub fn decode_reply<T, S>(serializer: &S, envelope: &[u8]) -> Result<std::result::Result<T, String>>
where
    T: DeserializeOwned,
    S: crate::serializer::Serializer + ?Sized,
{
    let envelope: ReplyEnvelope<T> = serializer.from_bytes(envelope)?;
    Ok(envelope.into_result())
}
