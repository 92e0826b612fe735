//! Pluggable Serializer
//!
//! The wire protocol never assumes a concrete codec: anything that can
//! turn serde-enabled values into bytes and back plugs in here. The
//! default is bincode.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CodecError, Result};

/// Value codec injected at proxy/server construction
pub trait Serializer: Send + Sync + 'static {
    /// Encode a value
    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode a value
    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// Default serializer backed by bincode
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeSerializer;

impl Serializer for BincodeSerializer {
    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(CodecError::serialize)
    }

    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(CodecError::deserialize)
    }
}
