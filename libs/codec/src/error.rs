//! Protocol-level errors for wire message processing

use thiserror::Error;

/// Codec errors with diagnostic context
///
/// Frame-level variants indicate a protocol violation by the peer; the
/// owning connection is expected to close on them. Serialization variants
/// wrap the pluggable serializer's failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A declared frame length exceeds the configured maximum
    #[error("frame too large: declared {declared} bytes, maximum {max}")]
    FrameTooLarge { declared: usize, max: usize },

    /// A declared frame length is smaller than the length prefix itself
    #[error("invalid frame length {declared}: must be at least {min}")]
    InvalidFrameLength { declared: usize, min: usize },

    /// Payload ended before the expected field
    #[error("truncated frame: need {need} bytes, got {got} (reading {context})")]
    Truncated {
        need: usize,
        got: usize,
        context: &'static str,
    },

    /// Unrecognized framing discriminator
    #[error("unknown frame discriminator {value:#x}")]
    UnknownDiscriminator { value: u32 },

    /// A length-delimited string field is not valid UTF-8
    #[error("invalid UTF-8 in {context}")]
    InvalidUtf8 { context: &'static str },

    /// Pluggable serializer failed to encode a value
    #[error("serialize failed: {message}")]
    Serialize { message: String },

    /// Pluggable serializer failed to decode a value
    #[error("deserialize failed: {message}")]
    Deserialize { message: String },
}

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

impl CodecError {
    /// Create a serialize error from any serializer failure
    pub fn serialize(err: impl std::fmt::Display) -> Self {
        Self::Serialize {
            message: err.to_string(),
        }
    }

    /// Create a deserialize error from any serializer failure
    pub fn deserialize(err: impl std::fmt::Display) -> Self {
        Self::Deserialize {
            message: err.to_string(),
        }
    }

    /// True for errors that indicate a protocol violation by the peer
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::FrameTooLarge { .. }
                | Self::InvalidFrameLength { .. }
                | Self::Truncated { .. }
                | Self::UnknownDiscriminator { .. }
                | Self::InvalidUtf8 { .. }
        )
    }
}
