//! Length-Prefixed Framing
//!
//! Outer framing is `[u32 total_length][payload]` with the length in
//! little-endian and counting the prefix itself. [`FrameBuffer`] rebuilds
//! the exact sequence of written frames from a raw byte stream regardless
//! of how the stream was chunked in transit.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::error::{CodecError, Result};

/// Size of the length prefix
pub const LENGTH_PREFIX: usize = 4;

/// Default cap on a single frame, matching the transport default
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Frame a payload for the wire
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let total = payload.len() + LENGTH_PREFIX;
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32_le(total as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Incremental frame reassembly buffer
///
/// Feed arbitrary chunks with [`extend`](Self::extend) and pull complete
/// frame payloads with [`next_frame`](Self::next_frame). Handles a frame
/// split across many chunks as well as many frames packed into one chunk.
/// The buffer grows to fit oversized frames (amortized doubling) and
/// reclaims consumed space as frames are extracted, so steady-state memory
/// stays bounded by the largest in-flight frame.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_frame: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    /// Create a buffer with the default frame size cap
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME)
    }

    /// Create a buffer with an explicit frame size cap
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            max_frame,
        }
    }

    /// Append a received chunk
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes currently buffered and not yet extracted
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete frame payload, if one is available
    ///
    /// Returns `Ok(None)` when more data is needed. A declared length that
    /// is impossible (smaller than the prefix) or above the cap is a
    /// protocol violation.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let total = LittleEndian::read_u32(&self.buf[..LENGTH_PREFIX]) as usize;
        if total < LENGTH_PREFIX {
            warn!(declared = total, "impossible frame length");
            return Err(CodecError::InvalidFrameLength {
                declared: total,
                min: LENGTH_PREFIX,
            });
        }
        if total > self.max_frame {
            warn!(declared = total, max = self.max_frame, "oversized frame");
            return Err(CodecError::FrameTooLarge {
                declared: total,
                max: self.max_frame,
            });
        }
        if self.buf.len() < total {
            // Partial frame: reserve up front so repeated small chunks do
            // not trigger repeated growth.
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }
        let mut frame = self.buf.split_to(total);
        let payload = frame.split_off(LENGTH_PREFIX);
        Ok(Some(payload.freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn collect_frames(buffer: &mut FrameBuffer) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = buffer.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_round_trip_single_frame() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(&encode_frame(b"hello"));
        let frames = collect_frames(&mut buffer);
        assert_eq!(frames, vec![Bytes::from_static(b"hello")]);
        assert_eq!(buffer.buffered(), 0);
    }

    #[test]
    fn test_empty_payload_frame() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(&encode_frame(b""));
        let frames = collect_frames(&mut buffer);
        assert_eq!(frames, vec![Bytes::new()]);
    }

    #[test]
    fn test_one_byte_at_a_time_delivery() {
        let mut buffer = FrameBuffer::new();
        let wire = encode_frame(b"fragmented payload");
        let mut frames = Vec::new();
        for byte in wire.iter() {
            buffer.extend(&[*byte]);
            frames.extend(collect_frames(&mut buffer));
        }
        assert_eq!(frames, vec![Bytes::from_static(b"fragmented payload")]);
    }

    #[test]
    fn test_concatenated_frames_in_one_chunk() {
        let mut buffer = FrameBuffer::new();
        let mut chunk = Vec::new();
        chunk.extend_from_slice(&encode_frame(b"first"));
        chunk.extend_from_slice(&encode_frame(b"second"));
        chunk.extend_from_slice(&encode_frame(b"third"));
        buffer.extend(&chunk);
        let frames = collect_frames(&mut buffer);
        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"first"),
                Bytes::from_static(b"second"),
                Bytes::from_static(b"third"),
            ]
        );
    }

    #[test]
    fn test_partial_header_waits_for_more_data() {
        let mut buffer = FrameBuffer::new();
        let wire = encode_frame(b"abc");
        buffer.extend(&wire[..3]);
        assert!(buffer.next_frame().unwrap().is_none());
        buffer.extend(&wire[3..]);
        assert_eq!(collect_frames(&mut buffer), vec![Bytes::from_static(b"abc")]);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buffer = FrameBuffer::with_max_frame(16);
        buffer.extend(&encode_frame(&[0u8; 64]));
        assert!(matches!(
            buffer.next_frame(),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_undersized_length_rejected() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(&2u32.to_le_bytes());
        assert!(matches!(
            buffer.next_frame(),
            Err(CodecError::InvalidFrameLength { declared: 2, .. })
        ));
    }

    proptest! {
        /// Any frame sequence survives arbitrary re-chunking intact and in
        /// order.
        #[test]
        fn prop_round_trip_under_arbitrary_chunking(
            payloads in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..256),
                1..12,
            ),
            chunk_sizes in proptest::collection::vec(1usize..64, 1..128),
        ) {
            let mut wire = Vec::new();
            for payload in &payloads {
                wire.extend_from_slice(&encode_frame(payload));
            }

            let mut buffer = FrameBuffer::new();
            let mut received = Vec::new();
            let mut offset = 0;
            let mut chunks = chunk_sizes.iter().cycle();
            while offset < wire.len() {
                let take = (*chunks.next().unwrap()).min(wire.len() - offset);
                buffer.extend(&wire[offset..offset + take]);
                offset += take;
                while let Some(frame) = buffer.next_frame().unwrap() {
                    received.push(frame.to_vec());
                }
            }

            prop_assert_eq!(received, payloads);
            prop_assert_eq!(buffer.buffered(), 0);
        }
    }
}
