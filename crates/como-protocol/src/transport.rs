//! Length-prefixed frame codec for como messages.
//!
//! Every message travels in a frame with a 4-byte big-endian length prefix
//! covering the kind tag and the payload:
//!
//! ```text
//! +----------------+--------+------------------------+
//! |  4 bytes       | 1 byte |  length - 1 bytes      |
//! |  (length BE)   | (kind) |  (payload)             |
//! +----------------+--------+------------------------+
//! ```
//!
//! The decoder only delimits frames and validates the kind tag. Payloads are
//! interpreted later by [`Message::from_frame`], so a bad payload never costs
//! the reader its position in the stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{Frame, Message, MessageKind};

/// Default maximum frame size (16 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes
const LENGTH_PREFIX_SIZE: usize = 4;

/// Kind tag size in bytes
const KIND_SIZE: usize = 1;

/// Errors that make the byte stream unusable
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Empty frame: missing message kind")]
    EmptyFrame,

    #[error("Unknown message kind: {0:#04x}")]
    UnknownKind(u8),
}

impl FrameError {
    /// Whether the error comes from corrupt framing rather than the transport.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        !matches!(self, FrameError::Io(_))
    }
}

/// Codec for length-prefixed como frames
#[derive(Debug, Clone, Copy)]
pub struct ComoCodec {
    max_frame_size: usize,
}

impl Default for ComoCodec {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ComoCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Decoder for ComoCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_SIZE]);
        let length = u32::from_be_bytes(prefix) as usize;

        if length < KIND_SIZE {
            return Err(FrameError::EmptyFrame);
        }

        if length > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let mut body = src.split_to(length);
        let tag = body.get_u8();
        let kind = MessageKind::from_tag(tag).ok_or(FrameError::UnknownKind(tag))?;

        Ok(Some(Frame::new(kind, body.freeze())))
    }
}

impl Encoder<Frame> for ComoCodec {
    type Error = FrameError;

    // Frame size is checked against max_frame_size, which callers keep within u32
    #[allow(clippy::cast_possible_truncation)]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = KIND_SIZE + item.payload.len();

        if length > self.max_frame_size || u32::try_from(length).is_err() {
            return Err(FrameError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + length);
        dst.put_u32(length as u32);
        dst.put_u8(item.kind.tag());
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Encoder<Message> for ComoCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<Frame>::encode(self, item.to_frame(), dst)
    }
}

/// Serialize one frame without a size limit.
// Payloads beyond u32::MAX cannot be represented and are not produced by the codec
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn encode_frame(kind: MessageKind, payload: &[u8]) -> Bytes {
    let mut dst = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + KIND_SIZE + payload.len());
    dst.put_u32((KIND_SIZE + payload.len()) as u32);
    dst.put_u8(kind.tag());
    dst.put_slice(payload);
    dst.freeze()
}

/// Append `new_bytes` to `buffer` and split off every complete frame.
///
/// Bytes of an incomplete trailing frame are returned for the next call.
///
/// # Errors
///
/// Returns the `FrameError` of the first malformed frame. Frames before it
/// are lost with the error since the stream cannot be trusted past that point.
pub fn feed(buffer: BytesMut, new_bytes: &[u8]) -> Result<(Vec<Frame>, BytesMut), FrameError> {
    ComoCodec::new().feed(buffer, new_bytes)
}

impl ComoCodec {
    /// [`feed`] with this codec's frame size limit.
    ///
    /// # Errors
    ///
    /// See [`feed`].
    pub fn feed(
        &mut self,
        mut buffer: BytesMut,
        new_bytes: &[u8],
    ) -> Result<(Vec<Frame>, BytesMut), FrameError> {
        buffer.extend_from_slice(new_bytes);
        let mut frames = Vec::new();
        while let Some(frame) = self.decode(&mut buffer)? {
            frames.push(frame);
        }
        Ok((frames, buffer))
    }
}


#[cfg(test)]
mod proptest_framing_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_frame() -> impl Strategy<Value = (MessageKind, Vec<u8>)> {
        (
            prop_oneof![
                Just(MessageKind::Source),
                Just(MessageKind::DeinitSource),
                Just(MessageKind::GetListOfSources),
            ],
            proptest::collection::vec(any::<u8>(), 0..64),
        )
    }

    proptest! {
        #[test]
        fn chunk_boundaries_do_not_matter(
            frames in proptest::collection::vec(arb_frame(), 0..12),
            chunk in 1usize..32,
        ) {
            let mut stream = Vec::new();
            for (kind, payload) in &frames {
                stream.extend_from_slice(&encode_frame(*kind, payload));
            }

            let mut buffer = BytesMut::new();
            let mut decoded = Vec::new();
            for piece in stream.chunks(chunk) {
                let (mut out, rest) = feed(buffer, piece).unwrap();
                decoded.append(&mut out);
                buffer = rest;
            }

            prop_assert!(buffer.is_empty());
            let decoded: Vec<_> = decoded
                .into_iter()
                .map(|f| (f.kind, f.payload.to_vec()))
                .collect();
            prop_assert_eq!(decoded, frames);
        }

        #[test]
        fn byte_by_byte_equals_all_at_once(frames in proptest::collection::vec(arb_frame(), 1..6)) {
            let mut stream = Vec::new();
            for (kind, payload) in &frames {
                stream.extend_from_slice(&encode_frame(*kind, payload));
            }

            let (all_at_once, _) = feed(BytesMut::new(), &stream).unwrap();

            let mut buffer = BytesMut::new();
            let mut one_by_one = Vec::new();
            for byte in &stream {
                let (mut out, rest) = feed(buffer, std::slice::from_ref(byte)).unwrap();
                one_by_one.append(&mut out);
                buffer = rest;
            }

            prop_assert_eq!(one_by_one, all_at_once);
        }
    }
}
