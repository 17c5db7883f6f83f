//! Message kinds exchanged between an instrumented process and its observers.

use bytes::Bytes;
use como_types::Source;

use crate::codec::{self, CodecError};

/// Kind tag carried by every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Full snapshot of a live source.
    Source = 0x01,
    /// Source was removed from the registry.
    DeinitSource = 0x02,
    /// Request for a `Source` message per live source.
    GetListOfSources = 0x03,
}

impl MessageKind {
    #[must_use]
    pub fn tag(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Source),
            0x02 => Some(Self::DeinitSource),
            0x03 => Some(Self::GetListOfSources),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Source => write!(f, "SourceMessage"),
            MessageKind::DeinitSource => write!(f, "DeinitSourceMessage"),
            MessageKind::GetListOfSources => write!(f, "GetListOfSourcesMessage"),
        }
    }
}

/// One delimited unit of the byte stream: a kind tag and its raw payload.
///
/// The payload has not been interpreted yet, so a frame can be forwarded to
/// many connections without decoding it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub payload: Bytes,
}

impl Frame {
    #[must_use]
    pub fn new(kind: MessageKind, payload: Bytes) -> Self {
        Self { kind, payload }
    }
}

/// Decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Source(Source),
    DeinitSource(Source),
    GetListOfSources,
}

impl Message {
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Source(_) => MessageKind::Source,
            Message::DeinitSource(_) => MessageKind::DeinitSource,
            Message::GetListOfSources => MessageKind::GetListOfSources,
        }
    }

    #[must_use]
    pub fn source(&self) -> Option<&Source> {
        match self {
            Message::Source(s) | Message::DeinitSource(s) => Some(s),
            Message::GetListOfSources => None,
        }
    }

    #[must_use]
    pub fn to_frame(&self) -> Frame {
        let payload = match self {
            Message::Source(s) | Message::DeinitSource(s) => codec::encode_source(s),
            Message::GetListOfSources => Bytes::new(),
        };
        Frame::new(self.kind(), payload)
    }

    /// Interpret the payload of an already delimited frame.
    ///
    /// # Errors
    ///
    /// Returns a `CodecError` describing the first invalid field. The error
    /// only concerns this frame; the stream position is unaffected.
    pub fn from_frame(frame: Frame) -> Result<Self, CodecError> {
        match frame.kind {
            MessageKind::Source => Ok(Message::Source(codec::decode_source(frame.payload)?)),
            MessageKind::DeinitSource => {
                Ok(Message::DeinitSource(codec::decode_source(frame.payload)?))
            }
            MessageKind::GetListOfSources if frame.payload.is_empty() => {
                Ok(Message::GetListOfSources)
            }
            MessageKind::GetListOfSources => {
                Err(CodecError::UnexpectedPayload(frame.payload.len()))
            }
        }
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        message.to_frame()
    }
}
