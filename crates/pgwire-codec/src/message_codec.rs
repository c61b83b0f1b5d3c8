//! PostgreSQL message codec implementation.

use bytes::{Buf, BytesMut};
use pgwire_protocol::{
    BackendMessage, FrontendMessage, HEADER_SIZE, MAX_MESSAGE_SIZE, ProtocolError,
};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;

/// Message codec for tokio-util framing.
///
/// Backend messages are a tag byte followed by a big-endian length that
/// counts itself and the body.
#[derive(Debug)]
pub struct PgCodec {
    max_message_size: usize,
}

impl PgCodec {
    /// Create a codec with the default size limit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Create a codec with a custom maximum message size.
    #[must_use]
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size.min(MAX_MESSAGE_SIZE);
        self
    }
}

impl Default for PgCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PgCodec {
    type Item = BackendMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let tag = src[0];
        let length = i32::from_be_bytes([src[1], src[2], src[3], src[4]]);
        if length < 4 {
            return Err(ProtocolError::InvalidLength(length).into());
        }
        let length = length as usize;
        if length > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: length,
                max: self.max_message_size,
            }
            .into());
        }

        let total = length + 1;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(HEADER_SIZE);
        let msg = BackendMessage::decode(tag, frame.freeze())?;

        tracing::trace!(message = msg.name(), length = length, "decoded backend message");

        Ok(Some(msg))
    }
}

impl Encoder<FrontendMessage<'_>> for PgCodec {
    type Error = CodecError;

    fn encode(&mut self, item: FrontendMessage<'_>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        item.encode(dst);
        tracing::trace!(length = dst.len() - start, "encoded frontend message");
        Ok(())
    }
}
