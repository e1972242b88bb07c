//! Message framing for the multiplexed transport
//!
//! Every unit written to the encrypted stream is a MessagePack map
//! `{"channel": u16, "data": bin}`. Frames are self-delimiting, so the
//! decoder simply waits until a whole map is buffered.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Largest payload carried by a single frame
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Map header, both keys, the channel id and the bin header, rounded up
const MAX_FRAME_OVERHEAD: usize = 32;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_PAYLOAD})")]
    TooLarge(usize),
    #[error("Undecodable frame: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("Frame encoding failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One `{channel id, payload}` unit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Channel the payload belongs to
    pub channel: u16,
    /// Payload bytes (empty = end of stream for a data channel)
    #[serde(rename = "data", with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame
    pub fn new(channel: u16, payload: Vec<u8>) -> Self {
        Self { channel, payload }
    }

    /// Zero-length frame signaling EOF on `channel`
    pub fn eof(channel: u16) -> Self {
        Self::new(channel, Vec::new())
    }

    pub fn is_eof(&self) -> bool {
        self.payload.is_empty()
    }
}

/// True when decoding stopped only because the buffer ran out
fn needs_more(err: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error;
    match err {
        Error::InvalidMarkerRead(e) | Error::InvalidDataRead(e) => {
            e.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// Codec for channel frames
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut rest: &[u8] = &src[..];
        let decoded = {
            let mut de = rmp_serde::Deserializer::new(&mut rest);
            Frame::deserialize(&mut de)
        };
        let frame = match decoded {
            Ok(frame) => frame,
            Err(e) if needs_more(&e) => {
                if src.len() > MAX_FRAME_PAYLOAD + MAX_FRAME_OVERHEAD {
                    return Err(FrameError::TooLarge(src.len()));
                }
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let consumed = src.len() - rest.len();
        src.advance(consumed);

        if frame.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(FrameError::TooLarge(frame.payload.len()));
        }
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(FrameError::TooLarge(item.payload.len()));
        }

        dst.reserve(MAX_FRAME_OVERHEAD + item.payload.len());
        rmp_serde::encode::write_named(&mut dst.writer(), &item)?;

        Ok(())
    }
}
