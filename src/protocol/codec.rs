//! Frame codec for delimiting frames on the byte stream
//!
//! TCP does not preserve write boundaries, so by default every frame is
//! prefixed with its length. The raw mode keeps the older convention where a
//! single socket read is taken to be exactly one frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Default maximum frame size (10 MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Header size: length(4)
const HEADER_SIZE: usize = 4;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How frames are delimited on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FramingMode {
    /// 4-byte big-endian length followed by the frame
    #[default]
    LengthPrefixed,
    /// One socket read is one frame; nothing is added on send
    Raw,
}

/// The length header is a u32, which bounds any configured maximum
fn clamp_max(max_message_size: usize) -> usize {
    max_message_size.min(u32::MAX as usize)
}

/// Encodes frames into the wire format
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    mode: FramingMode,
    max_message_size: usize,
}

impl FrameEncoder {
    pub fn new(mode: FramingMode, max_message_size: usize) -> Self {
        Self {
            mode,
            max_message_size: clamp_max(max_message_size),
        }
    }

    /// Encode one frame into a buffer
    pub fn encode(&self, payload: &[u8], buf: &mut BytesMut) -> Result<(), CodecError> {
        if payload.len() > self.max_message_size {
            return Err(CodecError::MessageTooLarge(
                payload.len(),
                self.max_message_size,
            ));
        }

        if self.mode == FramingMode::LengthPrefixed {
            let length = u32::try_from(payload.len())
                .map_err(|_| CodecError::MessageTooLarge(payload.len(), self.max_message_size))?;
            buf.reserve(HEADER_SIZE + payload.len());
            buf.put_u32(length);
        }
        buf.put_slice(payload);

        Ok(())
    }
}

/// Decodes frames from the wire format
#[derive(Debug)]
pub struct FrameDecoder {
    mode: FramingMode,
    max_message_size: usize,
    state: DecodeState,
}

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    Header,
    Payload {
        length: usize,
    },
}

impl FrameDecoder {
    pub fn new(mode: FramingMode, max_message_size: usize) -> Self {
        Self {
            mode,
            max_message_size: clamp_max(max_message_size),
            state: DecodeState::Header,
        }
    }

    /// Attempt to decode a frame from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        if self.mode == FramingMode::Raw {
            if buf.is_empty() {
                return Ok(None);
            }
            return Ok(Some(buf.split().freeze()));
        }

        loop {
            match self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

                    if length > self.max_message_size {
                        return Err(CodecError::MessageTooLarge(length, self.max_message_size));
                    }

                    buf.advance(HEADER_SIZE);
                    self.state = DecodeState::Payload { length };
                }
                DecodeState::Payload { length } => {
                    if buf.len() < length {
                        return Ok(None);
                    }

                    let frame = buf.split_to(length).freeze();
                    self.state = DecodeState::Header;

                    return Ok(Some(frame));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_prefixed_roundtrip() {
        let encoder = FrameEncoder::new(FramingMode::LengthPrefixed, DEFAULT_MAX_MESSAGE_SIZE);
        let mut decoder = FrameDecoder::new(FramingMode::LengthPrefixed, DEFAULT_MAX_MESSAGE_SIZE);
        let mut buf = BytesMut::new();

        encoder.encode(b"hello", &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 5]);

        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_coalesced_frames_split_apart() {
        let encoder = FrameEncoder::new(FramingMode::LengthPrefixed, DEFAULT_MAX_MESSAGE_SIZE);
        let mut decoder = FrameDecoder::new(FramingMode::LengthPrefixed, DEFAULT_MAX_MESSAGE_SIZE);
        let mut buf = BytesMut::new();

        encoder.encode(&[1, 2, 3], &mut buf).unwrap();
        encoder.encode(&[4; 64], &mut buf).unwrap();

        assert_eq!(&decoder.decode(&mut buf).unwrap().unwrap()[..], &[1, 2, 3]);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().len(), 64);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut decoder = FrameDecoder::new(FramingMode::LengthPrefixed, DEFAULT_MAX_MESSAGE_SIZE);
        let mut buf = BytesMut::new();

        buf.put_slice(&[0, 0]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.put_slice(&[0, 3, 9]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.put_slice(&[8, 7]);
        assert_eq!(&decoder.decode(&mut buf).unwrap().unwrap()[..], &[9, 8, 7]);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let encoder = FrameEncoder::new(FramingMode::LengthPrefixed, 8);
        let mut buf = BytesMut::new();
        assert!(matches!(
            encoder.encode(&[0; 9], &mut buf),
            Err(CodecError::MessageTooLarge(9, 8))
        ));

        let mut decoder = FrameDecoder::new(FramingMode::LengthPrefixed, 8);
        buf.put_u32(1024);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(CodecError::MessageTooLarge(1024, 8))
        ));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_max_size_bounded_by_length_header() {
        let encoder = FrameEncoder::new(FramingMode::LengthPrefixed, usize::MAX);
        let decoder = FrameDecoder::new(FramingMode::LengthPrefixed, u32::MAX as usize + 10);
        assert_eq!(encoder.max_message_size, u32::MAX as usize);
        assert_eq!(decoder.max_message_size, u32::MAX as usize);

        let encoder = FrameEncoder::new(FramingMode::LengthPrefixed, 1024);
        assert_eq!(encoder.max_message_size, 1024);
    }

    #[test]
    fn test_raw_mode_passes_reads_through() {
        let encoder = FrameEncoder::new(FramingMode::Raw, DEFAULT_MAX_MESSAGE_SIZE);
        let mut decoder = FrameDecoder::new(FramingMode::Raw, DEFAULT_MAX_MESSAGE_SIZE);
        let mut buf = BytesMut::new();

        encoder.encode(b"abc", &mut buf).unwrap();
        assert_eq!(&buf[..], b"abc");

        assert_eq!(&decoder.decode(&mut buf).unwrap().unwrap()[..], b"abc");
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }
}
