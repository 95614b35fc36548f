//! Protocol codec for encoding/decoding frames
//!
//! Handles framing of requests and responses. A frame is an ordinal plus a
//! list of opaque length-prefixed parameter blobs; giving the ordinal and the
//! blobs meaning is left to [`super::Request`] and [`super::Response`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use thiserror::Error;

use super::MAX_PARAMETERS;

/// Default maximum frame size (10 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Header size: ordinal(4) + parameter count(4) = 8 bytes
const HEADER_SIZE: usize = 8;

/// Parameter length prefix size
const LENGTH_SIZE: usize = 4;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unknown command ordinal: {0}")]
    UnknownCommand(u32),

    #[error("Unknown response ordinal: {0}")]
    UnknownResponse(u32),

    #[error("{name} expects {expected} parameter(s), got {actual}")]
    Arity {
        name: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Too many parameters: {0} (max: {1})")]
    TooManyParameters(usize, usize),

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// One request or response on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command ordinal for requests, response ordinal for responses
    pub ordinal: u32,
    /// Opaque parameter blobs
    pub params: Vec<Bytes>,
}

impl Frame {
    pub fn new(ordinal: u32, params: Vec<Bytes>) -> Self {
        Self { ordinal, params }
    }

    /// Frame without parameters
    pub fn bare(ordinal: u32) -> Self {
        Self::new(ordinal, Vec::new())
    }

    /// Serialize a value into a parameter blob
    pub fn blob<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(bincode::serialize(value)?))
    }

    /// Deserialize the parameter at `index`
    pub fn param<T: DeserializeOwned>(&self, index: usize) -> Result<T, CodecError> {
        let blob = self.params.get(index).ok_or(CodecError::Arity {
            name: "frame",
            expected: index + 1,
            actual: self.params.len(),
        })?;
        Ok(bincode::deserialize(blob)?)
    }

    /// Size of this frame once encoded
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE
            + self
                .params
                .iter()
                .map(|p| LENGTH_SIZE + p.len())
                .sum::<usize>()
    }
}

/// Encodes frames into the wire format
pub struct Encoder {
    max_frame_size: usize,
}

impl Encoder {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_limit(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Encode a frame into a buffer
    pub fn encode(&self, frame: &Frame, buf: &mut BytesMut) -> Result<(), CodecError> {
        if frame.params.len() > MAX_PARAMETERS {
            return Err(CodecError::TooManyParameters(frame.params.len(), MAX_PARAMETERS));
        }

        let size = frame.encoded_len();
        if size > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(size, self.max_frame_size));
        }

        buf.reserve(size);
        buf.put_u32(frame.ordinal);
        buf.put_u32(frame.params.len() as u32);

        for param in &frame.params {
            buf.put_u32(param.len() as u32);
            buf.put_slice(param);
        }

        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes frames from the wire format
pub struct Decoder {
    state: DecodeState,
    max_frame_size: usize,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Header,
    Params {
        ordinal: u32,
        remaining: usize,
        params: Vec<Bytes>,
        consumed: usize,
    },
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_limit(max_frame_size: usize) -> Self {
        Self {
            state: DecodeState::Header,
            max_frame_size,
        }
    }

    /// True between frames
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::Header)
    }

    /// Attempt to decode a frame from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            match &mut self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let ordinal = buf.get_u32();
                    let count = buf.get_u32() as usize;

                    if count > MAX_PARAMETERS {
                        return Err(CodecError::TooManyParameters(count, MAX_PARAMETERS));
                    }

                    self.state = DecodeState::Params {
                        ordinal,
                        remaining: count,
                        params: Vec::with_capacity(count),
                        consumed: HEADER_SIZE,
                    };
                }
                DecodeState::Params {
                    ordinal,
                    remaining,
                    params,
                    consumed,
                } => {
                    if *remaining == 0 {
                        let frame = Frame::new(*ordinal, std::mem::take(params));
                        self.state = DecodeState::Header;
                        return Ok(Some(frame));
                    }

                    if buf.len() < LENGTH_SIZE {
                        return Ok(None);
                    }

                    let length =
                        u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
                    let total = *consumed + LENGTH_SIZE + length;
                    if total > self.max_frame_size {
                        return Err(CodecError::FrameTooLarge(total, self.max_frame_size));
                    }

                    if buf.len() < LENGTH_SIZE + length {
                        buf.reserve(LENGTH_SIZE + length - buf.len());
                        return Ok(None);
                    }

                    buf.advance(LENGTH_SIZE);
                    params.push(buf.split_to(length).freeze());
                    *consumed = total;
                    *remaining -= 1;
                }
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        Encoder::new().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let original = Frame::new(
            7,
            vec![Frame::blob("node-a").unwrap(), Frame::blob(&42u64).unwrap()],
        );
        let mut buf = encode(&original);

        let frame = Decoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, original);
        assert_eq!(frame.param::<String>(0).unwrap(), "node-a");
        assert_eq!(frame.param::<u64>(1).unwrap(), 42);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_header_layout() {
        let buf = encode(&Frame::new(3, vec![Bytes::from_static(b"xy")]));
        assert_eq!(&buf[..], &[0, 0, 0, 3, 0, 0, 0, 1, 0, 0, 0, 2, b'x', b'y']);
    }

    #[test]
    fn test_bare_frame() {
        let mut buf = encode(&Frame::bare(3));
        assert_eq!(buf.len(), HEADER_SIZE);

        let frame = Decoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.ordinal, 3);
        assert!(frame.params.is_empty());
    }

    #[test]
    fn test_partial_input() {
        let original = Frame::new(4, vec![Bytes::from(vec![9u8; 300])]);
        let bytes = encode(&original);
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();

        for chunk in bytes.chunks(7) {
            assert!(buf.is_empty() || decoder.decode(&mut buf).unwrap().is_none());
            buf.extend_from_slice(chunk);
        }

        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, original);
    }

    #[test]
    fn test_frame_too_large() {
        let frame = Frame::new(0, vec![Bytes::from(vec![0u8; 64])]);

        let mut buf = BytesMut::new();
        let err = Encoder::with_limit(32).encode(&frame, &mut buf).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge(_, 32)));

        let mut buf = encode(&frame);
        let err = Decoder::with_limit(32).decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge(_, 32)));
    }

    #[test]
    fn test_too_many_parameters() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        buf.put_u32(MAX_PARAMETERS as u32 + 1);

        let err = Decoder::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::TooManyParameters(_, MAX_PARAMETERS)));
    }

    #[test]
    fn test_missing_param() {
        let frame = Frame::bare(1);
        assert!(matches!(
            frame.param::<u64>(0),
            Err(CodecError::Arity { expected: 1, actual: 0, .. })
        ));
    }
}
