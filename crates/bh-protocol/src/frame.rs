//! Binary framing for stream transports.
//!
//! Wire layout, network byte order:
//!
//! ```text
//! +----------------+----------------+====================+
//! | payload len u32 | channel id u32 | payload (len bytes) |
//! +----------------+----------------+====================+
//! ```
//!
//! A zero-length frame is the end-of-stream token for its channel.  A
//! length above [`MAX_FRAME_BYTES`](crate::MAX_FRAME_BYTES) is a protocol
//! violation; the codec surfaces it as an error and the connection must be
//! torn down.  Short reads are expected: the decoder keeps partial header
//! and payload bytes in its buffer across calls.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::MAX_FRAME_BYTES;

/// Bytes of frame header preceding the payload.
pub const FRAME_HEADER_BYTES: usize = 8;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame payload of {0} bytes exceeds the {MAX_FRAME_BYTES}-byte bound")]
    Oversize(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One wire token on a multiplexed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(channel: u32, payload: impl Into<Bytes>) -> Frame {
        Frame { channel, payload: payload.into() }
    }

    /// The end-of-stream token for `channel`.
    pub fn eof(channel: u32) -> Frame {
        Frame { channel, payload: Bytes::new() }
    }

    pub fn is_eof(&self) -> bool {
        self.payload.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < FRAME_HEADER_BYTES {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(FrameError::Oversize(len));
        }
        if src.len() < FRAME_HEADER_BYTES + len {
            // Reserve what the rest of the frame needs and wait for more.
            src.reserve(FRAME_HEADER_BYTES + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let channel = src.get_u32();
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { channel, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.payload.len() > MAX_FRAME_BYTES {
            return Err(FrameError::Oversize(frame.payload.len()));
        }
        dst.reserve(FRAME_HEADER_BYTES + frame.payload.len());
        dst.put_u32(frame.payload.len() as u32);
        dst.put_u32(frame.channel);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec.encode(frame, &mut buf).unwrap();
        buf
    }

    /// Test: a frame survives the encode/decode round trip.
    #[test]
    fn round_trip() {
        let mut buf = encoded(Frame::data(42, &b"hello"[..]));
        let got = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(got.channel, 42);
        assert_eq!(&got.payload[..], b"hello");
        assert!(buf.is_empty());
    }

    /// Test: the decoder waits through arbitrarily short reads.
    #[test]
    fn short_reads_assemble() {
        let wire = encoded(Frame::data(7, &b"split me"[..]));
        let mut buf = BytesMut::new();
        let mut codec = FrameCodec;
        for (i, byte) in wire.iter().enumerate() {
            buf.put_u8(*byte);
            let item = codec.decode(&mut buf).unwrap();
            if i + 1 < wire.len() {
                assert!(item.is_none(), "decoded early at byte {i}");
            } else {
                let frame = item.unwrap();
                assert_eq!(&frame.payload[..], b"split me");
            }
        }
    }

    /// Test: several frames in one buffer decode in order.
    #[test]
    fn back_to_back_frames() {
        let mut buf = encoded(Frame::data(1, &b"a"[..]));
        buf.extend_from_slice(&encoded(Frame::eof(1)));
        buf.extend_from_slice(&encoded(Frame::data(2, &b"bb"[..])));
        let mut codec = FrameCodec;
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!((first.channel, first.is_eof()), (1, false));
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(second.is_eof());
        let third = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&third.payload[..], b"bb");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    /// Test: a header advertising an oversize payload is an error, and the
    /// bound itself is still accepted by the encoder's length check.
    #[test]
    fn oversize_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_BYTES + 1) as u32);
        buf.put_u32(9);
        let err = FrameCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::Oversize(_)));
    }

    /// Test: a zero-length frame is the EOF token, not a decode error.
    #[test]
    fn eof_frame_decodes() {
        let mut buf = encoded(Frame::eof(31));
        let got = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert!(got.is_eof());
        assert_eq!(got.channel, 31);
    }
}
