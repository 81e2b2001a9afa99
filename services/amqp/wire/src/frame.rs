//! Frame layer of the wire protocol.
//!
//! ```text
//! +---------+------------+-----------+------------------+------------+
//! | type u8 | channel u16| size u32  | payload[size]    | 0xCE       |
//! +---------+------------+-----------+------------------+------------+
//! ```
//!
//! [`FrameDecoder`] slices frames out of an accumulation buffer that may hold
//! partial or several frames. [`FrameWriter`] builds one outgoing frame and
//! backpatches its size field when finished.

use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

/// Frame-end marker
pub const FRAME_END: u8 = 0xCE;

/// Type, channel and size fields
pub const FRAME_HEADER_SIZE: usize = 7;

/// Header plus frame-end marker
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + 1;

/// Smallest frame-max a peer may negotiate
pub const FRAME_MIN_SIZE: usize = 4096;

/// Largest declared payload the decoder accepts (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Bytes that open every connection: `AMQP` 0 0 9 1
pub const PROTOCOL_HEADER: &[u8; 8] = b"AMQP\x00\x00\x09\x01";

/// Frame types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Method frame
    Method = 1,
    /// Content header frame
    Header = 2,
    /// Content body frame
    Body = 3,
    /// Heartbeat frame
    Heartbeat = 8,
}

impl TryFrom<u8> for FrameType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameType::Method),
            2 => Ok(FrameType::Header),
            3 => Ok(FrameType::Body),
            8 => Ok(FrameType::Heartbeat),
            _ => Err(WireError::Type(value)),
        }
    }
}

/// One decoded frame; lives only for one dispatch step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub typ: FrameType,
    /// Channel the frame belongs to (0 = connection)
    pub channel: u16,
    /// Payload, exactly `size` bytes
    pub payload: Bytes,
}

impl Frame {
    /// Encoded heartbeat frame: channel 0, empty payload
    pub fn heartbeat() -> Bytes {
        Bytes::from_static(&[FrameType::Heartbeat as u8, 0, 0, 0, 0, 0, 0, FRAME_END])
    }

    /// Encode a body frame carrying `chunk`
    pub fn body(channel: u16, chunk: &[u8], frame_max: usize) -> Result<Bytes, WireError> {
        let mut frame = FrameWriter::new(FrameType::Body, channel);
        frame.buf_mut().put_slice(chunk);
        frame.finish(frame_max)
    }
}

/// Frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a decoder with a custom payload limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the frame is incomplete. A declared size over
    /// the limit returns [`WireError::Size`] without consuming anything: the
    /// stream position can no longer be trusted. A bad end byte or unknown
    /// type is reported only after the whole frame was consumed, so the next
    /// call starts at the following frame.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let size = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]) as usize;
        if size > self.max_frame_size {
            return Err(WireError::Size(size));
        }

        if buf.len() < FRAME_HEADER_SIZE + size + 1 {
            return Ok(None);
        }

        let typ = buf.get_u8();
        let channel = buf.get_u16();
        buf.advance(4);
        let payload = buf.split_to(size).freeze();
        let end = buf.get_u8();

        trace!(
            "Decoded frame type={} channel={} size={}",
            typ,
            channel,
            size
        );

        if end != FRAME_END {
            return Err(WireError::FrameEnd(end));
        }

        Ok(Some(Frame {
            typ: FrameType::try_from(typ)?,
            channel,
            payload,
        }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for one outgoing frame.
///
/// The size field is written as a placeholder and fixed up by
/// [`FrameWriter::finish`], which also appends the frame-end marker.
#[derive(Debug)]
pub struct FrameWriter {
    buf: BytesMut,
}

impl FrameWriter {
    /// Start a frame of `typ` on `channel`
    pub fn new(typ: FrameType, channel: u16) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(typ as u8);
        buf.put_u16(channel);
        buf.put_u32(0);
        Self { buf }
    }

    /// Start a method frame with its class and method ids
    pub fn method(channel: u16, class_id: u16, method_id: u16) -> Self {
        let mut frame = Self::new(FrameType::Method, channel);
        frame.buf.put_u16(class_id);
        frame.buf.put_u16(method_id);
        frame
    }

    /// Payload buffer, for the codec writers
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes written after the frame header so far
    pub fn payload_len(&self) -> usize {
        self.buf.len() - FRAME_HEADER_SIZE
    }

    /// Backpatch the size, append the end marker and freeze.
    ///
    /// `frame_max` bounds the whole encoded frame; 0 means unlimited.
    pub fn finish(mut self, frame_max: usize) -> Result<Bytes, WireError> {
        let size = self.payload_len();
        if frame_max != 0 && size + FRAME_OVERHEAD > frame_max {
            return Err(WireError::Size(size + FRAME_OVERHEAD));
        }
        let size32 = u32::try_from(size).map_err(|_| WireError::Size(size))?;
        self.buf[3..FRAME_HEADER_SIZE].copy_from_slice(&size32.to_be_bytes());
        self.buf.put_u8(FRAME_END);
        Ok(self.buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(1).unwrap(), FrameType::Method);
        assert_eq!(FrameType::try_from(8).unwrap(), FrameType::Heartbeat);
        assert!(FrameType::try_from(4).is_err());
    }

    #[test]
    fn test_writer_backpatches_size() {
        let mut frame = FrameWriter::method(5, 10, 51);
        frame.buf_mut().put_slice(b"xy");
        let bytes = frame.finish(4096).unwrap();

        assert_eq!(&bytes[..3], &[1, 0, 5]);
        assert_eq!(&bytes[3..7], &[0, 0, 0, 6]);
        assert_eq!(bytes.len(), FRAME_OVERHEAD + 6);
        assert_eq!(bytes[bytes.len() - 1], FRAME_END);
    }

    #[test]
    fn test_writer_respects_frame_max() {
        let mut frame = FrameWriter::new(FrameType::Body, 1);
        frame.buf_mut().put_slice(&[0u8; 100]);
        assert_eq!(frame.finish(100), Err(WireError::Size(108)));
    }

    #[test]
    fn test_heartbeat_frame() {
        let hb = Frame::heartbeat();
        let mut buf = BytesMut::from(hb.as_ref());
        let frame = FrameDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.typ, FrameType::Heartbeat);
        assert_eq!(frame.channel, 0);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_decode_batched_and_split() {
        let first = Frame::body(1, b"hello", 0).unwrap();
        let second = Frame::body(2, b"world!", 0).unwrap();
        let mut stream = BytesMut::new();
        stream.put_slice(&first);
        stream.put_slice(&second);

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();

        // deliver one byte at a time
        let mut frames = Vec::new();
        for byte in stream.iter() {
            buf.put_u8(*byte);
            while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].channel, 1);
        assert_eq!(&frames[0].payload[..], b"hello");
        assert_eq!(frames[1].channel, 2);
        assert_eq!(&frames[1].payload[..], b"world!");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bad_frame_end_consumes_frame() {
        let mut corrupt = BytesMut::from(Frame::body(1, b"abc", 0).unwrap().as_ref());
        let last = corrupt.len() - 1;
        corrupt[last] = 0x00;
        corrupt.put_slice(&Frame::heartbeat());

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&mut corrupt), Err(WireError::FrameEnd(0x00)));

        let next = decoder.decode(&mut corrupt).unwrap().unwrap();
        assert_eq!(next.typ, FrameType::Heartbeat);
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(3);
        buf.put_u16(1);
        buf.put_u32(10_000);

        let mut decoder = FrameDecoder::with_max_frame_size(4096);
        assert_eq!(decoder.decode(&mut buf), Err(WireError::Size(10_000)));
        assert_eq!(buf.len(), FRAME_HEADER_SIZE);
    }

    #[test]
    fn test_unknown_type_consumes_frame() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[4, 0, 0, 0, 0, 0, 1, 0xAA, FRAME_END]);
        buf.put_slice(&Frame::heartbeat());

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&mut buf), Err(WireError::Type(4)));
        assert!(decoder.decode(&mut buf).unwrap().is_some());
    }
}
