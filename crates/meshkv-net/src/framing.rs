//! Message framing for network transport
//!
//! Length-prefixed frames carried on the session stream of each connection.

use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (2 MiB: one full gossip payload plus envelope overhead)
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Unexpected frame type: {0:?}")]
    UnexpectedType(FrameType),
}

impl From<postcard::Error> for FrameError {
    fn from(e: postcard::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// A framed message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Payload bytes
    pub payload: Vec<u8>,
}

/// Frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Handshake opener: identity key and challenge
    Hello = 0,
    /// Handshake reply: identity key, challenge, and proof
    HelloAck = 1,
    /// Handshake completion: initiator proof
    Proof = 2,
    /// Orderly close
    Goodbye = 3,
    /// Gossip envelope
    Gossip = 10,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Hello),
            1 => Ok(Self::HelloAck),
            2 => Ok(Self::Proof),
            3 => Ok(Self::Goodbye),
            10 => Ok(Self::Gossip),
            _ => Err(FrameError::Serialization(format!("Unknown frame type: {}", value))),
        }
    }
}

/// Codec for length-prefixed frames
///
/// Wire format:
/// - 4 bytes: length (big-endian, includes type byte)
/// - 1 byte: frame type
/// - N bytes: payload
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 5 bytes (4 length + 1 type)
        if src.len() < 5 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        if length == 0 {
            return Err(FrameError::Serialization("zero-length frame".into()));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame_type = FrameType::try_from(src[0])?;
        src.advance(1);

        let payload = src.split_to(length - 1).to_vec();

        Ok(Some(Frame { frame_type, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + item.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(item.frame_type as u8);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self { frame_type, payload }
    }

    /// Build a frame from a postcard-encoded message
    pub fn encode<T: Serialize>(frame_type: FrameType, message: &T) -> Result<Self, FrameError> {
        Ok(Self::new(frame_type, postcard::to_allocvec(message)?))
    }

    /// Decode the payload, checking the frame type first
    pub fn decode<T: DeserializeOwned>(&self, expected: FrameType) -> Result<T, FrameError> {
        if self.frame_type != expected {
            return Err(FrameError::UnexpectedType(self.frame_type));
        }
        Ok(postcard::from_bytes(&self.payload)?)
    }

    /// Create a goodbye frame
    pub fn goodbye() -> Self {
        Self::new(FrameType::Goodbye, vec![])
    }

    /// Encode to wire bytes
    pub fn to_bytes(&self) -> Result<BytesMut, FrameError> {
        let mut buf = BytesMut::with_capacity(5 + self.payload.len());
        FrameCodec.encode(self.clone(), &mut buf)?;
        Ok(buf)
    }
}

/// Read the next frame from a byte stream.
///
/// `buf` carries leftover bytes between calls. Returns `Ok(None)` on a clean
/// end of stream.
pub async fn read_frame<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut codec = FrameCodec;
    loop {
        if let Some(frame) = codec.decode(buf)? {
            return Ok(Some(frame));
        }
        if buf.capacity() - buf.len() < 4096 {
            buf.reserve(16 * 1024);
        }
        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(FrameError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
    }
}

/// Write one frame to a byte stream
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.to_bytes()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_helpers() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let frame = Frame::new(FrameType::Gossip, vec![7; 300]);
        let sent = frame.clone();
        let writer = tokio::spawn(async move {
            write_frame(&mut a, &sent).await.unwrap();
            write_frame(&mut a, &Frame::goodbye()).await.unwrap();
        });

        let mut buf = BytesMut::new();
        assert_eq!(read_frame(&mut b, &mut buf).await.unwrap(), Some(frame));
        assert_eq!(
            read_frame(&mut b, &mut buf).await.unwrap().map(|f| f.frame_type),
            Some(FrameType::Goodbye)
        );
        writer.await.unwrap();
        assert_eq!(read_frame(&mut b, &mut buf).await.unwrap(), None);
    }

    #[test]
    fn test_partial_frames_wait_for_more_bytes() {
        let mut codec = FrameCodec::new();
        let frame = Frame::new(FrameType::Gossip, vec![1, 2, 3, 4, 5]);
        let bytes = frame.to_bytes().unwrap();

        let mut buf = BytesMut::from(&bytes[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&bytes[3..7]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&bytes[7..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::new(FrameType::Hello, vec![9]), &mut buf).unwrap();
        codec.encode(Frame::goodbye(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().frame_type, FrameType::Hello);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().frame_type, FrameType::Goodbye);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frames_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_u8(FrameType::Gossip as u8);
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::TooLarge(_))));

        let big = Frame::new(FrameType::Gossip, vec![0; MAX_FRAME_SIZE]);
        assert!(matches!(
            codec.encode(big, &mut BytesMut::new()),
            Err(FrameError::TooLarge(_))
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(200);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_typed_decode_checks_frame_type() {
        let frame = Frame::encode(FrameType::Gossip, &(1u32, "x".to_string())).unwrap();
        let value: (u32, String) = frame.decode(FrameType::Gossip).unwrap();
        assert_eq!(value, (1, "x".to_string()));
        assert!(frame.decode::<(u32, String)>(FrameType::Hello).is_err());
    }
}
