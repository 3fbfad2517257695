//! Framed Codec
//!
//! Length-prefixed framing for protocol streams: an unsigned varint length
//! followed by the JSON document of one [`Frame`]. The same codec runs on
//! every mesh participant.

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use thiserror::Error;

use crate::frame::Frame;

/// Upper bound on a single frame body. SDP blobs run a few kilobytes; a
/// megabyte leaves generous headroom while bounding a misbehaving peer.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Errors from framing, encoding, or decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Underlying stream error.
    #[error("stream io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed varint length prefix.
    #[error("invalid length prefix: {0}")]
    LengthPrefix(String),

    /// Frame exceeds [`MAX_FRAME_LEN`].
    #[error("frame of {0} bytes exceeds limit of {MAX_FRAME_LEN}")]
    FrameTooLarge(usize),

    /// Body is not valid JSON or does not match its declared kind.
    #[error("malformed frame body: {0}")]
    Json(#[from] serde_json::Error),

    /// The header names a payload kind this build does not know.
    #[error("unknown payload kind {0:?}")]
    UnknownPayloadKind(String),
}

/// Read one frame. Returns `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<R>(io: &mut R) -> Result<Option<Frame>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let len = match unsigned_varint::aio::read_usize(&mut *io).await {
        Ok(len) => len,
        Err(unsigned_varint::io::ReadError::Io(e))
            if e.kind() == std::io::ErrorKind::UnexpectedEof =>
        {
            return Ok(None);
        }
        Err(unsigned_varint::io::ReadError::Io(e)) => return Err(CodecError::Io(e)),
        Err(e) => return Err(CodecError::LengthPrefix(e.to_string())),
    };

    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    io.read_exact(&mut body).await?;
    Ok(Some(Frame::from_wire_json(&body)?))
}

/// Write one frame and flush.
pub async fn write_frame<W>(io: &mut W, frame: &Frame) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let body = frame.to_wire_json()?;
    if body.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(body.len()));
    }

    let mut prefix = unsigned_varint::encode::usize_buffer();
    let prefix = unsigned_varint::encode::usize(body.len(), &mut prefix);
    io.write_all(prefix).await?;
    io.write_all(&body).await?;
    io.flush().await?;
    Ok(())
}

/// A protocol stream with the framed codec attached.
pub struct Framed<S> {
    io: S,
}

impl<S> Framed<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S) -> Self {
        Self { io }
    }

    /// Read the next frame; `Ok(None)` means the peer closed the stream.
    pub async fn read(&mut self) -> Result<Option<Frame>, CodecError> {
        read_frame(&mut self.io).await
    }

    /// Write one frame.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), CodecError> {
        write_frame(&mut self.io, frame).await
    }

    /// Consume the wrapper, returning the inner stream.
    pub fn into_inner(self) -> S {
        self.io
    }
}

#[cfg(test)]
mod tests {
    use futures::io::Cursor;

    use super::*;
    use crate::frame::{FramePayload, SessionDescription};

    #[tokio::test]
    async fn frames_round_trip_through_a_pipe() {
        let frames = vec![
            Frame::new(FramePayload::PushStreamRoom {
                name: "alpha".into(),
            }),
            Frame::new(FramePayload::Offer(SessionDescription {
                sdp: "v=0\r\n".repeat(128),
            })),
            Frame::new(FramePayload::RequestStreamOffline {
                name: "bravo".into(),
            }),
        ];

        let mut buf = Vec::new();
        for f in &frames {
            write_frame(&mut buf, f).await.unwrap();
        }

        let mut cursor = Cursor::new(buf);
        for f in &frames {
            let got = read_frame(&mut cursor).await.unwrap().unwrap();
            assert_eq!(&got, f);
        }
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let mut buf = unsigned_varint::encode::usize_buffer();
        let prefix = unsigned_varint::encode::usize(MAX_FRAME_LEN + 1, &mut buf);
        let mut cursor = Cursor::new(prefix.to_vec());
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(CodecError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn truncated_body_is_an_io_error() {
        let frame = Frame::new(FramePayload::PushStreamOk {
            name: "alpha".into(),
        });
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        buf.truncate(buf.len() - 4);

        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(CodecError::Io(_))
        ));
    }
}
