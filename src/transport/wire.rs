//! Wire format: length-prefixed JSON frames.
//!
//! ```text
//! [length: 4 bytes (u32, little-endian)]
//! [frame: length bytes (JSON)]
//! ```
//!
//! The peer-side dispatch verdict travels as [`ReplyError`], a serializable
//! enum, so clients can distinguish a routing miss (refresh the cache and
//! retry) from terminal failures without parsing message strings.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::GridError;

/// Frames above this size are rejected on both ends.
pub(crate) const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// A reply payload: the responder's type tag plus encoded body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct WirePayload {
    pub type_tag: String,
    pub body: Vec<u8>,
}

/// Peer-side dispatch failure, carried verbatim to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub(crate) enum ReplyError {
    /// No mailbox or handler matches the receiver name on this peer.
    #[error("receiver not found")]
    NotFound,

    /// The receiving mailbox is at capacity.
    #[error("mailbox full")]
    MailboxFull,

    /// The payload tag is not registered with the receiver's codec.
    #[error("unknown message type: {tag:?}")]
    UnknownType {
        /// The unrecognized tag.
        tag: String,
    },

    /// An actor with the requested name already exists.
    #[error("already registered: {name:?}")]
    AlreadyRegistered {
        /// The contested name.
        name: String,
    },

    /// The requested name is malformed or reserved.
    #[error("invalid name: {name:?}")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// The delivery was dropped without a response.
    #[error("dropped without response")]
    Dropped,

    /// Any other peer-side failure, as text.
    #[error("{0}")]
    Internal(String),
}

/// One frame on the wire.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum Frame {
    /// A call: deliver `body` to `receiver`, reply with the same `seq`.
    Request {
        seq: u64,
        receiver: String,
        type_tag: String,
        body: Vec<u8>,
    },
    /// The reply paired to the request with the same `seq`.
    Response {
        seq: u64,
        result: Result<WirePayload, ReplyError>,
    },
}

/// Encode a frame with its length prefix.
pub(crate) fn encode_frame(frame: &Frame) -> Result<Vec<u8>, GridError> {
    let payload = serde_json::to_vec(frame)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(GridError::MessageTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Read one frame. Errors on EOF, oversize, or malformed JSON.
pub(crate) async fn read_frame<R>(reader: &mut R) -> std::io::Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Write one frame.
pub(crate) async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), GridError>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode_frame(frame)?;
    writer.write_all(&buf).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let frame = Frame::Request {
            seq: 42,
            receiver: "worker-1".into(),
            type_tag: "example.Event".into(),
            body: vec![1, 2, 3],
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();

        let mut cursor: &[u8] = &buf;
        match read_frame(&mut cursor).await.unwrap() {
            Frame::Request {
                seq,
                receiver,
                type_tag,
                body,
            } => {
                assert_eq!(seq, 42);
                assert_eq!(receiver, "worker-1");
                assert_eq!(type_tag, "example.Event");
                assert_eq!(body, vec![1, 2, 3]);
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_response_error_roundtrip() {
        let frame = Frame::Response {
            seq: 7,
            result: Err(ReplyError::UnknownType {
                tag: "nope".into(),
            }),
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();

        let mut cursor: &[u8] = &buf;
        match read_frame(&mut cursor).await.unwrap() {
            Frame::Response { seq, result } => {
                assert_eq!(seq, 7);
                assert_eq!(result, Err(ReplyError::UnknownType { tag: "nope".into() }));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let frame = Frame::Request {
            seq: 0,
            receiver: "r".into(),
            type_tag: "t".into(),
            body: vec![0u8; MAX_FRAME_SIZE],
        };
        let result = encode_frame(&frame);
        assert!(matches!(result, Err(GridError::MessageTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_truncated_frame_errors() {
        let frame = Frame::Response {
            seq: 1,
            result: Err(ReplyError::NotFound),
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        buf.truncate(buf.len() - 1);

        let mut cursor: &[u8] = &buf;
        assert!(read_frame(&mut cursor).await.is_err());
    }
}
