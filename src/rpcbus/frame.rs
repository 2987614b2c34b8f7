//! Wire framing: `correlation id (16 raw bytes) || codec-encoded body`.
//!
//! The correlation id prefix lets a single shared work queue carry requests from many callers
//! while each handler recovers where to reply. Only the body ever reaches the codec.

use bytes::{BufMut, Bytes, BytesMut};

use crate::correlation::{CORRELATION_ID_LEN, CorrelationId};

#[derive(Debug, thiserror::Error)]
#[error("frame of {len} bytes is shorter than the {} byte correlation id", CORRELATION_ID_LEN)]
pub struct FrameError {
    pub len: usize,
}

/// A payload tagged with the correlation id of the request it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub correlation_id: CorrelationId,
    pub body: Bytes,
}

impl Frame {
    pub fn new(correlation_id: CorrelationId, body: impl Into<Bytes>) -> Self {
        Self {
            correlation_id,
            body: body.into(),
        }
    }

    /// Split a raw payload into its correlation id and body without copying the body.
    pub fn parse(raw: Bytes) -> Result<Self, FrameError> {
        if raw.len() < CORRELATION_ID_LEN {
            return Err(FrameError { len: raw.len() });
        }

        let mut id = [0u8; CORRELATION_ID_LEN];
        id.copy_from_slice(&raw[..CORRELATION_ID_LEN]);

        Ok(Self {
            correlation_id: CorrelationId::from_bytes(id),
            body: raw.slice(CORRELATION_ID_LEN..),
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CORRELATION_ID_LEN + self.body.len());
        buf.put_slice(self.correlation_id.as_bytes());
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, JsonCodec};

    #[test]
    fn test_layout_is_id_then_body() {
        let id = CorrelationId::generate();
        let raw = Frame::new(id, Bytes::from_static(b"{}")).to_bytes();

        assert_eq!(raw.len(), 18);
        assert_eq!(&raw[..16], id.as_bytes());
        assert_eq!(&raw[16..], b"{}");
    }

    #[test]
    fn test_body_survives_framing() {
        let codec = JsonCodec;
        let bodies = [
            serde_json::json!("ping"),
            serde_json::json!({"email": "a@b.c", "n": [1, 2, null]}),
            serde_json::json!(null),
        ];

        for body in bodies {
            let id = CorrelationId::generate();
            let raw = Frame::new(id, codec.encode(&body).unwrap()).to_bytes();

            let frame = Frame::parse(raw).unwrap();
            assert_eq!(frame.correlation_id, id);
            let decoded: serde_json::Value = codec.decode(&frame.body).unwrap();
            assert_eq!(decoded, body);
        }
    }

    #[test]
    fn test_empty_body_is_valid() {
        let id = CorrelationId::generate();
        let frame = Frame::parse(Frame::new(id, Bytes::new()).to_bytes()).unwrap();
        assert!(frame.body.is_empty());
    }

    #[test]
    fn test_short_frame_rejected() {
        let result = Frame::parse(Bytes::from_static(&[1, 2, 3]));
        assert!(matches!(result, Err(FrameError { len: 3 })));
    }
}
