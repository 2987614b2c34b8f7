use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::codec::Codec;
use crate::correlation::CorrelationId;
use crate::rpcbus::error::RpcError;
use crate::rpcbus::reply::Reply;
use crate::topic::Topic;

/// The raw reply to a [`Request`](super::Request).
///
/// The body is kept as received; [`decode`](Response::decode) can be called any number of times.
pub struct Response<K> {
    correlation_id: CorrelationId,
    topic: Topic,
    data: Bytes,
    codec: Arc<K>,
}

impl<K: Codec> Response<K> {
    pub(crate) fn new(
        correlation_id: CorrelationId,
        topic: Topic,
        data: Bytes,
        codec: Arc<K>,
    ) -> Self {
        Self {
            correlation_id,
            topic,
            data,
            codec,
        }
    }

    /// Decode the handler's result. An error returned by the handler becomes
    /// [`RpcError::Remote`].
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        match self.codec.decode::<Reply<T>>(&self.data)? {
            Reply::Ok(value) => Ok(value),
            Reply::Err(message) => Err(RpcError::Remote(message)),
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Topic the request was sent to.
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }
}

impl<K> fmt::Debug for Response<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("correlation_id", &self.correlation_id)
            .field("topic", &self.topic)
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;

    fn response(body: &'static str) -> Response<JsonCodec> {
        Response::new(
            CorrelationId::generate(),
            Topic::from("echo"),
            Bytes::from_static(body.as_bytes()),
            Arc::new(JsonCodec),
        )
    }

    #[test]
    fn test_decode_is_repeatable() {
        let response = response(r#"{"ok":"ping"}"#);

        let first: String = response.decode().unwrap();
        let second: String = response.decode().unwrap();
        assert_eq!(first, "ping");
        assert_eq!(second, "ping");
    }

    #[test]
    fn test_handler_error_becomes_remote() {
        let response = response(r#"{"err":"user not found"}"#);

        let result = response.decode::<String>();
        assert!(matches!(result, Err(RpcError::Remote(msg)) if msg == "user not found"));
    }

    #[test]
    fn test_wrong_type_is_codec_error() {
        let response = response(r#"{"ok":"ping"}"#);
        assert!(matches!(response.decode::<u32>(), Err(RpcError::Codec(_))));
    }
}
