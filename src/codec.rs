//! Payload serialization.
//!
//! The core never looks inside a payload body: it hands bytes to a [`Codec`] and back. The
//! reference codec is [`JsonCodec`].

use serde::Serialize;
use serde::de::DeserializeOwned;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure to turn a value into bytes or bytes into a value.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode payload")]
    Encode(#[source] BoxError),

    #[error("failed to decode payload")]
    Decode(#[source] BoxError),
}

/// Converts typed values to and from their byte representation.
pub trait Codec: Send + Sync + 'static {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        values: Vec<u32>,
        flag: Option<bool>,
    }

    #[test]
    fn test_json_structured_value() {
        let codec = JsonCodec;
        let sample = Sample {
            name: "cpu".to_string(),
            values: vec![1, 2, 3],
            flag: None,
        };

        let bytes = codec.encode(&sample).unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"name":"cpu","values":[1,2,3],"flag":null}"#
        );
        let decoded: Sample = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, sample);
    }

    #[test]
    fn test_decode_wrong_shape_fails() {
        let codec = JsonCodec;
        let result = codec.decode::<Sample>(br#"{"name": 3}"#);
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }
}
