//! Serialization boundary.
//!
//! The core never mandates a wire format. Event payloads, metadata maps, and
//! aggregate snapshots all pass through a [`Codec`], and any serde-compatible
//! self-describing format (JSON, CBOR, MessagePack) can implement it.
//! [`JsonCodec`] is the reference implementation and the default used by the
//! repository.

use serde::{Serialize, de::DeserializeOwned};

/// Encodes and decodes values at the persistence boundary.
///
/// Codecs must be *self-describing*: payloads recorded by
/// [`track_change`](crate::aggregate::Aggregate::track_change) are erased to a
/// [`serde_json::Value`] before the codec sees them, and decoded directly into
/// the registered concrete type on the way back. Formats that rely on schema
/// knowledge at decode time (e.g. bincode) cannot round-trip through that
/// intermediate.
pub trait Codec: Send + Sync {
    /// Codec-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Encode a value to bytes.
    ///
    /// # Errors
    ///
    /// Returns a codec-specific error when the value cannot be encoded.
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, Self::Error>;

    /// Decode a value from bytes.
    ///
    /// # Errors
    ///
    /// Returns a codec-specific error when the bytes do not decode into `T`.
    fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, Self::Error>;
}

/// JSON codec backed by `serde_json`.
///
/// This is the conforming reference codec: it round-trips every registered
/// payload type.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    type Error = serde_json::Error;

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, Self::Error> {
        serde_json::to_vec(value)
    }

    fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, Self::Error> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    struct Observation {
        millis: u64,
    }

    #[test]
    fn json_codec_roundtrips() {
        let codec = JsonCodec;
        let value = Observation { millis: 1500 };
        let bytes = codec.serialize(&value).unwrap();
        let decoded: Observation = codec.deserialize(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn json_codec_rejects_invalid_input() {
        let codec = JsonCodec;
        let result: Result<Observation, _> = codec.deserialize(b"not valid json");
        assert!(result.is_err());
    }

    #[test]
    fn json_codec_rejects_wrong_shape() {
        let codec = JsonCodec;
        let result: Result<Observation, _> = codec.deserialize(br#"{"other":1}"#);
        assert!(result.is_err());
    }
}
