//! Centralized serialization and deserialization functions.
//!
//! Object payloads and provenance records are encoded with postcard, which
//! produces a canonical byte sequence for a fixed struct definition. The
//! provenance skip optimization (no sibling write when the record is
//! unchanged) relies on that determinism.

use serde::{Serialize, de::DeserializeOwned};
use snafu::Snafu;

/// Error type for codec operations.
#[derive(Debug, Snafu)]
pub enum CodecError {
    /// Encoding failed.
    #[snafu(display("Encoding failed: {source}"))]
    Encode {
        /// The underlying postcard error.
        source: postcard::Error,
    },

    /// Decoding failed.
    #[snafu(display("Decoding failed: {source}"))]
    Decode {
        /// The underlying postcard error.
        source: postcard::Error,
    },
}

/// Encodes a value to bytes using postcard serialization.
///
/// # Errors
///
/// Returns `CodecError::Encode` if serialization fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|source| CodecError::Encode { source })
}

/// Decodes bytes to a value using postcard deserialization.
///
/// # Errors
///
/// Returns `CodecError::Decode` if deserialization fails.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|source| CodecError::Decode { source })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: String,
        peers: Vec<String>,
        weight: Option<u32>,
    }

    #[test]
    fn test_roundtrip_struct() {
        let original = Sample {
            id: "bridge-1".to_owned(),
            peers: vec!["p1".to_owned(), "p2".to_owned()],
            weight: Some(7),
        };
        let bytes = encode(&original).expect("encode");
        let decoded: Sample = decode(&bytes).expect("decode");
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let value = Sample { id: "r1".to_owned(), peers: vec!["a".to_owned()], weight: None };
        assert_eq!(encode(&value).unwrap(), encode(&value.clone()).unwrap());
    }

    #[test]
    fn test_decode_malformed_input() {
        let malformed = [0xFF, 0xFF, 0xFF, 0xFF];
        let result: Result<Sample, _> = decode(&malformed);
        let err = result.expect_err("should fail");
        assert!(matches!(err, CodecError::Decode { .. }));
    }

    #[test]
    fn test_decode_empty_input() {
        let result: Result<u64, _> = decode(&[]);
        assert!(result.is_err());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod proptest_tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// Property: encoding is canonical for equal values. The provenance
        /// skip optimization depends on this.
        #[test]
        fn prop_encode_deterministic(id in ".*", peers in proptest::collection::vec(".*", 0..8)) {
            let value = (id, peers);
            prop_assert_eq!(encode(&value).unwrap(), encode(&value.clone()).unwrap());
        }
    }
}
