//! Wire encodings for message payloads.

use crate::error::CodecError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

/// Content type attached to JSON payloads.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Content type attached to binary payloads.
pub const BINARY_CONTENT_TYPE: &str = "application/x-bincode";

/// Payload encoding used by a publisher and every consumer of its routing key.
///
/// - **Json**: self-describing text, tolerant of added fields.
/// - **Binary**: compact `bincode` form; both ends must agree on the exact type.
///
/// The choice is not negotiated. A consumer decoding with the wrong encoding
/// gets a [`CodecError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    #[default]
    Json,
    Binary,
}

impl Encoding {
    /// Serialize a value.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Encoding::Json => Ok(serde_json::to_vec(value)?),
            Encoding::Binary => Ok(bincode::serialize(value)?),
        }
    }

    /// Deserialize a payload into a fresh value.
    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError> {
        match self {
            Encoding::Json => Ok(serde_json::from_slice(payload)?),
            Encoding::Binary => Ok(bincode::deserialize(payload)?),
        }
    }

    /// Content type sent with every message in this encoding.
    pub fn content_type(&self) -> &'static str {
        match self {
            Encoding::Json => JSON_CONTENT_TYPE,
            Encoding::Binary => BINARY_CONTENT_TYPE,
        }
    }

    /// Look up the encoding for a content type tag.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type {
            JSON_CONTENT_TYPE => Some(Encoding::Json),
            BINARY_CONTENT_TYPE => Some(Encoding::Binary),
            _ => None,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Json => write!(f, "json"),
            Encoding::Binary => write!(f, "binary"),
        }
    }
}
