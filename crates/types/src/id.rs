//! Object identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, string-serializable identifier of a stored object.
///
/// The store never interprets the contents; ids only need to be unique
/// within their class and stable under string round-tripping, since they
/// become path segments in the coordination service.
///
/// # Display
///
/// Renders the raw string: `ObjId::from("bridge-1")` displays as `bridge-1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjId(String);

impl ObjId {
    /// Creates an identifier from any string-like value.
    #[inline]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generates a fresh random identifier (UUIDv4).
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ObjId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<Uuid> for ObjId {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for ObjId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
