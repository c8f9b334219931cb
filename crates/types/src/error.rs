//! Error taxonomy surfaced by the zoom object store.
//!
//! All public operations return [`ZoomError`]. Lower layers (the backend
//! adapter, the codec) carry their own error enums and are mapped into this
//! taxonomy at the store boundary; only `ConcurrentModification` is ever
//! retried automatically.

use snafu::{Location, Snafu};

use crate::codec::CodecError;
use crate::id::ObjId;

/// Unified result type for store operations.
pub type Result<T, E = ZoomError> = std::result::Result<T, E>;

/// Top-level error type for store operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ZoomError {
    /// Read of a non-existent object.
    #[snafu(display("Object not found: {class}/{id}"))]
    NotFound {
        /// Simple name of the object's class.
        class: String,
        /// Object identifier.
        id: ObjId,
    },

    /// Create conflict: an object with this id already exists.
    #[snafu(display("Object already exists: {class}/{id}"))]
    ObjectExists {
        /// Simple name of the object's class.
        class: String,
        /// Object identifier.
        id: ObjId,
    },

    /// Delete blocked by a binding declared with the `Error` action.
    #[snafu(display("Object {class}/{id} is still referenced and cannot be deleted"))]
    ObjectReferenced {
        /// Simple name of the object's class.
        class: String,
        /// Object identifier.
        id: ObjId,
    },

    /// Attempted reference stealing or an inconsistent reference delta.
    #[snafu(display(
        "Reference conflict: field {field} of {class}/{id} already references {existing}"
    ))]
    ReferenceConflict {
        /// Class of the peer whose field would be overwritten.
        class: String,
        /// Identifier of the peer.
        id: ObjId,
        /// The single-reference field that is already occupied.
        field: String,
        /// The id the field currently holds.
        existing: ObjId,
    },

    /// Snapshot invalidation or CAS failure at commit.
    #[snafu(display("Concurrent modification detected"))]
    ConcurrentModification,

    /// Raw node create conflict.
    #[snafu(display("Storage node already exists: {path}"))]
    StorageNodeExists {
        /// Backend path of the conflicting node.
        path: String,
    },

    /// Raw node update/delete on a missing node.
    #[snafu(display("Storage node not found: {path}"))]
    StorageNodeNotFound {
        /// Backend path of the missing node.
        path: String,
    },

    /// Operation attempted after the store was stopped.
    #[snafu(display("Store is unavailable: {reason}"))]
    ServiceUnavailable {
        /// Why the store refused the operation.
        reason: String,
    },

    /// Lock acquisition timeout or unclassified transient backend fault.
    #[snafu(display("Storage failure at {location}: {message}"))]
    StorageFailure {
        /// Error description.
        message: String,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// Wraps every unexpected failure.
    #[snafu(display("Internal object mapper error at {location}: {message}"))]
    InternalObjectMapper {
        /// Error description.
        message: String,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },
}

impl ZoomError {
    /// Short stable label for the error class, used as a metrics dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::ObjectExists { .. } => "object_exists",
            Self::ObjectReferenced { .. } => "object_referenced",
            Self::ReferenceConflict { .. } => "reference_conflict",
            Self::ConcurrentModification => "concurrent_modification",
            Self::StorageNodeExists { .. } => "storage_node_exists",
            Self::StorageNodeNotFound { .. } => "storage_node_not_found",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::StorageFailure { .. } => "storage_failure",
            Self::InternalObjectMapper { .. } => "internal",
        }
    }

    /// Whether this error, or anything in its cause chain, signals a
    /// concurrent modification.
    ///
    /// The retry wrapper uses this to decide whether a failed transaction
    /// body is worth re-running.
    pub fn is_concurrent_modification(&self) -> bool {
        if matches!(self, Self::ConcurrentModification) {
            return true;
        }
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            if err
                .downcast_ref::<ZoomError>()
                .is_some_and(|z| matches!(z, Self::ConcurrentModification))
            {
                return true;
            }
            source = err.source();
        }
        false
    }
}

impl From<CodecError> for ZoomError {
    #[track_caller]
    fn from(err: CodecError) -> Self {
        let loc = std::panic::Location::caller();
        ZoomError::InternalObjectMapper {
            message: err.to_string(),
            location: snafu::Location::new(loc.file(), loc.line(), loc.column()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ZoomError::NotFound { class: "Bridge".to_owned(), id: ObjId::from("b1") };
        assert_eq!(err.to_string(), "Object not found: Bridge/b1");
    }

    #[test]
    fn test_kind_labels_are_stable() {
        let err = ZoomError::ConcurrentModification;
        assert_eq!(err.kind(), "concurrent_modification");
        let err = ZoomError::ServiceUnavailable { reason: "stopped".to_owned() };
        assert_eq!(err.kind(), "service_unavailable");
    }

    #[test]
    fn test_concurrent_modification_detection() {
        assert!(ZoomError::ConcurrentModification.is_concurrent_modification());
        let other = ZoomError::NotFound { class: "Port".to_owned(), id: ObjId::from("p1") };
        assert!(!other.is_concurrent_modification());
    }

    #[test]
    fn test_codec_error_conversion() {
        let malformed: &[u8] = &[0xFF, 0xFF];
        let err = crate::decode::<u64>(malformed).expect_err("should fail");
        let zoom_err: ZoomError = err.into();
        assert!(matches!(zoom_err, ZoomError::InternalObjectMapper { .. }));
    }
}
