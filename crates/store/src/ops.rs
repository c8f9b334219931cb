//! Ordered operations for the facade's batched `multi` entry point.

use zoom_types::ObjId;

use crate::object::{DynObject, Storable};

/// One operation in an ordered batch applied through a single transaction.
pub struct PersistenceOp {
    pub(crate) inner: OpInner,
}

pub(crate) enum OpInner {
    Create { class: &'static str, obj: DynObject },
    Update { class: &'static str, obj: DynObject },
    Delete { class: &'static str, id: ObjId, ignore_missing: bool },
    CreateNode { path: String, value: Vec<u8> },
    UpdateNode { path: String, value: Vec<u8> },
    DeleteNode { path: String },
}

impl PersistenceOp {
    /// Creates an object.
    pub fn create<T: Storable>(obj: T) -> Self {
        Self { inner: OpInner::Create { class: T::class_name(), obj: Box::new(obj) } }
    }

    /// Updates an object.
    pub fn update<T: Storable>(obj: T) -> Self {
        Self { inner: OpInner::Update { class: T::class_name(), obj: Box::new(obj) } }
    }

    /// Deletes an object; fails if it does not exist.
    pub fn delete<T: Storable>(id: ObjId) -> Self {
        Self { inner: OpInner::Delete { class: T::class_name(), id, ignore_missing: false } }
    }

    /// Deletes an object if it exists; a missing object is not an error.
    pub fn delete_ignore_missing<T: Storable>(id: ObjId) -> Self {
        Self { inner: OpInner::Delete { class: T::class_name(), id, ignore_missing: true } }
    }

    /// Writes a raw node at an arbitrary path, atomically with the rest of
    /// the batch.
    pub fn create_node(path: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self { inner: OpInner::CreateNode { path: path.into(), value: value.into() } }
    }

    /// Replaces a raw node's value.
    pub fn update_node(path: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self { inner: OpInner::UpdateNode { path: path.into(), value: value.into() } }
    }

    /// Deletes a raw node and its descendants.
    pub fn delete_node(path: impl Into<String>) -> Self {
        Self { inner: OpInner::DeleteNode { path: path.into() } }
    }
}
