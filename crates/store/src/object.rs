//! Object capability trait and type-erased class descriptors.
//!
//! Instead of runtime reflection, every registered class implements
//! [`Storable`], a small capability interface: identify the object, and read
//! or write the reference fields named in bindings. The registry erases
//! those capabilities behind [`ClassOps`] so the transaction planner can
//! traverse the object graph across classes.

use std::any::Any;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use zoom_types::error::InternalObjectMapperSnafu;
use zoom_types::{ObjId, ZoomError, decode, encode};

/// Shape of a declared reference field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Holds at most one peer id.
    Single,
    /// Holds an ordered list of peer ids with set semantics.
    List,
}

/// Value of a reference field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefValue {
    /// A single optional peer id.
    Single(Option<ObjId>),
    /// A list of peer ids. Insertion order is preserved but carries no
    /// meaning; duplicates are never stored.
    List(Vec<ObjId>),
}

impl RefValue {
    /// An empty value of the given shape.
    pub fn empty(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Single => Self::Single(None),
            FieldKind::List => Self::List(Vec::new()),
        }
    }

    /// The ids held by this value.
    pub fn ids(&self) -> Vec<ObjId> {
        match self {
            Self::Single(None) => Vec::new(),
            Self::Single(Some(id)) => vec![id.clone()],
            Self::List(ids) => ids.clone(),
        }
    }

    /// Whether the value holds no ids.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Single(id) => id.is_none(),
            Self::List(ids) => ids.is_empty(),
        }
    }

    /// Whether the value holds the given id.
    pub fn contains(&self, id: &ObjId) -> bool {
        match self {
            Self::Single(held) => held.as_ref() == Some(id),
            Self::List(ids) => ids.contains(id),
        }
    }
}

/// Capability interface implemented by every class persisted in the store.
///
/// The store only ever touches the fields named in declared bindings;
/// everything else is opaque payload carried through serde.
pub trait Storable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Simple class name, unique within a store. Becomes a path segment.
    fn class_name() -> &'static str;

    /// The reference fields this class exposes to bindings, with their
    /// shapes. Binding declarations are validated against this list.
    fn ref_fields() -> &'static [(&'static str, FieldKind)];

    /// The object's identifier.
    fn object_id(&self) -> ObjId;

    /// Reads a declared reference field. Returns `None` for field names not
    /// listed in [`ref_fields`](Storable::ref_fields).
    fn ref_field(&self, field: &str) -> Option<RefValue>;

    /// Writes a declared reference field. Only called with names listed in
    /// [`ref_fields`](Storable::ref_fields) and values of the declared
    /// shape.
    fn set_ref_field(&mut self, field: &str, value: RefValue);
}

/// Type-erased object owned by a transaction's view.
pub(crate) type DynObject = Box<dyn Any + Send + Sync>;

/// Object-safe view of a [`Storable`] implementation.
pub(crate) trait ClassOps: Send + Sync {
    fn class_name(&self) -> &'static str;
    fn decode_obj(&self, bytes: &[u8]) -> Result<DynObject, ZoomError>;
    fn encode_obj(&self, obj: &DynObject) -> Result<Vec<u8>, ZoomError>;
    fn id_of(&self, obj: &DynObject) -> Result<ObjId, ZoomError>;
    fn ref_field(&self, obj: &DynObject, field: &str) -> Result<Option<RefValue>, ZoomError>;
    fn set_ref_field(
        &self,
        obj: &mut DynObject,
        field: &str,
        value: RefValue,
    ) -> Result<(), ZoomError>;
    fn field_kind(&self, field: &str) -> Option<FieldKind>;
}

/// [`ClassOps`] adapter for a concrete [`Storable`] type.
pub(crate) struct TypedOps<T: Storable>(PhantomData<fn() -> T>);

impl<T: Storable> TypedOps<T> {
    pub(crate) fn new() -> Self {
        Self(PhantomData)
    }
}

fn downcast<T: Storable>(obj: &DynObject) -> Result<&T, ZoomError> {
    obj.downcast_ref::<T>().ok_or_else(|| {
        InternalObjectMapperSnafu {
            message: format!("object is not an instance of class {}", T::class_name()),
        }
        .build()
    })
}

impl<T: Storable> ClassOps for TypedOps<T> {
    fn class_name(&self) -> &'static str {
        T::class_name()
    }

    fn decode_obj(&self, bytes: &[u8]) -> Result<DynObject, ZoomError> {
        let obj: T = decode(bytes)?;
        Ok(Box::new(obj))
    }

    fn encode_obj(&self, obj: &DynObject) -> Result<Vec<u8>, ZoomError> {
        Ok(encode(downcast::<T>(obj)?)?)
    }

    fn id_of(&self, obj: &DynObject) -> Result<ObjId, ZoomError> {
        Ok(downcast::<T>(obj)?.object_id())
    }

    fn ref_field(&self, obj: &DynObject, field: &str) -> Result<Option<RefValue>, ZoomError> {
        Ok(downcast::<T>(obj)?.ref_field(field))
    }

    fn set_ref_field(
        &self,
        obj: &mut DynObject,
        field: &str,
        value: RefValue,
    ) -> Result<(), ZoomError> {
        let typed = obj.downcast_mut::<T>().ok_or_else(|| {
            InternalObjectMapperSnafu {
                message: format!("object is not an instance of class {}", T::class_name()),
            }
            .build()
        })?;
        typed.set_ref_field(field, value);
        Ok(())
    }

    fn field_kind(&self, field: &str) -> Option<FieldKind> {
        T::ref_fields().iter().find(|(name, _)| *name == field).map(|(_, kind)| *kind)
    }
}
