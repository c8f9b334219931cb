//! Class registry and binding catalog.
//!
//! Classes, bindings and state keys are declared on the builder before the
//! store is built; the resulting [`Registry`] is immutable for the store's
//! lifetime. Each binding direction is memoized with its peer so the
//! transaction planner traverses relationships in O(1).

use std::collections::HashMap;
use std::sync::Arc;

use zoom_types::ZoomError;
use zoom_types::error::InternalObjectMapperSnafu;

use crate::object::{ClassOps, FieldKind, Storable, TypedOps};

/// What deleting an object does to the peers referenced by a bound field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteAction {
    /// Delete the referenced peers as well.
    Cascade,
    /// Remove this object's id from the peers' inverse fields.
    Clear,
    /// Refuse the delete while the field is non-empty.
    Error,
}

/// Write discipline of a state-subsystem key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// One value; a later write replaces an earlier one.
    SingleLastWriteWins,
    /// A set of values added and removed independently.
    Multiple,
}

/// One direction of a symmetric binding declaration, memoized for traversal.
#[derive(Debug, Clone)]
pub(crate) struct Binding {
    /// Class owning `field`.
    pub class: &'static str,
    /// The bound field on `class`.
    pub field: &'static str,
    /// Shape of `field`.
    pub kind: FieldKind,
    /// Action taken when an instance of `class` with a non-empty `field` is
    /// deleted.
    pub on_delete: DeleteAction,
    /// The referenced class.
    pub peer_class: &'static str,
    /// The inverse field on the referenced class.
    pub peer_field: &'static str,
    /// Shape of the inverse field.
    pub peer_kind: FieldKind,
}

/// Everything the store knows about one registered class.
pub(crate) struct ClassInfo {
    pub ops: Arc<dyn ClassOps>,
    pub bindings: Vec<Arc<Binding>>,
    pub keys: HashMap<&'static str, KeyType>,
}

/// Immutable registry handed to the store at build time.
pub(crate) struct Registry {
    classes: HashMap<&'static str, ClassInfo>,
}

impl Registry {
    pub fn class(&self, name: &str) -> Result<&ClassInfo, ZoomError> {
        self.classes.get(name).ok_or_else(|| unregistered(name))
    }

    pub fn ops(&self, name: &str) -> Result<&Arc<dyn ClassOps>, ZoomError> {
        Ok(&self.class(name)?.ops)
    }

    pub fn class_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.classes.keys().copied()
    }

    pub fn key_type(&self, class: &str, key: &str) -> Result<KeyType, ZoomError> {
        self.class(class)?.keys.get(key).copied().ok_or_else(|| {
            InternalObjectMapperSnafu {
                message: format!("state key {key} is not registered for class {class}"),
            }
            .build()
        })
    }
}

fn unregistered(class: &str) -> ZoomError {
    InternalObjectMapperSnafu { message: format!("class {class} is not registered") }.build()
}

/// Mutable registration state owned by the store builder.
#[derive(Default)]
pub(crate) struct RegistryBuilder {
    classes: HashMap<&'static str, ClassInfo>,
}

impl RegistryBuilder {
    /// Registers a class. Two distinct classes may not share a simple name.
    pub fn register_class<T: Storable>(&mut self) -> Result<(), ZoomError> {
        let name = T::class_name();
        if self.classes.contains_key(name) {
            return InternalObjectMapperSnafu {
                message: format!("class {name} is already registered"),
            }
            .fail();
        }
        self.classes.insert(
            name,
            ClassInfo {
                ops: Arc::new(TypedOps::<T>::new()),
                bindings: Vec::new(),
                keys: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Declares a symmetric binding between `A::field_a` and `B::field_b`.
    ///
    /// Both classes must already be registered and both fields must appear
    /// in their class's [`Storable::ref_fields`]. A (class, field) pair may
    /// only be bound once.
    pub fn declare_binding<A: Storable, B: Storable>(
        &mut self,
        field_a: &'static str,
        on_delete_a: DeleteAction,
        field_b: &'static str,
        on_delete_b: DeleteAction,
    ) -> Result<(), ZoomError> {
        let class_a = A::class_name();
        let class_b = B::class_name();
        let kind_a = self.field_kind(class_a, field_a)?;
        let kind_b = self.field_kind(class_b, field_b)?;

        self.ensure_unbound(class_a, field_a)?;
        let same_side = class_a == class_b && field_a == field_b;
        if !same_side {
            self.ensure_unbound(class_b, field_b)?;
        }

        let forward = Arc::new(Binding {
            class: class_a,
            field: field_a,
            kind: kind_a,
            on_delete: on_delete_a,
            peer_class: class_b,
            peer_field: field_b,
            peer_kind: kind_b,
        });
        self.class_mut(class_a)?.bindings.push(forward);

        // A field symmetric onto itself yields a single direction.
        if !same_side {
            let reverse = Arc::new(Binding {
                class: class_b,
                field: field_b,
                kind: kind_b,
                on_delete: on_delete_b,
                peer_class: class_a,
                peer_field: field_a,
                peer_kind: kind_a,
            });
            self.class_mut(class_b)?.bindings.push(reverse);
        }
        Ok(())
    }

    /// Registers a state-subsystem key for a class.
    pub fn register_key<T: Storable>(
        &mut self,
        key: &'static str,
        key_type: KeyType,
    ) -> Result<(), ZoomError> {
        let class = T::class_name();
        let info = self.class_mut(class)?;
        if info.keys.insert(key, key_type).is_some() {
            return InternalObjectMapperSnafu {
                message: format!("state key {key} is already registered for class {class}"),
            }
            .fail();
        }
        Ok(())
    }

    pub fn build(self) -> Registry {
        Registry { classes: self.classes }
    }

    fn class_mut(&mut self, name: &str) -> Result<&mut ClassInfo, ZoomError> {
        if !self.classes.contains_key(name) {
            return Err(unregistered(name));
        }
        self.classes.get_mut(name).ok_or_else(|| unregistered(name))
    }

    fn field_kind(&self, class: &'static str, field: &str) -> Result<FieldKind, ZoomError> {
        let info = self.classes.get(class).ok_or_else(|| unregistered(class))?;
        info.ops.field_kind(field).ok_or_else(|| {
            InternalObjectMapperSnafu {
                message: format!("class {class} has no reference field named {field}"),
            }
            .build()
        })
    }

    fn ensure_unbound(&self, class: &str, field: &str) -> Result<(), ZoomError> {
        let info = self.classes.get(class).ok_or_else(|| unregistered(class))?;
        if info.bindings.iter().any(|b| b.field == field) {
            return InternalObjectMapperSnafu {
                message: format!("field {field} of class {class} is already bound"),
            }
            .fail();
        }
        Ok(())
    }
}
