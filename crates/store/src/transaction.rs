//! Transaction manager: snapshot, plan, commit.
//!
//! A transaction opens by creating an ephemeral sequential marker node and
//! recording its creation stamp as the snapshot bound. Every read inside
//! the transaction caches both the object and its provenance sibling; a
//! read whose modification stamp exceeds the bound aborts immediately with
//! a concurrent-modification failure. Mutations rewrite the cached view and
//! schedule inverse updates on bound peers; commit flattens the plan into
//! one atomic multi-op batch guarded by the snapshot's per-node versions.
//!
//! A transaction is confined to one task and is not thread-safe. It must be
//! finished with [`Transaction::commit`] or [`Transaction::close`]; both
//! delete the marker node on every exit path.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};
use zoom_backend::{ANY_VERSION, BackendError, CreateMode, MultiFailure, MultiOp};
use zoom_types::error::{
    InternalObjectMapperSnafu, NotFoundSnafu, ObjectExistsSnafu, ObjectReferencedSnafu,
    ReferenceConflictSnafu, StorageNodeNotFoundSnafu,
};
use zoom_types::{ObjId, ProvenanceRecord, ZoomError, decode, encode};

use crate::metrics;
use crate::object::{DynObject, RefValue, Storable};
use crate::ops::{OpInner, PersistenceOp};
use crate::registry::{Binding, DeleteAction};
use crate::store::{StoreInner, backend_to_zoom};

/// Identifies one object within a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ObjKey {
    pub class: &'static str,
    pub id: ObjId,
}

/// Snapshot and in-transaction view of one object.
///
/// `current` is rewritten as the planner applies mutations, so later reads
/// inside the same transaction observe earlier writes.
struct TxObject {
    current: Option<DynObject>,
    /// Object node version at snapshot time; -1 when the object was absent.
    version: i64,
    /// Provenance node version at snapshot time; -1 when the sibling was
    /// absent (legacy data).
    prov_version: i64,
    prov_record: Option<ProvenanceRecord>,
    prov_bytes: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjOp {
    Create,
    Update,
    Delete,
}

enum NodeOp {
    CreateNode { value: Vec<u8> },
    UpdateNode { value: Vec<u8> },
    DeleteNode,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum OpKey {
    Obj(ObjKey),
    Node(String),
}

/// User intent behind each submitted backend operation, used to map a
/// failing multi-op index back to a store error.
enum OpIntent {
    CreateObject(ObjKey),
    UpdateObject(ObjKey),
    DeleteObject(ObjKey),
    Provenance(ObjKey),
    CreateNode(String),
    UpdateNode(String),
    DeleteNode(String),
}

/// A single logical transaction against the store.
pub struct Transaction {
    store: Arc<StoreInner>,
    owner: Option<String>,
    marker_path: String,
    /// Snapshot upper bound: any object modified past this stamp was
    /// concurrently written and invalidates the transaction.
    zxid_ceiling: u64,
    cache: HashMap<ObjKey, TxObject>,
    op_order: Vec<OpKey>,
    obj_ops: HashMap<ObjKey, ObjOp>,
    node_ops: HashMap<String, NodeOp>,
    closed: bool,
}

impl Transaction {
    pub(crate) async fn open(
        store: Arc<StoreInner>,
        owner: Option<String>,
    ) -> Result<Self, ZoomError> {
        let marker = store
            .backend
            .create(&store.paths.tx_marker_prefix(), Vec::new(), CreateMode::EphemeralSequential)
            .await
            .map_err(backend_to_zoom)?;
        debug!(marker = %marker.path, snapshot = marker.stat.czxid, "opened transaction");
        Ok(Self {
            store,
            owner,
            zxid_ceiling: marker.stat.czxid,
            marker_path: marker.path,
            cache: HashMap::new(),
            op_order: Vec::new(),
            obj_ops: HashMap::new(),
            node_ops: HashMap::new(),
            closed: false,
        })
    }

    /// Reads an object through the transaction's snapshot, observing the
    /// transaction's own pending writes.
    pub async fn get<T: Storable>(&mut self, id: &ObjId) -> Result<T, ZoomError> {
        self.ensure_open()?;
        let key = ObjKey { class: T::class_name(), id: id.clone() };
        let snap = self.snapshot(&key).await?;
        match snap.current.as_ref() {
            Some(obj) => obj.downcast_ref::<T>().cloned().ok_or_else(|| {
                InternalObjectMapperSnafu {
                    message: format!("cached object is not an instance of {}", T::class_name()),
                }
                .build()
            }),
            None => NotFoundSnafu { class: T::class_name(), id: id.clone() }.fail(),
        }
    }

    /// Whether an object exists in the transaction's view.
    pub async fn exists<T: Storable>(&mut self, id: &ObjId) -> Result<bool, ZoomError> {
        self.ensure_open()?;
        let key = ObjKey { class: T::class_name(), id: id.clone() };
        let snap = self.snapshot(&key).await?;
        Ok(snap.current.is_some())
    }

    /// Creates an object and schedules the inverse updates its outgoing
    /// references require on bound peers.
    pub async fn create<T: Storable>(&mut self, obj: T) -> Result<(), ZoomError> {
        self.ensure_open()?;
        self.create_dyn(T::class_name(), Box::new(obj)).await
    }

    /// Replaces an object, scheduling inverse updates for every reference
    /// added to or removed from its bound fields.
    pub async fn update<T: Storable>(&mut self, obj: T) -> Result<(), ZoomError> {
        self.ensure_open()?;
        self.update_dyn(T::class_name(), Box::new(obj)).await
    }

    /// Like [`update`](Transaction::update), but runs `validator` against
    /// the snapshot value and the replacement first; an error aborts the
    /// update.
    pub async fn update_validated<T, V>(&mut self, obj: T, validator: V) -> Result<(), ZoomError>
    where
        T: Storable,
        V: FnOnce(&T, &T) -> Result<(), ZoomError>,
    {
        self.ensure_open()?;
        let key = ObjKey { class: T::class_name(), id: obj.object_id() };
        {
            let snap = self.snapshot(&key).await?;
            let Some(current) = snap.current.as_ref() else {
                return NotFoundSnafu { class: T::class_name(), id: key.id.clone() }.fail();
            };
            let old = current.downcast_ref::<T>().ok_or_else(|| {
                InternalObjectMapperSnafu {
                    message: format!("cached object is not an instance of {}", T::class_name()),
                }
                .build()
            })?;
            validator(old, &obj)?;
        }
        self.update_dyn(T::class_name(), Box::new(obj)).await
    }

    /// Deletes an object, honoring each bound field's delete action. With
    /// `ignore_missing`, deleting an absent object is a no-op.
    pub async fn delete<T: Storable>(
        &mut self,
        id: &ObjId,
        ignore_missing: bool,
    ) -> Result<(), ZoomError> {
        self.ensure_open()?;
        let mut visited = HashSet::new();
        self.delete_inner(
            ObjKey { class: T::class_name(), id: id.clone() },
            ignore_missing,
            &mut visited,
        )
        .await
    }

    /// Writes a raw node atomically with the rest of the transaction.
    pub fn create_node(
        &mut self,
        path: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), ZoomError> {
        self.ensure_open()?;
        let path = path.into();
        let value = value.into();
        use std::collections::hash_map::Entry;
        match self.node_ops.entry(path) {
            Entry::Occupied(mut entry) => {
                let merged = match entry.get() {
                    // The node is already being written in this transaction;
                    // the later create supersedes it.
                    NodeOp::CreateNode { .. } => NodeOp::CreateNode { value },
                    NodeOp::UpdateNode { .. } => NodeOp::UpdateNode { value },
                    // The node exists in the backend; delete-then-create
                    // collapses into a replacement write.
                    NodeOp::DeleteNode => NodeOp::UpdateNode { value },
                };
                entry.insert(merged);
            },
            Entry::Vacant(entry) => {
                let key = entry.key().clone();
                entry.insert(NodeOp::CreateNode { value });
                self.op_order.push(OpKey::Node(key));
            },
        }
        Ok(())
    }

    /// Replaces a raw node's value atomically with the rest of the
    /// transaction.
    pub fn update_node(
        &mut self,
        path: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), ZoomError> {
        self.ensure_open()?;
        let path = path.into();
        let value = value.into();
        use std::collections::hash_map::Entry;
        match self.node_ops.entry(path) {
            Entry::Occupied(mut entry) => {
                let merged = match entry.get() {
                    NodeOp::CreateNode { .. } => NodeOp::CreateNode { value },
                    NodeOp::UpdateNode { .. } => NodeOp::UpdateNode { value },
                    NodeOp::DeleteNode => {
                        return StorageNodeNotFoundSnafu { path: entry.key().clone() }.fail();
                    },
                };
                entry.insert(merged);
            },
            Entry::Vacant(entry) => {
                let key = entry.key().clone();
                entry.insert(NodeOp::UpdateNode { value });
                self.op_order.push(OpKey::Node(key));
            },
        }
        Ok(())
    }

    /// Deletes a raw node and its descendants atomically with the rest of
    /// the transaction.
    pub fn delete_node(&mut self, path: impl Into<String>) -> Result<(), ZoomError> {
        self.ensure_open()?;
        let path = path.into();
        use std::collections::hash_map::Entry;
        match self.node_ops.entry(path) {
            Entry::Occupied(mut entry) => match entry.get() {
                // create-then-delete cancels out
                NodeOp::CreateNode { .. } => {
                    entry.remove();
                },
                NodeOp::UpdateNode { .. } | NodeOp::DeleteNode => {
                    entry.insert(NodeOp::DeleteNode);
                },
            },
            Entry::Vacant(entry) => {
                let key = entry.key().clone();
                entry.insert(NodeOp::DeleteNode);
                self.op_order.push(OpKey::Node(key));
            },
        }
        Ok(())
    }

    /// Applies one batched persistence operation.
    pub(crate) async fn apply(&mut self, op: PersistenceOp) -> Result<(), ZoomError> {
        match op.inner {
            OpInner::Create { class, obj } => self.create_dyn(class, obj).await,
            OpInner::Update { class, obj } => self.update_dyn(class, obj).await,
            OpInner::Delete { class, id, ignore_missing } => {
                let mut visited = HashSet::new();
                self.delete_inner(ObjKey { class, id }, ignore_missing, &mut visited).await
            },
            OpInner::CreateNode { path, value } => self.create_node(path, value),
            OpInner::UpdateNode { path, value } => self.update_node(path, value),
            OpInner::DeleteNode { path } => self.delete_node(path),
        }
    }

    /// Commits the planned mutations as one atomic batch, then releases the
    /// marker node.
    pub async fn commit(mut self) -> Result<(), ZoomError> {
        self.ensure_open()?;
        let started = Instant::now();
        let result = self.commit_inner().await;
        metrics::record_commit(result.is_ok(), started);
        self.release().await;
        result
    }

    /// Discards all pending changes and releases the marker node.
    pub async fn close(mut self) {
        self.release().await;
    }

    // -----------------------------------------------------------------------
    // Snapshot and planning
    // -----------------------------------------------------------------------

    fn ensure_open(&self) -> Result<(), ZoomError> {
        if self.closed {
            return Err(ZoomError::ServiceUnavailable {
                reason: "transaction is already closed".to_owned(),
            });
        }
        Ok(())
    }

    /// Fetches and caches the snapshot of one object. The object record and
    /// its provenance sibling are read concurrently; a modification stamp
    /// past the snapshot bound aborts with `ConcurrentModification`.
    async fn snapshot(&mut self, key: &ObjKey) -> Result<&mut TxObject, ZoomError> {
        if !self.cache.contains_key(key) {
            let obj_path = self.store.paths.object(key.class, &key.id);
            let prov_path = self.store.paths.provenance(key.class, &key.id);
            let (obj_res, prov_res) =
                tokio::join!(self.store.backend.get(&obj_path), self.store.backend.get(&prov_path));

            let entry = match obj_res {
                Ok(node) => {
                    if node.stat.mzxid > self.zxid_ceiling {
                        return Err(ZoomError::ConcurrentModification);
                    }
                    let ops = self.store.registry.ops(key.class)?;
                    let obj = ops.decode_obj(&node.data)?;
                    let (prov_record, prov_bytes, prov_version) = match prov_res {
                        Ok(prov) => {
                            if prov.stat.mzxid > self.zxid_ceiling {
                                return Err(ZoomError::ConcurrentModification);
                            }
                            let record: ProvenanceRecord = decode(&prov.data)?;
                            (Some(record), Some(prov.data), prov.stat.version)
                        },
                        // Legacy objects may predate provenance siblings.
                        Err(BackendError::NoNode { .. }) => (None, None, -1),
                        Err(err) => return Err(backend_to_zoom(err)),
                    };
                    TxObject {
                        current: Some(obj),
                        version: node.stat.version,
                        prov_version,
                        prov_record,
                        prov_bytes,
                    }
                },
                Err(BackendError::NoNode { .. }) => TxObject {
                    current: None,
                    version: -1,
                    prov_version: -1,
                    prov_record: None,
                    prov_bytes: None,
                },
                Err(err) => return Err(backend_to_zoom(err)),
            };
            self.cache.insert(key.clone(), entry);
        }
        self.cache.get_mut(key).ok_or_else(|| {
            InternalObjectMapperSnafu { message: "transaction cache entry vanished".to_owned() }
                .build()
        })
    }

    async fn create_dyn(&mut self, class: &'static str, obj: DynObject) -> Result<(), ZoomError> {
        let ops = self.store.registry.ops(class)?.clone();
        let id = ops.id_of(&obj)?;
        let key = ObjKey { class, id: id.clone() };

        if matches!(self.obj_ops.get(&key), Some(ObjOp::Delete)) {
            return InternalObjectMapperSnafu {
                message: format!(
                    "delete followed by create of {class}/{id} in one transaction is not supported"
                ),
            }
            .fail();
        }

        let bindings = self.store.registry.class(class)?.bindings.clone();
        let mut outgoing: Vec<(Arc<Binding>, Vec<ObjId>)> = Vec::new();
        for binding in &bindings {
            let refs = ops.ref_field(&obj, binding.field)?.map(|v| v.ids()).unwrap_or_default();
            if !refs.is_empty() {
                outgoing.push((binding.clone(), refs));
            }
        }

        {
            let snap = self.snapshot(&key).await?;
            if snap.current.is_some() {
                return ObjectExistsSnafu { class, id }.fail();
            }
            snap.current = Some(obj);
        }
        self.plan_obj_op(key, ObjOp::Create);

        for (binding, refs) in outgoing {
            for peer in refs {
                self.add_backreference(&binding, &peer, &id).await?;
            }
        }
        Ok(())
    }

    async fn update_dyn(&mut self, class: &'static str, obj: DynObject) -> Result<(), ZoomError> {
        let ops = self.store.registry.ops(class)?.clone();
        let id = ops.id_of(&obj)?;
        let key = ObjKey { class, id: id.clone() };
        let bindings = self.store.registry.class(class)?.bindings.clone();

        let mut old_refs: Vec<Vec<ObjId>> = Vec::with_capacity(bindings.len());
        {
            let snap = self.snapshot(&key).await?;
            let Some(current) = snap.current.as_ref() else {
                return NotFoundSnafu { class, id }.fail();
            };
            for binding in &bindings {
                old_refs.push(
                    ops.ref_field(current, binding.field)?.map(|v| v.ids()).unwrap_or_default(),
                );
            }
        }

        let mut added: Vec<(Arc<Binding>, ObjId)> = Vec::new();
        let mut removed: Vec<(Arc<Binding>, ObjId)> = Vec::new();
        for (binding, old) in bindings.iter().zip(&old_refs) {
            let new = ops.ref_field(&obj, binding.field)?.map(|v| v.ids()).unwrap_or_default();
            for peer in &new {
                if !old.contains(peer) {
                    added.push((binding.clone(), peer.clone()));
                }
            }
            for peer in old {
                if !new.contains(peer) {
                    removed.push((binding.clone(), peer.clone()));
                }
            }
        }

        if let Some(snap) = self.cache.get_mut(&key) {
            snap.current = Some(obj);
        }
        self.plan_obj_op(key, ObjOp::Update);

        for (binding, peer) in removed {
            self.clear_backreference(&binding, &peer, &id).await?;
        }
        for (binding, peer) in added {
            self.add_backreference(&binding, &peer, &id).await?;
        }
        Ok(())
    }

    fn delete_inner<'a>(
        &'a mut self,
        key: ObjKey,
        ignore_missing: bool,
        visited: &'a mut HashSet<ObjKey>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ZoomError>> + Send + 'a>> {
        Box::pin(async move {
            // Cascade cycles terminate here.
            if !visited.insert(key.clone()) {
                return Ok(());
            }
            let ops = self.store.registry.ops(key.class)?.clone();
            let bindings = self.store.registry.class(key.class)?.bindings.clone();

            let mut field_refs: Vec<(Arc<Binding>, Vec<ObjId>)> = Vec::new();
            {
                let snap = self.snapshot(&key).await?;
                match snap.current.as_ref() {
                    None if ignore_missing => return Ok(()),
                    None => return NotFoundSnafu { class: key.class, id: key.id.clone() }.fail(),
                    Some(current) => {
                        for binding in &bindings {
                            let refs = ops
                                .ref_field(current, binding.field)?
                                .map(|v| v.ids())
                                .unwrap_or_default();
                            field_refs.push((binding.clone(), refs));
                        }
                    },
                }
            }

            for (binding, refs) in &field_refs {
                if binding.on_delete == DeleteAction::Error && !refs.is_empty() {
                    return ObjectReferencedSnafu { class: key.class, id: key.id.clone() }.fail();
                }
            }

            if matches!(self.obj_ops.get(&key), Some(ObjOp::Create)) {
                // create-then-delete cancels out
                self.obj_ops.remove(&key);
            } else {
                self.plan_obj_op(key.clone(), ObjOp::Delete);
            }
            if let Some(snap) = self.cache.get_mut(&key) {
                snap.current = None;
            }

            for (binding, refs) in field_refs {
                match binding.on_delete {
                    DeleteAction::Error => {},
                    DeleteAction::Clear => {
                        for peer in refs {
                            self.clear_backreference(&binding, &peer, &key.id).await?;
                        }
                    },
                    DeleteAction::Cascade => {
                        for peer in refs {
                            let peer_key = ObjKey { class: binding.peer_class, id: peer };
                            self.delete_inner(peer_key, true, visited).await?;
                        }
                    },
                }
            }
            Ok(())
        })
    }

    /// Adds `from` to the peer's inverse field, failing if that would steal
    /// an occupied single-reference field.
    async fn add_backreference(
        &mut self,
        binding: &Binding,
        peer_id: &ObjId,
        from: &ObjId,
    ) -> Result<(), ZoomError> {
        let peer_key = ObjKey { class: binding.peer_class, id: peer_id.clone() };
        let ops = self.store.registry.ops(binding.peer_class)?.clone();
        let snap = self.snapshot(&peer_key).await?;
        let Some(peer) = snap.current.as_mut() else {
            // Every referenced id must name a live peer.
            return NotFoundSnafu { class: binding.peer_class, id: peer_id.clone() }.fail();
        };
        let field = binding.peer_field;
        let value = ops.ref_field(peer, field)?.unwrap_or_else(|| RefValue::empty(binding.peer_kind));
        let new_value = match value {
            RefValue::Single(Some(existing)) if existing == *from => return Ok(()),
            RefValue::Single(Some(existing)) => {
                return ReferenceConflictSnafu {
                    class: binding.peer_class,
                    id: peer_id.clone(),
                    field,
                    existing,
                }
                .fail();
            },
            RefValue::Single(None) => RefValue::Single(Some(from.clone())),
            RefValue::List(mut ids) => {
                if ids.contains(from) {
                    return Ok(());
                }
                ids.push(from.clone());
                RefValue::List(ids)
            },
        };
        ops.set_ref_field(peer, field, new_value)?;
        self.plan_obj_op(peer_key, ObjOp::Update);
        Ok(())
    }

    /// Removes `from` from the peer's inverse field. Idempotent; peers
    /// scheduled for deletion in this transaction are skipped.
    async fn clear_backreference(
        &mut self,
        binding: &Binding,
        peer_id: &ObjId,
        from: &ObjId,
    ) -> Result<(), ZoomError> {
        let peer_key = ObjKey { class: binding.peer_class, id: peer_id.clone() };
        if matches!(self.obj_ops.get(&peer_key), Some(ObjOp::Delete)) {
            return Ok(());
        }
        let ops = self.store.registry.ops(binding.peer_class)?.clone();
        let snap = self.snapshot(&peer_key).await?;
        let Some(peer) = snap.current.as_mut() else {
            // The peer this object referenced is gone underneath us.
            return Err(ZoomError::ConcurrentModification);
        };
        let field = binding.peer_field;
        let Some(value) = ops.ref_field(peer, field)? else {
            return Ok(());
        };
        let new_value = match value {
            RefValue::Single(Some(existing)) if existing == *from => RefValue::Single(None),
            RefValue::List(mut ids) => {
                let Some(position) = ids.iter().position(|id| id == from) else {
                    return Ok(());
                };
                ids.remove(position);
                RefValue::List(ids)
            },
            _ => return Ok(()),
        };
        ops.set_ref_field(peer, field, new_value)?;
        self.plan_obj_op(peer_key, ObjOp::Update);
        Ok(())
    }

    fn plan_obj_op(&mut self, key: ObjKey, op: ObjOp) {
        use std::collections::hash_map::Entry;
        match self.obj_ops.entry(key) {
            Entry::Occupied(mut entry) => {
                let merged = match (*entry.get(), op) {
                    // A created object absorbs later rewrites of its value.
                    (ObjOp::Create, _) => ObjOp::Create,
                    (ObjOp::Update, ObjOp::Delete) => ObjOp::Delete,
                    (ObjOp::Update, _) => ObjOp::Update,
                    (ObjOp::Delete, _) => ObjOp::Delete,
                };
                entry.insert(merged);
            },
            Entry::Vacant(entry) => {
                let key = entry.key().clone();
                entry.insert(op);
                self.op_order.push(OpKey::Obj(key));
            },
        }
    }

    // -----------------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------------

    async fn commit_inner(&self) -> Result<(), ZoomError> {
        let (ops, intents) = self.flatten().await?;
        if ops.is_empty() {
            debug!("transaction planned no backend writes");
            return Ok(());
        }
        debug!(ops = ops.len(), "committing transaction");
        match self.store.backend.multi(ops).await {
            Ok(_) => Ok(()),
            Err(failure) => Err(self.map_multi_failure(failure, &intents)),
        }
    }

    /// Consolidates the planned mutations into one ordered multi-op batch.
    async fn flatten(&self) -> Result<(Vec<MultiOp>, Vec<OpIntent>), ZoomError> {
        let mut multi = Vec::new();
        let mut intents = Vec::new();
        let mut seen = HashSet::new();

        for op_key in &self.op_order {
            if !seen.insert(op_key) {
                continue;
            }
            match op_key {
                OpKey::Obj(key) => {
                    // Cancelled ops leave a stale order entry behind.
                    let Some(op) = self.obj_ops.get(key) else { continue };
                    let entry = self.cache.get(key).ok_or_else(|| {
                        InternalObjectMapperSnafu {
                            message: format!("no snapshot for planned op on {}/{}", key.class, key.id),
                        }
                        .build()
                    })?;
                    let obj_path = self.store.paths.object(key.class, &key.id);
                    let prov_path = self.store.paths.provenance(key.class, &key.id);
                    match op {
                        ObjOp::Create => {
                            let ops = self.store.registry.ops(key.class)?;
                            let obj = entry.current.as_ref().ok_or_else(|| {
                                InternalObjectMapperSnafu {
                                    message: format!(
                                        "planned create of {}/{} has no value",
                                        key.class, key.id
                                    ),
                                }
                                .build()
                            })?;
                            multi.push(MultiOp::Create {
                                path: obj_path,
                                data: ops.encode_obj(obj)?,
                                mode: CreateMode::Persistent,
                            });
                            intents.push(OpIntent::CreateObject(key.clone()));

                            let record = ProvenanceRecord::created(self.owner.clone());
                            multi.push(MultiOp::Create {
                                path: prov_path,
                                data: encode(&record)?,
                                mode: CreateMode::Persistent,
                            });
                            intents.push(OpIntent::Provenance(key.clone()));
                        },
                        ObjOp::Update => {
                            let ops = self.store.registry.ops(key.class)?;
                            let obj = entry.current.as_ref().ok_or_else(|| {
                                InternalObjectMapperSnafu {
                                    message: format!(
                                        "planned update of {}/{} has no value",
                                        key.class, key.id
                                    ),
                                }
                                .build()
                            })?;
                            multi.push(MultiOp::SetData {
                                path: obj_path,
                                data: ops.encode_obj(obj)?,
                                expected_version: entry.version,
                            });
                            intents.push(OpIntent::UpdateObject(key.clone()));

                            let record =
                                ProvenanceRecord::updated(entry.prov_record.as_ref(), self.owner.clone());
                            let bytes = encode(&record)?;
                            if entry.prov_version < 0 {
                                // Legacy object without a sibling: create it.
                                multi.push(MultiOp::Create {
                                    path: prov_path,
                                    data: bytes,
                                    mode: CreateMode::Persistent,
                                });
                                intents.push(OpIntent::Provenance(key.clone()));
                            } else if entry.prov_bytes.as_deref() != Some(bytes.as_slice()) {
                                multi.push(MultiOp::SetData {
                                    path: prov_path,
                                    data: bytes,
                                    expected_version: entry.prov_version,
                                });
                                intents.push(OpIntent::Provenance(key.clone()));
                            }
                            // An unchanged record is skipped entirely.
                        },
                        ObjOp::Delete => {
                            multi.push(MultiOp::Delete {
                                path: obj_path,
                                expected_version: entry.version,
                            });
                            intents.push(OpIntent::DeleteObject(key.clone()));
                            if entry.prov_version >= 0 {
                                multi.push(MultiOp::Delete {
                                    path: prov_path,
                                    expected_version: entry.prov_version,
                                });
                                intents.push(OpIntent::Provenance(key.clone()));
                            }
                        },
                    }
                },
                OpKey::Node(path) => {
                    let Some(op) = self.node_ops.get(path) else { continue };
                    match op {
                        NodeOp::CreateNode { value } => {
                            multi.push(MultiOp::Create {
                                path: path.clone(),
                                data: value.clone(),
                                mode: CreateMode::Persistent,
                            });
                            intents.push(OpIntent::CreateNode(path.clone()));
                        },
                        NodeOp::UpdateNode { value } => {
                            multi.push(MultiOp::SetData {
                                path: path.clone(),
                                data: value.clone(),
                                expected_version: ANY_VERSION,
                            });
                            intents.push(OpIntent::UpdateNode(path.clone()));
                        },
                        NodeOp::DeleteNode => {
                            // Descendants must go first; a racing child
                            // create still fails the batch and surfaces as a
                            // concurrent modification.
                            for descendant in self.collect_descendants(path).await? {
                                multi.push(MultiOp::Delete {
                                    path: descendant,
                                    expected_version: ANY_VERSION,
                                });
                                intents.push(OpIntent::DeleteNode(path.clone()));
                            }
                            multi.push(MultiOp::Delete {
                                path: path.clone(),
                                expected_version: ANY_VERSION,
                            });
                            intents.push(OpIntent::DeleteNode(path.clone()));
                        },
                    }
                },
            }
        }
        Ok((multi, intents))
    }

    /// Lists every descendant of `path`, deepest first.
    async fn collect_descendants(&self, path: &str) -> Result<Vec<String>, ZoomError> {
        let mut all = Vec::new();
        let mut frontier = vec![path.to_owned()];
        while let Some(current) = frontier.pop() {
            let children = match self.store.backend.children(&current).await {
                Ok(children) => children,
                Err(BackendError::NoNode { .. }) => continue,
                Err(err) => return Err(backend_to_zoom(err)),
            };
            for child in children {
                let child_path = format!("{current}/{child}");
                all.push(child_path.clone());
                frontier.push(child_path);
            }
        }
        // Every node was recorded after its parent; reversing yields a safe
        // deletion order.
        all.reverse();
        Ok(all)
    }

    fn map_multi_failure(&self, failure: MultiFailure, intents: &[OpIntent]) -> ZoomError {
        let MultiFailure { index, source } = failure;
        let Some(intent) = intents.get(index) else {
            return InternalObjectMapperSnafu {
                message: format!("multi-op failed at unknown index {index}: {source}"),
            }
            .build();
        };
        match (source, intent) {
            (BackendError::NodeExists { .. }, OpIntent::CreateObject(key)) => {
                ZoomError::ObjectExists { class: key.class.to_owned(), id: key.id.clone() }
            },
            (BackendError::NodeExists { path }, OpIntent::CreateNode(_)) => {
                ZoomError::StorageNodeExists { path }
            },
            (
                BackendError::NoNode { path },
                OpIntent::UpdateNode(_) | OpIntent::DeleteNode(_),
            ) => ZoomError::StorageNodeNotFound { path },
            (
                BackendError::NodeExists { .. }
                | BackendError::NoNode { .. }
                | BackendError::BadVersion { .. }
                | BackendError::NotEmpty { .. },
                _,
            ) => ZoomError::ConcurrentModification,
            (BackendError::Closed, _) => {
                ZoomError::ServiceUnavailable { reason: "backend is closed".to_owned() }
            },
            (other, _) => InternalObjectMapperSnafu {
                message: format!("unexpected backend failure: {other}"),
            }
            .build(),
        }
    }

    /// Deletes the marker node. Failure is logged, never raised; the marker
    /// is ephemeral and clears with the session.
    async fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.store.backend.delete(&self.marker_path, ANY_VERSION).await {
            warn!(marker = %self.marker_path, %err, "failed to delete transaction marker");
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.closed {
            warn!(marker = %self.marker_path, "transaction dropped without commit or close");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let backend = self.store.backend.clone();
                let marker = std::mem::take(&mut self.marker_path);
                handle.spawn(async move {
                    let _ = backend.delete(&marker, ANY_VERSION).await;
                });
            }
        }
    }
}
