//! Storage facade and builder.
//!
//! [`ZoomBuilder`] collects class, binding and key registrations, then
//! [`build`](ZoomBuilder::build) creates the backend directory trees
//! idempotently and returns the immutable [`ZoomStore`]. Registration after
//! build is impossible by construction: the builder is consumed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::{BoxFuture, try_join_all};
use tracing::info;
use zoom_backend::{Backend, BackendError, CreateMode};
use zoom_types::error::{InternalObjectMapperSnafu, NotFoundSnafu, StorageFailureSnafu};
use zoom_types::{ObjId, StoreConfig, ZoomError, decode};

use crate::lock::TopologyLock;
use crate::metrics::{self, InstrumentedBackend};
use crate::object::Storable;
use crate::observable::{
    ClassObservable, ObjectObservable, ObservableCaches, subscribe_class, subscribe_object,
};
use crate::ops::PersistenceOp;
use crate::paths::PathLayout;
use crate::registry::{DeleteAction, KeyType, Registry, RegistryBuilder};
use crate::retry;
use crate::state::ObjectState;
use crate::transaction::Transaction;

/// Shared internals behind the facade, transactions and observables.
pub(crate) struct StoreInner {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) registry: Registry,
    pub(crate) paths: PathLayout,
    pub(crate) config: StoreConfig,
    pub(crate) lock: TopologyLock,
    pub(crate) observables: ObservableCaches,
    closed: AtomicBool,
}

impl StoreInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_open(&self) -> Result<(), ZoomError> {
        if self.is_closed() {
            return Err(ZoomError::ServiceUnavailable {
                reason: "store has been stopped".to_owned(),
            });
        }
        Ok(())
    }
}

/// Maps read-path backend faults into the store taxonomy.
pub(crate) fn backend_to_zoom(err: BackendError) -> ZoomError {
    match err {
        BackendError::Closed => {
            ZoomError::ServiceUnavailable { reason: "backend is closed".to_owned() }
        },
        BackendError::BadVersion { .. } => ZoomError::ConcurrentModification,
        other => StorageFailureSnafu { message: other.to_string() }.build(),
    }
}

/// Counts surfaced errors by class.
fn track<T>(result: Result<T, ZoomError>) -> Result<T, ZoomError> {
    result.inspect_err(|err| metrics::record_error(err.kind()))
}

/// Collects registrations and builds the store.
pub struct ZoomBuilder {
    backend: Arc<dyn Backend>,
    config: StoreConfig,
    registry: RegistryBuilder,
}

impl ZoomBuilder {
    /// Starts a builder over the given backend.
    pub fn new(backend: Arc<dyn Backend>, config: StoreConfig) -> Self {
        Self { backend, config, registry: RegistryBuilder::default() }
    }

    /// Registers a class. Two distinct classes may not share a simple name.
    pub fn register_class<T: Storable>(&mut self) -> Result<&mut Self, ZoomError> {
        self.registry.register_class::<T>()?;
        Ok(self)
    }

    /// Declares a symmetric binding between `A::field_a` and `B::field_b`.
    pub fn declare_binding<A: Storable, B: Storable>(
        &mut self,
        field_a: &'static str,
        on_delete_a: DeleteAction,
        field_b: &'static str,
        on_delete_b: DeleteAction,
    ) -> Result<&mut Self, ZoomError> {
        self.registry.declare_binding::<A, B>(field_a, on_delete_a, field_b, on_delete_b)?;
        Ok(self)
    }

    /// Registers a state-subsystem key for a class.
    pub fn register_key<T: Storable>(
        &mut self,
        key: &'static str,
        key_type: KeyType,
    ) -> Result<&mut Self, ZoomError> {
        self.registry.register_key::<T>(key, key_type)?;
        Ok(self)
    }

    /// Creates the directory trees (idempotently) and returns the store.
    pub async fn build(self) -> Result<ZoomStore, ZoomError> {
        let registry = self.registry.build();
        let paths = PathLayout::new(&self.config.root_key);
        let backend: Arc<dyn Backend> = Arc::new(InstrumentedBackend::new(self.backend));

        ensure_path(&backend, paths.base()).await?;
        let mut dirs = vec![
            paths.models_dir(),
            paths.provenance_dir(),
            paths.state_dir(),
            paths.locks_dir(),
            paths.tx_markers_dir(),
            paths.state_namespace(&self.config.namespace),
        ];
        for class in registry.class_names() {
            dirs.push(paths.class_dir(class));
            dirs.push(paths.provenance_class_dir(class));
        }
        for dir in &dirs {
            ensure_dir(&backend, dir).await?;
        }
        // The lock node itself; operators delete it to disable locking.
        ensure_dir(&backend, &paths.topology_lock()).await?;

        let lock =
            TopologyLock::start(backend.clone(), paths.topology_lock(), self.config.lock_timeout)
                .await?;

        info!(root = %paths.base(), namespace = %self.config.namespace, "object store ready");
        Ok(ZoomStore {
            inner: Arc::new(StoreInner {
                backend,
                registry,
                paths,
                config: self.config,
                lock,
                observables: ObservableCaches::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

async fn ensure_path(backend: &Arc<dyn Backend>, path: &str) -> Result<(), ZoomError> {
    let mut current = String::new();
    for segment in path.trim_start_matches('/').split('/') {
        current.push('/');
        current.push_str(segment);
        ensure_dir(backend, &current).await?;
    }
    Ok(())
}

async fn ensure_dir(backend: &Arc<dyn Backend>, path: &str) -> Result<(), ZoomError> {
    match backend.create(path, Vec::new(), CreateMode::Persistent).await {
        Ok(_) | Err(BackendError::NodeExists { .. }) => Ok(()),
        Err(err) => Err(backend_to_zoom(err)),
    }
}

/// The public store handle. Cheap to clone; all clones share one backend
/// connection, observable cache and lock watcher.
#[derive(Clone)]
pub struct ZoomStore {
    inner: Arc<StoreInner>,
}

impl ZoomStore {
    pub(crate) fn inner(&self) -> &Arc<StoreInner> {
        &self.inner
    }

    /// Fetches one object.
    pub async fn get<T: Storable>(&self, id: &ObjId) -> Result<T, ZoomError> {
        track(self.get_inner::<T>(id).await)
    }

    /// Fetches several objects of one class in parallel. Fails if any of
    /// them is missing.
    pub async fn get_many<T: Storable>(&self, ids: &[ObjId]) -> Result<Vec<T>, ZoomError> {
        track(try_join_all(ids.iter().map(|id| self.get_inner::<T>(id))).await)
    }

    /// Fetches every object of a class by fanning out over the class
    /// directory listing.
    pub async fn get_all<T: Storable>(&self) -> Result<Vec<T>, ZoomError> {
        track(self.get_all_inner::<T>().await)
    }

    /// Whether an object exists. Never fails on a missing object.
    pub async fn exists<T: Storable>(&self, id: &ObjId) -> Result<bool, ZoomError> {
        track(self.exists_inner::<T>(id).await)
    }

    /// Applies an ordered batch of operations in one anonymous transaction.
    pub async fn multi(&self, ops: Vec<PersistenceOp>) -> Result<(), ZoomError> {
        track(self.multi_inner(ops).await)
    }

    /// Opens a transaction recording `owner` in the provenance of every
    /// object it writes.
    pub async fn transaction(&self, owner: Option<String>) -> Result<Transaction, ZoomError> {
        self.inner.ensure_open()?;
        track(Transaction::open(self.inner.clone(), owner).await)
    }

    /// Runs `body` inside a lock-guarded transaction, retrying the whole
    /// body on concurrent modification up to the configured attempts.
    ///
    /// ```no_run
    /// # use zoom_store::ZoomStore;
    /// # async fn example(store: &ZoomStore) -> zoom_store::Result<()> {
    /// store
    ///     .try_transaction(Some("agent-1".to_owned()), |_tx| {
    ///         Box::pin(async move {
    ///             // reads and writes through _tx
    ///             Ok(())
    ///         })
    ///     })
    ///     .await
    /// # }
    /// ```
    pub async fn try_transaction<R, F>(&self, owner: Option<String>, body: F) -> Result<R, ZoomError>
    where
        F: for<'t> FnMut(&'t mut Transaction) -> BoxFuture<'t, Result<R, ZoomError>>,
    {
        self.inner.ensure_open()?;
        track(retry::run(self, owner, body).await)
    }

    /// Live stream of one object's states.
    pub fn observable<T: Storable>(&self, id: &ObjId) -> Result<ObjectObservable<T>, ZoomError> {
        track(self.inner.ensure_open().and_then(|()| subscribe_object(&self.inner, id)))
    }

    /// Live stream of a class's membership.
    pub fn class_observable<T: Storable>(&self) -> Result<ClassObservable<T>, ZoomError> {
        track(self.inner.ensure_open().and_then(|()| subscribe_class(&self.inner)))
    }

    /// State-subsystem handle bound to this store's namespace.
    pub fn state(&self) -> ObjectState {
        ObjectState::new(self.inner.clone())
    }

    /// Stops the store: subsequent operations fail with
    /// `ServiceUnavailable`, the lock watcher stops and cached observables
    /// are evicted.
    pub fn stop(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.lock.stop();
        self.inner.observables.clear();
        info!("object store stopped");
    }

    async fn get_inner<T: Storable>(&self, id: &ObjId) -> Result<T, ZoomError> {
        self.inner.ensure_open()?;
        self.inner.registry.class(T::class_name())?;
        let path = self.inner.paths.object(T::class_name(), id);
        match self.inner.backend.get(&path).await {
            Ok(node) => Ok(decode::<T>(&node.data)?),
            Err(BackendError::NoNode { .. }) => {
                NotFoundSnafu { class: T::class_name(), id: id.clone() }.fail()
            },
            Err(err) => Err(backend_to_zoom(err)),
        }
    }

    async fn get_all_inner<T: Storable>(&self) -> Result<Vec<T>, ZoomError> {
        self.inner.ensure_open()?;
        self.inner.registry.class(T::class_name())?;
        let dir = self.inner.paths.class_dir(T::class_name());
        let names = match self.inner.backend.children(&dir).await {
            Ok(children) => children,
            // The class directory is created at build time; its absence is
            // an internal fault, not a user error.
            Err(BackendError::NoNode { .. }) => {
                return InternalObjectMapperSnafu {
                    message: format!("class directory {dir} is missing"),
                }
                .fail();
            },
            Err(err) => return Err(backend_to_zoom(err)),
        };
        let ids: Vec<ObjId> = names.into_iter().map(ObjId::from).collect();
        try_join_all(ids.iter().map(|id| self.get_inner::<T>(id))).await
    }

    async fn exists_inner<T: Storable>(&self, id: &ObjId) -> Result<bool, ZoomError> {
        self.inner.ensure_open()?;
        self.inner.registry.class(T::class_name())?;
        let path = self.inner.paths.object(T::class_name(), id);
        Ok(self.inner.backend.stat(&path).await.map_err(backend_to_zoom)?.is_some())
    }

    async fn multi_inner(&self, ops: Vec<PersistenceOp>) -> Result<(), ZoomError> {
        let mut tx = self.transaction(None).await?;
        for op in ops {
            if let Err(err) = tx.apply(op).await {
                tx.close().await;
                return Err(err);
            }
        }
        tx.commit().await
    }
}
