//! State subsystem: per-namespace state keys attached to objects.
//!
//! State values live beside the object store under
//! `state/<namespace>/<Class>/<id>/<key>`. Single-value keys hold their
//! value in the key node and are last-write-wins; multi-value keys store
//! each value as a child node. Writes always target the store's own
//! namespace; reads and observations may name any namespace.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use zoom_backend::{ANY_VERSION, BackendError, CreateMode, ExistsEvent, NodeEvent};
use zoom_types::error::InternalObjectMapperSnafu;
use zoom_types::{ObjId, ZoomError};

use crate::metrics;
use crate::registry::KeyType;
use crate::store::{StoreInner, backend_to_zoom};

const RECOVERY_DELAY: Duration = Duration::from_millis(50);
const OBSERVABLE_BUFFER: usize = 16;

/// The value set of one state key in one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateKey {
    /// A single-value key: absent or holding one value.
    SingleValue {
        /// Key name.
        key: String,
        /// Current value, if set.
        value: Option<String>,
    },
    /// A multi-value key holding a set of values.
    MultiValue {
        /// Key name.
        key: String,
        /// Current values.
        values: BTreeSet<String>,
    },
}

impl StateKey {
    /// The key name.
    pub fn key(&self) -> &str {
        match self {
            Self::SingleValue { key, .. } | Self::MultiValue { key, .. } => key,
        }
    }

    /// Whether the key currently holds no value.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::SingleValue { value, .. } => value.is_none(),
            Self::MultiValue { values, .. } => values.is_empty(),
        }
    }
}

/// Read/write/observe access to per-object state keys.
#[async_trait]
pub trait StateStorage: Send + Sync + 'static {
    /// The namespace this handle writes to.
    fn namespace(&self) -> &str;

    /// Adds a value under the store's own namespace. For a single-value key
    /// this replaces any previous value.
    async fn add_value(
        &self,
        class: &str,
        id: &ObjId,
        key: &str,
        value: &str,
    ) -> Result<(), ZoomError>;

    /// Removes a value under the store's own namespace. `value` is required
    /// for multi-value keys and ignored for single-value keys. Removing an
    /// absent value is a no-op.
    async fn remove_value(
        &self,
        class: &str,
        id: &ObjId,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), ZoomError>;

    /// Reads a key's current value set from any namespace. A missing key
    /// yields an empty value set.
    async fn get_key(
        &self,
        namespace: &str,
        class: &str,
        id: &ObjId,
        key: &str,
    ) -> Result<StateKey, ZoomError>;

    /// Observes a key: emits the current value set and every subsequent
    /// change. A missing namespace, class or id completes immediately; a
    /// missing key emits an empty value set and keeps watching.
    fn key_observable(
        &self,
        namespace: &str,
        class: &str,
        id: &ObjId,
        key: &str,
    ) -> BoxStream<'static, Result<StateKey, ZoomError>>;

    /// Observes a key across a stream of namespaces, switching to whichever
    /// namespace was emitted last. Emitting `None` unsubscribes from the
    /// previous namespace without subscribing to a new one.
    fn key_observable_switch(
        &self,
        namespaces: BoxStream<'static, Option<String>>,
        class: &str,
        id: &ObjId,
        key: &str,
    ) -> BoxStream<'static, Result<StateKey, ZoomError>>
    where
        Self: Clone + Sized,
    {
        let this = self.clone();
        let class = class.to_owned();
        let id = id.clone();
        let key = key.to_owned();
        let (tx, rx) = mpsc::channel(OBSERVABLE_BUFFER);
        tokio::spawn(async move {
            let mut namespaces = namespaces;
            let mut forward: Option<tokio::task::JoinHandle<()>> = None;
            while let Some(namespace) = namespaces.next().await {
                if let Some(task) = forward.take() {
                    task.abort();
                }
                if let Some(namespace) = namespace {
                    let mut stream = this.key_observable(&namespace, &class, &id, &key);
                    let tx = tx.clone();
                    forward = Some(tokio::spawn(async move {
                        while let Some(item) = stream.next().await {
                            if tx.send(item).await.is_err() {
                                return;
                            }
                        }
                    }));
                }
            }
            // The namespace stream finished; the current subscription, if
            // any, runs on until it completes.
            if let Some(task) = forward {
                let _ = task.await;
            }
        });
        ReceiverStream::new(rx).boxed()
    }
}

/// [`StateStorage`] implementation backed by the store's coordination
/// service.
#[derive(Clone)]
pub struct ObjectState {
    inner: Arc<StoreInner>,
}

impl ObjectState {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    /// Creates the namespace/class/id chain (and the key node for
    /// multi-value keys) if missing.
    async fn ensure_parents(
        &self,
        class: &str,
        id: &ObjId,
        key_node: Option<&str>,
    ) -> Result<(), ZoomError> {
        let namespace = self.namespace();
        let mut dirs = vec![
            self.inner.paths.state_namespace(namespace),
            self.inner.paths.state_class(namespace, class),
            self.inner.paths.state_object(namespace, class, id),
        ];
        if let Some(key) = key_node {
            dirs.push(self.inner.paths.state_key(namespace, class, id, key));
        }
        for dir in dirs {
            match self.inner.backend.create(&dir, Vec::new(), CreateMode::Persistent).await {
                Ok(_) | Err(BackendError::NodeExists { .. }) => {},
                Err(err) => return Err(backend_to_zoom(err)),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StateStorage for ObjectState {
    fn namespace(&self) -> &str {
        &self.inner.config.namespace
    }

    async fn add_value(
        &self,
        class: &str,
        id: &ObjId,
        key: &str,
        value: &str,
    ) -> Result<(), ZoomError> {
        self.inner.ensure_open()?;
        let key_type = self.inner.registry.key_type(class, key)?;
        let namespace = self.namespace().to_owned();
        match key_type {
            KeyType::SingleLastWriteWins => {
                self.ensure_parents(class, id, None).await?;
                let path = self.inner.paths.state_key(&namespace, class, id, key);
                let data = value.as_bytes().to_vec();
                match self.inner.backend.create(&path, data.clone(), CreateMode::Persistent).await
                {
                    Ok(_) => Ok(()),
                    Err(BackendError::NodeExists { .. }) => {
                        self.inner
                            .backend
                            .set_data(&path, data, ANY_VERSION)
                            .await
                            .map_err(backend_to_zoom)?;
                        Ok(())
                    },
                    Err(err) => Err(backend_to_zoom(err)),
                }
            },
            KeyType::Multiple => {
                if value.is_empty() || value.contains('/') {
                    return InternalObjectMapperSnafu {
                        message: format!(
                            "value {value:?} cannot be stored under multi-value key {key}"
                        ),
                    }
                    .fail();
                }
                self.ensure_parents(class, id, Some(key)).await?;
                let path = self.inner.paths.state_value(&namespace, class, id, key, value);
                match self.inner.backend.create(&path, Vec::new(), CreateMode::Persistent).await {
                    Ok(_) | Err(BackendError::NodeExists { .. }) => Ok(()),
                    Err(err) => Err(backend_to_zoom(err)),
                }
            },
        }
    }

    async fn remove_value(
        &self,
        class: &str,
        id: &ObjId,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), ZoomError> {
        self.inner.ensure_open()?;
        let key_type = self.inner.registry.key_type(class, key)?;
        let namespace = self.namespace().to_owned();
        let path = match key_type {
            KeyType::SingleLastWriteWins => self.inner.paths.state_key(&namespace, class, id, key),
            KeyType::Multiple => {
                let Some(value) = value else {
                    return InternalObjectMapperSnafu {
                        message: format!("removing from multi-value key {key} requires a value"),
                    }
                    .fail();
                };
                self.inner.paths.state_value(&namespace, class, id, key, value)
            },
        };
        match self.inner.backend.delete(&path, ANY_VERSION).await {
            Ok(()) | Err(BackendError::NoNode { .. }) => Ok(()),
            Err(err) => Err(backend_to_zoom(err)),
        }
    }

    async fn get_key(
        &self,
        namespace: &str,
        class: &str,
        id: &ObjId,
        key: &str,
    ) -> Result<StateKey, ZoomError> {
        self.inner.ensure_open()?;
        let key_type = self.inner.registry.key_type(class, key)?;
        let path = self.inner.paths.state_key(namespace, class, id, key);
        match key_type {
            KeyType::SingleLastWriteWins => match self.inner.backend.get(&path).await {
                Ok(node) => Ok(single_value(key, node.data)?),
                Err(BackendError::NoNode { .. }) => {
                    Ok(StateKey::SingleValue { key: key.to_owned(), value: None })
                },
                Err(err) => Err(backend_to_zoom(err)),
            },
            KeyType::Multiple => match self.inner.backend.children(&path).await {
                Ok(values) => Ok(StateKey::MultiValue {
                    key: key.to_owned(),
                    values: values.into_iter().collect(),
                }),
                Err(BackendError::NoNode { .. }) => {
                    Ok(StateKey::MultiValue { key: key.to_owned(), values: BTreeSet::new() })
                },
                Err(err) => Err(backend_to_zoom(err)),
            },
        }
    }

    fn key_observable(
        &self,
        namespace: &str,
        class: &str,
        id: &ObjId,
        key: &str,
    ) -> BoxStream<'static, Result<StateKey, ZoomError>> {
        let inner = self.inner.clone();
        let namespace = namespace.to_owned();
        let class = class.to_owned();
        let id = id.clone();
        let key = key.to_owned();
        let (tx, rx) = mpsc::channel(OBSERVABLE_BUFFER);
        tokio::spawn(async move {
            drive_key_observable(inner, namespace, class, id, key, tx).await;
        });
        ReceiverStream::new(rx).boxed()
    }
}

fn single_value(key: &str, data: Vec<u8>) -> Result<StateKey, ZoomError> {
    let value = String::from_utf8(data).map_err(|_| {
        InternalObjectMapperSnafu { message: format!("state key {key} holds non-UTF-8 data") }
            .build()
    })?;
    Ok(StateKey::SingleValue { key: key.to_owned(), value: Some(value) })
}

async fn drive_key_observable(
    inner: Arc<StoreInner>,
    namespace: String,
    class: String,
    id: ObjId,
    key: String,
    tx: mpsc::Sender<Result<StateKey, ZoomError>>,
) {
    let key_type = match inner.registry.key_type(&class, &key) {
        Ok(key_type) => key_type,
        Err(err) => {
            let _ = tx.send(Err(err)).await;
            return;
        },
    };

    // A missing namespace, class or id completes the stream immediately.
    let object_dir = inner.paths.state_object(&namespace, &class, &id);
    match inner.backend.stat(&object_dir).await {
        Ok(Some(_)) => {},
        Ok(None) => return,
        Err(err) => {
            let _ = tx.send(Err(backend_to_zoom(err))).await;
            return;
        },
    }

    let key_path = inner.paths.state_key(&namespace, &class, &id, &key);
    let mut last_sent: Option<StateKey> = None;

    loop {
        if inner.is_closed() || tx.is_closed() {
            return;
        }
        let outcome = match key_type {
            KeyType::SingleLastWriteWins => {
                watch_single(&inner, &key_path, &key, &tx, &mut last_sent).await
            },
            KeyType::Multiple => watch_multi(&inner, &key_path, &key, &tx, &mut last_sent).await,
        };
        match outcome {
            WatchOutcome::Reattach => {},
            WatchOutcome::KeyMissing => {
                if !wait_for_creation(&inner, &key_path, &tx).await {
                    return;
                }
            },
            WatchOutcome::Finished => return,
        }
    }
}

enum WatchOutcome {
    /// The watch ended (interruption or key deletion); attach again.
    Reattach,
    /// The key node does not exist yet.
    KeyMissing,
    /// The stream is over (closed backend, dropped subscriber, error).
    Finished,
}

async fn watch_single(
    inner: &Arc<StoreInner>,
    key_path: &str,
    key: &str,
    tx: &mpsc::Sender<Result<StateKey, ZoomError>>,
    last_sent: &mut Option<StateKey>,
) -> WatchOutcome {
    match inner.backend.watch_node(key_path).await {
        Ok(watch) => {
            match single_value(key, watch.initial.data) {
                Ok(value) => {
                    if !send_if_changed(tx, last_sent, value).await {
                        return WatchOutcome::Finished;
                    }
                },
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return WatchOutcome::Finished;
                },
            }
            let mut events = watch.events;
            while let Some(event) = events.next().await {
                let value = match event {
                    NodeEvent::Data(node) => match single_value(key, node.data) {
                        Ok(value) => value,
                        Err(err) => {
                            let _ = tx.send(Err(err)).await;
                            return WatchOutcome::Finished;
                        },
                    },
                    NodeEvent::Deleted => {
                        // The value was removed; report the empty set and
                        // wait for the key to reappear.
                        let empty = StateKey::SingleValue { key: key.to_owned(), value: None };
                        if !send_if_changed(tx, last_sent, empty).await {
                            return WatchOutcome::Finished;
                        }
                        return WatchOutcome::KeyMissing;
                    },
                };
                if !send_if_changed(tx, last_sent, value).await {
                    return WatchOutcome::Finished;
                }
            }
            metrics::record_watcher_recovery();
            WatchOutcome::Reattach
        },
        Err(BackendError::NoNode { .. }) => {
            let empty = StateKey::SingleValue { key: key.to_owned(), value: None };
            if !send_if_changed(tx, last_sent, empty).await {
                return WatchOutcome::Finished;
            }
            WatchOutcome::KeyMissing
        },
        Err(BackendError::Closed) => WatchOutcome::Finished,
        Err(err) if err.is_transient() => {
            metrics::record_watcher_recovery();
            tokio::time::sleep(RECOVERY_DELAY).await;
            WatchOutcome::Reattach
        },
        Err(err) => {
            let _ = tx.send(Err(backend_to_zoom(err))).await;
            WatchOutcome::Finished
        },
    }
}

async fn watch_multi(
    inner: &Arc<StoreInner>,
    key_path: &str,
    key: &str,
    tx: &mpsc::Sender<Result<StateKey, ZoomError>>,
    last_sent: &mut Option<StateKey>,
) -> WatchOutcome {
    match inner.backend.watch_children(key_path).await {
        Ok(watch) => {
            let value = multi_value(key, watch.initial);
            if !send_if_changed(tx, last_sent, value).await {
                return WatchOutcome::Finished;
            }
            let mut events = watch.events;
            while let Some(listing) = events.next().await {
                if !send_if_changed(tx, last_sent, multi_value(key, listing)).await {
                    return WatchOutcome::Finished;
                }
            }
            metrics::record_watcher_recovery();
            WatchOutcome::Reattach
        },
        Err(BackendError::NoNode { .. }) => {
            let empty = StateKey::MultiValue { key: key.to_owned(), values: BTreeSet::new() };
            if !send_if_changed(tx, last_sent, empty).await {
                return WatchOutcome::Finished;
            }
            WatchOutcome::KeyMissing
        },
        Err(BackendError::Closed) => WatchOutcome::Finished,
        Err(err) if err.is_transient() => {
            metrics::record_watcher_recovery();
            tokio::time::sleep(RECOVERY_DELAY).await;
            WatchOutcome::Reattach
        },
        Err(err) => {
            let _ = tx.send(Err(backend_to_zoom(err))).await;
            WatchOutcome::Finished
        },
    }
}

fn multi_value(key: &str, values: Vec<String>) -> StateKey {
    StateKey::MultiValue { key: key.to_owned(), values: values.into_iter().collect() }
}

/// Waits until the key node appears. Returns false when the stream is over.
async fn wait_for_creation(
    inner: &Arc<StoreInner>,
    path: &str,
    tx: &mpsc::Sender<Result<StateKey, ZoomError>>,
) -> bool {
    loop {
        if inner.is_closed() || tx.is_closed() {
            return false;
        }
        match inner.backend.watch_exists(path).await {
            Ok(watch) => {
                if watch.initial.is_some() {
                    return true;
                }
                let mut events = watch.events;
                while let Some(event) = events.next().await {
                    if matches!(event, ExistsEvent::Created) {
                        return true;
                    }
                }
                metrics::record_watcher_recovery();
            },
            Err(BackendError::Closed) => return false,
            Err(err) if err.is_transient() => {
                metrics::record_watcher_recovery();
                tokio::time::sleep(RECOVERY_DELAY).await;
            },
            Err(err) => {
                let _ = tx.send(Err(backend_to_zoom(err))).await;
                return false;
            },
        }
    }
}

async fn send_if_changed(
    tx: &mpsc::Sender<Result<StateKey, ZoomError>>,
    last_sent: &mut Option<StateKey>,
    value: StateKey,
) -> bool {
    if last_sent.as_ref() == Some(&value) {
        return !tx.is_closed();
    }
    *last_sent = Some(value.clone());
    tx.send(Ok(value)).await.is_ok()
}
