//! Read-through cached wrapper over a state storage.
//!
//! Wraps a baseline [`StateStorage`] with a snapshot map. Reads are served
//! from the snapshot once populated; observables emit the snapshot value
//! first and then defer to the live stream, so subscribers never see a gap
//! between the cached state and the first live emission.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use zoom_types::{ObjId, ZoomError};

use crate::state::{StateKey, StateStorage};

type SnapshotKey = (String, String, ObjId, String);

/// Caching [`StateStorage`] decorator.
#[derive(Clone)]
pub struct CachedStateStorage<S> {
    inner: S,
    snapshots: Arc<DashMap<SnapshotKey, StateKey>>,
}

impl<S: StateStorage> CachedStateStorage<S> {
    /// Wraps a baseline storage with an empty snapshot map.
    pub fn new(inner: S) -> Self {
        Self { inner, snapshots: Arc::new(DashMap::new()) }
    }

    fn snapshot_key(&self, namespace: &str, class: &str, id: &ObjId, key: &str) -> SnapshotKey {
        (namespace.to_owned(), class.to_owned(), id.clone(), key.to_owned())
    }

    /// Refreshes the own-namespace snapshot after a write.
    async fn refresh(&self, class: &str, id: &ObjId, key: &str) -> Result<(), ZoomError> {
        let namespace = self.inner.namespace().to_owned();
        let value = self.inner.get_key(&namespace, class, id, key).await?;
        self.snapshots.insert(self.snapshot_key(&namespace, class, id, key), value);
        Ok(())
    }
}

#[async_trait]
impl<S: StateStorage> StateStorage for CachedStateStorage<S> {
    fn namespace(&self) -> &str {
        self.inner.namespace()
    }

    async fn add_value(
        &self,
        class: &str,
        id: &ObjId,
        key: &str,
        value: &str,
    ) -> Result<(), ZoomError> {
        self.inner.add_value(class, id, key, value).await?;
        self.refresh(class, id, key).await
    }

    async fn remove_value(
        &self,
        class: &str,
        id: &ObjId,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), ZoomError> {
        self.inner.remove_value(class, id, key, value).await?;
        self.refresh(class, id, key).await
    }

    async fn get_key(
        &self,
        namespace: &str,
        class: &str,
        id: &ObjId,
        key: &str,
    ) -> Result<StateKey, ZoomError> {
        let snapshot_key = self.snapshot_key(namespace, class, id, key);
        if let Some(hit) = self.snapshots.get(&snapshot_key) {
            return Ok(hit.clone());
        }
        let value = self.inner.get_key(namespace, class, id, key).await?;
        self.snapshots.insert(snapshot_key, value.clone());
        Ok(value)
    }

    fn key_observable(
        &self,
        namespace: &str,
        class: &str,
        id: &ObjId,
        key: &str,
    ) -> BoxStream<'static, Result<StateKey, ZoomError>> {
        let snapshot_key = self.snapshot_key(namespace, class, id, key);
        let cached = self.snapshots.get(&snapshot_key).map(|hit| hit.clone());
        let snapshots = self.snapshots.clone();

        let live = self.inner.key_observable(namespace, class, id, key).inspect(move |item| {
            if let Ok(value) = item {
                snapshots.insert(snapshot_key.clone(), value.clone());
            }
        });

        futures::stream::iter(cached.into_iter().map(Ok))
            .chain(live)
            // The live stream's first emission usually repeats the cached
            // value; collapse consecutive duplicates.
            .scan(None::<StateKey>, |last, item| {
                let keep = match &item {
                    Ok(value) => {
                        if last.as_ref() == Some(value) {
                            false
                        } else {
                            *last = Some(value.clone());
                            true
                        }
                    },
                    Err(_) => true,
                };
                futures::future::ready(Some(keep.then_some(item)))
            })
            .filter_map(futures::future::ready)
            .boxed()
    }
}
