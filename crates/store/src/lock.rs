//! Coarse topology lock over the coordination service.
//!
//! The lock is a semaphore mutex at a well-known node: acquirers create
//! ephemeral sequential children and the lowest sequence holds the lock. A
//! watcher monitors the lock node's existence; deleting the node switches
//! the store to lock-free mode, which lets operators disable coarse locking
//! at runtime. The watcher task is the only writer of the mode flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use zoom_backend::{ANY_VERSION, Backend, BackendError, CreateMode, ExistsEvent};
use zoom_types::ZoomError;
use zoom_types::error::StorageFailureSnafu;

use crate::metrics;
use crate::store::backend_to_zoom;

const WATCHER_RETRY_DELAY: Duration = Duration::from_millis(50);

pub(crate) struct TopologyLock {
    backend: Arc<dyn Backend>,
    path: String,
    timeout: Duration,
    enabled: Arc<AtomicBool>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl TopologyLock {
    /// Creates the lock handle and spawns the existence watcher.
    pub async fn start(
        backend: Arc<dyn Backend>,
        path: String,
        timeout: Duration,
    ) -> Result<Self, ZoomError> {
        let present = backend.stat(&path).await.map_err(backend_to_zoom)?.is_some();
        let enabled = Arc::new(AtomicBool::new(present));

        let watcher = tokio::spawn(watch_lock_node(backend.clone(), path.clone(), enabled.clone()));
        Ok(Self { backend, path, timeout, enabled, watcher: Mutex::new(Some(watcher)) })
    }

    /// Whether the lock node currently exists.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Acquires the lock, or returns immediately in lock-free mode.
    ///
    /// # Errors
    ///
    /// Returns `ZoomError::StorageFailure` when the configured timeout
    /// elapses before the lock is granted.
    pub async fn acquire(&self) -> Result<TopologyGuard, ZoomError> {
        if !self.is_enabled() {
            metrics::record_lock_acquisition("lock_free");
            return Ok(TopologyGuard::unlocked());
        }

        let waiter_prefix = format!("{}/waiter-", self.path);
        let waiter = match self
            .backend
            .create(&waiter_prefix, Vec::new(), CreateMode::EphemeralSequential)
            .await
        {
            Ok(created) => created,
            // The lock node disappeared: locking was just disabled.
            Err(BackendError::NoNode { .. }) => {
                metrics::record_lock_acquisition("lock_free");
                return Ok(TopologyGuard::unlocked());
            },
            Err(err) => return Err(backend_to_zoom(err)),
        };
        let my_name = waiter.path.rsplit('/').next().unwrap_or_default().to_owned();

        match tokio::time::timeout(self.timeout, self.wait_for_grant(&my_name)).await {
            Ok(Ok(true)) => {
                debug!(waiter = %waiter.path, "acquired topology lock");
                metrics::record_lock_acquisition("locked");
                Ok(TopologyGuard::locked(self.backend.clone(), waiter.path))
            },
            Ok(Ok(false)) => {
                // Locking was disabled while we waited.
                self.abandon_waiter(&waiter.path).await;
                metrics::record_lock_acquisition("lock_free");
                Ok(TopologyGuard::unlocked())
            },
            Ok(Err(err)) => {
                self.abandon_waiter(&waiter.path).await;
                Err(err)
            },
            Err(_) => {
                // Leaving the waiter behind would block the queue forever.
                self.abandon_waiter(&waiter.path).await;
                StorageFailureSnafu {
                    message: format!("timed out waiting for the topology lock at {}", self.path),
                }
                .fail()
            },
        }
    }

    /// Waits until our waiter heads the queue. Returns `false` when the
    /// lock node vanished, meaning locking was disabled.
    async fn wait_for_grant(&self, my_name: &str) -> Result<bool, ZoomError> {
        loop {
            let watch = match self.backend.watch_children(&self.path).await {
                Ok(watch) => watch,
                Err(BackendError::NoNode { .. }) => return Ok(false),
                Err(err) => return Err(backend_to_zoom(err)),
            };
            if holds_lock(&watch.initial, my_name) {
                return Ok(true);
            }
            let mut events = watch.events;
            while let Some(listing) = events.next().await {
                if holds_lock(&listing, my_name) {
                    return Ok(true);
                }
            }
            // The watch was interrupted; re-examine the queue.
            metrics::record_watcher_recovery();
        }
    }

    async fn abandon_waiter(&self, waiter: &str) {
        match self.backend.delete(waiter, ANY_VERSION).await {
            Ok(()) | Err(BackendError::NoNode { .. }) => {},
            Err(err) => warn!(%waiter, %err, "failed to remove abandoned lock waiter"),
        }
    }

    /// Stops the existence watcher.
    pub fn stop(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
    }
}

/// The queue head holds the lock.
fn holds_lock(listing: &[String], my_name: &str) -> bool {
    listing.iter().min().is_some_and(|lowest| lowest == my_name)
}

async fn watch_lock_node(backend: Arc<dyn Backend>, path: String, enabled: Arc<AtomicBool>) {
    loop {
        let watch = match backend.watch_exists(&path).await {
            Ok(watch) => watch,
            Err(BackendError::Closed) => return,
            Err(err) => {
                debug!(%err, "topology lock watcher failed; retrying");
                tokio::time::sleep(WATCHER_RETRY_DELAY).await;
                continue;
            },
        };
        set_mode(&enabled, watch.initial.is_some(), &path);
        let mut events = watch.events;
        while let Some(event) = events.next().await {
            match event {
                ExistsEvent::Created => set_mode(&enabled, true, &path),
                ExistsEvent::Deleted => set_mode(&enabled, false, &path),
            }
        }
        // The watch was interrupted; re-subscribe and re-read the state.
        metrics::record_watcher_recovery();
    }
}

fn set_mode(enabled: &AtomicBool, value: bool, path: &str) {
    let previous = enabled.swap(value, Ordering::SeqCst);
    if previous != value {
        if value {
            debug!(path, "topology lock enabled");
        } else {
            warn!(path, "topology lock node removed; switching to lock-free mode");
        }
    }
}

/// Holds the acquired lock until released. In lock-free mode the guard is
/// empty and release is a no-op.
pub(crate) struct TopologyGuard {
    backend: Option<Arc<dyn Backend>>,
    waiter: Option<String>,
}

impl std::fmt::Debug for TopologyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyGuard")
            .field("locked", &self.backend.is_some())
            .field("waiter", &self.waiter)
            .finish()
    }
}

impl TopologyGuard {
    fn unlocked() -> Self {
        Self { backend: None, waiter: None }
    }

    fn locked(backend: Arc<dyn Backend>, waiter: String) -> Self {
        Self { backend: Some(backend), waiter: Some(waiter) }
    }

    /// Deletes the waiter node, passing the lock to the next in queue.
    pub async fn release(mut self) {
        let (Some(backend), Some(waiter)) = (self.backend.take(), self.waiter.take()) else {
            return;
        };
        match backend.delete(&waiter, ANY_VERSION).await {
            Ok(()) | Err(BackendError::NoNode { .. }) => {},
            Err(err) => warn!(%waiter, %err, "failed to release topology lock"),
        }
    }
}

impl Drop for TopologyGuard {
    fn drop(&mut self) {
        if let (Some(backend), Some(waiter)) = (self.backend.take(), self.waiter.take()) {
            warn!(%waiter, "topology lock guard dropped without release");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = backend.delete(&waiter, ANY_VERSION).await;
                });
            }
        }
    }
}
