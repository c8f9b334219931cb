//! Observability metrics exposed via the `metrics` facade.
//!
//! ## Metric Naming Conventions
//!
//! All metrics follow the pattern: `zoom_{subsystem}_{name}_{unit}`
//!
//! - Counters: `_total` suffix
//! - Histograms: `_seconds` suffix

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use zoom_backend::{
    Backend, ChildrenWatch, CreateMode, CreatedNode, ExistsWatch, MultiFailure, MultiOp,
    MultiResult, NodeData, NodeStat, NodeWatch, Result as BackendResult,
};

// Error surface
const ERRORS_TOTAL: &str = "zoom_errors_total";

// Backend events
const BACKEND_OPS_TOTAL: &str = "zoom_backend_ops_total";
const BACKEND_OP_DURATION: &str = "zoom_backend_op_duration_seconds";

// Transactions
const TRANSACTIONS_TOTAL: &str = "zoom_transactions_total";
const TRANSACTION_COMMIT_DURATION: &str = "zoom_transaction_commit_duration_seconds";
const TRANSACTION_RETRIES_TOTAL: &str = "zoom_transaction_retries_total";

// Observables
const WATCHER_RECOVERIES_TOTAL: &str = "zoom_watcher_recoveries_total";

// Topology lock
const LOCK_ACQUISITIONS_TOTAL: &str = "zoom_lock_acquisitions_total";

/// Records a surfaced error by class.
#[inline]
pub(crate) fn record_error(kind: &'static str) {
    counter!(ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Records one backend operation with its latency.
#[inline]
pub(crate) fn record_backend_op(op: &'static str, started: Instant) {
    counter!(BACKEND_OPS_TOTAL, "op" => op).increment(1);
    histogram!(BACKEND_OP_DURATION, "op" => op).record(started.elapsed().as_secs_f64());
}

/// Records a transaction commit outcome with its latency.
#[inline]
pub(crate) fn record_commit(success: bool, started: Instant) {
    let status = if success { "success" } else { "error" };
    counter!(TRANSACTIONS_TOTAL, "status" => status).increment(1);
    histogram!(TRANSACTION_COMMIT_DURATION, "status" => status)
        .record(started.elapsed().as_secs_f64());
}

/// Records a transaction retry after a concurrent modification.
#[inline]
pub(crate) fn record_transaction_retry() {
    counter!(TRANSACTION_RETRIES_TOTAL).increment(1);
}

/// Records a transparent watcher re-creation.
#[inline]
pub(crate) fn record_watcher_recovery() {
    counter!(WATCHER_RECOVERIES_TOTAL).increment(1);
}

/// Records a lock acquisition by mode (`locked` or `lock_free`).
#[inline]
pub(crate) fn record_lock_acquisition(mode: &'static str) {
    counter!(LOCK_ACQUISITIONS_TOTAL, "mode" => mode).increment(1);
}

/// Backend wrapper recording a latency histogram per backend event type.
pub(crate) struct InstrumentedBackend {
    inner: Arc<dyn Backend>,
}

impl InstrumentedBackend {
    pub fn new(inner: Arc<dyn Backend>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Backend for InstrumentedBackend {
    async fn get(&self, path: &str) -> BackendResult<NodeData> {
        let started = Instant::now();
        let result = self.inner.get(path).await;
        record_backend_op("get", started);
        result
    }

    async fn stat(&self, path: &str) -> BackendResult<Option<NodeStat>> {
        let started = Instant::now();
        let result = self.inner.stat(path).await;
        record_backend_op("stat", started);
        result
    }

    async fn children(&self, path: &str) -> BackendResult<Vec<String>> {
        let started = Instant::now();
        let result = self.inner.children(path).await;
        record_backend_op("children", started);
        result
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> BackendResult<CreatedNode> {
        let started = Instant::now();
        let result = self.inner.create(path, data, mode).await;
        record_backend_op("create", started);
        result
    }

    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: i64,
    ) -> BackendResult<NodeStat> {
        let started = Instant::now();
        let result = self.inner.set_data(path, data, expected_version).await;
        record_backend_op("set_data", started);
        result
    }

    async fn delete(&self, path: &str, expected_version: i64) -> BackendResult<()> {
        let started = Instant::now();
        let result = self.inner.delete(path, expected_version).await;
        record_backend_op("delete", started);
        result
    }

    async fn multi(&self, ops: Vec<MultiOp>) -> Result<Vec<MultiResult>, MultiFailure> {
        let started = Instant::now();
        let result = self.inner.multi(ops).await;
        record_backend_op("multi", started);
        result
    }

    async fn watch_node(&self, path: &str) -> BackendResult<NodeWatch> {
        let started = Instant::now();
        let result = self.inner.watch_node(path).await;
        record_backend_op("watch_node", started);
        result
    }

    async fn watch_exists(&self, path: &str) -> BackendResult<ExistsWatch> {
        let started = Instant::now();
        let result = self.inner.watch_exists(path).await;
        record_backend_op("watch_exists", started);
        result
    }

    async fn watch_children(&self, path: &str) -> BackendResult<ChildrenWatch> {
        let started = Instant::now();
        let result = self.inner.watch_children(path).await;
        record_backend_op("watch_children", started);
        result
    }
}
