//! Retry wrapper for lock-guarded transactions.
//!
//! Retries use the `backon` crate with exponential backoff and jitter. The
//! body runs inside a fresh transaction per attempt, under the topology
//! lock; only a failure whose cause chain signals a concurrent modification
//! is retried, everything else propagates immediately.

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::debug;
use zoom_types::ZoomError;

use crate::metrics;
use crate::store::ZoomStore;
use crate::transaction::Transaction;

const RETRY_MIN_DELAY: Duration = Duration::from_millis(10);
const RETRY_MAX_DELAY: Duration = Duration::from_millis(250);

pub(crate) async fn run<R, F>(
    store: &ZoomStore,
    owner: Option<String>,
    body: F,
) -> Result<R, ZoomError>
where
    F: for<'t> FnMut(&'t mut Transaction) -> BoxFuture<'t, Result<R, ZoomError>>,
{
    // backon's max_times is the number of retries, not total attempts.
    let max_retries = store.inner().config.transaction_attempts.saturating_sub(1) as usize;
    let backoff = ExponentialBuilder::new()
        .with_min_delay(RETRY_MIN_DELAY)
        .with_max_delay(RETRY_MAX_DELAY)
        .with_jitter()
        .with_max_times(max_retries);

    // Each attempt's future must be self-contained, so the body is handed
    // from attempt to attempt behind a lock.
    let body = Arc::new(Mutex::new(body));

    let attempt = || {
        let store = store.clone();
        let owner = owner.clone();
        let body = body.clone();
        async move {
            let guard = store.inner().lock.acquire().await?;
            let result = async {
                let mut tx = store.transaction(owner).await?;
                let outcome = {
                    let mut body = body.lock().await;
                    (*body)(&mut tx).await
                };
                match outcome {
                    Ok(value) => {
                        tx.commit().await?;
                        Ok(value)
                    },
                    Err(err) => {
                        tx.close().await;
                        Err(err)
                    },
                }
            }
            .await;
            guard.release().await;
            result
        }
    };

    attempt
        .retry(backoff)
        .sleep(tokio::time::sleep)
        .when(|err: &ZoomError| err.is_concurrent_modification())
        .notify(|err: &ZoomError, delay: Duration| {
            metrics::record_transaction_retry();
            debug!(
                backoff_ms = delay.as_millis() as u64,
                %err,
                "retrying transaction after concurrent modification"
            );
        })
        .await
}
