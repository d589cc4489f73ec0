//! The quorum executor: fan a batch of keys out to their replicas and
//! account per-key success against the replication strategy's thresholds.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use observability_deps::tracing::debug;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::desc::InstanceDesc;
use crate::{Error, Operation, Ring};

/// Errors returned by [`do_batch`].
#[derive(Debug, thiserror::Error)]
pub enum BatchError<E> {
    /// A replica set could not be derived for one of the keys.
    #[error(transparent)]
    Ring(Error),

    /// A key exceeded its failure tolerance. Carries the first error
    /// observed for that key.
    #[error("quorum failed: {0}")]
    QuorumFailed(Arc<E>),

    /// The batch was cancelled (or every callback was lost) before all keys
    /// reached a verdict.
    #[error("batch aborted before reaching quorum")]
    Aborted,
}

/// Per-key success/failure accounting.
#[derive(Debug)]
struct ItemTracker<E> {
    min_success: usize,
    max_failures: usize,
    succeeded: usize,
    failed: usize,
    first_error: Option<Arc<E>>,
    decided: bool,
}

/// Execute `callback` against every replica of every key in `keys`,
/// resolving success per key once its quorum threshold is met.
///
/// Keys are grouped by owning instance - `callback` is invoked once per
/// instance, with the subset of keys routed to it - and all invocations run
/// concurrently. The batch:
///
/// * succeeds once every key reached `required_success` acknowledgements;
/// * fails the moment any key collected more than `max_errors` failures,
///   with that key's *first* error;
/// * aborts when `shutdown` is cancelled before a verdict.
///
/// `cleanup` runs exactly once, after every callback invocation has
/// returned - even when the batch call itself returned early. No ordering
/// between callbacks is promised, and callers must tolerate partial
/// application on failure.
pub async fn do_batch<F, Fut, C, E>(
    shutdown: CancellationToken,
    ring: &Ring,
    op: Operation,
    keys: &[u32],
    callback: F,
    cleanup: C,
) -> Result<(), BatchError<E>>
where
    F: Fn(InstanceDesc, Vec<u32>) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = Result<(), E>> + Send + 'static,
    C: FnOnce() + Send + 'static,
    E: std::fmt::Display + Send + Sync + 'static,
{
    if keys.is_empty() {
        cleanup();
        return Ok(());
    }

    // Resolve every key against one consistent ring snapshot.
    let sets = ring.batch_get(keys, op).map_err(BatchError::Ring)?;

    let mut trackers = sets
        .iter()
        .map(|s| ItemTracker::<E> {
            min_success: s.required_success(),
            max_failures: s.max_errors,
            succeeded: 0,
            failed: 0,
            first_error: None,
            decided: false,
        })
        .collect::<Vec<_>>();

    // Group keys by owning instance; the advertised address identifies an
    // instance across the replica sets of different keys.
    let mut jobs: HashMap<String, (InstanceDesc, Vec<usize>)> = HashMap::new();
    for (key_idx, set) in sets.iter().enumerate() {
        for instance in &set.instances {
            jobs.entry(instance.addr.clone())
                .or_insert_with(|| (instance.clone(), Vec::new()))
                .1
                .push(key_idx);
        }
    }

    debug!(
        keys = keys.len(),
        instances = jobs.len(),
        "executing quorum batch"
    );

    let (tx, mut rx) = mpsc::channel(jobs.len().max(1));
    let mut handles = Vec::with_capacity(jobs.len());
    for (instance, key_idxs) in jobs.into_values() {
        let callback = callback.clone();
        let tx = tx.clone();
        let shutdown = shutdown.clone();
        let instance_keys = key_idxs.iter().map(|i| keys[*i]).collect::<Vec<_>>();

        handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                res = callback(instance, instance_keys) => {
                    let _ = tx.send((key_idxs, res.map_err(Arc::new))).await;
                }
            }
        }));
    }
    drop(tx);

    // The cleanup contract outlives this future: it fires after every
    // callback returned, regardless of how early the batch resolved.
    tokio::spawn(async move {
        join_all(handles).await;
        cleanup();
    });

    let mut undecided = trackers.len();
    while undecided > 0 {
        let (key_idxs, result) = match rx.recv().await {
            Some(v) => v,
            // All senders gone: cancelled, or a callback task panicked.
            None => return Err(BatchError::Aborted),
        };

        for idx in key_idxs {
            let tracker = &mut trackers[idx];
            if tracker.decided {
                continue;
            }

            match &result {
                Ok(()) => {
                    tracker.succeeded += 1;
                    if tracker.succeeded >= tracker.min_success {
                        tracker.decided = true;
                        undecided -= 1;
                    }
                }
                Err(e) => {
                    tracker.failed += 1;
                    if tracker.first_error.is_none() {
                        tracker.first_error = Some(Arc::clone(e));
                    }
                    if tracker.failed > tracker.max_failures {
                        return Err(BatchError::QuorumFailed(
                            tracker.first_error.take().expect("first error recorded"),
                        ));
                    }
                }
            }
        }
    }

    Ok(())
}
