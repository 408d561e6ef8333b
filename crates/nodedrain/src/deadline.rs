//! DeadlineHeap: coalesces per-node drain deadlines into batches.
//!
//! When the earliest pending deadline fires, every node whose deadline
//! falls within the coalesce window after it is delivered in the same
//! batch, ordered by deadline then node id. A node is delivered at most
//! once per [`DeadlineNotifier::watch`] call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nodedrain_state::NodeId;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sink for node deadlines. Both calls are synchronous and idempotent.
pub trait DeadlineNotifier: Send + Sync {
    /// Track (or re-arm) `node_id` to fire at `deadline`.
    fn watch(&self, node_id: &str, deadline: Instant);
    /// Stop tracking `node_id`.
    fn remove(&self, node_id: &str);
}

pub struct DeadlineHeap {
    deadlines: Mutex<HashMap<NodeId, Instant>>,
    changed: Notify,
    coalesce_window: Duration,
}

impl DeadlineHeap {
    /// Start the heap's timer task. Batches are delivered on the returned
    /// receiver until `cancel` fires.
    pub fn spawn(
        coalesce_window: Duration,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<NodeId>>, JoinHandle<()>) {
        let heap = Arc::new(Self {
            deadlines: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            coalesce_window,
        });
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(heap.clone().run(tx, cancel));
        (heap, rx, handle)
    }

    /// Number of nodes with a pending deadline.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<NodeId, Instant>> {
        self.deadlines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self: Arc<Self>, tx: mpsc::Sender<Vec<NodeId>>, cancel: CancellationToken) {
        loop {
            let next = self.lock().values().min().copied();
            let wake = next.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.changed.notified() => continue,
                _ = tokio::time::sleep_until(wake), if next.is_some() => {}
            }

            let batch = take_batch(&mut self.lock(), Instant::now(), self.coalesce_window);
            if batch.is_empty() {
                continue;
            }
            debug!(nodes = batch.len(), "node drain deadlines reached");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = tx.send(batch) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("deadline heap stopped");
    }
}

impl DeadlineNotifier for DeadlineHeap {
    fn watch(&self, node_id: &str, deadline: Instant) {
        let previous = self.lock().insert(node_id.to_string(), deadline);
        if previous != Some(deadline) {
            self.changed.notify_one();
        }
    }

    fn remove(&self, node_id: &str) {
        if self.lock().remove(node_id).is_some() {
            self.changed.notify_one();
        }
    }
}

/// Remove and return the batch that is due at `now`: nothing if the
/// earliest deadline is still in the future, otherwise every id whose
/// deadline is within `window` of the earliest, ordered by deadline then id.
/// A window reaching past the clock's range takes every pending id.
pub fn take_batch(
    deadlines: &mut HashMap<NodeId, Instant>,
    now: Instant,
    window: Duration,
) -> Vec<NodeId> {
    let Some(earliest) = deadlines.values().min().copied() else {
        return Vec::new();
    };
    if earliest > now {
        return Vec::new();
    }
    let cutoff = earliest.checked_add(window);
    let mut due: Vec<(Instant, NodeId)> = deadlines
        .iter()
        .filter(|(_, deadline)| cutoff.is_none_or(|cutoff| **deadline <= cutoff))
        .map(|(id, deadline)| (*deadline, id.clone()))
        .collect();
    due.sort();
    for (_, id) in &due {
        deadlines.remove(id);
    }
    due.into_iter().map(|(_, id)| id).collect()
}
