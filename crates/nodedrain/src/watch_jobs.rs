//! DrainingJobWatcher: decides which allocations of tracked jobs to migrate.
//!
//! The watcher follows every job with work on a draining node. Each pass it
//! reads the jobs' allocations and, per task group, works out which ones
//! may be marked for migration without breaking the group's `max_parallel`
//! budget. Decisions leave on the drain stream as a [`DrainRequest`]; the
//! watcher waits for that request to commit before reading state again.
//! Allocations that finished on a draining node since the previous pass
//! leave on the migrated stream.
//!
//! # Scopes
//!
//! ```text
//! outer scope (drainer lifetime)
//!   └── query scope (replaced whenever the tracked set grows)
//! ```
//!
//! Cancelling the query scope only restarts the blocking query; cancelling
//! the outer scope stops the watcher.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nodedrain_state::{
    Allocation, Job, JobType, NamespacedId, NodeId, StateResult, StateSnapshot, StateStore, Table,
    TaskGroup,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::error::DrainResult;
use crate::future::BatchFuture;
use crate::limiter::RateLimiter;
use crate::registry::JobRegistrar;

/// Allocations to mark for migration, and the handle the caller completes
/// once the marking has committed.
#[derive(Debug)]
pub struct DrainRequest {
    pub allocs: Vec<Allocation>,
    pub resp: BatchFuture,
}

/// Outcome of one task group (or, merged, one job) for a single pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DrainDecision {
    /// Allocations to mark for migration now.
    pub drain: Vec<Allocation>,
    /// Allocations that became terminal on a draining node since the last pass.
    pub migrated: Vec<Allocation>,
    /// No non-terminal allocation remains on a draining node.
    pub done: bool,
}

impl DrainDecision {
    fn merge(&mut self, other: DrainDecision) {
        self.drain.extend(other.drain);
        self.migrated.extend(other.migrated);
        self.done &= other.done;
    }
}

struct TrackedJobs {
    jobs: BTreeSet<NamespacedId>,
    query_scope: CancellationToken,
    /// Set when jobs were added since the watcher last read the set.
    grown: bool,
}

pub struct DrainingJobWatcher {
    store: StateStore,
    limiter: Arc<RateLimiter>,
    state_read_error_delay: Duration,
    scope: CancellationToken,
    tracked: Mutex<TrackedJobs>,
}

impl DrainingJobWatcher {
    /// Start the watcher. Returns the drain and migrated streams and the
    /// handle of the watch task, which ends when `scope` is cancelled.
    pub fn spawn(
        store: StateStore,
        limiter: Arc<RateLimiter>,
        state_read_error_delay: Duration,
        scope: CancellationToken,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<DrainRequest>,
        mpsc::Receiver<Vec<Allocation>>,
        JoinHandle<()>,
    ) {
        let watcher = Arc::new(Self {
            store,
            limiter,
            state_read_error_delay,
            tracked: Mutex::new(TrackedJobs {
                jobs: BTreeSet::new(),
                query_scope: scope.child_token(),
                grown: false,
            }),
            scope,
        });
        let (drain_tx, drain_rx) = mpsc::channel(1);
        let (migrated_tx, migrated_rx) = mpsc::channel(1);
        let handle = tokio::spawn(watcher.clone().watch(drain_tx, migrated_tx));
        (watcher, drain_rx, migrated_rx, handle)
    }

    pub fn register_job(&self, namespace: &str, job_id: &str) {
        self.register_jobs(vec![NamespacedId::new(namespace, job_id)]);
    }

    /// Jobs currently followed, in key order.
    pub fn tracked_jobs(&self) -> Vec<NamespacedId> {
        self.lock().jobs.iter().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackedJobs> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deregister_job(&self, key: &NamespacedId) {
        if self.lock().jobs.remove(key) {
            trace!(job = %key, "deregistered job");
        }
    }

    /// The tracked set, the scope its blocking query runs under, and
    /// whether the set grew since the previous call.
    fn query_scope(&self) -> (Vec<NamespacedId>, CancellationToken, bool) {
        let mut tracked = self.lock();
        let grown = std::mem::take(&mut tracked.grown);
        (
            tracked.jobs.iter().cloned().collect(),
            tracked.query_scope.clone(),
            grown,
        )
    }

    async fn watch(
        self: Arc<Self>,
        drain_tx: mpsc::Sender<DrainRequest>,
        migrated_tx: mpsc::Sender<Vec<Allocation>>,
    ) {
        let mut wait_index = 0u64;

        loop {
            if self.limiter.wait(&self.scope).await.is_err() {
                break;
            }

            let (jobs, query_scope, grown) = self.query_scope();
            if grown {
                // Newly registered jobs must be read from current state even
                // if none of their allocations changed after `wait_index`.
                wait_index = 0;
            }
            trace!(index = wait_index, jobs = jobs.len(), "getting job allocs");
            let query = self
                .store
                .blocking_query(wait_index, &query_scope, |snap| tracked_job_allocs(snap, &jobs))
                .await;

            let (allocs_by_job, index) = match query {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => {
                    if self.scope.is_cancelled() {
                        break;
                    }
                    // The tracked set grew; the next pass picks it up.
                    continue;
                }
                Err(e) => {
                    error!(index = wait_index, error = %e, "error watching job allocs");
                    if self.backoff().await {
                        break;
                    }
                    continue;
                }
            };
            trace!(
                jobs = allocs_by_job.len(),
                index,
                "retrieved allocs for draining jobs"
            );

            let last_handled = wait_index;
            let planned = self
                .store
                .snapshot()
                .map(|snap| self.handle_jobs(&snap, allocs_by_job, last_handled));
            let (drain, migrated) = match planned {
                Ok(planned) => planned,
                Err(e) => {
                    error!(error = %e, "failed to snapshot state");
                    if self.backoff().await {
                        break;
                    }
                    continue;
                }
            };
            wait_index = index;

            if !drain.is_empty() {
                let resp = BatchFuture::new();
                let request = DrainRequest {
                    allocs: drain,
                    resp: resp.clone(),
                };
                tokio::select! {
                    biased;
                    _ = self.scope.cancelled() => break,
                    sent = drain_tx.send(request) => if sent.is_err() { break },
                }

                // Do not read again until the marking is visible in state.
                tokio::select! {
                    biased;
                    _ = self.scope.cancelled() => break,
                    result = resp.wait() => match result {
                        Ok(commit_index) => wait_index = wait_index.max(commit_index),
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => error!(error = %e, "failed to commit drain transitions"),
                    },
                }
            }

            if !migrated.is_empty() {
                tokio::select! {
                    biased;
                    _ = self.scope.cancelled() => break,
                    sent = migrated_tx.send(migrated) => if sent.is_err() { break },
                }
            }
        }
        debug!("job watcher stopped");
    }

    /// Decide every tracked job against one snapshot. Jobs that are gone,
    /// not service jobs, or done are deregistered.
    fn handle_jobs(
        &self,
        snap: &StateSnapshot,
        allocs_by_job: BTreeMap<NamespacedId, Vec<Allocation>>,
        last_handled: u64,
    ) -> (Vec<Allocation>, Vec<Allocation>) {
        let mut drain = Vec::new();
        let mut migrated = Vec::new();
        for (key, allocs) in allocs_by_job {
            let job = match snap.job_by_id(&key.namespace, &key.id) {
                Ok(Some(job)) => job,
                Ok(None) => {
                    // Purged.
                    self.deregister_job(&key);
                    continue;
                }
                Err(e) => {
                    error!(job = %key, error = %e, "failed to look up job");
                    continue;
                }
            };
            if job.job_type != JobType::Service {
                self.deregister_job(&key);
                continue;
            }

            let decision = match handle_job(snap, &job, allocs, last_handled) {
                Ok(decision) => decision,
                Err(e) => {
                    error!(job = %key, error = %e, "failed to handle job");
                    continue;
                }
            };
            if !decision.drain.is_empty() {
                debug!(job = %key, num_allocs = decision.drain.len(), "job has allocs to drain");
            }
            if !decision.migrated.is_empty() {
                debug!(job = %key, num_allocs = decision.migrated.len(), "job has migrated allocs");
            }
            drain.extend(decision.drain);
            migrated.extend(decision.migrated);
            if decision.done {
                self.deregister_job(&key);
            }
        }
        (drain, migrated)
    }

    /// Sleep for the read-error delay. Returns true if the scope ended first.
    async fn backoff(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.scope.cancelled() => true,
            _ = tokio::time::sleep(self.state_read_error_delay) => false,
        }
    }
}

impl JobRegistrar for DrainingJobWatcher {
    fn register_jobs(&self, jobs: Vec<NamespacedId>) {
        let mut tracked = self.lock();
        let mut updated = false;
        for job in jobs {
            if tracked.jobs.insert(job.clone()) {
                trace!(%job, "registering job");
                updated = true;
            }
        }
        if updated {
            tracked.grown = true;
            tracked.query_scope.cancel();
            tracked.query_scope = self.scope.child_token();
        }
    }
}

/// Blocking-query body: every allocation (terminal ones included) of each
/// tracked job.
///
/// The index is the highest modify index among those allocations so that
/// unrelated allocation writes do not wake the watcher; without any
/// allocations it falls back to the allocation table index.
fn tracked_job_allocs(
    snap: &StateSnapshot,
    jobs: &[NamespacedId],
) -> StateResult<(BTreeMap<NamespacedId, Vec<Allocation>>, u64)> {
    let mut max_index = 0;
    let mut out = BTreeMap::new();
    for key in jobs {
        let allocs = snap.allocs_by_job(&key.namespace, &key.id, true)?;
        max_index = allocs
            .iter()
            .map(|a| a.modify_index)
            .fold(max_index, u64::max);
        out.insert(key.clone(), allocs);
    }
    if max_index == 0 {
        max_index = snap.index(Table::Allocs)?;
    }
    Ok((out, max_index))
}

/// Run the per-group decision over every group of `job` that has a migrate
/// policy. Allocations of groups the job no longer has are ignored.
///
/// Whether a node is draining is read from `snap`, the same snapshot the
/// allocations came from, not from the draining registry. The registry
/// follows the store through the node watcher and may lag it; deciding
/// against one snapshot keeps node status and allocation state consistent.
pub fn handle_job(
    snap: &StateSnapshot,
    job: &Job,
    allocs: Vec<Allocation>,
    last_handled: u64,
) -> DrainResult<DrainDecision> {
    let groups: HashMap<&str, &TaskGroup> = job
        .task_groups
        .iter()
        .filter(|tg| tg.migrate.is_some())
        .map(|tg| (tg.name.as_str(), tg))
        .collect();

    let mut by_group: BTreeMap<String, Vec<Allocation>> = BTreeMap::new();
    for alloc in allocs {
        if groups.contains_key(alloc.task_group.as_str()) {
            by_group
                .entry(alloc.task_group.clone())
                .or_default()
                .push(alloc);
        }
    }

    // Node lookups are shared by every group of the job.
    let mut draining_nodes: HashMap<NodeId, bool> = HashMap::new();
    let mut on_draining_node = |node_id: &str| -> DrainResult<bool> {
        if let Some(draining) = draining_nodes.get(node_id) {
            return Ok(*draining);
        }
        let draining = snap
            .node_by_id(node_id)?
            .is_some_and(|node| node.is_draining());
        draining_nodes.insert(node_id.to_string(), draining);
        Ok(draining)
    };

    let mut result = DrainDecision {
        done: true,
        ..DrainDecision::default()
    };
    for (name, allocs) in by_group {
        let Some(group) = groups.get(name.as_str()) else {
            continue;
        };
        let decision = handle_task_group(group, &allocs, last_handled, &mut on_draining_node)?;
        result.merge(decision);
    }
    Ok(result)
}

/// Decide, for one task group, which allocations to migrate now.
///
/// An allocation is *migrated* when it is terminal on a draining node and
/// changed after `last_handled`; *healthy* when it is running with a
/// healthy deployment status; *drainable* when it is running on a draining
/// node and not yet marked. At most `healthy - (count - max_parallel)`
/// drainable allocations are selected, in the order given.
pub fn handle_task_group<F>(
    group: &TaskGroup,
    allocs: &[Allocation],
    last_handled: u64,
    on_draining_node: &mut F,
) -> DrainResult<DrainDecision>
where
    F: FnMut(&str) -> DrainResult<bool>,
{
    let mut decision = DrainDecision {
        done: true,
        ..DrainDecision::default()
    };
    let mut healthy: i64 = 0;
    let mut drainable = Vec::new();

    for alloc in allocs {
        let on_draining = on_draining_node(&alloc.node_id)?;

        if alloc.is_terminal() && on_draining && alloc.modify_index > last_handled {
            decision.migrated.push(alloc.clone());
            continue;
        }

        if !alloc.is_terminal() && alloc.is_healthy() {
            healthy += 1;
        }

        if !on_draining || alloc.is_terminal() {
            continue;
        }

        // Still running on a draining node.
        decision.done = false;

        if !alloc.should_migrate() {
            drainable.push(alloc);
        }
    }

    let max_parallel = group
        .migrate
        .as_ref()
        .map_or(1, |m| i64::from(m.max_parallel));
    let threshold = i64::from(group.count) - max_parallel;
    let limit = usize::try_from((healthy - threshold).max(0)).unwrap_or(0);
    let n = drainable.len().min(limit);
    decision
        .drain
        .extend(drainable.into_iter().take(n).cloned());
    Ok(decision)
}
