//! NodeDrainer: leader-only coordinator of node drains.
//!
//! While enabled it owns one scope of background tasks: the deadline heap,
//! the job watcher, the node watcher and the main loop, plus the per-batch
//! tasks they spawn. The main loop is the only place that submits migrate
//! batches and completes nodes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use nodedrain_state::{
    Allocation, NODE_EVENT_SUBSYSTEM_DRAIN, NamespacedId, NodeEvent, NodeId, NodeInfo, StateStore,
};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batcher::AllocMigrateBatcher;
use crate::config::DrainerConfig;
use crate::deadline::DeadlineHeap;
use crate::error::ConfigError;
use crate::future::BatchFuture;
use crate::limiter::RateLimiter;
use crate::raft::RaftApplier;
use crate::registry::{DrainingRegistry, NodeTracker};
use crate::tasks::BackgroundTasks;
use crate::watch_jobs::{DrainRequest, DrainingJobWatcher};
use crate::watch_nodes::NodeDrainWatcher;

/// Message of the event recorded on a node whose drain finished.
pub const NODE_DRAIN_COMPLETE_MESSAGE: &str = "Node drain complete";

/// Event detail set when the drain finished after its deadline.
pub const NODE_DRAIN_DEADLINE_REACHED_DETAIL: &str = "deadline_reached";

/// Tasks and shared state of one enabled period.
struct Running {
    scope: CancellationToken,
    registry: Arc<DrainingRegistry>,
    job_watcher: Arc<DrainingJobWatcher>,
    tasks: Vec<JoinHandle<()>>,
    /// Batch flushes, drain-request relays and failure loggers.
    background: BackgroundTasks,
}

pub struct NodeDrainer {
    config: DrainerConfig,
    raft: Arc<dyn RaftApplier>,
    /// Shared by every watcher across enable cycles.
    limiter: Arc<RateLimiter>,
    running: Mutex<Option<Running>>,
}

impl NodeDrainer {
    /// Build a disabled drainer. Fails if `config` does not validate.
    pub fn new(config: DrainerConfig, raft: Arc<dyn RaftApplier>) -> Result<Self, ConfigError> {
        config.validate()?;
        let limiter = Arc::new(RateLimiter::new(
            config.state_queries_per_second,
            config.state_query_burst,
        ));
        Ok(Self {
            config,
            raft,
            limiter,
            running: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &DrainerConfig {
        &self.config
    }

    /// Enable or disable the drainer.
    ///
    /// Any running instance is stopped first and all of its tasks awaited,
    /// so no applier call from it is still in flight on return. Enabling
    /// then rebuilds every component from scratch against `store`, so
    /// enabling twice flushes all in-memory drain state. Disabling drops
    /// in-flight batches; their waiters see [`DrainError::Cancelled`].
    ///
    /// [`DrainError::Cancelled`]: crate::error::DrainError::Cancelled
    pub async fn set_enabled(&self, enabled: bool, store: &StateStore) {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            previous.scope.cancel();
            for task in previous.tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "drainer task ended abnormally");
                }
            }
            previous.background.join_all().await;
            info!("node drainer disabled");
        }
        if enabled {
            *running = Some(self.start(store.clone()));
            info!("node drainer enabled");
        }
    }

    pub async fn is_enabled(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Draining nodes currently tracked. Empty while disabled.
    pub async fn draining_nodes(&self) -> HashMap<NodeId, NodeInfo> {
        match self.running.lock().await.as_ref() {
            Some(running) => running.registry.tracked_nodes(),
            None => HashMap::new(),
        }
    }

    /// Jobs the job watcher currently follows. Empty while disabled.
    pub async fn tracked_jobs(&self) -> Vec<NamespacedId> {
        match self.running.lock().await.as_ref() {
            Some(running) => running.job_watcher.tracked_jobs(),
            None => Vec::new(),
        }
    }

    fn start(&self, store: StateStore) -> Running {
        let config = &self.config;
        let scope = CancellationToken::new();
        let background = BackgroundTasks::new();

        let (heap, deadline_rx, heap_task) =
            DeadlineHeap::spawn(config.node_deadline_coalesce_window, scope.child_token());
        let (job_watcher, drain_rx, migrated_rx, jobs_task) = DrainingJobWatcher::spawn(
            store.clone(),
            self.limiter.clone(),
            config.state_read_error_delay,
            scope.child_token(),
        );
        let registry = Arc::new(DrainingRegistry::new(
            store.clone(),
            heap,
            job_watcher.clone(),
        ));
        let (progress_rx, nodes_task) = NodeDrainWatcher::spawn(
            store.clone(),
            self.limiter.clone(),
            registry.clone(),
            config.state_read_error_delay,
            scope.child_token(),
        );
        let batcher = AllocMigrateBatcher::new(
            store,
            self.raft.clone(),
            config.batch_update_interval,
            config.max_ids_per_txn,
            scope.child_token(),
            background.clone(),
        );

        let main = DrainLoop {
            raft: self.raft.clone(),
            registry: registry.clone(),
            batcher,
            scope: scope.clone(),
            background: background.clone(),
        };
        let main_task = tokio::spawn(main.run(deadline_rx, drain_rx, migrated_rx, progress_rx));

        Running {
            scope,
            registry,
            job_watcher,
            tasks: vec![heap_task, jobs_task, nodes_task, main_task],
            background,
        }
    }
}

/// The main loop: the single consumer of every watcher's output.
struct DrainLoop {
    raft: Arc<dyn RaftApplier>,
    registry: Arc<DrainingRegistry>,
    batcher: Arc<AllocMigrateBatcher>,
    scope: CancellationToken,
    background: BackgroundTasks,
}

impl DrainLoop {
    async fn run(
        self,
        mut deadlines: mpsc::Receiver<Vec<NodeId>>,
        mut drains: mpsc::Receiver<DrainRequest>,
        mut migrated: mpsc::Receiver<Vec<Allocation>>,
        mut progress: mpsc::Receiver<Vec<NodeId>>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = self.scope.cancelled() => break,
                Some(nodes) = deadlines.recv() => self.handle_deadlined_nodes(nodes),
                Some(req) = drains.recv() => self.handle_drain_request(req),
                Some(allocs) = migrated.recv() => self.handle_migrated_allocs(allocs).await,
                Some(nodes) = progress.recv() => self.check_nodes(nodes).await,
                else => break,
            }
        }
        debug!("drainer main loop stopped");
    }

    /// Force every remaining allocation of the deadlined nodes to migrate.
    /// The nodes themselves complete once those allocations are terminal.
    fn handle_deadlined_nodes(&self, nodes: Vec<NodeId>) {
        let mut forced = Vec::new();
        for node_id in nodes {
            let Some(node) = self.registry.get(&node_id) else {
                continue;
            };
            match node.deadline_allocs() {
                Ok(allocs) => {
                    debug!(%node_id, allocs = allocs.len(), "node deadline reached, forcing migration");
                    forced.extend(allocs);
                }
                Err(e) => error!(%node_id, error = %e, "failed to list allocations of deadlined node"),
            }
        }
        if !forced.is_empty() {
            self.log_batch_failure(self.batcher.append(forced), "deadline");
        }
    }

    /// Join the request to the open batch and complete the watcher's
    /// future with the batch result.
    fn handle_drain_request(&self, req: DrainRequest) {
        let DrainRequest { allocs, resp } = req;
        let batch = self.batcher.append(allocs);
        self.background.spawn(async move {
            resp.respond(batch.wait().await);
        });
    }

    async fn handle_migrated_allocs(&self, allocs: Vec<Allocation>) {
        let nodes: BTreeSet<NodeId> = allocs.into_iter().map(|a| a.node_id).collect();
        self.check_nodes(nodes.into_iter().collect()).await;
    }

    /// Complete every listed node that is done. Nodes left with only
    /// system allocations get those marked for migration instead.
    async fn check_nodes(&self, nodes: Vec<NodeId>) {
        let mut done = Vec::new();
        let mut system = Vec::new();
        for node_id in nodes {
            let Some(node) = self.registry.get(&node_id) else {
                continue;
            };
            match node.is_done() {
                Ok(true) => done.push(node.node()),
                Ok(false) => match node.remaining_system_allocs() {
                    Ok(allocs) => system.extend(allocs),
                    Err(e) => error!(%node_id, error = %e, "failed to list system allocations"),
                },
                Err(e) => error!(%node_id, error = %e, "failed to check drain progress"),
            }
        }

        if !system.is_empty() {
            debug!(allocs = system.len(), "draining remaining system allocations");
            self.log_batch_failure(self.batcher.append(system), "system");
        }

        for node in done {
            let event = completion_event(&node, SystemTime::now());
            let result = tokio::select! {
                biased;
                _ = self.scope.cancelled() => return,
                result = self.raft.node_drain_complete(&node.id, event) => result,
            };
            match result {
                Ok(index) => {
                    info!(node_id = %node.id, index, "node drain complete");
                    self.registry.remove(&node.id);
                }
                Err(e) => error!(node_id = %node.id, error = %e, "failed to complete node drain"),
            }
        }
    }

    fn log_batch_failure(&self, batch: BatchFuture, kind: &'static str) {
        self.background.spawn(async move {
            if let Err(e) = batch.wait().await {
                if !e.is_cancelled() {
                    error!(kind, error = %e, "migrate batch failed");
                }
            }
        });
    }
}

/// The node event recorded when `node` finishes draining at `now`.
pub fn completion_event(node: &NodeInfo, now: SystemTime) -> NodeEvent {
    let event = NodeEvent::new(NODE_EVENT_SUBSYSTEM_DRAIN, NODE_DRAIN_COMPLETE_MESSAGE);
    let deadline_reached = node
        .drain_strategy
        .as_ref()
        .is_some_and(|s| s.deadline_reached(now));
    if deadline_reached {
        event.with_detail(NODE_DRAIN_DEADLINE_REACHED_DETAIL, "true")
    } else {
        event
    }
}
