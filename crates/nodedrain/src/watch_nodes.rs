//! NodeDrainWatcher: feeds node drain changes into the registry.
//!
//! Each pass classifies every node against what the registry tracks. The
//! blocking query also wakes on allocation changes on draining nodes; the
//! ids of tracked nodes whose allocations moved (and of nodes just picked
//! up) are forwarded to the main loop so it can check them for completion.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use nodedrain_state::{NodeId, NodeInfo, StateResult, StateSnapshot, StateStore, Table};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::limiter::RateLimiter;
use crate::registry::NodeTracker;

/// What the registry must do about one observed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAction {
    None,
    Update,
    Remove,
}

/// Compare an observed node with the registry's copy of it.
///
/// | tracked | draining | strategy changed | action |
/// |---------|----------|------------------|--------|
/// | no      | no       |                  | none   |
/// | no      | yes      |                  | update |
/// | yes     | no       |                  | remove |
/// | yes     | yes      | no               | none   |
/// | yes     | yes      | yes              | update |
pub fn classify(tracked: Option<&NodeInfo>, node: &NodeInfo) -> NodeAction {
    match (tracked, &node.drain_strategy) {
        (None, None) => NodeAction::None,
        (None, Some(_)) => NodeAction::Update,
        (Some(_), None) => NodeAction::Remove,
        (Some(tracked), Some(strategy)) => {
            if tracked.drain_strategy.as_ref() == Some(strategy) {
                NodeAction::None
            } else {
                NodeAction::Update
            }
        }
    }
}

/// Result of one node-watcher query.
struct NodeView {
    nodes: Vec<NodeInfo>,
    /// Highest allocation modify index per draining node.
    alloc_index: HashMap<NodeId, u64>,
}

pub struct NodeDrainWatcher {
    store: StateStore,
    limiter: Arc<RateLimiter>,
    tracker: Arc<dyn NodeTracker>,
    state_read_error_delay: Duration,
    scope: CancellationToken,
}

impl NodeDrainWatcher {
    /// Start the watcher. The returned receiver carries ids of draining
    /// nodes worth a completion check.
    pub fn spawn(
        store: StateStore,
        limiter: Arc<RateLimiter>,
        tracker: Arc<dyn NodeTracker>,
        state_read_error_delay: Duration,
        scope: CancellationToken,
    ) -> (mpsc::Receiver<Vec<NodeId>>, JoinHandle<()>) {
        let watcher = Self {
            store,
            limiter,
            tracker,
            state_read_error_delay,
            scope,
        };
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(watcher.watch(tx));
        (rx, handle)
    }

    async fn watch(self, progress_tx: mpsc::Sender<Vec<NodeId>>) {
        let mut index = 0u64;
        let mut seen_alloc_index: HashMap<NodeId, u64> = HashMap::new();

        loop {
            if self.limiter.wait(&self.scope).await.is_err() {
                break;
            }

            trace!(index, "getting nodes");
            let view = match self
                .store
                .blocking_query(index, &self.scope, node_view)
                .await
            {
                Ok((view, new_index)) => {
                    index = new_index;
                    view
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    error!(index, error = %e, "error watching node updates");
                    tokio::select! {
                        biased;
                        _ = self.scope.cancelled() => break,
                        _ = tokio::time::sleep(self.state_read_error_delay) => continue,
                    }
                }
            };
            trace!(nodes = view.nodes.len(), index, "retrieved nodes");

            let progressed = self.apply(view, &mut seen_alloc_index);
            if progressed.is_empty() {
                continue;
            }
            tokio::select! {
                biased;
                _ = self.scope.cancelled() => break,
                sent = progress_tx.send(progressed) => if sent.is_err() { break },
            }
        }
        debug!("node watcher stopped");
    }

    /// Reconcile the registry with one view and return the draining nodes
    /// that moved since the previous view.
    fn apply(&self, view: NodeView, seen_alloc_index: &mut HashMap<NodeId, u64>) -> Vec<NodeId> {
        let mut progressed = Vec::new();
        let mut present = HashSet::with_capacity(view.nodes.len());

        for node in view.nodes {
            present.insert(node.id.clone());
            let tracked = self.tracker.tracking(&node.id);
            let action = classify(tracked.as_ref(), &node);
            let node_id = node.id.clone();
            let draining = node.is_draining();
            match action {
                NodeAction::None => {}
                NodeAction::Update => {
                    debug!(%node_id, "node drain updated");
                    self.tracker.update(node);
                }
                NodeAction::Remove => {
                    debug!(%node_id, "node no longer draining");
                    self.tracker.remove(&node_id);
                }
            }

            if !draining {
                seen_alloc_index.remove(&node_id);
                continue;
            }
            let alloc_index = view.alloc_index.get(&node_id).copied().unwrap_or(0);
            let previous = seen_alloc_index.insert(node_id.clone(), alloc_index);
            if action == NodeAction::Update || previous != Some(alloc_index) {
                progressed.push(node_id);
            }
        }

        // Nodes deleted from state stop draining too.
        for node_id in self.tracker.tracked_nodes().into_keys() {
            if !present.contains(&node_id) {
                debug!(%node_id, "draining node deleted");
                self.tracker.remove(&node_id);
            }
        }
        seen_alloc_index.retain(|id, _| present.contains(id));

        progressed.sort();
        progressed
    }
}

/// Blocking-query body: all nodes, indexed by the later of the node table
/// and the newest allocation write on any draining node.
fn node_view(snap: &StateSnapshot) -> StateResult<(NodeView, u64)> {
    let nodes = snap.nodes()?;
    let mut index = snap.index(Table::Nodes)?;
    let mut alloc_index = HashMap::new();
    for node in nodes.iter().filter(|n| n.is_draining()) {
        let newest = snap
            .allocs_by_node(&node.id)?
            .iter()
            .map(|a| a.modify_index)
            .max()
            .unwrap_or(0);
        index = index.max(newest);
        alloc_index.insert(node.id.clone(), newest);
    }
    Ok((NodeView { nodes, alloc_index }, index))
}
