//! DrainingRegistry: the authoritative set of draining nodes.
//!
//! The node watcher feeds it through [`NodeTracker`]; it arms the deadline
//! heap through [`DeadlineNotifier`] and registers the jobs it finds on a
//! newly draining node with the job watcher through [`JobRegistrar`].
//! Nothing calls back into the registry, so there is no reference cycle.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use nodedrain_state::{NamespacedId, NodeId, NodeInfo, StateStore};
use tokio::time::Instant;
use tracing::{debug, error};

use crate::deadline::DeadlineNotifier;
use crate::draining_node::DrainingNode;

/// Registry operations used by the node watcher.
pub trait NodeTracker: Send + Sync {
    /// Snapshot of every tracked node.
    fn tracked_nodes(&self) -> HashMap<NodeId, NodeInfo>;
    /// The last observed snapshot of `node_id`, if tracked.
    fn tracking(&self, node_id: &str) -> Option<NodeInfo>;
    /// Track or refresh a draining node.
    fn update(&self, node: NodeInfo);
    /// Stop tracking a node.
    fn remove(&self, node_id: &str);
}

/// Accepts jobs that have allocations on draining nodes.
pub trait JobRegistrar: Send + Sync {
    fn register_jobs(&self, jobs: Vec<NamespacedId>);
}

pub struct DrainingRegistry {
    store: StateStore,
    nodes: RwLock<HashMap<NodeId, Arc<DrainingNode>>>,
    deadlines: Arc<dyn DeadlineNotifier>,
    jobs: Arc<dyn JobRegistrar>,
}

impl DrainingRegistry {
    pub fn new(
        store: StateStore,
        deadlines: Arc<dyn DeadlineNotifier>,
        jobs: Arc<dyn JobRegistrar>,
    ) -> Self {
        Self {
            store,
            nodes: RwLock::new(HashMap::new()),
            deadlines,
            jobs,
        }
    }

    /// The draining-node record for `node_id`, if tracked.
    pub fn get(&self, node_id: &str) -> Option<Arc<DrainingNode>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NodeTracker for DrainingRegistry {
    fn tracked_nodes(&self) -> HashMap<NodeId, NodeInfo> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, draining)| (id.clone(), draining.node()))
            .collect()
    }

    fn tracking(&self, node_id: &str) -> Option<NodeInfo> {
        self.get(node_id).map(|draining| draining.node())
    }

    fn update(&self, node: NodeInfo) {
        let Some(strategy) = node.drain_strategy.clone() else {
            self.remove(&node.id);
            return;
        };
        let node_id = node.id.clone();

        let (draining, changed) = {
            let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
            let (draining, changed) = match nodes.get(&node_id) {
                Some(existing) => {
                    let changed = existing.node().drain_strategy.as_ref() != Some(&strategy);
                    existing.update(node);
                    (existing.clone(), changed)
                }
                None => {
                    let draining = Arc::new(DrainingNode::new(node, self.store.clone()));
                    nodes.insert(node_id.clone(), draining.clone());
                    (draining, true)
                }
            };
            if changed {
                match strategy.deadline {
                    Some(deadline) => self.deadlines.watch(&node_id, deadline_instant(deadline)),
                    None => self.deadlines.remove(&node_id),
                }
            }
            (draining, changed)
        };

        if !changed {
            return;
        }
        debug!(%node_id, infinite = strategy.is_infinite(), "tracking draining node");
        match draining.draining_jobs() {
            Ok(jobs) if !jobs.is_empty() => self.jobs.register_jobs(jobs),
            Ok(_) => {}
            Err(e) => error!(%node_id, error = %e, "failed to list draining jobs"),
        }
    }

    fn remove(&self, node_id: &str) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if nodes.remove(node_id).is_some() {
            debug!(%node_id, "stopped tracking node");
        }
        self.deadlines.remove(node_id);
    }
}

/// Deadlines further out than this are clamped to it.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 86_400);

/// Map a wall-clock deadline onto the runtime clock. Past deadlines map to
/// now.
pub fn deadline_instant(deadline: SystemTime) -> Instant {
    let now = Instant::now();
    match deadline.duration_since(SystemTime::now()) {
        Ok(remaining) => now + remaining.min(FAR_FUTURE),
        Err(_) => now,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use nodedrain_state::{Allocation, DrainStrategy, Job, JobType, TaskGroup};
    use proptest::prelude::*;

    use super::*;
    use crate::watch_nodes::{NodeAction, classify};

    #[derive(Default)]
    struct RecordingDeadlines {
        watched: Mutex<HashMap<NodeId, Instant>>,
        watch_calls: Mutex<usize>,
    }

    impl DeadlineNotifier for RecordingDeadlines {
        fn watch(&self, node_id: &str, deadline: Instant) {
            *self.watch_calls.lock().unwrap() += 1;
            self.watched
                .lock()
                .unwrap()
                .insert(node_id.to_string(), deadline);
        }

        fn remove(&self, node_id: &str) {
            self.watched.lock().unwrap().remove(node_id);
        }
    }

    #[derive(Default)]
    struct RecordingJobs {
        registered: Mutex<Vec<NamespacedId>>,
    }

    impl JobRegistrar for RecordingJobs {
        fn register_jobs(&self, jobs: Vec<NamespacedId>) {
            self.registered.lock().unwrap().extend(jobs);
        }
    }

    struct Harness {
        store: StateStore,
        deadlines: Arc<RecordingDeadlines>,
        jobs: Arc<RecordingJobs>,
        registry: DrainingRegistry,
    }

    fn harness() -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let deadlines = Arc::new(RecordingDeadlines::default());
        let jobs = Arc::new(RecordingJobs::default());
        let registry = DrainingRegistry::new(store.clone(), deadlines.clone(), jobs.clone());
        Harness {
            store,
            deadlines,
            jobs,
            registry,
        }
    }

    fn node(id: &str, strategy: Option<DrainStrategy>) -> NodeInfo {
        let mut node = NodeInfo::new(id);
        node.drain_strategy = strategy;
        node
    }

    #[test]
    fn finite_deadline_arms_the_heap() {
        let h = harness();
        let strategy = DrainStrategy::with_deadline_in(Duration::from_secs(60));
        h.registry.update(node("n1", Some(strategy)));

        assert!(h.registry.tracking("n1").is_some());
        assert!(h.deadlines.watched.lock().unwrap().contains_key("n1"));

        h.registry.update(node("n1", Some(DrainStrategy::without_deadline())));
        assert!(h.registry.tracking("n1").is_some());
        assert!(!h.deadlines.watched.lock().unwrap().contains_key("n1"));
    }

    #[test]
    fn unchanged_strategy_does_not_rearm() {
        let h = harness();
        let strategy = DrainStrategy::with_deadline_in(Duration::from_secs(60));
        h.registry.update(node("n1", Some(strategy.clone())));
        let mut renamed = node("n1", Some(strategy));
        renamed.name = "worker-1".to_string();
        h.registry.update(renamed);

        assert_eq!(*h.deadlines.watch_calls.lock().unwrap(), 1);
        assert_eq!(h.registry.tracking("n1").unwrap().name, "worker-1");
    }

    #[test]
    fn remove_clears_registry_and_heap() {
        let h = harness();
        h.registry.update(node(
            "n1",
            Some(DrainStrategy::with_deadline_in(Duration::from_secs(60))),
        ));
        h.registry.remove("n1");
        assert!(h.registry.tracking("n1").is_none());
        assert!(h.registry.is_empty());
        assert!(h.deadlines.watched.lock().unwrap().is_empty());
    }

    #[test]
    fn update_without_strategy_removes() {
        let h = harness();
        h.registry
            .update(node("n1", Some(DrainStrategy::without_deadline())));
        h.registry.update(node("n1", None));
        assert!(h.registry.tracked_nodes().is_empty());
    }

    #[test]
    fn new_drain_registers_node_jobs() {
        let h = harness();
        let web = Job::new("default", "web", JobType::Service)
            .with_task_group(TaskGroup::new("web", 2));
        let api = Job::new("prod", "api", JobType::Service)
            .with_task_group(TaskGroup::new("api", 1));
        h.store
            .upsert_allocs(&[
                Allocation::new("a1", &web, "web", "n1"),
                Allocation::new("a2", &web, "web", "n1"),
                Allocation::new("a3", &api, "api", "n1"),
                Allocation::new("a4", &api, "api", "n2"),
            ])
            .unwrap();

        h.registry
            .update(node("n1", Some(DrainStrategy::without_deadline())));
        let registered = h.jobs.registered.lock().unwrap().clone();
        assert_eq!(
            registered,
            vec![
                NamespacedId::new("default", "web"),
                NamespacedId::new("prod", "api"),
            ]
        );
    }

    #[test]
    fn past_deadline_maps_to_now() {
        let past = SystemTime::now() - Duration::from_secs(30);
        assert!(deadline_instant(past) <= Instant::now());
        let future = SystemTime::now() + Duration::from_secs(30);
        assert!(deadline_instant(future) > Instant::now() + Duration::from_secs(29));
    }

    #[test]
    fn far_future_deadline_is_clamped() {
        let far = SystemTime::now() + Duration::from_secs(1_000 * 365 * 86_400);
        let at = deadline_instant(far);
        assert!(at <= Instant::now() + FAR_FUTURE);
        assert!(at > Instant::now() + FAR_FUTURE - Duration::from_secs(60));
    }

    fn strategy_for(choice: u8) -> Option<DrainStrategy> {
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(4_000_000_000);
        match choice {
            0 => None,
            1 => Some(DrainStrategy::without_deadline()),
            2 => Some(DrainStrategy::without_deadline().ignoring_system_jobs()),
            n => Some(DrainStrategy {
                deadline: Some(base + Duration::from_secs(u64::from(n))),
                ignore_system_jobs: false,
            }),
        }
    }

    proptest! {
        #[test]
        fn registry_tracks_exactly_the_draining_nodes(
            updates in proptest::collection::vec((0usize..5, 0u8..6), 1..40),
        ) {
            let h = harness();
            let mut last_observed: HashMap<NodeId, Option<DrainStrategy>> = HashMap::new();

            for (idx, choice) in updates {
                let observed = node(&format!("n{idx}"), strategy_for(choice));
                let tracked = h.registry.tracking(&observed.id);
                match classify(tracked.as_ref(), &observed) {
                    NodeAction::None => {}
                    NodeAction::Update => h.registry.update(observed.clone()),
                    NodeAction::Remove => h.registry.remove(&observed.id),
                }
                last_observed.insert(observed.id.clone(), observed.drain_strategy.clone());

                let mut expected: Vec<NodeId> = last_observed
                    .iter()
                    .filter(|(_, s)| s.is_some())
                    .map(|(id, _)| id.clone())
                    .collect();
                expected.sort();
                let mut actual: Vec<NodeId> = h.registry.tracked_nodes().into_keys().collect();
                actual.sort();
                prop_assert_eq!(&actual, &expected);

                // Finite deadlines, and only those, are armed.
                let mut finite: Vec<NodeId> = last_observed
                    .iter()
                    .filter(|(_, s)| s.as_ref().is_some_and(|s| !s.is_infinite()))
                    .map(|(id, _)| id.clone())
                    .collect();
                finite.sort();
                let mut armed: Vec<NodeId> =
                    h.deadlines.watched.lock().unwrap().keys().cloned().collect();
                armed.sort();
                prop_assert_eq!(&armed, &finite);
            }
        }
    }
}
