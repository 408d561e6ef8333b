//! AllocMigrateBatcher: folds migrate markings into few log entries.
//!
//! Every append made while a batch is open joins it and shares its
//! [`BatchFuture`]. The batch is committed `batch_update_interval` after
//! the append that opened it, split into entries of at most
//! `max_ids_per_txn` alloc plus eval ids.

use std::collections::{BTreeSet, HashMap};
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use nodedrain_state::{
    AllocId, Allocation, DesiredTransition, EVAL_TRIGGER_NODE_DRAIN, EvalStatus, Evaluation,
    NamespacedId, StateStore,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{DrainError, DrainResult};
use crate::future::BatchFuture;
use crate::raft::RaftApplier;
use crate::tasks::BackgroundTasks;

#[derive(Default)]
struct OpenBatch {
    allocs: Vec<Allocation>,
    future: Option<BatchFuture>,
}

/// One log entry's worth of a batch.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TransitionChunk {
    pub transitions: HashMap<AllocId, DesiredTransition>,
    pub evals: Vec<Evaluation>,
}

pub struct AllocMigrateBatcher {
    store: StateStore,
    raft: Arc<dyn RaftApplier>,
    interval: Duration,
    max_ids_per_txn: usize,
    scope: CancellationToken,
    tasks: BackgroundTasks,
    open: Mutex<OpenBatch>,
}

impl AllocMigrateBatcher {
    pub fn new(
        store: StateStore,
        raft: Arc<dyn RaftApplier>,
        interval: Duration,
        max_ids_per_txn: usize,
        scope: CancellationToken,
        tasks: BackgroundTasks,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            raft,
            interval,
            max_ids_per_txn: max_ids_per_txn.max(1),
            scope,
            tasks,
            open: Mutex::new(OpenBatch::default()),
        })
    }

    /// Add `allocs` to the open batch, opening one if needed, and return
    /// the future that completes when the batch has committed.
    pub fn append(self: &Arc<Self>, allocs: Vec<Allocation>) -> BatchFuture {
        let mut open = self.lock();
        open.allocs.extend(allocs);
        if let Some(future) = &open.future {
            return future.clone();
        }
        let future = BatchFuture::new();
        open.future = Some(future.clone());
        drop(open);

        let batcher = self.clone();
        self.tasks
            .spawn(async move { batcher.flush_after_interval().await });
        future
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OpenBatch> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Close the open batch, handing back its allocations and future.
    fn take(&self) -> (Vec<Allocation>, BatchFuture) {
        let mut open = self.lock();
        let allocs = mem::take(&mut open.allocs);
        let future = open.future.take().unwrap_or_default();
        (allocs, future)
    }

    async fn flush_after_interval(self: Arc<Self>) {
        tokio::select! {
            biased;
            _ = self.scope.cancelled() => {
                let (_, future) = self.take();
                future.respond(Err(DrainError::Cancelled));
                return;
            }
            _ = tokio::time::sleep(self.interval) => {}
        }

        let (allocs, future) = self.take();
        let result = tokio::select! {
            biased;
            _ = self.scope.cancelled() => Err(DrainError::Cancelled),
            result = self.drain_allocs(allocs) => result,
        };
        if let Err(e) = &result {
            if !e.is_cancelled() {
                error!(error = %e, "failed to mark allocations for migration");
            }
        }
        future.respond(result);
    }

    /// Commit one batch and return the index of its last entry.
    async fn drain_allocs(&self, allocs: Vec<Allocation>) -> DrainResult<u64> {
        let mut transitions = HashMap::with_capacity(allocs.len());
        let mut jobs = BTreeSet::new();
        for alloc in &allocs {
            transitions.insert(alloc.id.clone(), DesiredTransition::migrate());
            jobs.insert(alloc.job_key());
        }
        let evals = self.job_evals(jobs)?;

        let chunks = partition_transitions(self.max_ids_per_txn, transitions, evals);
        debug!(
            allocs = allocs.len(),
            entries = chunks.len(),
            "marking allocations for migration"
        );
        let mut index = 0;
        for chunk in chunks {
            index = self
                .raft
                .alloc_update_desired_transition(chunk.transitions, chunk.evals)
                .await?;
        }
        Ok(index)
    }

    /// One pending evaluation per job, taking type and priority from the
    /// job. Jobs that no longer exist get none.
    fn job_evals(&self, jobs: BTreeSet<NamespacedId>) -> DrainResult<Vec<Evaluation>> {
        let snap = self.store.snapshot()?;
        let now = SystemTime::now();
        let mut evals = Vec::new();
        for key in jobs {
            let Some(job) = snap.job_by_id(&key.namespace, &key.id)? else {
                warn!(job = %key, "job purged before its drain evaluation was created");
                continue;
            };
            evals.push(Evaluation {
                id: Uuid::new_v4().to_string(),
                namespace: job.namespace,
                priority: job.priority,
                job_type: job.job_type,
                triggered_by: EVAL_TRIGGER_NODE_DRAIN.to_string(),
                job_id: job.id,
                status: EvalStatus::Pending,
                create_time: now,
                modify_time: now,
                create_index: 0,
                modify_index: 0,
            });
        }
        Ok(evals)
    }
}

/// Split a batch into entries of at most `max_ids` ids. Allocation ids are
/// placed first, in id order; evaluations fill whatever room is left.
pub fn partition_transitions(
    max_ids: usize,
    transitions: HashMap<AllocId, DesiredTransition>,
    evals: Vec<Evaluation>,
) -> Vec<TransitionChunk> {
    let max_ids = max_ids.max(1);
    let mut ids: Vec<(AllocId, DesiredTransition)> = transitions.into_iter().collect();
    ids.sort_by(|a, b| a.0.cmp(&b.0));

    let mut chunks = Vec::new();
    let mut ids = ids.into_iter().peekable();
    let mut evals = evals.into_iter().peekable();
    while ids.peek().is_some() || evals.peek().is_some() {
        let mut chunk = TransitionChunk::default();
        let mut room = max_ids;
        while room > 0 {
            let Some((id, transition)) = ids.next() else {
                break;
            };
            chunk.transitions.insert(id, transition);
            room -= 1;
        }
        while room > 0 {
            let Some(eval) = evals.next() else {
                break;
            };
            chunk.evals.push(eval);
            room -= 1;
        }
        chunks.push(chunk);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use nodedrain_state::{Job, JobType, NodeEvent, TaskGroup};

    use super::*;

    #[derive(Default)]
    struct RecordingApplier {
        calls: Mutex<Vec<TransitionChunk>>,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl RaftApplier for RecordingApplier {
        async fn alloc_update_desired_transition(
            &self,
            transitions: HashMap<AllocId, DesiredTransition>,
            evals: Vec<Evaluation>,
        ) -> DrainResult<u64> {
            if *self.fail.lock().unwrap() {
                return Err(DrainError::Apply("log unavailable".to_string()));
            }
            let mut calls = self.calls.lock().unwrap();
            calls.push(TransitionChunk { transitions, evals });
            Ok(100 + calls.len() as u64)
        }

        async fn node_drain_complete(&self, _: &str, _: NodeEvent) -> DrainResult<u64> {
            unreachable!("the batcher never completes nodes")
        }
    }

    struct Fixture {
        store: StateStore,
        web: Job,
        api: Job,
    }

    fn fixture() -> Fixture {
        let store = StateStore::open_in_memory().unwrap();
        let web = Job::new("default", "web", JobType::Service)
            .with_task_group(TaskGroup::new("web", 3));
        let mut api = Job::new("prod", "api", JobType::Batch)
            .with_task_group(TaskGroup::new("api", 1));
        api.priority = 70;
        store.upsert_job(&web).unwrap();
        store.upsert_job(&api).unwrap();
        Fixture { store, web, api }
    }

    fn batcher(
        f: &Fixture,
        applier: Arc<RecordingApplier>,
        max_ids: usize,
        scope: &CancellationToken,
    ) -> Arc<AllocMigrateBatcher> {
        AllocMigrateBatcher::new(
            f.store.clone(),
            applier,
            Duration::from_secs(1),
            max_ids,
            scope.clone(),
            BackgroundTasks::new(),
        )
    }

    fn eval(job: &str) -> Evaluation {
        let now = SystemTime::now();
        Evaluation {
            id: format!("e-{job}"),
            namespace: "default".to_string(),
            priority: 50,
            job_type: JobType::Service,
            triggered_by: EVAL_TRIGGER_NODE_DRAIN.to_string(),
            job_id: job.to_string(),
            status: EvalStatus::Pending,
            create_time: now,
            modify_time: now,
            create_index: 0,
            modify_index: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn appends_within_the_interval_share_one_commit() {
        let f = fixture();
        let applier = Arc::new(RecordingApplier::default());
        let scope = CancellationToken::new();
        let batcher = batcher(&f, applier.clone(), 100, &scope);

        let first = batcher.append(vec![Allocation::new("a1", &f.web, "web", "n1")]);
        tokio::time::sleep(Duration::from_millis(400)).await;
        let second = batcher.append(vec![
            Allocation::new("a2", &f.web, "web", "n1"),
            Allocation::new("b1", &f.api, "api", "n1"),
        ]);
        assert!(first.result().is_none());

        assert_eq!(first.wait().await.unwrap(), 101);
        assert_eq!(second.wait().await.unwrap(), 101);

        let calls = applier.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let mut ids: Vec<_> = calls[0].transitions.keys().cloned().collect();
        ids.sort();
        assert_eq!(ids, vec!["a1", "a2", "b1"]);
        assert!(calls[0].transitions.values().all(|t| t.should_migrate()));

        let mut evals: Vec<_> = calls[0]
            .evals
            .iter()
            .map(|e| (e.namespace.clone(), e.job_id.clone(), e.priority, e.job_type.to_string()))
            .collect();
        evals.sort();
        assert_eq!(
            evals,
            vec![
                ("default".to_string(), "web".to_string(), 50, "service".to_string()),
                ("prod".to_string(), "api".to_string(), 70, "batch".to_string()),
            ]
        );
        assert!(calls[0].evals.iter().all(|e| {
            e.triggered_by == EVAL_TRIGGER_NODE_DRAIN && e.status == EvalStatus::Pending
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn a_new_batch_opens_after_commit() {
        let f = fixture();
        let applier = Arc::new(RecordingApplier::default());
        let scope = CancellationToken::new();
        let batcher = batcher(&f, applier.clone(), 100, &scope);

        let first = batcher.append(vec![Allocation::new("a1", &f.web, "web", "n1")]);
        assert_eq!(first.wait().await.unwrap(), 101);
        let second = batcher.append(vec![Allocation::new("a2", &f.web, "web", "n1")]);
        assert_eq!(second.wait().await.unwrap(), 102);
        assert_eq!(applier.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn large_batches_are_split_and_answer_with_the_last_index() {
        let f = fixture();
        let applier = Arc::new(RecordingApplier::default());
        let scope = CancellationToken::new();
        let batcher = batcher(&f, applier.clone(), 2, &scope);

        let allocs = (0..3)
            .map(|i| Allocation::new(&format!("a{i}"), &f.web, "web", "n1"))
            .collect();
        let future = batcher.append(allocs);
        assert_eq!(future.wait().await.unwrap(), 102);

        let calls = applier.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].transitions.len(), 2);
        assert!(calls[0].evals.is_empty());
        assert_eq!(calls[1].transitions.len(), 1);
        assert_eq!(calls[1].evals.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn commit_failure_reaches_every_waiter() {
        let f = fixture();
        let applier = Arc::new(RecordingApplier::default());
        *applier.fail.lock().unwrap() = true;
        let scope = CancellationToken::new();
        let batcher = batcher(&f, applier.clone(), 100, &scope);

        let first = batcher.append(vec![Allocation::new("a1", &f.web, "web", "n1")]);
        let second = batcher.append(vec![Allocation::new("a2", &f.web, "web", "n1")]);
        assert!(matches!(first.wait().await, Err(DrainError::Apply(_))));
        assert!(matches!(second.wait().await, Err(DrainError::Apply(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn purged_jobs_get_no_evaluation() {
        let f = fixture();
        let gone = Job::new("default", "gone", JobType::Service)
            .with_task_group(TaskGroup::new("g", 1));
        let applier = Arc::new(RecordingApplier::default());
        let scope = CancellationToken::new();
        let batcher = batcher(&f, applier.clone(), 100, &scope);

        let future = batcher.append(vec![
            Allocation::new("a1", &gone, "g", "n1"),
            Allocation::new("a2", &f.web, "web", "n1"),
        ]);
        future.wait().await.unwrap();
        let calls = applier.calls.lock().unwrap();
        assert_eq!(calls[0].transitions.len(), 2);
        assert_eq!(calls[0].evals.len(), 1);
        assert_eq!(calls[0].evals[0].job_id, "web");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_fails_the_open_batch() {
        let f = fixture();
        let applier = Arc::new(RecordingApplier::default());
        let scope = CancellationToken::new();
        let batcher = batcher(&f, applier.clone(), 100, &scope);

        let future = batcher.append(vec![Allocation::new("a1", &f.web, "web", "n1")]);
        scope.cancel();
        assert!(matches!(future.wait().await, Err(DrainError::Cancelled)));
        assert!(applier.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_runs_in_the_shared_task_set() {
        let f = fixture();
        let applier = Arc::new(RecordingApplier::default());
        let scope = CancellationToken::new();
        let tasks = BackgroundTasks::new();
        let batcher = AllocMigrateBatcher::new(
            f.store.clone(),
            applier.clone(),
            Duration::from_secs(1),
            100,
            scope.clone(),
            tasks.clone(),
        );

        let future = batcher.append(vec![Allocation::new("a1", &f.web, "web", "n1")]);
        batcher.append(vec![Allocation::new("a2", &f.web, "web", "n1")]);
        assert_eq!(tasks.len(), 1);

        tasks.join_all().await;
        assert!(matches!(future.result(), Some(Ok(101))));
        assert_eq!(applier.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn partition_fills_allocs_before_evals() {
        let transitions: HashMap<_, _> = ["a3", "a1", "a2"]
            .iter()
            .map(|id| (id.to_string(), DesiredTransition::migrate()))
            .collect();
        let evals = vec![eval("j1"), eval("j2"), eval("j3")];

        let chunks = partition_transitions(2, transitions, evals);
        let shape: Vec<(Vec<String>, Vec<String>)> = chunks
            .iter()
            .map(|c| {
                let mut ids: Vec<_> = c.transitions.keys().cloned().collect();
                ids.sort();
                (ids, c.evals.iter().map(|e| e.job_id.clone()).collect())
            })
            .collect();
        assert_eq!(
            shape,
            vec![
                (vec!["a1".to_string(), "a2".to_string()], vec![]),
                (vec!["a3".to_string()], vec!["j1".to_string()]),
                (vec![], vec!["j2".to_string(), "j3".to_string()]),
            ]
        );
    }

    #[test]
    fn partition_of_nothing_is_empty() {
        assert!(partition_transitions(10, HashMap::new(), Vec::new()).is_empty());
    }
}
