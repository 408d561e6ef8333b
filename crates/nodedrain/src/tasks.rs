//! Short-lived tasks spawned on behalf of one enabled period: batch flushes,
//! drain-request relays and batch-failure logging. Disabling the drainer
//! joins every one of them.

use std::future::Future;
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinSet;
use tracing::warn;

#[derive(Clone, Default)]
pub struct BackgroundTasks {
    set: Arc<Mutex<JoinSet<()>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` into the set. Finished tasks are reaped first so the
    /// set only grows with work that is still running.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.lock();
        while let Some(res) = set.try_join_next() {
            log_abnormal_exit(res);
        }
        set.spawn(task);
    }

    /// Tasks spawned and not yet reaped.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for every spawned task, including ones spawned while waiting.
    /// Callers cancel the tasks' scope first.
    pub async fn join_all(&self) {
        loop {
            let mut set = mem::take(&mut *self.lock());
            if set.is_empty() {
                return;
            }
            while let Some(res) = set.join_next().await {
                log_abnormal_exit(res);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn log_abnormal_exit(res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        if !e.is_cancelled() {
            warn!(error = %e, "drainer background task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn join_all_waits_for_running_tasks() {
        let tasks = BackgroundTasks::new();
        let finished = Arc::new(AtomicUsize::new(0));
        for secs in [1, 5, 30] {
            let finished = finished.clone();
            tasks.spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(tasks.len(), 3);

        tasks.join_all().await;
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert!(tasks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn join_all_covers_tasks_spawned_while_joining() {
        let tasks = BackgroundTasks::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let inner = (tasks.clone(), finished.clone());
        tasks.spawn(async move {
            let (tasks, finished) = inner;
            tokio::time::sleep(Duration::from_secs(1)).await;
            let nested = finished.clone();
            tasks.spawn(async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                nested.fetch_add(1, Ordering::SeqCst);
            });
            finished.fetch_add(1, Ordering::SeqCst);
        });

        tasks.join_all().await;
        assert_eq!(finished.load(Ordering::SeqCst), 2);
        assert!(tasks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn finished_tasks_are_reaped_on_spawn() {
        let tasks = BackgroundTasks::new();
        tasks.spawn(async {});
        tokio::time::sleep(Duration::from_millis(10)).await;
        tasks.spawn(std::future::pending());
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn panicking_task_does_not_stop_the_join() {
        let tasks = BackgroundTasks::new();
        tasks.spawn(async { panic!("boom") });
        tasks.spawn(async {});
        tasks.join_all().await;
        assert!(tasks.is_empty());
    }
}
