//! One-shot, many-waiter completion handle for a batched commit.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{DrainError, DrainResult};

/// Completed exactly once with the commit index (or error) of a batch;
/// any number of clones may wait on it, before or after completion.
#[derive(Debug, Clone)]
pub struct BatchFuture {
    slot: Arc<watch::Sender<Option<DrainResult<u64>>>>,
}

impl BatchFuture {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Complete the future. Returns false if it was already completed, in
    /// which case `result` is dropped.
    pub fn respond(&self, result: DrainResult<u64>) -> bool {
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        })
    }

    /// Wait for completion and return the shared result.
    pub async fn wait(&self) -> DrainResult<u64> {
        let mut rx = self.slot.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(result) => result.clone().unwrap_or(Err(DrainError::Cancelled)),
            Err(_) => Err(DrainError::Cancelled),
        }
    }

    /// The result, if the future has completed.
    pub fn result(&self) -> Option<DrainResult<u64>> {
        self.slot.borrow().clone()
    }
}

impl Default for BatchFuture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_waiter_sees_the_same_result() {
        let future = BatchFuture::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let f = future.clone();
                tokio::spawn(async move { f.wait().await })
            })
            .collect();
        tokio::task::yield_now().await;

        assert!(future.respond(Ok(42)));
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), 42);
        }
    }

    #[tokio::test]
    async fn only_the_first_response_counts() {
        let future = BatchFuture::new();
        assert!(future.respond(Err(DrainError::Apply("raft unavailable".into()))));
        assert!(!future.respond(Ok(7)));

        let err = future.wait().await.unwrap_err();
        assert!(matches!(err, DrainError::Apply(msg) if msg == "raft unavailable"));
    }

    #[tokio::test]
    async fn late_waiter_gets_completed_result() {
        let future = BatchFuture::new();
        assert!(future.result().is_none());
        future.respond(Ok(3));
        assert_eq!(future.wait().await.unwrap(), 3);
        assert!(matches!(future.result(), Some(Ok(3))));
    }
}
