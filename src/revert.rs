//! Incremental rollback list for multi-step filesystem operations.
//!
//! The filesystem gives us no atomic commit primitive, so every operation
//! follows the same discipline: append an undo action the instant a side
//! effect succeeds, run the accumulated actions in reverse if the operation
//! fails before its designated success point, and drop them all on success.

use std::future::Future;
use std::pin::Pin;
use tracing::debug;

type UndoFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Ordered list of undo actions guarding one in-flight operation.
#[derive(Default)]
pub struct Reverter {
    undo: Vec<UndoFn>,
}

impl Reverter {
    /// Create an empty rollback list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an undo action for a side effect that just succeeded.
    ///
    /// Undo actions must not fail the rollback; they log and continue.
    pub fn add<F, Fut>(&mut self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.undo.push(Box::new(move || Box::pin(f())));
    }

    /// Number of registered undo actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.undo.len()
    }

    /// Whether no undo actions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.undo.is_empty()
    }

    /// Mark the operation successful, discarding all undo actions.
    pub fn commit(&mut self) {
        self.undo.clear();
    }

    /// Run all undo actions in reverse order of registration.
    pub async fn run(&mut self) {
        debug!(actions = self.undo.len(), "rolling back partial operation");
        while let Some(undo) = self.undo.pop() {
            undo().await;
        }
    }

    /// Guarded cleanup: commit on success, roll back on failure.
    ///
    /// Call as the single exit point of an operation body so the rollback
    /// list is settled on every path.
    pub async fn settle<T>(mut self, result: crate::error::Result<T>) -> crate::error::Result<T> {
        match result {
            Ok(value) => {
                self.commit();
                Ok(value)
            }
            Err(err) => {
                self.run().await;
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for Reverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reverter").field("pending", &self.undo.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use std::sync::{Arc, Mutex};

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> impl FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let log = log.clone();
        move || {
            Box::pin(async move {
                log.lock().unwrap().push(tag);
            })
        }
    }

    #[tokio::test]
    async fn test_runs_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut revert = Reverter::new();
        revert.add(recorder(&log, "first"));
        revert.add(recorder(&log, "second"));
        revert.add(recorder(&log, "third"));

        revert.run().await;
        assert_eq!(*log.lock().unwrap(), vec!["third", "second", "first"]);
        assert!(revert.is_empty());
    }

    #[tokio::test]
    async fn test_settle_commits_on_success() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut revert = Reverter::new();
        revert.add(recorder(&log, "undo"));

        let out = revert.settle(Ok(42)).await.unwrap();
        assert_eq!(out, 42);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_settle_rolls_back_on_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut revert = Reverter::new();
        revert.add(recorder(&log, "undo"));

        let err = revert
            .settle::<()>(Err(StorageError::Internal("boom".to_string())))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Internal(_)));
        assert_eq!(*log.lock().unwrap(), vec!["undo"]);
    }
}
