//! Cancellable operation context with per-unit progress reporting.
//!
//! Long-running driver operations accept an [`Operation`] from the layer
//! above. The driver's only contract is to check for cancellation between
//! logical units of work and to pass progress sinks into the transfer
//! primitive; scheduling and user-facing reporting live with the caller.

use crate::error::{Result, StorageError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Shared handle to one in-flight storage operation.
#[derive(Clone, Default)]
pub struct Operation {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    progress: Mutex<HashMap<String, Arc<AtomicU64>>>,
}

impl Operation {
    /// Create a fresh operation context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the operation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with [`StorageError::Cancelled`] if cancellation was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        Ok(())
    }

    /// Create a byte-counting progress sink for one logical transfer unit
    /// (one snapshot, or the main volume).
    pub fn progress_sink(&self, label: &str) -> ProgressSink {
        let counter = {
            let mut progress = self.inner.progress.lock().unwrap();
            progress.entry(label.to_string()).or_default().clone()
        };
        ProgressSink { label: label.to_string(), counter }
    }

    /// Snapshot of bytes reported so far, keyed by unit label.
    #[must_use]
    pub fn progress(&self) -> HashMap<String, u64> {
        let progress = self.inner.progress.lock().unwrap();
        progress.iter().map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed))).collect()
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation").field("cancelled", &self.is_cancelled()).finish()
    }
}

/// Byte counter for one transfer unit, handed to the transfer primitive.
#[derive(Clone)]
pub struct ProgressSink {
    label: String,
    counter: Arc<AtomicU64>,
}

impl ProgressSink {
    /// Record `bytes` of transferred data.
    pub fn add_bytes(&self, bytes: u64) {
        let total = self.counter.fetch_add(bytes, Ordering::Relaxed) + bytes;
        debug!(unit = %self.label, total_bytes = total, "transfer progress");
    }

    /// Label of the unit this sink reports for.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}
