// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory dedup configuration store.
//!
//! The control plane owns persistence for [`DedupConfig`]; the dedup stage
//! only ever holds the latest snapshot it was told about, either at
//! startup or via a `dedup_config_updated` control event. Single-writer
//! (the control-event handler), multi-reader (the `process` loop),
//! installed with a single pointer swap under a read-write lock.

use pipeline_envelope::DedupConfig;
use std::sync::{Arc, RwLock};

/// Read-only access to the current dedup configuration snapshot.
pub trait DedupConfigProvider: Send + Sync {
    /// The currently active configuration.
    fn current(&self) -> Arc<DedupConfig>;
}

/// Holds the dedup stage's live configuration snapshot.
pub struct InMemoryDedupConfigStore {
    inner: RwLock<Arc<DedupConfig>>,
}

impl InMemoryDedupConfigStore {
    pub fn new(initial: DedupConfig) -> Self {
        Self {
            inner: RwLock::new(Arc::new(initial)),
        }
    }

    /// Install a new configuration snapshot, replacing the old one
    /// atomically. Readers mid-flight continue to see the old snapshot.
    pub fn replace(&self, new_config: DedupConfig) {
        let mut guard = self.inner.write().expect("dedup config lock poisoned");
        *guard = Arc::new(new_config);
    }
}

impl DedupConfigProvider for InMemoryDedupConfigStore {
    fn current(&self) -> Arc<DedupConfig> {
        Arc::clone(&self.inner.read().expect("dedup config lock poisoned"))
    }
}
