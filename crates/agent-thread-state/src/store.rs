use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::audit::TransitionAuditor;
use crate::config::{ReconcileConfig, ThreadStateConfig};
use crate::model::{ThreadPatch, ThreadSnapshot};
use crate::reconcile::{Reconciliation, reconcile_detailed};

/// Per-thread snapshots. Every write goes through `reconcile`, so callers never
/// assign snapshot fields directly.
#[derive(Debug)]
pub struct ThreadStateStore {
    threads: Mutex<HashMap<String, ThreadSnapshot>>,
    config: ReconcileConfig,
    auditor: TransitionAuditor,
}

impl Default for ThreadStateStore {
    fn default() -> Self {
        Self::new(ReconcileConfig::default(), TransitionAuditor::disabled())
    }
}

impl ThreadStateStore {
    #[must_use]
    pub fn new(config: ReconcileConfig, auditor: TransitionAuditor) -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
            config,
            auditor,
        }
    }

    #[must_use]
    pub fn from_config(config: ThreadStateConfig) -> Self {
        Self::new(config.reconcile, TransitionAuditor::new(config.audit))
    }

    #[must_use]
    pub fn auditor(&self) -> &TransitionAuditor {
        &self.auditor
    }

    #[must_use]
    pub fn reconcile_config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Reconciles `patch` into the stored snapshot for `thread_id` and audits
    /// the transition. Unknown threads start from the default snapshot.
    pub fn apply(&self, thread_id: &str, source: &str, patch: &ThreadPatch) -> Reconciliation {
        let reconciliation = {
            let mut threads = self.lock();
            let previous = threads.get(thread_id).cloned().unwrap_or_default();
            let reconciliation = reconcile_detailed(&previous, Some(patch), &self.config);
            threads.insert(thread_id.to_string(), reconciliation.snapshot.clone());
            // audit lines must land in the order the snapshots were accepted
            self.auditor
                .record(source, &previous, &reconciliation.snapshot, Some(patch));
            reconciliation
        };

        if reconciliation.engagement_reset {
            tracing::info!(thread_id, source, "thread engagement reset on hire");
        }
        if reconciliation.task_preserved {
            tracing::debug!(thread_id, source, "kept interrupted task over stale retry");
        }
        reconciliation
    }

    /// Installs a previously persisted snapshot as-is, replacing any current one.
    pub fn seed(&self, thread_id: &str, snapshot: ThreadSnapshot) {
        self.lock().insert(thread_id.to_string(), snapshot);
    }

    #[must_use]
    pub fn snapshot(&self, thread_id: &str) -> Option<ThreadSnapshot> {
        self.lock().get(thread_id).cloned()
    }

    #[must_use]
    pub fn thread_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn forget(&self, thread_id: &str) -> Option<ThreadSnapshot> {
        self.lock().remove(thread_id)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ThreadSnapshot>> {
        self.threads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
