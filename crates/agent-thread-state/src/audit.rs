use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::AuditConfig;
use crate::model::{ThreadPatch, ThreadSnapshot};
use crate::summary::{SnapshotSummary, changed_fields, summarize};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to create audit directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to append audit record to {path}: {source}")]
    Append {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode audit record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One JSON line in the transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub timestamp: String,
    pub source: String,
    pub changed_fields: Vec<String>,
    pub patch_keys: Vec<String>,
    pub previous_summary: BTreeMap<String, Value>,
    pub next_summary: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Disabled,
    /// No audited field changed; nothing written.
    Unchanged,
    Appended,
    /// Write failed. Logged at most once per auditor.
    Failed,
}

/// Best-effort append-only log of accepted reconciliations.
#[derive(Debug)]
pub struct TransitionAuditor {
    config: AuditConfig,
    warned: AtomicBool,
    write_lock: Mutex<()>,
}

impl TransitionAuditor {
    #[must_use]
    pub fn new(config: AuditConfig) -> Self {
        Self {
            config,
            warned: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self::new(AuditConfig::default())
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    #[must_use]
    pub fn has_warned(&self) -> bool {
        self.warned.load(Ordering::Relaxed)
    }

    pub fn reset_warning(&self) {
        self.warned.store(false, Ordering::Relaxed);
    }

    /// Records a transition. Never fails; I/O errors are swallowed after one warning.
    pub fn record(
        &self,
        source: &str,
        previous: &ThreadSnapshot,
        next: &ThreadSnapshot,
        patch: Option<&ThreadPatch>,
    ) -> AuditOutcome {
        if !self.config.enabled {
            return AuditOutcome::Disabled;
        }
        let Some(record) = self.build_record(source, previous, next, patch) else {
            return AuditOutcome::Unchanged;
        };
        match self.append(&record) {
            Ok(()) => AuditOutcome::Appended,
            Err(error) => {
                if !self.warned.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        path = %self.config.path.display(),
                        reason = %error,
                        "thread transition audit write failed; suppressing further warnings"
                    );
                }
                AuditOutcome::Failed
            }
        }
    }

    #[must_use]
    pub fn build_record(
        &self,
        source: &str,
        previous: &ThreadSnapshot,
        next: &ThreadSnapshot,
        patch: Option<&ThreadPatch>,
    ) -> Option<TransitionRecord> {
        let previous_summary = summarize(previous);
        let next_summary = summarize(next);
        let changed = changed_fields(&previous_summary, &next_summary);
        if changed.is_empty() {
            return None;
        }
        let patch_body = if self.config.include_patch {
            patch.and_then(|patch| serde_json::to_value(patch).ok())
        } else {
            None
        };
        Some(TransitionRecord {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            source: source.to_string(),
            changed_fields: changed.into_iter().map(str::to_string).collect(),
            patch_keys: patch.map(ThreadPatch::present_keys).unwrap_or_default(),
            previous_summary: owned_summary(previous_summary),
            next_summary: owned_summary(next_summary),
            patch: patch_body,
        })
    }

    fn append(&self, record: &TransitionRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let path = &self.config.path;
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| AuditError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| AuditError::Append {
                path: path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .map_err(|source| AuditError::Append {
                path: path.clone(),
                source,
            })
    }
}

fn owned_summary(summary: SnapshotSummary) -> BTreeMap<String, Value> {
    summary
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::json;
    use tempfile::tempdir;

    use super::{AuditOutcome, TransitionAuditor, TransitionRecord};
    use crate::config::AuditConfig;
    use crate::model::{ThreadPatch, ThreadSnapshot};

    fn auditor(path: PathBuf, include_patch: bool) -> TransitionAuditor {
        TransitionAuditor::new(AuditConfig {
            enabled: true,
            include_patch,
            path,
        })
    }

    fn halted() -> (ThreadSnapshot, ThreadSnapshot, ThreadPatch) {
        let previous = ThreadSnapshot::default();
        let patch = ThreadPatch {
            halt_reason: Some("drawdown limit".to_string()),
            ..ThreadPatch::default()
        };
        let mut next = previous.clone();
        next.halt_reason = patch.halt_reason.clone();
        (previous, next, patch)
    }

    fn read_records(path: &std::path::Path) -> Vec<TransitionRecord> {
        std::fs::read_to_string(path)
            .expect("audit log should exist")
            .lines()
            .map(|line| serde_json::from_str(line).expect("audit line should decode"))
            .collect()
    }

    #[test]
    fn disabled_auditor_writes_nothing() {
        let temp = tempdir().expect("tempdir should create");
        let path = temp.path().join("audit.jsonl");
        let auditor = TransitionAuditor::new(AuditConfig {
            enabled: false,
            include_patch: true,
            path: path.clone(),
        });
        let (previous, next, patch) = halted();
        assert_eq!(
            auditor.record("local", &previous, &next, Some(&patch)),
            AuditOutcome::Disabled
        );
        assert!(!path.exists());
    }

    #[test]
    fn appends_record_and_creates_parent_directories() {
        let temp = tempdir().expect("tempdir should create");
        let path = temp.path().join("nested/dir/audit.jsonl");
        let auditor = auditor(path.clone(), false);
        let (previous, next, patch) = halted();

        assert_eq!(
            auditor.record("remote-run", &previous, &next, Some(&patch)),
            AuditOutcome::Appended
        );
        assert_eq!(
            auditor.record("remote-run", &previous, &next, Some(&patch)),
            AuditOutcome::Appended
        );

        let records = read_records(&path);
        assert_eq!(records.len(), 2);
        let record = &records[0];
        assert_eq!(record.source, "remote-run");
        assert_eq!(record.changed_fields, vec!["haltReason".to_string()]);
        assert_eq!(record.patch_keys, vec!["haltReason".to_string()]);
        assert_eq!(record.previous_summary["haltReason"], json!(null));
        assert_eq!(record.next_summary["haltReason"], json!("drawdown limit"));
        assert_eq!(record.patch, None);
    }

    #[test]
    fn verbose_mode_includes_patch_body() {
        let temp = tempdir().expect("tempdir should create");
        let path = temp.path().join("audit.jsonl");
        let auditor = auditor(path.clone(), true);
        let (previous, next, patch) = halted();
        auditor.record("local", &previous, &next, Some(&patch));

        let records = read_records(&path);
        assert_eq!(
            records[0].patch,
            Some(json!({"haltReason": "drawdown limit"}))
        );
    }

    #[test]
    fn unchanged_projection_is_skipped() {
        let temp = tempdir().expect("tempdir should create");
        let path = temp.path().join("audit.jsonl");
        let auditor = auditor(path.clone(), false);
        let previous = ThreadSnapshot::default();
        let mut next = previous.clone();
        next.metrics.insert("apy".to_string(), json!(0.12));

        assert_eq!(
            auditor.record("poll", &previous, &next, None),
            AuditOutcome::Unchanged
        );
        assert!(!path.exists());
    }

    #[test]
    fn io_failure_is_swallowed_and_warned_once() {
        let temp = tempdir().expect("tempdir should create");
        // a directory where the log file should be makes every append fail
        let path = temp.path().join("blocked");
        std::fs::create_dir_all(&path).expect("blocking dir should create");
        let auditor = auditor(path, false);
        let (previous, next, patch) = halted();

        assert!(!auditor.has_warned());
        assert_eq!(
            auditor.record("local", &previous, &next, Some(&patch)),
            AuditOutcome::Failed
        );
        assert!(auditor.has_warned());
        assert_eq!(
            auditor.record("local", &previous, &next, Some(&patch)),
            AuditOutcome::Failed
        );

        auditor.reset_warning();
        assert!(!auditor.has_warned());
    }
}
