use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::model::ThreadSnapshot;

/// Flattened scalar projection of the audited snapshot fields.
pub type SnapshotSummary = BTreeMap<&'static str, Value>;

#[must_use]
pub fn summarize(snapshot: &ThreadSnapshot) -> SnapshotSummary {
    let task = snapshot.task.as_ref();
    let onboarding = snapshot.onboarding.as_ref();
    BTreeMap::from([
        ("phase", json!(snapshot.lifecycle.phase.as_str())),
        ("taskId", json!(task.map(|task| task.id.as_str()))),
        (
            "taskState",
            json!(task.map(|task| task.status.state.as_str())),
        ),
        (
            "taskTimestamp",
            json!(task.and_then(|task| task.status.timestamp.as_deref())),
        ),
        (
            "taskMessage",
            json!(task.and_then(|task| task.status.message.as_deref())),
        ),
        ("onboardingStep", json!(onboarding.map(|marker| marker.step))),
        (
            "onboardingKey",
            json!(onboarding.and_then(|marker| marker.key.as_deref())),
        ),
        (
            "onboardingFlowStatus",
            json!(snapshot.flow_status().map(|status| status.as_str())),
        ),
        ("selectedItemId", json!(snapshot.selected_item_id)),
        ("haltReason", json!(snapshot.halt_reason)),
        ("executionError", json!(snapshot.execution_error)),
        (
            "delegationsBypassActive",
            json!(snapshot.delegations_bypass_active),
        ),
        ("telemetryCount", json!(snapshot.activity.telemetry.len())),
        ("eventsCount", json!(snapshot.activity.events.len())),
        (
            "transactionHistoryCount",
            json!(snapshot.transaction_history.len()),
        ),
        (
            "navSnapshotsCount",
            json!(snapshot.accounting.nav_snapshots.len()),
        ),
        ("flowLogCount", json!(snapshot.accounting.flow_log.len())),
    ])
}

/// Names of projected fields whose values differ, in key order.
#[must_use]
pub fn changed_fields(previous: &SnapshotSummary, next: &SnapshotSummary) -> Vec<&'static str> {
    next.iter()
        .filter(|(key, value)| previous.get(*key) != Some(*value))
        .map(|(key, _)| *key)
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{changed_fields, summarize};
    use crate::model::{Task, TaskState, ThreadSnapshot};

    #[test]
    fn summary_projects_lengths_and_task_fields() {
        let mut snapshot = ThreadSnapshot::default();
        snapshot.task = Some(Task::new("task-9", TaskState::Working));
        snapshot.activity.telemetry = vec![json!({"cycle": 1}), json!({"cycle": 2})];

        let summary = summarize(&snapshot);
        assert_eq!(summary["phase"], json!("prehire"));
        assert_eq!(summary["taskId"], json!("task-9"));
        assert_eq!(summary["taskState"], json!("working"));
        assert_eq!(summary["taskMessage"], json!(null));
        assert_eq!(summary["telemetryCount"], json!(2));
    }

    #[test]
    fn changes_outside_projection_are_invisible() {
        let previous = ThreadSnapshot::default();
        let mut next = previous.clone();
        next.metrics.insert("aumUsd".to_string(), json!(1200));
        assert!(changed_fields(&summarize(&previous), &summarize(&next)).is_empty());

        next.halt_reason = Some("risk limit".to_string());
        assert_eq!(
            changed_fields(&summarize(&previous), &summarize(&next)),
            vec!["haltReason"]
        );
    }
}
