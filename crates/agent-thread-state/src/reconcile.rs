use serde_json::{Map, Value};
use tracing::debug;

use crate::config::ReconcileConfig;
use crate::history::merge_bounded;
use crate::lifecycle::{PhaseInputs, resolve_phase};
use crate::model::{
    Accounting, Activity, Lifecycle, LifecyclePhase, OnboardingFlowStatus, Task, ThreadPatch,
    ThreadSnapshot,
};
use crate::onboarding::{FlowInputs, derive_onboarding_flow, resolve_monotonic};
use crate::summary::{changed_fields, summarize};
use crate::task_guard::{ArtifactPresence, StaleTaskInputs, should_preserve_previous_task};

/// Result of one merge, with the bookkeeping callers and the auditor use.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub snapshot: ThreadSnapshot,
    /// The patch carried a hire confirmation and the base was reset first.
    pub engagement_reset: bool,
    /// The incoming task was dropped as a stale retry of an interrupt.
    pub task_preserved: bool,
    pub changed_fields: Vec<&'static str>,
}

/// Merges `patch` into `base`. An absent or empty patch returns `base` unchanged.
#[must_use]
pub fn reconcile(
    base: &ThreadSnapshot,
    patch: Option<&ThreadPatch>,
    config: &ReconcileConfig,
) -> ThreadSnapshot {
    reconcile_detailed(base, patch, config).snapshot
}

#[must_use]
pub fn reconcile_detailed(
    base: &ThreadSnapshot,
    patch: Option<&ThreadPatch>,
    config: &ReconcileConfig,
) -> Reconciliation {
    let Some(patch) = patch.filter(|patch| !patch.is_empty()) else {
        return Reconciliation {
            snapshot: base.clone(),
            engagement_reset: false,
            task_preserved: false,
            changed_fields: Vec::new(),
        };
    };
    let original = base;

    // Order matters: reset, then onboarding/task/flow, then phase, then fields.
    let engagement_reset = patch.is_new_engagement();
    let reset_base;
    let base = if engagement_reset {
        debug!(
            bypass = base.delegations_bypass_active,
            "new engagement detected; resetting thread snapshot"
        );
        reset_base = base.engagement_reset();
        &reset_base
    } else {
        base
    };
    let milestones = &config.milestones;

    let onboarding = resolve_monotonic(
        base.onboarding.as_ref(),
        patch.onboarding.as_ref(),
        milestones,
    );
    if patch.onboarding.is_some() && onboarding != patch.onboarding {
        debug!("rejected onboarding regression");
    }

    let operator_input = prefer_incoming(&patch.operator_input, &base.operator_input);
    let funding_token_input =
        prefer_incoming(&patch.funding_token_input, &base.funding_token_input);
    let delegation_bundle = prefer_incoming(&patch.delegation_bundle, &base.delegation_bundle);
    let operator_config = prefer_incoming(&patch.operator_config, &base.operator_config);
    let delegations_bypass_active = patch
        .delegations_bypass_active
        .unwrap_or(base.delegations_bypass_active);

    let task_preserved = should_preserve_previous_task(
        StaleTaskInputs {
            previous_task: base.task.as_ref(),
            incoming_task: patch.task.as_ref(),
            previous_onboarding: base.onboarding.as_ref(),
            incoming_onboarding: patch.onboarding.as_ref(),
            flow_status: base.flow_status(),
            previous_artifacts: ArtifactPresence::of_snapshot(base),
            incoming_artifacts: ArtifactPresence::of_patch(patch),
        },
        milestones,
    );
    let task = if task_preserved {
        debug!("kept input-required task over duplicate working transition");
        base.task.clone()
    } else {
        prefer_incoming(&patch.task, &base.task)
    };
    let task_state = task.as_ref().map(Task::state);

    let delegation_satisfied = delegation_bundle.is_some() || delegations_bypass_active;
    let onboarding_flow = derive_onboarding_flow(FlowInputs {
        onboarding: onboarding.as_ref(),
        previous: base.onboarding_flow.as_ref(),
        has_operator_config: operator_config.is_some(),
        delegation_satisfied,
        task_state,
    });
    let flow_status = onboarding_flow.as_ref().map(|flow| flow.status);
    let onboarding = if flow_status == Some(OnboardingFlowStatus::Completed) {
        None
    } else {
        onboarding
    };

    let requested = patch.requested_phase();
    let phase = resolve_phase(PhaseInputs {
        previous: base.lifecycle.phase,
        task_state,
        flow_status,
        onboarding_step: onboarding.as_ref().map(|marker| marker.step),
        requested,
        has_operator_config: operator_config.is_some(),
        has_delegation_bundle: delegation_satisfied,
        fire_requested: requested == Some(LifecyclePhase::Firing),
    });
    let lifecycle_patch = patch.lifecycle.as_ref();
    let lifecycle = Lifecycle {
        phase,
        reason: lifecycle_patch
            .and_then(|lifecycle| lifecycle.reason.clone())
            .or_else(|| base.lifecycle.reason.clone()),
        updated_at: lifecycle_patch
            .and_then(|lifecycle| lifecycle.updated_at.clone())
            .or_else(|| base.lifecycle.updated_at.clone()),
    };

    let state_limit = config.state_history_limit;
    let accounting_limit = config.accounting_history_limit;
    let activity_patch = patch.activity.as_ref();
    let accounting_patch = patch.accounting.as_ref();
    let activity = Activity {
        telemetry: merge_bounded(
            &base.activity.telemetry,
            activity_patch.and_then(|activity| activity.telemetry.as_deref()),
            state_limit,
        ),
        events: merge_bounded(
            &base.activity.events,
            activity_patch.and_then(|activity| activity.events.as_deref()),
            state_limit,
        ),
    };
    let accounting = Accounting {
        nav_snapshots: merge_bounded(
            &base.accounting.nav_snapshots,
            accounting_patch.and_then(|accounting| accounting.nav_snapshots.as_deref()),
            accounting_limit,
        ),
        flow_log: merge_bounded(
            &base.accounting.flow_log,
            accounting_patch.and_then(|accounting| accounting.flow_log.as_deref()),
            accounting_limit,
        ),
        fields: merge_object(
            &base.accounting.fields,
            accounting_patch.map(|accounting| &accounting.fields),
        ),
    };

    let snapshot = ThreadSnapshot {
        lifecycle,
        task,
        onboarding,
        onboarding_flow,
        operator_input,
        funding_token_input,
        delegation_bundle,
        operator_config,
        profile: merge_object(&base.profile, patch.profile.as_ref()),
        metrics: merge_object(&base.metrics, patch.metrics.as_ref()),
        accounting,
        activity,
        transaction_history: merge_bounded(
            &base.transaction_history,
            patch.transaction_history.as_deref(),
            state_limit,
        ),
        selected_item_id: prefer_incoming(&patch.selected_item_id, &base.selected_item_id),
        halt_reason: prefer_incoming(&patch.halt_reason, &base.halt_reason),
        execution_error: prefer_incoming(&patch.execution_error, &base.execution_error),
        delegations_bypass_active,
    };
    let changed_fields = changed_fields(&summarize(original), &summarize(&snapshot));

    Reconciliation {
        snapshot,
        engagement_reset,
        task_preserved,
        changed_fields,
    }
}

fn prefer_incoming<T: Clone>(incoming: &Option<T>, current: &Option<T>) -> Option<T> {
    incoming.as_ref().or(current.as_ref()).cloned()
}

/// Key-by-key merge; incoming keys win, explicit nulls carry no opinion.
fn merge_object(
    current: &Map<String, Value>,
    incoming: Option<&Map<String, Value>>,
) -> Map<String, Value> {
    let mut merged = current.clone();
    for (key, value) in incoming.into_iter().flatten() {
        if value.is_null() {
            continue;
        }
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::{reconcile, reconcile_detailed};
    use crate::config::ReconcileConfig;
    use crate::model::{
        AccountingPatch, ActivityPatch, LifecyclePatch, LifecyclePhase, OnboardingFlowStatus,
        OnboardingMarker, Task, TaskState, ThreadPatch, ThreadSnapshot,
    };

    fn config() -> ReconcileConfig {
        ReconcileConfig::default()
    }

    fn onboarding_snapshot(step: u32) -> ThreadSnapshot {
        let patch = ThreadPatch {
            lifecycle: Some(LifecyclePatch {
                phase: Some(LifecyclePhase::Onboarding),
                ..LifecyclePatch::default()
            }),
            onboarding: Some(OnboardingMarker::step(step)),
            task: Some(
                Task::new("task-1", TaskState::InputRequired).with_message("Select a strategy"),
            ),
            ..ThreadPatch::default()
        };
        reconcile(&ThreadSnapshot::default(), Some(&patch), &config())
    }

    fn phase_patch(phase: LifecyclePhase) -> LifecyclePatch {
        LifecyclePatch {
            phase: Some(phase),
            ..LifecyclePatch::default()
        }
    }

    #[test]
    fn empty_or_absent_patch_is_identity() {
        let mut snapshot = onboarding_snapshot(2);
        snapshot.activity.telemetry = (0..500).map(|index| json!(index)).collect();
        assert_eq!(reconcile(&snapshot, None, &config()), snapshot);
        assert_eq!(
            reconcile(&snapshot, Some(&ThreadPatch::default()), &config()),
            snapshot
        );
    }

    #[test]
    fn onboarding_regression_is_rejected() {
        let base = onboarding_snapshot(3);
        let patch = ThreadPatch {
            onboarding: Some(OnboardingMarker::step(2)),
            ..ThreadPatch::default()
        };
        let next = reconcile(&base, Some(&patch), &config());
        assert_eq!(next.onboarding, Some(OnboardingMarker::step(3)));

        let forward = ThreadPatch {
            onboarding: Some(OnboardingMarker::keyed(3, "delegation-submitted")),
            ..ThreadPatch::default()
        };
        let next = reconcile(&base, Some(&forward), &config());
        assert_eq!(
            next.onboarding,
            Some(OnboardingMarker::keyed(3, "delegation-submitted"))
        );
    }

    #[test]
    fn stale_working_task_is_suppressed() {
        let base = onboarding_snapshot(2);
        let patch = ThreadPatch {
            task: Some(Task::new("task-1", TaskState::Working)),
            ..ThreadPatch::default()
        };
        let outcome = reconcile_detailed(&base, Some(&patch), &config());
        assert!(outcome.task_preserved);
        assert_eq!(outcome.snapshot.task, base.task);
        assert_eq!(
            outcome.snapshot.flow_status(),
            Some(OnboardingFlowStatus::AwaitingInput)
        );
        assert!(outcome.changed_fields.is_empty());
    }

    #[test]
    fn working_task_with_new_artifact_goes_through() {
        let base = onboarding_snapshot(2);
        let patch = ThreadPatch {
            task: Some(Task::new("task-1", TaskState::Working)),
            operator_input: Some(json!({"strategy": "momentum"})),
            ..ThreadPatch::default()
        };
        let next = reconcile(&base, Some(&patch), &config());
        assert_eq!(next.task_state(), Some(TaskState::Working));
        assert_eq!(next.flow_status(), Some(OnboardingFlowStatus::InProgress));
    }

    #[test]
    fn hire_confirmation_resets_everything_but_bypass() {
        let mut base = onboarding_snapshot(1);
        base.delegations_bypass_active = true;
        base.halt_reason = Some("old halt".to_string());
        base.operator_config = Some(json!({"budget": 10}));
        base.activity.events = vec![json!({"type": "old"})];

        let patch = ThreadPatch {
            lifecycle: Some(phase_patch(LifecyclePhase::Onboarding)),
            task: Some(
                Task::new("task-2", TaskState::Submitted)
                    .with_message("Agent hired! Preparing onboarding"),
            ),
            ..ThreadPatch::default()
        };
        let outcome = reconcile_detailed(&base, Some(&patch), &config());
        let next = outcome.snapshot;
        assert!(outcome.engagement_reset);
        assert!(next.delegations_bypass_active);
        assert_eq!(next.onboarding, None);
        assert_eq!(next.lifecycle.phase, LifecyclePhase::Onboarding);
        assert_eq!(next.halt_reason, None);
        assert_eq!(next.operator_config, None);
        assert!(next.activity.events.is_empty());
        assert_eq!(next.task.map(|task| task.id), Some("task-2".to_string()));
    }

    #[test]
    fn completed_flow_clears_onboarding_and_activates() {
        let base = onboarding_snapshot(3);
        let patch = ThreadPatch {
            operator_config: Some(json!({"allocation": 0.25})),
            delegation_bundle: Some(json!({"signatures": ["0xabc"]})),
            onboarding: Some(OnboardingMarker::step(4)),
            task: Some(Task::new("task-1", TaskState::Working)),
            ..ThreadPatch::default()
        };
        let next = reconcile(&base, Some(&patch), &config());
        assert_eq!(next.flow_status(), Some(OnboardingFlowStatus::Completed));
        assert_eq!(next.onboarding, None);
        assert_eq!(next.lifecycle.phase, LifecyclePhase::Active);

        // later markers cannot resurrect onboarding once completed
        let late = ThreadPatch {
            onboarding: Some(OnboardingMarker::step(5)),
            ..ThreadPatch::default()
        };
        let next = reconcile(&next, Some(&late), &config());
        assert_eq!(next.onboarding, None);
        assert_eq!(next.lifecycle.phase, LifecyclePhase::Active);
    }

    #[test]
    fn bypass_flag_stands_in_for_delegation_bundle() {
        let base = onboarding_snapshot(2);
        let patch = ThreadPatch {
            operator_config: Some(json!({"allocation": 0.5})),
            delegations_bypass_active: Some(true),
            ..ThreadPatch::default()
        };
        let next = reconcile(&base, Some(&patch), &config());
        assert_eq!(next.lifecycle.phase, LifecyclePhase::Active);
    }

    #[test]
    fn domain_artifacts_persist_until_overwritten() {
        let mut base = onboarding_snapshot(2);
        base.operator_input = Some(json!({"strategy": "first"}));
        let unrelated = ThreadPatch {
            halt_reason: Some("paused".to_string()),
            ..ThreadPatch::default()
        };
        let next = reconcile(&base, Some(&unrelated), &config());
        assert_eq!(next.operator_input, Some(json!({"strategy": "first"})));

        let overwrite = ThreadPatch {
            operator_input: Some(json!({"strategy": "second"})),
            ..ThreadPatch::default()
        };
        let next = reconcile(&next, Some(&overwrite), &config());
        assert_eq!(next.operator_input, Some(json!({"strategy": "second"})));
    }

    #[test]
    fn nested_objects_merge_key_by_key() {
        let mut base = ThreadSnapshot::default();
        base.profile.insert("name".to_string(), json!("Alpha"));
        base.profile.insert("chains".to_string(), json!(["arbitrum"]));
        base.accounting
            .fields
            .insert("baseCurrency".to_string(), json!("USDC"));

        let mut profile = serde_json::Map::new();
        profile.insert("name".to_string(), json!("Alpha v2"));
        profile.insert("chains".to_string(), Value::Null);
        let mut accounting_fields = serde_json::Map::new();
        accounting_fields.insert("lastNavUsd".to_string(), json!(1050.5));
        let patch = ThreadPatch {
            profile: Some(profile),
            accounting: Some(AccountingPatch {
                fields: accounting_fields,
                ..AccountingPatch::default()
            }),
            ..ThreadPatch::default()
        };
        let next = reconcile(&base, Some(&patch), &config());
        assert_eq!(next.profile["name"], json!("Alpha v2"));
        assert_eq!(next.profile["chains"], json!(["arbitrum"]));
        assert_eq!(next.accounting.fields["baseCurrency"], json!("USDC"));
        assert_eq!(next.accounting.fields["lastNavUsd"], json!(1050.5));
    }

    #[test]
    fn sequences_stay_within_limits_and_keep_newest() {
        let config = ReconcileConfig {
            state_history_limit: 3,
            accounting_history_limit: 2,
            ..ReconcileConfig::default()
        };
        let mut snapshot = ThreadSnapshot::default();
        for batch in 0..4 {
            let patch = ThreadPatch {
                activity: Some(ActivityPatch {
                    telemetry: Some(vec![json!({"cycle": batch})]),
                    events: None,
                }),
                accounting: Some(AccountingPatch {
                    flow_log: Some(vec![json!(batch * 10), json!(batch * 10 + 1)]),
                    ..AccountingPatch::default()
                }),
                ..ThreadPatch::default()
            };
            snapshot = reconcile(&snapshot, Some(&patch), &config);
            assert!(snapshot.activity.telemetry.len() <= 3);
            assert!(snapshot.accounting.flow_log.len() <= 2);
        }
        assert_eq!(
            snapshot.activity.telemetry,
            vec![json!({"cycle": 1}), json!({"cycle": 2}), json!({"cycle": 3})]
        );
        assert_eq!(snapshot.accounting.flow_log, vec![json!(30), json!(31)]);
    }

    #[test]
    fn fire_request_moves_to_firing() {
        let mut base = onboarding_snapshot(2);
        base.lifecycle.phase = LifecyclePhase::Active;
        let patch = ThreadPatch {
            lifecycle: Some(phase_patch(LifecyclePhase::Firing)),
            ..ThreadPatch::default()
        };
        let next = reconcile(&base, Some(&patch), &config());
        assert_eq!(next.lifecycle.phase, LifecyclePhase::Firing);

        // arbitrary phase proposals still go through the resolver
        let bogus = ThreadPatch {
            lifecycle: Some(phase_patch(LifecyclePhase::Active)),
            task: Some(Task::new("task-3", TaskState::Working)),
            ..ThreadPatch::default()
        };
        let next = reconcile(&next, Some(&bogus), &config());
        assert_eq!(next.lifecycle.phase, LifecyclePhase::Firing);
    }
}
