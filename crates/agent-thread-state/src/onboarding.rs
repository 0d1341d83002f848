use crate::config::OnboardingMilestones;
use crate::model::{OnboardingFlow, OnboardingFlowStatus, OnboardingMarker, TaskState};

/// Total order over onboarding markers.
#[must_use]
pub fn progress(marker: &OnboardingMarker, milestones: &OnboardingMilestones) -> f64 {
    let step = f64::from(marker.step);
    marker
        .key
        .as_deref()
        .and_then(|key| milestones.progress_for(key))
        .map_or(step, |milestone| step.max(milestone))
}

/// Picks the incoming marker unless it would move progress backwards.
///
/// Regressions come from out-of-order or duplicate deliveries and are dropped
/// without error.
#[must_use]
pub fn resolve_monotonic(
    previous: Option<&OnboardingMarker>,
    incoming: Option<&OnboardingMarker>,
    milestones: &OnboardingMilestones,
) -> Option<OnboardingMarker> {
    match (previous, incoming) {
        (None, None) => None,
        (Some(previous), None) => Some(previous.clone()),
        (None, Some(incoming)) => Some(incoming.clone()),
        (Some(previous), Some(incoming)) => {
            if progress(incoming, milestones) < progress(previous, milestones) {
                Some(previous.clone())
            } else {
                Some(incoming.clone())
            }
        }
    }
}

/// True when `incoming` moves strictly past `previous`.
#[must_use]
pub fn advanced(
    previous: Option<&OnboardingMarker>,
    incoming: Option<&OnboardingMarker>,
    milestones: &OnboardingMilestones,
) -> bool {
    match (previous, incoming) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(previous), Some(incoming)) => {
            progress(incoming, milestones) > progress(previous, milestones)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FlowInputs<'a> {
    pub onboarding: Option<&'a OnboardingMarker>,
    pub previous: Option<&'a OnboardingFlow>,
    pub has_operator_config: bool,
    pub delegation_satisfied: bool,
    pub task_state: Option<TaskState>,
}

/// Recomputes the onboarding flow contract from resolved raw fields.
#[must_use]
pub fn derive_onboarding_flow(inputs: FlowInputs<'_>) -> Option<OnboardingFlow> {
    let completed = inputs
        .previous
        .is_some_and(|flow| flow.status == OnboardingFlowStatus::Completed)
        || (inputs.has_operator_config && inputs.delegation_satisfied);
    if completed {
        return Some(OnboardingFlow {
            status: OnboardingFlowStatus::Completed,
            step: None,
            key: None,
        });
    }

    if inputs.onboarding.is_none() && inputs.task_state.is_none() && inputs.previous.is_none() {
        return None;
    }

    let status = match inputs.task_state {
        Some(TaskState::InputRequired) => OnboardingFlowStatus::AwaitingInput,
        Some(TaskState::Failed | TaskState::Canceled) => OnboardingFlowStatus::Failed,
        _ => OnboardingFlowStatus::InProgress,
    };
    Some(OnboardingFlow {
        status,
        step: inputs.onboarding.map(|marker| marker.step),
        key: inputs.onboarding.and_then(|marker| marker.key.clone()),
    })
}
