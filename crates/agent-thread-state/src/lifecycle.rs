use crate::model::{LifecyclePhase, OnboardingFlowStatus, TaskState};

/// Everything the phase resolver is allowed to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseInputs {
    pub previous: LifecyclePhase,
    /// Task state after stale-task preservation, never the raw patch value.
    pub task_state: Option<TaskState>,
    pub flow_status: Option<OnboardingFlowStatus>,
    pub onboarding_step: Option<u32>,
    pub requested: Option<LifecyclePhase>,
    pub has_operator_config: bool,
    /// Bundle present, or delegation bypass active.
    pub has_delegation_bundle: bool,
    pub fire_requested: bool,
}

impl PhaseInputs {
    #[must_use]
    pub fn staying(previous: LifecyclePhase) -> Self {
        Self {
            previous,
            task_state: None,
            flow_status: None,
            onboarding_step: None,
            requested: None,
            has_operator_config: false,
            has_delegation_bundle: false,
            fire_requested: false,
        }
    }
}

/// Maps the resolver inputs to the next phase. Total: the fallback is the
/// previous phase.
#[must_use]
pub fn resolve_phase(inputs: PhaseInputs) -> LifecyclePhase {
    if inputs.fire_requested || inputs.requested == Some(LifecyclePhase::Firing) {
        return LifecyclePhase::Firing;
    }

    if inputs.previous == LifecyclePhase::Firing {
        let teardown_settled = inputs.task_state.is_none_or(TaskState::is_terminal);
        if inputs.requested == Some(LifecyclePhase::Prehire) && teardown_settled {
            return LifecyclePhase::Prehire;
        }
        return LifecyclePhase::Firing;
    }

    let onboarding_complete = inputs.flow_status == Some(OnboardingFlowStatus::Completed)
        && inputs.has_operator_config
        && inputs.has_delegation_bundle;
    if onboarding_complete {
        return LifecyclePhase::Active;
    }

    match inputs.previous {
        LifecyclePhase::Prehire => {
            let onboarding_started = inputs.requested == Some(LifecyclePhase::Onboarding)
                || inputs.onboarding_step.is_some()
                || inputs.task_state == Some(TaskState::InputRequired);
            if onboarding_started {
                LifecyclePhase::Onboarding
            } else {
                LifecyclePhase::Prehire
            }
        }
        previous => previous,
    }
}

#[cfg(test)]
mod tests {
    use super::{PhaseInputs, resolve_phase};
    use crate::model::{LifecyclePhase, OnboardingFlowStatus, TaskState};

    #[test]
    fn no_signals_keep_previous_phase() {
        for phase in [
            LifecyclePhase::Prehire,
            LifecyclePhase::Onboarding,
            LifecyclePhase::Active,
            LifecyclePhase::Firing,
        ] {
            assert_eq!(resolve_phase(PhaseInputs::staying(phase)), phase);
        }
    }

    #[test]
    fn hire_request_enters_onboarding() {
        let mut inputs = PhaseInputs::staying(LifecyclePhase::Prehire);
        inputs.requested = Some(LifecyclePhase::Onboarding);
        inputs.task_state = Some(TaskState::Submitted);
        assert_eq!(resolve_phase(inputs), LifecyclePhase::Onboarding);

        let mut by_marker = PhaseInputs::staying(LifecyclePhase::Prehire);
        by_marker.onboarding_step = Some(1);
        assert_eq!(resolve_phase(by_marker), LifecyclePhase::Onboarding);
    }

    #[test]
    fn terminal_failure_during_onboarding_does_not_regress() {
        for state in [TaskState::Failed, TaskState::Canceled] {
            let mut inputs = PhaseInputs::staying(LifecyclePhase::Onboarding);
            inputs.task_state = Some(state);
            inputs.onboarding_step = Some(2);
            assert_eq!(resolve_phase(inputs), LifecyclePhase::Onboarding);
        }
    }

    #[test]
    fn completed_flow_with_config_and_bundle_activates() {
        let mut inputs = PhaseInputs::staying(LifecyclePhase::Onboarding);
        inputs.flow_status = Some(OnboardingFlowStatus::Completed);
        inputs.has_operator_config = true;
        assert_eq!(resolve_phase(inputs), LifecyclePhase::Onboarding);

        inputs.has_delegation_bundle = true;
        assert_eq!(resolve_phase(inputs), LifecyclePhase::Active);
    }

    #[test]
    fn active_request_without_completion_is_ignored() {
        let mut inputs = PhaseInputs::staying(LifecyclePhase::Onboarding);
        inputs.requested = Some(LifecyclePhase::Active);
        assert_eq!(resolve_phase(inputs), LifecyclePhase::Onboarding);
    }

    #[test]
    fn firing_only_when_requested_and_sticky_until_teardown() {
        let mut active = PhaseInputs::staying(LifecyclePhase::Active);
        active.task_state = Some(TaskState::Failed);
        assert_eq!(resolve_phase(active), LifecyclePhase::Active);

        active.fire_requested = true;
        assert_eq!(resolve_phase(active), LifecyclePhase::Firing);

        let mut firing = PhaseInputs::staying(LifecyclePhase::Firing);
        firing.requested = Some(LifecyclePhase::Prehire);
        firing.task_state = Some(TaskState::Working);
        assert_eq!(resolve_phase(firing), LifecyclePhase::Firing);

        firing.task_state = Some(TaskState::Completed);
        assert_eq!(resolve_phase(firing), LifecyclePhase::Prehire);
    }
}
