use crate::config::OnboardingMilestones;
use crate::model::{
    OnboardingFlowStatus, OnboardingMarker, Task, TaskState, ThreadPatch, ThreadSnapshot,
};
use crate::onboarding;

/// Domain artifacts whose first appearance counts as forward progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArtifactPresence {
    pub operator_input: bool,
    pub funding_token_input: bool,
    pub delegation_bundle: bool,
    pub operator_config: bool,
}

impl ArtifactPresence {
    #[must_use]
    pub fn of_snapshot(snapshot: &ThreadSnapshot) -> Self {
        Self {
            operator_input: snapshot.operator_input.is_some(),
            funding_token_input: snapshot.funding_token_input.is_some(),
            delegation_bundle: snapshot.delegation_bundle.is_some(),
            operator_config: snapshot.operator_config.is_some(),
        }
    }

    #[must_use]
    pub fn of_patch(patch: &ThreadPatch) -> Self {
        Self {
            operator_input: patch.operator_input.is_some(),
            funding_token_input: patch.funding_token_input.is_some(),
            delegation_bundle: patch.delegation_bundle.is_some(),
            operator_config: patch.operator_config.is_some(),
        }
    }

    /// True if any artifact present in `incoming` was missing from `self`.
    #[must_use]
    pub fn newly_appeared_in(self, incoming: Self) -> bool {
        (incoming.operator_input && !self.operator_input)
            || (incoming.funding_token_input && !self.funding_token_input)
            || (incoming.delegation_bundle && !self.delegation_bundle)
            || (incoming.operator_config && !self.operator_config)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StaleTaskInputs<'a> {
    pub previous_task: Option<&'a Task>,
    pub incoming_task: Option<&'a Task>,
    pub previous_onboarding: Option<&'a OnboardingMarker>,
    pub incoming_onboarding: Option<&'a OnboardingMarker>,
    pub flow_status: Option<OnboardingFlowStatus>,
    pub previous_artifacts: ArtifactPresence,
    pub incoming_artifacts: ArtifactPresence,
}

/// Returns true when an incoming `working` task should be dropped in favour of
/// the previous `input-required` task.
///
/// A run that starts working without consuming the blocking input is a retry of
/// the same interrupt; surfacing it would flash the thread out of its waiting
/// state and straight back in.
#[must_use]
pub fn should_preserve_previous_task(
    inputs: StaleTaskInputs<'_>,
    milestones: &OnboardingMilestones,
) -> bool {
    let (Some(previous), Some(incoming)) = (inputs.previous_task, inputs.incoming_task) else {
        return false;
    };
    if previous.state() != TaskState::InputRequired || incoming.state() != TaskState::Working {
        return false;
    }
    if inputs.flow_status == Some(OnboardingFlowStatus::Completed) {
        return false;
    }
    if onboarding::advanced(
        inputs.previous_onboarding,
        inputs.incoming_onboarding,
        milestones,
    ) {
        return false;
    }
    !inputs
        .previous_artifacts
        .newly_appeared_in(inputs.incoming_artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interrupted() -> Task {
        Task::new("task-1", TaskState::InputRequired).with_message("Provide funding token")
    }

    fn working() -> Task {
        Task::new("task-1", TaskState::Working)
    }

    fn inputs<'a>(previous: &'a Task, incoming: &'a Task) -> StaleTaskInputs<'a> {
        StaleTaskInputs {
            previous_task: Some(previous),
            incoming_task: Some(incoming),
            previous_onboarding: None,
            incoming_onboarding: None,
            flow_status: Some(OnboardingFlowStatus::AwaitingInput),
            previous_artifacts: ArtifactPresence::default(),
            incoming_artifacts: ArtifactPresence::default(),
        }
    }

    #[test]
    fn duplicate_working_without_progress_is_suppressed() {
        let (previous, incoming) = (interrupted(), working());
        assert!(should_preserve_previous_task(
            inputs(&previous, &incoming),
            &OnboardingMilestones::default()
        ));
    }

    #[test]
    fn onboarding_advance_lets_working_through() {
        let (previous, incoming) = (interrupted(), working());
        let before = OnboardingMarker::step(1);
        let after = OnboardingMarker::keyed(1, "fund-wallet");
        let mut candidate = inputs(&previous, &incoming);
        candidate.previous_onboarding = Some(&before);
        candidate.incoming_onboarding = Some(&after);
        assert!(!should_preserve_previous_task(
            candidate,
            &OnboardingMilestones::default()
        ));
    }

    #[test]
    fn new_artifact_lets_working_through() {
        let (previous, incoming) = (interrupted(), working());
        let mut candidate = inputs(&previous, &incoming);
        candidate.incoming_artifacts.funding_token_input = true;
        assert!(!should_preserve_previous_task(
            candidate,
            &OnboardingMilestones::default()
        ));

        // an artifact already held does not count as new
        candidate.previous_artifacts.funding_token_input = true;
        assert!(should_preserve_previous_task(
            candidate,
            &OnboardingMilestones::default()
        ));
    }

    #[test]
    fn completed_flow_or_other_states_are_not_suppressed() {
        let (previous, incoming) = (interrupted(), working());
        let mut candidate = inputs(&previous, &incoming);
        candidate.flow_status = Some(OnboardingFlowStatus::Completed);
        assert!(!should_preserve_previous_task(
            candidate,
            &OnboardingMilestones::default()
        ));

        let completed = Task::new("task-1", TaskState::Completed);
        assert!(!should_preserve_previous_task(
            inputs(&previous, &completed),
            &OnboardingMilestones::default()
        ));
        let submitted = Task::new("task-1", TaskState::Submitted);
        assert!(!should_preserve_previous_task(
            inputs(&submitted, &incoming),
            &OnboardingMilestones::default()
        ));
    }
}
