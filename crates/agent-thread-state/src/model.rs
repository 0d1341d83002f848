use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Literal prefix of the task message the executor emits when a hire is confirmed.
pub const HIRE_CONFIRMATION_PREFIX: &str = "Agent hired!";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecyclePhase {
    #[default]
    Prehire,
    Onboarding,
    Active,
    Firing,
}

impl LifecyclePhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prehire => "prehire",
            Self::Onboarding => "onboarding",
            Self::Active => "active",
            Self::Firing => "firing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Submitted,
    Working,
    InputRequired,
    Completed,
    Failed,
    Canceled,
}

impl TaskState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Working => "working",
            Self::InputRequired => "input-required",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lifecycle {
    #[serde(default)]
    pub phase: LifecyclePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecyclePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<LifecyclePhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
}

impl Task {
    #[must_use]
    pub fn new(id: impl Into<String>, state: TaskState) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus {
                state,
                message: None,
                timestamp: None,
            },
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.status.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        self.status.state
    }

    /// True for the `submitted` task the executor posts right after a hire.
    #[must_use]
    pub fn is_hire_confirmation(&self) -> bool {
        self.status.state == TaskState::Submitted
            && self
                .status
                .message
                .as_deref()
                .is_some_and(|message| message.trim_start().starts_with(HIRE_CONFIRMATION_PREFIX))
    }
}

/// Named or numeric onboarding progress marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardingMarker {
    pub step: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl OnboardingMarker {
    #[must_use]
    pub fn step(step: u32) -> Self {
        Self { step, key: None }
    }

    #[must_use]
    pub fn keyed(step: u32, key: impl Into<String>) -> Self {
        Self {
            step,
            key: Some(key.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnboardingFlowStatus {
    InProgress,
    AwaitingInput,
    Failed,
    Completed,
}

impl OnboardingFlowStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in-progress",
            Self::AwaitingInput => "awaiting-input",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }
}

/// Derived onboarding contract. Recomputed on every reconciliation, never merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardingFlow {
    pub status: OnboardingFlowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(default)]
    pub telemetry: Vec<Value>,
    #[serde(default)]
    pub events: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Accounting {
    #[serde(default)]
    pub nav_snapshots: Vec<Value>,
    #[serde(default)]
    pub flow_log: Vec<Value>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountingPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nav_snapshots: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_log: Option<Vec<Value>>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Authoritative state of one workflow thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSnapshot {
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onboarding: Option<OnboardingMarker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onboarding_flow: Option<OnboardingFlow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding_token_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation_bundle: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_config: Option<Value>,
    #[serde(default)]
    pub profile: Map<String, Value>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
    #[serde(default)]
    pub accounting: Accounting,
    #[serde(default)]
    pub activity: Activity,
    #[serde(default)]
    pub transaction_history: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_error: Option<String>,
    #[serde(default)]
    pub delegations_bypass_active: bool,
}

impl ThreadSnapshot {
    /// Default snapshot that keeps only the sticky bypass flag of `self`.
    #[must_use]
    pub fn engagement_reset(&self) -> Self {
        Self {
            delegations_bypass_active: self.delegations_bypass_active,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn task_state(&self) -> Option<TaskState> {
        self.task.as_ref().map(Task::state)
    }

    #[must_use]
    pub fn flow_status(&self) -> Option<OnboardingFlowStatus> {
        self.onboarding_flow.as_ref().map(|flow| flow.status)
    }
}

/// Partial snapshot. Absent fields carry no opinion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<LifecyclePatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onboarding: Option<OnboardingMarker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding_token_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation_bundle: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accounting: Option<AccountingPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<ActivityPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_history: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegations_bypass_active: Option<bool>,
}

impl ThreadPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    #[must_use]
    pub fn requested_phase(&self) -> Option<LifecyclePhase> {
        self.lifecycle.as_ref().and_then(|lifecycle| lifecycle.phase)
    }

    /// Top-level wire keys present in this patch, in declaration order.
    #[must_use]
    pub fn present_keys(&self) -> Vec<String> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Onboarding request carrying the executor's hire confirmation.
    #[must_use]
    pub fn is_new_engagement(&self) -> bool {
        self.requested_phase() == Some(LifecyclePhase::Onboarding)
            && self.task.as_ref().is_some_and(Task::is_hire_confirmation)
    }
}
