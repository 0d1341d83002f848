//! Thread state for hired agents: reconciliation of partial patches into
//! snapshots, onboarding and lifecycle resolution, and the transition audit log.

#![cfg_attr(test, allow(clippy::expect_used))]

pub mod audit;
pub mod config;
pub mod history;
pub mod lifecycle;
pub mod model;
pub mod onboarding;
pub mod reconcile;
pub mod store;
pub mod summary;
pub mod task_guard;

pub use audit::{AuditError, AuditOutcome, TransitionAuditor, TransitionRecord};
pub use config::{
    AuditConfig, ConfigError, OnboardingMilestones, ReconcileConfig, ThreadStateConfig,
};
pub use lifecycle::{PhaseInputs, resolve_phase};
pub use model::{
    Accounting, AccountingPatch, Activity, ActivityPatch, HIRE_CONFIRMATION_PREFIX, Lifecycle,
    LifecyclePatch, LifecyclePhase, OnboardingFlow, OnboardingFlowStatus, OnboardingMarker, Task,
    TaskState, TaskStatus, ThreadPatch, ThreadSnapshot,
};
pub use reconcile::{Reconciliation, reconcile, reconcile_detailed};
pub use store::ThreadStateStore;
pub use summary::{SnapshotSummary, changed_fields, summarize};
