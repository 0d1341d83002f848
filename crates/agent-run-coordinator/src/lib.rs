//! Run coordination for agent threads: at most one locally dispatched run per
//! thread, priority preemption with busy retries, and bounded fleet polling.

#![cfg_attr(test, allow(clippy::expect_used))]

pub mod config;
pub mod dispatch;
pub mod executor;
pub mod fleet_poll;

pub use config::{ConfigError, CoordinatorConfig, DispatchConfig, FleetPollConfig};
pub use dispatch::{
    DispatchError, DispatchOutcome, DispatchReport, RunCompletion, RunCoordinator,
};
pub use executor::{
    CapabilityOutcome, ExecutorError, RemoteExecutor, RunAttachment, RunCommand, RunRequest,
    RunStarted,
};
pub use fleet_poll::{
    FleetPollTransport, FleetPoller, PollError, PollResponse, PollSummary, RosterEntry,
    RosterMember, RosterUpdate,
};
