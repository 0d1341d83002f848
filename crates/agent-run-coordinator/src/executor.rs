use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Commands a thread can send to its remote executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "kebab-case")]
pub enum RunCommand {
    Hire,
    Fire,
    Sync,
    /// Answer to an interrupted task, forwarded opaquely.
    Resume(Value),
}

impl RunCommand {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hire => "hire",
            Self::Fire => "fire",
            Self::Sync => "sync",
            Self::Resume(_) => "resume",
        }
    }

    /// Teardown preempts whatever the thread is running.
    #[must_use]
    pub fn is_priority(&self) -> bool {
        matches!(self, Self::Fire)
    }

    /// Parses the command names used at the dispatch boundary.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            "hire" => Some(Self::Hire),
            "fire" => Some(Self::Fire),
            "sync" => Some(Self::Sync),
            _ => None,
        }
    }
}

impl fmt::Display for RunCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub thread_id: String,
    pub command: RunCommand,
    /// Whether the user-visible command message goes out with this attempt.
    /// Only the first attempt of a dispatch carries it.
    pub deliver_message: bool,
    pub attempt: u32,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutorError {
    /// The executor already owns a run for this thread.
    #[error("executor busy: {0}")]
    Busy(String),
    #[error("executor unreachable: {0}")]
    Transport(String),
    #[error("executor rejected run: {0}")]
    Rejected(String),
}

impl ExecutorError {
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

/// Result of an optional attachment capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityOutcome {
    Applied,
    Unsupported,
    Failed(String),
}

/// Live connection to a started run's event stream.
#[async_trait]
pub trait RunAttachment: Send + Sync {
    /// Stops listening to the run without asking the executor to stop it.
    async fn detach(&self);

    async fn abort(&self) -> CapabilityOutcome {
        CapabilityOutcome::Unsupported
    }

    async fn resume_with_payload(&self, _payload: &Value) -> CapabilityOutcome {
        CapabilityOutcome::Unsupported
    }
}

pub struct RunStarted {
    pub run_id: Option<String>,
    pub attachment: Option<Arc<dyn RunAttachment>>,
}

impl fmt::Debug for RunStarted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunStarted")
            .field("run_id", &self.run_id)
            .field("attached", &self.attachment.is_some())
            .finish()
    }
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn start_run(&self, request: RunRequest) -> Result<RunStarted, ExecutorError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ExecutorError, RunCommand};

    #[test]
    fn command_names_round_trip() {
        for command in [RunCommand::Hire, RunCommand::Fire, RunCommand::Sync] {
            assert_eq!(RunCommand::from_name(command.name()), Some(command));
        }
        assert_eq!(RunCommand::from_name("resume"), None);
        assert!(RunCommand::Fire.is_priority());
        assert!(!RunCommand::Resume(json!({"approved": true})).is_priority());
    }

    #[test]
    fn commands_serialize_with_tag() {
        assert_eq!(
            serde_json::to_value(RunCommand::Sync).expect("sync should encode"),
            json!({"command": "sync"})
        );
        assert_eq!(
            serde_json::to_value(RunCommand::Resume(json!({"token": "usdc"})))
                .expect("resume should encode"),
            json!({"command": "resume", "payload": {"token": "usdc"}})
        );
    }

    #[test]
    fn busy_is_distinguishable() {
        assert!(ExecutorError::Busy("run active".to_string()).is_busy());
        assert!(!ExecutorError::Rejected("bad payload".to_string()).is_busy());
    }
}
