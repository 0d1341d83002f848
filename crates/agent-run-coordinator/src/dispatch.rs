use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use agent_thread_state::TaskState;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::executor::{
    CapabilityOutcome, ExecutorError, RemoteExecutor, RunAttachment, RunCommand, RunRequest,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Started { run_id: Option<String> },
    /// A run is in flight; the command waits for its completion.
    Queued,
    /// No thread identity was resolvable.
    NotDispatched,
    /// The thread was released while the dispatch was suspended.
    Superseded,
    /// The payload went to the live run instead of a new one.
    Resumed,
}

impl DispatchOutcome {
    #[must_use]
    pub fn accepted(&self) -> bool {
        matches!(self, Self::Started { .. } | Self::Queued | Self::Resumed)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("agent still busy after {attempts} attempts")]
    StillBusy { attempts: u32 },
    #[error("run start failed: {0}")]
    Failed(#[source] ExecutorError),
}

impl DispatchError {
    /// Short text for the caller to show; busy and failure are kept apart.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::StillBusy { .. } => "agent is busy, retry shortly".to_string(),
            Self::Failed(error) => format!("dispatch failed: {error}"),
        }
    }
}

/// Boundary shape of a dispatch result: `{accepted, error?}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub accepted: bool,
    pub error: Option<String>,
}

impl From<&Result<DispatchOutcome, DispatchError>> for DispatchReport {
    fn from(result: &Result<DispatchOutcome, DispatchError>) -> Self {
        match result {
            Ok(outcome) => Self {
                accepted: outcome.accepted(),
                error: None,
            },
            Err(error) => Self {
                accepted: false,
                error: Some(error.user_message()),
            },
        }
    }
}

/// Terminal signal for a thread's run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCompletion {
    pub thread_id: String,
    pub run_id: Option<String>,
}

impl RunCompletion {
    #[must_use]
    pub fn new(thread_id: impl Into<String>, run_id: Option<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            run_id,
        }
    }

    /// Completion derived from a reconciled task state; only terminal states count.
    #[must_use]
    pub fn from_task_state(
        thread_id: impl Into<String>,
        run_id: Option<String>,
        state: TaskState,
    ) -> Option<Self> {
        state.is_terminal().then(|| Self::new(thread_id, run_id))
    }
}

#[derive(Default)]
enum RunSlot {
    #[default]
    Idle,
    /// Claimed locally; the executor has not accepted yet.
    Starting,
    Running {
        run_id: Option<String>,
        attachment: Option<Arc<dyn RunAttachment>>,
    },
}

#[derive(Default)]
struct ThreadRuns {
    slot: RunSlot,
    queue: VecDeque<RunCommand>,
    epoch: u64,
}

impl ThreadRuns {
    fn in_flight(&self) -> bool {
        !matches!(self.slot, RunSlot::Idle)
    }

    fn enqueue(&mut self, command: RunCommand) -> bool {
        if self.queue.contains(&command) {
            return false;
        }
        self.queue.push_back(command);
        true
    }

    fn take_attachment(&mut self) -> Option<Arc<dyn RunAttachment>> {
        match &mut self.slot {
            RunSlot::Running { attachment, .. } => attachment.take(),
            RunSlot::Idle | RunSlot::Starting => None,
        }
    }
}

/// Claim made under the lock before any await.
struct Claim {
    thread_id: String,
    command: RunCommand,
    epoch: u64,
    preempted: Option<Arc<dyn RunAttachment>>,
}

/// Keeps at most one locally dispatched run per thread.
pub struct RunCoordinator {
    executor: Arc<dyn RemoteExecutor>,
    config: DispatchConfig,
    threads: Mutex<HashMap<String, ThreadRuns>>,
}

impl RunCoordinator {
    #[must_use]
    pub fn new(executor: Arc<dyn RemoteExecutor>, config: DispatchConfig) -> Self {
        Self {
            executor,
            config,
            threads: Mutex::new(HashMap::new()),
        }
    }

    pub async fn dispatch(
        &self,
        thread_id: Option<&str>,
        command: RunCommand,
        priority: bool,
    ) -> Result<DispatchOutcome, DispatchError> {
        let Some(thread_id) = thread_id.map(str::trim).filter(|id| !id.is_empty()) else {
            debug!(command = %command, "no thread identity; command not dispatched");
            return Ok(DispatchOutcome::NotDispatched);
        };
        let priority = priority || command.is_priority();

        if let RunCommand::Resume(payload) = &command {
            let live = {
                let threads = self.threads.lock().await;
                threads.get(thread_id).and_then(|runs| match &runs.slot {
                    RunSlot::Running { attachment, .. } => attachment.clone(),
                    RunSlot::Idle | RunSlot::Starting => None,
                })
            };
            if let Some(attachment) = live {
                match attachment.resume_with_payload(payload).await {
                    CapabilityOutcome::Applied => {
                        info!(thread_id, "resumed interrupted run in place");
                        return Ok(DispatchOutcome::Resumed);
                    }
                    CapabilityOutcome::Unsupported => {
                        debug!(thread_id, "attachment cannot resume; dispatching as run");
                    }
                    CapabilityOutcome::Failed(reason) => {
                        warn!(
                            thread_id,
                            reason = %reason,
                            "in-place resume failed; dispatching as run"
                        );
                    }
                }
            }
        }

        let claim = {
            let mut threads = self.threads.lock().await;
            let runs = threads.entry(thread_id.to_string()).or_default();
            if runs.in_flight() && !priority {
                if runs.enqueue(command.clone()) {
                    debug!(thread_id, command = %command, "run in flight; queued follow-up");
                } else {
                    debug!(thread_id, command = %command, "identical follow-up already queued");
                }
                return Ok(DispatchOutcome::Queued);
            }
            let preempted = if runs.in_flight() {
                let dropped = runs.queue.len();
                runs.queue.clear();
                // a displaced dispatch still awaiting the executor resolves as superseded
                runs.epoch = runs.epoch.wrapping_add(1);
                info!(thread_id, command = %command, dropped, "preempting in-flight run");
                runs.take_attachment()
            } else {
                None
            };
            runs.slot = RunSlot::Starting;
            Claim {
                thread_id: thread_id.to_string(),
                command,
                epoch: runs.epoch,
                preempted,
            }
        };

        self.start_claimed(claim).await
    }

    /// Releases the thread when a terminal signal matches its run, then starts
    /// the next queued command. Returns that follow-up's result, if any.
    pub async fn complete_run(
        &self,
        completion: RunCompletion,
    ) -> Option<Result<DispatchOutcome, DispatchError>> {
        let claim = {
            let mut threads = self.threads.lock().await;
            let runs = threads.get_mut(&completion.thread_id)?;
            let RunSlot::Running { run_id, .. } = &runs.slot else {
                debug!(
                    thread_id = %completion.thread_id,
                    "completion for a thread without a started run; ignoring"
                );
                return None;
            };
            if let (Some(active), Some(signalled)) = (run_id, &completion.run_id)
                && active != signalled
            {
                debug!(
                    thread_id = %completion.thread_id,
                    active = %active,
                    signalled = %signalled,
                    "stale completion for a previous run; ignoring"
                );
                return None;
            }
            runs.slot = RunSlot::Idle;
            let command = runs.queue.pop_front()?;
            runs.slot = RunSlot::Starting;
            Claim {
                thread_id: completion.thread_id.clone(),
                command,
                epoch: runs.epoch,
                preempted: None,
            }
        };

        debug!(
            thread_id = %claim.thread_id,
            command = %claim.command,
            "starting queued follow-up"
        );
        Some(self.start_claimed(claim).await)
    }

    /// Drops all local ownership of the thread, e.g. on identity change.
    /// Suspended dispatches for it finish as `Superseded`.
    pub async fn release_thread(&self, thread_id: &str) {
        let attachment = {
            let mut threads = self.threads.lock().await;
            let Some(runs) = threads.get_mut(thread_id) else {
                return;
            };
            runs.epoch = runs.epoch.wrapping_add(1);
            runs.queue.clear();
            let attachment = runs.take_attachment();
            runs.slot = RunSlot::Idle;
            attachment
        };
        if let Some(attachment) = attachment {
            attachment.detach().await;
        }
        debug!(thread_id, "released thread run ownership");
    }

    pub async fn is_run_in_flight(&self, thread_id: &str) -> bool {
        self.threads
            .lock()
            .await
            .get(thread_id)
            .is_some_and(ThreadRuns::in_flight)
    }

    pub async fn queued_commands(&self, thread_id: &str) -> Vec<RunCommand> {
        self.threads
            .lock()
            .await
            .get(thread_id)
            .map(|runs| runs.queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn active_run_id(&self, thread_id: &str) -> Option<String> {
        let threads = self.threads.lock().await;
        match &threads.get(thread_id)?.slot {
            RunSlot::Running { run_id, .. } => run_id.clone(),
            RunSlot::Idle | RunSlot::Starting => None,
        }
    }

    async fn start_claimed(&self, claim: Claim) -> Result<DispatchOutcome, DispatchError> {
        let Claim {
            thread_id,
            command,
            epoch,
            preempted,
        } = claim;

        if let Some(previous) = &preempted {
            if let CapabilityOutcome::Failed(reason) = previous.abort().await {
                warn!(thread_id = %thread_id, reason = %reason, "abort of preempted run failed");
            }
            previous.detach().await;
        }

        let max_attempts = self.config.busy_max_retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            if !self.epoch_matches(&thread_id, epoch).await {
                return Ok(DispatchOutcome::Superseded);
            }

            let request = RunRequest {
                thread_id: thread_id.clone(),
                command: command.clone(),
                deliver_message: attempt == 1,
                attempt,
            };
            let result = self.executor.start_run(request).await;

            let mut threads = self.threads.lock().await;
            let current = threads.get_mut(&thread_id).filter(|runs| runs.epoch == epoch);
            let Some(runs) = current else {
                drop(threads);
                if let Ok(started) = result
                    && let Some(attachment) = started.attachment
                {
                    attachment.detach().await;
                }
                debug!(
                    thread_id = %thread_id,
                    command = %command,
                    "thread released during dispatch"
                );
                return Ok(DispatchOutcome::Superseded);
            };

            match result {
                Ok(started) => {
                    info!(
                        thread_id = %thread_id,
                        command = %command,
                        attempt,
                        run_id = ?started.run_id,
                        "run started"
                    );
                    runs.slot = RunSlot::Running {
                        run_id: started.run_id.clone(),
                        attachment: started.attachment,
                    };
                    return Ok(DispatchOutcome::Started {
                        run_id: started.run_id,
                    });
                }
                Err(error) if error.is_busy() && attempt < max_attempts => {
                    drop(threads);
                    let delay = self.config.backoff_delay(attempt);
                    warn!(
                        thread_id = %thread_id,
                        command = %command,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        reason = %error,
                        "executor busy; retrying"
                    );
                    if let Some(previous) = &preempted {
                        previous.detach().await;
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    runs.slot = RunSlot::Idle;
                    let dropped = runs.queue.len();
                    runs.queue.clear();
                    drop(threads);
                    warn!(
                        thread_id = %thread_id,
                        command = %command,
                        attempt,
                        dropped,
                        reason = %error,
                        "run dispatch failed"
                    );
                    if error.is_busy() {
                        return Err(DispatchError::StillBusy { attempts: attempt });
                    }
                    return Err(DispatchError::Failed(error));
                }
            }
        }
    }

    async fn epoch_matches(&self, thread_id: &str, epoch: u64) -> bool {
        self.threads
            .lock()
            .await
            .get(thread_id)
            .is_some_and(|runs| runs.epoch == epoch)
    }
}
