use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::FleetPollConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterMember {
    pub agent_id: String,
    pub thread_id: String,
}

impl RosterMember {
    #[must_use]
    pub fn new(agent_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            thread_id: thread_id.into(),
        }
    }
}

/// What the roster view shows for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub synced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    #[serde(default)]
    pub busy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<RosterUpdate>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PollError {
    #[error("poll timed out after {0:?}")]
    Timeout(Duration),
    #[error("poll transport failed: {0}")]
    Transport(String),
    #[error("malformed poll response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait FleetPollTransport: Send + Sync {
    async fn poll(
        &self,
        agent_id: &str,
        thread_id: &str,
        timeout: Duration,
    ) -> Result<PollResponse, PollError>;
}

/// Counts for one poll pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub polled: usize,
    pub refreshed: usize,
    pub busy: usize,
    pub failed: usize,
    /// Excluded from the batch, or resolved after an identity change.
    pub skipped: usize,
}

#[derive(Debug, Default)]
struct RosterState {
    identity: Option<String>,
    epoch: u64,
    active_agent: Option<String>,
    entries: HashMap<String, RosterEntry>,
    busy_until: HashMap<String, Instant>,
}

impl RosterState {
    fn select_batch(&mut self, now: Instant, roster: &[RosterMember]) -> Vec<RosterMember> {
        self.busy_until.retain(|_, until| *until > now);
        roster
            .iter()
            .filter(|member| self.active_agent.as_deref() != Some(member.agent_id.as_str()))
            .filter(|member| !self.busy_until.contains_key(&member.agent_id))
            .cloned()
            .collect()
    }
}

/// Keeps non-active roster entries fresh with bounded concurrent polls.
pub struct FleetPoller {
    transport: Arc<dyn FleetPollTransport>,
    config: FleetPollConfig,
    state: Mutex<RosterState>,
}

impl FleetPoller {
    #[must_use]
    pub fn new(transport: Arc<dyn FleetPollTransport>, config: FleetPollConfig) -> Self {
        Self {
            transport,
            config,
            state: Mutex::new(RosterState::default()),
        }
    }

    /// Switches the wallet/session identity. A change resets every entry and
    /// invalidates polls still in flight. Returns whether anything changed.
    pub async fn set_identity(&self, identity: Option<String>) -> bool {
        let mut state = self.state.lock().await;
        if state.identity == identity {
            return false;
        }
        state.identity = identity;
        state.epoch = state.epoch.wrapping_add(1);
        state.entries.clear();
        state.busy_until.clear();
        debug!(epoch = state.epoch, "fleet roster reset for identity change");
        true
    }

    /// Agent kept fresh by its direct attachment; never polled.
    pub async fn set_active_agent(&self, agent_id: Option<String>) {
        self.state.lock().await.active_agent = agent_id;
    }

    pub async fn entry(&self, agent_id: &str) -> Option<RosterEntry> {
        self.state.lock().await.entries.get(agent_id).cloned()
    }

    pub async fn entries(&self) -> HashMap<String, RosterEntry> {
        self.state.lock().await.entries.clone()
    }

    pub async fn select_batch_at(
        &self,
        now: Instant,
        roster: &[RosterMember],
    ) -> Vec<RosterMember> {
        self.state.lock().await.select_batch(now, roster)
    }

    /// One pass on the wall clock. Busy cooldowns run from when each
    /// response arrives.
    pub async fn poll_once(&self, roster: &[RosterMember]) -> PollSummary {
        self.poll_pass(Instant::now(), None, roster).await
    }

    /// One pass with `now` as the reference for selection and busy cooldowns.
    pub async fn poll_once_at(&self, now: Instant, roster: &[RosterMember]) -> PollSummary {
        self.poll_pass(now, Some(now), roster).await
    }

    async fn poll_pass(
        &self,
        now: Instant,
        fixed_clock: Option<Instant>,
        roster: &[RosterMember],
    ) -> PollSummary {
        let (batch, epoch) = {
            let mut state = self.state.lock().await;
            let batch = state.select_batch(now, roster);
            for member in &batch {
                state.entries.entry(member.agent_id.clone()).or_default();
            }
            (batch, state.epoch)
        };
        let mut summary = PollSummary {
            skipped: roster.len().saturating_sub(batch.len()),
            ..PollSummary::default()
        };

        let timeout = self.config.timeout;
        let transport = &self.transport;
        let mut results = stream::iter(batch)
            .map(|member| async move {
                let poll = transport.poll(&member.agent_id, &member.thread_id, timeout);
                let result = tokio::time::timeout(timeout, poll)
                    .await
                    .unwrap_or_else(|_| Err(PollError::Timeout(timeout)));
                (member, result)
            })
            .buffer_unordered(self.config.max_concurrency.max(1));

        while let Some((member, result)) = results.next().await {
            summary.polled += 1;
            let arrived = fixed_clock.unwrap_or_else(Instant::now);
            let outcome = self.apply_result(epoch, arrived, &member, result).await;
            match outcome {
                Some(Applied::Refreshed) => summary.refreshed += 1,
                Some(Applied::Busy) => summary.busy += 1,
                Some(Applied::Failed) => summary.failed += 1,
                None => summary.skipped += 1,
            }
        }

        debug!(
            polled = summary.polled,
            refreshed = summary.refreshed,
            busy = summary.busy,
            failed = summary.failed,
            skipped = summary.skipped,
            "fleet poll pass finished"
        );
        summary
    }

    /// Initial pass, then one pass per interval until `shutdown` turns true.
    pub async fn run_until_shutdown<F>(&self, roster: F, mut shutdown: watch::Receiver<bool>)
    where
        F: Fn() -> Vec<RosterMember> + Send + Sync,
    {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once(&roster()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("fleet poll loop stopped");
    }

    async fn apply_result(
        &self,
        epoch: u64,
        now: Instant,
        member: &RosterMember,
        result: Result<PollResponse, PollError>,
    ) -> Option<Applied> {
        let agent_id = member.agent_id.as_str();
        match result {
            Ok(response) if response.busy => {
                let until = now + self.config.busy_cooldown;
                self.upsert(epoch, agent_id, |state| {
                    state.busy_until.insert(agent_id.to_string(), until);
                    let entry = state.entries.entry(agent_id.to_string()).or_default();
                    entry.synced = true;
                })
                .await
                .then_some(Applied::Busy)
            }
            Ok(response) => self
                .upsert(epoch, agent_id, |state| {
                    state.busy_until.remove(agent_id);
                    let entry = state.entries.entry(agent_id.to_string()).or_default();
                    if let Some(update) = response.update {
                        if update.profile.is_some() {
                            entry.profile = update.profile;
                        }
                        if update.metrics.is_some() {
                            entry.metrics = update.metrics;
                        }
                    }
                    entry.error = None;
                    entry.synced = true;
                })
                .await
                .then_some(Applied::Refreshed),
            Err(error) => {
                warn!(
                    agent_id,
                    thread_id = %member.thread_id,
                    reason = %error,
                    "fleet poll failed"
                );
                let message = error.to_string();
                self.upsert(epoch, agent_id, |state| {
                    let entry = state.entries.entry(agent_id.to_string()).or_default();
                    entry.error = Some(message);
                    entry.synced = true;
                })
                .await
                .then_some(Applied::Failed)
            }
        }
    }

    /// Single mutation path for poll results: read-modify-write on the live
    /// state, dropped when the identity epoch moved on.
    async fn upsert(
        &self,
        epoch: u64,
        agent_id: &str,
        apply: impl FnOnce(&mut RosterState),
    ) -> bool {
        let mut state = self.state.lock().await;
        if state.epoch != epoch {
            debug!(agent_id, "discarding poll result from previous identity");
            return false;
        }
        apply(&mut state);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Refreshed,
    Busy,
    Failed,
}
