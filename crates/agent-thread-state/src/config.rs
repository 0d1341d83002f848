use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use thiserror::Error;

pub const ENV_STATE_HISTORY_LIMIT: &str = "THREAD_STATE_HISTORY_LIMIT";
pub const ENV_ACCOUNTING_HISTORY_LIMIT: &str = "THREAD_ACCOUNTING_HISTORY_LIMIT";
pub const ENV_ONBOARDING_MILESTONES: &str = "THREAD_ONBOARDING_MILESTONES";
pub const ENV_AUDIT_ENABLED: &str = "THREAD_AUDIT_ENABLED";
pub const ENV_AUDIT_INCLUDE_PATCH: &str = "THREAD_AUDIT_INCLUDE_PATCH";
pub const ENV_AUDIT_PATH: &str = "THREAD_AUDIT_PATH";

pub const DEFAULT_STATE_HISTORY_LIMIT: usize = 100;
pub const DEFAULT_ACCOUNTING_HISTORY_LIMIT: usize = 200;
pub const DEFAULT_AUDIT_PATH: &str = "output/thread-state/transitions.jsonl";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid THREAD_STATE_HISTORY_LIMIT: {0}")]
    InvalidStateHistoryLimit(String),
    #[error("invalid THREAD_ACCOUNTING_HISTORY_LIMIT: {0}")]
    InvalidAccountingHistoryLimit(String),
    #[error("invalid THREAD_ONBOARDING_MILESTONES: {0}")]
    InvalidOnboardingMilestones(String),
    #[error("invalid THREAD_AUDIT_ENABLED: {0}")]
    InvalidAuditEnabled(String),
    #[error("invalid THREAD_AUDIT_INCLUDE_PATCH: {0}")]
    InvalidAuditIncludePatch(String),
}

/// Fractional progress values for named onboarding sub-steps.
///
/// Only the relative order matters to the guard; the values sit between the
/// integer steps they refine.
#[derive(Debug, Clone, PartialEq)]
pub struct OnboardingMilestones {
    values: HashMap<String, f64>,
}

impl Default for OnboardingMilestones {
    fn default() -> Self {
        Self {
            values: HashMap::from([
                ("strategy-config".to_string(), 1.0),
                ("fund-wallet".to_string(), 1.5),
                ("delegation-signing".to_string(), 2.0),
                ("delegation-submitted".to_string(), 2.5),
                ("review".to_string(), 3.0),
            ]),
        }
    }
}

impl OnboardingMilestones {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_milestone(mut self, key: impl Into<String>, progress: f64) -> Self {
        self.values.insert(key.into(), progress);
        self
    }

    #[must_use]
    pub fn progress_for(&self, key: &str) -> Option<f64> {
        self.values.get(key.trim()).copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileConfig {
    /// Applies to telemetry, events and transaction history. Zero is unbounded.
    pub state_history_limit: usize,
    /// Applies to accounting NAV snapshots and flow log. Zero is unbounded.
    pub accounting_history_limit: usize,
    pub milestones: OnboardingMilestones,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            state_history_limit: DEFAULT_STATE_HISTORY_LIMIT,
            accounting_history_limit: DEFAULT_ACCOUNTING_HISTORY_LIMIT,
            milestones: OnboardingMilestones::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditConfig {
    pub enabled: bool,
    pub include_patch: bool,
    pub path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            include_patch: false,
            path: PathBuf::from(DEFAULT_AUDIT_PATH),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadStateConfig {
    pub reconcile: ReconcileConfig,
    pub audit: AuditConfig,
}

impl ThreadStateConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let state_history_limit = parse_with_lookup(
            &lookup,
            ENV_STATE_HISTORY_LIMIT,
            DEFAULT_STATE_HISTORY_LIMIT,
            |raw| {
                raw.parse::<usize>()
                    .map_err(|error| ConfigError::InvalidStateHistoryLimit(error.to_string()))
            },
        )?;
        let accounting_history_limit = parse_with_lookup(
            &lookup,
            ENV_ACCOUNTING_HISTORY_LIMIT,
            DEFAULT_ACCOUNTING_HISTORY_LIMIT,
            |raw| {
                raw.parse::<usize>()
                    .map_err(|error| ConfigError::InvalidAccountingHistoryLimit(error.to_string()))
            },
        )?;
        let milestones = match lookup(ENV_ONBOARDING_MILESTONES) {
            Some(raw) if !raw.trim().is_empty() => parse_milestones(&raw)?,
            _ => OnboardingMilestones::default(),
        };
        let enabled = parse_with_lookup(&lookup, ENV_AUDIT_ENABLED, false, |raw| {
            parse_bool_value(&raw).map_err(ConfigError::InvalidAuditEnabled)
        })?;
        let include_patch = parse_with_lookup(&lookup, ENV_AUDIT_INCLUDE_PATCH, false, |raw| {
            parse_bool_value(&raw).map_err(ConfigError::InvalidAuditIncludePatch)
        })?;
        let path = lookup(ENV_AUDIT_PATH)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_AUDIT_PATH));

        Ok(Self {
            reconcile: ReconcileConfig {
                state_history_limit,
                accounting_history_limit,
                milestones,
            },
            audit: AuditConfig {
                enabled,
                include_patch,
                path,
            },
        })
    }
}

/// Parses `key=value` pairs separated by commas on top of the default table.
fn parse_milestones(raw: &str) -> Result<OnboardingMilestones, ConfigError> {
    let mut milestones = OnboardingMilestones::default();
    for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let Some((key, value)) = entry.split_once('=') else {
            return Err(ConfigError::InvalidOnboardingMilestones(format!(
                "expected key=value, got: {entry}"
            )));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::InvalidOnboardingMilestones(format!(
                "empty key in: {entry}"
            )));
        }
        let progress = value
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|progress| progress.is_finite() && *progress >= 0.0)
            .ok_or_else(|| {
                ConfigError::InvalidOnboardingMilestones(format!("invalid progress in: {entry}"))
            })?;
        milestones = milestones.with_milestone(key, progress);
    }
    Ok(milestones)
}

pub fn parse_with_lookup<T, E>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, E>,
) -> Result<T, E> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => parser(raw.trim().to_string()),
        _ => Ok(default),
    }
}

pub fn parse_bool_value(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(other.to_string()),
    }
}
