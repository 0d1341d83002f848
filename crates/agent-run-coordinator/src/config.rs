use std::env;
use std::time::Duration;

use agent_thread_state::config::parse_with_lookup;
use thiserror::Error;

pub const ENV_FLEET_POLL_INTERVAL_MS: &str = "FLEET_POLL_INTERVAL_MS";
pub const ENV_FLEET_POLL_MAX_CONCURRENCY: &str = "FLEET_POLL_MAX_CONCURRENCY";
pub const ENV_FLEET_POLL_BUSY_COOLDOWN_MS: &str = "FLEET_POLL_BUSY_COOLDOWN_MS";
pub const ENV_FLEET_POLL_TIMEOUT_MS: &str = "FLEET_POLL_TIMEOUT_MS";
pub const ENV_DISPATCH_BUSY_MAX_RETRIES: &str = "RUN_DISPATCH_BUSY_MAX_RETRIES";
pub const ENV_DISPATCH_BUSY_BASE_DELAY_MS: &str = "RUN_DISPATCH_BUSY_BASE_DELAY_MS";
pub const ENV_DISPATCH_BUSY_MAX_DELAY_MS: &str = "RUN_DISPATCH_BUSY_MAX_DELAY_MS";

const DEFAULT_POLL_INTERVAL_MS: u64 = 15_000;
const DEFAULT_POLL_MAX_CONCURRENCY: usize = 4;
const DEFAULT_POLL_BUSY_COOLDOWN_MS: u64 = 30_000;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 8_000;
const DEFAULT_BUSY_MAX_RETRIES: u32 = 5;
const DEFAULT_BUSY_BASE_DELAY_MS: u64 = 250;
const DEFAULT_BUSY_MAX_DELAY_MS: u64 = 4_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid FLEET_POLL_INTERVAL_MS: {0}")]
    InvalidPollInterval(String),
    #[error("invalid FLEET_POLL_MAX_CONCURRENCY: {0}")]
    InvalidPollConcurrency(String),
    #[error("invalid FLEET_POLL_BUSY_COOLDOWN_MS: {0}")]
    InvalidPollBusyCooldown(String),
    #[error("invalid FLEET_POLL_TIMEOUT_MS: {0}")]
    InvalidPollTimeout(String),
    #[error("invalid RUN_DISPATCH_BUSY_MAX_RETRIES: {0}")]
    InvalidBusyMaxRetries(String),
    #[error("invalid RUN_DISPATCH_BUSY_BASE_DELAY_MS: {0}")]
    InvalidBusyBaseDelay(String),
    #[error("invalid RUN_DISPATCH_BUSY_MAX_DELAY_MS: {0}")]
    InvalidBusyMaxDelay(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Busy rejections tolerated after the first attempt.
    pub busy_max_retries: u32,
    pub busy_base_delay: Duration,
    pub busy_max_delay: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            busy_max_retries: DEFAULT_BUSY_MAX_RETRIES,
            busy_base_delay: Duration::from_millis(DEFAULT_BUSY_BASE_DELAY_MS),
            busy_max_delay: Duration::from_millis(DEFAULT_BUSY_MAX_DELAY_MS),
        }
    }
}

impl DispatchConfig {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.busy_base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.busy_max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetPollConfig {
    pub interval: Duration,
    pub max_concurrency: usize,
    pub busy_cooldown: Duration,
    pub timeout: Duration,
}

impl Default for FleetPollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_concurrency: DEFAULT_POLL_MAX_CONCURRENCY,
            busy_cooldown: Duration::from_millis(DEFAULT_POLL_BUSY_COOLDOWN_MS),
            timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub dispatch: DispatchConfig,
    pub fleet_poll: FleetPollConfig,
}

impl CoordinatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let interval = parse_with_lookup(
            &lookup,
            ENV_FLEET_POLL_INTERVAL_MS,
            DEFAULT_POLL_INTERVAL_MS,
            |raw| parse_positive_ms(&raw).map_err(ConfigError::InvalidPollInterval),
        )?;
        let max_concurrency = parse_with_lookup(
            &lookup,
            ENV_FLEET_POLL_MAX_CONCURRENCY,
            DEFAULT_POLL_MAX_CONCURRENCY,
            |raw| match raw.parse::<usize>() {
                Ok(0) => Err(ConfigError::InvalidPollConcurrency(
                    "must be at least 1".to_string(),
                )),
                Ok(value) => Ok(value),
                Err(error) => Err(ConfigError::InvalidPollConcurrency(error.to_string())),
            },
        )?;
        let busy_cooldown = parse_with_lookup(
            &lookup,
            ENV_FLEET_POLL_BUSY_COOLDOWN_MS,
            DEFAULT_POLL_BUSY_COOLDOWN_MS,
            |raw| {
                raw.parse::<u64>()
                    .map_err(|error| ConfigError::InvalidPollBusyCooldown(error.to_string()))
            },
        )?;
        let timeout = parse_with_lookup(
            &lookup,
            ENV_FLEET_POLL_TIMEOUT_MS,
            DEFAULT_POLL_TIMEOUT_MS,
            |raw| parse_positive_ms(&raw).map_err(ConfigError::InvalidPollTimeout),
        )?;
        let busy_max_retries = parse_with_lookup(
            &lookup,
            ENV_DISPATCH_BUSY_MAX_RETRIES,
            DEFAULT_BUSY_MAX_RETRIES,
            |raw| {
                raw.parse::<u32>()
                    .map_err(|error| ConfigError::InvalidBusyMaxRetries(error.to_string()))
            },
        )?;
        let busy_base_delay = parse_with_lookup(
            &lookup,
            ENV_DISPATCH_BUSY_BASE_DELAY_MS,
            DEFAULT_BUSY_BASE_DELAY_MS,
            |raw| {
                raw.parse::<u64>()
                    .map_err(|error| ConfigError::InvalidBusyBaseDelay(error.to_string()))
            },
        )?;
        let busy_max_delay = parse_with_lookup(
            &lookup,
            ENV_DISPATCH_BUSY_MAX_DELAY_MS,
            DEFAULT_BUSY_MAX_DELAY_MS,
            |raw| {
                raw.parse::<u64>()
                    .map_err(|error| ConfigError::InvalidBusyMaxDelay(error.to_string()))
            },
        )?;
        if busy_max_delay < busy_base_delay {
            return Err(ConfigError::InvalidBusyMaxDelay(format!(
                "{busy_max_delay} is below base delay {busy_base_delay}"
            )));
        }

        Ok(Self {
            dispatch: DispatchConfig {
                busy_max_retries,
                busy_base_delay: Duration::from_millis(busy_base_delay),
                busy_max_delay: Duration::from_millis(busy_max_delay),
            },
            fleet_poll: FleetPollConfig {
                interval: Duration::from_millis(interval),
                max_concurrency,
                busy_cooldown: Duration::from_millis(busy_cooldown),
                timeout: Duration::from_millis(timeout),
            },
        })
    }
}

fn parse_positive_ms(raw: &str) -> Result<u64, String> {
    match raw.parse::<u64>() {
        Ok(0) => Err("must be greater than zero".to_string()),
        Ok(value) => Ok(value),
        Err(error) => Err(error.to_string()),
    }
}
