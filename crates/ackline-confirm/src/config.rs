// Confirm session defaults with environment and YAML overrides.
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{ConfirmError, Result};

pub(crate) const DEFAULT_MAX_OUTSTANDING: usize = 1024;
// Matches the per-message wait the broker client uses for waitForConfirmsOrDie.
pub(crate) const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// What `publish` does when `max_outstanding` confirms are already in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Wait for an earlier publish to resolve.
    Block,
    /// Fail immediately with `ConfirmError::Backpressure`.
    Reject,
}

/// Session default for `Publisher::submit`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishMode {
    /// Wait for each message's confirm before returning.
    Synchronous,
    /// Return a handle as soon as the message is sent.
    Asynchronous,
}

#[derive(Clone, Debug)]
pub struct ConfirmConfig {
    pub max_outstanding: usize,
    pub backpressure: BackpressurePolicy,
    pub confirm_timeout: Duration,
    pub mode: PublishMode,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ConfirmConfigOverride {
    max_outstanding: Option<usize>,
    backpressure: Option<String>,
    confirm_timeout_ms: Option<u64>,
    mode: Option<String>,
}

impl Default for ConfirmConfig {
    fn default() -> Self {
        Self {
            max_outstanding: DEFAULT_MAX_OUTSTANDING,
            backpressure: BackpressurePolicy::Block,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
            mode: PublishMode::Synchronous,
        }
    }
}

impl ConfirmConfig {
    /// Defaults, then `ACKLINE_*` environment variables, then the YAML file at
    /// `config_path` (or `ACKLINE_CONFIRM_CONFIG`) if one is given.
    ///
    /// ```no_run
    /// use ackline_confirm::ConfirmConfig;
    ///
    /// let config = ConfirmConfig::from_env_or_yaml(Some("confirm.yaml")).expect("config");
    /// assert!(config.max_outstanding > 0);
    /// ```
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("ACKLINE_CONFIRM_CONFIG").ok());
        if let Some(path) = override_path {
            config.apply_yaml_file(Path::new(&path))?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_usize_env("ACKLINE_MAX_OUTSTANDING") {
            config.max_outstanding = value;
        }
        if let Some(value) = std::env::var("ACKLINE_BACKPRESSURE")
            .ok()
            .and_then(|value| parse_backpressure(&value))
        {
            config.backpressure = value;
        }
        if let Some(value) = read_u64_env("ACKLINE_CONFIRM_TIMEOUT_MS") {
            config.confirm_timeout = Duration::from_millis(value);
        }
        if let Some(value) = std::env::var("ACKLINE_PUBLISH_MODE")
            .ok()
            .and_then(|value| parse_mode(&value))
        {
            config.mode = value;
        }
        config
    }

    pub fn with_max_outstanding(mut self, max_outstanding: usize) -> Self {
        self.max_outstanding = max_outstanding;
        self
    }

    pub fn with_backpressure(mut self, backpressure: BackpressurePolicy) -> Self {
        self.backpressure = backpressure;
        self
    }

    pub fn with_confirm_timeout(mut self, confirm_timeout: Duration) -> Self {
        self.confirm_timeout = confirm_timeout;
        self
    }

    pub fn with_mode(mut self, mode: PublishMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_outstanding == 0 {
            return Err(ConfirmError::InvalidConfig(
                "max_outstanding must be at least 1".to_string(),
            ));
        }
        if self.max_outstanding > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(ConfirmError::InvalidConfig(format!(
                "max_outstanding {} exceeds {}",
                self.max_outstanding,
                tokio::sync::Semaphore::MAX_PERMITS
            )));
        }
        if self.confirm_timeout.is_zero() {
            return Err(ConfirmError::InvalidConfig(
                "confirm_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    fn apply_yaml_file(&mut self, path: &Path) -> Result<()> {
        let contents = fs::read_to_string(path).map_err(|err| {
            ConfirmError::InvalidConfig(format!("read {}: {err}", path.display()))
        })?;
        let override_cfg: ConfirmConfigOverride = serde_yaml::from_str(&contents)
            .map_err(|err| ConfirmError::InvalidConfig(format!("parse {}: {err}", path.display())))?;
        override_cfg.apply(self);
        Ok(())
    }
}

impl ConfirmConfigOverride {
    fn apply(&self, config: &mut ConfirmConfig) {
        if let Some(value) = self.max_outstanding
            && value > 0
        {
            config.max_outstanding = value;
        }
        if let Some(value) = &self.backpressure
            && let Some(parsed) = parse_backpressure(value)
        {
            config.backpressure = parsed;
        }
        if let Some(value) = self.confirm_timeout_ms
            && value > 0
        {
            config.confirm_timeout = Duration::from_millis(value);
        }
        if let Some(value) = &self.mode
            && let Some(parsed) = parse_mode(value)
        {
            config.mode = parsed;
        }
    }
}

fn parse_backpressure(value: &str) -> Option<BackpressurePolicy> {
    match value {
        "block" => Some(BackpressurePolicy::Block),
        "reject" => Some(BackpressurePolicy::Reject),
        _ => None,
    }
}

fn parse_mode(value: &str) -> Option<PublishMode> {
    match value {
        "sync" | "synchronous" => Some(PublishMode::Synchronous),
        "async" | "asynchronous" => Some(PublishMode::Asynchronous),
        _ => None,
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}
