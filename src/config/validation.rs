//! Receiver configuration validation.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::{ReceiverConfig, TargetRegistry, TAG_NOT_SET};

/// Smallest accepted `default_ping_count`.
pub const MIN_DEFAULT_PING_COUNT: u32 = 3;

/// Smallest accepted `default_ping_timeout`.
pub const MIN_DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Smallest accepted per-target `ping_count`.
pub const MIN_TARGET_PING_COUNT: u32 = 1;

/// Per-target `ping_timeout` must be strictly greater than this.
pub const TARGET_PING_TIMEOUT_FLOOR: Duration = Duration::from_secs(1);

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("\"collection_interval\": requires positive value")]
    NonPositiveInterval,
    #[error("[{0}] \"tag\": cannot contain spaces")]
    TagContainsSpaces(String),
    #[error("\"default_ping_count\": cannot be lesser than 3")]
    DefaultPingCount(u32),
    #[error("\"default_ping_timeout\": cannot be lesser than 5s")]
    DefaultPingTimeout(Duration),
    #[error("\"targets\": cannot be empty or nil")]
    NoTargets,
    #[error("target #{index} has invalid ping_count {count}")]
    TargetPingCount { index: usize, count: u32 },
    #[error("target #{index} has invalid ping_timeout {timeout:?}")]
    TargetPingTimeout { index: usize, timeout: Duration },
    #[error("target #{index} with value **{target:?}** is duplicated")]
    DuplicateTarget { index: usize, target: String },
}

/// Every validation failure found in one pass.
#[derive(Debug, Default)]
pub struct ValidationErrors(Vec<ConfigError>);

impl ValidationErrors {
    pub fn errors(&self) -> &[ConfigError] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn push(&mut self, err: ConfigError) {
        self.0.push(err);
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

impl ReceiverConfig {
    /// Validate the configuration, reporting every problem at once.
    ///
    /// An empty tag is replaced by [`TAG_NOT_SET`] even when other checks
    /// fail. Targets are claimed in `registry` only if nothing failed.
    /// Target numbers in messages are 1-based.
    pub fn validate(&mut self, registry: &TargetRegistry) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::default();

        if self.collection_interval.is_zero() {
            errs.push(ConfigError::NonPositiveInterval);
        }

        if self.tag.is_empty() {
            self.tag = TAG_NOT_SET.to_string();
        } else if self.tag.contains(' ') {
            errs.push(ConfigError::TagContainsSpaces(self.tag.clone()));
        }

        // `timeout` is a Duration, so the non-negative rule holds by construction.

        if self.default_ping_count < MIN_DEFAULT_PING_COUNT {
            errs.push(ConfigError::DefaultPingCount(self.default_ping_count));
        }
        if self.default_ping_timeout < MIN_DEFAULT_PING_TIMEOUT {
            errs.push(ConfigError::DefaultPingTimeout(self.default_ping_timeout));
        }

        if self.targets.is_empty() {
            errs.push(ConfigError::NoTargets);
        }

        for (i, target) in self.targets.iter().enumerate() {
            if let Some(count) = target.ping_count {
                if count < MIN_TARGET_PING_COUNT {
                    errs.push(ConfigError::TargetPingCount { index: i + 1, count });
                }
            }
            if let Some(timeout) = target.ping_timeout {
                if timeout <= TARGET_PING_TIMEOUT_FLOOR {
                    errs.push(ConfigError::TargetPingTimeout { index: i + 1, timeout });
                }
            }
        }

        let names: Vec<&str> = self.targets.iter().map(|t| t.target.as_str()).collect();
        for i in registry.claim(&names, errs.is_empty()) {
            errs.push(ConfigError::DuplicateTarget {
                index: i + 1,
                target: self.targets[i].target.clone(),
            });
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(errs)
        }
    }
}
