//! Configuration module for the ICMP receiver.
//!
//! Receiver instances are loaded from a YAML file whose path comes from the
//! environment, then validated against a shared [`TargetRegistry`].

mod registry;
mod validation;

pub use registry::*;
pub use validation::*;

use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable holding the configuration file path.
pub const CONFIG_PATH_ENV: &str = "ICMP_RECEIVER_CONFIG";

/// Configuration file used when [`CONFIG_PATH_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "icmp-receiver.yaml";

/// Tag value used when the configured tag is empty.
pub const TAG_NOT_SET: &str = "NA";

fn default_collection_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_ping_count() -> u32 {
    3
}

fn default_ping_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_tag() -> String {
    TAG_NOT_SET.to_string()
}

/// Settings for one receiver instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// How often the controller scrapes (default: 1m).
    #[serde(default = "default_collection_interval", with = "humantime_serde")]
    pub collection_interval: Duration,
    /// Delay before the first scrape (default: 1s).
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Scrape deadline, zero for none. Advisory only.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_ping_count")]
    pub default_ping_count: u32,
    #[serde(default = "default_ping_timeout", with = "humantime_serde")]
    pub default_ping_timeout: Duration,
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default)]
    pub targets: Vec<Target>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            collection_interval: default_collection_interval(),
            initial_delay: default_initial_delay(),
            timeout: Duration::ZERO,
            default_ping_count: default_ping_count(),
            default_ping_timeout: default_ping_timeout(),
            tag: default_tag(),
            targets: Vec::new(),
        }
    }
}

impl ReceiverConfig {
    /// Receiver-wide ping settings used when a target has no override.
    pub fn ping_defaults(&self) -> PingDefaults {
        PingDefaults {
            count: self.default_ping_count,
            timeout: self.default_ping_timeout,
        }
    }
}

/// A host to probe, with optional per-target overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Hostname or IP address.
    pub target: String,
    #[serde(default)]
    pub ping_count: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    pub ping_timeout: Option<Duration>,
}

impl Target {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ping_count: None,
            ping_timeout: None,
        }
    }

    pub fn with_ping_count(mut self, count: u32) -> Self {
        self.ping_count = Some(count);
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = Some(timeout);
        self
    }

    /// Merge this target's overrides with the receiver-wide defaults.
    pub fn resolve(&self, defaults: &PingDefaults) -> PingParams {
        PingParams {
            count: self.ping_count.unwrap_or(defaults.count),
            timeout: self.ping_timeout.unwrap_or(defaults.timeout),
        }
    }
}

/// Receiver-wide ping count and timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingDefaults {
    pub count: u32,
    pub timeout: Duration,
}

/// Effective parameters for one probe run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingParams {
    pub count: u32,
    pub timeout: Duration,
}

/// Top-level configuration file: named receiver instances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub receivers: BTreeMap<String, ReceiverConfig>,
}

impl FileConfig {
    /// Parse a configuration document.
    pub fn from_yaml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(input)?)
    }

    /// Read and parse a configuration file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load the configuration file named by `ICMP_RECEIVER_CONFIG`.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        tracing::info!("Loading configuration from {}", path);
        Self::from_path(path)
    }

    /// Validate every receiver against one registry.
    ///
    /// Errors are keyed by receiver name. Receivers are visited in name
    /// order, so a target shared by two receivers is reported on the later one.
    pub fn validate(
        &mut self,
        registry: &TargetRegistry,
    ) -> Result<(), BTreeMap<String, ValidationErrors>> {
        let mut failures = BTreeMap::new();
        for (name, receiver) in self.receivers.iter_mut() {
            if let Err(errs) = receiver.validate(registry) {
                failures.insert(name.clone(), errs);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures)
        }
    }
}
