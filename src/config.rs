//! Subscription configuration.
//!
//! The configuration is a single YAML document loaded once at startup:
//!
//! ```yaml
//! subscriptions:
//! - name: build
//!   dir: /some-checkout-dir
//!   trigger:
//!     pubsub:
//!       project: some-project
//!       topic: git-trigger
//!   tasks:
//!   - cmd: git pull
//!     timeout: 2s
//!   - cmd: make
//! ```
//!
//! Parsing and validation are separate steps: [`Config::from_yaml`] only
//! fails on malformed documents, [`Config::check`] reports the first
//! semantic problem it finds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/subrun.yaml";

/// Errors produced while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("no subscriptions")]
    NoSubscriptions,

    #[error("subscription {0:?}: no trigger")]
    NoTrigger(String),

    #[error("subscription {0:?}: empty trigger")]
    EmptyTrigger(String),

    #[error("subscription {0:?}: pubsub trigger is missing topic")]
    MissingTopic(String),

    #[error("subscription {0:?}: no tasks")]
    NoTasks(String),

    #[error("subscription {0:?}: task {1}: no command")]
    NoCommand(String, usize),

    #[error("max_concurrent_pipelines must be at least 1")]
    ZeroConcurrency,
}

impl ConfigError {
    /// Whether this error came from validation rather than reading the file
    pub fn is_validation(&self) -> bool {
        !matches!(self, Self::Io(_) | Self::Parse(_))
    }
}

/// Top-level configuration document
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Config {
    /// Upper bound on concurrently running pipelines (unbounded if absent,
    /// zero is rejected by [`Config::check`])
    #[serde(default)]
    pub max_concurrent_pipelines: Option<usize>,

    /// Configured subscriptions, in declaration order
    #[serde(default, deserialize_with = "null_as_default")]
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// One topic subscription and the tasks it triggers
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SubscriptionConfig {
    #[serde(default)]
    pub name: String,

    /// Working directory for every task (empty means the current directory)
    #[serde(default)]
    pub dir: String,

    #[serde(default)]
    pub trigger: Option<TriggerConfig>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub tasks: Vec<TaskConfig>,
}

/// Trigger descriptor; exactly one source kind is supported today
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TriggerConfig {
    #[serde(default)]
    pub pubsub: Option<PubSubTriggerConfig>,
}

/// Pub/Sub topic to subscribe to
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PubSubTriggerConfig {
    #[serde(default)]
    pub project: String,

    #[serde(default)]
    pub topic: String,

    /// Alternate REST endpoint (e.g. a regional endpoint)
    #[serde(default)]
    pub endpoint: String,

    /// Credentials reference
    #[serde(default, rename = "credentialsFile")]
    pub credentials_file: String,
}

/// A single shell command in a subscription's pipeline
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub cmd: String,

    #[serde(default, deserialize_with = "deserialize_timeout")]
    pub timeout: Option<Duration>,
}

impl TaskConfig {
    /// Timeout to apply, treating zero as "no timeout"
    pub fn effective_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|t| !t.is_zero())
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML content
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Validate the configuration, returning the first problem found
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.subscriptions.is_empty() {
            return Err(ConfigError::NoSubscriptions);
        }

        for (i, sub) in self.subscriptions.iter().enumerate() {
            let id = sub.id(i);

            let trigger = sub.trigger.as_ref().ok_or_else(|| ConfigError::NoTrigger(id.clone()))?;
            let pubsub = trigger
                .pubsub
                .as_ref()
                .ok_or_else(|| ConfigError::EmptyTrigger(id.clone()))?;

            if pubsub.topic.is_empty() {
                return Err(ConfigError::MissingTopic(id));
            }

            if sub.tasks.is_empty() {
                return Err(ConfigError::NoTasks(id));
            }

            if let Some(j) = sub.tasks.iter().position(|t| t.cmd.is_empty()) {
                return Err(ConfigError::NoCommand(id, j));
            }
        }

        if self.max_concurrent_pipelines == Some(0) {
            return Err(ConfigError::ZeroConcurrency);
        }

        Ok(())
    }

    /// Resolve validated subscriptions into their runtime form.
    ///
    /// Subscriptions without a usable trigger are skipped; call
    /// [`Config::check`] first.
    pub fn resolve(&self) -> Vec<Subscription> {
        self.subscriptions
            .iter()
            .enumerate()
            .filter_map(|(i, sub)| {
                let trigger = sub.trigger.as_ref()?.pubsub.clone()?;
                Some(Subscription {
                    id: sub.id(i),
                    dir: (!sub.dir.is_empty()).then(|| PathBuf::from(&sub.dir)),
                    trigger,
                    tasks: sub.tasks.clone(),
                })
            })
            .collect()
    }
}

impl SubscriptionConfig {
    /// Identifier used in logs and subscription names: the name, or the
    /// position in the list when unnamed
    pub fn id(&self, index: usize) -> String {
        if self.name.is_empty() {
            index.to_string()
        } else {
            self.name.clone()
        }
    }
}

/// A validated subscription as the orchestrator uses it
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: String,
    pub dir: Option<PathBuf>,
    pub trigger: PubSubTriggerConfig,
    pub tasks: Vec<TaskConfig>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn deserialize_timeout<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(f64),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) if n == 0.0 => Ok(Some(Duration::ZERO)),
        Some(Raw::Number(n)) => Err(serde::de::Error::custom(format!(
            "timeout {n} is missing a unit, e.g. \"{n}s\""
        ))),
        Some(Raw::Text(s)) => parse_duration(&s).map(Some).map_err(serde::de::Error::custom),
    }
}

/// Parse a Go-style duration string such as `300ms`, `1m30s` or `1.5h`
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0f64;
    let mut rest = s;

    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(format!("invalid duration {input:?}"));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| format!("invalid duration {input:?}"))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(format!("missing unit in duration {input:?}")),
            unit => return Err(format!("unknown unit {unit:?} in duration {input:?}")),
        };
        rest = &rest[unit_len..];

        total += value * nanos_per_unit;
    }

    Ok(Duration::from_nanos(total.round() as u64))
}
