//! Worker configuration.
//!
//! Sources, lowest to highest priority:
//!
//! 1. Built-in defaults
//! 2. A TOML file named by `WORKER_CONFIG` (table `[worker]`)
//! 3. Environment variables
//!
//! ```toml
//! [worker]
//! location = "eu-west-1"
//! redis_url = "redis://127.0.0.1:6379"
//! block_ms = 5000
//!
//! [worker.chaos]
//! sequential_probability = 0.5
//! error_probability = 0.0
//! ```
//!
//! Environment overrides are read through a lookup function, so tests can
//! feed a map instead of touching the process environment.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{
    DEFAULT_RESULTS_STREAM, DEFAULT_SUBSCRIPTION_PREFIX, DEFAULT_TASKS_STREAM,
};
use crate::resolver::{is_valid_probability, ChaosConfig, DEFAULT_PROGRAM};
use crate::stream::Subscription;

/// Environment variable naming an optional TOML config file.
pub const CONFIG_PATH_ENV: &str = "WORKER_CONFIG";

/// What to do with a task whose result could not be published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishFailurePolicy {
    /// Ack the task anyway; its result is lost.
    #[default]
    #[serde(rename = "ack")]
    AckAnyway,
    /// Leave the task pending so the next iteration processes it again.
    #[serde(rename = "leave-pending")]
    LeavePending,
}

impl fmt::Display for PublishFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AckAnyway => f.write_str("ack"),
            Self::LeavePending => f.write_str("leave-pending"),
        }
    }
}

impl FromStr for PublishFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ack" | "ack-anyway" => Ok(Self::AckAnyway),
            "leave-pending" | "leave_pending" => Ok(Self::LeavePending),
            other => Err(format!(
                "unknown publish failure policy {other:?} (expected \"ack\" or \"leave-pending\")"
            )),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Io {
        /// Path to the configuration file.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A setting has a value the worker cannot run with.
    #[error("invalid {field}: {message}")]
    Invalid {
        /// Setting name.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

/// Everything the worker process needs to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Location reported in every result; also names the subscription.
    pub location: String,
    /// Redis connection URL.
    pub redis_url: String,
    /// Stream tasks are read from.
    pub tasks_stream: String,
    /// Stream results are published to.
    pub results_stream: String,
    /// Subscription names are `<prefix>-<location>`.
    pub subscription_prefix: String,
    /// Service name for logs; `dns-worker-<location>` when unset.
    pub service_name: Option<String>,
    /// Chaos probabilities.
    pub chaos: ChaosConfig,
    /// Seed for reproducible chaos decisions.
    pub chaos_seed: Option<u64>,
    /// Longest wait of one blocking read, in milliseconds.
    pub block_ms: u64,
    /// Maximum entries per read.
    pub batch_size: usize,
    /// Pause after a failed read, in milliseconds.
    pub error_backoff_ms: u64,
    /// Resolver program.
    pub resolver_program: String,
    /// Bound on one resolver invocation, in milliseconds.
    pub lookup_timeout_ms: u64,
    /// Handling of results that could not be published.
    pub publish_failure_policy: PublishFailurePolicy,
    /// Stream undecodable payloads are copied to before being dropped.
    pub dead_letter_stream: Option<String>,
    /// Port of the health surface.
    pub http_port: u16,
    /// How long shutdown waits for the loop to finish, in milliseconds.
    pub shutdown_grace_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            location: "unknown".to_string(),
            redis_url: "redis://redis:6379".to_string(),
            tasks_stream: DEFAULT_TASKS_STREAM.to_string(),
            results_stream: DEFAULT_RESULTS_STREAM.to_string(),
            subscription_prefix: DEFAULT_SUBSCRIPTION_PREFIX.to_string(),
            service_name: None,
            chaos: ChaosConfig::default(),
            chaos_seed: None,
            block_ms: 60_000,
            batch_size: 10,
            error_backoff_ms: 1_000,
            resolver_program: DEFAULT_PROGRAM.to_string(),
            lookup_timeout_ms: 10_000,
            publish_failure_policy: PublishFailurePolicy::default(),
            dead_letter_stream: None,
            http_port: 8080,
            shutdown_grace_ms: 15_000,
        }
    }
}

impl WorkerConfig {
    /// Loads defaults, then the file named by `WORKER_CONFIG` if set, then
    /// the process environment, and validates the result.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] if the file cannot be read or parsed, or a setting is
    /// unusable.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file. Does not apply overrides or validate.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
                path: path.as_ref().display().to_string(),
                source,
            })?;
        Self::from_toml(&contents)
    }

    /// Parses the `[worker]` table of a TOML document. A document without
    /// one yields the defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct FullConfig {
            #[serde(default)]
            worker: WorkerConfig,
        }

        let full: FullConfig = toml::from_str(content)?;
        Ok(full.worker)
    }

    /// Applies environment-style overrides. `lookup` returns the value of a
    /// variable, or `None` when it is unset.
    ///
    /// Values that do not parse are ignored with a warning, leaving the
    /// current setting in place.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("WORKER_LOCATION") {
            self.location = v.trim().to_string();
        }
        if let Some(v) = get("REDIS_URL") {
            self.redis_url = v;
        }
        if let Some(v) = get("TASKS_STREAM") {
            self.tasks_stream = v;
        }
        if let Some(v) = get("RESULTS_STREAM") {
            self.results_stream = v;
        }
        if let Some(v) = get("SUBSCRIPTION_PREFIX") {
            self.subscription_prefix = v;
        }
        if let Some(v) = get("OTEL_SERVICE_NAME") {
            self.service_name = Some(v);
        }
        if let Some(v) = get("DNS_RESOLVER_PROGRAM") {
            self.resolver_program = v;
        }
        if let Some(v) = get("DEAD_LETTER_STREAM") {
            self.dead_letter_stream = Some(v);
        }

        if let Some(p) = get("CHAOS_SEQUENTIAL_PROBABILITY")
            .and_then(|v| parse_probability("CHAOS_SEQUENTIAL_PROBABILITY", &v))
        {
            self.chaos.sequential_probability = p;
        }
        if let Some(p) = get("CHAOS_ERROR_PROBABILITY")
            .and_then(|v| parse_probability("CHAOS_ERROR_PROBABILITY", &v))
        {
            self.chaos.error_probability = p;
        }

        override_parsed(&get, "CHAOS_SEED", |v: u64| self.chaos_seed = Some(v));
        override_parsed(&get, "STREAM_BLOCK_MS", |v| self.block_ms = v);
        override_parsed(&get, "STREAM_BATCH_SIZE", |v| self.batch_size = v);
        override_parsed(&get, "STREAM_ERROR_BACKOFF_MS", |v| self.error_backoff_ms = v);
        override_parsed(&get, "DNS_LOOKUP_TIMEOUT_MS", |v| self.lookup_timeout_ms = v);
        override_parsed(&get, "PUBLISH_FAILURE_POLICY", |v| self.publish_failure_policy = v);
        override_parsed(&get, "HTTP_PORT", |v| self.http_port = v);
        override_parsed(&get, "SHUTDOWN_GRACE_MS", |v| self.shutdown_grace_ms = v);
    }

    /// Checks settings. Out-of-range tunables fall back to their defaults
    /// with a warning; settings the worker cannot run with are errors.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] for an empty location or stream name, or
    /// when tasks and results share a stream.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let defaults = Self::default();

        if !is_valid_probability(self.chaos.sequential_probability) {
            tracing::warn!(
                value = self.chaos.sequential_probability,
                default = defaults.chaos.sequential_probability,
                "sequential probability out of range, using default"
            );
            self.chaos.sequential_probability = defaults.chaos.sequential_probability;
        }
        if !is_valid_probability(self.chaos.error_probability) {
            tracing::warn!(
                value = self.chaos.error_probability,
                default = defaults.chaos.error_probability,
                "error probability out of range, using default"
            );
            self.chaos.error_probability = defaults.chaos.error_probability;
        }
        if self.batch_size == 0 {
            tracing::warn!(
                default = defaults.batch_size,
                "batch size of 0, using default"
            );
            self.batch_size = defaults.batch_size;
        }
        if self.block_ms == 0 {
            tracing::warn!(default = defaults.block_ms, "block of 0ms, using default");
            self.block_ms = defaults.block_ms;
        }
        if self.lookup_timeout_ms == 0 {
            tracing::warn!(
                default = defaults.lookup_timeout_ms,
                "lookup timeout of 0ms, using default"
            );
            self.lookup_timeout_ms = defaults.lookup_timeout_ms;
        }

        for (field, value) in [
            ("location", &self.location),
            ("tasks_stream", &self.tasks_stream),
            ("results_stream", &self.results_stream),
            ("subscription_prefix", &self.subscription_prefix),
            ("resolver_program", &self.resolver_program),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field,
                    message: "must not be empty".to_string(),
                });
            }
        }
        if self.tasks_stream == self.results_stream {
            return Err(ConfigError::Invalid {
                field: "results_stream",
                message: format!("must differ from tasks_stream ({})", self.tasks_stream),
            });
        }
        if self.dead_letter_stream.as_deref() == Some(self.tasks_stream.as_str()) {
            return Err(ConfigError::Invalid {
                field: "dead_letter_stream",
                message: format!("must differ from tasks_stream ({})", self.tasks_stream),
            });
        }
        Ok(())
    }

    /// Service name used in logs.
    pub fn service_name(&self) -> String {
        self.service_name
            .clone()
            .unwrap_or_else(|| format!("dns-worker-{}", self.location))
    }

    /// This location's subscription over the task stream.
    pub fn subscription(&self) -> Subscription {
        Subscription::for_location(
            &self.tasks_stream,
            &self.subscription_prefix,
            &self.location,
        )
    }

    /// Longest wait of one blocking read.
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    /// Pause after a failed read.
    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    /// Bound on one resolver invocation.
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    /// Shutdown grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn parse_probability(key: &str, raw: &str) -> Option<f64> {
    match raw.trim().parse::<f64>() {
        Ok(p) if is_valid_probability(p) => Some(p),
        Ok(p) => {
            tracing::warn!(
                key,
                value = p,
                "probability must be within [0, 1], ignoring"
            );
            None
        },
        Err(e) => {
            tracing::warn!(key, value = raw, error = %e, "invalid probability, ignoring");
            None
        },
    }
}

fn override_parsed<G, T, S>(get: &G, key: &str, set: S)
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
    S: FnOnce(T),
{
    if let Some(raw) = get(key) {
        match raw.trim().parse::<T>() {
            Ok(v) => set(v),
            Err(e) => tracing::warn!(key, value = %raw, error = %e, "invalid override, ignoring"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_deployment() {
        let config = WorkerConfig::default();
        assert_eq!(config.location, "unknown");
        assert_eq!(config.tasks_stream, "dns:tasks");
        assert_eq!(config.results_stream, "dns:results");
        assert_eq!(config.block(), Duration::from_secs(60));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.chaos, ChaosConfig::default());
        assert_eq!(
            config.publish_failure_policy,
            PublishFailurePolicy::AckAnyway
        );
        assert_eq!(config.service_name(), "dns-worker-unknown");
    }

    #[test]
    fn overrides_apply() {
        let mut config = WorkerConfig::default();
        config.apply_overrides(env(&[
            ("WORKER_LOCATION", "ap-south-1"),
            ("CHAOS_SEQUENTIAL_PROBABILITY", "1.0"),
            ("CHAOS_ERROR_PROBABILITY", "0"),
            ("CHAOS_SEED", "42"),
            ("STREAM_BLOCK_MS", "250"),
            ("PUBLISH_FAILURE_POLICY", "leave-pending"),
            ("DEAD_LETTER_STREAM", "dns:dead"),
        ]));
        config.validate().unwrap();

        assert_eq!(config.location, "ap-south-1");
        assert_eq!(config.chaos.sequential_probability, 1.0);
        assert_eq!(config.chaos.error_probability, 0.0);
        assert_eq!(config.chaos_seed, Some(42));
        assert_eq!(config.block(), Duration::from_millis(250));
        assert_eq!(
            config.publish_failure_policy,
            PublishFailurePolicy::LeavePending
        );
        assert_eq!(config.dead_letter_stream.as_deref(), Some("dns:dead"));

        let sub = config.subscription();
        assert_eq!(sub.name, "workers-ap-south-1");
        assert_eq!(sub.reader, "consumer-ap-south-1");
    }

    #[test]
    fn invalid_probabilities_keep_defaults() {
        let mut config = WorkerConfig::default();
        config.apply_overrides(env(&[
            ("CHAOS_SEQUENTIAL_PROBABILITY", "1.5"),
            ("CHAOS_ERROR_PROBABILITY", "lots"),
        ]));
        assert_eq!(config.chaos, ChaosConfig::default());
    }

    #[test]
    fn each_probability_is_validated_independently() {
        let mut config = WorkerConfig::default();
        config.apply_overrides(env(&[
            ("CHAOS_SEQUENTIAL_PROBABILITY", "NaN"),
            ("CHAOS_ERROR_PROBABILITY", "0.75"),
        ]));
        assert_eq!(config.chaos.sequential_probability, 0.3);
        assert_eq!(config.chaos.error_probability, 0.75);
    }

    #[test]
    fn unparsable_numbers_are_ignored() {
        let mut config = WorkerConfig::default();
        config.apply_overrides(env(&[("STREAM_BATCH_SIZE", "ten"), ("HTTP_PORT", "99999")]));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.http_port, 8080);
    }

    #[test]
    fn blank_overrides_are_ignored() {
        let mut config = WorkerConfig::default();
        config.apply_overrides(env(&[("WORKER_LOCATION", "  ")]));
        assert_eq!(config.location, "unknown");
    }

    #[test]
    fn validate_falls_back_and_rejects() {
        let mut config = WorkerConfig {
            batch_size: 0,
            chaos: ChaosConfig {
                sequential_probability: -1.0,
                error_probability: 2.0,
            },
            ..WorkerConfig::default()
        };
        config.validate().unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.chaos, ChaosConfig::default());

        let mut same = WorkerConfig {
            results_stream: "dns:tasks".to_string(),
            ..WorkerConfig::default()
        };
        assert!(matches!(
            same.validate(),
            Err(ConfigError::Invalid { field: "results_stream", .. })
        ));
    }

    #[test]
    fn toml_file_is_read_from_worker_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [worker]
            location = "eu-west-1"
            batch_size = 3
            publish_failure_policy = "leave-pending"

            [worker.chaos]
            sequential_probability = 0.5
            "#
        )
        .unwrap();

        let config = WorkerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.location, "eu-west-1");
        assert_eq!(config.batch_size, 3);
        assert_eq!(
            config.publish_failure_policy,
            PublishFailurePolicy::LeavePending
        );
        assert_eq!(config.chaos.sequential_probability, 0.5);
        assert_eq!(config.chaos.error_probability, 0.1);
        assert_eq!(config.redis_url, "redis://redis:6379");
    }

    #[test]
    fn missing_file_and_bad_toml_are_errors() {
        assert!(matches!(
            WorkerConfig::from_file("/nonexistent/worker.toml"),
            Err(ConfigError::Io { .. })
        ));
        assert!(matches!(
            WorkerConfig::from_toml("[worker]\nbatch_size = \"many\""),
            Err(ConfigError::Parse(_))
        ));
        assert_eq!(
            WorkerConfig::from_toml("").unwrap(),
            WorkerConfig::default()
        );
    }

    proptest! {
        #[test]
        fn probabilities_always_end_up_valid(seq in any::<f64>(), err in any::<f64>()) {
            let mut config = WorkerConfig::default();
            config.apply_overrides(env(&[
                ("CHAOS_SEQUENTIAL_PROBABILITY", &seq.to_string()),
                ("CHAOS_ERROR_PROBABILITY", &err.to_string()),
            ]));
            config.validate().unwrap();
            prop_assert!(is_valid_probability(config.chaos.sequential_probability));
            prop_assert!(is_valid_probability(config.chaos.error_probability));
        }
    }
}
