//! Process-wide configuration for the tasker fabric.
//!
//! Configuration is loaded once from `config_data/config.yaml` and exposed
//! through [`settings()`]. Every tunable the scheduler, dispatcher, and
//! sweeper consume lives here so that deployments never need a rebuild to
//! change a threshold.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Deserialize, Clone)]
pub struct TaskerConfig {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    /// Named external endpoints the dispatcher may call, keyed by service
    /// name as task code passes it to `call_host_tool`.
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
    /// Declarative result-shaping rules, see [`ShapeRule`].
    #[serde(default)]
    pub shaping: Vec<ShapeRule>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default)]
pub enum LoggingLevel {
    ERROR,
    WARN,
    #[default]
    INFO,
    DEBUG,
    TRACE,
    OFF,
}

impl<'de> Deserialize<'de> for LoggingLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v = String::deserialize(deserializer)?;

        Ok(match v.as_str() {
            "ERROR" => Self::ERROR,
            "WARN" => Self::WARN,
            "INFO" => Self::INFO,
            "DEBUG" => Self::DEBUG,
            "TRACE" => Self::TRACE,
            "OFF" => Self::OFF,
            other => Err(serde::de::Error::custom(format!(
                "Bad logging level specifier {other}"
            )))?,
        })
    }
}

impl From<LoggingLevel> for LevelFilter {
    fn from(value: LoggingLevel) -> Self {
        match value {
            LoggingLevel::ERROR => LevelFilter::ERROR,
            LoggingLevel::WARN => LevelFilter::WARN,
            LoggingLevel::INFO => LevelFilter::INFO,
            LoggingLevel::DEBUG => LevelFilter::DEBUG,
            LoggingLevel::TRACE => LevelFilter::TRACE,
            LoggingLevel::OFF => LevelFilter::OFF,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub log_file: Option<String>,

    #[serde(default)]
    pub max_level: LoggingLevel,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: HostPortPair,
    pub username: String,
    pub password: String,
    pub database_name: String,
    #[serde(default = "defaults::pool_size")]
    pub pool_size: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    pub bind_addr: HostPortPair,
    /// URL other workers (and this worker's own cascade trigger) reach this
    /// instance at, without a trailing slash.
    pub external_url: String,
    /// Shared secret expected on internal endpoints (`process-next`,
    /// `resume`).
    pub process_secret: String,
}

/// Outbound-call behavior of the service dispatcher.
#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    #[serde(default = "defaults::dispatch_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: defaults::dispatch_timeout_seconds(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "defaults::lock_retry_attempts")]
    pub lock_retry_attempts: u32,
    #[serde(default = "defaults::lock_retry_delay_ms")]
    pub lock_retry_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_retry_attempts: defaults::lock_retry_attempts(),
            lock_retry_delay_ms: defaults::lock_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SweeperConfig {
    /// Chain locks older than this are presumed abandoned and deleted.
    #[serde(default = "defaults::lock_stale_minutes")]
    pub lock_stale_minutes: i64,
    /// Steps sitting in `processing` longer than this are failed with a
    /// synthetic timeout.
    #[serde(default = "defaults::step_stale_minutes")]
    pub step_stale_minutes: i64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            lock_stale_minutes: defaults::lock_stale_minutes(),
            step_stale_minutes: defaults::step_stale_minutes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Base URL of the wrapped endpoint, without a trailing slash. The
    /// method path from the stack run is appended verbatim.
    pub url: String,
    /// Optional bearer token sent on every call to this service.
    #[serde(default)]
    pub token: Option<String>,
}

/// Wraps a raw-array response from `{service}` methods ending in
/// `{method_suffix}` into `{wrap_key: [...]}`, the object shape task code
/// expects from list operations. Kept declarative so endpoint schemas stay
/// out of the dispatcher.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ShapeRule {
    pub service: String,
    pub method_suffix: String,
    pub wrap_key: String,
}

mod defaults {
    pub fn pool_size() -> u32 {
        10
    }

    pub fn dispatch_timeout_seconds() -> u64 {
        30
    }

    pub fn lock_retry_attempts() -> u32 {
        3
    }

    pub fn lock_retry_delay_ms() -> u64 {
        100
    }

    pub fn lock_stale_minutes() -> i64 {
        5
    }

    pub fn step_stale_minutes() -> i64 {
        2
    }
}

#[derive(Debug, Clone)]
pub struct HostPortPair {
    pub host: String,
    pub port: u16,
}

impl<'de> Deserialize<'de> for HostPortPair {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let base = String::deserialize(deserializer)?;

        let (host, port) = base
            .split_once(':')
            .ok_or(serde::de::Error::custom(format!(
                "Failed to split {base} into component host and port"
            )))?;

        let port = port.parse().map_err(|_e| {
            serde::de::Error::custom(format!("Couldn't parse out port as an int from {port}"))
        })?;

        Ok(HostPortPair {
            host: host.to_owned(),
            port,
        })
    }
}

impl std::fmt::Display for HostPortPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

static CONFIG: once_cell::sync::Lazy<TaskerConfig> = once_cell::sync::Lazy::new(|| {
    config_rs::Config::builder()
        .add_source(config_rs::File::with_name("config_data/config.yaml"))
        .build()
        .expect("couldn't load config file")
        .try_deserialize()
        .expect("couldn't load config file, invalid format")
});

pub fn settings() -> &'static TaskerConfig {
    &CONFIG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunables_default_to_documented_values() {
        let sweeper = SweeperConfig::default();
        assert_eq!(sweeper.lock_stale_minutes, 5);
        assert_eq!(sweeper.step_stale_minutes, 2);

        let dispatch = DispatchConfig::default();
        assert_eq!(dispatch.timeout_seconds, 30);

        let scheduler = SchedulerConfig::default();
        assert_eq!(scheduler.lock_retry_attempts, 3);
        assert_eq!(scheduler.lock_retry_delay_ms, 100);
    }

    #[test]
    fn host_port_pair_parses_and_rejects() {
        let ok: HostPortPair = serde_json::from_value(serde_json::json!("db.internal:5432"))
            .expect("valid host:port should parse");
        assert_eq!(ok.host, "db.internal");
        assert_eq!(ok.port, 5432);

        let missing_port: Result<HostPortPair, _> =
            serde_json::from_value(serde_json::json!("db.internal"));
        assert!(missing_port.is_err());

        let bad_port: Result<HostPortPair, _> =
            serde_json::from_value(serde_json::json!("db.internal:not-a-port"));
        assert!(bad_port.is_err());
    }
}
