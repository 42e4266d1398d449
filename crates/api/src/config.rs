//! Service configuration loaded from environment variables.

use std::time::Duration;

use messaging::RetryPolicy;
use saga::EngineConfig;

use crate::supervisor::SupervisorConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Orchestrator configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` / `PORT`: bind address (default `0.0.0.0:8080`)
/// - `LOG_FORMAT`: `text` or `json` (default `text`)
/// - `DATABASE_URL`: PostgreSQL saga store; in-memory when unset
/// - `BOOTSTRAP_SERVERS`: Kafka brokers; in-memory broker when unset
/// - `CONSUMER_GROUP_ID` (default `saga-orchestrator`)
/// - `SAGA_TICK_INTERVAL_MS` (default 1000), `SAGA_RETENTION_SECS` (default 3600)
/// - `SAGA_STEP_TIMEOUT_MS`, `SAGA_MAX_ATTEMPTS`: per-action overrides
/// - `PRODUCER_MAX_ATTEMPTS`, `PRODUCER_INITIAL_DELAY_MS`,
///   `PRODUCER_MULTIPLIER`, `PRODUCER_MAX_DELAY_MS`
///
/// Values that fail to parse fall back to the default.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub bootstrap_servers: Option<String>,
    pub consumer_group_id: String,
    pub tick_interval: Duration,
    pub retention: Duration,
    pub step_timeout: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub producer_retry: RetryPolicy,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let producer_retry = RetryPolicy::exponential(
            lookup("PRODUCER_MAX_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            Duration::from_millis(parsed("PRODUCER_INITIAL_DELAY_MS").unwrap_or(100)),
            lookup("PRODUCER_MULTIPLIER")
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|m| *m >= 1.0)
                .unwrap_or(2.0),
            Duration::from_millis(parsed("PRODUCER_MAX_DELAY_MS").unwrap_or(5000)),
        );

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_format: match lookup("LOG_FORMAT").as_deref() {
                Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            database_url: non_empty("DATABASE_URL"),
            bootstrap_servers: non_empty("BOOTSTRAP_SERVERS"),
            consumer_group_id: non_empty("CONSUMER_GROUP_ID")
                .unwrap_or(defaults.consumer_group_id),
            tick_interval: parsed("SAGA_TICK_INTERVAL_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick_interval),
            retention: parsed("SAGA_RETENTION_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.retention),
            step_timeout: parsed("SAGA_STEP_TIMEOUT_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            max_attempts: lookup("SAGA_MAX_ATTEMPTS")
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|n| *n > 0),
            producer_retry,
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            step_timeout: self.step_timeout,
            max_attempts: self.max_attempts,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            consumer_group_id: self.consumer_group_id.clone(),
            consumer_retry: RetryPolicy::default(),
            tick_interval: self.tick_interval,
            retention: self.retention,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_format: LogFormat::Text,
            database_url: None,
            bootstrap_servers: None,
            consumer_group_id: "saga-orchestrator".to_string(),
            tick_interval: Duration::from_secs(1),
            retention: Duration::from_secs(3600),
            step_timeout: None,
            max_attempts: None,
            producer_retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = config(&[]);
        assert_eq!(config, Config::default());
        assert_eq!(config.addr(), "0.0.0.0:8080");
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.consumer_group_id, "saga-orchestrator");
        assert_eq!(config.engine_config(), EngineConfig::default());
    }

    #[test]
    fn test_reads_overrides() {
        let config = config(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "9000"),
            ("LOG_FORMAT", "JSON"),
            ("DATABASE_URL", "postgres://localhost/sagas"),
            ("CONSUMER_GROUP_ID", "orchestrator-b"),
            ("SAGA_TICK_INTERVAL_MS", "250"),
            ("SAGA_STEP_TIMEOUT_MS", "2000"),
            ("SAGA_MAX_ATTEMPTS", "7"),
            ("SAGA_RETENTION_SECS", "60"),
            ("PRODUCER_MAX_ATTEMPTS", "3"),
        ]);

        assert_eq!(config.addr(), "127.0.0.1:9000");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/sagas"));
        assert_eq!(config.bootstrap_servers, None);
        assert_eq!(config.consumer_group_id, "orchestrator-b");
        assert_eq!(config.tick_interval, Duration::from_millis(250));
        assert_eq!(config.retention, Duration::from_secs(60));
        assert_eq!(
            config.engine_config(),
            EngineConfig {
                step_timeout: Some(Duration::from_secs(2)),
                max_attempts: Some(7),
            }
        );
        assert_eq!(config.producer_retry.max_attempts, 3);
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let config = config(&[
            ("PORT", "http"),
            ("SAGA_TICK_INTERVAL_MS", "0"),
            ("SAGA_MAX_ATTEMPTS", "-1"),
            ("PRODUCER_MULTIPLIER", "fast"),
            ("DATABASE_URL", " "),
        ]);
        assert_eq!(config, Config::default());
    }
}
