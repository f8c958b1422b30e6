// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants;
use crate::delivery_queue::QueueConfig;
use crate::errors::ConfigError;
use crate::point::{parse_tags, Tags};
use crate::transport::{ProxyMode, TransportOptions};
use reqwest::Url;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Agent configuration read from `TELEMETRY_*` environment variables
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Endpoint authority, optionally with a scheme (`http://` is assumed otherwise)
    pub host: String,
    /// Endpoint path points are POSTed to
    pub path: String,
    pub batch_size: usize,
    /// Whole-request budget; `None` never expires
    pub request_timeout: Option<Duration>,
    pub max_tries: u32,
    pub dial_timeout: Option<Duration>,
    pub response_header_timeout: Option<Duration>,
    pub sweep_interval: Duration,
    pub tls_verify: bool,
    pub keep_alive: bool,
    pub compression: bool,
    pub max_idle_per_host: usize,
    pub stale_after: Duration,
    pub failure_backoff: Duration,
    pub max_queue_len: Option<usize>,
    /// Tags added to every point that does not set them itself
    pub tags: Tags,
    /// UDP port for `put` lines; 0 disables the listener
    pub listen_port: u16,
    /// How often the agent reports its own counters; `None` disables them
    pub self_metrics_interval: Option<Duration>,
    pub https_proxy: Option<String>,
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: constants::DEFAULT_HOST.to_string(),
            path: constants::DEFAULT_PATH.to_string(),
            batch_size: constants::BATCH_SIZE,
            request_timeout: Some(constants::REQUEST_TIMEOUT),
            max_tries: constants::MAX_TRIES,
            dial_timeout: Some(constants::DIAL_TIMEOUT),
            response_header_timeout: Some(constants::RESPONSE_HEADER_TIMEOUT),
            sweep_interval: constants::SWEEP_INTERVAL,
            tls_verify: true,
            keep_alive: true,
            compression: true,
            max_idle_per_host: constants::MAX_IDLE_PER_HOST,
            stale_after: constants::STALE_AFTER,
            failure_backoff: constants::FAILURE_BACKOFF,
            max_queue_len: None,
            tags: Tags::new(),
            listen_port: 4242,
            self_metrics_interval: Some(Duration::from_secs(60)),
            https_proxy: None,
            log_level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            host: env::var("TELEMETRY_HOST").unwrap_or(defaults.host),
            path: env::var("TELEMETRY_PATH").unwrap_or(defaults.path),
            batch_size: env_parse("TELEMETRY_BATCH_SIZE").unwrap_or(defaults.batch_size),
            request_timeout: env_millis("TELEMETRY_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout),
            max_tries: env_parse("TELEMETRY_MAX_TRIES").unwrap_or(defaults.max_tries),
            dial_timeout: env_millis("TELEMETRY_DIAL_TIMEOUT_MS").unwrap_or(defaults.dial_timeout),
            response_header_timeout: env_millis("TELEMETRY_RESPONSE_HEADER_TIMEOUT_MS")
                .unwrap_or(defaults.response_header_timeout),
            sweep_interval: defaults.sweep_interval,
            tls_verify: env_flag("TELEMETRY_TLS_VERIFY"),
            keep_alive: env_flag("TELEMETRY_KEEP_ALIVE"),
            compression: env_flag("TELEMETRY_COMPRESSION"),
            max_idle_per_host: env_parse("TELEMETRY_MAX_IDLE_PER_HOST")
                .unwrap_or(defaults.max_idle_per_host),
            stale_after: env_parse("TELEMETRY_STALE_AFTER_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_after),
            failure_backoff: env_parse("TELEMETRY_FAILURE_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.failure_backoff),
            max_queue_len: env_parse("TELEMETRY_MAX_QUEUE_LEN"),
            tags: env::var("TELEMETRY_TAGS")
                .map(|tags| parse_tags(&tags))
                .unwrap_or_default(),
            listen_port: env_parse("TELEMETRY_LISTEN_PORT").unwrap_or(defaults.listen_port),
            self_metrics_interval: env_parse::<u64>("TELEMETRY_SELF_METRICS_SECS")
                .map(|secs| (secs > 0).then(|| Duration::from_secs(secs)))
                .unwrap_or(defaults.self_metrics_interval),
            https_proxy: env::var("TELEMETRY_PROXY_HTTPS")
                .or_else(|_| env::var("HTTPS_PROXY"))
                .ok()
                .filter(|proxy| !proxy.trim().is_empty()),
            log_level: env::var("TELEMETRY_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batch size must be greater than 0".to_string(),
            ));
        }

        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "TELEMETRY_HOST cannot be empty".to_string(),
            ));
        }

        if self.max_tries == 0 {
            return Err(ConfigError::Invalid(
                "max tries must be at least 1".to_string(),
            ));
        }

        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "sweep interval must be greater than 0".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        self.endpoint().map(|_| ())
    }

    /// The URL batches are POSTed to.
    pub fn endpoint(&self) -> Result<Url, ConfigError> {
        let host = self.host.trim().trim_end_matches('/');
        let base = if host.contains("://") {
            host.to_string()
        } else {
            format!("http://{host}")
        };
        let path = self.path.trim();
        let url = if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        };
        Url::parse(&url)
            .map_err(|e| ConfigError::Invalid(format!("invalid endpoint '{url}': {e}")))
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            proxy: self
                .https_proxy
                .clone()
                .map_or(ProxyMode::Direct, ProxyMode::Url),
            tls_verify: self.tls_verify,
            disable_keep_alives: !self.keep_alive,
            disable_compression: !self.compression,
            max_idle_per_host: self.max_idle_per_host,
            dial_timeout: self.dial_timeout,
            response_header_timeout: self.response_header_timeout,
            request_timeout: self.request_timeout,
            max_tries: self.max_tries,
            sweep_interval: self.sweep_interval,
            observer: None,
        }
    }

    pub fn queue_config(&self) -> Result<QueueConfig, ConfigError> {
        let mut config = QueueConfig::new(self.endpoint()?);
        config.batch_size = self.batch_size;
        config.stale_after = self.stale_after;
        config.failure_backoff = self.failure_backoff;
        config.max_queue_len = self.max_queue_len;
        config.default_tags = self.tags.clone();
        Ok(config)
    }
}

/// Parses an environment variable, ignoring it with a warning when malformed.
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {name}: cannot parse '{raw}'");
            None
        }
    }
}

/// Milliseconds, where 0 means no limit.
fn env_millis(name: &str) -> Option<Option<Duration>> {
    env_parse::<u64>(name).map(|ms| (ms > 0).then(|| Duration::from_millis(ms)))
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|val| val.trim().to_lowercase() != "false")
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 12] = [
        "TELEMETRY_HOST",
        "TELEMETRY_PATH",
        "TELEMETRY_BATCH_SIZE",
        "TELEMETRY_REQUEST_TIMEOUT_MS",
        "TELEMETRY_MAX_TRIES",
        "TELEMETRY_TLS_VERIFY",
        "TELEMETRY_MAX_QUEUE_LEN",
        "TELEMETRY_TAGS",
        "TELEMETRY_SELF_METRICS_SECS",
        "TELEMETRY_PROXY_HTTPS",
        "HTTPS_PROXY",
        "TELEMETRY_LOG_LEVEL",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.endpoint().expect("endpoint").as_str(),
            "http://localhost:4242/api/put"
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases = [
            AgentConfig {
                batch_size: 0,
                ..Default::default()
            },
            AgentConfig {
                host: "  ".to_string(),
                ..Default::default()
            },
            AgentConfig {
                max_tries: 0,
                ..Default::default()
            },
            AgentConfig {
                sweep_interval: Duration::ZERO,
                ..Default::default()
            },
            AgentConfig {
                log_level: "verbose".to_string(),
                ..Default::default()
            },
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "{config:?}"
            );
        }
    }

    #[test]
    fn test_endpoint_keeps_explicit_scheme() {
        let config = AgentConfig {
            host: "https://tsdb.example.com/".to_string(),
            path: "api/put".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.endpoint().expect("endpoint").as_str(),
            "https://tsdb.example.com/api/put"
        );
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        let config = AgentConfig::from_env().expect("config");
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.max_tries, 3);
        assert_eq!(config.request_timeout, Some(Duration::from_secs(60)));
        assert!(config.tls_verify);
        assert!(config.tags.is_empty());
        assert!(config.https_proxy.is_none());
        assert_eq!(config.max_queue_len, None);
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        env::set_var("TELEMETRY_HOST", "tsdb:4242");
        env::set_var("TELEMETRY_BATCH_SIZE", "50");
        env::set_var("TELEMETRY_REQUEST_TIMEOUT_MS", "0");
        env::set_var("TELEMETRY_MAX_TRIES", "not-a-number");
        env::set_var("TELEMETRY_TLS_VERIFY", "FALSE");
        env::set_var("TELEMETRY_MAX_QUEUE_LEN", "10000");
        env::set_var("TELEMETRY_TAGS", "env:prod,host:web01");
        env::set_var("TELEMETRY_SELF_METRICS_SECS", "0");
        env::set_var("HTTPS_PROXY", "http://proxy:3128");
        env::set_var("TELEMETRY_LOG_LEVEL", "DEBUG");

        let config = AgentConfig::from_env().expect("config");
        clear_env();

        assert_eq!(config.batch_size, 50);
        assert_eq!(config.request_timeout, None);
        assert_eq!(config.max_tries, 3);
        assert!(!config.tls_verify);
        assert_eq!(config.max_queue_len, Some(10_000));
        assert_eq!(config.tags.get("env").map(String::as_str), Some("prod"));
        assert_eq!(config.tags.len(), 2);
        assert_eq!(config.self_metrics_interval, None);
        assert_eq!(config.https_proxy.as_deref(), Some("http://proxy:3128"));
        assert_eq!(config.log_level, "debug");

        let queue = config.queue_config().expect("queue config");
        assert_eq!(queue.url.as_str(), "http://tsdb:4242/api/put");
        assert_eq!(queue.batch_size, 50);

        let options = config.transport_options();
        assert!(matches!(options.proxy, ProxyMode::Url(ref url) if url == "http://proxy:3128"));
        assert!(!options.tls_verify);
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_zero_batch() {
        clear_env();
        env::set_var("TELEMETRY_BATCH_SIZE", "0");
        let result = AgentConfig::from_env();
        clear_env();
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
