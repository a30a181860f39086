//! Core configuration from environment variables
//!
//! The host process owns configuration. It either calls
//! [`CoreConfig::from_env`] or builds a [`ResilienceConfig`] from the
//! recognized-options JSON shape:
//!
//! ```json
//! { "ocr": { "failureThreshold": 3, "recoveryTimeout": 60000, "retryMaxAttempts": 3 } }
//! ```
//!
//! Durations in that document are milliseconds. Unknown service keys or
//! option names are rejected.

use crate::resilience::retry::RetryPolicy;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// External dependency guarded by its own breaker and retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKey {
    Completion,
    Ocr,
    Store,
}

impl ServiceKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKey::Completion => "completion",
            ServiceKey::Ocr => "ocr",
            ServiceKey::Store => "store",
        }
    }

    pub fn all() -> [ServiceKey; 3] {
        [ServiceKey::Completion, ServiceKey::Ocr, ServiceKey::Store]
    }

    fn env_prefix(&self) -> String {
        format!("SPENDSTREAM_{}", self.as_str().to_uppercase())
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completion" => Ok(ServiceKey::Completion),
            "ocr" => Ok(ServiceKey::Ocr),
            "store" => Ok(ServiceKey::Store),
            other => Err(ConfigError::InvalidValue(format!("unknown service key: {}", other))),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue(String),
    Parse(serde_json::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
            ConfigError::Parse(e) => write!(f, "Invalid configuration document: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err)
    }
}

/// Breaker thresholds and retry policy for one service key
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ServiceConfig {
    /// Defaults observed for each dependency
    pub fn default_for(key: ServiceKey) -> Self {
        let (failure_threshold, recovery_secs) = match key {
            ServiceKey::Completion => (5, 30),
            ServiceKey::Ocr => (3, 60),
            ServiceKey::Store => (10, 15),
        };
        Self {
            failure_threshold,
            recovery_timeout: Duration::from_secs(recovery_secs),
            retry: RetryPolicy::default(),
        }
    }

    fn validate(&self, key: ServiceKey) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue(format!("{}: failureThreshold must be >= 1", key)));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(format!("{}: retryMaxAttempts must be >= 1", key)));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            return Err(ConfigError::InvalidValue(format!(
                "{}: retryJitterFraction must be within [0, 1]",
                key
            )));
        }
        if self.retry.exponential_factor < 1.0 {
            return Err(ConfigError::InvalidValue(format!("{}: exponential factor must be >= 1", key)));
        }
        Ok(())
    }
}

/// Recognized per-service options. Every field is optional and overlays the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ServiceOptions {
    failure_threshold: Option<u32>,
    recovery_timeout: Option<u64>,
    retry_max_attempts: Option<u32>,
    retry_base_delay: Option<u64>,
    retry_max_delay: Option<u64>,
    retry_jitter_fraction: Option<f64>,
}

impl ServiceOptions {
    fn apply(self, base: &mut ServiceConfig) {
        if let Some(v) = self.failure_threshold {
            base.failure_threshold = v;
        }
        if let Some(v) = self.recovery_timeout {
            base.recovery_timeout = Duration::from_millis(v);
        }
        if let Some(v) = self.retry_max_attempts {
            base.retry.max_attempts = v;
        }
        if let Some(v) = self.retry_base_delay {
            base.retry.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.retry_max_delay {
            base.retry.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.retry_jitter_fraction {
            base.retry.jitter_fraction = v;
        }
    }

    fn from_env(key: ServiceKey) -> Self {
        let prefix = key.env_prefix();
        Self {
            failure_threshold: env_parse(&format!("{}_FAILURE_THRESHOLD", prefix)),
            recovery_timeout: env_parse(&format!("{}_RECOVERY_TIMEOUT_MS", prefix)),
            retry_max_attempts: env_parse(&format!("{}_RETRY_MAX_ATTEMPTS", prefix)),
            retry_base_delay: env_parse(&format!("{}_RETRY_BASE_DELAY_MS", prefix)),
            retry_max_delay: env_parse(&format!("{}_RETRY_MAX_DELAY_MS", prefix)),
            retry_jitter_fraction: env_parse(&format!("{}_RETRY_JITTER", prefix)),
        }
    }
}

/// Per-service resilience settings for every [`ServiceKey`]
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceConfig {
    services: HashMap<ServiceKey, ServiceConfig>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            services: ServiceKey::all()
                .into_iter()
                .map(|k| (k, ServiceConfig::default_for(k)))
                .collect(),
        }
    }
}

impl ResilienceConfig {
    /// Parse the recognized-options document, overlaying defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let raw: HashMap<String, ServiceOptions> = serde_json::from_str(json)?;
        let mut config = Self::default();
        for (name, options) in raw {
            let key: ServiceKey = name.parse()?;
            if let Some(service) = config.services.get_mut(&key) {
                options.apply(service);
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Load overrides from `SPENDSTREAM_<KEY>_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for key in ServiceKey::all() {
            if let Some(service) = config.services.get_mut(&key) {
                ServiceOptions::from_env(key).apply(service);
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn service(&self, key: ServiceKey) -> ServiceConfig {
        self.services
            .get(&key)
            .cloned()
            .unwrap_or_else(|| ServiceConfig::default_for(key))
    }

    pub fn with_service(mut self, key: ServiceKey, config: ServiceConfig) -> Self {
        self.services.insert(key, config);
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (key, service) in &self.services {
            service.validate(*key)?;
        }
        Ok(())
    }
}

/// Broker topic names
#[derive(Debug, Clone, PartialEq)]
pub struct Topics {
    pub chat_requests: String,
    pub chat_responses: String,
    pub budget_requests: String,
    pub budget_responses: String,
    pub ocr_requests: String,
    pub ocr_responses: String,
    pub transactions: String,
    pub notifications: String,
    pub analytics: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            chat_requests: "chat_requests".to_string(),
            chat_responses: "chat_responses".to_string(),
            budget_requests: "budget_requests".to_string(),
            budget_responses: "budget_responses".to_string(),
            ocr_requests: "ocr_requests".to_string(),
            ocr_responses: "ocr_responses".to_string(),
            transactions: "transactions".to_string(),
            notifications: "notifications".to_string(),
            analytics: "analytics".to_string(),
        }
    }
}

impl Topics {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            chat_requests: env::var("TOPIC_CHAT_REQUESTS").unwrap_or(defaults.chat_requests),
            chat_responses: env::var("TOPIC_CHAT_RESPONSES").unwrap_or(defaults.chat_responses),
            budget_requests: env::var("TOPIC_BUDGET_REQUESTS").unwrap_or(defaults.budget_requests),
            budget_responses: env::var("TOPIC_BUDGET_RESPONSES").unwrap_or(defaults.budget_responses),
            ocr_requests: env::var("TOPIC_OCR_REQUESTS").unwrap_or(defaults.ocr_requests),
            ocr_responses: env::var("TOPIC_OCR_RESPONSES").unwrap_or(defaults.ocr_responses),
            transactions: env::var("TOPIC_TRANSACTIONS").unwrap_or(defaults.transactions),
            notifications: env::var("TOPIC_NOTIFICATIONS").unwrap_or(defaults.notifications),
            analytics: env::var("TOPIC_ANALYTICS").unwrap_or(defaults.analytics),
        }
    }
}

/// Top-level configuration for one core instance
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Path to the SQLite ledger
    pub db_path: String,

    /// Upper bound on concurrently running workflows
    pub max_in_flight: usize,

    /// Bridged streaming endpoint; when set it wins over the change feed
    pub bridge_url: Option<String>,

    /// Completion gateway (SSE)
    pub completion_url: Option<String>,

    /// OCR gateway
    pub ocr_url: Option<String>,

    /// Gateway API key sent as `X-Gateway-Authorization: Bearer ...`
    pub api_key: Option<String>,

    pub topics: Topics,

    pub resilience: ResilienceConfig,
}

impl CoreConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `SPENDSTREAM_DB_PATH` (default: spendstream.db)
    /// - `SPENDSTREAM_MAX_IN_FLIGHT` (default: 10)
    /// - `SPENDSTREAM_BRIDGE_URL`, `SPENDSTREAM_COMPLETION_URL`, `SPENDSTREAM_OCR_URL`
    /// - `SPENDSTREAM_API_KEY`
    /// - `TOPIC_*` topic overrides
    /// - `SPENDSTREAM_<COMPLETION|OCR|STORE>_*` resilience overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_in_flight = env_parse("SPENDSTREAM_MAX_IN_FLIGHT").unwrap_or(10);
        if max_in_flight == 0 {
            return Err(ConfigError::InvalidValue(
                "SPENDSTREAM_MAX_IN_FLIGHT must be at least 1".to_string(),
            ));
        }

        let bridge_url = env_non_empty("SPENDSTREAM_BRIDGE_URL");
        if let Some(url) = &bridge_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidValue(
                    "SPENDSTREAM_BRIDGE_URL must start with http:// or https://".to_string(),
                ));
            }
        }

        Ok(Self {
            db_path: env::var("SPENDSTREAM_DB_PATH").unwrap_or_else(|_| "spendstream.db".to_string()),
            max_in_flight,
            bridge_url,
            completion_url: env_non_empty("SPENDSTREAM_COMPLETION_URL"),
            ocr_url: env_non_empty("SPENDSTREAM_OCR_URL"),
            api_key: env_non_empty("SPENDSTREAM_API_KEY"),
            topics: Topics::from_env(),
            resilience: ResilienceConfig::from_env()?,
        })
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_service_thresholds() {
        let config = ResilienceConfig::default();

        let completion = config.service(ServiceKey::Completion);
        assert_eq!(completion.failure_threshold, 5);
        assert_eq!(completion.recovery_timeout, Duration::from_secs(30));

        let ocr = config.service(ServiceKey::Ocr);
        assert_eq!(ocr.failure_threshold, 3);
        assert_eq!(ocr.recovery_timeout, Duration::from_secs(60));

        let store = config.service(ServiceKey::Store);
        assert_eq!(store.failure_threshold, 10);
        assert_eq!(store.recovery_timeout, Duration::from_secs(15));
        assert_eq!(store.retry.max_attempts, 3);
    }

    #[test]
    fn test_recognized_options_overlay_defaults() {
        let config = ResilienceConfig::from_json(
            r#"{"ocr": {"failureThreshold": 2, "recoveryTimeout": 5000, "retryJitterFraction": 0.1}}"#,
        )
        .unwrap();

        let ocr = config.service(ServiceKey::Ocr);
        assert_eq!(ocr.failure_threshold, 2);
        assert_eq!(ocr.recovery_timeout, Duration::from_millis(5000));
        assert_eq!(ocr.retry.jitter_fraction, 0.1);
        assert_eq!(ocr.retry.max_attempts, 3);

        // Untouched services keep their defaults
        assert_eq!(config.service(ServiceKey::Completion).failure_threshold, 5);
    }

    #[test]
    fn test_unknown_option_rejected() {
        assert!(ResilienceConfig::from_json(r#"{"ocr": {"failureLimit": 2}}"#).is_err());
        assert!(ResilienceConfig::from_json(r#"{"payments": {"failureThreshold": 2}}"#).is_err());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(ResilienceConfig::from_json(r#"{"store": {"failureThreshold": 0}}"#).is_err());
        assert!(ResilienceConfig::from_json(r#"{"store": {"retryJitterFraction": 1.5}}"#).is_err());
    }

    #[test]
    fn test_default_topics() {
        let topics = Topics::default();
        assert_eq!(topics.chat_requests, "chat_requests");
        assert_eq!(topics.ocr_responses, "ocr_responses");
        assert_eq!(topics.analytics, "analytics");
    }
}
