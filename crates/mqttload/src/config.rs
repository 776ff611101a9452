//! Stress-run and per-session configuration.
//!
//! Both structs deserialize from JSON with humantime durations (`"10s"`,
//! `"250ms"`), the same way the broker config files of this stack do.

use crate::harness::payload::LoadPayload;
use mqttload_protocol::{
    validate_topic_filter, validate_topic_name, Credentials, EnvelopeLimits, HarnessError, QoS,
    Result, SessionProtocolConfig, DEFAULT_DEDUP_CAPACITY, DEFAULT_MAX_PAYLOAD_SIZE,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const PUBLISHER_PLACEHOLDER: &str = "{publisher}";

/// Highest per-publisher rate whose interval is still at least 1ns.
pub const MAX_MESSAGE_RATE: u32 = 1_000_000_000;

fn default_endpoint() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_client_id_prefix() -> String {
    "mqttload".to_string()
}

fn default_topic_pattern() -> String {
    "sensors/data/{publisher}".to_string()
}

/// Settings for one broker session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub client_id: String,
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    pub max_outstanding: usize,
    #[serde(with = "humantime_serde")]
    pub retry_timeout: Duration,
    pub max_attempts: u32,
    /// Inbound QoS 2 dedup TTL; unset means `retry_timeout × max_attempts`.
    #[serde(with = "humantime_serde")]
    pub dedup_window: Option<Duration>,
    pub dedup_capacity: usize,
    pub max_payload_size: usize,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub disconnect_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id_prefix(),
            keep_alive: Duration::from_secs(60),
            max_outstanding: 1000,
            retry_timeout: Duration::from_secs(5),
            max_attempts: 3,
            dedup_window: None,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            connect_timeout: Duration::from_secs(10),
            disconnect_grace: Duration::from_secs(2),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_outstanding(mut self, max_outstanding: usize) -> Self {
        self.max_outstanding = max_outstanding;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry_timeout: Duration, max_attempts: u32) -> Self {
        self.retry_timeout = retry_timeout;
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    #[must_use]
    pub fn with_disconnect_grace(mut self, disconnect_grace: Duration) -> Self {
        self.disconnect_grace = disconnect_grace;
        self
    }

    #[must_use]
    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    #[must_use]
    pub fn dedup_ttl(&self) -> Duration {
        self.dedup_window
            .unwrap_or(self.retry_timeout * self.max_attempts.max(1))
    }

    #[must_use]
    pub fn limits(&self) -> EnvelopeLimits {
        EnvelopeLimits::new(self.max_payload_size)
    }

    #[must_use]
    pub fn protocol_config(&self, credentials: &Credentials) -> SessionProtocolConfig {
        SessionProtocolConfig {
            client_id: self.client_id.clone(),
            credentials: credentials.clone(),
            clean_start: true,
            keep_alive: self.keep_alive,
            max_outstanding: self.max_outstanding,
            retry_timeout: self.retry_timeout,
            max_attempts: self.max_attempts,
            dedup_window: Some(self.dedup_ttl()),
            dedup_capacity: self.dedup_capacity,
            limits: self.limits(),
        }
    }
}

/// Everything a stress run needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub endpoint: String,
    pub credentials: Credentials,
    pub publisher_count: usize,
    pub subscriber_count: usize,
    pub qos: QoS,
    /// Rotate publishers through QoS 0, 1 and 2 instead of using `qos`.
    pub mixed_qos: bool,
    /// Messages per second, per publisher.
    pub message_rate: u32,
    pub message_size: usize,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Publish topic; `{publisher}` expands to the publisher index.
    #[serde(default = "default_topic_pattern")]
    pub topic_pattern: String,
    pub subscribe_filter: Option<String>,
    pub retain: bool,
    pub max_outstanding: usize,
    #[serde(with = "humantime_serde")]
    pub retry_timeout: Duration,
    pub max_attempts: u32,
    pub max_payload_size: usize,
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub disconnect_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub dedup_window: Option<Duration>,
    pub dedup_capacity: usize,
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    pub progress_log: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            endpoint: default_endpoint(),
            credentials: Credentials::anonymous(),
            publisher_count: 20,
            subscriber_count: 100,
            qos: QoS::ExactlyOnce,
            mixed_qos: false,
            message_rate: 10,
            message_size: 100,
            duration: Duration::from_secs(1),
            topic_pattern: default_topic_pattern(),
            subscribe_filter: None,
            retain: false,
            max_outstanding: session.max_outstanding,
            retry_timeout: session.retry_timeout,
            max_attempts: session.max_attempts,
            max_payload_size: session.max_payload_size,
            keep_alive: session.keep_alive,
            connect_timeout: session.connect_timeout,
            disconnect_grace: session.disconnect_grace,
            drain_timeout: Duration::from_secs(5),
            dedup_window: None,
            dedup_capacity: session.dedup_capacity,
            client_id_prefix: default_client_id_prefix(),
            progress_log: true,
        }
    }
}

impl HarnessConfig {
    #[must_use]
    pub fn builder() -> HarnessConfigBuilder {
        HarnessConfigBuilder::default()
    }

    /// Loads and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the file cannot be read, parsed or validated
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    /// # Errors
    ///
    /// Returns `Configuration` if the text cannot be parsed or validated
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| HarnessError::Configuration(format!("invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns `Configuration` describing the first invalid field
    pub fn validate(&self) -> Result<&Self> {
        if self.endpoint.is_empty() {
            return Err(HarnessError::Configuration(
                "endpoint must not be empty".to_string(),
            ));
        }

        if self.publisher_count == 0 {
            return Err(HarnessError::Configuration(
                "publisher_count must be greater than 0".to_string(),
            ));
        }

        if self.message_rate == 0 {
            return Err(HarnessError::Configuration(
                "message_rate must be greater than 0".to_string(),
            ));
        }

        if self.message_rate > MAX_MESSAGE_RATE {
            return Err(HarnessError::Configuration(format!(
                "message_rate must be at most {MAX_MESSAGE_RATE} per second"
            )));
        }

        if self.duration.is_zero() {
            return Err(HarnessError::Configuration(
                "duration must be greater than 0".to_string(),
            ));
        }

        if self.message_size < LoadPayload::HEADER_LEN {
            return Err(HarnessError::Configuration(format!(
                "message_size must be at least {} bytes",
                LoadPayload::HEADER_LEN
            )));
        }

        if self.message_size > self.max_payload_size {
            return Err(HarnessError::Configuration(format!(
                "message_size {} exceeds max_payload_size {}",
                self.message_size, self.max_payload_size
            )));
        }

        if self.max_outstanding == 0 {
            return Err(HarnessError::Configuration(
                "max_outstanding must be greater than 0".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(HarnessError::Configuration(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        if self.retry_timeout.is_zero() {
            return Err(HarnessError::Configuration(
                "retry_timeout must be greater than 0".to_string(),
            ));
        }

        if self.connect_timeout.is_zero() {
            return Err(HarnessError::Configuration(
                "connect_timeout must be greater than 0".to_string(),
            ));
        }

        validate_topic_name(&self.topic_for(0))
            .map_err(|e| HarnessError::Configuration(format!("topic_pattern: {e}")))?;
        validate_topic_filter(&self.effective_subscribe_filter())
            .map_err(|e| HarnessError::Configuration(format!("subscribe_filter: {e}")))?;

        Ok(self)
    }

    /// Publish topic of publisher `index`.
    #[must_use]
    pub fn topic_for(&self, index: usize) -> String {
        self.topic_pattern
            .replace(PUBLISHER_PLACEHOLDER, &index.to_string())
    }

    /// The explicit filter, or the topic pattern with every level holding
    /// the placeholder widened to `+`.
    #[must_use]
    pub fn effective_subscribe_filter(&self) -> String {
        if let Some(filter) = &self.subscribe_filter {
            return filter.clone();
        }
        self.topic_pattern
            .split('/')
            .map(|level| {
                if level.contains(PUBLISHER_PLACEHOLDER) {
                    "+"
                } else {
                    level
                }
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    #[must_use]
    pub fn qos_for(&self, index: usize) -> QoS {
        if self.mixed_qos {
            match index % 3 {
                0 => QoS::AtMostOnce,
                1 => QoS::AtLeastOnce,
                _ => QoS::ExactlyOnce,
            }
        } else {
            self.qos
        }
    }

    /// QoS requested by subscribers, high enough to carry every publisher's.
    #[must_use]
    pub fn subscription_qos(&self) -> QoS {
        if self.mixed_qos {
            QoS::ExactlyOnce
        } else {
            self.qos
        }
    }

    /// Interval between two publishes of one publisher.
    #[must_use]
    pub fn publish_interval(&self) -> Duration {
        (Duration::from_secs(1) / self.message_rate.max(1)).max(Duration::from_nanos(1))
    }

    /// Messages each publisher sends over `duration`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn messages_per_publisher(&self) -> u64 {
        (self.duration.as_secs_f64() * f64::from(self.message_rate)).round() as u64
    }

    #[must_use]
    pub fn session_config(&self, client_id: impl Into<String>) -> SessionConfig {
        SessionConfig {
            client_id: client_id.into(),
            keep_alive: self.keep_alive,
            max_outstanding: self.max_outstanding,
            retry_timeout: self.retry_timeout,
            max_attempts: self.max_attempts,
            dedup_window: self.dedup_window,
            dedup_capacity: self.dedup_capacity,
            max_payload_size: self.max_payload_size,
            connect_timeout: self.connect_timeout,
            disconnect_grace: self.disconnect_grace,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HarnessConfigBuilder {
    config: HarnessConfig,
}

impl HarnessConfigBuilder {
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.config.credentials = credentials;
        self
    }

    #[must_use]
    pub fn publishers(mut self, count: usize) -> Self {
        self.config.publisher_count = count;
        self
    }

    #[must_use]
    pub fn subscribers(mut self, count: usize) -> Self {
        self.config.subscriber_count = count;
        self
    }

    #[must_use]
    pub fn qos(mut self, qos: QoS) -> Self {
        self.config.qos = qos;
        self
    }

    #[must_use]
    pub fn mixed_qos(mut self, mixed: bool) -> Self {
        self.config.mixed_qos = mixed;
        self
    }

    #[must_use]
    pub fn message_rate(mut self, per_second: u32) -> Self {
        self.config.message_rate = per_second;
        self
    }

    #[must_use]
    pub fn message_size(mut self, bytes: usize) -> Self {
        self.config.message_size = bytes;
        self
    }

    #[must_use]
    pub fn duration(mut self, duration: Duration) -> Self {
        self.config.duration = duration;
        self
    }

    #[must_use]
    pub fn topic_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.topic_pattern = pattern.into();
        self
    }

    #[must_use]
    pub fn subscribe_filter(mut self, filter: impl Into<String>) -> Self {
        self.config.subscribe_filter = Some(filter.into());
        self
    }

    #[must_use]
    pub fn retain(mut self, retain: bool) -> Self {
        self.config.retain = retain;
        self
    }

    #[must_use]
    pub fn max_outstanding(mut self, max_outstanding: usize) -> Self {
        self.config.max_outstanding = max_outstanding;
        self
    }

    #[must_use]
    pub fn retry(mut self, retry_timeout: Duration, max_attempts: u32) -> Self {
        self.config.retry_timeout = retry_timeout;
        self.config.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn max_payload_size(mut self, bytes: usize) -> Self {
        self.config.max_payload_size = bytes;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn disconnect_grace(mut self, grace: Duration) -> Self {
        self.config.disconnect_grace = grace;
        self
    }

    #[must_use]
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    #[must_use]
    pub fn dedup_window(mut self, window: Duration) -> Self {
        self.config.dedup_window = Some(window);
        self
    }

    #[must_use]
    pub fn client_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.client_id_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn progress_log(mut self, enabled: bool) -> Self {
        self.config.progress_log = enabled;
        self
    }

    /// # Errors
    ///
    /// Returns `Configuration` if the assembled config is invalid
    pub fn build(self) -> Result<HarnessConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
