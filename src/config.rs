use crate::auth::TokenPlacement;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use url::Url;

/// Configuration for a single client connection.
///
/// Immutable once the client is constructed; the manager clones what it needs
/// for every connection attempt.
#[derive(Clone)]
pub struct ClientConfig {
    /// `ws://` or `wss://` endpoint
    pub transport_url: Url,
    /// Bearer credential, if any
    pub auth_token: Option<String>,
    /// Where the credential travels on the upgrade request
    pub token_placement: TokenPlacement,
    /// Timeout for a single dial + handshake attempt
    pub connect_timeout: Duration,
    /// Default timeout for writes and receives
    pub io_timeout: Duration,
    /// Connection attempts per connect cycle before giving up
    pub max_retries: u32,
    /// Delay policy between attempts
    pub backoff: BackoffPolicy,
    /// Verify server certificates and hostnames on `wss://`
    pub verify_tls: bool,
    /// Capacity of the delivery tracker's pending queue
    pub queue_capacity: usize,
    /// Ping/pong liveness settings
    pub keepalive: KeepAliveConfig,
    /// Inbound frames buffered between the monitor and receivers.
    /// The oldest unread frame is evicted once the buffer is full.
    pub inbound_buffer: usize,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("transport_url", &crate::auth::redact_url(&self.transport_url))
            .field("auth_token", &self.auth_token.as_ref().map(|_| "***"))
            .field("token_placement", &self.token_placement)
            .field("connect_timeout", &self.connect_timeout)
            .field("io_timeout", &self.io_timeout)
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("verify_tls", &self.verify_tls)
            .field("queue_capacity", &self.queue_capacity)
            .field("keepalive", &self.keepalive)
            .field("inbound_buffer", &self.inbound_buffer)
            .finish()
    }
}

impl ClientConfig {
    /// Create a new builder for the given endpoint.
    pub fn builder(transport_url: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder {
            transport_url: transport_url.into(),
            auth_token: None,
            token_placement: TokenPlacement::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffPolicy::default(),
            verify_tls: true,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            keepalive: KeepAliveConfig::default(),
            inbound_buffer: DEFAULT_INBOUND_BUFFER,
        }
    }
}

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_QUEUE_CAPACITY: usize = 1000;
const DEFAULT_INBOUND_BUFFER: usize = 1024;

/// Builder for ClientConfig
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    transport_url: String,
    auth_token: Option<String>,
    token_placement: TokenPlacement,
    connect_timeout: Duration,
    io_timeout: Duration,
    max_retries: u32,
    backoff: BackoffPolicy,
    verify_tls: bool,
    queue_capacity: usize,
    keepalive: KeepAliveConfig,
    inbound_buffer: usize,
}

impl ClientConfigBuilder {
    /// Set the bearer token
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Choose header, query parameter, or both for the token
    pub fn token_placement(mut self, placement: TokenPlacement) -> Self {
        self.token_placement = placement;
        self
    }

    /// Set the per-attempt connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the default write/receive timeout
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Set the number of attempts per connect cycle
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the backoff policy
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enable or disable certificate verification
    pub fn verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    /// Set the delivery queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set keep-alive settings
    pub fn keepalive(mut self, keepalive: KeepAliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Set the inbound frame buffer size
    pub fn inbound_buffer(mut self, frames: usize) -> Self {
        self.inbound_buffer = frames;
        self
    }

    /// Apply externally supplied options. Unset options keep their current value.
    pub fn options(mut self, options: &ClientOptions) -> Result<Self, ConfigError> {
        if let Some(secs) = options.connect_timeout {
            self.connect_timeout = seconds("connectTimeout", secs)?;
        }
        if let Some(secs) = options.io_timeout {
            self.io_timeout = seconds("ioTimeout", secs)?;
        }
        if let Some(retries) = options.max_retries {
            self.max_retries = retries;
        }
        if let Some(secs) = options.base_backoff_seconds {
            self.backoff.base = seconds("baseBackoffSeconds", secs)?;
        }
        if let Some(secs) = options.max_backoff_seconds {
            self.backoff.max = seconds("maxBackoffSeconds", secs)?;
        }
        if let Some(verify) = options.verify_tls {
            self.verify_tls = verify;
        }
        if let Some(capacity) = options.queue_capacity {
            self.queue_capacity = capacity;
        }
        Ok(self)
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let transport_url = Url::parse(&self.transport_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", self.transport_url, e)))?;

        if !matches!(transport_url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidUrl(format!(
                "unsupported scheme '{}', expected ws or wss",
                transport_url.scheme()
            )));
        }
        if transport_url.host_str().is_none() {
            return Err(ConfigError::InvalidUrl("URL has no host".to_string()));
        }

        if self.connect_timeout.is_zero() || self.io_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "timeouts must be > 0".to_string(),
            ));
        }

        if self.max_retries == 0 {
            return Err(ConfigError::InvalidRetries(
                "max_retries must be >= 1".to_string(),
            ));
        }

        // Validate backoff config
        if self.backoff.max < self.backoff.base {
            return Err(ConfigError::InvalidBackoff(
                "max backoff must be >= base backoff".to_string(),
            ));
        }
        if self.backoff.multiplier <= 0.0 || !self.backoff.multiplier.is_finite() {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be a finite value > 0".to_string(),
            ));
        }

        if self.queue_capacity == 0 || self.inbound_buffer == 0 {
            return Err(ConfigError::InvalidCapacity(
                "queue_capacity and inbound_buffer must be > 0".to_string(),
            ));
        }

        if self.keepalive.enabled && self.keepalive.pong_timeout > self.keepalive.ping_interval {
            return Err(ConfigError::InvalidKeepAlive(
                "pong_timeout should be <= ping_interval".to_string(),
            ));
        }

        Ok(ClientConfig {
            transport_url,
            auth_token: self.auth_token,
            token_placement: self.token_placement,
            connect_timeout: self.connect_timeout,
            io_timeout: self.io_timeout,
            max_retries: self.max_retries,
            backoff: self.backoff,
            verify_tls: self.verify_tls,
            queue_capacity: self.queue_capacity,
            keepalive: self.keepalive,
            inbound_buffer: self.inbound_buffer,
        })
    }
}

fn seconds(option: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| ConfigError::InvalidOption(option, format!("{secs} is not a valid number of seconds")))
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Endpoint is not a usable ws/wss URL
    #[error("Invalid transport URL: {0}")]
    InvalidUrl(String),
    /// Zero or negative timeout
    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),
    /// Retry budget unusable
    #[error("Invalid retry configuration: {0}")]
    InvalidRetries(String),
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Zero-sized queue or buffer
    #[error("Invalid capacity: {0}")]
    InvalidCapacity(String),
    /// Invalid keep-alive configuration
    #[error("Invalid keep-alive configuration: {0}")]
    InvalidKeepAlive(String),
    /// Recognized option with an unusable value
    #[error("Invalid value for option '{0}': {1}")]
    InvalidOption(&'static str, String),
    /// Options document failed to parse
    #[error("Invalid options document: {0}")]
    Parse(String),
}

/// Externally supplied configuration surface.
///
/// Durations are in seconds. Unset values fall back to the builder defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientOptions {
    pub connect_timeout: Option<f64>,
    pub io_timeout: Option<f64>,
    pub max_retries: Option<u32>,
    pub base_backoff_seconds: Option<f64>,
    pub max_backoff_seconds: Option<f64>,
    #[serde(rename = "verifyTLS")]
    pub verify_tls: Option<bool>,
    pub queue_capacity: Option<usize>,
}

impl ClientOptions {
    /// Parse options from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Backoff policy for connection retries
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound for any delay
    pub max: Duration,
    /// Growth factor per attempt (2.0 doubles)
    pub multiplier: f64,
    /// Randomize each delay within `[capped / 2, capped]`
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    /// Deterministic policy with the given bounds.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Self::default()
        }
    }

    /// Enable or disable bounded jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    ///
    /// `min(base * multiplier^attempt, max)`, never above `max`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        // 2^64 already saturates any realistic max
        let exponent = attempt.min(64) as i32;
        let base_delay = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max.as_secs_f64());

        if self.jitter {
            // Equal jitter: keeps at least half the delay and never exceeds the cap
            let half = capped_delay / 2.0;
            Duration::from_secs_f64(half + rand::random::<f64>() * half)
        } else {
            Duration::from_secs_f64(capped_delay)
        }
    }
}

/// Ping/pong liveness configuration
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Send pings at all
    pub enabled: bool,
    /// Interval for sending WebSocket pings
    pub ping_interval: Duration,
    /// Timeout for receiving a pong response
    pub pong_timeout: Duration,
    /// Consecutive missed pongs before the connection counts as lost
    pub failure_threshold: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(10),
            failure_threshold: 3,
        }
    }
}

impl KeepAliveConfig {
    /// No pings; only transport errors end a session.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay_calculation() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(30));

        assert_eq!(policy.next_delay(0), Duration::from_millis(100));
        assert_eq!(policy.next_delay(1), Duration::from_millis(200));
        assert_eq!(policy.next_delay(2), Duration::from_millis(400));
        assert_eq!(policy.next_delay(3), Duration::from_millis(800));

        // Should cap at max
        assert_eq!(policy.next_delay(10), Duration::from_secs(30));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_with_jitter() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(30))
            .with_jitter(true);

        for attempt in 0..8 {
            let delay = policy.next_delay(attempt);
            let cap = Duration::from_millis(100 * 2u64.pow(attempt));
            assert!(delay <= cap, "attempt {attempt}: {delay:?} > {cap:?}");
            assert!(delay >= cap / 2, "attempt {attempt}: {delay:?} < half of {cap:?}");
        }
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ClientConfig::builder("ws://localhost:8080/ws")
            .auth_token("secret")
            .build()
            .expect("valid config");

        assert_eq!(config.io_timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff.base, Duration::from_secs(1));
        assert_eq!(config.backoff.max, Duration::from_secs(30));
        assert!(config.verify_tls);
        assert_eq!(config.token_placement, TokenPlacement::Both);
    }

    #[test]
    fn test_config_debug_redacts_token() {
        let config = ClientConfig::builder("wss://chat.example.com/ws?token=leaked")
            .auth_token("super-secret")
            .build()
            .expect("valid config");

        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("leaked"));
    }

    #[test]
    fn test_config_builder_rejects_bad_url() {
        assert!(matches!(
            ClientConfig::builder("http://localhost").build(),
            Err(ConfigError::InvalidUrl(_))
        ));
        assert!(matches!(
            ClientConfig::builder("not a url").build(),
            Err(ConfigError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_config_builder_rejects_inverted_backoff() {
        let result = ClientConfig::builder("ws://localhost")
            .backoff(BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(1)))
            .build();

        assert!(matches!(result, Err(ConfigError::InvalidBackoff(_))));
    }

    #[test]
    fn test_config_builder_rejects_zero_values() {
        assert!(ClientConfig::builder("ws://localhost").max_retries(0).build().is_err());
        assert!(ClientConfig::builder("ws://localhost").queue_capacity(0).build().is_err());
        assert!(ClientConfig::builder("ws://localhost")
            .io_timeout(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_options_from_json() {
        let options = ClientOptions::from_json(
            r#"{"connectTimeout": 2.5, "ioTimeout": 5, "maxRetries": 7,
                "baseBackoffSeconds": 0.25, "maxBackoffSeconds": 4.0,
                "verifyTLS": false, "queueCapacity": 16}"#,
        )
        .expect("valid options");

        let config = ClientConfig::builder("wss://localhost:9443/ws")
            .options(&options)
            .expect("valid values")
            .build()
            .expect("valid config");

        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.io_timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.backoff.base, Duration::from_millis(250));
        assert_eq!(config.backoff.max, Duration::from_secs(4));
        assert!(!config.verify_tls);
        assert_eq!(config.queue_capacity, 16);
    }

    #[test]
    fn test_options_unset_values_keep_defaults() {
        let options = ClientOptions::from_json(r#"{"maxRetries": 5}"#).expect("valid options");
        let config = ClientConfig::builder("ws://localhost")
            .options(&options)
            .expect("valid values")
            .build()
            .expect("valid config");

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.io_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_options_reject_unknown_and_negative() {
        assert!(matches!(
            ClientOptions::from_json(r#"{"retries": 5}"#),
            Err(ConfigError::Parse(_))
        ));

        let options = ClientOptions {
            io_timeout: Some(-1.0),
            ..ClientOptions::default()
        };
        assert!(matches!(
            ClientConfig::builder("ws://localhost").options(&options),
            Err(ConfigError::InvalidOption("ioTimeout", _))
        ));
    }
}
