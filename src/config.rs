//! Client configuration for the MQTT session engine
//!
//! Configuration is a plain struct with serde support so it can be loaded
//! from a TOML file or built in code. Credentials are sourced indirectly
//! through environment variable names so secrets never live in config files.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Client configuration recognized by [`crate::MqttClient::connect`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Broker URL: `mqtt://host[:port]` or `mqtts://host[:port]`
    pub broker_url: String,

    /// Client identifier. Generated (UUID v4 suffix) when absent.
    pub client_id: Option<String>,

    /// Start with a fresh session, discarding any server-side state
    #[serde(default = "default_clean_start")]
    pub clean_start: bool,

    /// Keep-alive interval in seconds; 0 disables keep-alive
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u16,

    /// Bound on concurrently unacknowledged inbound QoS>0 messages
    #[serde(default = "default_receive_maximum")]
    pub receive_maximum: u16,

    /// Timeout for the CONNECT/CONNACK exchange in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Bound on locally queued outbound messages before Overflow
    #[serde(default = "default_max_pending_outbound")]
    pub max_pending_outbound: usize,

    /// Timeout for QoS>0 publish acknowledgment handshakes, if any
    pub ack_timeout_secs: Option<u64>,

    /// Environment variable containing the username
    pub username_env: Option<String>,

    /// Environment variable containing the password
    pub password_env: Option<String>,

    /// Last-will message published by the broker on ungraceful disconnect
    pub last_will: Option<LastWillConfig>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Last-will section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastWillConfig {
    pub topic: String,
    pub payload: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

/// Reconnection policy: exponential backoff with jitter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectConfig {
    /// Whether to reconnect at all after a transport failure
    #[serde(default = "default_reconnect_enabled")]
    pub enabled: bool,

    /// First backoff delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: None, // retry forever unless terminally rejected
        }
    }
}

impl ReconnectConfig {
    /// Exponential backoff for the given attempt (1-based), capped at the
    /// configured ceiling. Jitter is applied by the caller.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        if !self.enabled {
            return false;
        }
        match self.max_attempts {
            Some(max) => attempts < max,
            None => true,
        }
    }
}

fn default_clean_start() -> bool {
    true
}

fn default_keep_alive_secs() -> u16 {
    60
}

fn default_receive_maximum() -> u16 {
    16
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_max_pending_outbound() -> usize {
    64
}

fn default_reconnect_enabled() -> bool {
    true
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

/// Broker endpoint resolved from a config URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl ClientConfig {
    /// Minimal configuration for the given broker URL, defaults elsewhere.
    pub fn new<S: Into<String>>(broker_url: S) -> Self {
        Self {
            broker_url: broker_url.into(),
            client_id: None,
            clean_start: default_clean_start(),
            keep_alive_secs: default_keep_alive_secs(),
            receive_maximum: default_receive_maximum(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_pending_outbound: default_max_pending_outbound(),
            ack_timeout_secs: None,
            username_env: None,
            password_env: None,
            last_will: None,
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Load configuration from a TOML file and validate it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field values and the broker URL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker_endpoint()?;

        if self.receive_maximum == 0 {
            return Err(ConfigError::InvalidValue {
                field: "receive_maximum",
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_pending_outbound == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_pending_outbound",
                message: "must be at least 1".to_string(),
            });
        }
        if let Some(will) = &self.last_will {
            if will.qos > 2 {
                return Err(ConfigError::InvalidValue {
                    field: "last_will.qos",
                    message: format!("{} is not a valid QoS level", will.qos),
                });
            }
        }
        Ok(())
    }

    /// Parse the broker URL into host, port and TLS flag.
    pub fn broker_endpoint(&self) -> Result<BrokerEndpoint, ConfigError> {
        let url = Url::parse(&self.broker_url)
            .map_err(|_| ConfigError::InvalidBrokerUrl(self.broker_url.clone()))?;

        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            _ => return Err(ConfigError::InvalidBrokerUrl(self.broker_url.clone())),
        };

        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidBrokerUrl(self.broker_url.clone()))?
            .to_string();
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(BrokerEndpoint { host, port, tls })
    }

    /// Resolve the client identifier, generating one when not configured.
    pub fn resolve_client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("mqtt-reactor-{}", uuid::Uuid::new_v4().simple()))
    }

    /// Resolve credentials from the configured environment variables.
    pub fn resolve_credentials(&self) -> Option<(String, String)> {
        let username_env = self.username_env.as_ref()?;
        let username = std::env::var(username_env).ok()?;
        let password = self
            .password_env
            .as_ref()
            .and_then(|env_name| std::env::var(env_name).ok())
            .unwrap_or_default();
        Some((username, password))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        self.ack_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("mqtt://localhost");
        assert!(config.clean_start);
        assert_eq!(config.keep_alive_secs, 60);
        assert_eq!(config.receive_maximum, 16);
        assert_eq!(config.connect_timeout_secs, 30);
        assert_eq!(config.max_pending_outbound, 64);
        assert!(config.reconnect.enabled);
        assert_eq!(config.reconnect.max_attempts, None);
    }

    #[test]
    fn test_broker_endpoint_default_ports() {
        let plain = ClientConfig::new("mqtt://broker.example.com");
        assert_eq!(
            plain.broker_endpoint().unwrap(),
            BrokerEndpoint {
                host: "broker.example.com".to_string(),
                port: 1883,
                tls: false,
            }
        );

        let tls = ClientConfig::new("mqtts://broker.example.com");
        assert_eq!(
            tls.broker_endpoint().unwrap(),
            BrokerEndpoint {
                host: "broker.example.com".to_string(),
                port: 8883,
                tls: true,
            }
        );
    }

    #[test]
    fn test_broker_endpoint_explicit_port() {
        let config = ClientConfig::new("mqtt://localhost:11883");
        assert_eq!(config.broker_endpoint().unwrap().port, 11883);
    }

    #[test]
    fn test_invalid_broker_url() {
        let config = ClientConfig::new("not a url");
        assert!(matches!(
            config.broker_endpoint(),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));

        let http = ClientConfig::new("http://localhost");
        assert!(matches!(
            http.broker_endpoint(),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_receive_maximum() {
        let mut config = ClientConfig::new("mqtt://localhost");
        config.receive_maximum = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "receive_maximum",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_will_qos() {
        let mut config = ClientConfig::new("mqtt://localhost");
        config.last_will = Some(LastWillConfig {
            topic: "status/offline".to_string(),
            payload: "gone".to_string(),
            qos: 3,
            retain: true,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let reconnect = ReconnectConfig {
            enabled: true,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: None,
        };
        assert_eq!(reconnect.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(reconnect.backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(reconnect.backoff_delay(3), Duration::from_millis(2000));
        // Capped at the ceiling no matter how many attempts
        assert_eq!(reconnect.backoff_delay(12), Duration::from_millis(30_000));
        assert_eq!(reconnect.backoff_delay(64), Duration::from_millis(30_000));
    }

    #[test]
    fn test_allows_attempt() {
        let unlimited = ReconnectConfig::default();
        assert!(unlimited.allows_attempt(0));
        assert!(unlimited.allows_attempt(10_000));

        let bounded = ReconnectConfig {
            max_attempts: Some(3),
            ..ReconnectConfig::default()
        };
        assert!(bounded.allows_attempt(2));
        assert!(!bounded.allows_attempt(3));

        let disabled = ReconnectConfig {
            enabled: false,
            ..ReconnectConfig::default()
        };
        assert!(!disabled.allows_attempt(0));
    }

    #[test]
    fn test_resolve_client_id_generates_unique_ids() {
        let config = ClientConfig::new("mqtt://localhost");
        let a = config.resolve_client_id();
        let b = config.resolve_client_id();
        assert!(a.starts_with("mqtt-reactor-"));
        assert_ne!(a, b);

        let named = ClientConfig {
            client_id: Some("sensor-7".to_string()),
            ..config
        };
        assert_eq!(named.resolve_client_id(), "sensor-7");
    }

    #[test]
    fn test_from_file_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
broker_url = "mqtt://localhost:1883"
client_id = "test-client"
clean_start = false
keep_alive_secs = 30
receive_maximum = 8

[reconnect]
enabled = true
base_delay_ms = 100
max_delay_ms = 5000
max_attempts = 5
"#
        )
        .unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.client_id.as_deref(), Some("test-client"));
        assert!(!config.clean_start);
        assert_eq!(config.keep_alive_secs, 30);
        assert_eq!(config.receive_maximum, 8);
        assert_eq!(config.reconnect.max_attempts, Some(5));
        assert_eq!(config.reconnect.base_delay_ms, 100);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
broker_url = "mqtt://localhost"
receive_maximum = 0
"#
        )
        .unwrap();
        assert!(ClientConfig::from_file(file.path()).is_err());
    }
}
