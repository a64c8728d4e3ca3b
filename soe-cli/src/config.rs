//! Configuration file support for SOE CLI tools

use serde::{Deserialize, Serialize};
use soe::{ServiceConfig, SessionConfig};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Session tunables exposed in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    #[serde(default = "default_max_packet_size")]
    pub max_unreliable_size: usize,
    /// Upper bound on unacknowledged packets
    #[serde(default = "default_resend_window")]
    pub resend_window_size: u32,
    #[serde(default = "default_initial_window")]
    pub initial_window: u32,
    /// CRC footer length in bytes (0 to 4)
    #[serde(default = "default_crc_length")]
    pub crc_length: u8,
    #[serde(default)]
    pub use_compression: bool,
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_connect_retry")]
    pub connect_retry_ms: u64,
    #[serde(default = "default_connect_max_retries")]
    pub connect_max_retries: u32,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

fn default_max_packet_size() -> usize {
    496
}

fn default_resend_window() -> u32 {
    256
}

fn default_initial_window() -> u32 {
    32
}

fn default_crc_length() -> u8 {
    2
}

fn default_inactivity_timeout() -> u64 {
    60
}

fn default_connect_retry() -> u64 {
    500
}

fn default_connect_max_retries() -> u32 {
    10
}

fn default_ping_interval() -> u64 {
    5
}

impl Default for SessionSection {
    fn default() -> Self {
        SessionSection {
            max_packet_size: default_max_packet_size(),
            max_unreliable_size: default_max_packet_size(),
            resend_window_size: default_resend_window(),
            initial_window: default_initial_window(),
            crc_length: default_crc_length(),
            use_compression: false,
            inactivity_timeout_secs: default_inactivity_timeout(),
            connect_retry_ms: default_connect_retry(),
            connect_max_retries: default_connect_max_retries(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

impl SessionSection {
    /// Build the library session configuration
    pub fn to_session_config(&self) -> SessionConfig {
        let defaults = SessionConfig::default();
        SessionConfig {
            max_packet_size: self.max_packet_size,
            max_unreliable_size: self.max_unreliable_size,
            resend_window_size: self.resend_window_size,
            window: soe::protocol::WindowConfig {
                initial_size: self.initial_window,
                ..defaults.window
            },
            crc_length: self.crc_length,
            use_compression: self.use_compression,
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout_secs),
            connect_retry_interval: Duration::from_millis(self.connect_retry_ms),
            connect_max_retries: self.connect_max_retries,
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            ..defaults
        }
    }
}

/// Echo server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen: SocketAddr,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Accepted sessions allowed to wait for the echo loop
    #[serde(default = "default_accept_backlog")]
    pub accept_backlog: usize,
    /// Statistics interval in seconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_max_sessions() -> usize {
    1024
}

fn default_accept_backlog() -> usize {
    128
}

fn default_stats_interval() -> u64 {
    1
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address
    pub server: SocketAddr,
    /// Local bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Messages to send
    #[serde(default = "default_message_count")]
    pub message_count: usize,
    /// Size of each message in bytes
    #[serde(default = "default_message_size")]
    pub message_size: usize,
    /// Send over the unreliable lane instead of channel A
    #[serde(default)]
    pub unreliable: bool,
    /// Statistics interval in seconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

fn default_message_count() -> usize {
    100
}

fn default_message_size() -> usize {
    64
}

/// Combined configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionSection,
    pub server: Option<ServerConfig>,
    pub client: Option<ClientConfig>,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Check the session section against the library's rules
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session
            .to_session_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if let Some(client) = &self.client {
            if client.message_size == 0 {
                return Err(ConfigError::Invalid("message_size must be non-zero".into()));
            }
        }
        Ok(())
    }

    /// Service configuration for the server role
    pub fn server_service_config(&self) -> ServiceConfig {
        let mut config = ServiceConfig {
            session: self.session.to_session_config(),
            ..ServiceConfig::default()
        };
        if let Some(server) = &self.server {
            config.max_sessions = server.max_sessions;
            config.accept_backlog = server.accept_backlog;
        }
        config
    }

    /// Service configuration for the client role
    pub fn client_service_config(&self) -> ServiceConfig {
        ServiceConfig {
            session: self.session.to_session_config(),
            ..ServiceConfig::client()
        }
    }

    /// Create example server configuration
    pub fn example_server() -> Self {
        Config {
            session: SessionSection::default(),
            server: Some(ServerConfig {
                listen: SocketAddr::from(([0, 0, 0, 0], 44453)),
                max_sessions: 1024,
                accept_backlog: 128,
                stats_interval_secs: 5,
            }),
            client: None,
        }
    }

    /// Create example client configuration
    pub fn example_client() -> Self {
        Config {
            session: SessionSection {
                use_compression: true,
                ..SessionSection::default()
            },
            server: None,
            client: Some(ClientConfig {
                server: SocketAddr::from(([127, 0, 0, 1], 44453)),
                bind: default_bind(),
                message_count: 1000,
                message_size: 1200,
                unreliable: false,
                stats_interval_secs: 1,
            }),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ServerConfig {
    /// Get statistics interval as Duration
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

impl ClientConfig {
    /// Get statistics interval as Duration
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_configs() {
        let server = Config::example_server();
        assert!(server.server.is_some());
        assert!(server.validate().is_ok());

        let client = Config::example_client();
        assert!(client.client.is_some());
        assert!(client.validate().is_ok());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = Config::example_client();
        let toml = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();

        assert_eq!(parsed.session, config.session);
        assert_eq!(parsed.client.unwrap().message_size, 1200);
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let parsed: Config = toml::from_str(
            r#"
            [session]
            crc_length = 4

            [server]
            listen = "127.0.0.1:5000"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.session.crc_length, 4);
        assert_eq!(parsed.session.max_packet_size, 496);
        let server = parsed.server.unwrap();
        assert_eq!(server.max_sessions, 1024);
        assert_eq!(server.accept_backlog, 128);
    }

    #[test]
    fn test_session_mapping() {
        let section = SessionSection {
            initial_window: 8,
            inactivity_timeout_secs: 30,
            ..SessionSection::default()
        };
        let config = section.to_session_config();

        assert_eq!(config.window.initial_size, 8);
        assert_eq!(config.inactivity_timeout, Duration::from_secs(30));
        assert_eq!(config.crc_length, 2);
    }

    #[test]
    fn test_invalid_session_rejected() {
        let config = Config {
            session: SessionSection {
                crc_length: 7,
                ..SessionSection::default()
            },
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
