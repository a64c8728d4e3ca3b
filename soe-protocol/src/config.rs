//! Session configuration
//!
//! All tunables for a session live here so they can be injected from the
//! service or loaded from a config file by the command-line tools.

use crate::packet::{DEFAULT_MAX_UDP_SIZE, SEQUENCED_HEADER_SIZE};
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Window growth and shrink constants
///
/// The window opens additively as packets are acknowledged and closes
/// multiplicatively on retransmission timeouts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowConfig {
    /// Window size a new session starts with (packets)
    pub initial_size: u32,
    /// Floor the window never shrinks below
    pub min_size: u32,
    /// Packets added to the window per full window acknowledged
    pub additive_increase: f64,
    /// Factor applied to the window on a timeout
    pub multiplicative_decrease: f64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            initial_size: 32,
            min_size: 4,
            additive_increase: 1.0,
            multiplicative_decrease: 0.5,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Largest reliable datagram, headers included
    pub max_packet_size: usize,
    /// Largest unreliable datagram
    pub max_unreliable_size: usize,
    /// Upper bound on sent-but-unacknowledged packets
    pub resend_window_size: u32,
    pub window: WindowConfig,

    /// Delay between session requests while connecting
    pub connect_retry_interval: Duration,
    /// Session requests sent before giving up
    pub connect_max_retries: u32,
    /// Silence after which the session times out
    pub inactivity_timeout: Duration,
    /// Idle time after which a keepalive ping is sent
    pub ping_interval: Duration,
    /// Period of client network status reports
    pub net_stat_interval: Duration,

    /// RTO before the first round-trip sample
    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
    /// Resends of a single packet before the session times out
    pub max_resend_attempts: u32,

    /// Time budget for building packets in one write tick
    pub packet_build_time_limit: Duration,
    /// Protocol violations tolerated before the session errors out
    pub max_protocol_errors: u32,
    /// Largest message accepted from the fragment reassembler
    pub max_reassembly_size: usize,

    /// CRC footer bytes requested for the session (0 to 4)
    pub crc_length: u8,
    /// Whether the server offers zlib compression
    pub use_compression: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_packet_size: DEFAULT_MAX_UDP_SIZE as usize,
            max_unreliable_size: DEFAULT_MAX_UDP_SIZE as usize,
            resend_window_size: 256,
            window: WindowConfig::default(),
            connect_retry_interval: Duration::from_millis(500),
            connect_max_retries: 10,
            inactivity_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(5),
            net_stat_interval: Duration::from_secs(15),
            initial_rto: Duration::from_millis(500),
            min_rto: Duration::from_millis(100),
            max_rto: Duration::from_secs(4),
            max_resend_attempts: 30,
            packet_build_time_limit: Duration::from_millis(5),
            max_protocol_errors: 32,
            max_reassembly_size: 4 * 1024 * 1024,
            crc_length: 2,
            use_compression: false,
        }
    }
}

impl SessionConfig {
    /// Check the configuration for values the session cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Room for the header, the fragment size prefix, at least one payload
        // byte and the largest footer
        if self.max_packet_size < SEQUENCED_HEADER_SIZE + 4 + 1 + 4 + 1 {
            return Err(ConfigError::Invalid("max_packet_size too small"));
        }
        if self.max_unreliable_size > self.max_packet_size {
            return Err(ConfigError::Invalid(
                "max_unreliable_size exceeds max_packet_size",
            ));
        }
        if self.resend_window_size == 0 || self.resend_window_size >= 0x8000 {
            return Err(ConfigError::Invalid(
                "resend_window_size must be between 1 and 32767",
            ));
        }
        if self.window.min_size == 0 || self.window.min_size > self.resend_window_size {
            return Err(ConfigError::Invalid("window min_size out of range"));
        }
        if !(self.window.multiplicative_decrease > 0.0 && self.window.multiplicative_decrease < 1.0)
        {
            return Err(ConfigError::Invalid(
                "multiplicative_decrease must be in (0, 1)",
            ));
        }
        if self.min_rto > self.max_rto {
            return Err(ConfigError::Invalid("min_rto exceeds max_rto"));
        }
        if self.crc_length > 4 {
            return Err(ConfigError::Invalid("crc_length must be at most 4"));
        }
        if self.connect_max_retries == 0 {
            return Err(ConfigError::Invalid("connect_max_retries must be non-zero"));
        }
        Ok(())
    }

    /// Payload budget of a reliable packet once header and footer are taken
    ///
    /// The footer allows for the CRC and the compression flag byte.
    pub fn reliable_payload_budget(&self) -> usize {
        self.max_packet_size
            .saturating_sub(SEQUENCED_HEADER_SIZE + self.footer_size())
    }

    /// Payload budget of an unreliable packet
    pub fn unreliable_payload_budget(&self) -> usize {
        self.max_unreliable_size.saturating_sub(self.footer_size())
    }

    fn footer_size(&self) -> usize {
        self.crc_length as usize + usize::from(self.use_compression)
    }

    /// Window size the controller starts with, clamped to the configured bounds
    pub fn initial_window(&self) -> u32 {
        self.window
            .initial_size
            .clamp(self.window.min_size, self.resend_window_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert_eq!(SessionConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_tiny_packets() {
        let config = SessionConfig {
            max_packet_size: 8,
            max_unreliable_size: 8,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_window_beyond_half_space() {
        let config = SessionConfig {
            resend_window_size: 0x8000,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_payload_budget() {
        let config = SessionConfig {
            max_packet_size: 80,
            crc_length: 2,
            use_compression: true,
            ..SessionConfig::default()
        };
        assert_eq!(config.reliable_payload_budget(), 80 - 4 - 3);
    }

    #[test]
    fn test_initial_window_clamped() {
        let config = SessionConfig {
            resend_window_size: 8,
            ..SessionConfig::default()
        };
        assert_eq!(config.initial_window(), 8);
    }
}
