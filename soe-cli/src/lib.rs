//! SOE CLI Library
//!
//! Shared functionality for SOE command-line tools.

pub mod config;
pub mod stats;

pub use config::{ClientConfig, Config, ConfigError, ServerConfig, SessionSection};
pub use stats::{
    display_compact_stats, display_service_stats, display_session_stats, format_bandwidth,
    format_bytes, format_duration, format_rtt,
};
