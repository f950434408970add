//! SRT CLI Library
//!
//! Shared functionality for SRT command-line tools.

pub mod config;
pub mod session;
pub mod stats;

pub use config::{Config, ConfigError, ConnectMode, ConnectionConfig, ReceiverConfig, SenderConfig, Transport};
pub use stats::{display_compact_stats, display_stats, format_bandwidth, format_bytes};
