//! Configuration file support for SRT CLI tools

use serde::{Deserialize, Serialize};
use srt::{OptValue, SockOpt};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// How the connection is established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectMode {
    /// Connect to a listening peer
    #[default]
    Caller,
    /// Wait for one caller
    Listener,
    /// Both sides connect to each other
    Rendezvous,
}

impl std::str::FromStr for ConnectMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "caller" => Ok(ConnectMode::Caller),
            "listener" => Ok(ConnectMode::Listener),
            "rendezvous" => Ok(ConnectMode::Rendezvous),
            other => Err(ConfigError::Invalid(format!("unknown mode {:?}", other))),
        }
    }
}

/// Transmission type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Live,
    File,
}

impl Transport {
    fn name(self) -> &'static str {
        match self {
            Transport::Live => "live",
            Transport::File => "file",
        }
    }
}

/// Connection settings shared by sender and receiver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub mode: ConnectMode,
    /// Peer address (caller and rendezvous)
    pub remote: Option<SocketAddr>,
    /// Local address (listener and rendezvous; optional for callers)
    pub local: Option<SocketAddr>,
    #[serde(default)]
    pub transport: Transport,
    /// Latency in milliseconds
    #[serde(default = "default_latency")]
    pub latency_ms: u32,
    /// Encryption passphrase
    pub passphrase: Option<String>,
    /// Key length in bytes (16, 24 or 32)
    pub pbkeylen: Option<u32>,
    pub stream_id: Option<String>,
    /// Bandwidth ceiling in bytes/s, -1 for unlimited
    pub max_bw: Option<i64>,
    /// Connection timeout in milliseconds
    pub conn_timeout_ms: Option<u32>,
}

fn default_latency() -> u32 {
    120
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            mode: ConnectMode::Caller,
            remote: None,
            local: None,
            transport: Transport::Live,
            latency_ms: default_latency(),
            passphrase: None,
            pbkeylen: None,
            stream_id: None,
            max_bw: None,
            conn_timeout_ms: None,
        }
    }
}

impl ConnectionConfig {
    /// Socket options in the order they must be applied
    pub fn socket_options(&self) -> Vec<(SockOpt, OptValue)> {
        // The transmission type resets the others, so it goes first
        let mut opts = vec![(
            SockOpt::TransType,
            OptValue::Str(self.transport.name().to_string()),
        )];
        if self.transport == Transport::Live {
            opts.push((SockOpt::Latency, OptValue::Int(self.latency_ms as i64)));
        }
        if let Some(passphrase) = &self.passphrase {
            opts.push((SockOpt::Passphrase, OptValue::Str(passphrase.clone())));
        }
        if let Some(len) = self.pbkeylen {
            opts.push((SockOpt::PbKeyLen, OptValue::Int(len as i64)));
        }
        if let Some(id) = &self.stream_id {
            opts.push((SockOpt::StreamId, OptValue::Str(id.clone())));
        }
        if let Some(bw) = self.max_bw {
            opts.push((SockOpt::MaxBw, OptValue::Int(bw)));
        }
        if let Some(ms) = self.conn_timeout_ms {
            opts.push((SockOpt::ConnTimeo, OptValue::Int(ms as i64)));
        }
        opts
    }

    /// Check that the addresses the mode needs are present
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.mode {
            ConnectMode::Caller if self.remote.is_none() => {
                Err(ConfigError::Invalid("caller mode needs a remote address".into()))
            }
            ConnectMode::Listener if self.local.is_none() => {
                Err(ConfigError::Invalid("listener mode needs a local address".into()))
            }
            ConnectMode::Rendezvous if self.remote.is_none() || self.local.is_none() => Err(
                ConfigError::Invalid("rendezvous mode needs local and remote addresses".into()),
            ),
            _ => Ok(()),
        }
    }
}

/// Sender configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Input source (file path or "-" for stdin)
    pub input: String,
    pub connection: ConnectionConfig,
    /// Bytes read from the input per send call
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Statistics interval in seconds, 0 disables
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_chunk_size() -> usize {
    1316
}

fn default_stats_interval() -> u64 {
    1
}

/// Receiver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Output destination (file path or "-" for stdout)
    pub output: String,
    pub connection: ConnectionConfig,
    /// Receive buffer handed to each recv call
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Statistics interval in seconds, 0 disables
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_buffer_size() -> usize {
    65536
}

/// Combined configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Sender configuration
    pub sender: Option<SenderConfig>,
    /// Receiver configuration
    pub receiver: Option<ReceiverConfig>,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Create example sender configuration
    pub fn example_sender() -> Self {
        Config {
            sender: Some(SenderConfig {
                input: "-".to_string(),
                connection: ConnectionConfig {
                    remote: Some(SocketAddr::from((Ipv4Addr::new(192, 168, 1, 10), 9000))),
                    passphrase: Some("correct horse battery".to_string()),
                    ..ConnectionConfig::default()
                },
                chunk_size: default_chunk_size(),
                stats_interval_secs: 1,
            }),
            receiver: None,
        }
    }

    /// Create example receiver configuration
    pub fn example_receiver() -> Self {
        Config {
            sender: None,
            receiver: Some(ReceiverConfig {
                output: "-".to_string(),
                connection: ConnectionConfig {
                    mode: ConnectMode::Listener,
                    local: Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9000))),
                    passphrase: Some("correct horse battery".to_string()),
                    ..ConnectionConfig::default()
                },
                buffer_size: default_buffer_size(),
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

impl SenderConfig {
    /// Get statistics interval as Duration
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

impl ReceiverConfig {
    /// Get statistics interval as Duration
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}
