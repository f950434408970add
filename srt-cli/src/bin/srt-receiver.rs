//! SRT Receiver
//!
//! Receives one SRT connection and writes the data to stdout, a file or a
//! UDP destination.

use anyhow::Context;
use clap::Parser;
use srt::{Srt, SrtError};
use srt_cli::config::{ConnectMode, ConnectionConfig, ReceiverConfig, Transport};
use srt_cli::{display_compact_stats, display_stats, format_bytes, session, Config};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "srt-receiver")]
#[command(about = "SRT stream and file receiver", long_about = None)]
struct Args {
    /// Output: file path, '-' for stdout, or 'udp://host:port'
    #[arg(short, long, default_value = "-")]
    output: String,

    /// Connection mode (caller, listener, rendezvous)
    #[arg(short, long, default_value = "listener")]
    mode: ConnectMode,

    /// Local address (listener, rendezvous)
    #[arg(short, long)]
    local: Option<SocketAddr>,

    /// Remote address (caller, rendezvous)
    #[arg(short, long)]
    remote: Option<SocketAddr>,

    /// Receive a file transfer instead of a live stream
    #[arg(long)]
    file: bool,

    /// Latency in milliseconds (live)
    #[arg(long, default_value = "120")]
    latency: u32,

    /// Encryption passphrase
    #[arg(long)]
    passphrase: Option<String>,

    /// Key length in bytes (16, 24, 32)
    #[arg(long)]
    pbkeylen: Option<u32>,

    /// Read settings from a TOML file instead
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Statistics interval in seconds, 0 disables
    #[arg(long, default_value = "1")]
    stats: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ReceiverConfig> {
        if let Some(path) = &self.config {
            return Config::from_file(path)?
                .receiver
                .context("configuration file has no [receiver] section");
        }
        Ok(ReceiverConfig {
            output: self.output,
            connection: ConnectionConfig {
                mode: self.mode,
                remote: self.remote,
                local: self.local,
                transport: if self.file {
                    Transport::File
                } else {
                    Transport::Live
                },
                latency_ms: self.latency,
                passphrase: self.passphrase,
                pbkeylen: self.pbkeylen,
                ..ConnectionConfig::default()
            },
            buffer_size: 65536,
            stats_interval_secs: self.stats,
        })
    }
}

struct UdpWriter {
    socket: UdpSocket,
}

impl Write for UdpWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn open_output(output: &str) -> anyhow::Result<Box<dyn Write>> {
    if output == "-" {
        tracing::info!("Writing to stdout");
        Ok(Box::new(io::stdout()))
    } else if let Some(addr) = output.strip_prefix("udp://") {
        let target: SocketAddr = addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid UDP output address '{}': {}", addr, e))?;
        tracing::info!("Relaying to UDP: {}", target);
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(target)?;
        Ok(Box::new(UdpWriter { socket }))
    } else {
        tracing::info!("Writing to file: {}", output);
        let file = File::create(output)
            .map_err(|e| anyhow::anyhow!("Failed to create file '{}': {}", output, e))?;
        Ok(Box::new(BufWriter::new(file)))
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(io::stderr)
        .init();

    let config = args.into_config()?;
    config.connection.validate()?;
    tracing::info!("SRT Receiver starting...");

    let mut writer = open_output(&config.output)?;
    let srt = Srt::new();
    let socket = session::open(&srt, &config.connection).context("Connection failed")?;
    tracing::info!("Connected to {}", srt.getpeername(socket)?);

    let mut buffer = vec![0u8; config.buffer_size.max(1500)];
    let mut total_bytes = 0u64;
    let start_time = Instant::now();
    let mut next_stats = start_time + config.stats_interval();

    loop {
        let n = match srt.recv(socket, &mut buffer) {
            Ok(n) => n,
            Err(SrtError::ConnectionLost) | Err(SrtError::Closing) | Err(SrtError::Peer(_)) => {
                tracing::info!("Connection closed by peer");
                break;
            }
            Err(e) => return Err(e.into()),
        };
        writer.write_all(&buffer[..n])?;
        total_bytes += n as u64;

        if config.stats_interval_secs > 0 && Instant::now() >= next_stats {
            writer.flush()?;
            let perf = srt.perfmon(socket, true)?;
            display_compact_stats(&perf, total_bytes, start_time.elapsed());
            next_stats += config.stats_interval();
        }
    }
    writer.flush()?;

    if config.stats_interval_secs > 0 {
        if let Ok(stats) = srt.bstats(socket, false) {
            display_stats(&stats);
        }
    }
    srt.close(socket)?;
    tracing::info!("Received {}", format_bytes(total_bytes));
    Ok(())
}
