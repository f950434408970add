//! SRT Sender
//!
//! Reads from stdin or a file and sends it over one SRT connection, as a
//! live stream or as a file transfer.

use anyhow::Context;
use clap::Parser;
use srt::{SockOpt, Srt, SrtError};
use srt_cli::config::{ConnectMode, ConnectionConfig, SenderConfig, Transport};
use srt_cli::{display_compact_stats, display_stats, session, Config};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "srt-sender")]
#[command(about = "SRT stream and file sender", long_about = None)]
struct Args {
    /// Input source: file path or '-' for stdin
    #[arg(short, long, default_value = "-")]
    input: String,

    /// Connection mode (caller, listener, rendezvous)
    #[arg(short, long, default_value = "caller")]
    mode: ConnectMode,

    /// Remote address (caller, rendezvous)
    #[arg(short, long)]
    remote: Option<SocketAddr>,

    /// Local address (listener, rendezvous)
    #[arg(short, long)]
    local: Option<SocketAddr>,

    /// Send as a file transfer instead of a live stream
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

    /// Stream id sent to the listener
    #[arg(long)]
    streamid: Option<String>,

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
    fn into_config(self) -> anyhow::Result<SenderConfig> {
        if let Some(path) = &self.config {
            return Config::from_file(path)?
                .sender
                .context("configuration file has no [sender] section");
        }
        Ok(SenderConfig {
            input: self.input,
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
                stream_id: self.streamid,
                ..ConnectionConfig::default()
            },
            chunk_size: 1316,
            stats_interval_secs: self.stats,
        })
    }
}

fn open_input(input: &str) -> anyhow::Result<Box<dyn Read + Send>> {
    if input == "-" {
        tracing::info!("Reading from stdin");
        Ok(Box::new(io::stdin()))
    } else {
        tracing::info!("Reading from file {}", input);
        let file = File::open(input).with_context(|| format!("Failed to open '{}'", input))?;
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Read until `buf` is full or the input ends
fn read_chunk(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
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
    tracing::info!("SRT Sender starting...");

    let srt = Srt::new();
    let socket = session::open(&srt, &config.connection).context("Connection failed")?;
    let mut reader = open_input(&config.input)?;

    let live = config.connection.transport == Transport::Live;
    let chunk_size = if live {
        match srt.getsockopt(socket, SockOpt::PayloadSize)?.as_int()? {
            0 => config.chunk_size,
            payload => config.chunk_size.min(payload as usize),
        }
    } else {
        config.chunk_size.max(1)
    };

    let mut buffer = vec![0u8; chunk_size];
    let mut total_bytes = 0u64;
    let start_time = Instant::now();
    let mut next_stats = start_time + config.stats_interval();

    tracing::info!("Entering main send loop...");
    loop {
        let n = read_chunk(&mut *reader, &mut buffer)?;
        if n == 0 {
            tracing::info!("End of input reached");
            break;
        }

        let mut sent = 0;
        while sent < n {
            match srt.send(socket, &buffer[sent..n]) {
                Ok(written) => sent += written,
                Err(SrtError::ConnectionLost) | Err(SrtError::Closing) => {
                    anyhow::bail!("Connection lost after {} bytes", total_bytes)
                }
                Err(e) => return Err(e.into()),
            }
        }
        total_bytes += n as u64;

        if config.stats_interval_secs > 0 && Instant::now() >= next_stats {
            let perf = srt.perfmon(socket, true)?;
            display_compact_stats(&perf, total_bytes, start_time.elapsed());
            next_stats += config.stats_interval();
        }
    }

    if !live {
        // Linger lets the close below wait for delivery; report what is left
        let (packets, bytes) = srt.getsndbuffer(socket)?;
        tracing::info!("Waiting for {} packets ({} bytes) to be acknowledged", packets, bytes);
    }
    if config.stats_interval_secs > 0 {
        display_stats(&srt.bstats(socket, false)?);
    }
    srt.close(socket)?;

    let elapsed = start_time.elapsed().max(Duration::from_millis(1));
    tracing::info!(
        "Sent {} bytes in {:.2}s ({:.2} Mbps)",
        total_bytes,
        elapsed.as_secs_f64(),
        (total_bytes as f64 * 8.0) / (elapsed.as_secs_f64() * 1_000_000.0)
    );
    Ok(())
}
