//! Socket options
//!
//! A typed option record with validated setters, plus the flat
//! [`SockOpt`]/[`OptValue`] get/set surface and the LIVE/FILE presets.

use crate::congestion::{BandwidthLimit, CongestionKind};
use crate::error::SrtError;
use crate::handshake::SRT_VERSION;
use crate::packet::{DEFAULT_MSS, HEADER_SIZE, UDP_IP_OVERHEAD};
use srt_crypto::{CryptoConfig, MAX_PASSPHRASE_LEN, MIN_PASSPHRASE_LEN};
use std::fmt;
use std::time::Duration;

/// Smallest accepted MSS
pub const MIN_MSS: u32 = 76;

/// Live-mode payload size (seven MPEG-TS packets)
pub const LIVE_PAYLOAD_SIZE: usize = 1316;

/// Stream id length limit
pub const MAX_STREAM_ID_LEN: usize = 512;

/// Smallest flow window and buffer size (packets)
const MIN_WINDOW: u32 = 32;

/// Default buffer size in packets
const DEFAULT_BUFFER_PACKETS: u32 = 8192;

/// Transmission type preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransType {
    #[default]
    Live,
    File,
}

/// Option identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SockOpt {
    Mss,
    SndSyn,
    RcvSyn,
    Congestion,
    Fc,
    SndBuf,
    RcvBuf,
    Linger,
    UdpSndBuf,
    UdpRcvBuf,
    MsgTtl,
    Rendezvous,
    SndTimeo,
    RcvTimeo,
    ReuseAddr,
    MaxBw,
    InputBw,
    OheadBw,
    Passphrase,
    PbKeyLen,
    KmState,
    Sender,
    TsbpdMode,
    Latency,
    RcvLatency,
    PeerLatency,
    TlPktDrop,
    NakReport,
    LossMaxTtl,
    Version,
    PeerVersion,
    MinVersion,
    ConnTimeo,
    StreamId,
    MessageApi,
    PayloadSize,
    TransType,
    KmRefreshRate,
    KmPreAnnounce,
    EnforcedEncryption,
    PeerIdleTimeo,
    SndKmState,
    RcvKmState,
    State,
    Event,
    SndData,
    RcvData,
}

/// When an option may still be changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptBinding {
    /// Only before `bind`
    PreBind,
    /// Only before `connect`/`listen`
    PreConnect,
    /// At any time
    Any,
    /// Cannot be set
    ReadOnly,
}

impl SockOpt {
    pub fn binding(self) -> OptBinding {
        use SockOpt::*;
        match self {
            Mss | UdpSndBuf | UdpRcvBuf | ReuseAddr => OptBinding::PreBind,
            Congestion | Fc | SndBuf | RcvBuf | Rendezvous | Passphrase | PbKeyLen | Sender
            | TsbpdMode | Latency | RcvLatency | PeerLatency | TlPktDrop | NakReport
            | MinVersion | ConnTimeo | StreamId | MessageApi | PayloadSize | TransType
            | KmRefreshRate | KmPreAnnounce | EnforcedEncryption | PeerIdleTimeo => {
                OptBinding::PreConnect
            }
            SndSyn | RcvSyn | Linger | MsgTtl | SndTimeo | RcvTimeo | MaxBw | InputBw
            | OheadBw | LossMaxTtl => OptBinding::Any,
            KmState | Version | PeerVersion | SndKmState | RcvKmState | State | Event
            | SndData | RcvData => OptBinding::ReadOnly,
        }
    }
}

/// Option value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl OptValue {
    pub fn as_bool(&self) -> Result<bool, SrtError> {
        match self {
            OptValue::Bool(b) => Ok(*b),
            OptValue::Int(i) => Ok(*i != 0),
            OptValue::Str(_) => Err(SrtError::invalid("expected a boolean")),
        }
    }

    pub fn as_int(&self) -> Result<i64, SrtError> {
        match self {
            OptValue::Int(i) => Ok(*i),
            OptValue::Bool(b) => Ok(*b as i64),
            OptValue::Str(_) => Err(SrtError::invalid("expected an integer")),
        }
    }

    pub fn as_str(&self) -> Result<&str, SrtError> {
        match self {
            OptValue::Str(s) => Ok(s),
            _ => Err(SrtError::invalid("expected a string")),
        }
    }
}

impl fmt::Display for OptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptValue::Bool(b) => write!(f, "{}", b),
            OptValue::Int(i) => write!(f, "{}", i),
            OptValue::Str(s) => write!(f, "{}", s),
        }
    }
}

fn in_range(opt: &str, value: i64, min: i64, max: i64) -> Result<i64, SrtError> {
    if value < min || value > max {
        return Err(SrtError::invalid(format!(
            "{} must be within {}..={}, got {}",
            opt, min, max, value
        )));
    }
    Ok(value)
}

fn millis(value: i64) -> Duration {
    Duration::from_millis(value.max(0) as u64)
}

/// `-1` means "none" for optional millisecond values
fn optional_millis(opt: &str, value: i64) -> Result<Option<Duration>, SrtError> {
    match value {
        -1 => Ok(None),
        v => Ok(Some(millis(in_range(opt, v, 0, i64::MAX)?))),
    }
}

fn to_millis(duration: Option<Duration>) -> i64 {
    duration.map_or(-1, |d| d.as_millis() as i64)
}

/// Typed socket configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// Maximum segment size including IP/UDP headers
    pub mss: u32,
    /// Blocking send
    pub snd_syn: bool,
    /// Blocking receive
    pub rcv_syn: bool,
    pub congestion: CongestionKind,
    /// Flow window (packets)
    pub flow_window: u32,
    /// Send buffer (bytes)
    pub snd_buf: u32,
    /// Receive buffer (bytes)
    pub rcv_buf: u32,
    /// Time to wait for unsent data on close
    pub linger: Option<Duration>,
    pub udp_snd_buf: u32,
    pub udp_rcv_buf: u32,
    /// Default message TTL
    pub msg_ttl: Option<Duration>,
    pub rendezvous: bool,
    pub snd_timeout: Option<Duration>,
    pub rcv_timeout: Option<Duration>,
    pub reuse_addr: bool,
    /// Bandwidth ceiling mode: >0 fixed, 0 relative to input, -1 unlimited
    pub max_bw: i64,
    pub input_bw: i64,
    /// Overhead over input rate, percent
    pub overhead_bw: u32,
    pub passphrase: Option<String>,
    /// Key length in bytes, 0 = default
    pub pb_keylen: usize,
    /// Declared sending side (asymmetric encryption deployments)
    pub sender: bool,
    pub tsbpd_mode: bool,
    pub rcv_latency: Duration,
    pub peer_latency: Duration,
    pub tlpktdrop: bool,
    pub nak_report: bool,
    /// Reorder tolerance (packets)
    pub loss_max_ttl: u32,
    pub min_version: u32,
    pub conn_timeout: Duration,
    pub stream_id: Option<String>,
    pub message_api: bool,
    /// Payload size, 0 = derived from the MSS
    pub payload_size: usize,
    pub trans_type: TransType,
    pub km_refresh_rate: u64,
    pub km_pre_announce: u64,
    pub enforced_encryption: bool,
    pub peer_idle_timeout: Duration,
}

impl Default for SocketOptions {
    fn default() -> Self {
        let packet = (DEFAULT_MSS - UDP_IP_OVERHEAD) as u32;
        let mut opts = SocketOptions {
            mss: DEFAULT_MSS as u32,
            snd_syn: true,
            rcv_syn: true,
            congestion: CongestionKind::Live,
            flow_window: 25_600,
            snd_buf: DEFAULT_BUFFER_PACKETS * packet,
            rcv_buf: DEFAULT_BUFFER_PACKETS * packet,
            linger: None,
            udp_snd_buf: 65_536,
            udp_rcv_buf: 65_536,
            msg_ttl: None,
            rendezvous: false,
            snd_timeout: None,
            rcv_timeout: None,
            reuse_addr: true,
            max_bw: -1,
            input_bw: 0,
            overhead_bw: 25,
            passphrase: None,
            pb_keylen: 0,
            sender: false,
            tsbpd_mode: true,
            rcv_latency: Duration::from_millis(120),
            peer_latency: Duration::from_millis(0),
            tlpktdrop: true,
            nak_report: true,
            loss_max_ttl: 0,
            min_version: 0x010300,
            conn_timeout: Duration::from_secs(3),
            stream_id: None,
            message_api: true,
            payload_size: LIVE_PAYLOAD_SIZE,
            trans_type: TransType::Live,
            km_refresh_rate: 0x100_0000,
            km_pre_announce: 0x1000,
            enforced_encryption: true,
            peer_idle_timeout: Duration::from_secs(5),
        };
        opts.apply_trans_type(TransType::Live);
        opts
    }
}

impl SocketOptions {
    /// Options preset for file transfer
    pub fn file() -> Self {
        let mut opts = Self::default();
        opts.apply_trans_type(TransType::File);
        opts
    }

    /// Apply a transmission type preset
    pub fn apply_trans_type(&mut self, trans_type: TransType) {
        self.trans_type = trans_type;
        match trans_type {
            TransType::Live => {
                self.tsbpd_mode = true;
                self.tlpktdrop = true;
                self.nak_report = true;
                self.message_api = true;
                self.payload_size = LIVE_PAYLOAD_SIZE;
                self.rcv_latency = Duration::from_millis(120);
                self.peer_latency = Duration::from_millis(120);
                self.congestion = CongestionKind::Live;
                self.linger = None;
            }
            TransType::File => {
                self.tsbpd_mode = false;
                self.tlpktdrop = false;
                self.nak_report = false;
                self.message_api = false;
                self.payload_size = 0;
                self.congestion = CongestionKind::File;
                self.linger = Some(Duration::from_secs(180));
            }
        }
    }

    /// Largest payload for one packet
    pub fn max_payload(&self) -> usize {
        let derived = self.mss as usize - UDP_IP_OVERHEAD - HEADER_SIZE;
        if self.payload_size == 0 {
            derived
        } else {
            self.payload_size.min(derived)
        }
    }

    /// Send buffer capacity in packets
    pub fn snd_buf_packets(&self) -> usize {
        (self.snd_buf as usize / (self.mss as usize - UDP_IP_OVERHEAD)).max(MIN_WINDOW as usize)
    }

    /// Receive buffer capacity in packets
    pub fn rcv_buf_packets(&self) -> usize {
        (self.rcv_buf as usize / (self.mss as usize - UDP_IP_OVERHEAD)).max(MIN_WINDOW as usize)
    }

    pub fn bandwidth_limit(&self) -> BandwidthLimit {
        BandwidthLimit {
            max_bw: self.max_bw,
            input_bw: self.input_bw,
            overhead_pct: self.overhead_bw,
        }
    }

    pub fn crypto_config(&self) -> CryptoConfig {
        CryptoConfig {
            passphrase: self.passphrase.as_ref().map(|p| p.as_bytes().to_vec()),
            key_len: if self.pb_keylen == 0 { 16 } else { self.pb_keylen },
            refresh_rate: self.km_refresh_rate,
            pre_announce: self.km_pre_announce,
            max_age: None,
        }
    }

    /// Cross-field checks done when the connection starts
    pub fn validate(&self) -> Result<(), SrtError> {
        if self.payload_size > self.mss as usize - UDP_IP_OVERHEAD - HEADER_SIZE {
            return Err(SrtError::invalid(format!(
                "payload size {} exceeds what MSS {} allows",
                self.payload_size, self.mss
            )));
        }
        if self.km_refresh_rate > 0 && self.km_pre_announce > self.km_refresh_rate / 2 {
            return Err(SrtError::invalid(
                "km_pre_announce must not exceed half of km_refresh_rate",
            ));
        }
        if self.tsbpd_mode && !self.message_api {
            return Err(SrtError::invalid("TSBPD requires the message API"));
        }
        Ok(())
    }

    /// Set an option from its flat representation
    pub fn set(&mut self, opt: SockOpt, value: &OptValue) -> Result<(), SrtError> {
        use SockOpt::*;
        match opt {
            Mss => self.mss = in_range("MSS", value.as_int()?, MIN_MSS as i64, DEFAULT_MSS as i64)? as u32,
            SndSyn => self.snd_syn = value.as_bool()?,
            RcvSyn => self.rcv_syn = value.as_bool()?,
            Congestion => {
                let name = value.as_str()?;
                self.congestion = CongestionKind::from_name(name)
                    .ok_or_else(|| SrtError::invalid(format!("unknown congestion control {:?}", name)))?;
            }
            Fc => self.flow_window = in_range("FC", value.as_int()?, MIN_WINDOW as i64, i32::MAX as i64)? as u32,
            SndBuf => self.snd_buf = self.buffer_bytes("SNDBUF", value)?,
            RcvBuf => self.rcv_buf = self.buffer_bytes("RCVBUF", value)?,
            Linger => {
                let ms = in_range("LINGER", value.as_int()?, 0, i32::MAX as i64)?;
                self.linger = (ms > 0).then(|| millis(ms));
            }
            UdpSndBuf => self.udp_snd_buf = in_range("UDP_SNDBUF", value.as_int()?, 1, i32::MAX as i64)? as u32,
            UdpRcvBuf => self.udp_rcv_buf = in_range("UDP_RCVBUF", value.as_int()?, 1, i32::MAX as i64)? as u32,
            MsgTtl => self.msg_ttl = optional_millis("MSGTTL", value.as_int()?)?,
            Rendezvous => self.rendezvous = value.as_bool()?,
            SndTimeo => self.snd_timeout = optional_millis("SNDTIMEO", value.as_int()?)?,
            RcvTimeo => self.rcv_timeout = optional_millis("RCVTIMEO", value.as_int()?)?,
            ReuseAddr => self.reuse_addr = value.as_bool()?,
            MaxBw => self.max_bw = in_range("MAXBW", value.as_int()?, -1, i64::MAX)?,
            InputBw => self.input_bw = in_range("INPUTBW", value.as_int()?, 0, i64::MAX)?,
            OheadBw => self.overhead_bw = in_range("OHEADBW", value.as_int()?, 5, 100)? as u32,
            Passphrase => {
                let passphrase = value.as_str()?;
                if passphrase.is_empty() {
                    self.passphrase = None;
                } else {
                    in_range(
                        "PASSPHRASE length",
                        passphrase.len() as i64,
                        MIN_PASSPHRASE_LEN as i64,
                        MAX_PASSPHRASE_LEN as i64,
                    )?;
                    self.passphrase = Some(passphrase.to_string());
                }
            }
            PbKeyLen => {
                let len = value.as_int()?;
                if ![0, 16, 24, 32].contains(&len) {
                    return Err(SrtError::invalid(format!("PBKEYLEN must be 16, 24 or 32, got {}", len)));
                }
                self.pb_keylen = len as usize;
            }
            Sender => self.sender = value.as_bool()?,
            TsbpdMode => self.tsbpd_mode = value.as_bool()?,
            Latency => {
                let latency = millis(in_range("LATENCY", value.as_int()?, 0, i32::MAX as i64)?);
                self.rcv_latency = latency;
                self.peer_latency = latency;
            }
            RcvLatency => self.rcv_latency = millis(in_range("RCVLATENCY", value.as_int()?, 0, i32::MAX as i64)?),
            PeerLatency => self.peer_latency = millis(in_range("PEERLATENCY", value.as_int()?, 0, i32::MAX as i64)?),
            TlPktDrop => self.tlpktdrop = value.as_bool()?,
            NakReport => self.nak_report = value.as_bool()?,
            LossMaxTtl => self.loss_max_ttl = in_range("LOSSMAXTTL", value.as_int()?, 0, i32::MAX as i64)? as u32,
            MinVersion => self.min_version = in_range("MINVERSION", value.as_int()?, 0, SRT_VERSION as i64)? as u32,
            ConnTimeo => self.conn_timeout = millis(in_range("CONNTIMEO", value.as_int()?, 0, i32::MAX as i64)?),
            StreamId => {
                let id = value.as_str()?;
                in_range("STREAMID length", id.len() as i64, 0, MAX_STREAM_ID_LEN as i64)?;
                self.stream_id = (!id.is_empty()).then(|| id.to_string());
            }
            MessageApi => self.message_api = value.as_bool()?,
            PayloadSize => {
                let max = (self.mss as usize - UDP_IP_OVERHEAD - HEADER_SIZE) as i64;
                self.payload_size = in_range("PAYLOADSIZE", value.as_int()?, 0, max)? as usize;
            }
            TransType => {
                let preset = match value.as_str()? {
                    "live" => self::TransType::Live,
                    "file" => self::TransType::File,
                    other => return Err(SrtError::invalid(format!("unknown transtype {:?}", other))),
                };
                self.apply_trans_type(preset);
            }
            KmRefreshRate => self.km_refresh_rate = in_range("KMREFRESHRATE", value.as_int()?, 0, i64::MAX)? as u64,
            KmPreAnnounce => self.km_pre_announce = in_range("KMPREANNOUNCE", value.as_int()?, 1, i64::MAX)? as u64,
            EnforcedEncryption => self.enforced_encryption = value.as_bool()?,
            PeerIdleTimeo => {
                self.peer_idle_timeout = millis(in_range("PEERIDLETIMEO", value.as_int()?, 1, i32::MAX as i64)?)
            }
            KmState | Version | PeerVersion | SndKmState | RcvKmState | State | Event | SndData
            | RcvData => return Err(SrtError::invalid(format!("{:?} is read-only", opt))),
        }
        Ok(())
    }

    fn buffer_bytes(&self, name: &str, value: &OptValue) -> Result<u32, SrtError> {
        let min = MIN_WINDOW as i64 * (self.mss as i64 - UDP_IP_OVERHEAD as i64);
        Ok(in_range(name, value.as_int()?, min, i32::MAX as i64)? as u32)
    }

    /// Read a stored option; runtime values come from the socket instead
    pub fn get(&self, opt: SockOpt) -> Option<OptValue> {
        use SockOpt::*;
        let value = match opt {
            Mss => OptValue::Int(self.mss as i64),
            SndSyn => OptValue::Bool(self.snd_syn),
            RcvSyn => OptValue::Bool(self.rcv_syn),
            Congestion => OptValue::Str(self.congestion.name().to_string()),
            Fc => OptValue::Int(self.flow_window as i64),
            SndBuf => OptValue::Int(self.snd_buf as i64),
            RcvBuf => OptValue::Int(self.rcv_buf as i64),
            Linger => OptValue::Int(self.linger.map_or(0, |d| d.as_millis() as i64)),
            UdpSndBuf => OptValue::Int(self.udp_snd_buf as i64),
            UdpRcvBuf => OptValue::Int(self.udp_rcv_buf as i64),
            MsgTtl => OptValue::Int(to_millis(self.msg_ttl)),
            Rendezvous => OptValue::Bool(self.rendezvous),
            SndTimeo => OptValue::Int(to_millis(self.snd_timeout)),
            RcvTimeo => OptValue::Int(to_millis(self.rcv_timeout)),
            ReuseAddr => OptValue::Bool(self.reuse_addr),
            MaxBw => OptValue::Int(self.max_bw),
            InputBw => OptValue::Int(self.input_bw),
            OheadBw => OptValue::Int(self.overhead_bw as i64),
            Passphrase => OptValue::Str(String::new()),
            PbKeyLen => OptValue::Int(self.pb_keylen as i64),
            Sender => OptValue::Bool(self.sender),
            TsbpdMode => OptValue::Bool(self.tsbpd_mode),
            Latency | RcvLatency => OptValue::Int(self.rcv_latency.as_millis() as i64),
            PeerLatency => OptValue::Int(self.peer_latency.as_millis() as i64),
            TlPktDrop => OptValue::Bool(self.tlpktdrop),
            NakReport => OptValue::Bool(self.nak_report),
            LossMaxTtl => OptValue::Int(self.loss_max_ttl as i64),
            Version => OptValue::Int(SRT_VERSION as i64),
            MinVersion => OptValue::Int(self.min_version as i64),
            ConnTimeo => OptValue::Int(self.conn_timeout.as_millis() as i64),
            StreamId => OptValue::Str(self.stream_id.clone().unwrap_or_default()),
            MessageApi => OptValue::Bool(self.message_api),
            PayloadSize => OptValue::Int(self.payload_size as i64),
            TransType => OptValue::Str(
                match self.trans_type {
                    self::TransType::Live => "live",
                    self::TransType::File => "file",
                }
                .to_string(),
            ),
            KmRefreshRate => OptValue::Int(self.km_refresh_rate as i64),
            KmPreAnnounce => OptValue::Int(self.km_pre_announce as i64),
            EnforcedEncryption => OptValue::Bool(self.enforced_encryption),
            PeerIdleTimeo => OptValue::Int(self.peer_idle_timeout.as_millis() as i64),
            KmState | PeerVersion | SndKmState | RcvKmState | State | Event | SndData
            | RcvData => return None,
        };
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_preset() {
        let opts = SocketOptions::default();
        assert_eq!(opts.trans_type, TransType::Live);
        assert!(opts.tsbpd_mode && opts.tlpktdrop && opts.nak_report && opts.message_api);
        assert_eq!(opts.payload_size, 1316);
        assert_eq!(opts.rcv_latency, Duration::from_millis(120));
        assert_eq!(opts.congestion, CongestionKind::Live);
        assert_eq!(opts.linger, None);
        assert_eq!(opts.max_payload(), 1316);
    }

    #[test]
    fn test_file_preset() {
        let opts = SocketOptions::file();
        assert!(!opts.tsbpd_mode && !opts.tlpktdrop && !opts.nak_report && !opts.message_api);
        assert_eq!(opts.payload_size, 0);
        assert_eq!(opts.max_payload(), 1456);
        assert_eq!(opts.congestion, CongestionKind::File);
        assert_eq!(opts.linger, Some(Duration::from_secs(180)));
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_transtype_via_setter() {
        let mut opts = SocketOptions::default();
        opts.set(SockOpt::TransType, &OptValue::Str("file".into())).unwrap();
        assert_eq!(opts, SocketOptions::file());
    }

    #[test]
    fn test_latency_sets_both_directions() {
        let mut opts = SocketOptions::default();
        opts.set(SockOpt::Latency, &OptValue::Int(200)).unwrap();
        assert_eq!(opts.rcv_latency, Duration::from_millis(200));
        assert_eq!(opts.peer_latency, Duration::from_millis(200));
        assert_eq!(opts.get(SockOpt::Latency), Some(OptValue::Int(200)));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut opts = SocketOptions::default();
        assert!(opts.set(SockOpt::Mss, &OptValue::Int(20)).is_err());
        assert!(opts.set(SockOpt::OheadBw, &OptValue::Int(200)).is_err());
        assert!(opts.set(SockOpt::PbKeyLen, &OptValue::Int(20)).is_err());
        assert!(opts.set(SockOpt::Passphrase, &OptValue::Str("short".into())).is_err());
        assert!(opts.set(SockOpt::PayloadSize, &OptValue::Int(1500)).is_err());
        assert!(opts.set(SockOpt::Congestion, &OptValue::Str("bbr".into())).is_err());
        assert!(opts.set(SockOpt::MaxBw, &OptValue::Int(-2)).is_err());
        assert_eq!(opts, SocketOptions::default());
    }

    #[test]
    fn test_read_only() {
        let mut opts = SocketOptions::default();
        assert!(opts.set(SockOpt::KmState, &OptValue::Int(0)).is_err());
        assert_eq!(SockOpt::Version.binding(), OptBinding::ReadOnly);
        assert_eq!(opts.get(SockOpt::Version), Some(OptValue::Int(SRT_VERSION as i64)));
        assert_eq!(opts.get(SockOpt::State), None);
    }

    #[test]
    fn test_optional_timeouts() {
        let mut opts = SocketOptions::default();
        opts.set(SockOpt::RcvTimeo, &OptValue::Int(250)).unwrap();
        assert_eq!(opts.rcv_timeout, Some(Duration::from_millis(250)));
        opts.set(SockOpt::RcvTimeo, &OptValue::Int(-1)).unwrap();
        assert_eq!(opts.rcv_timeout, None);
        assert!(opts.set(SockOpt::RcvTimeo, &OptValue::Int(-5)).is_err());
    }

    #[test]
    fn test_passphrase_and_crypto_config() {
        let mut opts = SocketOptions::default();
        opts.set(SockOpt::Passphrase, &OptValue::Str("0123456789".into())).unwrap();
        opts.set(SockOpt::PbKeyLen, &OptValue::Int(32)).unwrap();
        let config = opts.crypto_config();
        assert_eq!(config.passphrase.as_deref(), Some(&b"0123456789"[..]));
        assert_eq!(config.key_len, 32);
        // The passphrase is never read back
        assert_eq!(opts.get(SockOpt::Passphrase), Some(OptValue::Str(String::new())));
    }

    #[test]
    fn test_validate_km_schedule() {
        let mut opts = SocketOptions::default();
        opts.km_refresh_rate = 100;
        opts.km_pre_announce = 60;
        assert!(opts.validate().is_err());
    }
}
