//! SRT Handshake Protocol
//!
//! Wire format of the HSv5 handshake: the 48-byte base block inherited from
//! UDT followed by SRT extension blocks.
//!
//! ```text
//! +-------------------------------+
//! |           version             |
//! +---------------+---------------+
//! |  encryption   |   extension   |
//! +---------------+---------------+
//! |   initial sequence number     |
//! |     maximum segment size      |
//! |      maximum flow window      |
//! |        handshake type         |
//! |          socket id            |
//! |          SYN cookie           |
//! |     peer IP (4 x 32 bits)     |
//! +---------------+---------------+
//! | ext type      | ext length    |  repeated
//! | ext contents (length words)   |
//! +-------------------------------+
//! ```

use crate::sequence::SeqNumber;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// SRT library version advertised in HSREQ/HSRSP
pub const SRT_VERSION: u32 = 0x0001_0500; // Version 1.5.0

/// Magic code sent in the extension field of an HSv5 induction response
pub const SRT_MAGIC_CODE: u16 = 0x4A17;

/// Handshake version of the caller's first induction request
pub const HS_VERSION_UDT4: u32 = 4;

/// Handshake version spoken by this implementation
pub const HS_VERSION_SRT1: u32 = 5;

/// Size of the fixed handshake block
pub const HANDSHAKE_SIZE: usize = 48;

/// Extension field flags of a conclusion handshake
pub const HS_EXT_HSREQ: u16 = 0x1;
pub const HS_EXT_KMREQ: u16 = 0x2;
pub const HS_EXT_CONFIG: u16 = 0x4;

const EXT_HSREQ: u16 = 1;
const EXT_HSRSP: u16 = 2;
const EXT_KMREQ: u16 = 3;
const EXT_KMRSP: u16 = 4;
const EXT_SID: u16 = 5;
const EXT_CONGESTION: u16 = 6;

/// Rejection reason base added to the reason code in the handshake type
const REJECT_BASE: i32 = 1000;

/// Handshake errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Invalid handshake packet")]
    InvalidPacket,

    #[error("Unknown handshake type: {0}")]
    UnknownType(i32),

    #[error("Extension parse error: {0}")]
    ExtensionError(&'static str),
}

/// SRT capability flags exchanged in HSREQ/HSRSP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SrtFlags {
    /// Timestamp-based packet delivery (sender)
    pub tsbpd_sender: bool,
    /// Timestamp-based packet delivery (receiver)
    pub tsbpd_receiver: bool,
    /// Encryption support
    pub encryption: bool,
    /// Too-late packet drop
    pub too_late_packet_drop: bool,
    /// Periodic NAK report
    pub nak_report: bool,
    /// Retransmit flag support
    pub rexmit_flag: bool,
    /// Stream (buffer) API instead of message API
    pub stream_mode: bool,
    /// Packet filter support
    pub packet_filter: bool,
}

impl SrtFlags {
    /// Convert to bit flags
    pub fn to_bits(&self) -> u32 {
        [
            self.tsbpd_sender,
            self.tsbpd_receiver,
            self.encryption,
            self.too_late_packet_drop,
            self.nak_report,
            self.rexmit_flag,
            self.stream_mode,
            self.packet_filter,
        ]
        .iter()
        .enumerate()
        .fold(0, |acc, (bit, set)| if *set { acc | (1 << bit) } else { acc })
    }

    /// Parse from bit flags
    pub fn from_bits(flags: u32) -> Self {
        let bit = |n: u32| flags & (1 << n) != 0;
        SrtFlags {
            tsbpd_sender: bit(0),
            tsbpd_receiver: bit(1),
            encryption: bit(2),
            too_late_packet_drop: bit(3),
            nak_report: bit(4),
            rexmit_flag: bit(5),
            stream_mode: bit(6),
            packet_filter: bit(7),
        }
    }
}

/// Why a connection attempt was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    Unknown,
    /// System function error
    System,
    /// Rejected by peer
    Peer,
    /// Resource allocation problem
    Resource,
    /// Incorrect data in handshake
    Rogue,
    /// Listener's backlog exceeded
    Backlog,
    /// Internal program error
    Ipe,
    /// Socket is closing
    Close,
    /// Peer is older than the configured minimum version
    Version,
    /// Rendezvous cookie collision
    RdvCookie,
    /// Wrong password
    BadSecret,
    /// Password required or unexpected
    Unsecure,
    /// Stream flag collision
    MessageApi,
    /// Incompatible congestion controller
    Congestion,
    /// Incompatible packet filter
    Filter,
}

impl RejectReason {
    const ALL: [RejectReason; 15] = [
        RejectReason::Unknown,
        RejectReason::System,
        RejectReason::Peer,
        RejectReason::Resource,
        RejectReason::Rogue,
        RejectReason::Backlog,
        RejectReason::Ipe,
        RejectReason::Close,
        RejectReason::Version,
        RejectReason::RdvCookie,
        RejectReason::BadSecret,
        RejectReason::Unsecure,
        RejectReason::MessageApi,
        RejectReason::Congestion,
        RejectReason::Filter,
    ];

    pub fn code(self) -> i32 {
        Self::ALL.iter().position(|r| *r == self).unwrap_or(0) as i32
    }

    pub fn from_code(code: i32) -> Self {
        usize::try_from(code)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .unwrap_or(RejectReason::Unknown)
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::Unknown => "unknown or erroneous",
            RejectReason::System => "error in system calls",
            RejectReason::Peer => "peer rejected connection",
            RejectReason::Resource => "resource allocation failure",
            RejectReason::Rogue => "rogue peer or incorrect parameters",
            RejectReason::Backlog => "listener's backlog exceeded",
            RejectReason::Ipe => "internal program error",
            RejectReason::Close => "socket is closing",
            RejectReason::Version => "peer is older than the minimum version",
            RejectReason::RdvCookie => "rendezvous cookie collision",
            RejectReason::BadSecret => "wrong password",
            RejectReason::Unsecure => "password required or unexpected",
            RejectReason::MessageApi => "stream flag collision",
            RejectReason::Congestion => "incompatible congestion controller",
            RejectReason::Filter => "incompatible packet filter",
        };
        f.write_str(text)
    }
}

/// Handshake type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeType {
    /// Rendezvous announcement
    WaveAHand,
    /// First exchange, carries the cookie
    Induction,
    /// Carries the SRT extensions
    Conclusion,
    /// Rendezvous final acknowledgement
    Agreement,
    /// Rendezvous completion
    Done,
    /// Refusal
    Rejection(RejectReason),
}

impl HandshakeType {
    pub fn to_i32(self) -> i32 {
        match self {
            HandshakeType::WaveAHand => 0,
            HandshakeType::Induction => 1,
            HandshakeType::Conclusion => -1,
            HandshakeType::Agreement => -2,
            HandshakeType::Done => -3,
            HandshakeType::Rejection(reason) => REJECT_BASE + reason.code(),
        }
    }

    pub fn from_i32(value: i32) -> Result<Self, HandshakeError> {
        Ok(match value {
            0 => HandshakeType::WaveAHand,
            1 => HandshakeType::Induction,
            -1 => HandshakeType::Conclusion,
            -2 => HandshakeType::Agreement,
            -3 => HandshakeType::Done,
            v if v >= REJECT_BASE => HandshakeType::Rejection(RejectReason::from_code(v - REJECT_BASE)),
            other => return Err(HandshakeError::UnknownType(other)),
        })
    }
}

/// Direction of the HSREQ/HSRSP block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtExtKind {
    Request,
    Response,
}

/// HSREQ / HSRSP extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtHsExtension {
    pub kind: SrtExtKind,
    pub srt_version: u32,
    pub flags: SrtFlags,
    /// TSBPD delay this side applies when receiving (ms)
    pub recv_tsbpd_delay: u16,
    /// TSBPD delay this side asks the peer to apply (ms)
    pub send_tsbpd_delay: u16,
}

/// KMREQ / KMRSP extension payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterialExt {
    pub kind: SrtExtKind,
    pub data: Bytes,
}

/// Complete handshake control body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: u32,
    /// PBKEYLEN / 8 advertised by the sender (0 = none)
    pub encryption_field: u16,
    /// Magic code (induction) or extension flags (conclusion)
    pub extension_field: u16,
    pub initial_seq: SeqNumber,
    pub mss: u32,
    pub flow_window: u32,
    pub hs_type: HandshakeType,
    pub socket_id: u32,
    pub cookie: u32,
    pub peer_ip: IpAddr,
    pub srt: Option<SrtHsExtension>,
    pub key_material: Option<KeyMaterialExt>,
    pub stream_id: Option<String>,
    pub congestion: Option<String>,
}

impl Handshake {
    /// Base handshake without extensions
    pub fn new(hs_type: HandshakeType, socket_id: u32, peer_ip: IpAddr) -> Self {
        Handshake {
            version: HS_VERSION_SRT1,
            encryption_field: 0,
            extension_field: 0,
            initial_seq: SeqNumber::default(),
            mss: crate::packet::DEFAULT_MSS as u32,
            flow_window: 8192,
            hs_type,
            socket_id,
            cookie: 0,
            peer_ip,
            srt: None,
            key_material: None,
            stream_id: None,
            congestion: None,
        }
    }

    /// Extension flags matching the blocks present
    pub fn conclusion_flags(&self) -> u16 {
        let mut flags = 0;
        if self.srt.is_some() {
            flags |= HS_EXT_HSREQ;
        }
        if self.key_material.is_some() {
            flags |= HS_EXT_KMREQ;
        }
        if self.stream_id.is_some() || self.congestion.is_some() {
            flags |= HS_EXT_CONFIG;
        }
        flags
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_SIZE + 64);

        buf.put_u32(self.version);
        buf.put_u16(self.encryption_field);
        buf.put_u16(self.extension_field);
        buf.put_u32(self.initial_seq.as_raw());
        buf.put_u32(self.mss);
        buf.put_u32(self.flow_window);
        buf.put_i32(self.hs_type.to_i32());
        buf.put_u32(self.socket_id);
        buf.put_u32(self.cookie);
        put_ip(&mut buf, self.peer_ip);

        if let Some(ext) = &self.srt {
            let ext_type = match ext.kind {
                SrtExtKind::Request => EXT_HSREQ,
                SrtExtKind::Response => EXT_HSRSP,
            };
            buf.put_u16(ext_type);
            buf.put_u16(3);
            buf.put_u32(ext.srt_version);
            buf.put_u32(ext.flags.to_bits());
            buf.put_u16(ext.recv_tsbpd_delay);
            buf.put_u16(ext.send_tsbpd_delay);
        }

        if let Some(km) = &self.key_material {
            let ext_type = match km.kind {
                SrtExtKind::Request => EXT_KMREQ,
                SrtExtKind::Response => EXT_KMRSP,
            };
            put_padded(&mut buf, ext_type, &km.data);
        }

        if let Some(sid) = &self.stream_id {
            put_padded(&mut buf, EXT_SID, &swap_words(sid.as_bytes()));
        }

        if let Some(name) = &self.congestion {
            put_padded(&mut buf, EXT_CONGESTION, &swap_words(name.as_bytes()));
        }

        buf.freeze()
    }

    /// Parse from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HandshakeError> {
        if bytes.len() < HANDSHAKE_SIZE {
            return Err(HandshakeError::InvalidPacket);
        }

        let mut buf = bytes;
        let version = buf.get_u32();
        let encryption_field = buf.get_u16();
        let extension_field = buf.get_u16();
        let initial_seq = SeqNumber::new_unchecked(buf.get_u32());
        let mss = buf.get_u32();
        let flow_window = buf.get_u32();
        let hs_type = HandshakeType::from_i32(buf.get_i32())?;
        let socket_id = buf.get_u32();
        let cookie = buf.get_u32();
        let peer_ip = get_ip(&mut buf);

        let mut hs = Handshake {
            version,
            encryption_field,
            extension_field,
            initial_seq,
            mss,
            flow_window,
            hs_type,
            socket_id,
            cookie,
            peer_ip,
            srt: None,
            key_material: None,
            stream_id: None,
            congestion: None,
        };

        while buf.remaining() >= 4 {
            let ext_type = buf.get_u16();
            let len = buf.get_u16() as usize * 4;
            if buf.remaining() < len {
                return Err(HandshakeError::ExtensionError("truncated extension"));
            }
            let content = &buf[..len];
            buf.advance(len);

            match ext_type {
                EXT_HSREQ | EXT_HSRSP => {
                    if content.len() < 12 {
                        return Err(HandshakeError::ExtensionError("short HSREQ/HSRSP"));
                    }
                    let mut c = content;
                    hs.srt = Some(SrtHsExtension {
                        kind: if ext_type == EXT_HSREQ {
                            SrtExtKind::Request
                        } else {
                            SrtExtKind::Response
                        },
                        srt_version: c.get_u32(),
                        flags: SrtFlags::from_bits(c.get_u32()),
                        recv_tsbpd_delay: c.get_u16(),
                        send_tsbpd_delay: c.get_u16(),
                    });
                }
                EXT_KMREQ | EXT_KMRSP => {
                    hs.key_material = Some(KeyMaterialExt {
                        kind: if ext_type == EXT_KMREQ {
                            SrtExtKind::Request
                        } else {
                            SrtExtKind::Response
                        },
                        data: Bytes::copy_from_slice(content),
                    });
                }
                EXT_SID => hs.stream_id = Some(decode_string(content)?),
                EXT_CONGESTION => hs.congestion = Some(decode_string(content)?),
                other => {
                    tracing::trace!(ext_type = other, "ignoring unknown handshake extension");
                }
            }
        }

        Ok(hs)
    }
}

fn put_ip(buf: &mut BytesMut, ip: IpAddr) {
    match ip {
        IpAddr::V4(v4) => {
            buf.put_slice(&v4.octets());
            buf.put_slice(&[0u8; 12]);
        }
        IpAddr::V6(v6) => buf.put_slice(&v6.octets()),
    }
}

fn get_ip(buf: &mut &[u8]) -> IpAddr {
    let mut octets = [0u8; 16];
    buf.copy_to_slice(&mut octets);
    if octets[4..].iter().all(|b| *b == 0) {
        IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
    } else {
        IpAddr::V6(Ipv6Addr::from(octets))
    }
}

/// Write an extension block, zero-padding the content to whole words
fn put_padded(buf: &mut BytesMut, ext_type: u16, content: &[u8]) {
    let words = (content.len() + 3) / 4;
    buf.put_u16(ext_type);
    buf.put_u16(words as u16);
    buf.put_slice(content);
    buf.put_bytes(0, words * 4 - content.len());
}

/// String extensions travel as little-endian 32-bit words
fn swap_words(bytes: &[u8]) -> Vec<u8> {
    let mut padded = bytes.to_vec();
    padded.resize((bytes.len() + 3) / 4 * 4, 0);
    for word in padded.chunks_exact_mut(4) {
        word.reverse();
    }
    padded
}

fn decode_string(content: &[u8]) -> Result<String, HandshakeError> {
    let mut bytes = swap_words(content);
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    String::from_utf8(bytes).map_err(|_| HandshakeError::ExtensionError("string is not UTF-8"))
}
