//! SRT Packet Structures and Serialization
//!
//! This module implements the SRT packet format, which consists of a 128-bit (16-byte)
//! header followed by optional payload data. Packets are either data packets or control
//! packets, distinguished by bit 31 of the first header word.
//!
//! ```text
//! Data packet                          Control packet
//! +-+---------------------------+      +-+-------------+---------------+
//! |0|     sequence number       |      |1| control type|    subtype    |
//! +-+-+-+-+---+-+---------------+      +-+-------------+---------------+
//! |PP |O|KK |R| message number  |      |       additional info         |
//! +---+-+---+-+-----------------+      +-------------------------------+
//! |          timestamp          |      |          timestamp            |
//! +-----------------------------+      +-------------------------------+
//! |   destination socket id     |      |   destination socket id       |
//! +-----------------------------+      +-------------------------------+
//! ```

use crate::handshake::HandshakeError;
use crate::sequence::SeqNumber;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use srt_crypto::KeyParity;
use std::fmt;
use thiserror::Error;

/// Size of the SRT packet header in bytes (4 fields × 4 bytes each)
pub const HEADER_SIZE: usize = 16;

/// IPv4 + UDP header overhead subtracted from the MSS
pub const UDP_IP_OVERHEAD: usize = 28;

/// Default maximum segment size (the whole datagram including IP/UDP)
pub const DEFAULT_MSS: usize = 1500;

/// Largest payload for the default MSS
pub const MAX_PAYLOAD_SIZE: usize = DEFAULT_MSS - UDP_IP_OVERHEAD - HEADER_SIZE;

/// Control packet flag (bit 31 of the first header word)
const CONTROL_FLAG: u32 = 0x8000_0000;

/// Mask for sequence number value (bits 0-30)
const SEQ_MASK: u32 = 0x7FFF_FFFF;

/// Message numbers are 26 bits
pub const MSG_NUMBER_MASK: u32 = 0x03FF_FFFF;

/// Control packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ControlType {
    /// Connection handshake
    Handshake = 0,
    /// Keep-alive
    KeepAlive = 1,
    /// Acknowledgement
    Ack = 2,
    /// Negative acknowledgement (loss report)
    Nak = 3,
    /// Congestion warning
    CongestionWarning = 4,
    /// Shutdown
    Shutdown = 5,
    /// Acknowledgement of acknowledgement
    AckAck = 6,
    /// Drop request
    DropReq = 7,
    /// Peer error
    PeerError = 8,
    /// Extension packets (key material exchange)
    UserDefined = 0x7FFF,
}

impl ControlType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(ControlType::Handshake),
            1 => Some(ControlType::KeepAlive),
            2 => Some(ControlType::Ack),
            3 => Some(ControlType::Nak),
            4 => Some(ControlType::CongestionWarning),
            5 => Some(ControlType::Shutdown),
            6 => Some(ControlType::AckAck),
            7 => Some(ControlType::DropReq),
            8 => Some(ControlType::PeerError),
            0x7FFF => Some(ControlType::UserDefined),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Position of a packet within its message (bits 30-31 of the message word)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketBoundary {
    /// Packet in the middle of a message
    Subsequent = 0b00,
    /// Last packet of a message
    Last = 0b01,
    /// First packet of a message
    First = 0b10,
    /// Solo packet (complete message)
    Solo = 0b11,
}

impl PacketBoundary {
    pub fn from_bits(value: u8) -> Self {
        match value & 0b11 {
            0b00 => PacketBoundary::Subsequent,
            0b01 => PacketBoundary::Last,
            0b10 => PacketBoundary::First,
            _ => PacketBoundary::Solo,
        }
    }

    pub fn as_bits(self) -> u8 {
        self as u8
    }

    /// Boundary of packet `index` of a message split into `count` packets
    pub fn for_position(index: usize, count: usize) -> Self {
        match (index == 0, index + 1 == count) {
            (true, true) => PacketBoundary::Solo,
            (true, false) => PacketBoundary::First,
            (false, true) => PacketBoundary::Last,
            (false, false) => PacketBoundary::Subsequent,
        }
    }

    pub fn is_first(self) -> bool {
        matches!(self, PacketBoundary::First | PacketBoundary::Solo)
    }

    pub fn is_last(self) -> bool {
        matches!(self, PacketBoundary::Last | PacketBoundary::Solo)
    }
}

/// 26-bit wrapping message number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MsgNumber(u32);

impl MsgNumber {
    pub fn new(value: u32) -> Self {
        MsgNumber(value & MSG_NUMBER_MASK)
    }

    #[inline]
    pub fn as_raw(self) -> u32 {
        self.0
    }

    /// Next message number; zero is skipped because it means "none"
    pub fn next(self) -> Self {
        let next = (self.0 + 1) & MSG_NUMBER_MASK;
        MsgNumber(if next == 0 { 1 } else { next })
    }
}

impl fmt::Display for MsgNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Data packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub seq: SeqNumber,
    pub boundary: PacketBoundary,
    /// Message must be delivered in order
    pub in_order: bool,
    /// Key slot the payload is encrypted with, `None` for clear text
    pub key: Option<KeyParity>,
    /// Set on every transmission after the first
    pub retransmitted: bool,
    pub msg_number: MsgNumber,
    /// Origin time in microseconds since the connection start
    pub timestamp: u32,
    pub dest_socket_id: u32,
    pub payload: Bytes,
}

impl DataPacket {
    /// Total size of the packet (header + payload)
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    fn message_word(&self) -> u32 {
        let mut raw = self.msg_number.as_raw();
        raw |= (self.boundary.as_bits() as u32) << 30;
        if self.in_order {
            raw |= 1 << 29;
        }
        raw |= (self.key.map_or(0, |k| k.flag()) as u32) << 27;
        if self.retransmitted {
            raw |= 1 << 26;
        }
        raw
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.seq.as_raw() & SEQ_MASK);
        buf.put_u32(self.message_word());
        buf.put_u32(self.timestamp);
        buf.put_u32(self.dest_socket_id);
        buf.put_slice(&self.payload);
    }

    fn decode(first: u32, mut rest: &[u8]) -> Self {
        let word = rest.get_u32();
        let timestamp = rest.get_u32();
        let dest_socket_id = rest.get_u32();

        DataPacket {
            seq: SeqNumber::new_unchecked(first & SEQ_MASK),
            boundary: PacketBoundary::from_bits((word >> 30) as u8),
            in_order: word & (1 << 29) != 0,
            key: KeyParity::from_flag(((word >> 27) & 0b11) as u8),
            retransmitted: word & (1 << 26) != 0,
            msg_number: MsgNumber::new(word),
            timestamp,
            dest_socket_id,
            payload: Bytes::copy_from_slice(rest),
        }
    }
}

/// Control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub control_type: ControlType,
    /// Type-specific subtype (used by user-defined packets)
    pub subtype: u16,
    /// Type-specific additional information
    pub additional_info: u32,
    pub timestamp: u32,
    pub dest_socket_id: u32,
    /// Control information field
    pub body: Bytes,
}

impl ControlPacket {
    /// Total size of the packet (header + control info)
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(CONTROL_FLAG | ((self.control_type.as_u16() as u32) << 16) | self.subtype as u32);
        buf.put_u32(self.additional_info);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.dest_socket_id);
        buf.put_slice(&self.body);
    }

    fn decode(first: u32, mut rest: &[u8]) -> Result<Self, PacketError> {
        let type_value = ((first >> 16) & 0x7FFF) as u16;
        let control_type =
            ControlType::from_u16(type_value).ok_or(PacketError::InvalidControlType(type_value))?;

        Ok(ControlPacket {
            control_type,
            subtype: (first & 0xFFFF) as u16,
            additional_info: rest.get_u32(),
            timestamp: rest.get_u32(),
            dest_socket_id: rest.get_u32(),
            body: Bytes::copy_from_slice(rest),
        })
    }
}

/// Unified packet type (either data or control)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data(DataPacket),
    Control(ControlPacket),
}

impl Packet {
    /// Check if this is a data packet
    pub fn is_data(&self) -> bool {
        matches!(self, Packet::Data(_))
    }

    /// Check if this is a control packet
    pub fn is_control(&self) -> bool {
        matches!(self, Packet::Control(_))
    }

    /// Get the destination socket ID
    pub fn dest_socket_id(&self) -> u32 {
        match self {
            Packet::Data(p) => p.dest_socket_id,
            Packet::Control(p) => p.dest_socket_id,
        }
    }

    /// Get the timestamp
    pub fn timestamp(&self) -> u32 {
        match self {
            Packet::Data(p) => p.timestamp,
            Packet::Control(p) => p.timestamp,
        }
    }

    /// Total size of the packet
    pub fn size(&self) -> usize {
        match self {
            Packet::Data(p) => p.size(),
            Packet::Control(p) => p.size(),
        }
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Data(_) => PacketType::Data,
            Packet::Control(p) => PacketType::Control(p.control_type),
        }
    }

    /// Serialize the packet to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        match self {
            Packet::Data(p) => p.encode_into(&mut buf),
            Packet::Control(p) => p.encode_into(&mut buf),
        }
        buf.freeze()
    }

    /// Parse a packet from bytes (automatically determines type)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_SIZE {
            return Err(PacketError::InsufficientData {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let mut buf = bytes;
        let first = buf.get_u32();
        if first & CONTROL_FLAG == 0 {
            Ok(Packet::Data(DataPacket::decode(first, buf)))
        } else {
            Ok(Packet::Control(ControlPacket::decode(first, buf)?))
        }
    }
}

/// Peek at the destination socket id of a raw datagram
pub fn peek_dest_socket_id(bytes: &[u8]) -> Option<u32> {
    let word = bytes.get(12..16)?;
    Some(u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
}

/// Packet type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Data,
    Control(ControlType),
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Data => write!(f, "Data"),
            PacketType::Control(ct) => write!(f, "Control({:?})", ct),
        }
    }
}

/// Packet parsing and validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Invalid control type: {0}")]
    InvalidControlType(u16),

    #[error("Malformed {0} control body")]
    MalformedControl(&'static str),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),
}
