//! Typed control messages
//!
//! Converts between [`ControlPacket`] (type, additional info, raw body) and
//! the structured messages the connection engine works with.

use crate::handshake::Handshake;
use crate::loss::LossRange;
use crate::packet::{ControlPacket, ControlType, MsgNumber, PacketError};
use crate::sequence::SeqNumber;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// User-defined subtype carrying a key-material request
pub const SUBTYPE_KMREQ: u16 = 3;
/// User-defined subtype carrying a key-material response
pub const SUBTYPE_KMRSP: u16 = 4;

/// Bit marking the first word of a compressed loss range
const RANGE_START_FLAG: u32 = 0x8000_0000;

/// Size of a light ACK body (sequence only)
const LIGHT_ACK_SIZE: usize = 4;
/// Size of a small ACK body (sequence, RTT, variance, buffer)
const SMALL_ACK_SIZE: usize = 16;
/// Size of a full ACK body
const FULL_ACK_SIZE: usize = 28;

/// ACK packet information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckInfo {
    /// Next sequence number expected (everything before it was received)
    pub ack_seq: SeqNumber,
    /// Round-trip time in microseconds
    pub rtt_us: u32,
    /// RTT variance in microseconds
    pub rtt_var_us: u32,
    /// Available buffer size (packets)
    pub buffer_available: u32,
    /// Packet arrival rate (packets per second)
    pub packet_arrival_rate: u32,
    /// Estimated link capacity (packets per second)
    pub estimated_link_capacity: u32,
    /// Receive rate (bytes per second)
    pub receive_rate_bps: u32,
}

impl AckInfo {
    /// Create a new ACK info
    pub fn new(ack_seq: SeqNumber) -> Self {
        AckInfo {
            ack_seq,
            rtt_us: 0,
            rtt_var_us: 0,
            buffer_available: 8192,
            packet_arrival_rate: 0,
            estimated_link_capacity: 0,
            receive_rate_bps: 0,
        }
    }

    /// Serialize ACK info to control packet data
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FULL_ACK_SIZE);
        buf.put_u32(self.ack_seq.as_raw());
        buf.put_u32(self.rtt_us);
        buf.put_u32(self.rtt_var_us);
        buf.put_u32(self.buffer_available);
        buf.put_u32(self.packet_arrival_rate);
        buf.put_u32(self.estimated_link_capacity);
        buf.put_u32(self.receive_rate_bps);
        buf.freeze()
    }

    /// Parse ACK info from bytes
    ///
    /// Light and small ACKs leave the missing fields at zero.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < LIGHT_ACK_SIZE {
            return None;
        }

        let mut buf = bytes;
        let mut info = AckInfo::new(SeqNumber::new_unchecked(buf.get_u32()));
        info.buffer_available = 0;

        if bytes.len() >= SMALL_ACK_SIZE {
            info.rtt_us = buf.get_u32();
            info.rtt_var_us = buf.get_u32();
            info.buffer_available = buf.get_u32();
        }
        if bytes.len() >= FULL_ACK_SIZE {
            info.packet_arrival_rate = buf.get_u32();
            info.estimated_link_capacity = buf.get_u32();
            info.receive_rate_bps = buf.get_u32();
        }
        Some(info)
    }
}

/// Encode a loss list in the compressed NAK form
pub fn encode_loss_ranges(ranges: &[LossRange]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ranges.len() * 8);
    for range in ranges {
        if range.is_single() {
            buf.put_u32(range.start.as_raw());
        } else {
            buf.put_u32(range.start.as_raw() | RANGE_START_FLAG);
            buf.put_u32(range.end.as_raw());
        }
    }
    buf.freeze()
}

/// Decode a compressed NAK loss list
pub fn decode_loss_ranges(bytes: &[u8]) -> Option<Vec<LossRange>> {
    let mut ranges = Vec::new();
    let mut buf = bytes;

    while buf.remaining() >= 4 {
        let first = buf.get_u32();
        if first & RANGE_START_FLAG != 0 {
            if buf.remaining() < 4 {
                return None;
            }
            let start = SeqNumber::new_unchecked(first);
            let end = SeqNumber::new_unchecked(buf.get_u32());
            if end.lt(start) {
                return None;
            }
            ranges.push(LossRange::new(start, end));
        } else {
            ranges.push(LossRange::single(SeqNumber::new_unchecked(first)));
        }
    }

    if buf.has_remaining() {
        return None;
    }
    Some(ranges)
}

/// A decoded control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Handshake(Handshake),
    KeepAlive,
    Ack {
        /// ACK journal number, echoed by the ACKACK
        journal: u32,
        info: AckInfo,
    },
    Nak(Vec<LossRange>),
    CongestionWarning,
    Shutdown,
    AckAck {
        journal: u32,
    },
    DropReq {
        msg_number: MsgNumber,
        first: SeqNumber,
        last: SeqNumber,
    },
    PeerError(u32),
    /// In-band key-material request (rekey announcement)
    KmRequest(Bytes),
    /// Reply to a key-material request
    KmResponse(Bytes),
}

impl ControlMessage {
    pub fn control_type(&self) -> ControlType {
        match self {
            ControlMessage::Handshake(_) => ControlType::Handshake,
            ControlMessage::KeepAlive => ControlType::KeepAlive,
            ControlMessage::Ack { .. } => ControlType::Ack,
            ControlMessage::Nak(_) => ControlType::Nak,
            ControlMessage::CongestionWarning => ControlType::CongestionWarning,
            ControlMessage::Shutdown => ControlType::Shutdown,
            ControlMessage::AckAck { .. } => ControlType::AckAck,
            ControlMessage::DropReq { .. } => ControlType::DropReq,
            ControlMessage::PeerError(_) => ControlType::PeerError,
            ControlMessage::KmRequest(_) | ControlMessage::KmResponse(_) => {
                ControlType::UserDefined
            }
        }
    }

    /// Build the wire packet for this message
    pub fn into_packet(self, timestamp: u32, dest_socket_id: u32) -> ControlPacket {
        let control_type = self.control_type();
        let (subtype, additional_info, body) = match self {
            ControlMessage::Handshake(hs) => (0, 0, hs.to_bytes()),
            ControlMessage::KeepAlive
            | ControlMessage::CongestionWarning
            | ControlMessage::Shutdown => (0, 0, Bytes::new()),
            ControlMessage::Ack { journal, info } => (0, journal, info.to_bytes()),
            ControlMessage::Nak(ranges) => (0, 0, encode_loss_ranges(&ranges)),
            ControlMessage::AckAck { journal } => (0, journal, Bytes::new()),
            ControlMessage::DropReq {
                msg_number,
                first,
                last,
            } => {
                let mut buf = BytesMut::with_capacity(8);
                buf.put_u32(first.as_raw());
                buf.put_u32(last.as_raw());
                (0, msg_number.as_raw(), buf.freeze())
            }
            ControlMessage::PeerError(code) => (0, code, Bytes::new()),
            ControlMessage::KmRequest(km) => (SUBTYPE_KMREQ, 0, km),
            ControlMessage::KmResponse(km) => (SUBTYPE_KMRSP, 0, km),
        };

        ControlPacket {
            control_type,
            subtype,
            additional_info,
            timestamp,
            dest_socket_id,
            body,
        }
    }

    /// Interpret a control packet
    pub fn from_packet(packet: &ControlPacket) -> Result<Self, PacketError> {
        let message = match packet.control_type {
            ControlType::Handshake => {
                ControlMessage::Handshake(Handshake::from_bytes(&packet.body)?)
            }
            ControlType::KeepAlive => ControlMessage::KeepAlive,
            ControlType::Ack => ControlMessage::Ack {
                journal: packet.additional_info,
                info: AckInfo::from_bytes(&packet.body)
                    .ok_or(PacketError::MalformedControl("ACK"))?,
            },
            ControlType::Nak => ControlMessage::Nak(
                decode_loss_ranges(&packet.body).ok_or(PacketError::MalformedControl("NAK"))?,
            ),
            ControlType::CongestionWarning => ControlMessage::CongestionWarning,
            ControlType::Shutdown => ControlMessage::Shutdown,
            ControlType::AckAck => ControlMessage::AckAck {
                journal: packet.additional_info,
            },
            ControlType::DropReq => {
                if packet.body.len() < 8 {
                    return Err(PacketError::MalformedControl("DROPREQ"));
                }
                let mut body = &packet.body[..];
                ControlMessage::DropReq {
                    msg_number: MsgNumber::new(packet.additional_info),
                    first: SeqNumber::new_unchecked(body.get_u32()),
                    last: SeqNumber::new_unchecked(body.get_u32()),
                }
            }
            ControlType::PeerError => ControlMessage::PeerError(packet.additional_info),
            ControlType::UserDefined => match packet.subtype {
                SUBTYPE_KMREQ => ControlMessage::KmRequest(packet.body.clone()),
                SUBTYPE_KMRSP => ControlMessage::KmResponse(packet.body.clone()),
                _ => return Err(PacketError::MalformedControl("user-defined")),
            },
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::HandshakeType;
    use crate::packet::Packet;
    use std::net::{IpAddr, Ipv4Addr};

    fn through_wire(message: ControlMessage) -> ControlMessage {
        let bytes = Packet::Control(message.into_packet(77, 42)).to_bytes();
        match Packet::from_bytes(&bytes).unwrap() {
            Packet::Control(packet) => {
                assert_eq!(packet.timestamp, 77);
                assert_eq!(packet.dest_socket_id, 42);
                ControlMessage::from_packet(&packet).unwrap()
            }
            Packet::Data(_) => panic!("control packet decoded as data"),
        }
    }

    #[test]
    fn test_ack_full() {
        let mut info = AckInfo::new(SeqNumber::new(1000));
        info.rtt_us = 50_000;
        info.rtt_var_us = 2_500;
        info.buffer_available = 4096;
        info.receive_rate_bps = 1_000_000;

        let message = ControlMessage::Ack { journal: 9, info };
        assert_eq!(through_wire(message.clone()), message);
    }

    #[test]
    fn test_light_ack() {
        let info = AckInfo::from_bytes(&[0, 0, 0x03, 0xE8]).unwrap();
        assert_eq!(info.ack_seq, SeqNumber::new(1000));
        assert_eq!(info.rtt_us, 0);
        assert_eq!(info.buffer_available, 0);
        assert!(AckInfo::from_bytes(&[0, 1]).is_none());
    }

    #[test]
    fn test_nak_compression() {
        let ranges = vec![
            LossRange::single(SeqNumber::new(100)),
            LossRange::new(SeqNumber::new(200), SeqNumber::new(205)),
        ];
        let bytes = encode_loss_ranges(&ranges);
        assert_eq!(bytes.len(), 12);
        assert_eq!(bytes[4] & 0x80, 0x80);
        assert_eq!(decode_loss_ranges(&bytes), Some(ranges));
    }

    #[test]
    fn test_nak_truncated_range() {
        let bytes = [0x80, 0, 0, 100];
        assert_eq!(decode_loss_ranges(&bytes), None);
    }

    #[test]
    fn test_drop_request() {
        let message = ControlMessage::DropReq {
            msg_number: MsgNumber::new(17),
            first: SeqNumber::new(5),
            last: SeqNumber::new(8),
        };
        let packet = message.clone().into_packet(0, 1);
        assert_eq!(packet.additional_info, 17);
        assert_eq!(through_wire(message.clone()), message);
    }

    #[test]
    fn test_km_subtypes() {
        let message = ControlMessage::KmRequest(Bytes::from_static(&[1, 2, 3, 4]));
        let packet = message.clone().into_packet(0, 1);
        assert_eq!(packet.control_type, ControlType::UserDefined);
        assert_eq!(packet.subtype, SUBTYPE_KMREQ);
        assert_eq!(through_wire(message.clone()), message);

        let reply = ControlMessage::KmResponse(Bytes::from_static(&[0, 0, 0, 2]));
        assert_eq!(reply.clone().into_packet(0, 1).subtype, SUBTYPE_KMRSP);
    }

    #[test]
    fn test_empty_bodies() {
        for message in [
            ControlMessage::KeepAlive,
            ControlMessage::Shutdown,
            ControlMessage::AckAck { journal: 3 },
            ControlMessage::PeerError(4000),
        ] {
            assert_eq!(through_wire(message.clone()), message);
        }
    }

    #[test]
    fn test_handshake_message() {
        let hs = Handshake::new(
            HandshakeType::Induction,
            1234,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        );
        let message = ControlMessage::Handshake(hs);
        assert_eq!(through_wire(message.clone()), message);
    }
}
