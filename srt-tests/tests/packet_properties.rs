//! Property-based tests for the wire formats and sequence arithmetic
//!
//! These tests use proptest to generate random packets and sequence values
//! and check the invariants the engine relies on.

use bytes::Bytes;
use proptest::prelude::*;
use srt_protocol::control::{decode_loss_ranges, encode_loss_ranges, AckInfo, ControlMessage};
use srt_protocol::handshake::Handshake;
use srt_protocol::loss::{LossRange, SenderLossList};
use srt_protocol::packet::{DataPacket, MsgNumber, Packet, PacketBoundary, MSG_NUMBER_MASK};
use srt_protocol::sequence::{SeqNumber, MAX_SEQ_NUMBER};
use srt_crypto::KeyParity;

// Property test strategies

fn seq_number_strategy() -> impl Strategy<Value = SeqNumber> {
    (0..=MAX_SEQ_NUMBER).prop_map(SeqNumber::new_unchecked)
}

fn packet_boundary_strategy() -> impl Strategy<Value = PacketBoundary> {
    prop_oneof![
        Just(PacketBoundary::Subsequent),
        Just(PacketBoundary::Last),
        Just(PacketBoundary::First),
        Just(PacketBoundary::Solo),
    ]
}

fn key_strategy() -> impl Strategy<Value = Option<KeyParity>> {
    prop_oneof![
        Just(None),
        Just(Some(KeyParity::Even)),
        Just(Some(KeyParity::Odd)),
    ]
}

fn data_packet_strategy() -> impl Strategy<Value = DataPacket> {
    (
        seq_number_strategy(),
        packet_boundary_strategy(),
        any::<bool>(),
        key_strategy(),
        any::<bool>(),
        0..=MSG_NUMBER_MASK,
        any::<u32>(),
        any::<u32>(),
        prop::collection::vec(any::<u8>(), 0..=256),
    )
        .prop_map(
            |(seq, boundary, in_order, key, retransmitted, msg, timestamp, dest, payload)| {
                DataPacket {
                    seq,
                    boundary,
                    in_order,
                    key,
                    retransmitted,
                    msg_number: MsgNumber::new(msg),
                    timestamp,
                    dest_socket_id: dest,
                    payload: Bytes::from(payload),
                }
            },
        )
}

/// Disjoint, ascending ranges that do not wrap
fn loss_ranges_strategy() -> impl Strategy<Value = Vec<LossRange>> {
    prop::collection::vec((1u32..1000, 0u32..50), 1..20).prop_map(|gaps| {
        let mut next = 0u32;
        gaps.into_iter()
            .map(|(gap, len)| {
                let start = next + gap;
                next = start + len + 1;
                LossRange::new(SeqNumber::new(start), SeqNumber::new(start + len))
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn prop_data_packet_roundtrip(packet in data_packet_strategy()) {
        let bytes = Packet::Data(packet.clone()).to_bytes();
        prop_assert_eq!(Packet::from_bytes(&bytes).unwrap(), Packet::Data(packet));
    }

    #[test]
    fn prop_parsing_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..200)) {
        if let Ok(Packet::Control(control)) = Packet::from_bytes(&bytes) {
            let _ = ControlMessage::from_packet(&control);
        }
        let _ = Handshake::from_bytes(&bytes);
        let _ = decode_loss_ranges(&bytes);
    }

    #[test]
    fn prop_short_datagrams_rejected(bytes in prop::collection::vec(any::<u8>(), 0..16)) {
        prop_assert!(Packet::from_bytes(&bytes).is_err());
    }

    #[test]
    fn prop_loss_ranges_roundtrip(ranges in loss_ranges_strategy()) {
        let decoded = decode_loss_ranges(&encode_loss_ranges(&ranges)).unwrap();
        prop_assert_eq!(decoded, ranges);
    }

    #[test]
    fn prop_ack_carries_sequence(seq in seq_number_strategy(), journal in any::<u32>()) {
        let message = ControlMessage::Ack { journal, info: AckInfo::new(seq) };
        let packet = message.clone().into_packet(0, 1);
        prop_assert_eq!(ControlMessage::from_packet(&packet).unwrap(), message);
    }

    #[test]
    fn prop_seq_add_then_distance(seq in seq_number_strategy(), n in 0u32..0x3FFF_FFFF) {
        let later = seq + n;
        prop_assert_eq!(seq.distance_to(later), n as i32);
        prop_assert_eq!(later - n, seq);
        if n > 0 {
            prop_assert!(seq.lt(later));
            prop_assert!(later.gt(seq));
        }
    }

    #[test]
    fn prop_seq_distance_antisymmetric(a in seq_number_strategy(), b in seq_number_strategy()) {
        let ab = a.distance_to(b);
        let ba = b.distance_to(a);
        // Exactly half the space apart is the one ambiguous distance
        if ab.unsigned_abs() != 0x4000_0000 {
            prop_assert_eq!(ab, -ba);
        }
    }

    #[test]
    fn prop_seq_stays_in_31_bits(seq in seq_number_strategy(), n in any::<u32>()) {
        prop_assert!((seq + (n & MAX_SEQ_NUMBER)).as_raw() <= MAX_SEQ_NUMBER);
        prop_assert!(seq.next().as_raw() <= MAX_SEQ_NUMBER);
    }

    #[test]
    fn prop_msg_number_never_zero_after_next(raw in 0..=MSG_NUMBER_MASK) {
        let next = MsgNumber::new(raw).next();
        prop_assert_ne!(next.as_raw(), 0);
        prop_assert!(next.as_raw() <= MSG_NUMBER_MASK);
    }

    #[test]
    fn prop_sender_loss_list_pops_in_order(ranges in loss_ranges_strategy()) {
        let mut list = SenderLossList::new();
        // Insertion order must not matter
        for range in ranges.iter().rev() {
            list.add_range(*range);
        }
        let expected: Vec<SeqNumber> = ranges.iter().flat_map(|r| r.iter()).collect();
        let mut popped = Vec::new();
        while let Some(seq) = list.pop_next() {
            popped.push(seq);
        }
        prop_assert_eq!(popped, expected);
    }

    #[test]
    fn prop_acknowledge_clears_loss(ranges in loss_ranges_strategy(), cut in 0u32..20_000) {
        let mut list = SenderLossList::new();
        for range in &ranges {
            list.add_range(*range);
        }
        let ack = SeqNumber::new(cut);
        list.acknowledge(ack);
        while let Some(seq) = list.pop_next() {
            prop_assert!(seq.ge(ack));
        }
    }
}
