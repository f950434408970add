//! Protocol engine scenarios
//!
//! Two connection engines, set up through a real caller/listener handshake,
//! exchange packets over a simulated link with a virtual clock. Loss is
//! injected on the link; timers run off the simulated time.

use proptest::prelude::*;
use srt_crypto::CryptoControl;
use srt_protocol::connection::{BreakReason, Connection, LinkState};
use srt_protocol::negotiation::{
    self, CallerHandshake, HandshakeStep, ListenerHandshake, ListenerStep,
};
use srt_protocol::options::{SocketOptions, TransType};
use srt_protocol::packet::Packet;
use srt_protocol::sequence::SeqNumber;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const CALLER_ID: u32 = 11;
const ACCEPTED_ID: u32 = 22;

fn caller_addr() -> SocketAddr {
    "127.0.0.1:7000".parse().unwrap()
}

fn listener_addr() -> SocketAddr {
    "127.0.0.1:9000".parse().unwrap()
}

/// Caller and accepted engines, connected through the handshake
fn establish(opts: &SocketOptions, now: Instant) -> (Connection, Connection) {
    let mut caller_crypto = CryptoControl::new(opts.crypto_config()).unwrap();
    let mut listener_crypto = CryptoControl::new(opts.crypto_config()).unwrap();
    let mut caller = CallerHandshake::new(opts, CALLER_ID, SeqNumber::new(1000), listener_addr());
    let listener = ListenerHandshake::new(1, opts);

    let induction = match listener.on_handshake(&caller.request(), caller_addr()) {
        ListenerStep::Reply(hs) => hs,
        other => panic!("unexpected {:?}", other),
    };
    let conclusion = match caller.on_handshake(&induction, &mut caller_crypto, now) {
        HandshakeStep::Send(hs) => hs,
        other => panic!("unexpected {:?}", other),
    };
    assert!(matches!(
        listener.on_handshake(&conclusion, caller_addr()),
        ListenerStep::Conclusion
    ));
    let (accepted_settings, response) = negotiation::respond(
        opts,
        &conclusion,
        ACCEPTED_ID,
        caller_addr().ip(),
        SeqNumber::new(5000),
        &mut listener_crypto,
        now,
    )
    .unwrap();
    let caller_settings = match caller.on_handshake(&response, &mut caller_crypto, now) {
        HandshakeStep::Connected { negotiated, .. } => *negotiated,
        other => panic!("unexpected {:?}", other),
    };

    let caller = Connection::new(
        CALLER_ID,
        listener_addr(),
        opts,
        caller_settings,
        caller_crypto,
        (now, 0),
        now,
        now,
    );
    let accepted = Connection::new(
        ACCEPTED_ID,
        caller_addr(),
        opts,
        accepted_settings,
        listener_crypto,
        (now, 0),
        now,
        now,
    );
    (caller, accepted)
}

/// Simulated link with per-packet loss decisions
struct Link {
    now: Instant,
    loss: Vec<bool>,
    sent: usize,
}

impl Link {
    fn new(now: Instant, loss: Vec<bool>) -> Self {
        Link { now, loss, sent: 0 }
    }

    /// Data packets are dropped according to the loss pattern; control
    /// packets always arrive
    fn pump(&mut self, from: &mut Connection, to: &mut Connection) {
        while let Some(packet) = from.poll_transmit(self.now) {
            if packet.is_data() && !self.loss.is_empty() {
                let lost = self.loss[self.sent % self.loss.len()];
                self.sent += 1;
                if lost {
                    continue;
                }
            }
            let packet = Packet::from_bytes(&packet.to_bytes()).unwrap();
            to.handle_packet(packet, self.now);
        }
    }

    /// Advance the clock and run whatever became due on both sides
    fn step(&mut self, a: &mut Connection, b: &mut Connection, by: Duration) {
        self.now += by;
        for conn in [&mut *a, &mut *b] {
            if conn.next_timeout() <= self.now {
                conn.on_timer(self.now);
            }
        }
        self.pump(a, b);
        self.pump(b, a);
    }
}

/// Link that loses the first transmission of chosen sequence numbers and
/// can hold the retransmissions of one of them back until a given instant
struct ScriptedLink {
    now: Instant,
    lose_first: Vec<SeqNumber>,
    hold: Option<(SeqNumber, Instant)>,
    held: Vec<Packet>,
    released_late: usize,
}

impl ScriptedLink {
    fn pump(&mut self, from: &mut Connection, to: &mut Connection) {
        while let Some(packet) = from.poll_transmit(self.now) {
            if let Packet::Data(data) = &packet {
                if !data.retransmitted && self.lose_first.contains(&data.seq) {
                    continue;
                }
                if let Some((seq, until)) = self.hold {
                    if data.retransmitted && data.seq == seq && self.now < until {
                        self.held.push(packet);
                        continue;
                    }
                }
            }
            let packet = Packet::from_bytes(&packet.to_bytes()).unwrap();
            to.handle_packet(packet, self.now);
        }
    }

    /// Advance the clock; held packets reach `b` once their hold expires
    fn step(&mut self, a: &mut Connection, b: &mut Connection, by: Duration) {
        self.now += by;
        for conn in [&mut *a, &mut *b] {
            if conn.next_timeout() <= self.now {
                conn.on_timer(self.now);
            }
        }
        if let Some((_, until)) = self.hold {
            if self.now >= until {
                for packet in self.held.drain(..) {
                    b.handle_packet(packet, self.now);
                    self.released_late += 1;
                }
            }
        }
        self.pump(a, b);
        self.pump(b, a);
    }
}

/// Live units 1..=10, with 3 and 7 lost on their first transmission.
/// Returns the delivered units, the receiver's drop count over the run,
/// its belated count and how many held packets were let through late.
fn live_units_with_two_losses(hold_unit_3: Option<Duration>) -> (Vec<u32>, u64, u64, usize) {
    let start = Instant::now();
    let (mut tx, mut rx) = establish(&SocketOptions::default(), start);
    let unit_seq = |unit: u32| tx.settings().snd_isn + (unit - 1);
    let mut link = ScriptedLink {
        now: start,
        lose_first: vec![unit_seq(3), unit_seq(7)],
        hold: hold_unit_3.map(|delay| (unit_seq(3), start + delay)),
        held: Vec::new(),
        released_late: 0,
    };
    let drops_before = rx.stats(start, false).total.pkt_rcv_drop;

    let mut delivered = Vec::new();
    for step in 1..=1_000u32 {
        if step <= 10 {
            tx.send_message(&step.to_be_bytes(), None, true, None, link.now).unwrap();
        }
        link.step(&mut tx, &mut rx, Duration::from_millis(1));
        while let Some(delivery) = rx.recv_message(link.now) {
            delivered.push(u32::from_be_bytes(delivery.payload[..4].try_into().unwrap()));
        }
    }

    let total = rx.stats(link.now, false).total;
    (
        delivered,
        total.pkt_rcv_drop - drops_before,
        total.pkt_rcv_belated,
        link.released_late,
    )
}

fn file_options() -> SocketOptions {
    let mut opts = SocketOptions::default();
    opts.apply_trans_type(TransType::File);
    opts
}

#[test]
fn test_handshake_settings_agree() {
    let now = Instant::now();
    let (caller, accepted) = establish(&SocketOptions::default(), now);
    assert_eq!(caller.peer_socket_id(), ACCEPTED_ID);
    assert_eq!(accepted.peer_socket_id(), CALLER_ID);
    assert_eq!(caller.settings().snd_isn, accepted.settings().rcv_isn);
    assert_eq!(caller.settings().rcv_isn, accepted.settings().snd_isn);
    assert!(caller.settings().tsbpd && accepted.settings().tsbpd);
    assert!(caller.is_connected() && accepted.is_connected());
}

#[test]
fn test_file_transfer_without_loss() {
    let start = Instant::now();
    let (mut tx, mut rx) = establish(&file_options(), start);
    let mut link = Link::new(start, Vec::new());
    let data: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();

    let mut offset = 0;
    let mut received = Vec::new();
    let mut buf = vec![0u8; 65536];
    for _ in 0..20_000 {
        if offset < data.len() {
            offset += tx.send_stream(&data[offset..], link.now).unwrap_or(0);
        }
        link.step(&mut tx, &mut rx, Duration::from_millis(1));
        loop {
            let n = rx.recv_stream(&mut buf, link.now);
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        if received.len() == data.len() {
            break;
        }
    }
    assert_eq!(received, data);
    assert_eq!(tx.stats(link.now, false).total.pkt_retrans, 0);
}

#[test]
fn test_live_losses_recovered_in_order() {
    let (delivered, drops, _, _) = live_units_with_two_losses(None);
    assert_eq!(delivered, (1..=10).collect::<Vec<_>>());
    assert_eq!(drops, 0);
}

#[test]
fn test_live_retransmission_past_play_time_is_dropped_once() {
    // Latency is 120 ms; unit 3's repairs only get through at 400 ms
    let (delivered, drops, belated, released_late) =
        live_units_with_two_losses(Some(Duration::from_millis(400)));
    assert_eq!(delivered, vec![1, 2, 4, 5, 6, 7, 8, 9, 10]);
    assert_eq!(drops, 1);
    assert!(released_late > 0);
    assert!(belated >= 1);
}

#[test]
fn test_rekey_during_live_stream() {
    let start = Instant::now();
    let mut opts = SocketOptions::default();
    opts.passphrase = Some("correct horse battery".to_string());
    opts.km_refresh_rate = 100;
    opts.km_pre_announce = 25;
    let (mut tx, mut rx) = establish(&opts, start);
    let mut link = Link::new(start, Vec::new());

    let mut delivered = Vec::new();
    for i in 0..2_000u32 {
        if i < 600 {
            tx.send_message(&i.to_be_bytes(), None, true, None, link.now).unwrap();
        }
        link.step(&mut tx, &mut rx, Duration::from_millis(1));
        while let Some(delivery) = rx.recv_message(link.now) {
            delivered.push(u32::from_be_bytes(delivery.payload[..4].try_into().unwrap()));
        }
    }

    assert_eq!(delivered, (0..600).collect::<Vec<_>>());
    assert_eq!(rx.stats(link.now, false).total.pkt_rcv_undecrypt, 0);
}

#[test]
fn test_silent_peer_breaks_link() {
    let start = Instant::now();
    let (mut tx, _rx) = establish(&SocketOptions::default(), start);
    let mut now = start;
    while now < start + Duration::from_secs(10) {
        now += Duration::from_millis(100);
        tx.on_timer(now);
        while tx.poll_transmit(now).is_some() {}
    }
    assert_eq!(tx.state(), LinkState::Broken(BreakReason::PeerIdle));
}

#[test]
fn test_close_notifies_peer() {
    let start = Instant::now();
    let (mut tx, mut rx) = establish(&SocketOptions::default(), start);
    let mut link = Link::new(start, Vec::new());
    tx.close();
    link.step(&mut tx, &mut rx, Duration::from_millis(1));
    assert_eq!(rx.state(), LinkState::Broken(BreakReason::PeerClosed));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Whatever the loss pattern, a file transfer arrives complete and in order
    #[test]
    fn prop_file_transfer_survives_loss(
        loss in prop::collection::vec(prop::bool::weighted(0.1), 1..64)
    ) {
        let start = Instant::now();
        let (mut tx, mut rx) = establish(&file_options(), start);
        let mut link = Link::new(start, loss);
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let mut offset = 0;
        let mut received = Vec::new();
        let mut buf = vec![0u8; 65536];
        for _ in 0..60_000 {
            if offset < data.len() {
                offset += tx.send_stream(&data[offset..], link.now).unwrap_or(0);
            }
            link.step(&mut tx, &mut rx, Duration::from_millis(1));
            loop {
                let n = rx.recv_stream(&mut buf, link.now);
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            if received.len() == data.len() {
                break;
            }
        }
        prop_assert_eq!(received.len(), data.len());
        prop_assert!(received == data);
    }

    /// Live delivery never duplicates or reorders; whatever is given up on
    /// is skipped as a whole
    #[test]
    fn prop_live_delivery_in_order(
        loss in prop::collection::vec(prop::bool::weighted(0.2), 1..64)
    ) {
        let start = Instant::now();
        let (mut tx, mut rx) = establish(&SocketOptions::default(), start);
        let mut link = Link::new(start, loss);

        let mut delivered = Vec::new();
        for i in 0..1_500u32 {
            if i < 500 {
                tx.send_message(&i.to_be_bytes(), None, true, None, link.now).unwrap();
            }
            link.step(&mut tx, &mut rx, Duration::from_millis(1));
            while let Some(delivery) = rx.recv_message(link.now) {
                delivered.push(u32::from_be_bytes(delivery.payload[..4].try_into().unwrap()));
            }
        }

        prop_assert!(delivered.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(delivered.iter().all(|&m| m < 500));
        // Retransmission recovers most losses within the latency window
        prop_assert!(delivered.len() >= 400, "only {} delivered", delivered.len());
    }
}
