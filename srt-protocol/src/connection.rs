//! SRT Connection engine
//!
//! Manages a connection from the end of the handshake to teardown. The
//! engine does no I/O: the socket layer feeds it packets with
//! [`Connection::handle_packet`], drives its timers with
//! [`Connection::on_timer`] and drains outgoing packets with
//! [`Connection::poll_transmit`], sleeping until
//! [`Connection::next_timeout`] in between.

use crate::ack::{AckTimer, AckWindow, NakTimer, ReceiveRateEstimator, RttEstimator, SYN_INTERVAL};
use crate::buffer::{
    DroppedMessage, IncomingPacket, InsertOutcome, MessageOptions, OutgoingPacket, ReceiveBuffer,
    SendBuffer,
};
use crate::congestion::{AckEvent, BandwidthLimit, CongestionControl, InputRateEstimator};
use crate::control::{AckInfo, ControlMessage};
use crate::error::SrtError;
use crate::handshake::{Handshake, HandshakeType};
use crate::loss::{LossRange, ReceiverLossList, SenderLossList};
use crate::negotiation::Negotiated;
use crate::options::SocketOptions;
use crate::packet::{DataPacket, MsgNumber, Packet, UDP_IP_OVERHEAD};
use crate::sequence::SeqNumber;
use crate::stats::{Instantaneous, StatsCollector, TraceStats};
use crate::tsbpd::TsbpdClock;
use bytes::BytesMut;
use srt_crypto::{CryptoControl, KmState};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Keep-alive after this long without outgoing traffic
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Floor of the retransmission timeout
const MIN_EXP_INTERVAL: Duration = Duration::from_millis(300);

/// Floor of the sender too-late drop threshold
const MIN_SND_DROP_THRESHOLD: Duration = Duration::from_secs(1);

/// Socket lifecycle state
///
/// Numeric values match the ones reported through the STATE option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SocketStatus {
    Init = 1,
    Opened = 2,
    Listening = 3,
    Connecting = 4,
    Connected = 5,
    Broken = 6,
    Closing = 7,
    Closed = 8,
    NonExist = 9,
}

impl SocketStatus {
    /// Whether moving from `self` to `to` is allowed
    ///
    /// States only move forward. An accepted socket enters CONNECTED
    /// straight from INIT; a failed connection attempt ends in BROKEN.
    pub fn can_transition(self, to: SocketStatus) -> bool {
        use SocketStatus::*;
        matches!(
            (self, to),
            (Init, Opened)
                | (Init, Connected)
                | (Init, Closed)
                | (Opened, Listening)
                | (Opened, Connecting)
                | (Opened, Closing)
                | (Opened, Closed)
                | (Listening, Closing)
                | (Listening, Closed)
                | (Connecting, Connected)
                | (Connecting, Broken)
                | (Connecting, Closing)
                | (Connecting, Closed)
                | (Connected, Broken)
                | (Connected, Closing)
                | (Connected, Closed)
                | (Broken, Closing)
                | (Broken, Closed)
                | (Closing, Closed)
                | (Closed, NonExist)
        )
    }

    pub fn is_connected(self) -> bool {
        self == SocketStatus::Connected
    }
}

/// Why a connection stopped working
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakReason {
    /// Nothing heard from the peer within the idle timeout
    PeerIdle,
    /// The peer sent SHUTDOWN
    PeerClosed,
    /// The peer reported an error
    PeerError(u32),
}

impl From<BreakReason> for SrtError {
    fn from(reason: BreakReason) -> Self {
        match reason {
            BreakReason::PeerIdle | BreakReason::PeerClosed => SrtError::ConnectionLost,
            BreakReason::PeerError(code) => SrtError::Peer(code),
        }
    }
}

/// Engine-level link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Broken(BreakReason),
    Closed,
}

/// Retransmission timer: fires when the peer stops giving feedback
#[derive(Debug)]
struct ExpTimer {
    last_feedback: Instant,
    count: u32,
}

impl ExpTimer {
    fn period(&self, rtt: &RttEstimator) -> Duration {
        (rtt.rto() + SYN_INTERVAL).max(MIN_EXP_INTERVAL) * (self.count + 1)
    }

    fn reset(&mut self, now: Instant) {
        self.last_feedback = now;
        self.count = 0;
    }
}

/// Running average of received payload sizes, used to estimate dropped bytes
#[derive(Debug)]
struct PayloadAverage(f64);

impl PayloadAverage {
    fn update(&mut self, len: usize) {
        self.0 = (self.0 * 15.0 + len as f64) / 16.0;
    }

    fn bytes_for(&self, packets: u32) -> u64 {
        (self.0 * packets as f64) as u64
    }
}

/// One connected SRT link
pub struct Connection {
    socket_id: u32,
    peer_socket_id: u32,
    peer_addr: SocketAddr,
    /// Origin of our outgoing timestamps
    start: Instant,
    settings: Negotiated,
    max_payload: usize,
    reorder_tolerance: u32,
    peer_idle_timeout: Duration,
    state: LinkState,

    // Sending side
    send_buffer: SendBuffer,
    snd_loss: SenderLossList,
    peer_window: u32,
    congestion: Box<dyn CongestionControl>,
    bandwidth: BandwidthLimit,
    input_rate: InputRateEstimator,
    next_send_at: Instant,
    exp: ExpTimer,
    peer_link_capacity: u32,

    // Receiving side
    recv_buffer: ReceiveBuffer,
    rcv_loss: ReceiverLossList,
    /// One past the highest sequence received
    rcv_next: SeqNumber,
    tsbpd: TsbpdClock,
    ack_window: AckWindow,
    ack_timer: AckTimer,
    nak_timer: NakTimer,
    rate: ReceiveRateEstimator,
    avg_payload: PayloadAverage,

    rtt: RttEstimator,
    crypto: CryptoControl,
    last_send: Instant,
    last_recv: Instant,
    control: VecDeque<ControlMessage>,
    /// Last handshake sent to the peer, repeated if its conclusion is
    handshake_reply: Option<Handshake>,
    stats: StatsCollector,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("socket_id", &self.socket_id)
            .field("peer_socket_id", &self.peer_socket_id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create the engine for a freshly negotiated connection
    ///
    /// `peer_clock` is the arrival time and timestamp of the peer's last
    /// handshake packet; it anchors the TSBPD clock. `origin` is the instant
    /// our own timestamps count from, the same one used for our handshakes.
    pub fn new(
        socket_id: u32,
        peer_addr: SocketAddr,
        opts: &SocketOptions,
        settings: Negotiated,
        crypto: CryptoControl,
        peer_clock: (Instant, u32),
        origin: Instant,
        now: Instant,
    ) -> Self {
        let mss = settings.mss as usize;
        let max_payload = opts
            .max_payload()
            .min(mss.saturating_sub(UDP_IP_OVERHEAD + crate::packet::HEADER_SIZE))
            .max(1);
        let rcv_capacity = opts.rcv_buf_packets().min(opts.flow_window as usize);

        let mut congestion = settings.congestion.build(mss, settings.flow_window);
        let bandwidth = opts.bandwidth_limit();
        congestion.set_max_bandwidth(bandwidth.ceiling(0));

        let (arrival, peer_ts) = peer_clock;
        // Nothing to acknowledge until the first packet arrives
        let mut ack_timer = AckTimer::new(now);
        ack_timer.sent(settings.rcv_isn, now);
        info!(
            socket_id,
            peer_socket_id = settings.peer_socket_id,
            peer = %peer_addr,
            rcv_latency_ms = settings.rcv_latency.as_millis() as u64,
            snd_latency_ms = settings.snd_latency.as_millis() as u64,
            congestion = %settings.congestion,
            encrypted = crypto.encrypts(),
            "connection established"
        );

        Connection {
            socket_id,
            peer_socket_id: settings.peer_socket_id,
            peer_addr,
            start: origin,
            max_payload,
            reorder_tolerance: opts.loss_max_ttl,
            peer_idle_timeout: opts.peer_idle_timeout,
            state: LinkState::Connected,
            send_buffer: SendBuffer::new(opts.snd_buf_packets(), settings.snd_isn),
            snd_loss: SenderLossList::new(),
            peer_window: settings.flow_window,
            congestion,
            bandwidth,
            input_rate: InputRateEstimator::default(),
            next_send_at: now,
            exp: ExpTimer {
                last_feedback: now,
                count: 0,
            },
            peer_link_capacity: 0,
            recv_buffer: ReceiveBuffer::new(rcv_capacity, settings.rcv_isn),
            rcv_loss: ReceiverLossList::new(opts.loss_max_ttl),
            rcv_next: settings.rcv_isn,
            tsbpd: TsbpdClock::new(arrival, peer_ts, settings.rcv_latency),
            ack_window: AckWindow::new(),
            ack_timer,
            nak_timer: NakTimer::new(now),
            rate: ReceiveRateEstimator::new(),
            avg_payload: PayloadAverage(max_payload as f64),
            rtt: RttEstimator::new(),
            crypto,
            last_send: now,
            last_recv: now,
            control: VecDeque::new(),
            handshake_reply: None,
            stats: StatsCollector::new(now),
            settings,
        }
    }

    pub fn socket_id(&self) -> u32 {
        self.socket_id
    }

    pub fn peer_socket_id(&self) -> u32 {
        self.peer_socket_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn settings(&self) -> &Negotiated {
        &self.settings
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Largest payload of one data packet
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn snd_km_state(&self) -> KmState {
        self.crypto.snd_state()
    }

    pub fn rcv_km_state(&self) -> KmState {
        self.crypto.rcv_state()
    }

    /// Remember the handshake to repeat when the peer resends its conclusion
    pub fn set_handshake_reply(&mut self, reply: Handshake) {
        self.handshake_reply = Some(reply);
    }

    fn timestamp(&self, at: Instant) -> u32 {
        srt_io::srt_timestamp(self.start, at)
    }

    fn queue(&mut self, message: ControlMessage) {
        match &message {
            ControlMessage::Ack { .. } => self.stats.count(|c| c.pkt_sent_ack += 1),
            ControlMessage::Nak(_) => self.stats.count(|c| c.pkt_sent_nak += 1),
            _ => {}
        }
        self.control.push_back(message);
    }

    fn set_broken(&mut self, reason: BreakReason) {
        if self.state == LinkState::Connected {
            warn!(socket_id = self.socket_id, ?reason, "connection broken");
            self.state = LinkState::Broken(reason);
        }
    }

    fn check_sendable(&self) -> Result<(), SrtError> {
        match self.state {
            LinkState::Connected => Ok(()),
            LinkState::Broken(reason) => Err(reason.into()),
            LinkState::Closed => Err(SrtError::NoConnection),
        }
    }

    // ---- Application side ----

    /// Queue one message
    ///
    /// In live mode a message must fit a single packet.
    pub fn send_message(
        &mut self,
        data: &[u8],
        ttl: Option<Duration>,
        in_order: bool,
        origin: Option<Instant>,
        now: Instant,
    ) -> Result<(SeqNumber, MsgNumber), SrtError> {
        self.check_sendable()?;
        if self.settings.tsbpd && data.len() > self.max_payload {
            return Err(SrtError::LargeMessage);
        }
        let opts = MessageOptions {
            ttl,
            in_order,
            origin: origin.unwrap_or(now),
        };
        let queued = self.send_buffer.push_message(data, self.max_payload, opts)?;
        self.input_rate.add_sample(data.len(), now);
        trace!(socket_id = self.socket_id, seq = %queued.0, msg = %queued.1, len = data.len(), "message queued");
        Ok(queued)
    }

    /// Queue stream data; returns how many bytes were accepted
    pub fn send_stream(&mut self, data: &[u8], now: Instant) -> Result<usize, SrtError> {
        self.check_sendable()?;
        let opts = MessageOptions {
            ttl: None,
            in_order: true,
            origin: now,
        };
        let mut accepted = 0;
        for chunk in data.chunks(self.max_payload) {
            match self.send_buffer.push_message(chunk, self.max_payload, opts) {
                Ok(_) => accepted += chunk.len(),
                Err(_) if accepted > 0 => break,
                Err(e) => return Err(e.into()),
            }
        }
        self.input_rate.add_sample(accepted, now);
        Ok(accepted)
    }

    /// Take the next deliverable message
    pub fn recv_message(&mut self, now: Instant) -> Option<crate::buffer::Delivery> {
        self.recv_buffer.pop_message(now, self.settings.tsbpd)
    }

    /// Read stream data
    pub fn recv_stream(&mut self, buf: &mut [u8], now: Instant) -> usize {
        self.recv_buffer.read_stream(buf, now, self.settings.tsbpd)
    }

    /// Local time a delivered packet was produced by the peer
    pub fn origin_time(&self, timestamp: u32) -> Instant {
        self.tsbpd.origin_time(timestamp)
    }

    pub fn is_readable(&self, now: Instant) -> bool {
        if self.settings.message_api {
            self.recv_buffer.has_message(now, self.settings.tsbpd)
        } else {
            self.recv_buffer.has_stream_data(now, self.settings.tsbpd)
        }
    }

    pub fn is_writable(&self) -> bool {
        self.state == LinkState::Connected && self.send_buffer.space() > 0
    }

    /// All queued data acknowledged
    pub fn is_flushed(&self) -> bool {
        self.send_buffer.is_empty()
    }

    /// Packets and payload bytes waiting in the send buffer
    pub fn send_buffer_usage(&self) -> (usize, usize) {
        (self.send_buffer.len(), self.send_buffer.bytes())
    }

    /// Packets and payload bytes held by the receive buffer
    pub fn recv_buffer_usage(&self) -> (usize, usize) {
        (self.recv_buffer.len(), self.recv_buffer.bytes())
    }

    /// Apply options that may change on a live connection
    pub fn update_options(&mut self, opts: &SocketOptions) {
        self.bandwidth = opts.bandwidth_limit();
        self.congestion
            .set_max_bandwidth(self.bandwidth.ceiling(self.input_rate.estimated_bandwidth_bps()));
        self.reorder_tolerance = opts.loss_max_ttl;
        self.rcv_loss.set_reorder_tolerance(opts.loss_max_ttl);
    }

    /// Send SHUTDOWN and stop
    pub fn close(&mut self) {
        if self.state == LinkState::Connected {
            self.control.push_back(ControlMessage::Shutdown);
        }
        if self.state != LinkState::Closed {
            debug!(socket_id = self.socket_id, "connection closed");
        }
        self.state = LinkState::Closed;
    }

    // ---- Network side ----

    /// Process a packet addressed to this connection
    pub fn handle_packet(&mut self, packet: Packet, now: Instant) {
        if self.state == LinkState::Closed {
            return;
        }
        self.last_recv = now;
        match packet {
            Packet::Data(data) => self.handle_data(data, now),
            Packet::Control(control) => {
                let timestamp = control.timestamp;
                match ControlMessage::from_packet(&control) {
                    Ok(message) => self.handle_control(message, timestamp, now),
                    Err(e) => debug!(socket_id = self.socket_id, error = %e, "malformed control packet"),
                }
            }
        }
    }

    fn handle_control(&mut self, message: ControlMessage, timestamp: u32, now: Instant) {
        match message {
            ControlMessage::Handshake(hs) => {
                if hs.hs_type == HandshakeType::Conclusion {
                    if let Some(reply) = self.handshake_reply.clone() {
                        debug!(socket_id = self.socket_id, "repeating handshake response");
                        self.control.push_back(ControlMessage::Handshake(reply));
                    }
                }
            }
            ControlMessage::KeepAlive => {}
            ControlMessage::Ack { journal, info } => self.handle_ack(journal, info, now),
            ControlMessage::Nak(ranges) => self.handle_nak(ranges, now),
            ControlMessage::CongestionWarning => {
                trace!(socket_id = self.socket_id, "congestion warning ignored");
            }
            ControlMessage::Shutdown => {
                info!(socket_id = self.socket_id, "peer closed the connection");
                self.set_broken(BreakReason::PeerClosed);
            }
            ControlMessage::AckAck { journal } => {
                if let Some((_, sample)) = self.ack_window.acknowledge(journal, now) {
                    self.rtt.update(sample.as_micros() as u32);
                    if self.settings.tsbpd {
                        self.tsbpd.on_drift_sample(timestamp, now);
                    }
                }
            }
            ControlMessage::DropReq {
                msg_number,
                first,
                last,
            } => self.handle_drop_request(msg_number, first, last),
            ControlMessage::PeerError(code) => self.set_broken(BreakReason::PeerError(code)),
            ControlMessage::KmRequest(km) => {
                let reply = self.crypto.on_km_request(&km);
                self.control.push_back(ControlMessage::KmResponse(reply.encode()));
            }
            ControlMessage::KmResponse(km) => self.crypto.on_km_response(&km),
        }
    }

    fn handle_data(&mut self, packet: DataPacket, now: Instant) {
        let seq = packet.seq;
        let len = packet.payload.len() as u64;
        self.stats.count(|c| {
            c.pkt_recv += 1;
            c.byte_recv += len;
        });

        let offset = self.recv_buffer.start_seq().distance_to(seq);
        if offset >= self.recv_buffer.capacity() as i32 {
            warn!(socket_id = self.socket_id, %seq, "packet beyond the receive buffer");
            return;
        }
        if offset < 0 {
            self.stats.count(|c| {
                c.pkt_rcv_belated += 1;
                c.byte_rcv_belated += len;
            });
            return;
        }

        if packet.retransmitted {
            self.stats.count(|c| c.pkt_rcv_retrans += 1);
        } else {
            self.rate.on_arrival(seq, packet.payload.len(), now);
        }
        self.tsbpd.observe(packet.timestamp);
        self.track_loss(seq);

        let payload = match packet.key {
            None => packet.payload,
            Some(parity) => {
                let mut buf = BytesMut::from(&packet.payload[..]);
                match self.crypto.decrypt(seq.as_raw(), parity, &mut buf) {
                    Ok(()) => buf.freeze(),
                    Err(e) => {
                        trace!(socket_id = self.socket_id, %seq, error = %e, "undecryptable packet");
                        self.stats.count(|c| {
                            c.pkt_rcv_undecrypt += 1;
                            c.byte_rcv_undecrypt += len;
                        });
                        self.recv_buffer.drop_range(seq, seq);
                        return;
                    }
                }
            }
        };

        let release = self
            .settings
            .tsbpd
            .then(|| self.tsbpd.release_time(packet.timestamp));
        let outcome = self.recv_buffer.insert(IncomingPacket {
            seq,
            msg_number: packet.msg_number,
            boundary: packet.boundary,
            in_order: packet.in_order,
            timestamp: packet.timestamp,
            release,
            payload,
        });

        match outcome {
            InsertOutcome::Stored => {
                self.avg_payload.update(len as usize);
                self.ack_timer.on_packet();
                self.stats.count(|c| {
                    c.pkt_recv_unique += 1;
                    c.byte_recv_unique += len;
                });
            }
            InsertOutcome::Belated => self.stats.count(|c| {
                c.pkt_rcv_belated += 1;
                c.byte_rcv_belated += len;
            }),
            InsertOutcome::Duplicate | InsertOutcome::OutOfRange => {}
        }
    }

    /// Loss detection on arrival of `seq`
    fn track_loss(&mut self, seq: SeqNumber) {
        if seq.lt(self.rcv_next) {
            self.rcv_loss.on_recovered(seq);
            return;
        }

        let mut report = Vec::new();
        if seq.gt(self.rcv_next) {
            let gap = LossRange::new(self.rcv_next, seq - 1);
            let lost = gap.len() as u64;
            let bytes = self.avg_payload.bytes_for(lost as u32);
            self.stats.count(|c| {
                c.pkt_rcv_loss += lost;
                c.byte_rcv_loss += bytes;
            });
            debug!(socket_id = self.socket_id, from = %gap.start, to = %gap.end, "gap detected");
            report.extend(self.rcv_loss.on_gap(gap));
        } else {
            report.extend(self.rcv_loss.on_later_arrival());
        }
        self.rcv_next = seq.next();

        if !report.is_empty() {
            self.queue(ControlMessage::Nak(report));
        }
    }

    fn handle_drop_request(&mut self, msg_number: MsgNumber, first: SeqNumber, last: SeqNumber) {
        debug!(socket_id = self.socket_id, msg = %msg_number, %first, %last, "peer dropped message");
        let missing = self.recv_buffer.drop_range(first, last);
        for seq in LossRange::new(first, last).iter() {
            self.rcv_loss.on_recovered(seq);
        }
        if last.ge(self.rcv_next) {
            self.rcv_next = last.next();
        }
        if missing > 0 {
            let bytes = self.avg_payload.bytes_for(missing);
            self.stats.count(|c| {
                c.pkt_rcv_drop += missing as u64;
                c.byte_rcv_drop += bytes;
            });
        }
    }

    fn handle_ack(&mut self, journal: u32, info: AckInfo, now: Instant) {
        self.stats.count(|c| c.pkt_recv_ack += 1);
        self.control.push_back(ControlMessage::AckAck { journal });

        if info.ack_seq.gt(self.send_buffer.next_send()) {
            debug!(socket_id = self.socket_id, ack = %info.ack_seq, "ACK beyond anything sent");
            return;
        }

        let (acked, _) = self.send_buffer.acknowledge(info.ack_seq);
        self.snd_loss.acknowledge(info.ack_seq);
        self.rtt.set(info.rtt_us, info.rtt_var_us);
        if info.buffer_available > 0 {
            self.peer_window = info.buffer_available.min(self.settings.flow_window);
        }
        if info.estimated_link_capacity > 0 {
            self.peer_link_capacity = info.estimated_link_capacity;
        }
        self.congestion.on_ack(
            &AckEvent {
                acked,
                rtt_us: self.rtt.srtt(),
                receive_rate: info.packet_arrival_rate,
                link_capacity: info.estimated_link_capacity,
            },
            now,
        );
        self.exp.reset(now);
    }

    fn handle_nak(&mut self, ranges: Vec<LossRange>, now: Instant) {
        self.stats.count(|c| c.pkt_recv_nak += 1);
        let first = self.send_buffer.first_seq();
        let next = self.send_buffer.next_send();

        let mut accepted = Vec::with_capacity(ranges.len());
        for range in ranges {
            // Already acknowledged or never sent
            if range.end.lt(first) || range.start.ge(next) {
                continue;
            }
            let clamped = LossRange::new(range.start.max(first), range.end.min(next - 1));
            let lost = clamped.len() as u64;
            self.stats.count(|c| c.pkt_snd_loss += lost);
            self.snd_loss.add_range(clamped);
            accepted.push(clamped);
        }

        if !accepted.is_empty() {
            self.congestion.on_loss(&accepted, now);
        }
        self.exp.reset(now);
    }

    // ---- Timers ----

    /// Run every timer that is due
    pub fn on_timer(&mut self, now: Instant) {
        if self.state != LinkState::Connected {
            return;
        }

        if now.saturating_duration_since(self.last_recv) >= self.peer_idle_timeout {
            self.set_broken(BreakReason::PeerIdle);
            return;
        }

        self.send_ack(now);
        self.send_periodic_nak(now);
        self.check_exp(now);
        self.drop_sender_packets(now);
        self.drop_receiver_packets(now);

        if let Some(km) = self.crypto.poll_km_request(now, Duration::from_micros(self.rtt.srtt() as u64)) {
            debug!(socket_id = self.socket_id, "sending key material announcement");
            self.control.push_back(ControlMessage::KmRequest(km));
        }

        if self.bandwidth.max_bw == 0 {
            let ceiling = self.bandwidth.ceiling(self.input_rate.estimated_bandwidth_bps());
            self.congestion.set_max_bandwidth(ceiling);
        }

        if now.saturating_duration_since(self.last_send) >= KEEPALIVE_INTERVAL
            && self.control.is_empty()
        {
            self.control.push_back(ControlMessage::KeepAlive);
        }
    }

    fn send_ack(&mut self, now: Instant) {
        let ack_seq = self.recv_buffer.ack_seq();
        if !self.ack_timer.is_due(ack_seq, now) {
            self.ack_timer.skip(now);
            return;
        }

        let (pps, bps) = self.rate.receive_rate();
        let info = AckInfo {
            ack_seq,
            rtt_us: self.rtt.srtt(),
            rtt_var_us: self.rtt.rtt_var(),
            buffer_available: self.recv_buffer.available().max(2) as u32,
            packet_arrival_rate: pps,
            estimated_link_capacity: self.rate.link_capacity(),
            receive_rate_bps: bps,
        };
        let journal = self.ack_window.record(ack_seq, now);
        self.queue(ControlMessage::Ack { journal, info });
        self.ack_timer.sent(ack_seq, now);
    }

    fn send_periodic_nak(&mut self, now: Instant) {
        if !self.settings.nak_report || !self.nak_timer.poll(now, &self.rtt) {
            return;
        }
        if !self.rcv_loss.ranges().is_empty() {
            let ranges = self.rcv_loss.ranges().to_vec();
            self.queue(ControlMessage::Nak(ranges));
        }
    }

    fn check_exp(&mut self, now: Instant) {
        if now.saturating_duration_since(self.exp.last_feedback) < self.exp.period(&self.rtt) {
            return;
        }
        self.exp.last_feedback = now;

        let in_flight = self.send_buffer.in_flight();
        if in_flight == 0 {
            self.exp.count = 0;
            return;
        }
        self.exp.count += 1;

        if self.settings.nak_report {
            // Periodic NAK reports keep the receiver's losses coming
            self.control.push_back(ControlMessage::KeepAlive);
        } else {
            let first = self.send_buffer.first_seq();
            let last = self.send_buffer.next_send() - 1;
            debug!(socket_id = self.socket_id, in_flight, count = self.exp.count, "retransmission timeout");
            self.snd_loss.add_range(LossRange::new(first, last));
        }
        self.congestion.on_timeout(now);
    }

    /// Sender drop threshold: 1.25 × peer latency + 20 ms, at least 1 s
    fn snd_drop_threshold(&self) -> Duration {
        (self.settings.snd_latency * 5 / 4 + Duration::from_millis(20)).max(MIN_SND_DROP_THRESHOLD)
    }

    fn drop_sender_packets(&mut self, now: Instant) {
        let mut dropped = self.send_buffer.drop_expired(now);
        if self.settings.tlpktdrop && self.settings.tsbpd {
            dropped.extend(self.send_buffer.drop_too_late(now, self.snd_drop_threshold()));
        }
        for message in dropped {
            self.report_sender_drop(message);
        }
    }

    fn report_sender_drop(&mut self, message: DroppedMessage) {
        debug!(
            socket_id = self.socket_id,
            msg = %message.msg_number,
            first = %message.first,
            last = %message.last,
            "sender dropped message"
        );
        self.snd_loss.drop_range(LossRange::new(message.first, message.last));
        self.stats.count(|c| {
            c.pkt_snd_drop += message.packets as u64;
            c.byte_snd_drop += message.bytes as u64;
        });
        self.control.push_back(ControlMessage::DropReq {
            msg_number: message.msg_number,
            first: message.first,
            last: message.last,
        });
    }

    fn drop_receiver_packets(&mut self, now: Instant) {
        if !(self.settings.tsbpd && self.settings.tlpktdrop) {
            return;
        }
        while let Some(drop) = self.recv_buffer.drop_too_late(now) {
            warn!(
                socket_id = self.socket_id,
                first = %drop.first,
                last = %drop.last,
                packets = drop.packets,
                "receiver dropped too-late packets"
            );
            self.rcv_loss.declare_lost_up_to(drop.last);
            if drop.last.ge(self.rcv_next) {
                self.rcv_next = drop.last.next();
            }
            let bytes = self.avg_payload.bytes_for(drop.packets);
            self.stats.count(|c| {
                c.pkt_rcv_drop += drop.packets as u64;
                c.byte_rcv_drop += bytes;
            });
        }
    }

    /// Earliest instant at which the engine needs attention
    pub fn next_timeout(&self) -> Instant {
        let mut deadline = self.ack_timer.deadline();
        if self.has_data_to_send() {
            deadline = deadline.min(self.next_send_at);
        }
        if let Some(release) = self.recv_buffer.next_release() {
            if self.settings.tsbpd {
                deadline = deadline.min(release);
            }
        }
        deadline
    }

    fn has_data_to_send(&self) -> bool {
        !self.snd_loss.is_empty() || self.send_buffer.unsent() > 0
    }

    // ---- Output ----

    /// Next packet to put on the wire, if any is due
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Packet> {
        if let Some(message) = self.control.pop_front() {
            self.last_send = now;
            let packet = message.into_packet(self.timestamp(now), self.peer_socket_id);
            return Some(Packet::Control(packet));
        }

        if self.state != LinkState::Connected || now < self.next_send_at {
            return None;
        }

        let outgoing = self.next_data_packet(now)?;
        let packet = self.build_data_packet(outgoing, now)?;
        self.next_send_at = now + self.congestion.send_interval();
        self.last_send = now;
        Some(Packet::Data(packet))
    }

    fn next_data_packet(&mut self, now: Instant) -> Option<OutgoingPacket> {
        while let Some(seq) = self.snd_loss.pop_next() {
            if let Some(packet) = self.send_buffer.retransmit(seq, now) {
                return Some(packet);
            }
        }

        let window = self.peer_window.min(self.congestion.window());
        if self.send_buffer.in_flight() >= window {
            return None;
        }
        self.send_buffer.next_packet(now)
    }

    fn build_data_packet(&mut self, outgoing: OutgoingPacket, now: Instant) -> Option<DataPacket> {
        let len = outgoing.payload.len() as u64;
        let (key, payload) = if self.crypto.encrypts() {
            let mut buf = BytesMut::from(&outgoing.payload[..]);
            match self.crypto.encrypt(outgoing.seq.as_raw(), &mut buf, now) {
                Ok(key) => (key, buf.freeze()),
                Err(e) => {
                    warn!(socket_id = self.socket_id, seq = %outgoing.seq, error = %e, "encryption failed");
                    return None;
                }
            }
        } else {
            (None, outgoing.payload.clone())
        };

        if outgoing.retransmitted {
            self.stats.count(|c| {
                c.pkt_retrans += 1;
                c.byte_retrans += len;
            });
        } else {
            self.congestion.on_packet_sent(outgoing.seq, outgoing.payload.len());
            self.stats.count(|c| {
                c.pkt_sent_unique += 1;
                c.byte_sent_unique += len;
            });
        }
        self.stats.count(|c| {
            c.pkt_sent += 1;
            c.byte_sent += len;
        });

        Some(DataPacket {
            seq: outgoing.seq,
            boundary: outgoing.boundary,
            in_order: outgoing.in_order,
            key,
            retransmitted: outgoing.retransmitted,
            msg_number: outgoing.msg_number,
            timestamp: self.timestamp(outgoing.origin),
            dest_socket_id: self.peer_socket_id,
            payload,
        })
    }

    // ---- Statistics ----

    pub fn stats(&mut self, now: Instant, clear: bool) -> TraceStats {
        let mss = self.settings.mss;
        let ceiling = self
            .bandwidth
            .ceiling(self.input_rate.estimated_bandwidth_bps())
            .map_or(0.0, |bps| bps as f64 * 8.0 / 1_000_000.0);
        let instant = Instantaneous {
            us_pkt_snd_period: self.congestion.send_interval().as_secs_f64() * 1_000_000.0,
            pkt_flow_window: self.peer_window,
            pkt_congestion_window: self.congestion.window(),
            pkt_flight_size: self.send_buffer.in_flight(),
            ms_rtt: self.rtt.srtt() as f64 / 1000.0,
            mbps_bandwidth: self.peer_link_capacity as f64 * self.max_payload as f64 * 8.0
                / 1_000_000.0,
            byte_avail_snd_buf: (self.send_buffer.space() * self.max_payload) as u64,
            byte_avail_rcv_buf: (self.recv_buffer.available() * self.max_payload) as u64,
            mbps_max_bw: ceiling,
            byte_mss: mss,
            pkt_snd_buf: self.send_buffer.len() as u32,
            byte_snd_buf: self.send_buffer.bytes() as u64,
            ms_snd_buf: self.send_buffer.timespan(now).as_millis() as u64,
            ms_snd_tsbpd_delay: self.settings.snd_latency.as_millis() as u32,
            pkt_rcv_buf: self.recv_buffer.len() as u32,
            byte_rcv_buf: self.recv_buffer.bytes() as u64,
            ms_rcv_buf: self.recv_buffer.timespan_us() as u64 / 1000,
            ms_rcv_tsbpd_delay: self.settings.rcv_latency.as_millis() as u32,
            pkt_reorder_tolerance: self.reorder_tolerance,
        };
        self.stats.snapshot(instant, now, clear)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::CongestionKind;
    use srt_crypto::CryptoConfig;

    fn settings(isn: u32, peer_isn: u32, peer_socket_id: u32) -> Negotiated {
        Negotiated {
            peer_socket_id,
            peer_version: crate::handshake::SRT_VERSION,
            snd_isn: SeqNumber::new(isn),
            rcv_isn: SeqNumber::new(peer_isn),
            mss: 1500,
            flow_window: 8192,
            rcv_latency: Duration::from_millis(120),
            snd_latency: Duration::from_millis(120),
            tsbpd: true,
            tlpktdrop: true,
            nak_report: true,
            message_api: true,
            congestion: CongestionKind::Live,
            stream_id: None,
        }
    }

    fn pair(now: Instant, opts: &SocketOptions) -> (Connection, Connection) {
        let a = Connection::new(
            1,
            "127.0.0.1:2000".parse().unwrap(),
            opts,
            settings(100, 500, 2),
            CryptoControl::new(CryptoConfig::default()).unwrap(),
            (now, 0),
            now,
            now,
        );
        let b = Connection::new(
            2,
            "127.0.0.1:1000".parse().unwrap(),
            opts,
            settings(500, 100, 1),
            CryptoControl::new(CryptoConfig::default()).unwrap(),
            (now, 0),
            now,
            now,
        );
        (a, b)
    }

    /// Move every due packet from `from` to `to`, dropping sequence numbers
    /// listed in `lose`
    fn pump(from: &mut Connection, to: &mut Connection, now: Instant, lose: &[u32]) -> usize {
        let mut moved = 0;
        while let Some(packet) = from.poll_transmit(now) {
            if let Packet::Data(data) = &packet {
                if lose.contains(&data.seq.as_raw()) {
                    continue;
                }
            }
            // Go through the wire format
            let packet = Packet::from_bytes(&packet.to_bytes()).unwrap();
            to.handle_packet(packet, now);
            moved += 1;
        }
        moved
    }

    #[test]
    fn test_status_transitions() {
        use SocketStatus::*;
        assert!(Init.can_transition(Opened));
        assert!(Connecting.can_transition(Connected));
        assert!(Connected.can_transition(Broken));
        assert!(!Closed.can_transition(Connected));
        assert!(!Broken.can_transition(Connected));
        assert!(!Listening.can_transition(Connected));
        assert_eq!(Connected as u32, 5);
    }

    #[test]
    fn test_message_delivery_after_latency() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now, &SocketOptions::default());

        a.send_message(b"hello", None, true, None, now).unwrap();
        pump(&mut a, &mut b, now, &[]);

        assert!(b.recv_message(now).is_none());
        let later = now + Duration::from_millis(121);
        let delivered = b.recv_message(later).unwrap();
        assert_eq!(&delivered.payload[..], b"hello");
    }

    #[test]
    fn test_loss_is_nacked_and_recovered() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now, &SocketOptions::default());

        for i in 0..5u8 {
            a.send_message(&[i; 100], None, true, None, now).unwrap();
        }
        pump(&mut a, &mut b, now, &[102]);
        assert_eq!(b.stats(now, false).total.pkt_rcv_loss, 1);

        // The receiver NAKed right away; the sender retransmits
        pump(&mut b, &mut a, now, &[]);
        pump(&mut a, &mut b, now, &[]);

        let later = now + Duration::from_millis(200);
        let payloads: Vec<u8> = std::iter::from_fn(|| b.recv_message(later))
            .map(|d| d.payload[0])
            .collect();
        assert_eq!(payloads, vec![0, 1, 2, 3, 4]);
        assert_eq!(a.stats(now, false).total.pkt_retrans, 1);
    }

    #[test]
    fn test_ack_releases_send_buffer() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now, &SocketOptions::default());

        a.send_message(b"one", None, true, None, now).unwrap();
        a.send_message(b"two", None, true, None, now).unwrap();
        pump(&mut a, &mut b, now, &[]);

        let tick = now + Duration::from_millis(11);
        b.on_timer(tick);
        pump(&mut b, &mut a, tick, &[]);
        assert!(a.is_flushed());
        assert_eq!(a.stats(tick, false).total.pkt_recv_ack, 1);

        // ACKACK gives the receiver an RTT sample
        pump(&mut a, &mut b, tick, &[]);
        assert!(b.rtt.has_samples());
    }

    #[test]
    fn test_receiver_drops_too_late() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now, &SocketOptions::default());

        for i in 0..3u8 {
            a.send_message(&[i; 10], None, true, None, now).unwrap();
        }
        pump(&mut a, &mut b, now, &[100]);

        let later = now + Duration::from_millis(130);
        b.last_recv = later;
        b.on_timer(later);
        let stats = b.stats(later, false);
        assert_eq!(stats.total.pkt_rcv_drop, 1);
        assert_eq!(b.recv_message(later).unwrap().payload[0], 1);
    }

    #[test]
    fn test_sender_drop_sends_dropreq() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now, &SocketOptions::default());

        a.send_message(b"stale", None, true, None, now).unwrap();
        pump(&mut a, &mut b, now, &[100]);

        let later = now + Duration::from_millis(1100);
        a.last_recv = later;
        a.on_timer(later);
        assert_eq!(a.stats(later, false).total.pkt_snd_drop, 1);
        assert!(a.is_flushed());

        b.last_recv = later;
        pump(&mut a, &mut b, later, &[]);
        a.send_message(b"fresh", None, true, None, later).unwrap();
        pump(&mut a, &mut b, later, &[]);
        let delivered = b.recv_message(later + Duration::from_millis(200)).unwrap();
        assert_eq!(&delivered.payload[..], b"fresh");
    }

    #[test]
    fn test_message_ttl_drop() {
        let now = Instant::now();
        let (mut a, _) = pair(now, &SocketOptions::default());
        a.send_message(b"short-lived", Some(Duration::from_millis(50)), true, None, now)
            .unwrap();

        let later = now + Duration::from_millis(60);
        a.on_timer(later);
        assert_eq!(a.stats(later, false).total.pkt_snd_drop, 1);
        // Only the DROPREQ (and maybe a keep-alive) goes out, no data
        while let Some(packet) = a.poll_transmit(later) {
            assert!(packet.is_control());
        }
    }

    #[test]
    fn test_peer_idle_breaks() {
        let now = Instant::now();
        let (mut a, _) = pair(now, &SocketOptions::default());
        a.on_timer(now + Duration::from_secs(6));
        assert_eq!(a.state(), LinkState::Broken(BreakReason::PeerIdle));
        assert_eq!(
            a.send_message(b"x", None, true, None, now).unwrap_err(),
            SrtError::ConnectionLost
        );
    }

    #[test]
    fn test_shutdown_breaks_peer() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now, &SocketOptions::default());
        a.close();
        pump(&mut a, &mut b, now, &[]);
        assert_eq!(b.state(), LinkState::Broken(BreakReason::PeerClosed));
    }

    #[test]
    fn test_keepalive_after_silence() {
        let now = Instant::now();
        let (mut a, _) = pair(now, &SocketOptions::default());
        let later = now + KEEPALIVE_INTERVAL;
        a.last_recv = later;
        a.on_timer(later);
        let mut saw_keepalive = false;
        while let Some(Packet::Control(control)) = a.poll_transmit(later) {
            saw_keepalive |= control.control_type == crate::packet::ControlType::KeepAlive;
        }
        assert!(saw_keepalive);
    }

    #[test]
    fn test_live_message_size_limit() {
        let now = Instant::now();
        let (mut a, _) = pair(now, &SocketOptions::default());
        let big = vec![0u8; 1317];
        assert_eq!(
            a.send_message(&big, None, true, None, now).unwrap_err(),
            SrtError::LargeMessage
        );
    }

    #[test]
    fn test_undersized_mss_does_not_underflow() {
        let now = Instant::now();
        let mut tiny = settings(100, 500, 2);
        tiny.mss = 20;
        let conn = Connection::new(
            1,
            "127.0.0.1:2000".parse().unwrap(),
            &SocketOptions::default(),
            tiny,
            CryptoControl::new(CryptoConfig::default()).unwrap(),
            (now, 0),
            now,
            now,
        );
        assert_eq!(conn.max_payload(), 1);
    }

    #[test]
    fn test_duplicate_conclusion_repeats_reply() {
        let now = Instant::now();
        let (mut a, _) = pair(now, &SocketOptions::default());
        let reply = Handshake::new(HandshakeType::Conclusion, 1, "127.0.0.1".parse().unwrap());
        a.set_handshake_reply(reply.clone());

        let conclusion = ControlMessage::Handshake(Handshake::new(
            HandshakeType::Conclusion,
            2,
            "127.0.0.1".parse().unwrap(),
        ));
        a.handle_packet(Packet::Control(conclusion.into_packet(0, 1)), now);
        match a.poll_transmit(now) {
            Some(Packet::Control(control)) => {
                assert_eq!(Handshake::from_bytes(&control.body).unwrap(), reply);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
