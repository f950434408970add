//! Circular buffers for send and receive packet storage
//!
//! SRT uses circular buffers indexed by sequence numbers. Slot `i` of either
//! buffer holds the packet with sequence number `first + i`.

use crate::packet::{MsgNumber, PacketBoundary};
use crate::sequence::SeqNumber;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Buffer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Buffer is full")]
    Full,

    #[error("Message of {size} bytes does not fit a buffer of {capacity} bytes")]
    MessageTooLarge { size: usize, capacity: usize },

    #[error("Empty message")]
    EmptyMessage,
}

/// Per-message sending parameters
#[derive(Debug, Clone, Copy)]
pub struct MessageOptions {
    /// Drop the message if not delivered within this time
    pub ttl: Option<Duration>,
    /// Message must be delivered in order
    pub in_order: bool,
    /// Local time the data was produced
    pub origin: Instant,
}

/// Stored packet with metadata
#[derive(Debug, Clone)]
struct SendEntry {
    msg_number: MsgNumber,
    boundary: PacketBoundary,
    in_order: bool,
    payload: Bytes,
    origin: Instant,
    ttl: Option<Duration>,
    /// Number of times this packet has been sent
    send_count: u32,
    last_sent: Option<Instant>,
    /// Given up on (TTL); kept until acknowledged so indices stay stable
    dropped: bool,
}

/// A packet ready to go on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPacket {
    pub seq: SeqNumber,
    pub msg_number: MsgNumber,
    pub boundary: PacketBoundary,
    pub in_order: bool,
    pub payload: Bytes,
    pub origin: Instant,
    pub retransmitted: bool,
}

/// A message the sender gave up on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DroppedMessage {
    pub msg_number: MsgNumber,
    pub first: SeqNumber,
    pub last: SeqNumber,
    pub packets: u32,
    pub bytes: usize,
}

/// Circular send buffer
///
/// Stores packets from the moment the application hands them over until the
/// peer acknowledges them.
#[derive(Debug)]
pub struct SendBuffer {
    entries: VecDeque<SendEntry>,
    /// Sequence number of `entries[0]`
    first_seq: SeqNumber,
    /// Next packet never sent
    next_send: SeqNumber,
    next_msg: MsgNumber,
    /// Maximum number of packets to store
    capacity: usize,
    bytes: usize,
}

impl SendBuffer {
    /// Create a new send buffer
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of packets to store
    /// * `initial_seq` - Sequence number of the first packet
    pub fn new(capacity: usize, initial_seq: SeqNumber) -> Self {
        SendBuffer {
            entries: VecDeque::with_capacity(capacity.min(8192)),
            first_seq: initial_seq,
            next_send: initial_seq,
            next_msg: MsgNumber::new(1),
            capacity,
            bytes: 0,
        }
    }

    /// Number of packets a message of `len` bytes needs
    pub fn packets_needed(len: usize, max_payload: usize) -> usize {
        let max_payload = max_payload.max(1);
        (len + max_payload - 1) / max_payload
    }

    /// Split a message into packets and queue them
    ///
    /// The whole message is queued or nothing is.
    pub fn push_message(
        &mut self,
        data: &[u8],
        max_payload: usize,
        opts: MessageOptions,
    ) -> Result<(SeqNumber, MsgNumber), BufferError> {
        if data.is_empty() {
            return Err(BufferError::EmptyMessage);
        }

        let count = Self::packets_needed(data.len(), max_payload);
        if count > self.capacity {
            return Err(BufferError::MessageTooLarge {
                size: data.len(),
                capacity: self.capacity * max_payload,
            });
        }
        if count > self.space() {
            return Err(BufferError::Full);
        }

        let msg_number = self.next_msg;
        self.next_msg = msg_number.next();
        let first = self.next_seq();

        for (index, chunk) in data.chunks(max_payload).enumerate() {
            self.bytes += chunk.len();
            self.entries.push_back(SendEntry {
                msg_number,
                boundary: PacketBoundary::for_position(index, count),
                in_order: opts.in_order,
                payload: Bytes::copy_from_slice(chunk),
                origin: opts.origin,
                ttl: opts.ttl,
                send_count: 0,
                last_sent: None,
                dropped: false,
            });
        }

        Ok((first, msg_number))
    }

    fn offset(&self, seq: SeqNumber) -> Option<usize> {
        let offset = self.first_seq.distance_to(seq);
        (offset >= 0 && (offset as usize) < self.entries.len()).then_some(offset as usize)
    }

    fn outgoing(&mut self, offset: usize, now: Instant) -> OutgoingPacket {
        let seq = self.first_seq + offset as u32;
        let entry = &mut self.entries[offset];
        entry.send_count += 1;
        entry.last_sent = Some(now);
        OutgoingPacket {
            seq,
            msg_number: entry.msg_number,
            boundary: entry.boundary,
            in_order: entry.in_order,
            payload: entry.payload.clone(),
            origin: entry.origin,
            retransmitted: entry.send_count > 1,
        }
    }

    /// Take the next packet that was never sent
    pub fn next_packet(&mut self, now: Instant) -> Option<OutgoingPacket> {
        loop {
            let offset = self.offset(self.next_send)?;
            self.next_send = self.next_send.next();
            if !self.entries[offset].dropped {
                return Some(self.outgoing(offset, now));
            }
        }
    }

    /// Fetch a packet for retransmission
    pub fn retransmit(&mut self, seq: SeqNumber, now: Instant) -> Option<OutgoingPacket> {
        let offset = self.offset(seq)?;
        if self.entries[offset].dropped || self.entries[offset].send_count == 0 {
            return None;
        }
        Some(self.outgoing(offset, now))
    }

    /// Remove everything before `ack_seq`; returns (packets, bytes) released
    pub fn acknowledge(&mut self, ack_seq: SeqNumber) -> (u32, usize) {
        let mut packets = 0;
        let mut bytes = 0;
        while self.first_seq.lt(ack_seq) {
            let Some(entry) = self.entries.pop_front() else {
                break;
            };
            packets += 1;
            bytes += entry.payload.len();
            self.first_seq = self.first_seq.next();
        }
        self.bytes -= bytes;
        if self.next_send.lt(self.first_seq) {
            self.next_send = self.first_seq;
        }
        (packets, bytes)
    }

    fn message_bounds(&self, offset: usize) -> (usize, usize) {
        let msg = self.entries[offset].msg_number;
        let mut start = offset;
        while start > 0 && self.entries[start - 1].msg_number == msg {
            start -= 1;
        }
        let mut end = offset;
        while end + 1 < self.entries.len() && self.entries[end + 1].msg_number == msg {
            end += 1;
        }
        (start, end)
    }

    fn describe(&self, start: usize, end: usize) -> DroppedMessage {
        DroppedMessage {
            msg_number: self.entries[start].msg_number,
            first: self.first_seq + start as u32,
            last: self.first_seq + end as u32,
            packets: (end - start + 1) as u32,
            bytes: self.entries.range(start..=end).map(|e| e.payload.len()).sum(),
        }
    }

    /// Drop whole messages from the front whose origin is older than `threshold`
    ///
    /// Used for sender-side too-late packet drop in live mode.
    pub fn drop_too_late(&mut self, now: Instant, threshold: Duration) -> Vec<DroppedMessage> {
        let mut dropped = Vec::new();
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.origin) <= threshold {
                break;
            }
            let (_, end) = self.message_bounds(0);
            let message = self.describe(0, end);
            let was_dropped = front.dropped;
            for _ in 0..=end {
                if let Some(entry) = self.entries.pop_front() {
                    self.bytes -= entry.payload.len();
                }
            }
            self.first_seq = self.first_seq + (end as u32 + 1);
            if !was_dropped {
                dropped.push(message);
            }
        }
        if self.next_send.lt(self.first_seq) {
            self.next_send = self.first_seq;
        }
        dropped
    }

    /// Mark messages whose TTL expired as dropped
    pub fn drop_expired(&mut self, now: Instant) -> Vec<DroppedMessage> {
        let mut dropped = Vec::new();
        let mut offset = 0;
        while offset < self.entries.len() {
            let entry = &self.entries[offset];
            let (start, end) = self.message_bounds(offset);
            let expired = !entry.dropped
                && entry
                    .ttl
                    .map_or(false, |ttl| now.saturating_duration_since(entry.origin) > ttl);
            if expired {
                dropped.push(self.describe(start, end));
                for e in self.entries.range_mut(start..=end) {
                    e.dropped = true;
                }
            }
            offset = end + 1;
        }
        dropped
    }

    /// Check whether `seq` was dropped by the sender
    pub fn is_dropped(&self, seq: SeqNumber) -> bool {
        self.offset(seq).map_or(false, |o| self.entries[o].dropped)
    }

    /// Get the number of packets currently in the buffer
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Payload bytes currently buffered
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Get available space in the buffer
    pub fn space(&self) -> usize {
        self.capacity.saturating_sub(self.entries.len())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sequence number of the oldest unacknowledged packet
    pub fn first_seq(&self) -> SeqNumber {
        self.first_seq
    }

    /// Sequence number the next queued packet gets
    pub fn next_seq(&self) -> SeqNumber {
        self.first_seq + self.entries.len() as u32
    }

    /// Sequence number of the next packet never sent
    pub fn next_send(&self) -> SeqNumber {
        self.next_send
    }

    /// Packets sent but not acknowledged
    pub fn in_flight(&self) -> u32 {
        self.first_seq.distance_to(self.next_send).max(0) as u32
    }

    /// Packets never sent
    pub fn unsent(&self) -> usize {
        self.entries.len() - self.in_flight() as usize
    }

    /// Time between the oldest buffered packet and now
    pub fn timespan(&self, now: Instant) -> Duration {
        self.entries
            .front()
            .map_or(Duration::ZERO, |e| now.saturating_duration_since(e.origin))
    }

    /// Check if a sequence number is buffered
    pub fn contains(&self, seq: SeqNumber) -> bool {
        self.offset(seq).is_some()
    }
}

/// Received packet entry
#[derive(Debug, Clone)]
struct RecvEntry {
    msg_number: MsgNumber,
    boundary: PacketBoundary,
    in_order: bool,
    timestamp: u32,
    /// TSBPD release time, `None` when TSBPD is off
    release: Option<Instant>,
    payload: Bytes,
}

#[derive(Debug, Clone)]
enum Slot {
    Empty,
    Packet(RecvEntry),
    /// Delivered out of order or dropped
    Gone,
}

/// Data packet as stored by the receiver
#[derive(Debug, Clone)]
pub struct IncomingPacket {
    pub seq: SeqNumber,
    pub msg_number: MsgNumber,
    pub boundary: PacketBoundary,
    pub in_order: bool,
    pub timestamp: u32,
    pub release: Option<Instant>,
    pub payload: Bytes,
}

/// Result of storing an arriving packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Stored,
    /// Already have it
    Duplicate,
    /// Behind the delivery point: already delivered or declared lost
    Belated,
    /// Too far ahead for the buffer
    OutOfRange,
}

/// A message handed to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub payload: Bytes,
    pub msg_number: MsgNumber,
    pub first_seq: SeqNumber,
    /// Origin timestamp of the first packet
    pub timestamp: u32,
}

/// Range given up on by the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropInfo {
    pub first: SeqNumber,
    pub last: SeqNumber,
    /// Packets that never arrived (or arrived as unusable fragments)
    pub packets: u32,
}

/// Circular receive buffer
///
/// Handles out-of-order packet reception, message reassembly and
/// TSBPD-paced release. Consumed slots at the front are trimmed by every
/// public operation, so `slots[0]` is never [`Slot::Gone`] between calls.
#[derive(Debug)]
pub struct ReceiveBuffer {
    slots: VecDeque<Slot>,
    /// Sequence number of `slots[0]`, the delivery point
    start: SeqNumber,
    capacity: usize,
    /// Bytes of the front packet already read in stream mode
    stream_offset: usize,
    packets: usize,
    bytes: usize,
}

impl ReceiveBuffer {
    /// Create a new receive buffer
    pub fn new(capacity: usize, initial_seq: SeqNumber) -> Self {
        ReceiveBuffer {
            slots: VecDeque::with_capacity(capacity.min(8192)),
            start: initial_seq,
            capacity,
            stream_offset: 0,
            packets: 0,
            bytes: 0,
        }
    }

    /// Store an arriving packet
    pub fn insert(&mut self, packet: IncomingPacket) -> InsertOutcome {
        let offset = self.start.distance_to(packet.seq);
        if offset < 0 {
            return InsertOutcome::Belated;
        }
        let offset = offset as usize;
        if offset >= self.capacity {
            return InsertOutcome::OutOfRange;
        }

        while self.slots.len() <= offset {
            self.slots.push_back(Slot::Empty);
        }

        match self.slots[offset] {
            Slot::Empty => {
                self.packets += 1;
                self.bytes += packet.payload.len();
                self.slots[offset] = Slot::Packet(RecvEntry {
                    msg_number: packet.msg_number,
                    boundary: packet.boundary,
                    in_order: packet.in_order,
                    timestamp: packet.timestamp,
                    release: packet.release,
                    payload: packet.payload,
                });
                InsertOutcome::Stored
            }
            Slot::Packet(_) => InsertOutcome::Duplicate,
            Slot::Gone => InsertOutcome::Belated,
        }
    }

    /// First sequence number not yet received (the ACK position)
    pub fn ack_seq(&self) -> SeqNumber {
        let filled = self
            .slots
            .iter()
            .position(|s| matches!(s, Slot::Empty))
            .unwrap_or(self.slots.len());
        self.start + filled as u32
    }

    /// Sequence number of the delivery point
    pub fn start_seq(&self) -> SeqNumber {
        self.start
    }

    /// Check whether `seq` is held or was already consumed
    pub fn has(&self, seq: SeqNumber) -> bool {
        let offset = self.start.distance_to(seq);
        offset < 0
            || self
                .slots
                .get(offset as usize)
                .map_or(false, |s| !matches!(s, Slot::Empty))
    }

    fn entry(&self, offset: usize) -> Option<&RecvEntry> {
        match self.slots.get(offset) {
            Some(Slot::Packet(entry)) => Some(entry),
            _ => None,
        }
    }

    fn take(&mut self, offset: usize) -> Option<RecvEntry> {
        let slot = self.slots.get_mut(offset)?;
        match std::mem::replace(slot, Slot::Gone) {
            Slot::Packet(entry) => {
                self.packets -= 1;
                self.bytes -= entry.payload.len();
                Some(entry)
            }
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Advance the delivery point over consumed slots
    fn trim_front(&mut self) {
        while matches!(self.slots.front(), Some(Slot::Gone)) {
            self.slots.pop_front();
            self.start = self.start.next();
            self.stream_offset = 0;
        }
    }

    /// Offset of the last packet of the complete message starting at `offset`
    fn complete_message_end(&self, offset: usize) -> Option<usize> {
        let first = self.entry(offset)?;
        if !first.boundary.is_first() {
            return None;
        }
        let mut end = offset;
        loop {
            let entry = self.entry(end)?;
            if entry.msg_number != first.msg_number {
                return None;
            }
            if entry.boundary.is_last() {
                return Some(end);
            }
            end += 1;
        }
    }

    fn extract(&mut self, start: usize, end: usize) -> Option<Delivery> {
        let first_seq = self.start + start as u32;
        let mut payload = BytesMut::new();
        let mut head = None;
        for offset in start..=end {
            let entry = self.take(offset)?;
            if head.is_none() {
                head = Some((entry.msg_number, entry.timestamp));
            }
            payload.extend_from_slice(&entry.payload);
        }
        let (msg_number, timestamp) = head?;
        self.trim_front();
        Some(Delivery {
            payload: payload.freeze(),
            msg_number,
            first_seq,
            timestamp,
        })
    }

    /// Discard front packets that cannot start a message
    ///
    /// Returns the number discarded.
    fn skip_partial_head(&mut self) -> u32 {
        let mut skipped = 0;
        while let Some(entry) = self.entry(0) {
            if entry.boundary.is_first() {
                break;
            }
            self.take(0);
            self.trim_front();
            skipped += 1;
        }
        skipped
    }

    fn head_ready(&self, now: Instant, tsbpd: bool) -> Option<usize> {
        let end = self.complete_message_end(0)?;
        if tsbpd {
            let release = self.entry(0)?.release?;
            if release > now {
                return None;
            }
        }
        Some(end)
    }

    fn out_of_order_ready(&self) -> Option<(usize, usize)> {
        (1..self.slots.len()).find_map(|offset| {
            let entry = self.entry(offset)?;
            if entry.in_order || !entry.boundary.is_first() {
                return None;
            }
            self.complete_message_end(offset).map(|end| (offset, end))
        })
    }

    /// Take the next deliverable message
    ///
    /// With `tsbpd` only the head message is eligible, once its release time
    /// passed. Without it, complete messages not requiring order may overtake
    /// an incomplete head.
    pub fn pop_message(&mut self, now: Instant, tsbpd: bool) -> Option<Delivery> {
        self.trim_front();
        if let Some(end) = self.head_ready(now, tsbpd) {
            return self.extract(0, end);
        }
        if !tsbpd {
            if let Some((start, end)) = self.out_of_order_ready() {
                return self.extract(start, end);
            }
        }
        None
    }

    /// Whether [`pop_message`](Self::pop_message) would return something
    pub fn has_message(&self, now: Instant, tsbpd: bool) -> bool {
        self.head_ready(now, tsbpd).is_some() || (!tsbpd && self.out_of_order_ready().is_some())
    }

    /// Read contiguous bytes in stream mode
    pub fn read_stream(&mut self, buf: &mut [u8], now: Instant, tsbpd: bool) -> usize {
        let mut written = 0;
        self.trim_front();
        while written < buf.len() {
            let Some(entry) = self.entry(0) else {
                break;
            };
            if tsbpd && entry.release.map_or(true, |r| r > now) {
                break;
            }

            let available = &entry.payload[self.stream_offset..];
            let n = available.len().min(buf.len() - written);
            buf[written..written + n].copy_from_slice(&available[..n]);
            written += n;

            if self.stream_offset + n == entry.payload.len() {
                self.take(0);
                self.trim_front();
            } else {
                self.stream_offset += n;
            }
        }
        written
    }

    /// Whether stream data is readable
    pub fn has_stream_data(&self, now: Instant, tsbpd: bool) -> bool {
        self.slots
            .iter()
            .find(|s| !matches!(s, Slot::Gone))
            .map_or(false, |s| match s {
                Slot::Packet(e) => !tsbpd || e.release.map_or(false, |r| r <= now),
                _ => false,
            })
    }

    /// Release time of the first held packet
    pub fn next_release(&self) -> Option<Instant> {
        self.slots.iter().find_map(|s| match s {
            Slot::Packet(e) => e.release,
            _ => None,
        })
    }

    /// Give up on a gap blocking delivery
    ///
    /// When the head is missing (or incomplete) and a later packet's release
    /// time has passed, everything before that packet is dropped.
    pub fn drop_too_late(&mut self, now: Instant) -> Option<DropInfo> {
        self.trim_front();
        let hole = self.slots.iter().position(|s| matches!(s, Slot::Empty))?;
        if self.head_ready(now, true).is_some() {
            return None;
        }

        let target = (hole + 1..self.slots.len()).find(|&offset| {
            self.entry(offset)
                .and_then(|e| e.release)
                .map_or(false, |r| r <= now)
        })?;

        let first = self.start;
        let mut packets = 0;
        for offset in 0..target {
            match self.slots[offset] {
                Slot::Empty => packets += 1,
                Slot::Packet(_) => {
                    self.take(offset);
                    packets += 1;
                }
                Slot::Gone => {}
            }
            self.slots[offset] = Slot::Gone;
        }
        self.trim_front();
        packets += self.skip_partial_head();

        Some(DropInfo {
            first,
            last: self.start - 1,
            packets,
        })
    }

    /// Apply a sender drop request for `first..=last`
    ///
    /// Returns the number of missing packets given up on.
    pub fn drop_range(&mut self, first: SeqNumber, last: SeqNumber) -> u32 {
        let from = self.start.distance_to(first).max(0) as usize;
        let to = self.start.distance_to(last);
        if to < 0 {
            return 0;
        }
        let to = (to as usize).min(self.capacity - 1);

        while self.slots.len() <= to {
            self.slots.push_back(Slot::Empty);
        }

        let mut missing = 0;
        for offset in from..=to {
            match self.slots[offset] {
                Slot::Empty => missing += 1,
                Slot::Packet(_) => {
                    self.take(offset);
                }
                Slot::Gone => {}
            }
            self.slots[offset] = Slot::Gone;
        }
        self.trim_front();
        missing
    }

    /// Packets held
    pub fn len(&self) -> usize {
        self.packets
    }

    pub fn is_empty(&self) -> bool {
        self.packets == 0
    }

    /// Payload bytes held
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Free packet slots, advertised to the peer as the flow window
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.slots.len())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Timestamp span of held packets in microseconds
    pub fn timespan_us(&self) -> u32 {
        let mut stamps = self.slots.iter().filter_map(|s| match s {
            Slot::Packet(e) => Some(e.timestamp),
            _ => None,
        });
        match (stamps.next(), stamps.last()) {
            (Some(first), Some(last)) => last.wrapping_sub(first),
            _ => 0,
        }
    }
}
