//! Socket core
//!
//! One [`SocketCore`] per SRT socket. All of its state sits behind a single
//! mutex; the condition variable is signalled on every change a blocked
//! caller may be waiting for (data, buffer space, connection, closing).

use crate::engine::Registry;
use crate::multiplexer::Multiplexer;
use parking_lot::{Condvar, Mutex, MutexGuard};
use srt_crypto::CryptoControl;
use srt_io::{EventFlags, EventSource, Notifier};
use srt_protocol::connection::{Connection, LinkState, SocketStatus};
use srt_protocol::control::ControlMessage;
use srt_protocol::error::SrtError;
use srt_protocol::handshake::{Handshake, RejectReason};
use srt_protocol::negotiation::{
    self, CallerHandshake, HandshakeStep, ListenerHandshake, ListenerStep, RendezvousHandshake,
    HANDSHAKE_RESEND_INTERVAL, RENDEZVOUS_TIMEOUT_FACTOR,
};
use srt_protocol::options::SocketOptions;
use srt_protocol::packet::{MsgNumber, Packet, PacketBoundary};
use srt_protocol::sequence::SeqNumber;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Granularity of waits that also watch for a deadline set elsewhere
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Shortest sleep while waiting on a protocol timer
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Per-message control block for `sendmsg2`/`recvmsg2`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgCtrl {
    /// Reserved
    pub flags: u32,
    /// Drop the message if undelivered after this long (sending)
    pub ttl: Option<Duration>,
    /// Deliver in order (sending)
    pub in_order: bool,
    /// Position of the returned data within its message (receiving)
    pub boundary: PacketBoundary,
    /// Origin time: set by the sender, reported to the receiver
    pub src_time: Option<Instant>,
    /// Sequence number of the first packet of the message
    pub pktseq: Option<SeqNumber>,
    pub msgno: Option<MsgNumber>,
}

impl Default for MsgCtrl {
    fn default() -> Self {
        MsgCtrl {
            flags: 0,
            ttl: None,
            in_order: false,
            boundary: PacketBoundary::Solo,
            src_time: None,
            pktseq: None,
            msgno: None,
        }
    }
}

pub(crate) struct Listener {
    handshake: ListenerHandshake,
    backlog: usize,
    pub(crate) queue: VecDeque<u32>,
    /// (peer address, peer socket id) to the socket accepted for it
    accepted: HashMap<(SocketAddr, u32), u32>,
}

enum Driver {
    Caller(CallerHandshake),
    Rendezvous(RendezvousHandshake),
}

pub(crate) struct Connecting {
    driver: Driver,
    crypto: CryptoControl,
    deadline: Instant,
    next_resend: Instant,
}

pub(crate) enum Role {
    Idle,
    Listener(Listener),
    Connecting(Box<Connecting>),
    Connected(Box<Connection>),
}

pub(crate) struct SocketState {
    pub(crate) status: SocketStatus,
    pub(crate) opts: SocketOptions,
    pub(crate) mux: Option<Arc<Multiplexer>>,
    pub(crate) peer_addr: Option<SocketAddr>,
    /// Origin of this socket's packet timestamps
    origin: Instant,
    pub(crate) role: Role,
    /// Why the connection failed or broke
    failure: Option<SrtError>,
    /// Readiness last reported to waiters
    events: EventFlags,
}

impl SocketState {
    fn timestamp(&self, now: Instant) -> u32 {
        srt_io::srt_timestamp(self.origin, now)
    }

    pub(crate) fn connection(&self) -> Option<&Connection> {
        match &self.role {
            Role::Connected(conn) => Some(conn),
            _ => None,
        }
    }

    pub(crate) fn connection_mut(&mut self) -> Result<&mut Connection, SrtError> {
        match &mut self.role {
            Role::Connected(conn) => Ok(conn),
            _ => Err(SrtError::NoConnection),
        }
    }

    /// Error for an operation that needs a live connection
    fn link_error(&self) -> SrtError {
        match self.status {
            SocketStatus::Broken => self.failure.clone().unwrap_or(SrtError::ConnectionLost),
            SocketStatus::Closing | SocketStatus::Closed | SocketStatus::NonExist => {
                SrtError::Closing
            }
            _ => SrtError::NoConnection,
        }
    }

    pub(crate) fn readiness(&self, now: Instant) -> EventFlags {
        let mut events = EventFlags::NONE;
        match &self.role {
            Role::Listener(listener) if !listener.queue.is_empty() => events |= EventFlags::IN,
            Role::Connected(conn) => {
                if conn.is_readable(now) {
                    events |= EventFlags::IN;
                }
                if conn.is_writable() {
                    events |= EventFlags::OUT;
                }
            }
            _ => {}
        }
        if matches!(
            self.status,
            SocketStatus::Broken | SocketStatus::Closing | SocketStatus::Closed
        ) {
            events |= EventFlags::ERR;
        }
        events
    }
}

pub(crate) struct SocketCore {
    id: u32,
    state: Mutex<SocketState>,
    cond: Condvar,
    notifier: Arc<Notifier>,
}

impl SocketCore {
    pub(crate) fn new(id: u32, opts: SocketOptions, notifier: Arc<Notifier>) -> Arc<Self> {
        Arc::new(SocketCore {
            id,
            state: Mutex::new(SocketState {
                status: SocketStatus::Init,
                opts,
                mux: None,
                peer_addr: None,
                origin: Instant::now(),
                role: Role::Idle,
                failure: None,
                events: EventFlags::NONE,
            }),
            cond: Condvar::new(),
            notifier,
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SocketState> {
        self.state.lock()
    }

    /// Wake blocked callers and epoll waiters
    pub(crate) fn notify(&self) {
        self.cond.notify_all();
        self.notifier.notify();
    }

    pub(crate) fn set_status(&self, state: &mut SocketState, to: SocketStatus) {
        if state.status == to {
            return;
        }
        if !state.status.can_transition(to) {
            warn!(socket_id = self.id, from = ?state.status, ?to, "refusing state change");
            return;
        }
        debug!(socket_id = self.id, from = ?state.status, ?to, "socket state");
        state.status = to;
        self.notify();
    }

    /// Recompute readiness and wake waiters if it changed
    fn refresh(&self, state: &mut SocketState, now: Instant) {
        let events = state.readiness(now);
        if events != state.events {
            state.events = events;
            self.notify();
        }
    }

    fn fail_connect(&self, state: &mut SocketState, error: SrtError) {
        warn!(socket_id = self.id, peer = ?state.peer_addr, %error, "connection attempt failed");
        state.role = Role::Idle;
        state.failure = Some(error);
        self.set_status(state, SocketStatus::Broken);
    }

    /// Mirror a broken link into the socket state
    fn sync_link(&self, state: &mut SocketState) {
        if let Role::Connected(conn) = &state.role {
            if let LinkState::Broken(reason) = conn.state() {
                if state.status == SocketStatus::Connected {
                    state.failure = Some(reason.into());
                    self.set_status(state, SocketStatus::Broken);
                }
            }
        }
    }

    fn flush(conn: &mut Connection, mux: &Multiplexer, now: Instant) {
        let peer = conn.peer_addr();
        while let Some(packet) = conn.poll_transmit(now) {
            mux.send(&packet, peer);
        }
    }

    // ---- Setup ----

    /// Socket accepted by a listener, already connected
    fn accepted(
        id: u32,
        opts: SocketOptions,
        mux: Arc<Multiplexer>,
        conn: Connection,
        origin: Instant,
        notifier: Arc<Notifier>,
    ) -> Arc<Self> {
        let peer = conn.peer_addr();
        Arc::new(SocketCore {
            id,
            state: Mutex::new(SocketState {
                status: SocketStatus::Connected,
                opts,
                mux: Some(mux),
                peer_addr: Some(peer),
                origin,
                role: Role::Connected(Box::new(conn)),
                failure: None,
                events: EventFlags::NONE,
            }),
            cond: Condvar::new(),
            notifier,
        })
    }

    pub(crate) fn start_listening(&self, state: &mut SocketState, backlog: usize) {
        state.role = Role::Listener(Listener {
            handshake: ListenerHandshake::new(self.id, &state.opts),
            backlog: backlog.max(1),
            queue: VecDeque::new(),
            accepted: HashMap::new(),
        });
        self.set_status(state, SocketStatus::Listening);
        info!(socket_id = self.id, backlog, "listening");
    }

    /// Begin a caller or rendezvous handshake towards `peer`
    pub(crate) fn start_connect(&self, peer: SocketAddr, rendezvous: bool) -> Result<(), SrtError> {
        let mut st = self.lock();
        let mux = st.mux.clone().ok_or(SrtError::UnboundSocket)?;
        st.opts.validate()?;
        let crypto = CryptoControl::new(st.opts.crypto_config())?;

        let now = Instant::now();
        let isn = SeqNumber::random();
        let (driver, timeout) = if rendezvous {
            let hs = RendezvousHandshake::new(&st.opts, self.id, isn, mux.local_addr(), peer);
            (
                Driver::Rendezvous(hs),
                st.opts.conn_timeout * RENDEZVOUS_TIMEOUT_FACTOR,
            )
        } else {
            let hs = CallerHandshake::new(&st.opts, self.id, isn, peer);
            (Driver::Caller(hs), st.opts.conn_timeout)
        };

        st.origin = now;
        st.peer_addr = Some(peer);
        st.failure = None;
        st.role = Role::Connecting(Box::new(Connecting {
            driver,
            crypto,
            deadline: now + timeout,
            next_resend: now,
        }));
        self.set_status(&mut st, SocketStatus::Connecting);
        info!(socket_id = self.id, %peer, rendezvous, "connecting");
        drop(st);

        mux.route_peer(peer, self.id);
        mux.wake();
        Ok(())
    }

    /// Block until the handshake finishes
    pub(crate) fn wait_connected(&self) -> Result<(), SrtError> {
        let mut st = self.lock();
        loop {
            match st.status {
                SocketStatus::Connected => return Ok(()),
                SocketStatus::Connecting => {
                    self.cond.wait_for(&mut st, WAIT_SLICE);
                }
                SocketStatus::Broken => {
                    return Err(st.failure.clone().unwrap_or(SrtError::ConnectionSetup))
                }
                _ => return Err(st.link_error()),
            }
        }
    }

    /// Block until a connection is queued, then take it; the receive
    /// timeout bounds the wait
    pub(crate) fn wait_accept(&self) -> Result<u32, SrtError> {
        let mut st = self.lock();
        let deadline = st.opts.rcv_timeout.map(|t| Instant::now() + t);
        loop {
            if st.status != SocketStatus::Listening {
                return Err(match st.status {
                    SocketStatus::Closing | SocketStatus::Closed => SrtError::Closing,
                    _ => SrtError::NoListen,
                });
            }
            let blocking = st.opts.rcv_syn;
            if let Role::Listener(listener) = &mut st.role {
                if let Some(id) = listener.queue.pop_front() {
                    self.refresh(&mut st, Instant::now());
                    return Ok(id);
                }
            }
            if !blocking {
                return Err(SrtError::AsyncRecv);
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(SrtError::Timeout);
                    }
                    self.cond.wait_until(&mut st, deadline);
                }
                None => self.cond.wait(&mut st),
            }
        }
    }

    // ---- Packet path ----

    /// Handle a packet routed to this socket by the multiplexer
    pub(crate) fn on_packet(&self, mux: &Multiplexer, packet: Packet, from: SocketAddr, now: Instant) {
        let mut guard = self.lock();
        let st = &mut *guard;
        if st.peer_addr != Some(from) {
            trace!(socket_id = self.id, peer = %from, "packet from a foreign address");
            return;
        }

        if let Role::Connected(conn) = &mut st.role {
            conn.handle_packet(packet, now);
            Self::flush(conn, mux, now);
            self.sync_link(st);
        } else if matches!(st.role, Role::Connecting(_)) {
            self.on_handshake_packet(st, mux, packet, from, now);
        }
        self.refresh(st, now);
    }

    fn on_handshake_packet(
        &self,
        st: &mut SocketState,
        mux: &Multiplexer,
        packet: Packet,
        from: SocketAddr,
        now: Instant,
    ) {
        let Packet::Control(control) = packet else {
            return;
        };
        let Ok(ControlMessage::Handshake(hs)) = ControlMessage::from_packet(&control) else {
            return;
        };
        let ts = st.timestamp(now);

        let step = match &mut st.role {
            Role::Connecting(c) => {
                let c = &mut **c;
                match &mut c.driver {
                    Driver::Caller(d) => d.on_handshake(&hs, &mut c.crypto, now),
                    Driver::Rendezvous(d) => d.on_handshake(&hs, &mut c.crypto, now),
                }
            }
            _ => return,
        };
        trace!(socket_id = self.id, hs_type = ?hs.hs_type, "handshake received");

        match step {
            HandshakeStep::Wait => {}
            HandshakeStep::Send(reply) => {
                mux.send_control(ControlMessage::Handshake(reply), ts, 0, from);
            }
            HandshakeStep::Rejected { reason, reply } => {
                if let Some(reply) = reply {
                    mux.send_control(ControlMessage::Handshake(reply), ts, hs.socket_id, from);
                }
                self.fail_connect(st, SrtError::ConnectionRejected(reason));
            }
            HandshakeStep::Connected { negotiated, reply } => {
                let Role::Connecting(connecting) = std::mem::replace(&mut st.role, Role::Idle)
                else {
                    return;
                };
                let mut conn = Connection::new(
                    self.id,
                    from,
                    &st.opts,
                    *negotiated,
                    connecting.crypto,
                    (now, control.timestamp),
                    st.origin,
                    now,
                );
                if let Some(reply) = reply {
                    let dest = conn.peer_socket_id();
                    mux.send_control(ControlMessage::Handshake(reply.clone()), ts, dest, from);
                    conn.set_handshake_reply(reply);
                }
                st.role = Role::Connected(Box::new(conn));
                self.set_status(st, SocketStatus::Connected);
            }
        }
    }

    /// Handle an id-0 handshake reaching the listener of this port
    pub(crate) fn on_listener_packet(
        &self,
        mux: &Arc<Multiplexer>,
        registry: &Registry,
        packet: Packet,
        from: SocketAddr,
        now: Instant,
    ) {
        let Packet::Control(control) = &packet else {
            return;
        };
        let peer_timestamp = control.timestamp;
        let Ok(ControlMessage::Handshake(hs)) = ControlMessage::from_packet(control) else {
            return;
        };

        let mut guard = self.lock();
        let st = &mut *guard;
        let ts = st.timestamp(now);
        let Role::Listener(listener) = &mut st.role else {
            return;
        };

        let reply = |hs_reply: Handshake| {
            mux.send_control(ControlMessage::Handshake(hs_reply), ts, hs.socket_id, from);
        };

        match listener.handshake.on_handshake(&hs, from) {
            ListenerStep::Ignore => {}
            ListenerStep::Reply(induction) => {
                trace!(peer = %from, "induction");
                reply(induction);
            }
            ListenerStep::Reject(rejection) => reply(rejection),
            ListenerStep::Conclusion => {
                let key = (from, hs.socket_id);
                if let Some(&id) = listener.accepted.get(&key) {
                    if let Some(core) = registry.get(id) {
                        // Already accepted: the connection repeats its response
                        drop(guard);
                        core.on_packet(mux, packet, from, now);
                        return;
                    }
                    listener.accepted.remove(&key);
                }

                if listener.queue.len() >= listener.backlog {
                    warn!(peer = %from, "backlog full, rejecting");
                    reply(listener.handshake.reject(from, RejectReason::Backlog));
                    return;
                }

                let opts = st.opts.clone();
                let mut crypto = match CryptoControl::new(opts.crypto_config()) {
                    Ok(crypto) => crypto,
                    Err(e) => {
                        warn!(error = %e, "cannot set up crypto for an accepted socket");
                        reply(listener.handshake.reject(from, RejectReason::Resource));
                        return;
                    }
                };

                let id = registry.allocate_id();
                let isn = SeqNumber::random();
                match negotiation::respond(&opts, &hs, id, from.ip(), isn, &mut crypto, now) {
                    Err(reason) => {
                        info!(peer = %from, %reason, "connection rejected");
                        reply(listener.handshake.reject(from, reason));
                    }
                    Ok((negotiated, response)) => {
                        let mut conn = Connection::new(
                            id,
                            from,
                            &opts,
                            negotiated,
                            crypto,
                            (now, peer_timestamp),
                            now,
                            now,
                        );
                        mux.send_control(
                            ControlMessage::Handshake(response.clone()),
                            0,
                            hs.socket_id,
                            from,
                        );
                        conn.set_handshake_reply(response);

                        let core = SocketCore::accepted(
                            id,
                            opts,
                            mux.clone(),
                            conn,
                            now,
                            self.notifier.clone(),
                        );
                        registry.insert(core.clone());
                        mux.register(core);
                        listener.accepted.insert(key, id);
                        listener.queue.push_back(id);
                        info!(listener = self.id, socket_id = id, peer = %from, "connection accepted");
                        self.refresh(st, now);
                    }
                }
            }
        }
    }

    /// Run timers; returns when this socket next needs attention
    pub(crate) fn tick(&self, mux: &Multiplexer, now: Instant) -> Option<Instant> {
        let mut guard = self.lock();
        let st = &mut *guard;
        let ts = st.timestamp(now);
        let peer = st.peer_addr;

        if matches!(&st.role, Role::Connecting(c) if now >= c.deadline) {
            self.fail_connect(st, SrtError::SetupTimeout);
            self.refresh(st, now);
            return None;
        }

        let next = match &mut st.role {
            Role::Connecting(c) => {
                if now >= c.next_resend {
                    let request = match &c.driver {
                        Driver::Caller(d) => d.request(),
                        Driver::Rendezvous(d) => d.request(),
                    };
                    if let Some(peer) = peer {
                        mux.send_control(ControlMessage::Handshake(request), ts, 0, peer);
                    }
                    c.next_resend = now + HANDSHAKE_RESEND_INTERVAL;
                }
                Some(c.next_resend.min(c.deadline))
            }
            Role::Connected(conn) => {
                conn.on_timer(now);
                Self::flush(conn, mux, now);
                let next = conn.next_timeout();
                self.sync_link(st);
                Some(next)
            }
            Role::Idle | Role::Listener(_) => None,
        };

        self.refresh(st, now);
        next
    }

    // ---- Data path ----

    /// Queue one message, blocking for buffer space if configured to
    pub(crate) fn send_message(&self, data: &[u8], ctrl: &mut MsgCtrl) -> Result<usize, SrtError> {
        let mut st = self.lock();
        let deadline = st.opts.snd_timeout.map(|t| Instant::now() + t);
        let ttl = ctrl.ttl.or(st.opts.msg_ttl);

        loop {
            if st.status != SocketStatus::Connected {
                return Err(st.link_error());
            }
            let blocking = st.opts.snd_syn;
            let mux = st.mux.clone().ok_or(SrtError::NoConnection)?;
            let now = Instant::now();
            let conn = st.connection_mut()?;

            match conn.send_message(data, ttl, ctrl.in_order, ctrl.src_time, now) {
                Ok((seq, msg)) => {
                    ctrl.pktseq = Some(seq);
                    ctrl.msgno = Some(msg);
                    Self::flush(conn, &mux, now);
                    self.refresh(&mut st, now);
                    drop(st);
                    mux.wake();
                    return Ok(data.len());
                }
                Err(SrtError::AsyncSend) if blocking => {}
                Err(e) => return Err(e),
            }

            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut st, deadline).timed_out() {
                        return Err(SrtError::Timeout);
                    }
                }
                None => self.cond.wait(&mut st),
            }
        }
    }

    /// Queue stream data, blocking until at least some is accepted
    pub(crate) fn send_stream(&self, data: &[u8]) -> Result<usize, SrtError> {
        let mut st = self.lock();
        let deadline = st.opts.snd_timeout.map(|t| Instant::now() + t);

        loop {
            if st.status != SocketStatus::Connected {
                return Err(st.link_error());
            }
            let blocking = st.opts.snd_syn;
            let mux = st.mux.clone().ok_or(SrtError::NoConnection)?;
            let now = Instant::now();
            let conn = st.connection_mut()?;

            match conn.send_stream(data, now) {
                Ok(sent) => {
                    Self::flush(conn, &mux, now);
                    self.refresh(&mut st, now);
                    drop(st);
                    mux.wake();
                    return Ok(sent);
                }
                Err(SrtError::AsyncSend) if blocking => {}
                Err(e) => return Err(e),
            }

            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut st, deadline).timed_out() {
                        return Err(SrtError::Timeout);
                    }
                }
                None => self.cond.wait(&mut st),
            }
        }
    }

    /// Receive one message (message API) or a chunk of stream data
    pub(crate) fn recv(&self, buf: &mut [u8], ctrl: &mut MsgCtrl) -> Result<usize, SrtError> {
        let mut st = self.lock();
        let deadline = st.opts.rcv_timeout.map(|t| Instant::now() + t);

        loop {
            let now = Instant::now();
            let message_api = st.opts.message_api;
            let mut wake = None;

            if let Role::Connected(conn) = &mut st.role {
                if message_api {
                    if let Some(delivery) = conn.recv_message(now) {
                        let n = delivery.payload.len().min(buf.len());
                        if n < delivery.payload.len() {
                            debug!(
                                socket_id = self.id,
                                len = delivery.payload.len(),
                                room = buf.len(),
                                "message truncated"
                            );
                        }
                        buf[..n].copy_from_slice(&delivery.payload[..n]);
                        ctrl.boundary = PacketBoundary::Solo;
                        ctrl.msgno = Some(delivery.msg_number);
                        ctrl.pktseq = Some(delivery.first_seq);
                        ctrl.src_time = Some(conn.origin_time(delivery.timestamp));
                        self.refresh(&mut st, now);
                        return Ok(n);
                    }
                } else {
                    let n = conn.recv_stream(buf, now);
                    if n > 0 {
                        ctrl.boundary = PacketBoundary::Subsequent;
                        self.refresh(&mut st, now);
                        return Ok(n);
                    }
                }
                wake = Some(conn.next_timeout());
            }

            if st.status != SocketStatus::Connected {
                return Err(st.link_error());
            }
            if !st.opts.rcv_syn {
                return Err(SrtError::AsyncRecv);
            }

            if deadline.is_some_and(|d| now >= d) {
                return Err(SrtError::Timeout);
            }

            // TSBPD releases data by the clock alone, so wake up for it too.
            // A timer already due is the worker's to run; don't spin on it.
            let wake = wake.map(|w| w.max(now + MIN_WAIT));
            let until = match (deadline, wake) {
                (Some(d), Some(w)) => d.min(w),
                (Some(d), None) => d,
                (None, Some(w)) => w,
                (None, None) => now + WAIT_SLICE,
            };
            self.cond.wait_until(&mut st, until);
        }
    }

    // ---- Teardown ----

    /// Close the socket; returns the listener's queued, never accepted
    /// sockets so the caller can close them too
    pub(crate) fn close(&self) -> Vec<u32> {
        let mut st = self.lock();
        if matches!(st.status, SocketStatus::Closed | SocketStatus::NonExist) {
            return Vec::new();
        }

        // Linger: give queued data a chance to leave
        if let (Some(linger), true) = (st.opts.linger, st.opts.snd_syn) {
            let deadline = Instant::now() + linger;
            loop {
                let flushed = match st.connection() {
                    Some(conn) => conn.is_flushed() || !conn.is_connected(),
                    None => true,
                };
                let now = Instant::now();
                if flushed || now >= deadline {
                    break;
                }
                debug!(socket_id = self.id, "lingering");
                self.cond
                    .wait_until(&mut st, deadline.min(now + Duration::from_millis(10)));
            }
        }

        if st.status.can_transition(SocketStatus::Closing) {
            self.set_status(&mut st, SocketStatus::Closing);
        }

        let now = Instant::now();
        let mux = st.mux.clone();
        let pending = match std::mem::replace(&mut st.role, Role::Idle) {
            Role::Connected(mut conn) => {
                conn.close();
                if let Some(mux) = &mux {
                    Self::flush(&mut conn, mux, now);
                }
                Vec::new()
            }
            Role::Listener(listener) => listener.queue.into_iter().collect(),
            Role::Idle | Role::Connecting(_) => Vec::new(),
        };

        self.set_status(&mut st, SocketStatus::Closed);
        info!(socket_id = self.id, "closed");
        pending
    }
}

impl EventSource for SocketCore {
    fn readiness(&self) -> EventFlags {
        self.lock().readiness(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> Arc<SocketCore> {
        SocketCore::new(7, SocketOptions::default(), Arc::new(Notifier::new()))
    }

    #[test]
    fn test_fresh_socket_not_ready() {
        let core = core();
        assert!(EventSource::readiness(&*core).is_empty());
    }

    #[test]
    fn test_broken_and_closed_report_err() {
        let core = core();
        let mut st = core.lock();
        core.set_status(&mut st, SocketStatus::Opened);
        core.set_status(&mut st, SocketStatus::Connecting);
        core.fail_connect(&mut st, SrtError::SetupTimeout);
        assert_eq!(st.status, SocketStatus::Broken);
        assert_eq!(st.readiness(Instant::now()), EventFlags::ERR);
        assert_eq!(st.link_error(), SrtError::SetupTimeout);
    }

    #[test]
    fn test_illegal_transition_ignored() {
        let core = core();
        let mut st = core.lock();
        core.set_status(&mut st, SocketStatus::Listening);
        assert_eq!(st.status, SocketStatus::Init);
    }

    #[test]
    fn test_close_idle_socket() {
        let core = core();
        assert!(core.close().is_empty());
        let st = core.lock();
        assert_eq!(st.status, SocketStatus::Closed);
        assert_eq!(st.link_error(), SrtError::Closing);
    }

    #[test]
    fn test_nonblocking_recv_on_unconnected() {
        let core = core();
        let mut buf = [0u8; 8];
        assert_eq!(
            core.recv(&mut buf, &mut MsgCtrl::default()),
            Err(SrtError::NoConnection)
        );
    }

    #[test]
    fn test_accept_on_idle_socket() {
        let core = core();
        assert_eq!(core.wait_accept(), Err(SrtError::NoListen));
    }

    #[test]
    fn test_msgctrl_default() {
        let ctrl = MsgCtrl::default();
        assert_eq!(ctrl.boundary, PacketBoundary::Solo);
        assert!(ctrl.ttl.is_none() && ctrl.msgno.is_none());
    }
}
