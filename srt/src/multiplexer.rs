//! Per-port packet multiplexer
//!
//! Every bound UDP port has one multiplexer. Its receiver thread reads
//! datagrams and routes them to sockets by destination socket id (or, for
//! handshakes addressed to id 0, by peer address or to the listener). Its
//! worker thread runs the timers of all sockets on the port and sleeps until
//! the earliest one, or until woken through the channel.

use crate::engine::Registry;
use crate::socket::SocketCore;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use srt_io::{ChannelOptions, UdpChannel};
use srt_protocol::control::ControlMessage;
use srt_protocol::packet::Packet;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// How long the receiver blocks before checking for shutdown
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Longest the worker sleeps without a timer
const IDLE_TICK: Duration = Duration::from_millis(100);

/// Largest datagram accepted
const RECV_BUFFER_SIZE: usize = 65536;

pub(crate) struct Multiplexer {
    channel: UdpChannel,
    local_addr: SocketAddr,
    reuse_addr: bool,
    sockets: RwLock<HashMap<u32, Arc<SocketCore>>>,
    /// Sockets still handshaking, reached by peer address
    by_peer: RwLock<HashMap<SocketAddr, u32>>,
    listener: RwLock<Option<Arc<SocketCore>>>,
    registry: Weak<Registry>,
    wake: Sender<()>,
    running: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Multiplexer {
    /// Bind `addr` and start both threads
    pub(crate) fn start(
        addr: SocketAddr,
        options: ChannelOptions,
        registry: Weak<Registry>,
    ) -> Result<Arc<Self>, srt_io::SocketError> {
        let channel = UdpChannel::bind(addr, options)?;
        channel.set_read_timeout(Some(RECV_TIMEOUT))?;
        let local_addr = channel.local_addr()?;
        let (wake, woken) = channel::unbounded();

        let mux = Arc::new(Multiplexer {
            channel,
            local_addr,
            reuse_addr: options.reuse_addr,
            sockets: RwLock::new(HashMap::new()),
            by_peer: RwLock::new(HashMap::new()),
            listener: RwLock::new(None),
            registry,
            wake,
            running: AtomicBool::new(true),
            threads: Mutex::new(Vec::new()),
        });

        let receiver = {
            let mux = mux.clone();
            thread::Builder::new()
                .name(format!("srt-recv-{}", local_addr.port()))
                .spawn(move || mux.receive_loop())
        };
        let worker = {
            let mux = mux.clone();
            thread::Builder::new()
                .name(format!("srt-timer-{}", local_addr.port()))
                .spawn(move || mux.worker_loop(woken))
        };
        match (receiver, worker) {
            (Ok(r), Ok(w)) => mux.threads.lock().extend([r, w]),
            (r, w) => {
                mux.running.store(false, Ordering::Release);
                for handle in [r, w].into_iter().flatten() {
                    let _ = handle.join();
                }
                return Err(srt_io::SocketError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "unable to spawn multiplexer threads",
                )));
            }
        }

        debug!(addr = %local_addr, "multiplexer started");
        Ok(mux)
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn reuse_addr(&self) -> bool {
        self.reuse_addr
    }

    pub(crate) fn register(&self, core: Arc<SocketCore>) {
        self.sockets.write().insert(core.id(), core);
    }

    /// Route id-0 handshakes from `peer` to socket `id`
    pub(crate) fn route_peer(&self, peer: SocketAddr, id: u32) {
        self.by_peer.write().insert(peer, id);
    }

    /// Install the listener; fails if the port already has one
    pub(crate) fn set_listener(&self, core: Arc<SocketCore>) -> bool {
        let mut listener = self.listener.write();
        if listener.is_some() {
            return false;
        }
        *listener = Some(core);
        true
    }

    /// Forget socket `id`; returns true when the port has no users left
    pub(crate) fn unregister(&self, id: u32) -> bool {
        let mut sockets = self.sockets.write();
        sockets.remove(&id);
        self.by_peer.write().retain(|_, v| *v != id);
        let mut listener = self.listener.write();
        if listener.as_ref().is_some_and(|l| l.id() == id) {
            *listener = None;
        }
        sockets.is_empty() && listener.is_none()
    }

    pub(crate) fn send(&self, packet: &Packet, to: SocketAddr) {
        trace!(peer = %to, kind = %packet.packet_type(), "send");
        if let Err(e) = self.channel.send_to(&packet.to_bytes(), to) {
            debug!(peer = %to, error = %e, "send failed");
        }
    }

    pub(crate) fn send_control(
        &self,
        message: ControlMessage,
        timestamp: u32,
        dest_socket_id: u32,
        to: SocketAddr,
    ) {
        let packet = Packet::Control(message.into_packet(timestamp, dest_socket_id));
        self.send(&packet, to);
    }

    /// Make the worker re-evaluate its timers now
    pub(crate) fn wake(&self) {
        let _ = self.wake.send(());
    }

    /// Stop both threads and wait for them
    pub(crate) fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.wake();
        let current = thread::current().id();
        for handle in self.threads.lock().drain(..) {
            // The last socket may be closed from one of our own threads
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        debug!(addr = %self.local_addr, "multiplexer stopped");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        while self.is_running() {
            let (len, from) = match self.channel.recv_from(&mut buf) {
                Ok(Some(received)) => received,
                Ok(None) => continue,
                Err(e) => {
                    if self.is_running() {
                        warn!(addr = %self.local_addr, error = %e, "receive failed");
                    }
                    continue;
                }
            };
            match Packet::from_bytes(&buf[..len]) {
                Ok(packet) => self.dispatch(packet, from, Instant::now()),
                Err(e) => trace!(peer = %from, error = %e, "dropping malformed datagram"),
            }
        }
    }

    fn dispatch(self: &Arc<Self>, packet: Packet, from: SocketAddr, now: Instant) {
        let dest = packet.dest_socket_id();
        let target = if dest != 0 {
            self.sockets.read().get(&dest).cloned()
        } else {
            let id = self.by_peer.read().get(&from).copied();
            id.and_then(|id| self.sockets.read().get(&id).cloned())
        };

        if let Some(core) = target {
            core.on_packet(self, packet, from, now);
        } else if dest == 0 {
            let listener = self.listener.read().clone();
            let registry = self.registry.upgrade();
            match (listener, registry) {
                (Some(listener), Some(registry)) => {
                    listener.on_listener_packet(self, &registry, packet, from, now)
                }
                _ => trace!(peer = %from, "handshake for a port without a listener"),
            }
        } else {
            trace!(peer = %from, dest, "packet for an unknown socket");
        }
        self.wake();
    }

    fn worker_loop(self: Arc<Self>, woken: Receiver<()>) {
        while self.is_running() {
            let now = Instant::now();
            let sockets: Vec<Arc<SocketCore>> = self.sockets.read().values().cloned().collect();
            let mut next = now + IDLE_TICK;
            for core in sockets {
                if let Some(deadline) = core.tick(&self, now) {
                    next = next.min(deadline);
                }
            }

            match woken.recv_deadline(next.max(Instant::now())) {
                Ok(()) => while woken.try_recv().is_ok() {},
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}
