//! Socket API
//!
//! [`Srt`] owns every socket, multiplexer and epoll handle of one engine
//! instance. Sockets are addressed by [`SocketId`]; all calls return
//! `Result<_, SrtError>`.

use crate::multiplexer::Multiplexer;
use crate::socket::{MsgCtrl, SocketCore};
use parking_lot::{Mutex, RwLock};
use ring::rand::{SecureRandom, SystemRandom};
use srt_crypto::KmState;
use srt_io::{ChannelOptions, Epoll, EventFlags, EventSource, Notifier, ReadyEvent, SourceId};
use srt_protocol::connection::SocketStatus;
use srt_protocol::error::SrtError;
use srt_protocol::options::{OptBinding, OptValue, SockOpt, SocketOptions};
use srt_protocol::stats::{PerfMon, TraceStats};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Identifier of an SRT socket
pub type SocketId = u32;

/// Socket ids live in 31 bits; 0 addresses listeners
const MAX_SOCKET_ID: u32 = 0x7FFF_FFFF;

/// All live sockets of an engine
pub(crate) struct Registry {
    sockets: RwLock<HashMap<SocketId, Arc<SocketCore>>>,
    next_id: Mutex<u32>,
}

impl Registry {
    fn new() -> Self {
        let mut bytes = [0u8; 4];
        if SystemRandom::new().fill(&mut bytes).is_err() {
            tracing::warn!("no randomness for socket ids");
        }
        Registry {
            sockets: RwLock::new(HashMap::new()),
            next_id: Mutex::new(u32::from_be_bytes(bytes) & MAX_SOCKET_ID),
        }
    }

    pub(crate) fn get(&self, id: SocketId) -> Option<Arc<SocketCore>> {
        self.sockets.read().get(&id).cloned()
    }

    pub(crate) fn insert(&self, core: Arc<SocketCore>) {
        self.sockets.write().insert(core.id(), core);
    }

    fn remove(&self, id: SocketId) -> Option<Arc<SocketCore>> {
        self.sockets.write().remove(&id)
    }

    /// Next free id, never 0
    pub(crate) fn allocate_id(&self) -> SocketId {
        let mut next = self.next_id.lock();
        let sockets = self.sockets.read();
        loop {
            *next = next.wrapping_sub(1) & MAX_SOCKET_ID;
            if *next != 0 && !sockets.contains_key(&*next) {
                return *next;
            }
        }
    }

    fn ids(&self) -> Vec<SocketId> {
        self.sockets.read().keys().copied().collect()
    }
}

struct Shared {
    registry: Arc<Registry>,
    muxes: Mutex<Vec<Arc<Multiplexer>>>,
    notifier: Arc<Notifier>,
    epoll: Epoll,
}

impl Drop for Shared {
    fn drop(&mut self) {
        for id in self.registry.ids() {
            if let Some(core) = self.registry.remove(id) {
                core.close();
                // Sockets and multiplexers point at each other
                core.lock().mux = None;
            }
        }
        for mux in self.muxes.lock().drain(..) {
            mux.stop();
        }
    }
}

/// SRT engine instance
///
/// Cloning shares the instance. Everything is torn down when the last
/// clone is dropped.
#[derive(Clone)]
pub struct Srt {
    shared: Arc<Shared>,
}

impl Default for Srt {
    fn default() -> Self {
        Self::new()
    }
}

impl Srt {
    pub fn new() -> Self {
        let notifier = Arc::new(Notifier::new());
        Srt {
            shared: Arc::new(Shared {
                registry: Arc::new(Registry::new()),
                muxes: Mutex::new(Vec::new()),
                epoll: Epoll::new(notifier.clone()),
                notifier,
            }),
        }
    }

    fn core(&self, id: SocketId) -> Result<Arc<SocketCore>, SrtError> {
        self.shared.registry.get(id).ok_or(SrtError::InvalidSocket)
    }

    // ---- Lifecycle ----

    /// Create a socket with default (live) options
    pub fn socket(&self) -> Result<SocketId, SrtError> {
        let id = self.shared.registry.allocate_id();
        let core = SocketCore::new(id, SocketOptions::default(), self.shared.notifier.clone());
        self.shared.registry.insert(core);
        debug!(socket_id = id, "socket created");
        Ok(id)
    }

    /// Bind to a local address; port 0 picks a free port
    pub fn bind(&self, id: SocketId, addr: SocketAddr) -> Result<(), SrtError> {
        let core = self.core(id)?;
        let mut st = core.lock();
        if st.status != SocketStatus::Init {
            return Err(SrtError::BoundSocket);
        }

        let mux = self.multiplexer_for(addr, &st.opts)?;
        st.mux = Some(mux.clone());
        mux.register(core.clone());
        core.set_status(&mut st, SocketStatus::Opened);
        info!(socket_id = id, addr = %mux.local_addr(), "bound");
        Ok(())
    }

    /// Shared multiplexer when both sides allow address reuse, else a new one
    fn multiplexer_for(
        &self,
        addr: SocketAddr,
        opts: &SocketOptions,
    ) -> Result<Arc<Multiplexer>, SrtError> {
        let mut muxes = self.shared.muxes.lock();
        if addr.port() != 0 && opts.reuse_addr {
            if let Some(mux) = muxes
                .iter()
                .find(|m| m.local_addr() == addr && m.reuse_addr())
            {
                return Ok(mux.clone());
            }
        }

        let options = ChannelOptions {
            reuse_addr: opts.reuse_addr,
            send_buffer: Some(opts.udp_snd_buf as usize),
            recv_buffer: Some(opts.udp_rcv_buf as usize),
            ip_ttl: None,
            ip_tos: None,
        };
        let mux = Multiplexer::start(addr, options, Arc::downgrade(&self.shared.registry))?;
        muxes.push(mux.clone());
        Ok(mux)
    }

    /// Accept incoming connections; `backlog` bounds the accept queue
    pub fn listen(&self, id: SocketId, backlog: usize) -> Result<(), SrtError> {
        let core = self.core(id)?;
        let mut st = core.lock();
        match st.status {
            SocketStatus::Init => return Err(SrtError::UnboundSocket),
            SocketStatus::Listening => return Ok(()),
            SocketStatus::Opened => {}
            SocketStatus::Connecting | SocketStatus::Connected => {
                return Err(SrtError::ConnectedSocket)
            }
            _ => return Err(SrtError::InvalidSocket),
        }
        if st.opts.rendezvous {
            return Err(SrtError::RendezvousNoServer);
        }
        st.opts.validate()?;

        let mux = st.mux.clone().ok_or(SrtError::UnboundSocket)?;
        if !mux.set_listener(core.clone()) {
            return Err(SrtError::DuplicateListen);
        }
        core.start_listening(&mut st, backlog);
        Ok(())
    }

    /// Take the next connection from a listener's queue
    pub fn accept(&self, id: SocketId) -> Result<(SocketId, SocketAddr), SrtError> {
        let listener = self.core(id)?;
        loop {
            let accepted = listener.wait_accept()?;
            // Closed by its peer before anyone took it
            let Some(core) = self.shared.registry.get(accepted) else {
                continue;
            };
            let peer = core.lock().peer_addr.ok_or(SrtError::NoConnection)?;
            return Ok((accepted, peer));
        }
    }

    /// Connect to a listener, or to a rendezvous peer if the socket has
    /// the rendezvous option set
    pub fn connect(&self, id: SocketId, peer: SocketAddr) -> Result<(), SrtError> {
        let core = self.core(id)?;
        let (status, rendezvous, blocking) = {
            let st = core.lock();
            (st.status, st.opts.rendezvous, st.opts.rcv_syn)
        };
        match status {
            SocketStatus::Init if rendezvous => return Err(SrtError::RendezvousUnbound),
            SocketStatus::Init => self.bind(id, unspecified(peer))?,
            SocketStatus::Opened => {}
            SocketStatus::Listening => return Err(SrtError::NoListen),
            SocketStatus::Connecting | SocketStatus::Connected => {
                return Err(SrtError::ConnectedSocket)
            }
            _ => return Err(SrtError::InvalidSocket),
        }

        core.start_connect(peer, rendezvous)?;
        if blocking {
            core.wait_connected()
        } else {
            Ok(())
        }
    }

    /// Bind to `local` and connect to `remote` in rendezvous mode
    pub fn rendezvous(
        &self,
        id: SocketId,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<(), SrtError> {
        let core = self.core(id)?;
        {
            let mut st = core.lock();
            if st.status == SocketStatus::Listening {
                return Err(SrtError::RendezvousNoServer);
            }
            st.opts.rendezvous = true;
        }
        if core.lock().status == SocketStatus::Init {
            self.bind(id, local)?;
        }
        self.connect(id, remote)
    }

    /// Close a socket, lingering for unsent data if configured to
    pub fn close(&self, id: SocketId) -> Result<(), SrtError> {
        let core = self.core(id)?;
        let pending = core.close();
        let mux = core.lock().mux.take();

        if let Some(mux) = mux {
            if mux.unregister(id) {
                mux.stop();
                self.shared
                    .muxes
                    .lock()
                    .retain(|m| !Arc::ptr_eq(m, &mux));
            }
        }
        self.shared.registry.remove(id);
        self.shared.epoll.remove_everywhere(SourceId::Srt(id));

        for accepted in pending {
            debug!(socket_id = accepted, "closing unaccepted connection");
            self.close(accepted)?;
        }
        Ok(())
    }

    // ---- Data ----

    /// Send stream data (or one message with default settings)
    pub fn send(&self, id: SocketId, data: &[u8]) -> Result<usize, SrtError> {
        let core = self.core(id)?;
        if core.lock().opts.message_api {
            core.send_message(data, &mut MsgCtrl::default())
        } else {
            core.send_stream(data)
        }
    }

    /// Receive stream data (or one message)
    pub fn recv(&self, id: SocketId, buf: &mut [u8]) -> Result<usize, SrtError> {
        self.core(id)?.recv(buf, &mut MsgCtrl::default())
    }

    /// Send one message; `ttl` of `None` uses the socket default
    pub fn sendmsg(
        &self,
        id: SocketId,
        data: &[u8],
        ttl: Option<Duration>,
        in_order: bool,
    ) -> Result<usize, SrtError> {
        let mut ctrl = MsgCtrl {
            ttl,
            in_order,
            ..MsgCtrl::default()
        };
        self.sendmsg2(id, data, &mut ctrl)
    }

    pub fn recvmsg(&self, id: SocketId, buf: &mut [u8]) -> Result<usize, SrtError> {
        self.recvmsg2(id, buf, &mut MsgCtrl::default())
    }

    /// Send one message; sequence and message numbers are written back
    pub fn sendmsg2(&self, id: SocketId, data: &[u8], ctrl: &mut MsgCtrl) -> Result<usize, SrtError> {
        let core = self.core(id)?;
        if !core.lock().opts.message_api {
            return Err(SrtError::InvalidMessageApi);
        }
        core.send_message(data, ctrl)
    }

    /// Receive one message along with its metadata
    pub fn recvmsg2(&self, id: SocketId, buf: &mut [u8], ctrl: &mut MsgCtrl) -> Result<usize, SrtError> {
        self.core(id)?.recv(buf, ctrl)
    }

    // ---- Introspection ----

    pub fn getsockname(&self, id: SocketId) -> Result<SocketAddr, SrtError> {
        let core = self.core(id)?;
        let st = core.lock();
        st.mux
            .as_ref()
            .map(|mux| mux.local_addr())
            .ok_or(SrtError::UnboundSocket)
    }

    pub fn getpeername(&self, id: SocketId) -> Result<SocketAddr, SrtError> {
        let core = self.core(id)?;
        let st = core.lock();
        match st.status {
            SocketStatus::Connected => st.peer_addr.ok_or(SrtError::NoConnection),
            _ => Err(SrtError::NoConnection),
        }
    }

    /// State of a socket; ids that are gone report `NonExist`
    pub fn getsockstate(&self, id: SocketId) -> SocketStatus {
        self.shared
            .registry
            .get(id)
            .map_or(SocketStatus::NonExist, |core| core.lock().status)
    }

    /// Detailed statistics; `clear` restarts the interval counters
    pub fn bstats(&self, id: SocketId, clear: bool) -> Result<TraceStats, SrtError> {
        let core = self.core(id)?;
        let mut st = core.lock();
        Ok(st.connection_mut()?.stats(Instant::now(), clear))
    }

    pub fn perfmon(&self, id: SocketId, clear: bool) -> Result<PerfMon, SrtError> {
        Ok(PerfMon::from(&self.bstats(id, clear)?))
    }

    /// Unacknowledged data in the send buffer: (packets, bytes)
    pub fn getsndbuffer(&self, id: SocketId) -> Result<(usize, usize), SrtError> {
        let core = self.core(id)?;
        let st = core.lock();
        st.connection()
            .map(|conn| conn.send_buffer_usage())
            .ok_or(SrtError::NoConnection)
    }

    // ---- Options ----

    pub fn getsockopt(&self, id: SocketId, opt: SockOpt) -> Result<OptValue, SrtError> {
        let core = self.core(id)?;
        let st = core.lock();
        if let Some(value) = st.opts.get(opt) {
            return Ok(value);
        }

        let conn = st.connection();
        let km = |state: Option<KmState>| {
            let state = state.unwrap_or(if st.opts.passphrase.is_some() {
                KmState::Securing
            } else {
                KmState::Unsecured
            });
            OptValue::Int(state as i64)
        };
        let value = match opt {
            SockOpt::KmState | SockOpt::SndKmState => km(conn.map(|c| c.snd_km_state())),
            SockOpt::RcvKmState => km(conn.map(|c| c.rcv_km_state())),
            SockOpt::PeerVersion => OptValue::Int(conn.map_or(0, |c| c.settings().peer_version) as i64),
            SockOpt::State => OptValue::Int(st.status as i64),
            SockOpt::Event => OptValue::Int(st.readiness(Instant::now()).bits() as i64),
            SockOpt::SndData => OptValue::Int(conn.map_or(0, |c| c.send_buffer_usage().0) as i64),
            SockOpt::RcvData => OptValue::Int(conn.map_or(0, |c| c.recv_buffer_usage().0) as i64),
            other => {
                return Err(SrtError::InvalidParam(format!("{:?} cannot be read", other)))
            }
        };
        Ok(value)
    }

    pub fn setsockopt(&self, id: SocketId, opt: SockOpt, value: OptValue) -> Result<(), SrtError> {
        let core = self.core(id)?;
        let mut st = core.lock();
        match opt.binding() {
            OptBinding::PreBind if st.status != SocketStatus::Init => {
                return Err(SrtError::BoundSocket)
            }
            OptBinding::PreConnect
                if !matches!(st.status, SocketStatus::Init | SocketStatus::Opened) =>
            {
                return Err(SrtError::ConnectedSocket)
            }
            _ => {}
        }

        st.opts.set(opt, &value)?;
        debug!(socket_id = id, ?opt, %value, "option set");

        let opts = st.opts.clone();
        if let Ok(conn) = st.connection_mut() {
            conn.update_options(&opts);
        }
        drop(st);
        // Blocked callers re-read timeouts and blocking modes
        core.notify();
        Ok(())
    }

    // ---- Epoll ----

    pub fn epoll_create(&self) -> u32 {
        self.shared.epoll.create()
    }

    /// Watch an SRT socket
    pub fn epoll_add_usock(&self, eid: u32, id: SocketId, events: EventFlags) -> Result<(), SrtError> {
        let core: Arc<dyn EventSource> = self.core(id)?;
        Ok(self.shared.epoll.add(eid, SourceId::Srt(id), core, events)?)
    }

    /// Watch an external descriptor, identified by `token`
    pub fn epoll_add_ssock(
        &self,
        eid: u32,
        token: u64,
        source: Arc<dyn EventSource>,
        events: EventFlags,
    ) -> Result<(), SrtError> {
        Ok(self.shared.epoll.add(eid, SourceId::System(token), source, events)?)
    }

    pub fn epoll_update_usock(&self, eid: u32, id: SocketId, events: EventFlags) -> Result<(), SrtError> {
        Ok(self.shared.epoll.update(eid, SourceId::Srt(id), events)?)
    }

    pub fn epoll_update_ssock(&self, eid: u32, token: u64, events: EventFlags) -> Result<(), SrtError> {
        Ok(self.shared.epoll.update(eid, SourceId::System(token), events)?)
    }

    pub fn epoll_remove_usock(&self, eid: u32, id: SocketId) -> Result<(), SrtError> {
        Ok(self.shared.epoll.remove(eid, SourceId::Srt(id))?)
    }

    pub fn epoll_remove_ssock(&self, eid: u32, token: u64) -> Result<(), SrtError> {
        Ok(self.shared.epoll.remove(eid, SourceId::System(token))?)
    }

    /// Wait until a watched source is ready; `None` waits indefinitely
    pub fn epoll_wait(&self, eid: u32, timeout: Option<Duration>) -> Result<Vec<ReadyEvent>, SrtError> {
        Ok(self.shared.epoll.wait(eid, timeout)?)
    }

    pub fn epoll_release(&self, eid: u32) -> Result<(), SrtError> {
        Ok(self.shared.epoll.release(eid)?)
    }
}

/// Wildcard address of the same family as `peer`
fn unspecified(peer: SocketAddr) -> SocketAddr {
    let ip = match peer.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_socket_ids_unique_and_nonzero() {
        let registry = Registry::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let id = registry.allocate_id();
            assert_ne!(id, 0);
            assert!(id <= MAX_SOCKET_ID);
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn test_unknown_socket() {
        let srt = Srt::new();
        assert_eq!(srt.bind(12345, loopback()), Err(SrtError::InvalidSocket));
        assert_eq!(srt.getsockstate(12345), SocketStatus::NonExist);
    }

    #[test]
    fn test_bind_and_state() {
        let srt = Srt::new();
        let id = srt.socket().unwrap();
        assert_eq!(srt.getsockstate(id), SocketStatus::Init);
        assert_eq!(srt.getsockname(id), Err(SrtError::UnboundSocket));

        srt.bind(id, loopback()).unwrap();
        assert_eq!(srt.getsockstate(id), SocketStatus::Opened);
        assert_ne!(srt.getsockname(id).unwrap().port(), 0);
        assert_eq!(srt.bind(id, loopback()), Err(SrtError::BoundSocket));
        assert_eq!(srt.getpeername(id), Err(SrtError::NoConnection));

        srt.close(id).unwrap();
        assert_eq!(srt.getsockstate(id), SocketStatus::NonExist);
    }

    #[test]
    fn test_listen_requires_bind() {
        let srt = Srt::new();
        let id = srt.socket().unwrap();
        assert_eq!(srt.listen(id, 5), Err(SrtError::UnboundSocket));
    }

    #[test]
    fn test_listen_rejects_rendezvous() {
        let srt = Srt::new();
        let id = srt.socket().unwrap();
        srt.setsockopt(id, SockOpt::Rendezvous, OptValue::Bool(true)).unwrap();
        srt.bind(id, loopback()).unwrap();
        assert_eq!(srt.listen(id, 5), Err(SrtError::RendezvousNoServer));
    }

    #[test]
    fn test_rendezvous_connect_requires_bind() {
        let srt = Srt::new();
        let id = srt.socket().unwrap();
        srt.setsockopt(id, SockOpt::Rendezvous, OptValue::Bool(true)).unwrap();
        assert_eq!(
            srt.connect(id, "127.0.0.1:9".parse().unwrap()),
            Err(SrtError::RendezvousUnbound)
        );
    }

    #[test]
    fn test_duplicate_listen_on_shared_port() {
        let srt = Srt::new();
        let first = srt.socket().unwrap();
        srt.setsockopt(first, SockOpt::ReuseAddr, OptValue::Bool(true)).unwrap();
        srt.bind(first, loopback()).unwrap();
        let addr = srt.getsockname(first).unwrap();
        srt.listen(first, 5).unwrap();

        let second = srt.socket().unwrap();
        srt.setsockopt(second, SockOpt::ReuseAddr, OptValue::Bool(true)).unwrap();
        srt.bind(second, addr).unwrap();
        assert_eq!(srt.getsockname(second).unwrap(), addr);
        assert_eq!(srt.listen(second, 5), Err(SrtError::DuplicateListen));
    }

    #[test]
    fn test_option_binding() {
        let srt = Srt::new();
        let id = srt.socket().unwrap();
        srt.setsockopt(id, SockOpt::Mss, OptValue::Int(1400)).unwrap();
        srt.bind(id, loopback()).unwrap();

        assert_eq!(
            srt.setsockopt(id, SockOpt::Mss, OptValue::Int(1300)),
            Err(SrtError::BoundSocket)
        );
        srt.setsockopt(id, SockOpt::Latency, OptValue::Int(200)).unwrap();
        srt.setsockopt(id, SockOpt::SndSyn, OptValue::Bool(false)).unwrap();
        assert_eq!(srt.getsockopt(id, SockOpt::Mss).unwrap(), OptValue::Int(1400));
        assert_eq!(srt.getsockopt(id, SockOpt::RcvLatency).unwrap(), OptValue::Int(200));
        assert!(srt.setsockopt(id, SockOpt::Version, OptValue::Int(1)).is_err());
    }

    #[test]
    fn test_runtime_options() {
        let srt = Srt::new();
        let id = srt.socket().unwrap();
        assert_eq!(
            srt.getsockopt(id, SockOpt::State).unwrap(),
            OptValue::Int(SocketStatus::Init as i64)
        );
        assert_eq!(
            srt.getsockopt(id, SockOpt::KmState).unwrap(),
            OptValue::Int(KmState::Unsecured as i64)
        );
        assert_eq!(srt.getsockopt(id, SockOpt::SndData).unwrap(), OptValue::Int(0));
    }

    #[test]
    fn test_data_calls_need_connection() {
        let srt = Srt::new();
        let id = srt.socket().unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(srt.send(id, b"x"), Err(SrtError::NoConnection));
        assert_eq!(srt.recv(id, &mut buf), Err(SrtError::NoConnection));
        assert!(matches!(srt.bstats(id, false), Err(SrtError::NoConnection)));
    }

    #[test]
    fn test_sendmsg_on_stream_socket() {
        let srt = Srt::new();
        let id = srt.socket().unwrap();
        srt.setsockopt(id, SockOpt::TransType, OptValue::Str("file".into())).unwrap();
        assert_eq!(
            srt.sendmsg(id, b"x", None, false),
            Err(SrtError::InvalidMessageApi)
        );
    }

    #[test]
    fn test_epoll_errors() {
        let srt = Srt::new();
        let eid = srt.epoll_create();
        assert_eq!(
            srt.epoll_wait(eid, Some(Duration::ZERO)),
            Err(SrtError::Timeout)
        );
        assert_eq!(srt.epoll_wait(eid, None), Err(SrtError::InvalidPollId));
        srt.epoll_release(eid).unwrap();
        assert_eq!(
            srt.epoll_add_usock(eid, 1, EventFlags::IN),
            Err(SrtError::InvalidSocket)
        );
        let id = srt.socket().unwrap();
        assert_eq!(
            srt.epoll_add_usock(eid, id, EventFlags::IN),
            Err(SrtError::InvalidPollId)
        );
    }

    #[test]
    fn test_connect_timeout_breaks_socket() {
        let srt = Srt::new();
        // A bound port nobody answers on
        let silent = std::net::UdpSocket::bind(loopback()).unwrap();
        let target = silent.local_addr().unwrap();

        let id = srt.socket().unwrap();
        srt.setsockopt(id, SockOpt::ConnTimeo, OptValue::Int(300)).unwrap();
        let started = Instant::now();
        assert_eq!(srt.connect(id, target), Err(SrtError::SetupTimeout));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(srt.getsockstate(id), SocketStatus::Broken);
    }
}
