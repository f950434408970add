//! Handshake negotiation
//!
//! Sans-IO state machines for the three ways a connection comes up:
//!
//! * [`CallerHandshake`]: induction, then conclusion towards a listener.
//! * [`ListenerHandshake`]: stateless induction with SYN cookies; accepted
//!   conclusions are answered through [`respond`].
//! * [`RendezvousHandshake`]: symmetric waving, cookie contest, then a
//!   conclusion/agreement exchange between initiator and responder.
//!
//! Every machine returns a [`HandshakeStep`] telling the connection what to
//! send and whether it is now connected.

use crate::congestion::CongestionKind;
use crate::handshake::{
    Handshake, HandshakeType, KeyMaterialExt, RejectReason, SrtExtKind, SrtFlags,
    SrtHsExtension, HS_VERSION_SRT1, HS_VERSION_UDT4, SRT_MAGIC_CODE, SRT_VERSION,
};
use crate::options::{SocketOptions, MIN_MSS};
use crate::sequence::SeqNumber;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use srt_crypto::{CryptoControl, KmReply, KmState};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Interval between repeated handshake requests
pub const HANDSHAKE_RESEND_INTERVAL: Duration = Duration::from_millis(250);

/// Rendezvous waits this many times the normal connect timeout
pub const RENDEZVOUS_TIMEOUT_FACTOR: u32 = 10;

/// Granularity of the SYN cookie time bucket
const COOKIE_BUCKET_SECS: u64 = 60;

/// Settings both sides agreed on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub peer_socket_id: u32,
    pub peer_version: u32,
    /// First sequence this side sends
    pub snd_isn: SeqNumber,
    /// First sequence expected from the peer
    pub rcv_isn: SeqNumber,
    pub mss: u32,
    /// Peer's flow window
    pub flow_window: u32,
    /// Latency applied by this side when receiving
    pub rcv_latency: Duration,
    /// Latency applied by the peer when receiving our data
    pub snd_latency: Duration,
    pub tsbpd: bool,
    pub tlpktdrop: bool,
    pub nak_report: bool,
    pub message_api: bool,
    pub congestion: CongestionKind,
    pub stream_id: Option<String>,
}

/// What to do after a handshake event
#[derive(Debug)]
pub enum HandshakeStep {
    /// Send this handshake and keep waiting
    Send(Handshake),
    /// Nothing to send yet
    Wait,
    /// The connection is up; `reply` must be sent to the peer if present
    Connected {
        negotiated: Box<Negotiated>,
        reply: Option<Handshake>,
    },
    /// The attempt failed; `reply` tells the peer why
    Rejected {
        reason: RejectReason,
        reply: Option<Handshake>,
    },
}

fn millis_u16(latency: Duration) -> u16 {
    latency.as_millis().min(u16::MAX as u128) as u16
}

fn srt_extension(
    opts: &SocketOptions,
    kind: SrtExtKind,
    rcv_latency: Duration,
    snd_latency: Duration,
) -> SrtHsExtension {
    SrtHsExtension {
        kind,
        srt_version: SRT_VERSION,
        flags: SrtFlags {
            tsbpd_sender: opts.tsbpd_mode,
            tsbpd_receiver: opts.tsbpd_mode,
            encryption: opts.passphrase.is_some(),
            too_late_packet_drop: opts.tlpktdrop,
            nak_report: opts.nak_report,
            rexmit_flag: true,
            stream_mode: !opts.message_api,
            packet_filter: false,
        },
        recv_tsbpd_delay: millis_u16(rcv_latency),
        send_tsbpd_delay: millis_u16(snd_latency),
    }
}

fn rejection(socket_id: u32, peer_ip: IpAddr, reason: RejectReason) -> Handshake {
    Handshake::new(HandshakeType::Rejection(reason), socket_id, peer_ip)
}

/// Transport parameters a connection cannot run without
fn check_link_params(hs: &Handshake) -> Result<(), RejectReason> {
    if hs.mss < MIN_MSS {
        warn!(socket_id = hs.socket_id, mss = hs.mss, "peer MSS below minimum");
        return Err(RejectReason::Rogue);
    }
    if hs.flow_window == 0 {
        warn!(socket_id = hs.socket_id, "peer advertises an empty flow window");
        return Err(RejectReason::Rogue);
    }
    Ok(())
}

/// Options the peer must match; returns the agreed flags
fn check_compat(
    opts: &SocketOptions,
    hs: &Handshake,
) -> Result<(SrtHsExtension, CongestionKind), RejectReason> {
    check_link_params(hs)?;
    let Some(ext) = hs.srt.clone() else {
        warn!(socket_id = hs.socket_id, "conclusion without SRT extension");
        return Err(RejectReason::Rogue);
    };
    if ext.srt_version < opts.min_version {
        warn!(
            peer_version = format_args!("{:#x}", ext.srt_version),
            min_version = format_args!("{:#x}", opts.min_version),
            "peer version too old"
        );
        return Err(RejectReason::Version);
    }
    if ext.flags.stream_mode == opts.message_api {
        warn!("message API mismatch");
        return Err(RejectReason::MessageApi);
    }
    let congestion = match hs.congestion.as_deref() {
        None => CongestionKind::Live,
        Some(name) => CongestionKind::from_name(name).ok_or(RejectReason::Congestion)?,
    };
    if congestion != opts.congestion {
        warn!(peer = %congestion, local = %opts.congestion, "congestion control mismatch");
        return Err(RejectReason::Congestion);
    }
    Ok((ext, congestion))
}

/// Decide whether a failed key exchange may still proceed
fn crypto_verdict(opts: &SocketOptions, state: KmState) -> Result<(), RejectReason> {
    let reason = match state {
        KmState::BadSecret => RejectReason::BadSecret,
        KmState::NoSecret => RejectReason::Unsecure,
        _ => return Ok(()),
    };
    if opts.enforced_encryption {
        return Err(reason);
    }
    // Without a secret a sending side would emit data the peer cannot use
    if state == KmState::NoSecret && opts.passphrase.is_none() && opts.sender {
        return Err(reason);
    }
    warn!(?state, "continuing without working encryption");
    Ok(())
}

/// Answer a conclusion on the responding side (listener or rendezvous
/// responder): negotiate and build the response handshake
pub fn respond(
    opts: &SocketOptions,
    hs: &Handshake,
    socket_id: u32,
    peer_ip: IpAddr,
    own_isn: SeqNumber,
    crypto: &mut CryptoControl,
    now: Instant,
) -> Result<(Negotiated, Handshake), RejectReason> {
    let (ext, congestion) = check_compat(opts, hs)?;

    let key_material = match &hs.key_material {
        Some(km) => {
            let reply = crypto.respond(&km.data, now);
            if let KmReply::State(state) = &reply {
                crypto_verdict(opts, *state)?;
            }
            Some(KeyMaterialExt {
                kind: SrtExtKind::Response,
                data: reply.encode(),
            })
        }
        None => {
            crypto.on_missing_material();
            crypto_verdict(opts, crypto.rcv_state())?;
            None
        }
    };

    let rcv_latency = opts.rcv_latency.max(Duration::from_millis(ext.send_tsbpd_delay as u64));
    let snd_latency = opts.peer_latency.max(Duration::from_millis(ext.recv_tsbpd_delay as u64));

    let negotiated = Negotiated {
        peer_socket_id: hs.socket_id,
        peer_version: ext.srt_version,
        snd_isn: own_isn,
        rcv_isn: hs.initial_seq,
        mss: hs.mss.min(opts.mss),
        flow_window: hs.flow_window,
        rcv_latency,
        snd_latency,
        tsbpd: opts.tsbpd_mode && ext.flags.tsbpd_sender,
        tlpktdrop: opts.tlpktdrop && ext.flags.too_late_packet_drop,
        nak_report: opts.nak_report && ext.flags.nak_report,
        message_api: opts.message_api,
        congestion,
        stream_id: hs.stream_id.clone(),
    };

    let mut response = Handshake::new(HandshakeType::Conclusion, socket_id, peer_ip);
    response.initial_seq = own_isn;
    response.mss = negotiated.mss;
    response.flow_window = opts.flow_window;
    response.cookie = hs.cookie;
    response.encryption_field = encryption_field(crypto);
    response.srt = Some(srt_extension(opts, SrtExtKind::Response, rcv_latency, snd_latency));
    response.key_material = key_material;
    response.extension_field = response.conclusion_flags();

    debug!(
        peer_socket_id = hs.socket_id,
        rcv_latency_ms = rcv_latency.as_millis() as u64,
        snd_latency_ms = snd_latency.as_millis() as u64,
        "conclusion accepted"
    );
    Ok((negotiated, response))
}

fn encryption_field(crypto: &CryptoControl) -> u16 {
    if crypto.has_secret() {
        (crypto.key_len() / 8) as u16
    } else {
        0
    }
}

/// Build the conclusion request of the initiating side
fn initiator_conclusion(
    opts: &SocketOptions,
    socket_id: u32,
    isn: SeqNumber,
    cookie: u32,
    peer_ip: IpAddr,
    crypto: &mut CryptoControl,
    now: Instant,
) -> Result<Handshake, RejectReason> {
    let mut hs = Handshake::new(HandshakeType::Conclusion, socket_id, peer_ip);
    hs.initial_seq = isn;
    hs.mss = opts.mss;
    hs.flow_window = opts.flow_window;
    hs.cookie = cookie;
    hs.encryption_field = encryption_field(crypto);
    hs.srt = Some(srt_extension(opts, SrtExtKind::Request, opts.rcv_latency, opts.peer_latency));
    if crypto.has_secret() {
        let data = crypto.start_initiator(now).map_err(|e| {
            warn!(error = %e, "failed to generate key material");
            RejectReason::System
        })?;
        hs.key_material = Some(KeyMaterialExt {
            kind: SrtExtKind::Request,
            data,
        });
    }
    hs.stream_id = opts.stream_id.clone();
    if opts.congestion != CongestionKind::Live {
        hs.congestion = Some(opts.congestion.name().to_string());
    }
    hs.extension_field = hs.conclusion_flags();
    Ok(hs)
}

/// Process the response to our conclusion on the initiating side
fn initiator_finish(
    opts: &SocketOptions,
    own_isn: SeqNumber,
    hs: &Handshake,
    crypto: &mut CryptoControl,
) -> Result<Negotiated, RejectReason> {
    check_link_params(hs)?;
    let Some(ext) = hs.srt.clone() else {
        return Err(RejectReason::Rogue);
    };
    if ext.srt_version < opts.min_version {
        return Err(RejectReason::Version);
    }
    if ext.flags.stream_mode == opts.message_api {
        return Err(RejectReason::MessageApi);
    }

    if crypto.has_secret() {
        let state = match &hs.key_material {
            Some(km) => crypto.on_response(&km.data).unwrap_or(KmState::BadSecret),
            None => {
                crypto.on_missing_material();
                KmState::NoSecret
            }
        };
        crypto_verdict(opts, state)?;
    }

    // The responder reports the values it settled on; take the larger of
    // those and our own in case it is an older peer that did not
    let rcv_latency = opts.rcv_latency.max(Duration::from_millis(ext.send_tsbpd_delay as u64));
    let snd_latency = opts.peer_latency.max(Duration::from_millis(ext.recv_tsbpd_delay as u64));

    Ok(Negotiated {
        peer_socket_id: hs.socket_id,
        peer_version: ext.srt_version,
        snd_isn: own_isn,
        rcv_isn: hs.initial_seq,
        mss: hs.mss.min(opts.mss),
        flow_window: hs.flow_window,
        rcv_latency,
        snd_latency,
        tsbpd: opts.tsbpd_mode && ext.flags.tsbpd_sender,
        tlpktdrop: opts.tlpktdrop && ext.flags.too_late_packet_drop,
        nak_report: opts.nak_report && ext.flags.nak_report,
        message_api: opts.message_api,
        congestion: opts.congestion,
        stream_id: opts.stream_id.clone(),
    })
}

#[derive(Debug)]
enum CallerState {
    Induction,
    Conclusion(Handshake),
}

/// Caller side of a caller–listener connection
#[derive(Debug)]
pub struct CallerHandshake {
    opts: SocketOptions,
    socket_id: u32,
    isn: SeqNumber,
    peer_ip: IpAddr,
    state: CallerState,
}

impl CallerHandshake {
    pub fn new(opts: &SocketOptions, socket_id: u32, isn: SeqNumber, peer: SocketAddr) -> Self {
        CallerHandshake {
            opts: opts.clone(),
            socket_id,
            isn,
            peer_ip: peer.ip(),
            state: CallerState::Induction,
        }
    }

    /// Handshake to (re)send while waiting
    pub fn request(&self) -> Handshake {
        match &self.state {
            CallerState::Induction => {
                let mut hs = Handshake::new(HandshakeType::Induction, self.socket_id, self.peer_ip);
                hs.version = HS_VERSION_UDT4;
                hs.initial_seq = self.isn;
                hs.mss = self.opts.mss;
                hs.flow_window = self.opts.flow_window;
                // UDT legacy: the induction request carries the stream type
                hs.extension_field = 2;
                hs
            }
            CallerState::Conclusion(hs) => hs.clone(),
        }
    }

    pub fn on_handshake(
        &mut self,
        hs: &Handshake,
        crypto: &mut CryptoControl,
        now: Instant,
    ) -> HandshakeStep {
        if let HandshakeType::Rejection(reason) = hs.hs_type {
            return HandshakeStep::Rejected {
                reason,
                reply: None,
            };
        }

        match (&self.state, hs.hs_type) {
            (CallerState::Induction, HandshakeType::Induction) => {
                if hs.version < HS_VERSION_SRT1 || hs.extension_field != SRT_MAGIC_CODE {
                    warn!(version = hs.version, "listener does not speak HSv5");
                    return HandshakeStep::Rejected {
                        reason: RejectReason::Version,
                        reply: None,
                    };
                }
                debug!(cookie = hs.cookie, "induction response received");
                match initiator_conclusion(
                    &self.opts,
                    self.socket_id,
                    self.isn,
                    hs.cookie,
                    self.peer_ip,
                    crypto,
                    now,
                ) {
                    Ok(conclusion) => {
                        self.state = CallerState::Conclusion(conclusion.clone());
                        HandshakeStep::Send(conclusion)
                    }
                    Err(reason) => HandshakeStep::Rejected {
                        reason,
                        reply: None,
                    },
                }
            }
            (CallerState::Conclusion(_), HandshakeType::Conclusion) => {
                match initiator_finish(&self.opts, self.isn, hs, crypto) {
                    Ok(negotiated) => HandshakeStep::Connected {
                        negotiated: Box::new(negotiated),
                        reply: None,
                    },
                    Err(reason) => HandshakeStep::Rejected {
                        reason,
                        reply: Some(rejection(self.socket_id, self.peer_ip, reason)),
                    },
                }
            }
            _ => HandshakeStep::Wait,
        }
    }
}

/// SYN cookie generator keyed by a per-process secret
#[derive(Debug, Clone)]
pub struct CookieJar {
    secret: [u8; 16],
}

impl CookieJar {
    pub fn new() -> Self {
        let mut secret = [0u8; 16];
        // A zero secret only weakens the cookie; the handshake still works
        if SystemRandom::new().fill(&mut secret).is_err() {
            warn!("no randomness for the cookie secret");
        }
        CookieJar { secret }
    }

    fn bucket_now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() / COOKIE_BUCKET_SECS)
    }

    /// Cookie for `peer` in time bucket `bucket`
    pub fn cookie_at(&self, peer: SocketAddr, bucket: u64) -> u32 {
        let mut ctx = digest::Context::new(&digest::SHA256);
        ctx.update(&self.secret);
        match peer.ip() {
            IpAddr::V4(ip) => ctx.update(&ip.octets()),
            IpAddr::V6(ip) => ctx.update(&ip.octets()),
        }
        ctx.update(&peer.port().to_be_bytes());
        ctx.update(&bucket.to_be_bytes());
        let hash = ctx.finish();
        let bytes = hash.as_ref();
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    pub fn cookie(&self, peer: SocketAddr) -> u32 {
        self.cookie_at(peer, Self::bucket_now())
    }

    /// Accept cookies from the current and the previous bucket
    pub fn validate_at(&self, peer: SocketAddr, cookie: u32, bucket: u64) -> bool {
        cookie == self.cookie_at(peer, bucket)
            || (bucket > 0 && cookie == self.cookie_at(peer, bucket - 1))
    }

    pub fn validate(&self, peer: SocketAddr, cookie: u32) -> bool {
        self.validate_at(peer, cookie, Self::bucket_now())
    }
}

impl Default for CookieJar {
    fn default() -> Self {
        Self::new()
    }
}

/// What a listener does with an incoming handshake
#[derive(Debug)]
pub enum ListenerStep {
    /// Send this induction response
    Reply(Handshake),
    /// A conclusion with a valid cookie: accept it through [`respond`]
    Conclusion,
    /// Refuse with this handshake
    Reject(Handshake),
    Ignore,
}

/// Stateless listener side of the handshake
#[derive(Debug)]
pub struct ListenerHandshake {
    socket_id: u32,
    cookies: CookieJar,
    encryption_field: u16,
}

impl ListenerHandshake {
    pub fn new(socket_id: u32, opts: &SocketOptions) -> Self {
        let encryption_field = if opts.passphrase.is_some() {
            (opts.crypto_config().key_len / 8) as u16
        } else {
            0
        };
        ListenerHandshake {
            socket_id,
            cookies: CookieJar::new(),
            encryption_field,
        }
    }

    pub fn on_handshake(&self, hs: &Handshake, from: SocketAddr) -> ListenerStep {
        match hs.hs_type {
            HandshakeType::Induction => {
                let mut reply = Handshake::new(HandshakeType::Induction, self.socket_id, from.ip());
                reply.version = HS_VERSION_SRT1;
                reply.extension_field = SRT_MAGIC_CODE;
                reply.encryption_field = self.encryption_field;
                reply.initial_seq = hs.initial_seq;
                reply.mss = hs.mss;
                reply.flow_window = hs.flow_window;
                reply.cookie = self.cookies.cookie(from);
                ListenerStep::Reply(reply)
            }
            HandshakeType::Conclusion => {
                if hs.version < HS_VERSION_SRT1 {
                    return ListenerStep::Reject(rejection(
                        self.socket_id,
                        from.ip(),
                        RejectReason::Version,
                    ));
                }
                if !self.cookies.validate(from, hs.cookie) {
                    warn!(peer = %from, "conclusion with a stale or forged cookie");
                    return ListenerStep::Ignore;
                }
                ListenerStep::Conclusion
            }
            _ => ListenerStep::Ignore,
        }
    }

    /// Rejection handshake for `reason`
    pub fn reject(&self, from: SocketAddr, reason: RejectReason) -> Handshake {
        rejection(self.socket_id, from.ip(), reason)
    }
}

/// Role decided by the rendezvous cookie contest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousRole {
    Initiator,
    Responder,
}

#[derive(Debug)]
enum RendezvousState {
    Waving,
    Concluding(Handshake),
    Responding,
}

/// One side of a rendezvous connection
#[derive(Debug)]
pub struct RendezvousHandshake {
    opts: SocketOptions,
    socket_id: u32,
    isn: SeqNumber,
    peer_ip: IpAddr,
    cookie: u32,
    role: Option<RendezvousRole>,
    state: RendezvousState,
}

impl RendezvousHandshake {
    pub fn new(
        opts: &SocketOptions,
        socket_id: u32,
        isn: SeqNumber,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Self {
        Self::with_cookie(opts, socket_id, isn, peer, CookieJar::new().cookie(local))
    }

    pub fn with_cookie(
        opts: &SocketOptions,
        socket_id: u32,
        isn: SeqNumber,
        peer: SocketAddr,
        cookie: u32,
    ) -> Self {
        RendezvousHandshake {
            opts: opts.clone(),
            socket_id,
            isn,
            peer_ip: peer.ip(),
            cookie,
            role: None,
            state: RendezvousState::Waving,
        }
    }

    pub fn role(&self) -> Option<RendezvousRole> {
        self.role
    }

    pub fn request(&self) -> Handshake {
        match &self.state {
            RendezvousState::Concluding(hs) => hs.clone(),
            RendezvousState::Waving | RendezvousState::Responding => {
                let mut hs = Handshake::new(HandshakeType::WaveAHand, self.socket_id, self.peer_ip);
                hs.initial_seq = self.isn;
                hs.mss = self.opts.mss;
                hs.flow_window = self.opts.flow_window;
                hs.cookie = self.cookie;
                hs
            }
        }
    }

    pub fn on_handshake(
        &mut self,
        hs: &Handshake,
        crypto: &mut CryptoControl,
        now: Instant,
    ) -> HandshakeStep {
        if let HandshakeType::Rejection(reason) = hs.hs_type {
            return HandshakeStep::Rejected {
                reason,
                reply: None,
            };
        }

        if self.role.is_none() {
            let role = match self.cookie.cmp(&hs.cookie) {
                std::cmp::Ordering::Greater => RendezvousRole::Initiator,
                std::cmp::Ordering::Less => RendezvousRole::Responder,
                std::cmp::Ordering::Equal => {
                    warn!(cookie = self.cookie, "rendezvous cookie collision");
                    return HandshakeStep::Rejected {
                        reason: RejectReason::RdvCookie,
                        reply: Some(rejection(self.socket_id, self.peer_ip, RejectReason::RdvCookie)),
                    };
                }
            };
            debug!(?role, "rendezvous role decided");
            self.role = Some(role);

            if role == RendezvousRole::Initiator {
                let conclusion = match initiator_conclusion(
                    &self.opts,
                    self.socket_id,
                    self.isn,
                    self.cookie,
                    self.peer_ip,
                    crypto,
                    now,
                ) {
                    Ok(hs) => hs,
                    Err(reason) => {
                        return HandshakeStep::Rejected {
                            reason,
                            reply: None,
                        }
                    }
                };
                self.state = RendezvousState::Concluding(conclusion.clone());
                return HandshakeStep::Send(conclusion);
            }
            self.state = RendezvousState::Responding;
        }

        match (&self.state, hs.hs_type) {
            (RendezvousState::Concluding(request), HandshakeType::Conclusion) => {
                let is_response = hs.srt.as_ref().map(|e| e.kind) == Some(SrtExtKind::Response);
                if !is_response {
                    return HandshakeStep::Send(request.clone());
                }
                match initiator_finish(&self.opts, self.isn, hs, crypto) {
                    Ok(negotiated) => {
                        let mut agreement =
                            Handshake::new(HandshakeType::Agreement, self.socket_id, self.peer_ip);
                        agreement.initial_seq = self.isn;
                        agreement.cookie = self.cookie;
                        HandshakeStep::Connected {
                            negotiated: Box::new(negotiated),
                            reply: Some(agreement),
                        }
                    }
                    Err(reason) => HandshakeStep::Rejected {
                        reason,
                        reply: Some(rejection(self.socket_id, self.peer_ip, reason)),
                    },
                }
            }
            (RendezvousState::Concluding(request), HandshakeType::WaveAHand) => {
                HandshakeStep::Send(request.clone())
            }
            (RendezvousState::Responding, HandshakeType::Conclusion) => {
                match respond(&self.opts, hs, self.socket_id, self.peer_ip, self.isn, crypto, now) {
                    Ok((negotiated, mut response)) => {
                        response.cookie = self.cookie;
                        HandshakeStep::Connected {
                            negotiated: Box::new(negotiated),
                            reply: Some(response),
                        }
                    }
                    Err(reason) => HandshakeStep::Rejected {
                        reason,
                        reply: Some(rejection(self.socket_id, self.peer_ip, reason)),
                    },
                }
            }
            _ => HandshakeStep::Wait,
        }
    }
}
