//! Per-connection crypto context
//!
//! Owns the send and receive key rings of one connection, runs the key
//! material exchange (KMREQ/KMRSP) and the sender-driven rekey schedule.
//!
//! Rekeying works on the two key slots (even/odd). After
//! `refresh_rate - pre_announce` packets (or `max_age`) the sender generates
//! a key for the idle slot and announces both keys; once `refresh_rate`
//! packets went out under the old key it switches to the new one; after
//! another `pre_announce` packets the old key is retired and a single-key
//! KMREQ tells the receiver to drop it.

use crate::cipher::{ctr_apply, AesKey};
use crate::error::CryptoError;
use crate::kek::derive_kek;
use crate::km::KmMessage;
use crate::state::{KeyParity, KmState};
use crate::wrap::{unwrap, wrap};
use crate::{validate_key_len, validate_passphrase, SALT_LEN};
use bytes::{Buf, Bytes};
use ring::rand::{SecureRandom, SystemRandom};
use std::time::{Duration, Instant};

/// KMREQ retransmissions before giving up on a rekey announcement
const MAX_KM_RETRY: u32 = 10;

/// Floor of the KMREQ retransmission interval
const MIN_KM_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Crypto settings taken from the socket options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoConfig {
    /// Passphrase, `None` disables encryption
    pub passphrase: Option<Vec<u8>>,
    /// Stream key length in bytes (16, 24 or 32)
    pub key_len: usize,
    /// Packets sent under one key before switching; 0 disables
    pub refresh_rate: u64,
    /// Packets before the switch at which the next key is announced, and
    /// after it at which the old key is retired
    pub pre_announce: u64,
    /// Time-based rekey trigger
    pub max_age: Option<Duration>,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        CryptoConfig {
            passphrase: None,
            key_len: 16,
            refresh_rate: 0x100_0000,
            pre_announce: 0x1000,
            max_age: None,
        }
    }
}

/// Body of a KMRSP
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KmReply {
    /// Key material echoed back on success
    Material(KmMessage),
    /// Failure state of the responding side
    State(KmState),
}

impl KmReply {
    pub fn encode(&self) -> Bytes {
        match self {
            KmReply::Material(msg) => msg.encode(),
            KmReply::State(state) => Bytes::copy_from_slice(&(*state as u32).to_be_bytes()),
        }
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, CryptoError> {
        if data.len() == 4 {
            let state = KmState::from_u32(data.get_u32())
                .ok_or(CryptoError::MalformedMessage("unknown key material state"))?;
            return Ok(KmReply::State(state));
        }
        Ok(KmReply::Material(KmMessage::decode(data)?))
    }
}

#[derive(Clone)]
struct Sek {
    raw: Vec<u8>,
    cipher: AesKey,
}

impl Sek {
    fn new(raw: Vec<u8>) -> Result<Self, CryptoError> {
        let cipher = AesKey::new(&raw)?;
        Ok(Sek { raw, cipher })
    }
}

#[derive(Clone)]
struct KeyRing {
    salt: [u8; SALT_LEN],
    even: Option<Sek>,
    odd: Option<Sek>,
}

impl KeyRing {
    fn get(&self, parity: KeyParity) -> Option<&Sek> {
        match parity {
            KeyParity::Even => self.even.as_ref(),
            KeyParity::Odd => self.odd.as_ref(),
        }
    }

    fn set(&mut self, parity: KeyParity, key: Option<Sek>) {
        match parity {
            KeyParity::Even => self.even = key,
            KeyParity::Odd => self.odd = key,
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.even.is_some() {
            flags |= KeyParity::Even.flag();
        }
        if self.odd.is_some() {
            flags |= KeyParity::Odd.flag();
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RekeyPhase {
    /// One key in use
    Idle,
    /// Next key announced, old key still encrypting
    Announced,
    /// New key encrypting, old key still installed at the peer
    Switched,
}

struct PendingRequest {
    message: KmMessage,
    last_sent: Option<Instant>,
    retries: u32,
}

/// Crypto state of one connection
pub struct CryptoControl {
    config: CryptoConfig,
    rng: SystemRandom,
    /// KEK and the salt it was derived for
    kek: Option<([u8; SALT_LEN], AesKey)>,
    tx: Option<KeyRing>,
    rx: Option<KeyRing>,
    tx_active: KeyParity,
    snd_state: KmState,
    rcv_state: KmState,
    phase: RekeyPhase,
    packets_on_key: u64,
    key_activated: Option<Instant>,
    pending: Option<PendingRequest>,
}

impl CryptoControl {
    pub fn new(config: CryptoConfig) -> Result<Self, CryptoError> {
        if let Some(passphrase) = &config.passphrase {
            validate_passphrase(passphrase)?;
        }
        validate_key_len(config.key_len)?;

        Ok(CryptoControl {
            config,
            rng: SystemRandom::new(),
            kek: None,
            tx: None,
            rx: None,
            tx_active: KeyParity::Even,
            snd_state: KmState::Unsecured,
            rcv_state: KmState::Unsecured,
            phase: RekeyPhase::Idle,
            packets_on_key: 0,
            key_activated: None,
            pending: None,
        })
    }

    /// Whether a passphrase is configured
    pub fn has_secret(&self) -> bool {
        self.config.passphrase.is_some()
    }

    pub fn snd_state(&self) -> KmState {
        self.snd_state
    }

    pub fn rcv_state(&self) -> KmState {
        self.rcv_state
    }

    /// Whether outgoing payloads get encrypted
    pub fn encrypts(&self) -> bool {
        self.tx.is_some()
    }

    /// Key length in bytes (the peer's when learnt from its key material)
    pub fn key_len(&self) -> usize {
        self.config.key_len
    }

    /// Generate the session key and produce the KMREQ for the conclusion
    /// handshake
    pub fn start_initiator(&mut self, now: Instant) -> Result<Bytes, CryptoError> {
        if !self.has_secret() {
            return Err(CryptoError::NoSecret);
        }

        let mut salt = [0u8; SALT_LEN];
        self.fill_random(&mut salt)?;
        let sek = self.generate_sek()?;
        self.kek_for(&salt, self.config.key_len)?;

        let ring = KeyRing {
            salt,
            even: Some(sek),
            odd: None,
        };
        let message = self.material(&ring)?;

        self.rx = Some(ring.clone());
        self.tx = Some(ring);
        self.tx_active = KeyParity::Even;
        self.key_activated = Some(now);
        self.set_states(KmState::Securing);

        tracing::debug!(key_len = self.config.key_len, "key material generated");
        Ok(message.encode())
    }

    /// Process the KMREQ of the conclusion handshake on the responder side
    pub fn respond(&mut self, request: &[u8], now: Instant) -> KmReply {
        self.set_states(KmState::Securing);

        if !self.has_secret() {
            tracing::warn!("peer sent key material but no passphrase is set");
            self.set_states(KmState::NoSecret);
            return KmReply::State(KmState::NoSecret);
        }

        let outcome = KmMessage::decode(request).and_then(|msg| {
            let ring = self.unwrap_message(&msg)?;
            Ok((msg, ring))
        });

        match outcome {
            Ok((msg, ring)) => {
                self.tx_active = if ring.even.is_some() {
                    KeyParity::Even
                } else {
                    KeyParity::Odd
                };
                self.config.key_len = msg.key_len;
                self.tx = Some(ring.clone());
                self.rx = Some(ring);
                self.key_activated = Some(now);
                self.set_states(KmState::Secured);
                tracing::debug!("key material accepted");
                KmReply::Material(msg)
            }
            Err(e) => {
                tracing::warn!(error = %e, "key material rejected");
                self.set_states(KmState::BadSecret);
                KmReply::State(KmState::BadSecret)
            }
        }
    }

    /// Process the KMRSP of the conclusion handshake on the initiator side
    pub fn on_response(&mut self, response: &[u8]) -> Result<KmState, CryptoError> {
        match KmReply::decode(response)? {
            KmReply::State(state) => {
                let outcome = match state {
                    KmState::BadSecret => KmState::BadSecret,
                    _ => KmState::NoSecret,
                };
                tracing::warn!(peer_state = ?state, "peer could not use key material");
                self.set_states(outcome);
                Ok(outcome)
            }
            KmReply::Material(msg) => {
                let expected = self
                    .tx
                    .as_ref()
                    .map(|ring| self.material(ring))
                    .transpose()?;
                if expected.as_ref() == Some(&msg) {
                    self.set_states(KmState::Secured);
                    Ok(KmState::Secured)
                } else {
                    self.set_states(KmState::BadSecret);
                    Ok(KmState::BadSecret)
                }
            }
        }
    }

    /// The peer's handshake carried no key material
    ///
    /// A side with a passphrase facing an unencrypted peer ends in NOSECRET;
    /// without a passphrase the connection simply stays unsecured.
    pub fn on_missing_material(&mut self) {
        if self.has_secret() && !self.snd_state.is_terminal() {
            self.set_states(KmState::Securing);
            self.set_states(KmState::NoSecret);
            self.tx = None;
            self.rx = None;
        }
    }

    /// Process an in-band KMREQ (a peer rekey)
    pub fn on_km_request(&mut self, request: &[u8]) -> KmReply {
        if !self.has_secret() {
            return KmReply::State(KmState::NoSecret);
        }

        let outcome = KmMessage::decode(request).and_then(|msg| {
            let ring = self.unwrap_message(&msg)?;
            Ok((msg, ring))
        });

        match outcome {
            Ok((msg, ring)) => {
                tracing::debug!(key_flags = msg.key_flags, "peer key material installed");
                if self.rcv_state == KmState::Securing {
                    self.rcv_state = KmState::Secured;
                }
                self.rx = Some(ring);
                KmReply::Material(msg)
            }
            Err(e) => {
                tracing::warn!(error = %e, "in-band key material rejected");
                KmReply::State(KmState::BadSecret)
            }
        }
    }

    /// Process an in-band KMRSP answering our rekey announcement
    pub fn on_km_response(&mut self, response: &[u8]) {
        let Some(pending) = &self.pending else {
            return;
        };

        match KmReply::decode(response) {
            Ok(KmReply::Material(msg)) if msg == pending.message => {
                tracing::debug!("rekey acknowledged by peer");
                self.pending = None;
            }
            Ok(KmReply::State(state)) => {
                tracing::warn!(peer_state = ?state, "peer failed to install rekeyed material");
                self.pending = None;
            }
            _ => {}
        }
    }

    /// KMREQ to transmit now, if an announcement is outstanding and due
    pub fn poll_km_request(&mut self, now: Instant, rtt: Duration) -> Option<Bytes> {
        let interval = (rtt * 3 / 2).max(MIN_KM_RETRY_INTERVAL);
        let pending = self.pending.as_mut()?;

        let due = pending
            .last_sent
            .map_or(true, |last| now.saturating_duration_since(last) >= interval);
        if !due {
            return None;
        }

        if pending.retries >= MAX_KM_RETRY {
            tracing::warn!("rekey announcement not acknowledged, giving up");
            self.pending = None;
            return None;
        }

        pending.retries += 1;
        pending.last_sent = Some(now);
        Some(pending.message.encode())
    }

    /// Encrypt an outgoing payload for packet `seq`
    ///
    /// Returns the key slot used, or `None` when the connection is not
    /// encrypted. Advances the rekey schedule.
    pub fn encrypt(
        &mut self,
        seq: u32,
        payload: &mut [u8],
        now: Instant,
    ) -> Result<Option<KeyParity>, CryptoError> {
        let Some(ring) = &self.tx else {
            return Ok(None);
        };

        let parity = self.tx_active;
        let sek = ring.get(parity).ok_or(CryptoError::NoKey(parity))?;
        ctr_apply(&sek.cipher, &ring.salt, seq, payload);

        self.packets_on_key += 1;
        self.advance_rekey(now)?;
        Ok(Some(parity))
    }

    /// Decrypt an incoming payload in place
    pub fn decrypt(
        &self,
        seq: u32,
        parity: KeyParity,
        payload: &mut [u8],
    ) -> Result<(), CryptoError> {
        let ring = self.rx.as_ref().ok_or(CryptoError::NoKey(parity))?;
        let sek = ring.get(parity).ok_or(CryptoError::NoKey(parity))?;
        ctr_apply(&sek.cipher, &ring.salt, seq, payload);
        Ok(())
    }

    fn advance_rekey(&mut self, now: Instant) -> Result<(), CryptoError> {
        let refresh = self.config.refresh_rate;
        let pre = self.config.pre_announce;

        match self.phase {
            RekeyPhase::Idle => {
                let by_count = refresh > 0 && self.packets_on_key >= refresh.saturating_sub(pre);
                let by_age = match (self.config.max_age, self.key_activated) {
                    (Some(max_age), Some(at)) => now.saturating_duration_since(at) >= max_age,
                    _ => false,
                };
                if by_count || by_age {
                    self.announce_next_key()?;
                    if by_age && !by_count {
                        // Time trigger: the switch follows the announcement
                        // after the pre-announce period.
                        self.packets_on_key = refresh.saturating_sub(pre);
                    }
                }
            }
            RekeyPhase::Announced => {
                if self.packets_on_key >= refresh.max(pre) {
                    self.tx_active = self.tx_active.other();
                    self.phase = RekeyPhase::Switched;
                    self.packets_on_key = 0;
                    self.key_activated = Some(now);
                    tracing::info!(active = ?self.tx_active, "switched to new stream key");
                }
            }
            RekeyPhase::Switched => {
                if self.packets_on_key >= pre {
                    let old = self.tx_active.other();
                    if let Some(ring) = self.tx.as_mut() {
                        ring.set(old, None);
                    }
                    self.phase = RekeyPhase::Idle;
                    self.queue_announcement()?;
                    tracing::debug!(retired = ?old, "old stream key retired");
                }
            }
        }
        Ok(())
    }

    fn announce_next_key(&mut self) -> Result<(), CryptoError> {
        let next = self.tx_active.other();
        let sek = self.generate_sek()?;
        if let Some(ring) = self.tx.as_mut() {
            ring.set(next, Some(sek));
        }
        self.phase = RekeyPhase::Announced;
        self.queue_announcement()?;
        tracing::info!(next = ?next, "announcing next stream key");
        Ok(())
    }

    fn queue_announcement(&mut self) -> Result<(), CryptoError> {
        let Some(ring) = &self.tx else {
            return Ok(());
        };
        let message = self.material(ring)?;
        self.pending = Some(PendingRequest {
            message,
            last_sent: None,
            retries: 0,
        });
        Ok(())
    }

    fn set_states(&mut self, to: KmState) {
        for (name, state) in [("snd", &mut self.snd_state), ("rcv", &mut self.rcv_state)] {
            if state.can_transition(to) {
                tracing::trace!(direction = name, from = ?*state, to = ?to, "km state");
                *state = to;
            }
        }
    }

    fn generate_sek(&self) -> Result<Sek, CryptoError> {
        let mut raw = vec![0u8; self.config.key_len];
        self.fill_random(&mut raw)?;
        Sek::new(raw)
    }

    fn fill_random(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        self.rng.fill(buf).map_err(|_| CryptoError::Random)
    }

    fn kek_for(&mut self, salt: &[u8; SALT_LEN], key_len: usize) -> Result<AesKey, CryptoError> {
        if let Some((kek_salt, kek)) = &self.kek {
            if kek_salt == salt && kek_len(kek) == key_len {
                return Ok(kek.clone());
            }
        }

        let passphrase = self.config.passphrase.as_deref().ok_or(CryptoError::NoSecret)?;
        let kek = AesKey::new(&derive_kek(passphrase, salt, key_len)?)?;
        self.kek = Some((*salt, kek.clone()));
        Ok(kek)
    }

    /// Build the key material message describing `ring`
    fn material(&self, ring: &KeyRing) -> Result<KmMessage, CryptoError> {
        let passphrase = self.config.passphrase.as_deref().ok_or(CryptoError::NoSecret)?;
        let kek = match &self.kek {
            Some((salt, kek)) if *salt == ring.salt && kek_len(kek) == self.config.key_len => {
                kek.clone()
            }
            _ => AesKey::new(&derive_kek(passphrase, &ring.salt, self.config.key_len)?)?,
        };

        let mut plain = Vec::with_capacity(self.config.key_len * 2);
        for sek in [&ring.even, &ring.odd].into_iter().flatten() {
            plain.extend_from_slice(&sek.raw);
        }

        Ok(KmMessage {
            key_flags: ring.flags(),
            key_len: self.config.key_len,
            salt: ring.salt,
            wrapped: Bytes::from(wrap(&kek, &plain)?),
        })
    }

    fn unwrap_message(&mut self, msg: &KmMessage) -> Result<KeyRing, CryptoError> {
        let kek = self.kek_for(&msg.salt, msg.key_len)?;
        let plain = unwrap(&kek, &msg.wrapped)?;

        let mut keys = plain.chunks_exact(msg.key_len);
        let mut ring = KeyRing {
            salt: msg.salt,
            even: None,
            odd: None,
        };
        for parity in [KeyParity::Even, KeyParity::Odd] {
            if msg.has_key(parity) {
                let raw = keys
                    .next()
                    .ok_or(CryptoError::MalformedMessage("missing wrapped key"))?;
                ring.set(parity, Some(Sek::new(raw.to_vec())?));
            }
        }
        Ok(ring)
    }
}

fn kek_len(kek: &AesKey) -> usize {
    match kek {
        AesKey::Aes128(_) => 16,
        AesKey::Aes192(_) => 24,
        AesKey::Aes256(_) => 32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(passphrase: Option<&str>) -> CryptoConfig {
        CryptoConfig {
            passphrase: passphrase.map(|p| p.as_bytes().to_vec()),
            ..CryptoConfig::default()
        }
    }

    fn secured_pair(cfg: CryptoConfig) -> (CryptoControl, CryptoControl) {
        let now = Instant::now();
        let mut initiator = CryptoControl::new(cfg.clone()).unwrap();
        let mut responder = CryptoControl::new(cfg).unwrap();

        let request = initiator.start_initiator(now).unwrap();
        let reply = responder.respond(&request, now);
        assert_eq!(initiator.on_response(&reply.encode()).unwrap(), KmState::Secured);
        (initiator, responder)
    }

    #[test]
    fn test_exchange_secures_both_sides() {
        let (mut initiator, mut responder) = secured_pair(config(Some("correct horse battery")));
        let now = Instant::now();

        assert_eq!(initiator.snd_state(), KmState::Secured);
        assert_eq!(initiator.rcv_state(), KmState::Secured);
        assert_eq!(responder.snd_state(), KmState::Secured);
        assert_eq!(responder.rcv_state(), KmState::Secured);

        let mut payload = b"live video frame".to_vec();
        let parity = initiator.encrypt(100, &mut payload, now).unwrap().unwrap();
        assert_ne!(&payload[..], b"live video frame");
        responder.decrypt(100, parity, &mut payload).unwrap();
        assert_eq!(&payload[..], b"live video frame");

        // Reverse direction uses the cloned ring
        let mut payload = b"return path".to_vec();
        let parity = responder.encrypt(7, &mut payload, now).unwrap().unwrap();
        initiator.decrypt(7, parity, &mut payload).unwrap();
        assert_eq!(&payload[..], b"return path");
    }

    #[test]
    fn test_responder_without_secret() {
        let now = Instant::now();
        let mut initiator = CryptoControl::new(config(Some("correct horse battery"))).unwrap();
        let mut responder = CryptoControl::new(config(None)).unwrap();

        let request = initiator.start_initiator(now).unwrap();
        let reply = responder.respond(&request, now);
        assert_eq!(reply, KmReply::State(KmState::NoSecret));
        assert_eq!(responder.rcv_state(), KmState::NoSecret);

        assert_eq!(initiator.on_response(&reply.encode()).unwrap(), KmState::NoSecret);
        assert_eq!(initiator.snd_state(), KmState::NoSecret);
    }

    #[test]
    fn test_mismatched_passphrase() {
        let now = Instant::now();
        let mut initiator = CryptoControl::new(config(Some("first passphrase"))).unwrap();
        let mut responder = CryptoControl::new(config(Some("second passphrase"))).unwrap();

        let request = initiator.start_initiator(now).unwrap();
        let reply = responder.respond(&request, now);
        assert_eq!(reply, KmReply::State(KmState::BadSecret));
        assert_eq!(responder.snd_state(), KmState::BadSecret);
        assert_eq!(initiator.on_response(&reply.encode()).unwrap(), KmState::BadSecret);
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let (mut initiator, _) = secured_pair(config(Some("correct horse battery")));
        initiator.on_missing_material();
        assert_eq!(initiator.rcv_state(), KmState::Secured);
    }

    #[test]
    fn test_missing_material_with_secret() {
        let mut ctl = CryptoControl::new(config(Some("correct horse battery"))).unwrap();
        ctl.on_missing_material();
        assert_eq!(ctl.snd_state(), KmState::NoSecret);
        assert!(!ctl.encrypts());

        let mut plain = CryptoControl::new(config(None)).unwrap();
        plain.on_missing_material();
        assert_eq!(plain.snd_state(), KmState::Unsecured);
    }

    #[test]
    fn test_passphrase_validation() {
        assert!(matches!(
            CryptoControl::new(config(Some("short"))),
            Err(CryptoError::InvalidPassphraseLength(5))
        ));
    }

    #[test]
    fn test_rekey_overlap() {
        let cfg = CryptoConfig {
            refresh_rate: 10,
            pre_announce: 3,
            ..config(Some("correct horse battery"))
        };
        let (mut sender, mut receiver) = secured_pair(cfg);
        let now = Instant::now();
        let rtt = Duration::from_millis(10);

        // 7 packets: announcement due
        let mut seq = 0u32;
        let mut under_old = Vec::new();
        for _ in 0..7 {
            let mut p = vec![seq as u8; 32];
            let parity = sender.encrypt(seq, &mut p, now).unwrap().unwrap();
            assert_eq!(parity, KeyParity::Even);
            under_old.push((seq, parity, p));
            seq += 1;
        }

        let announce = sender.poll_km_request(now, rtt).expect("announcement");
        let announced = KmMessage::decode(&announce).unwrap();
        assert_eq!(announced.key_count(), 2);

        // Repeated until acknowledged
        assert!(sender.poll_km_request(now, rtt).is_none());
        assert!(sender
            .poll_km_request(now + Duration::from_millis(100), rtt)
            .is_some());

        let reply = receiver.on_km_request(&announce);
        sender.on_km_response(&reply.encode());
        assert!(sender
            .poll_km_request(now + Duration::from_secs(1), rtt)
            .is_none());

        // Remaining old-key packets, then the switch
        let mut switched = None;
        for _ in 0..6 {
            let mut p = vec![seq as u8; 32];
            let parity = sender.encrypt(seq, &mut p, now).unwrap().unwrap();
            if parity == KeyParity::Odd && switched.is_none() {
                switched = Some(seq);
            }
            under_old.push((seq, parity, p));
            seq += 1;
        }
        assert_eq!(switched, Some(10));

        // Both parities decrypt while both keys are installed
        for (s, parity, mut p) in under_old {
            receiver.decrypt(s, parity, &mut p).unwrap();
            assert_eq!(p, vec![s as u8; 32]);
        }

        // Old key retired pre_announce packets after the switch
        let retire = sender
            .poll_km_request(now + Duration::from_secs(2), rtt)
            .expect("retirement");
        let retired = KmMessage::decode(&retire).unwrap();
        assert!(retired.has_key(KeyParity::Odd));
        assert!(!retired.has_key(KeyParity::Even));

        receiver.on_km_request(&retire);
        let mut p = vec![0u8; 16];
        assert_eq!(
            receiver.decrypt(0, KeyParity::Even, &mut p),
            Err(CryptoError::NoKey(KeyParity::Even))
        );
    }

    #[test]
    fn test_rekey_by_age() {
        let cfg = CryptoConfig {
            max_age: Some(Duration::from_secs(60)),
            ..config(Some("correct horse battery"))
        };
        let (mut sender, _) = secured_pair(cfg);
        let now = Instant::now();

        let mut p = vec![0u8; 16];
        sender.encrypt(0, &mut p, now).unwrap();
        assert!(sender.poll_km_request(now, Duration::ZERO).is_none());

        sender
            .encrypt(1, &mut p, now + Duration::from_secs(61))
            .unwrap();
        let announce = sender
            .poll_km_request(now + Duration::from_secs(61), Duration::ZERO)
            .unwrap();
        assert_eq!(KmMessage::decode(&announce).unwrap().key_count(), 2);
    }

    #[test]
    fn test_reply_state_word() {
        let encoded = KmReply::State(KmState::BadSecret).encode();
        assert_eq!(&encoded[..], &[0, 0, 0, 4]);
        assert_eq!(
            KmReply::decode(&encoded).unwrap(),
            KmReply::State(KmState::BadSecret)
        );
    }
}
