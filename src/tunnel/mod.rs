//! The per-peer tunnel object
//!
//! [`Tunn`] composes the handshake, session slots, timers and cookie
//! machinery behind the driving operations. It never performs I/O: every
//! call writes into a caller-owned buffer and returns an [`Action`] saying
//! what to do with the bytes.

mod clock;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use zeroize::Zeroizing;

use crate::config::{EngineConfig, TunnelConfig};
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::error::{ConfigError, TunnelError};
use crate::protocol::cookie::{source_bytes, CookieGenerator};
use crate::protocol::handshake::{Handshake, HandshakePhase, Role};
use crate::protocol::messages::{
    self, CookieReply, HandshakeInitiation, HandshakeResponse, Packet, TransportData,
};
use crate::protocol::session::{IndexAllocator, Session, SessionSlots, Slot};
use crate::protocol::timers::{SessionView, TimerAction, Timers};
use crate::protocol::transport::{ip_packet_len, IpVersion};

pub use clock::{Clock, ManualClock, MonotonicClock};

/// What the caller must do after a driving operation.
///
/// Sizes refer to `dst[..n]` of the buffer passed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Done,
    WriteToNetwork(usize),
    WriteToTunnelV4(usize),
    WriteToTunnelV6(usize),
    Err(TunnelError),
}

/// Traffic counters and handshake status
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStats {
    pub phase: HandshakePhase,
    pub established: bool,
    pub time_since_last_handshake: Option<Duration>,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub queued_packets: usize,
    /// Share of the current session's packets that never arrived
    pub estimated_loss: f32,
}

#[derive(Debug, Default)]
struct Counters {
    tx_bytes: u64,
    rx_bytes: u64,
    tx_packets: u64,
    rx_packets: u64,
}

/// Encrypted tunnel to a single peer
pub struct Tunn {
    handshake: Handshake,
    sessions: SessionSlots,
    indices: IndexAllocator,
    timers: Timers,
    cookies: CookieGenerator,
    /// Plaintext held until a session is available
    queue: VecDeque<Zeroizing<Vec<u8>>>,
    config: TunnelConfig,
    clock: Box<dyn Clock>,
    counters: Counters,
}

impl Tunn {
    /// Create a tunnel with a real-time clock
    pub fn new(
        secret: SecretKey,
        peer_public: PublicKey,
        config: TunnelConfig,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(secret, peer_public, config, Box::new(MonotonicClock::new()))
    }

    /// Create a tunnel driven by the given clock
    pub fn with_clock(
        secret: SecretKey,
        peer_public: PublicKey,
        config: TunnelConfig,
        clock: Box<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let invalid_peer = || ConfigError::InvalidKey {
            field: "PublicKey".to_string(),
        };
        if !peer_public.is_valid() {
            return Err(invalid_peer());
        }

        let now = clock.now();
        let static_public = secret.public_key();
        let handshake = Handshake::new(
            secret,
            peer_public,
            config.preshared_key,
            config.cookie_lifetime,
        )
        .map_err(|_| invalid_peer())?;

        tracing::debug!(
            "Tunnel created: local={} peer={}",
            static_public,
            peer_public
        );

        Ok(Self {
            handshake,
            sessions: SessionSlots::new(),
            indices: IndexAllocator::new(config.reject_after_time),
            timers: Timers::new(),
            cookies: CookieGenerator::new(
                static_public.as_bytes(),
                config.cookie_lifetime,
                config.handshake_rate_limit,
                now,
            ),
            queue: VecDeque::new(),
            config,
            clock,
            counters: Counters::default(),
        })
    }

    /// Create a tunnel from base64 key strings
    pub fn from_base64(
        secret: &str,
        peer_public: &str,
        config: TunnelConfig,
    ) -> Result<Self, ConfigError> {
        let secret = SecretKey::from_base64(secret)?;
        let peer_public = PublicKey::from_base64(peer_public)?;
        Self::new(secret, peer_public, config)
    }

    /// Create a tunnel from a parsed configuration file
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        Self::new(
            config.interface.private_key.clone(),
            config.peer.public_key,
            config.tunnel_config(),
        )
    }

    pub fn static_public(&self) -> &PublicKey {
        self.handshake.static_public()
    }

    pub fn peer_public(&self) -> &PublicKey {
        self.handshake.peer_public()
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn handshake_phase(&self) -> HandshakePhase {
        self.handshake.phase()
    }

    /// True while a current session exists to send with
    pub fn is_established(&self) -> bool {
        self.sessions.current().is_some()
    }

    pub fn stats(&self) -> TunnelStats {
        let now = self.clock.now();
        TunnelStats {
            phase: self.handshake.phase(),
            established: self.is_established(),
            time_since_last_handshake: self
                .timers
                .handshake_completed
                .map(|t| now.saturating_sub(t)),
            tx_bytes: self.counters.tx_bytes,
            rx_bytes: self.counters.rx_bytes,
            tx_packets: self.counters.tx_packets,
            rx_packets: self.counters.rx_packets,
            queued_packets: self.queue.len(),
            estimated_loss: self
                .sessions
                .current()
                .map_or(0.0, |s| s.estimated_loss()),
        }
    }

    /// Encrypt an IP packet for the peer.
    ///
    /// Without a current session the packet is queued and, unless one is
    /// already under way, a handshake starts.
    pub fn on_outbound_packet(&mut self, packet: &[u8], dst: &mut [u8]) -> Action {
        let now = self.clock.now();

        let Some(session) = self.sessions.current_mut() else {
            self.enqueue(packet);
            if self.timers.attempt_active() {
                return Action::Done;
            }
            return self.send_initiation(now, false, dst);
        };

        match session.encrypt(packet, dst) {
            Ok(n) => {
                self.timers.on_packet_sent(now, true);
                self.count_tx(n);
                Action::WriteToNetwork(n)
            }
            Err(e) => {
                tracing::debug!("Outbound packet not sent: {}", e);
                Action::Err(e)
            }
        }
    }

    /// Process a datagram from the peer.
    ///
    /// An empty datagram flushes the next queued packet, if any; callers
    /// repeat it while the result is [`Action::WriteToNetwork`].
    pub fn on_inbound_datagram(&mut self, datagram: &[u8], dst: &mut [u8]) -> Action {
        self.on_inbound_datagram_from(None, datagram, dst)
    }

    /// As [`Tunn::on_inbound_datagram`], with the sender's address for
    /// cookie binding when under load
    pub fn on_inbound_datagram_from(
        &mut self,
        src: Option<SocketAddr>,
        datagram: &[u8],
        dst: &mut [u8],
    ) -> Action {
        let now = self.clock.now();

        if datagram.is_empty() {
            return self.flush_queue(now, dst);
        }

        let packet = match messages::parse(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("Malformed datagram ({} bytes): {}", datagram.len(), e);
                return Action::Err(TunnelError::Decode(e));
            }
        };

        match packet {
            Packet::Initiation(msg) => self.handle_initiation(src, datagram, &msg, now, dst),
            Packet::Response(msg) => self.handle_response(src, datagram, &msg, now, dst),
            Packet::Cookie(reply) => self.handle_cookie(&reply, now, dst),
            Packet::Data(data) => self.handle_data(&data, now, dst),
        }
    }

    /// Drive timers. Call roughly every 100 ms.
    pub fn on_tick(&mut self, dst: &mut [u8]) -> Action {
        let now = self.clock.now();

        for index in self
            .sessions
            .expire(now, self.config.reject_after_time)
        {
            self.indices.retire(index, now);
        }

        let current = self.sessions.current().map(|s| SessionView {
            age: s.age(now),
            role: s.role,
            sending_counter: s.sending_counter(),
        });

        match self.timers.evaluate(now, current, &self.config) {
            TimerAction::Nothing => Action::Done,
            TimerAction::ConnectionExpired => {
                tracing::warn!("Peer unreachable, clearing tunnel state");
                self.clear(now);
                Action::Err(TunnelError::ConnectionExpired)
            }
            TimerAction::RetryHandshake => {
                tracing::debug!("Retrying handshake (attempt {})", self.timers.attempts + 1);
                self.send_initiation(now, true, dst)
            }
            TimerAction::StartHandshake => {
                tracing::debug!("Starting rekey handshake");
                self.send_initiation(now, false, dst)
            }
            TimerAction::SendKeepalive => self.send_keepalive(now, dst),
        }
    }

    /// Start a new handshake now, regardless of timers
    pub fn force_handshake(&mut self, dst: &mut [u8]) -> Action {
        let now = self.clock.now();
        self.send_initiation(now, false, dst)
    }

    /// Wipe all key material and release the tunnel
    pub fn destroy(mut self) {
        let now = self.clock.now();
        self.clear(now);
    }

    fn count_tx(&mut self, n: usize) {
        self.counters.tx_bytes += n as u64;
        self.counters.tx_packets += 1;
    }

    fn count_rx(&mut self, n: usize) {
        self.counters.rx_bytes += n as u64;
        self.counters.rx_packets += 1;
    }

    fn enqueue(&mut self, packet: &[u8]) {
        if self.queue.len() >= self.config.queue_depth {
            tracing::debug!("Outbound queue full, dropping oldest packet");
            self.queue.pop_front();
        }
        self.queue.push_back(Zeroizing::new(packet.to_vec()));
    }

    /// Release the index of a handshake that no session carries
    fn release_pending(&mut self, now: Duration) {
        if let Some(index) = self.handshake.pending_index() {
            if !self.sessions.indices().any(|i| i == index) {
                self.indices.retire(index, now);
            }
        }
    }

    fn clear(&mut self, now: Duration) {
        self.release_pending(now);
        for index in self.sessions.clear() {
            self.indices.retire(index, now);
        }
        self.handshake.clear();
        self.timers.clear();
        self.queue.clear();
    }

    fn send_initiation(&mut self, now: Duration, retry: bool, dst: &mut [u8]) -> Action {
        let needed = HandshakeInitiation::SIZE;
        if dst.len() < needed {
            return Action::Err(TunnelError::BufferTooSmall {
                needed,
                available: dst.len(),
            });
        }

        self.release_pending(now);
        let index = self.indices.allocate(now);

        match self.handshake.format_initiation(index, now) {
            Ok(msg) => {
                dst[..needed].copy_from_slice(&msg);
                self.timers.on_initiation_sent(now, retry, self.config.max_jitter);
                self.count_tx(needed);
                Action::WriteToNetwork(needed)
            }
            Err(e) => {
                tracing::debug!("Could not build initiation: {}", e);
                self.indices.retire(index, now);
                Action::Done
            }
        }
    }

    fn send_keepalive(&mut self, now: Duration, dst: &mut [u8]) -> Action {
        let Some(session) = self.sessions.current_mut() else {
            return Action::Done;
        };

        match session.encrypt(&[], dst) {
            Ok(n) => {
                self.timers.on_keepalive_sent(now);
                self.count_tx(n);
                Action::WriteToNetwork(n)
            }
            Err(e) => Action::Err(e),
        }
    }

    /// Encrypt the oldest queued packet with the current session
    fn flush_queue(&mut self, now: Duration, dst: &mut [u8]) -> Action {
        let Some(session) = self.sessions.current_mut() else {
            return Action::Done;
        };
        let Some(packet) = self.queue.pop_front() else {
            return Action::Done;
        };

        match session.encrypt(&packet, dst) {
            Ok(n) => {
                self.timers.on_packet_sent(now, true);
                self.count_tx(n);
                Action::WriteToNetwork(n)
            }
            Err(e) => {
                self.queue.push_front(packet);
                Action::Err(e)
            }
        }
    }

    /// mac1 check and load gating shared by initiations and responses.
    ///
    /// Returns the action to stop with if the message must not be processed.
    fn admit_handshake(
        &mut self,
        src: Option<SocketAddr>,
        datagram: &[u8],
        mac1_offset: usize,
        sender_index: u32,
        mac1: &[u8; 16],
        now: Duration,
        dst: &mut [u8],
    ) -> Option<Action> {
        if let Err(e) = self.handshake.verify_mac1(datagram, mac1_offset) {
            tracing::debug!("Dropping handshake message: {}", e);
            return Some(Action::Done);
        }

        if !self.cookies.record_handshake(now) {
            return None;
        }

        let src = source_bytes(src);
        let mac2_offset = mac1_offset + mac1.len();
        if self.cookies.verify_mac2(datagram, mac2_offset, &src, now) {
            return None;
        }

        if dst.len() < CookieReply::SIZE {
            return Some(Action::Err(TunnelError::BufferTooSmall {
                needed: CookieReply::SIZE,
                available: dst.len(),
            }));
        }

        tracing::debug!("Under load, answering index {} with a cookie", sender_index);
        match self.cookies.make_reply(sender_index, mac1, &src, now) {
            Ok(reply) => {
                dst[..CookieReply::SIZE].copy_from_slice(&reply.to_bytes());
                self.count_tx(CookieReply::SIZE);
                Some(Action::WriteToNetwork(CookieReply::SIZE))
            }
            Err(e) => {
                tracing::debug!("Could not build cookie reply: {}", e);
                Some(Action::Done)
            }
        }
    }

    fn handle_initiation(
        &mut self,
        src: Option<SocketAddr>,
        datagram: &[u8],
        msg: &HandshakeInitiation,
        now: Duration,
        dst: &mut [u8],
    ) -> Action {
        if let Some(action) = self.admit_handshake(
            src,
            datagram,
            HandshakeInitiation::MAC1_OFFSET,
            msg.sender_index,
            &msg.mac1,
            now,
            dst,
        ) {
            return action;
        }

        let needed = HandshakeResponse::SIZE;
        if dst.len() < needed {
            return Action::Err(TunnelError::BufferTooSmall {
                needed,
                available: dst.len(),
            });
        }

        let superseded = self.handshake.pending_index();
        if let Err(e) = self.handshake.consume_initiation(msg) {
            tracing::debug!("Dropping initiation: {}", e);
            return Action::Done;
        }
        if let Some(index) = superseded {
            if !self.sessions.indices().any(|i| i == index) {
                self.indices.retire(index, now);
            }
        }
        self.timers.on_packet_received(now, false);
        self.count_rx(datagram.len());

        let index = self.indices.allocate(now);
        match self.handshake.format_response(index, now) {
            Ok((response, material)) => {
                let session = Session::new(material, now, self.config.reject_after_messages);
                if let Some(old) = self.sessions.install_next(session) {
                    self.indices.retire(old, now);
                }
                dst[..needed].copy_from_slice(&response);
                self.timers.on_packet_sent(now, false);
                self.count_tx(needed);
                Action::WriteToNetwork(needed)
            }
            Err(e) => {
                tracing::debug!("Could not build response: {}", e);
                self.indices.retire(index, now);
                Action::Done
            }
        }
    }

    fn handle_response(
        &mut self,
        src: Option<SocketAddr>,
        datagram: &[u8],
        msg: &HandshakeResponse,
        now: Duration,
        dst: &mut [u8],
    ) -> Action {
        if let Some(action) = self.admit_handshake(
            src,
            datagram,
            HandshakeResponse::MAC1_OFFSET,
            msg.sender_index,
            &msg.mac1,
            now,
            dst,
        ) {
            return action;
        }

        let material = match self.handshake.consume_response(msg) {
            Ok(material) => material,
            Err(e) => {
                tracing::debug!("Dropping response: {}", e);
                return Action::Done;
            }
        };

        tracing::info!(
            "Session established: local={} remote={}",
            material.local_index,
            material.remote_index
        );

        let session = Session::new(material, now, self.config.reject_after_messages);
        if let Some(old) = self.sessions.install_current(session) {
            self.indices.retire(old, now);
        }
        self.timers.on_packet_received(now, false);
        self.timers.on_handshake_complete(now, Role::Initiator);
        self.count_rx(datagram.len());

        self.flush_queue(now, dst)
    }

    fn handle_cookie(&mut self, reply: &CookieReply, now: Duration, dst: &mut [u8]) -> Action {
        let needed = HandshakeInitiation::SIZE;
        if dst.len() < needed {
            return Action::Err(TunnelError::BufferTooSmall {
                needed,
                available: dst.len(),
            });
        }

        match self.handshake.consume_cookie(reply, now) {
            Ok(Some(initiation)) => {
                tracing::debug!("Cookie received, re-sending initiation");
                dst[..needed].copy_from_slice(&initiation);
                self.timers.on_packet_sent(now, false);
                self.count_tx(needed);
                Action::WriteToNetwork(needed)
            }
            Ok(None) => Action::Done,
            Err(e) => {
                tracing::debug!("Dropping cookie reply: {}", e);
                Action::Done
            }
        }
    }

    fn handle_data(&mut self, data: &TransportData<'_>, now: Duration, dst: &mut [u8]) -> Action {
        let Some((slot, session)) = self.sessions.find_mut(data.receiver_index) else {
            tracing::debug!("Dropping packet for unknown index {}", data.receiver_index);
            return Action::Done;
        };
        let local_index = session.local_index;

        let len = match session.decrypt(data, dst) {
            Ok(Some(len)) => len,
            Ok(None) => return Action::Done,
            Err(e) => return Action::Err(e),
        };

        if slot == Slot::Next {
            tracing::info!("Session {} confirmed by peer", local_index);
            if let Some(old) = self.sessions.promote_next() {
                self.indices.retire(old, now);
            }
            self.handshake.confirm(local_index);
            self.timers.on_handshake_complete(now, Role::Responder);
        }

        self.timers.on_packet_received(now, len > 0);
        self.count_rx(TransportData::HEADER_SIZE + data.payload.len());

        if len == 0 {
            tracing::trace!("Keepalive received");
            return Action::Done;
        }

        match ip_packet_len(&dst[..len]) {
            Ok((IpVersion::V4, n)) => Action::WriteToTunnelV4(n),
            Ok((IpVersion::V6, n)) => Action::WriteToTunnelV6(n),
            Err(e) => {
                tracing::debug!("Decrypted payload is not an IP packet");
                Action::Err(TunnelError::Decode(e))
            }
        }
    }
}

impl std::fmt::Debug for Tunn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunn")
            .field("peer", self.handshake.peer_public())
            .field("phase", &self.handshake.phase())
            .field("sessions", &self.sessions)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::x25519::generate_keypair;

    const BUF: usize = 2048;

    fn config() -> TunnelConfig {
        TunnelConfig {
            max_jitter: Duration::ZERO,
            ..TunnelConfig::default()
        }
    }

    fn pair_with(config: TunnelConfig) -> (Tunn, Tunn, ManualClock) {
        let clock = ManualClock::new();
        let (a_secret, a_public) = generate_keypair();
        let (b_secret, b_public) = generate_keypair();
        let a = Tunn::with_clock(a_secret, b_public, config.clone(), Box::new(clock.clone()))
            .unwrap();
        let b = Tunn::with_clock(b_secret, a_public, config, Box::new(clock.clone())).unwrap();
        (a, b, clock)
    }

    fn ipv4_packet(payload_len: usize) -> Vec<u8> {
        let total = 20 + payload_len;
        let mut packet = vec![0u8; total];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        packet[9] = 17;
        for (i, b) in packet[20..].iter_mut().enumerate() {
            *b = i as u8;
        }
        packet
    }

    /// Complete a handshake initiated by `a`
    fn establish(a: &mut Tunn, b: &mut Tunn) {
        let mut buf = [0u8; BUF];
        let mut out = [0u8; BUF];

        let Action::WriteToNetwork(n) = a.force_handshake(&mut buf) else {
            panic!("no initiation");
        };
        let Action::WriteToNetwork(m) = b.on_inbound_datagram(&buf[..n], &mut out) else {
            panic!("no response");
        };
        assert_eq!(a.on_inbound_datagram(&out[..m], &mut buf), Action::Done);
    }

    #[test]
    fn test_invalid_peer_key() {
        let (secret, _) = generate_keypair();
        assert!(matches!(
            Tunn::new(secret, PublicKey::from_bytes([0u8; 32]), config()),
            Err(ConfigError::InvalidKey { .. })
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (secret, _) = generate_keypair();
        let (_, peer) = generate_keypair();
        let bad = TunnelConfig {
            queue_depth: 0,
            ..config()
        };
        assert!(matches!(
            Tunn::new(secret, peer, bad),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_from_base64_rejects_garbage() {
        let (_, peer) = generate_keypair();
        assert!(matches!(
            Tunn::from_base64("not a key", &peer.to_base64(), config()),
            Err(ConfigError::KeyFormat { .. })
        ));
    }

    #[test]
    fn test_outbound_queues_and_starts_handshake() {
        let (mut a, mut b, _) = pair_with(config());
        let mut buf = [0u8; BUF];
        let mut out = [0u8; BUF];
        let first = ipv4_packet(10);
        let second = ipv4_packet(30);

        let Action::WriteToNetwork(n) = a.on_outbound_packet(&first, &mut buf) else {
            panic!("expected initiation");
        };
        assert_eq!(n, HandshakeInitiation::SIZE);
        // Second packet waits behind the handshake already in flight
        assert_eq!(a.on_outbound_packet(&second, &mut out), Action::Done);
        assert_eq!(a.stats().queued_packets, 2);

        let Action::WriteToNetwork(m) = b.on_inbound_datagram(&buf[..n], &mut out) else {
            panic!("expected response");
        };

        // Completing the handshake releases the first queued packet
        let Action::WriteToNetwork(k) = a.on_inbound_datagram(&out[..m], &mut buf) else {
            panic!("expected queued packet");
        };
        assert_eq!(
            b.on_inbound_datagram(&buf[..k], &mut out),
            Action::WriteToTunnelV4(first.len())
        );
        assert_eq!(&out[..first.len()], &first[..]);

        // The rest drains with empty reads
        let Action::WriteToNetwork(k) = a.on_inbound_datagram(&[], &mut buf) else {
            panic!("expected second queued packet");
        };
        assert_eq!(
            b.on_inbound_datagram(&buf[..k], &mut out),
            Action::WriteToTunnelV4(second.len())
        );
        assert_eq!(a.on_inbound_datagram(&[], &mut buf), Action::Done);
    }

    #[test]
    fn test_queue_depth_bounded() {
        let (mut a, _, _) = pair_with(TunnelConfig {
            queue_depth: 2,
            ..config()
        });
        let mut buf = [0u8; BUF];
        for _ in 0..5 {
            a.on_outbound_packet(&ipv4_packet(1), &mut buf);
        }
        assert_eq!(a.stats().queued_packets, 2);
    }

    #[test]
    fn test_responder_session_confirmed_by_data() {
        let (mut a, mut b, _) = pair_with(config());
        establish(&mut a, &mut b);

        assert!(a.is_established());
        assert!(!b.is_established());
        assert_eq!(b.handshake_phase(), HandshakePhase::ResponseSent);

        let mut buf = [0u8; BUF];
        let mut out = [0u8; BUF];
        let Action::WriteToNetwork(n) = a.on_outbound_packet(&ipv4_packet(4), &mut buf) else {
            panic!("expected data");
        };
        assert_eq!(
            b.on_inbound_datagram(&buf[..n], &mut out),
            Action::WriteToTunnelV4(24)
        );
        assert!(b.is_established());
        assert_eq!(b.handshake_phase(), HandshakePhase::Established);
    }

    #[test]
    fn test_confirmation_keepalive_on_next_tick() {
        let (mut a, mut b, _) = pair_with(config());
        establish(&mut a, &mut b);

        let mut buf = [0u8; BUF];
        let mut out = [0u8; BUF];
        let Action::WriteToNetwork(n) = a.on_tick(&mut buf) else {
            panic!("expected keepalive");
        };
        assert_eq!(n, TransportData::MIN_SIZE);
        assert_eq!(a.on_tick(&mut buf), Action::Done);

        assert_eq!(b.on_inbound_datagram(&buf[..n], &mut out), Action::Done);
        assert!(b.is_established());
    }

    #[test]
    fn test_buffer_too_small_reports_size() {
        let (mut a, _, _) = pair_with(config());
        let mut small = [0u8; 100];
        assert_eq!(
            a.force_handshake(&mut small),
            Action::Err(TunnelError::BufferTooSmall {
                needed: 148,
                available: 100
            })
        );
    }

    #[test]
    fn test_cookie_under_load() {
        let (mut a, mut b, _) = pair_with(TunnelConfig {
            handshake_rate_limit: 0,
            ..config()
        });
        let mut buf = [0u8; BUF];
        let mut out = [0u8; BUF];

        let Action::WriteToNetwork(n) = a.force_handshake(&mut buf) else {
            panic!("expected initiation");
        };
        let Action::WriteToNetwork(c) = b.on_inbound_datagram(&buf[..n], &mut out) else {
            panic!("expected cookie reply");
        };
        assert_eq!(c, CookieReply::SIZE);
        assert_eq!(b.handshake_phase(), HandshakePhase::Idle);

        // The initiator re-sends with a valid mac2
        let Action::WriteToNetwork(n) = a.on_inbound_datagram(&out[..c], &mut buf) else {
            panic!("expected re-sent initiation");
        };
        assert_eq!(n, HandshakeInitiation::SIZE);
        assert_eq!(a.handshake_phase(), HandshakePhase::InitiationSent);

        let Action::WriteToNetwork(m) = b.on_inbound_datagram(&buf[..n], &mut out) else {
            panic!("expected response");
        };
        assert_eq!(m, HandshakeResponse::SIZE);
    }

    #[test]
    fn test_retry_then_link_down() {
        let (mut a, _, clock) = pair_with(TunnelConfig {
            max_handshake_attempts: 3,
            ..config()
        });
        let mut buf = [0u8; BUF];

        assert!(matches!(a.force_handshake(&mut buf), Action::WriteToNetwork(148)));
        assert_eq!(a.on_tick(&mut buf), Action::Done);

        clock.advance(Duration::from_secs(5));
        assert!(matches!(a.on_tick(&mut buf), Action::WriteToNetwork(148)));
        assert_eq!(a.on_tick(&mut buf), Action::Done);

        clock.advance(Duration::from_secs(5));
        assert!(matches!(a.on_tick(&mut buf), Action::WriteToNetwork(148)));

        clock.advance(Duration::from_secs(5));
        assert_eq!(
            a.on_tick(&mut buf),
            Action::Err(TunnelError::ConnectionExpired)
        );
        assert_eq!(a.handshake_phase(), HandshakePhase::Idle);
        assert_eq!(a.on_tick(&mut buf), Action::Done);
    }

    #[test]
    fn test_cookie_resend_keeps_retry_clock() {
        let (mut a, mut b, clock) = pair_with(TunnelConfig {
            handshake_rate_limit: 0,
            max_handshake_attempts: 1,
            ..config()
        });
        let mut buf = [0u8; BUF];
        let mut out = [0u8; BUF];

        let Action::WriteToNetwork(n) = a.force_handshake(&mut buf) else {
            panic!("expected initiation");
        };
        let Action::WriteToNetwork(c) = b.on_inbound_datagram(&buf[..n], &mut out) else {
            panic!("expected cookie reply");
        };

        clock.advance(Duration::from_secs(4));
        assert_eq!(
            a.on_inbound_datagram(&out[..c], &mut buf),
            Action::WriteToNetwork(HandshakeInitiation::SIZE)
        );

        // Still measured from the first initiation of the attempt
        clock.advance(Duration::from_secs(1));
        assert_eq!(
            a.on_tick(&mut buf),
            Action::Err(TunnelError::ConnectionExpired)
        );
    }

    #[test]
    fn test_dead_peer_takes_link_down() {
        let (mut a, mut b, clock) = pair_with(TunnelConfig {
            dead_peer_timeout: Duration::from_secs(180),
            max_handshake_attempts: 10_000,
            ..config()
        });
        establish(&mut a, &mut b);
        let mut buf = [0u8; BUF];

        // B goes silent; A keeps retrying its rekey
        let mut expired_at = None;
        for step in 1..=2000u64 {
            clock.advance(Duration::from_millis(100));
            if a.on_tick(&mut buf) == Action::Err(TunnelError::ConnectionExpired) {
                expired_at = Some(Duration::from_millis(step * 100));
                break;
            }
        }
        assert_eq!(expired_at, Some(Duration::from_secs(180)));
        assert!(!a.is_established());
        assert_eq!(a.handshake_phase(), HandshakePhase::Idle);
    }

    #[test]
    fn test_sessions_expire() {
        let (mut a, mut b, clock) = pair_with(config());
        establish(&mut a, &mut b);
        let mut buf = [0u8; BUF];
        a.on_tick(&mut buf);

        clock.advance(Duration::from_secs(180));
        a.on_tick(&mut buf);
        assert!(!a.is_established());
    }

    #[test]
    fn test_stats_serialize() {
        let (mut a, mut b, clock) = pair_with(config());
        establish(&mut a, &mut b);
        clock.advance(Duration::from_secs(2));

        let stats = a.stats();
        assert!(stats.established);
        assert_eq!(stats.time_since_last_handshake, Some(Duration::from_secs(2)));
        assert_eq!(stats.tx_packets, 1);
        assert_eq!(stats.rx_packets, 1);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["phase"], "Established");
        assert_eq!(json["tx_bytes"], 148);
    }

    #[test]
    fn test_tunn_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Tunn>();
    }
}
