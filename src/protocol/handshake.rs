//! WireGuard handshake implementation
//!
//! Implements the Noise IKpsk2 handshake pattern for key exchange. One
//! [`Handshake`] exists per tunnel and holds at most one exchange in flight.

use std::time::Duration;

use serde::Serialize;
use subtle::ConstantTimeEq;
use tai64::Tai64N;
use zeroize::Zeroizing;

use crate::crypto::blake2s;
use crate::crypto::noise::{self, SymmetricState, TransportKeys};
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::error::{CryptoError, HandshakeError};
use crate::protocol::cookie::CookieState;
use crate::protocol::messages::{CookieReply, HandshakeInitiation, HandshakeResponse};

/// TAI64N timestamp length
pub const TIMESTAMP_LEN: usize = 12;

/// Which side of the handshake created a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    Initiator,
    Responder,
}

/// Observable handshake phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HandshakePhase {
    Idle,
    InitiationSent,
    InitiationReceived,
    ResponseSent,
    Established,
}

/// Initiator state kept until the response arrives
pub struct InitiationSent {
    ephemeral: SecretKey,
    local_index: u32,
    symmetric: SymmetricState,
    timestamp: [u8; TIMESTAMP_LEN],
    /// Sent bytes, kept for re-sending with a fresh mac2
    message: [u8; HandshakeInitiation::SIZE],
    mac1: [u8; 16],
    sent_at: Duration,
}

/// Responder state between consuming an initiation and answering it
pub struct InitiationReceived {
    remote_index: u32,
    peer_ephemeral: PublicKey,
    symmetric: SymmetricState,
}

pub enum HandshakeState {
    Idle,
    InitiationSent(Box<InitiationSent>),
    InitiationReceived(Box<InitiationReceived>),
    ResponseSent { local_index: u32, mac1: [u8; 16] },
    Established,
}

/// Keys and indices of a freshly completed handshake
pub struct SessionMaterial {
    pub local_index: u32,
    pub remote_index: u32,
    pub keys: TransportKeys,
    pub role: Role,
}

/// Write mac1 and mac2 into `msg` and return mac1
fn seal_macs(
    msg: &mut [u8],
    mac1_offset: usize,
    mac1_key: &[u8; 32],
    cookie: Option<&[u8; 16]>,
) -> [u8; 16] {
    let mac2_offset = mac1_offset + blake2s::MAC_LEN;

    let mac1 = blake2s::mac(mac1_key, &msg[..mac1_offset]);
    msg[mac1_offset..mac2_offset].copy_from_slice(&mac1);

    let mac2 = match cookie {
        Some(cookie) => blake2s::mac(cookie, &msg[..mac2_offset]),
        None => [0u8; 16],
    };
    msg[mac2_offset..mac2_offset + blake2s::MAC_LEN].copy_from_slice(&mac2);

    mac1
}

fn sealed<const N: usize>(ciphertext: Vec<u8>) -> Result<[u8; N], HandshakeError> {
    <[u8; N]>::try_from(ciphertext.as_slice()).map_err(|_| CryptoError::Encryption.into())
}

/// Smallest TAI64N value strictly after `ts`
fn bump_timestamp(ts: &[u8; TIMESTAMP_LEN]) -> [u8; TIMESTAMP_LEN] {
    let mut secs = [0u8; 8];
    secs.copy_from_slice(&ts[..8]);
    let mut nanos = [0u8; 4];
    nanos.copy_from_slice(&ts[8..]);

    let mut secs = u64::from_be_bytes(secs);
    let mut nanos = u32::from_be_bytes(nanos) + 1;
    if nanos >= 1_000_000_000 {
        secs += 1;
        nanos = 0;
    }

    let mut out = [0u8; TIMESTAMP_LEN];
    out[..8].copy_from_slice(&secs.to_be_bytes());
    out[8..].copy_from_slice(&nanos.to_be_bytes());
    out
}

/// Handshake engine for one peer
pub struct Handshake {
    static_secret: SecretKey,
    static_public: PublicKey,
    peer_public: PublicKey,
    psk: Zeroizing<[u8; 32]>,
    /// DH(static, peer static), fixed for the life of the tunnel
    static_shared: Zeroizing<[u8; 32]>,
    /// Key for mac1 on messages we send
    peer_mac1_key: [u8; 32],
    /// Key for mac1 on messages we receive
    own_mac1_key: [u8; 32],
    cookie: CookieState,
    cookie_lifetime: Duration,
    state: HandshakeState,
    last_sent_timestamp: [u8; TIMESTAMP_LEN],
    last_received_timestamp: Option<[u8; TIMESTAMP_LEN]>,
}

impl Handshake {
    /// Fails if the peer key is a low-order point.
    pub fn new(
        static_secret: SecretKey,
        peer_public: PublicKey,
        psk: Option<[u8; 32]>,
        cookie_lifetime: Duration,
    ) -> Result<Self, CryptoError> {
        let static_public = static_secret.public_key();
        let static_shared = static_secret.dh(&peer_public)?;

        Ok(Self {
            peer_mac1_key: noise::mac1_key(peer_public.as_bytes()),
            own_mac1_key: noise::mac1_key(static_public.as_bytes()),
            static_secret,
            static_public,
            peer_public,
            psk: Zeroizing::new(psk.unwrap_or([0u8; 32])),
            static_shared,
            cookie: CookieState::new(),
            cookie_lifetime,
            state: HandshakeState::Idle,
            last_sent_timestamp: [0u8; TIMESTAMP_LEN],
            last_received_timestamp: None,
        })
    }

    pub fn static_public(&self) -> &PublicKey {
        &self.static_public
    }

    pub fn peer_public(&self) -> &PublicKey {
        &self.peer_public
    }

    pub fn phase(&self) -> HandshakePhase {
        match self.state {
            HandshakeState::Idle => HandshakePhase::Idle,
            HandshakeState::InitiationSent(_) => HandshakePhase::InitiationSent,
            HandshakeState::InitiationReceived(_) => HandshakePhase::InitiationReceived,
            HandshakeState::ResponseSent { .. } => HandshakePhase::ResponseSent,
            HandshakeState::Established => HandshakePhase::Established,
        }
    }

    /// Local index reserved by the exchange in flight, if any
    pub fn pending_index(&self) -> Option<u32> {
        match &self.state {
            HandshakeState::InitiationSent(sent) => Some(sent.local_index),
            HandshakeState::ResponseSent { local_index, .. } => Some(*local_index),
            _ => None,
        }
    }

    /// When our in-flight initiation was last sent
    pub fn initiation_sent_at(&self) -> Option<Duration> {
        match &self.state {
            HandshakeState::InitiationSent(sent) => Some(sent.sent_at),
            _ => None,
        }
    }

    /// Drop any exchange in flight. Ephemeral keys are wiped.
    pub fn reset(&mut self) {
        self.state = HandshakeState::Idle;
    }

    /// Forget the cookie as well as the exchange
    pub fn clear(&mut self) {
        self.reset();
        self.cookie.clear();
    }

    /// Mark a responder exchange complete once its session is confirmed
    pub fn confirm(&mut self, local_index: u32) {
        if matches!(self.state, HandshakeState::ResponseSent { local_index: i, .. } if i == local_index)
        {
            self.state = HandshakeState::Established;
        }
    }

    /// Check mac1 of a received message, which covers `msg[..mac1_offset]`
    pub fn verify_mac1(&self, msg: &[u8], mac1_offset: usize) -> Result<(), HandshakeError> {
        let Some(actual) = msg.get(mac1_offset..mac1_offset + blake2s::MAC_LEN) else {
            return Err(HandshakeError::InvalidMac1);
        };
        let expected = blake2s::mac(&self.own_mac1_key, &msg[..mac1_offset]);

        if bool::from(expected.as_slice().ct_eq(actual)) {
            Ok(())
        } else {
            Err(HandshakeError::InvalidMac1)
        }
    }

    /// Next local TAI64N timestamp, strictly greater than the previous one
    fn next_timestamp(&mut self, wall: [u8; TIMESTAMP_LEN]) -> [u8; TIMESTAMP_LEN] {
        let ts = if wall > self.last_sent_timestamp {
            wall
        } else {
            bump_timestamp(&self.last_sent_timestamp)
        };
        self.last_sent_timestamp = ts;
        ts
    }

    /// Start a new exchange, superseding any in flight.
    pub fn format_initiation(
        &mut self,
        local_index: u32,
        now: Duration,
    ) -> Result<[u8; HandshakeInitiation::SIZE], HandshakeError> {
        let ephemeral = SecretKey::generate();
        let ephemeral_public = ephemeral.public_key();
        let mut symmetric = SymmetricState::new(self.peer_public.as_bytes());

        // e
        symmetric.mix_hash(ephemeral_public.as_bytes());
        symmetric.mix_chain(ephemeral_public.as_bytes());

        // es, s
        let key = symmetric.mix_key(&*ephemeral.dh(&self.peer_public)?);
        let encrypted_static =
            sealed::<48>(symmetric.encrypt_and_hash(&key, self.static_public.as_bytes())?)?;

        // ss, timestamp
        let key = symmetric.mix_key(&*self.static_shared);
        let timestamp = self.next_timestamp(Tai64N::now().to_bytes());
        let encrypted_timestamp = sealed::<28>(symmetric.encrypt_and_hash(&key, &timestamp)?)?;

        let mut message = HandshakeInitiation {
            sender_index: local_index,
            ephemeral_public: ephemeral_public.to_bytes(),
            encrypted_static,
            encrypted_timestamp,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        }
        .to_bytes();
        let mac1 = seal_macs(
            &mut message,
            HandshakeInitiation::MAC1_OFFSET,
            &self.peer_mac1_key,
            self.cookie.get(now, self.cookie_lifetime),
        );

        tracing::debug!(
            "Initiation ready: index={} ephemeral={:02x?}",
            local_index,
            &ephemeral_public.as_bytes()[..8]
        );

        self.state = HandshakeState::InitiationSent(Box::new(InitiationSent {
            ephemeral,
            local_index,
            symmetric,
            timestamp,
            message,
            mac1,
            sent_at: now,
        }));
        Ok(message)
    }

    /// Authenticate an initiation from the peer.
    ///
    /// On success the state becomes `InitiationReceived`, superseding an
    /// exchange of our own.
    pub fn consume_initiation(&mut self, msg: &HandshakeInitiation) -> Result<(), HandshakeError> {
        let peer_ephemeral = PublicKey::from_bytes(msg.ephemeral_public);
        let mut symmetric = SymmetricState::new(self.static_public.as_bytes());

        symmetric.mix_hash(&msg.ephemeral_public);
        symmetric.mix_chain(&msg.ephemeral_public);

        let key = symmetric.mix_key(&*self.static_secret.dh(&peer_ephemeral)?);
        let peer_static = symmetric.decrypt_and_hash(&key, &msg.encrypted_static)?;
        if !bool::from(peer_static.as_slice().ct_eq(self.peer_public.as_bytes())) {
            return Err(HandshakeError::WrongStaticKey);
        }

        let key = symmetric.mix_key(&*self.static_shared);
        let timestamp = symmetric.decrypt_and_hash(&key, &msg.encrypted_timestamp)?;
        let timestamp = <[u8; TIMESTAMP_LEN]>::try_from(timestamp.as_slice())
            .map_err(|_| CryptoError::Decryption)?;

        if matches!(self.last_received_timestamp, Some(last) if timestamp <= last) {
            return Err(HandshakeError::StaleTimestamp);
        }
        self.last_received_timestamp = Some(timestamp);

        tracing::debug!("Accepted initiation from peer index {}", msg.sender_index);

        self.state = HandshakeState::InitiationReceived(Box::new(InitiationReceived {
            remote_index: msg.sender_index,
            peer_ephemeral,
            symmetric,
        }));
        Ok(())
    }

    /// Answer the initiation consumed last.
    pub fn format_response(
        &mut self,
        local_index: u32,
        now: Duration,
    ) -> Result<([u8; HandshakeResponse::SIZE], SessionMaterial), HandshakeError> {
        let received = match std::mem::replace(&mut self.state, HandshakeState::Idle) {
            HandshakeState::InitiationReceived(received) => received,
            other => {
                self.state = other;
                return Err(HandshakeError::UnexpectedMessage);
            }
        };
        let mut symmetric = received.symmetric.clone();

        let ephemeral = SecretKey::generate();
        let ephemeral_public = ephemeral.public_key();

        // e, ee, se
        symmetric.mix_hash(ephemeral_public.as_bytes());
        symmetric.mix_chain(ephemeral_public.as_bytes());
        symmetric.mix_chain(&*ephemeral.dh(&received.peer_ephemeral)?);
        symmetric.mix_chain(&*ephemeral.dh(&self.peer_public)?);

        // psk, empty payload
        let key = symmetric.mix_key_and_hash(&self.psk);
        let encrypted_nothing = sealed::<16>(symmetric.encrypt_and_hash(&key, &[])?)?;

        let mut message = HandshakeResponse {
            sender_index: local_index,
            receiver_index: received.remote_index,
            ephemeral_public: ephemeral_public.to_bytes(),
            encrypted_nothing,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        }
        .to_bytes();
        let mac1 = seal_macs(
            &mut message,
            HandshakeResponse::MAC1_OFFSET,
            &self.peer_mac1_key,
            self.cookie.get(now, self.cookie_lifetime),
        );

        let material = SessionMaterial {
            local_index,
            remote_index: received.remote_index,
            keys: TransportKeys::derive_responder(&symmetric.chaining_key),
            role: Role::Responder,
        };
        self.state = HandshakeState::ResponseSent { local_index, mac1 };
        Ok((message, material))
    }

    /// Complete our exchange with the peer's response.
    ///
    /// State is untouched unless the response authenticates.
    pub fn consume_response(
        &mut self,
        msg: &HandshakeResponse,
    ) -> Result<SessionMaterial, HandshakeError> {
        let HandshakeState::InitiationSent(sent) = &self.state else {
            return Err(HandshakeError::UnexpectedMessage);
        };
        if msg.receiver_index != sent.local_index {
            return Err(HandshakeError::UnknownIndex {
                index: msg.receiver_index,
            });
        }

        let local_index = sent.local_index;
        let peer_ephemeral = PublicKey::from_bytes(msg.ephemeral_public);
        let mut symmetric = sent.symmetric.clone();

        symmetric.mix_hash(&msg.ephemeral_public);
        symmetric.mix_chain(&msg.ephemeral_public);
        symmetric.mix_chain(&*sent.ephemeral.dh(&peer_ephemeral)?);
        symmetric.mix_chain(&*self.static_secret.dh(&peer_ephemeral)?);

        let key = symmetric.mix_key_and_hash(&self.psk);
        symmetric.decrypt_and_hash(&key, &msg.encrypted_nothing)?;

        tracing::debug!(
            "Handshake complete: local={} remote={} (sent {:02x?})",
            local_index,
            msg.sender_index,
            &sent.timestamp[..8]
        );

        let material = SessionMaterial {
            local_index,
            remote_index: msg.sender_index,
            keys: TransportKeys::derive_initiator(&symmetric.chaining_key),
            role: Role::Initiator,
        };
        self.state = HandshakeState::Established;
        Ok(material)
    }

    /// Store the cookie from a Cookie Reply.
    ///
    /// If our initiation is still in flight, returns it with mac2 recomputed
    /// under the new cookie so it can be sent again.
    pub fn consume_cookie(
        &mut self,
        reply: &CookieReply,
        now: Duration,
    ) -> Result<Option<[u8; HandshakeInitiation::SIZE]>, HandshakeError> {
        let (index, mac1) = match &self.state {
            HandshakeState::InitiationSent(sent) => (sent.local_index, sent.mac1),
            HandshakeState::ResponseSent { local_index, mac1 } => (*local_index, *mac1),
            _ => return Err(HandshakeError::UnexpectedMessage),
        };
        if reply.receiver_index != index {
            return Err(HandshakeError::UnknownIndex {
                index: reply.receiver_index,
            });
        }

        self.cookie
            .consume_reply(reply, &mac1, self.peer_public.as_bytes(), now)?;

        let cookie = self.cookie.get(now, self.cookie_lifetime);
        if let HandshakeState::InitiationSent(sent) = &mut self.state {
            seal_macs(
                &mut sent.message,
                HandshakeInitiation::MAC1_OFFSET,
                &self.peer_mac1_key,
                cookie,
            );
            sent.sent_at = now;
            return Ok(Some(sent.message));
        }
        Ok(None)
    }
}
