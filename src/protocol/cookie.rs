//! Cookie handling for DoS protection
//!
//! When a responder is under load it answers handshake messages with a
//! Cookie Reply instead of doing DH work. The cookie is a MAC of the
//! sender's source address under a secret that rotates every cookie
//! lifetime. The sender stores it and uses it as the mac2 key on its next
//! attempt.

use std::net::SocketAddr;
use std::time::Duration;

use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{aead, blake2s, noise};
use crate::error::CryptoError;
use crate::protocol::messages::CookieReply;

/// Cookie length
pub const COOKIE_LEN: usize = 16;

/// Length of the rate-limit window
const LOAD_WINDOW: Duration = Duration::from_secs(1);

/// Source address as bytes: IP octets followed by the big-endian port.
/// Unknown sources map to the empty string.
pub fn source_bytes(src: Option<SocketAddr>) -> Vec<u8> {
    match src {
        Some(SocketAddr::V4(addr)) => {
            let mut out = addr.ip().octets().to_vec();
            out.extend_from_slice(&addr.port().to_be_bytes());
            out
        }
        Some(SocketAddr::V6(addr)) => {
            let mut out = addr.ip().octets().to_vec();
            out.extend_from_slice(&addr.port().to_be_bytes());
            out
        }
        None => Vec::new(),
    }
}

/// Cookie received from the peer, used as the mac2 key on later messages
#[derive(Debug, Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct CookieState {
    cookie: Option<[u8; COOKIE_LEN]>,
    #[zeroize(skip)]
    received_at: Duration,
}

impl CookieState {
    /// Create a new empty cookie state
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored cookie if it is younger than `lifetime`
    pub fn get(&self, now: Duration, lifetime: Duration) -> Option<&[u8; COOKIE_LEN]> {
        match &self.cookie {
            Some(cookie) if now.saturating_sub(self.received_at) < lifetime => Some(cookie),
            _ => None,
        }
    }

    /// Decrypt a Cookie Reply and store its cookie.
    ///
    /// `last_mac1` is the mac1 of the message the reply answers;
    /// `peer_public` is the static key of the peer that issued it.
    pub fn consume_reply(
        &mut self,
        reply: &CookieReply,
        last_mac1: &[u8; 16],
        peer_public: &[u8; 32],
        now: Duration,
    ) -> Result<(), CryptoError> {
        let key = noise::cookie_key(peer_public);
        let mut decrypted =
            aead::xdecrypt(&key, &reply.nonce, &reply.encrypted_cookie, last_mac1)?;

        let cookie = <[u8; COOKIE_LEN]>::try_from(decrypted.as_slice())
            .map_err(|_| CryptoError::Decryption);
        decrypted.zeroize();

        self.cookie = Some(cookie?);
        self.received_at = now;

        tracing::debug!("Stored new cookie");
        Ok(())
    }

    /// Clear the stored cookie
    pub fn clear(&mut self) {
        self.zeroize();
    }
}

/// Responder side: load detection and cookie issue
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CookieGenerator {
    /// Rotating secret the cookies are keyed with
    secret: [u8; 32],
    #[zeroize(skip)]
    secret_born: Duration,
    /// HASH("cookie--" || our static public)
    reply_key: [u8; 32],
    #[zeroize(skip)]
    lifetime: Duration,
    #[zeroize(skip)]
    rate_limit: u32,
    #[zeroize(skip)]
    window_start: Duration,
    #[zeroize(skip)]
    window_count: u32,
}

impl CookieGenerator {
    pub fn new(our_public: &[u8; 32], lifetime: Duration, rate_limit: u32, now: Duration) -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self {
            secret,
            secret_born: now,
            reply_key: noise::cookie_key(our_public),
            lifetime,
            rate_limit,
            window_start: now,
            window_count: 0,
        }
    }

    /// Count one handshake message and report whether we are now under load
    pub fn record_handshake(&mut self, now: Duration) -> bool {
        if now.saturating_sub(self.window_start) >= LOAD_WINDOW {
            self.window_start = now;
            self.window_count = 0;
        }
        self.window_count = self.window_count.saturating_add(1);
        self.window_count > self.rate_limit
    }

    fn rotate_if_stale(&mut self, now: Duration) {
        if now.saturating_sub(self.secret_born) >= self.lifetime {
            OsRng.fill_bytes(&mut self.secret);
            self.secret_born = now;
        }
    }

    /// The cookie for a given source address
    pub fn cookie(&mut self, src: &[u8], now: Duration) -> [u8; COOKIE_LEN] {
        self.rotate_if_stale(now);
        blake2s::mac(&self.secret, src)
    }

    /// Check the mac2 of `msg`, which covers `msg[..mac2_offset]`
    pub fn verify_mac2(&mut self, msg: &[u8], mac2_offset: usize, src: &[u8], now: Duration) -> bool {
        let Some(mac2) = msg.get(mac2_offset..mac2_offset + blake2s::MAC_LEN) else {
            return false;
        };
        let mut cookie = self.cookie(src, now);
        let expected = blake2s::mac(&cookie, &msg[..mac2_offset]);
        cookie.zeroize();

        let mut actual = [0u8; blake2s::MAC_LEN];
        actual.copy_from_slice(mac2);
        blake2s::mac_eq(&expected, &actual)
    }

    /// Build a Cookie Reply for a message with `mac1` from `src`
    pub fn make_reply(
        &mut self,
        receiver_index: u32,
        mac1: &[u8; 16],
        src: &[u8],
        now: Duration,
    ) -> Result<CookieReply, CryptoError> {
        let mut cookie = self.cookie(src, now);
        let mut nonce = [0u8; aead::XNONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealed = aead::xencrypt(&self.reply_key, &nonce, &cookie, mac1);
        cookie.zeroize();
        let encrypted_cookie =
            <[u8; 32]>::try_from(sealed?.as_slice()).map_err(|_| CryptoError::Encryption)?;

        Ok(CookieReply {
            receiver_index,
            nonce,
            encrypted_cookie,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    const LIFETIME: Duration = Duration::from_secs(120);

    fn addr() -> Option<SocketAddr> {
        Some(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(10, 0, 0, 1),
            51820,
        )))
    }

    #[test]
    fn test_cookie_state_empty() {
        let state = CookieState::new();
        assert!(state.get(Duration::ZERO, LIFETIME).is_none());
    }

    #[test]
    fn test_source_bytes() {
        assert_eq!(source_bytes(addr()), vec![10, 0, 0, 1, 0xCA, 0x6C]);
        assert!(source_bytes(None).is_empty());
    }

    #[test]
    fn test_reply_roundtrip_and_expiry() {
        let our_public = [8u8; 32];
        let mut generator = CookieGenerator::new(&our_public, LIFETIME, 10, Duration::ZERO);
        let mac1 = [1u8; 16];
        let src = source_bytes(addr());

        let reply = generator.make_reply(77, &mac1, &src, Duration::ZERO).unwrap();
        assert_eq!(reply.receiver_index, 77);

        let mut state = CookieState::new();
        state
            .consume_reply(&reply, &mac1, &our_public, Duration::from_secs(1))
            .unwrap();

        let expected = generator.cookie(&src, Duration::from_secs(1));
        assert_eq!(state.get(Duration::from_secs(2), LIFETIME), Some(&expected));
        assert!(state.get(Duration::from_secs(121), LIFETIME).is_none());

        state.clear();
        assert!(state.get(Duration::from_secs(2), LIFETIME).is_none());
    }

    #[test]
    fn test_reply_bound_to_mac1() {
        let our_public = [8u8; 32];
        let mut generator = CookieGenerator::new(&our_public, LIFETIME, 10, Duration::ZERO);
        let reply = generator
            .make_reply(1, &[1u8; 16], &[], Duration::ZERO)
            .unwrap();

        let mut state = CookieState::new();
        assert!(state
            .consume_reply(&reply, &[2u8; 16], &our_public, Duration::ZERO)
            .is_err());
        assert!(state.get(Duration::ZERO, LIFETIME).is_none());
    }

    #[test]
    fn test_load_detection_window() {
        let mut generator = CookieGenerator::new(&[0u8; 32], LIFETIME, 3, Duration::ZERO);
        let t = Duration::from_millis(100);

        assert!(!generator.record_handshake(t));
        assert!(!generator.record_handshake(t));
        assert!(!generator.record_handshake(t));
        assert!(generator.record_handshake(t));

        // A new window resets the count
        assert!(!generator.record_handshake(Duration::from_millis(1200)));
    }

    #[test]
    fn test_mac2_verification_and_rotation() {
        let mut generator = CookieGenerator::new(&[0u8; 32], LIFETIME, 10, Duration::ZERO);
        let src = source_bytes(addr());

        let mut msg = [0x5Au8; 92];
        let cookie = generator.cookie(&src, Duration::ZERO);
        let mac2 = blake2s::mac(&cookie, &msg[..76]);
        msg[76..92].copy_from_slice(&mac2);

        assert!(generator.verify_mac2(&msg, 76, &src, Duration::from_secs(5)));
        assert!(!generator.verify_mac2(&msg, 76, &[1, 2, 3], Duration::from_secs(5)));

        // The secret rotates after a cookie lifetime
        assert!(!generator.verify_mac2(&msg, 76, &src, Duration::from_secs(121)));
    }
}
