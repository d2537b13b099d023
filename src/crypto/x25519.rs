//! X25519 Diffie-Hellman key exchange
//!
//! Provides key generation and DH operations using Curve25519.

use std::fmt;

use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as DalekPublic, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// Key length for X25519 (both private and public keys are 32 bytes)
pub const KEY_LEN: usize = 32;

/// X25519 secret scalar. Wiped when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    /// Generate a new random secret key
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng).to_bytes())
    }

    /// Wrap raw bytes (clamping happens at use)
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Copy out the raw bytes
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.0
    }

    /// Public key via scalar multiplication on the base point
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(DalekPublic::from(&secret).to_bytes())
    }

    /// Diffie-Hellman with `public`.
    ///
    /// Fails if the result is all zeros, which happens for low-order points.
    pub fn dh(&self, public: &PublicKey) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
        let secret = StaticSecret::from(self.0);
        let shared = secret.diffie_hellman(&DalekPublic::from(public.0));
        let out = Zeroizing::new(shared.to_bytes());

        if bool::from(out.ct_eq(&[0u8; KEY_LEN])) {
            return Err(CryptoError::DiffieHellman);
        }
        Ok(out)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([redacted])")
    }
}

/// X25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    /// Wrap raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Copy out the raw bytes
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.0
    }

    /// Reject the all-zero key (identity point)
    pub fn is_valid(&self) -> bool {
        !bool::from(self.0.ct_eq(&[0u8; KEY_LEN]))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..4]))
    }
}

/// Generate a new X25519 keypair
pub fn generate_keypair() -> (SecretKey, PublicKey) {
    let secret = SecretKey::generate();
    let public = secret.public_key();
    (secret, public)
}

/// Derive the public key from a secret key
pub fn derive_public(secret: &SecretKey) -> PublicKey {
    secret.public_key()
}

/// Perform X25519 Diffie-Hellman key exchange
pub fn dh(secret: &SecretKey, public: &PublicKey) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    secret.dh(public)
}
