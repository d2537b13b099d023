//! Cryptographic primitives for the tunnel protocol
//!
//! - BLAKE2s hashing, keyed MAC and the HMAC KDF chain (blake2s)
//! - ChaCha20-Poly1305 / XChaCha20-Poly1305 AEAD (aead)
//! - X25519 key pairs and Diffie-Hellman (x25519)
//! - base64/hex key encodings (keys)
//! - Noise IKpsk2 symmetric state (noise)

pub mod aead;
pub mod blake2s;
pub mod keys;
pub mod noise;
pub mod x25519;

pub use keys::validate_key_string;
pub use x25519::{derive_public, dh, generate_keypair, PublicKey, SecretKey};
