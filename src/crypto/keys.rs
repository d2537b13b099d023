//! Text encodings for 32-byte keys
//!
//! Keys travel as base64 (configuration files, the C boundary) or hex
//! (diagnostics). Decoding never panics; malformed text is a
//! [`ConfigError::KeyFormat`].

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use super::x25519::{PublicKey, SecretKey, KEY_LEN};
use crate::error::ConfigError;

/// Base64 encoding of a raw key
pub fn to_base64(key: &[u8; KEY_LEN]) -> String {
    BASE64.encode(key)
}

/// Lowercase hex encoding of a raw key
pub fn to_hex(key: &[u8; KEY_LEN]) -> String {
    hex::encode(key)
}

/// True iff `s` is base64 that decodes to exactly 32 bytes
pub fn validate_key_string(s: &str) -> bool {
    matches!(BASE64.decode(s), Ok(bytes) if bytes.len() == KEY_LEN)
}

/// Decode a base64 key, naming `field` in the error
pub fn from_base64(value: &str, field: &str) -> Result<[u8; KEY_LEN], ConfigError> {
    let bytes = BASE64
        .decode(value.trim())
        .map_err(|e| ConfigError::KeyFormat {
            field: field.to_string(),
            reason: e.to_string(),
        })?;
    to_key(bytes, field)
}

/// Decode a hex key, naming `field` in the error
pub fn from_hex(value: &str, field: &str) -> Result<[u8; KEY_LEN], ConfigError> {
    let bytes = hex::decode(value.trim()).map_err(|e| ConfigError::KeyFormat {
        field: field.to_string(),
        reason: e.to_string(),
    })?;
    to_key(bytes, field)
}

fn to_key(bytes: Vec<u8>, field: &str) -> Result<[u8; KEY_LEN], ConfigError> {
    <[u8; KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| ConfigError::KeyFormat {
        field: field.to_string(),
        reason: format!("expected {} bytes, got {}", KEY_LEN, bytes.len()),
    })
}

impl SecretKey {
    /// Parse from base64
    pub fn from_base64(value: &str) -> Result<Self, ConfigError> {
        let mut bytes = from_base64(value, "PrivateKey")?;
        let key = Self::from_bytes(bytes);
        zeroize::Zeroize::zeroize(&mut bytes);
        Ok(key)
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        to_base64(&self.to_bytes())
    }
}

impl PublicKey {
    /// Parse from base64
    pub fn from_base64(value: &str) -> Result<Self, ConfigError> {
        from_base64(value, "PublicKey").map(Self::from_bytes)
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        to_base64(self.as_bytes())
    }

    /// Encode as hex
    pub fn to_hex(&self) -> String {
        to_hex(self.as_bytes())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}
