//! AEAD encryption
//!
//! ChaCha20-Poly1305 protects handshake payloads and transport data;
//! XChaCha20-Poly1305 protects cookie replies. The transport variants work
//! in place on caller-owned buffers so the data path never allocates.

use chacha20poly1305::{
    aead::{Aead, AeadInPlace, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce, Tag, XChaCha20Poly1305, XNonce,
};

use crate::error::CryptoError;

/// Authentication tag length
pub const TAG_LEN: usize = 16;

/// ChaCha20-Poly1305 key length
pub const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 12;

/// XChaCha20-Poly1305 nonce length
pub const XNONCE_LEN: usize = 24;

/// 96-bit nonce: 4 zero bytes followed by the little-endian counter
fn counter_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypt `plaintext`, returning ciphertext || tag
pub fn encrypt(
    key: &[u8; KEY_LEN],
    counter: u64,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = counter_nonce(counter);

    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt ciphertext || tag
pub fn decrypt(
    key: &[u8; KEY_LEN],
    counter: u64,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = counter_nonce(counter);

    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

/// Encrypt `plaintext` into `out`, which must hold `plaintext.len() + TAG_LEN`
/// bytes. Returns the number of bytes written.
pub fn seal_into(
    key: &[u8; KEY_LEN],
    counter: u64,
    plaintext: &[u8],
    out: &mut [u8],
) -> Result<usize, CryptoError> {
    let total = plaintext.len() + TAG_LEN;
    if out.len() < total {
        return Err(CryptoError::Encryption);
    }

    let (body, rest) = out.split_at_mut(plaintext.len());
    body.copy_from_slice(plaintext);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = counter_nonce(counter);
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), &[], body)
        .map_err(|_| CryptoError::Encryption)?;
    rest[..TAG_LEN].copy_from_slice(&tag);

    Ok(total)
}

/// Decrypt `ciphertext` (body || tag) into `out`. Returns the plaintext length.
///
/// On failure the partially written `out` is wiped.
pub fn open_into(
    key: &[u8; KEY_LEN],
    counter: u64,
    ciphertext: &[u8],
    out: &mut [u8],
) -> Result<usize, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    let len = ciphertext.len() - TAG_LEN;
    if out.len() < len {
        return Err(CryptoError::Decryption);
    }

    let (body, tag) = ciphertext.split_at(len);
    let out = &mut out[..len];
    out.copy_from_slice(body);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = counter_nonce(counter);
    if cipher
        .decrypt_in_place_detached(Nonce::from_slice(&nonce), &[], out, Tag::from_slice(tag))
        .is_err()
    {
        out.fill(0);
        return Err(CryptoError::Decryption);
    }

    Ok(len)
}

/// Encrypt using XChaCha20-Poly1305 (cookie replies)
pub fn xencrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));

    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt using XChaCha20-Poly1305 (cookie replies)
pub fn xdecrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));

    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = [0u8; 32];
        let plaintext = b"Hello, tunnel!";
        let aad = b"additional data";

        let ciphertext = encrypt(&key, 42, plaintext, aad).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_LEN);

        let decrypted = decrypt(&key, 42, &ciphertext, aad).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_decrypt_wrong_counter_or_aad() {
        let key = [9u8; 32];
        let ciphertext = encrypt(&key, 42, b"payload", b"aad").unwrap();

        assert!(decrypt(&key, 43, &ciphertext, b"aad").is_err());
        assert!(decrypt(&key, 42, &ciphertext, b"other").is_err());
        assert!(decrypt(&[1u8; 32], 42, &ciphertext, b"aad").is_err());
    }

    #[test]
    fn test_seal_into_matches_encrypt() {
        let key = [5u8; 32];
        let plaintext = [0xABu8; 40];
        let mut out = [0u8; 64];

        let n = seal_into(&key, 7, &plaintext, &mut out).unwrap();
        assert_eq!(n, plaintext.len() + TAG_LEN);
        assert_eq!(&out[..n], &encrypt(&key, 7, &plaintext, &[]).unwrap()[..]);

        let mut opened = [0u8; 64];
        let len = open_into(&key, 7, &out[..n], &mut opened).unwrap();
        assert_eq!(&opened[..len], &plaintext[..]);
    }

    #[test]
    fn test_open_into_wipes_on_failure() {
        let key = [5u8; 32];
        let mut sealed = [0u8; 32];
        let n = seal_into(&key, 0, &[1u8; 16], &mut sealed).unwrap();
        sealed[0] ^= 0xFF;

        let mut out = [0u8; 32];
        assert!(open_into(&key, 0, &sealed[..n], &mut out).is_err());
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_seal_into_short_buffer() {
        let mut out = [0u8; 10];
        assert_eq!(
            seal_into(&[0u8; 32], 0, &[0u8; 4], &mut out),
            Err(CryptoError::Encryption)
        );
    }

    #[test]
    fn test_xchacha_roundtrip() {
        let key = [0u8; 32];
        let nonce = [3u8; 24];

        let ciphertext = xencrypt(&key, &nonce, b"cookie data", b"mac1").unwrap();
        let decrypted = xdecrypt(&key, &nonce, &ciphertext, b"mac1").unwrap();
        assert_eq!(decrypted, b"cookie data");
        assert!(xdecrypt(&key, &nonce, &ciphertext, b"mac2").is_err());
    }

    #[test]
    fn test_empty_plaintext() {
        let key = [0u8; 32];

        // The handshake response authenticates an empty payload
        let ciphertext = encrypt(&key, 0, &[], b"").unwrap();
        assert_eq!(ciphertext.len(), TAG_LEN);
        assert!(decrypt(&key, 0, &ciphertext, b"").unwrap().is_empty());
    }
}
