//! BLAKE2s hashing, keyed MACs and the HMAC-based KDF chain used by the handshake.

use blake2::{
    digest::{consts::U16, FixedOutput, Mac as MacTrait, Update},
    Blake2s256, Blake2sMac, Digest,
};
use hmac::SimpleHmac;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// RFC 2104 HMAC over BLAKE2s-256
type HmacBlake2s = SimpleHmac<Blake2s256>;

/// Length of BLAKE2s-256 hash output
pub const HASH_LEN: usize = 32;

/// Length of the truncated keyed MAC carried in handshake messages
pub const MAC_LEN: usize = 16;

/// BLAKE2s-256 hash of a single input
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, data);
    hasher.finalize().into()
}

/// HASH(a || b)
pub fn hash_two(a: &[u8], b: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, a);
    Digest::update(&mut hasher, b);
    hasher.finalize().into()
}

/// Keyed BLAKE2s with a 16-byte output.
///
/// `key` may be 16 bytes (cookie, for mac2) or 32 bytes (mac1 key, cookie
/// secret); BLAKE2s accepts any key up to 32 bytes.
pub fn mac(key: &[u8], data: &[u8]) -> [u8; MAC_LEN] {
    debug_assert!(key.len() <= HASH_LEN);
    let mut mac =
        <Blake2sMac<U16> as MacTrait>::new_from_slice(key).expect("key is at most 32 bytes");
    MacTrait::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// Constant-time comparison of two MAC tags
pub fn mac_eq(a: &[u8; MAC_LEN], b: &[u8; MAC_LEN]) -> bool {
    a.ct_eq(b).into()
}

/// HMAC-BLAKE2s. The KDF uses the standard RFC 2104 construction, as every
/// interoperable implementation of the protocol does.
pub fn hmac(key: &[u8], data: &[u8]) -> [u8; HASH_LEN] {
    let mut mac = HmacBlake2s::new_from_slice(key).expect("HMAC accepts any key length");
    Update::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// HKDF-style expansion producing `N` chained outputs:
/// T0 = HMAC(key, input); T1 = HMAC(T0, 0x01); Ti = HMAC(T0, Ti-1 || i)
fn kdf<const N: usize>(key: &[u8; HASH_LEN], input: &[u8]) -> [[u8; HASH_LEN]; N] {
    let mut prk = hmac(key, input);
    let mut out = [[0u8; HASH_LEN]; N];

    let mut block = [0u8; HASH_LEN + 1];
    for i in 0..N {
        let counter = (i + 1) as u8;
        out[i] = if i == 0 {
            hmac(&prk, &[counter])
        } else {
            block[..HASH_LEN].copy_from_slice(&out[i - 1]);
            block[HASH_LEN] = counter;
            hmac(&prk, &block)
        };
    }

    prk.zeroize();
    block.zeroize();
    out
}

/// KDF1: one 32-byte output
pub fn kdf1(key: &[u8; HASH_LEN], input: &[u8]) -> [u8; HASH_LEN] {
    let [t1] = kdf::<1>(key, input);
    t1
}

/// KDF2: two 32-byte outputs
pub fn kdf2(key: &[u8; HASH_LEN], input: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let [t1, t2] = kdf::<2>(key, input);
    (t1, t2)
}

/// KDF3: three 32-byte outputs
pub fn kdf3(
    key: &[u8; HASH_LEN],
    input: &[u8],
) -> ([u8; HASH_LEN], [u8; HASH_LEN], [u8; HASH_LEN]) {
    let [t1, t2, t3] = kdf::<3>(key, input);
    (t1, t2, t3)
}
