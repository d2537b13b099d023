//! Transport layer encryption
//!
//! Seals IP packets into type-4 messages and opens them again, with a
//! sliding anti-replay window per receiving session.

use zeroize::Zeroize;

use crate::crypto::aead;
use crate::error::{CryptoError, DecodeError, TunnelError};
use crate::protocol::messages::TransportData;

/// Number of counters tracked behind the highest one accepted
pub const WINDOW_SIZE: u64 = 2048;

const WORD_BITS: u64 = 64;
const WORDS: usize = (WINDOW_SIZE / WORD_BITS) as usize;

/// Anti-replay window for tracking received packet counters
///
/// A ring bitmap indexed by `counter % WINDOW_SIZE`. `next` is one past the
/// highest counter accepted so far; zero means nothing has been accepted.
#[derive(Debug, Clone, Zeroize)]
pub struct ReplayWindow {
    next: u64,
    bitmap: [u64; WORDS],
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            next: 0,
            bitmap: [0u64; WORDS],
        }
    }

    fn slot(counter: u64) -> (usize, u64) {
        let bit = counter % WINDOW_SIZE;
        ((bit / WORD_BITS) as usize, 1u64 << (bit % WORD_BITS))
    }

    /// Highest counter accepted so far
    pub fn highest(&self) -> Option<u64> {
        self.next.checked_sub(1)
    }

    /// Whether `counter` may still be accepted. Does not modify the window.
    pub fn check(&self, counter: u64) -> bool {
        if counter >= self.next {
            return true;
        }
        // At or below the lower bound
        if counter.saturating_add(WINDOW_SIZE) < self.next {
            return false;
        }
        let (word, mask) = Self::slot(counter);
        self.bitmap[word] & mask == 0
    }

    /// Record `counter` as received. Call only after the packet authenticated.
    pub fn mark(&mut self, counter: u64) {
        if counter >= self.next {
            let gap = counter - self.next;
            if gap >= WINDOW_SIZE {
                self.bitmap = [0u64; WORDS];
            } else {
                for skipped in self.next..counter {
                    let (word, mask) = Self::slot(skipped);
                    self.bitmap[word] &= !mask;
                }
            }
            self.next = counter.saturating_add(1);
        }
        let (word, mask) = Self::slot(counter);
        self.bitmap[word] |= mask;
    }
}

/// Seal `plaintext` into a complete type-4 message in `dst`.
pub fn seal_packet(
    key: &[u8; 32],
    receiver_index: u32,
    counter: u64,
    plaintext: &[u8],
    dst: &mut [u8],
) -> Result<usize, TunnelError> {
    let needed = TransportData::HEADER_SIZE + plaintext.len() + aead::TAG_LEN;
    if dst.len() < needed {
        return Err(TunnelError::BufferTooSmall {
            needed,
            available: dst.len(),
        });
    }

    TransportData::write_header(dst, receiver_index, counter);
    let written = aead::seal_into(
        key,
        counter,
        plaintext,
        &mut dst[TransportData::HEADER_SIZE..needed],
    )
    .map_err(|_| TunnelError::BufferTooSmall {
        needed,
        available: dst.len(),
    })?;

    Ok(TransportData::HEADER_SIZE + written)
}

/// Open the payload of a type-4 message into `dst`.
///
/// `dst` must hold `payload.len() - TAG_LEN` bytes.
pub fn open_packet(
    key: &[u8; 32],
    packet: &TransportData<'_>,
    dst: &mut [u8],
) -> Result<usize, CryptoError> {
    aead::open_into(key, packet.counter, packet.payload, dst)
}

/// IP version of a decrypted packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;

/// Classify a decrypted packet and return the length its IP header claims.
///
/// Anything after that length is padding.
pub fn ip_packet_len(plaintext: &[u8]) -> Result<(IpVersion, usize), DecodeError> {
    let Some(first) = plaintext.first() else {
        return Err(DecodeError::InvalidIpPacket);
    };

    let (version, len) = match first >> 4 {
        4 if plaintext.len() >= IPV4_MIN_HEADER => (
            IpVersion::V4,
            u16::from_be_bytes([plaintext[2], plaintext[3]]) as usize,
        ),
        6 if plaintext.len() >= IPV6_HEADER => (
            IpVersion::V6,
            u16::from_be_bytes([plaintext[4], plaintext[5]]) as usize + IPV6_HEADER,
        ),
        _ => return Err(DecodeError::InvalidIpPacket),
    };

    if len > plaintext.len() || (version == IpVersion::V4 && len < IPV4_MIN_HEADER) {
        return Err(DecodeError::InvalidIpPacket);
    }
    Ok((version, len))
}
