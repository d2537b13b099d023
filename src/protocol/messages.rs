//! WireGuard message wire formats
//!
//! - Type 1: Handshake Initiation (148 bytes)
//! - Type 2: Handshake Response (92 bytes)
//! - Type 3: Cookie Reply (64 bytes)
//! - Type 4: Transport Data (16-byte header + ciphertext)
//!
//! All multi-byte integers are little-endian. Handshake messages have an
//! exact length; anything else is a [`DecodeError`].

use crate::error::DecodeError;

/// Common header: type(1) | reserved(3)
pub const HEADER_LEN: usize = 4;

/// WireGuard message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    HandshakeInitiation = 1,
    HandshakeResponse = 2,
    CookieReply = 3,
    TransportData = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::HandshakeInitiation),
            2 => Ok(Self::HandshakeResponse),
            3 => Ok(Self::CookieReply),
            4 => Ok(Self::TransportData),
            _ => Err(DecodeError::InvalidMessageType { msg_type: value }),
        }
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(b)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(b)
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

fn write_header(buf: &mut [u8], msg_type: MessageType) {
    buf[0] = msg_type as u8;
    buf[1..HEADER_LEN].fill(0);
}

/// Handshake Initiation message (148 bytes)
///
/// ```text
/// type(1) | reserved(3) | sender_index(4) | ephemeral_public(32) |
/// encrypted_static(48) | encrypted_timestamp(28) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeInitiation {
    pub sender_index: u32,
    pub ephemeral_public: [u8; 32],
    pub encrypted_static: [u8; 48],
    pub encrypted_timestamp: [u8; 28],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeInitiation {
    pub const SIZE: usize = 148;
    /// mac1 covers `msg[..MAC1_OFFSET]`
    pub const MAC1_OFFSET: usize = 116;
    /// mac2 covers `msg[..MAC2_OFFSET]`
    pub const MAC2_OFFSET: usize = 132;

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];

        write_header(&mut buf, MessageType::HandshakeInitiation);
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..40].copy_from_slice(&self.ephemeral_public);
        buf[40..88].copy_from_slice(&self.encrypted_static);
        buf[88..116].copy_from_slice(&self.encrypted_timestamp);
        buf[116..132].copy_from_slice(&self.mac1);
        buf[132..148].copy_from_slice(&self.mac2);

        buf
    }

    fn parse(data: &[u8]) -> Self {
        Self {
            sender_index: le_u32(&data[4..8]),
            ephemeral_public: array(&data[8..40]),
            encrypted_static: array(&data[40..88]),
            encrypted_timestamp: array(&data[88..116]),
            mac1: array(&data[116..132]),
            mac2: array(&data[132..148]),
        }
    }
}

/// Handshake Response message (92 bytes)
///
/// ```text
/// type(1) | reserved(3) | sender_index(4) | receiver_index(4) |
/// ephemeral_public(32) | encrypted_nothing(16) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub sender_index: u32,
    pub receiver_index: u32,
    pub ephemeral_public: [u8; 32],
    pub encrypted_nothing: [u8; 16],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeResponse {
    pub const SIZE: usize = 92;
    pub const MAC1_OFFSET: usize = 60;
    pub const MAC2_OFFSET: usize = 76;

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];

        write_header(&mut buf, MessageType::HandshakeResponse);
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[12..44].copy_from_slice(&self.ephemeral_public);
        buf[44..60].copy_from_slice(&self.encrypted_nothing);
        buf[60..76].copy_from_slice(&self.mac1);
        buf[76..92].copy_from_slice(&self.mac2);

        buf
    }

    fn parse(data: &[u8]) -> Self {
        Self {
            sender_index: le_u32(&data[4..8]),
            receiver_index: le_u32(&data[8..12]),
            ephemeral_public: array(&data[12..44]),
            encrypted_nothing: array(&data[44..60]),
            mac1: array(&data[60..76]),
            mac2: array(&data[76..92]),
        }
    }
}

/// Cookie Reply message (64 bytes)
///
/// ```text
/// type(1) | reserved(3) | receiver_index(4) | nonce(24) | encrypted_cookie(32)
/// ```
#[derive(Debug, Clone)]
pub struct CookieReply {
    pub receiver_index: u32,
    pub nonce: [u8; 24],
    /// 16 bytes cookie + 16 bytes tag
    pub encrypted_cookie: [u8; 32],
}

impl CookieReply {
    pub const SIZE: usize = 64;

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];

        write_header(&mut buf, MessageType::CookieReply);
        buf[4..8].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[8..32].copy_from_slice(&self.nonce);
        buf[32..64].copy_from_slice(&self.encrypted_cookie);

        buf
    }

    fn parse(data: &[u8]) -> Self {
        Self {
            receiver_index: le_u32(&data[4..8]),
            nonce: array(&data[8..32]),
            encrypted_cookie: array(&data[32..64]),
        }
    }
}

/// Transport Data message, borrowed from the datagram
///
/// ```text
/// type(1) | reserved(3) | receiver_index(4) | counter(8) | encrypted_packet(n+16)
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TransportData<'a> {
    pub receiver_index: u32,
    pub counter: u64,
    pub payload: &'a [u8],
}

impl<'a> TransportData<'a> {
    /// Size of the transport header (not including encrypted payload)
    pub const HEADER_SIZE: usize = 16;

    /// Header plus an empty (keepalive) ciphertext
    pub const MIN_SIZE: usize = Self::HEADER_SIZE + 16;

    fn parse(data: &'a [u8]) -> Self {
        Self {
            receiver_index: le_u32(&data[4..8]),
            counter: le_u64(&data[8..16]),
            payload: &data[Self::HEADER_SIZE..],
        }
    }

    /// Write a transport header into `out[..HEADER_SIZE]`
    pub fn write_header(out: &mut [u8], receiver_index: u32, counter: u64) {
        write_header(out, MessageType::TransportData);
        out[4..8].copy_from_slice(&receiver_index.to_le_bytes());
        out[8..16].copy_from_slice(&counter.to_le_bytes());
    }
}

/// A decoded datagram
#[derive(Debug)]
pub enum Packet<'a> {
    Initiation(HandshakeInitiation),
    Response(HandshakeResponse),
    Cookie(CookieReply),
    Data(TransportData<'a>),
}

fn expect_len(data: &[u8], expected: usize) -> Result<(), DecodeError> {
    if data.len() != expected {
        return Err(DecodeError::InvalidMessageLength {
            expected,
            got: data.len(),
        });
    }
    Ok(())
}

/// Decode a datagram.
///
/// Validates the type byte, reserved bytes and length. No cryptographic
/// checks happen here.
pub fn parse(data: &[u8]) -> Result<Packet<'_>, DecodeError> {
    if data.len() < HEADER_LEN {
        return Err(DecodeError::InvalidMessageLength {
            expected: HEADER_LEN,
            got: data.len(),
        });
    }

    let msg_type = MessageType::try_from(data[0])?;
    if data[1..HEADER_LEN] != [0, 0, 0] {
        return Err(DecodeError::NonZeroReserved);
    }

    match msg_type {
        MessageType::HandshakeInitiation => {
            expect_len(data, HandshakeInitiation::SIZE)?;
            Ok(Packet::Initiation(HandshakeInitiation::parse(data)))
        }
        MessageType::HandshakeResponse => {
            expect_len(data, HandshakeResponse::SIZE)?;
            Ok(Packet::Response(HandshakeResponse::parse(data)))
        }
        MessageType::CookieReply => {
            expect_len(data, CookieReply::SIZE)?;
            Ok(Packet::Cookie(CookieReply::parse(data)))
        }
        MessageType::TransportData => {
            if data.len() < TransportData::MIN_SIZE {
                return Err(DecodeError::InvalidMessageLength {
                    expected: TransportData::MIN_SIZE,
                    got: data.len(),
                });
            }
            Ok(Packet::Data(TransportData::parse(data)))
        }
    }
}
