//! WireGuard protocol implementation
//!
//! This module contains the core protocol components:
//! - Message wire formats
//! - Handshake logic (Noise IKpsk2)
//! - Cookie/DoS protection
//! - Transport encryption and replay protection
//! - Session slots and index allocation
//! - Timer and retry policy

pub mod cookie;
pub mod handshake;
pub mod messages;
pub mod session;
pub mod timers;
pub mod transport;

pub use cookie::{CookieGenerator, CookieState};
pub use handshake::{Handshake, HandshakePhase, Role};
pub use messages::{
    CookieReply, HandshakeInitiation, HandshakeResponse, MessageType, Packet, TransportData,
};
pub use session::{IndexAllocator, Session, SessionSlots};
pub use timers::{TimerAction, Timers};
pub use transport::{IpVersion, ReplayWindow};
