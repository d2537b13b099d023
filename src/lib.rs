//! Blocka Engine - WireGuard-compatible tunnel engine
//!
//! A sans-I/O implementation of the WireGuard data plane for one peer,
//! meant to be driven by a host app's packet loop.
//!
//! # Features
//!
//! - Noise IKpsk2 handshake with optional preshared key
//! - Session rotation with automatic rekey and replay protection
//! - Keepalives, retries and dead-peer detection driven by `on_tick`
//! - Cookie replies under handshake load
//! - C-callable boundary and a tokio UDP driver
//!
//! # Usage
//!
//! ```no_run
//! use blocka_engine::{Action, Tunn, TunnelConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut tunnel = Tunn::from_base64(
//!     "UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=",
//!     "YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=",
//!     TunnelConfig::default(),
//! )?;
//!
//! let mut dst = [0u8; 2048];
//! if let Action::WriteToNetwork(n) = tunnel.force_handshake(&mut dst) {
//!     // send dst[..n] to the peer
//!     # let _ = n;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod driver;
pub mod error;
pub mod ffi;
pub mod logging;
pub mod protocol;
pub mod tunnel;

pub use config::{EngineConfig, TunnelConfig};
pub use crypto::{PublicKey, SecretKey};
pub use driver::PeerDriver;
pub use error::{ConfigError, EngineError, TunnelError};
pub use protocol::{HandshakePhase, Role};
pub use tunnel::{Action, Clock, ManualClock, MonotonicClock, Tunn, TunnelStats};
