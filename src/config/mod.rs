//! Tunnel configuration
//!
//! [`TunnelConfig`] holds the protocol thresholds; [`EngineConfig`] is a
//! WireGuard-style `.conf` file describing our key and one peer.

mod parser;
mod tunnel;

pub use parser::{EngineConfig, InterfaceConfig, PeerConfig};
pub use tunnel::TunnelConfig;
