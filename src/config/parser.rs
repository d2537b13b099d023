//! WireGuard-style configuration file parser
//!
//! Parses `.conf` files with one [Interface] and one [Peer] section.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::crypto::keys;
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::error::ConfigError;

use super::TunnelConfig;

/// A tunnel definition read from disk
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Our side
    pub interface: InterfaceConfig,
    /// The single remote peer
    pub peer: PeerConfig,
}

/// Interface (local) configuration
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub private_key: SecretKey,
    /// UDP port to bind (optional, ephemeral when absent)
    pub listen_port: Option<u16>,
}

/// Peer configuration
#[derive(Clone)]
pub struct PeerConfig {
    pub public_key: PublicKey,
    pub preshared_key: Option<[u8; 32]>,
    /// Peer's endpoint (IP:port)
    pub endpoint: Option<SocketAddr>,
    /// Keepalive interval in seconds. Zero in the file means off.
    pub persistent_keepalive: Option<u16>,
}

impl fmt::Debug for PeerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConfig")
            .field("public_key", &self.public_key)
            .field("preshared_key", &self.preshared_key.map(|_| "[redacted]"))
            .field("endpoint", &self.endpoint)
            .field("persistent_keepalive", &self.persistent_keepalive)
            .finish()
    }
}

impl EngineConfig {
    /// Parse a configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse a configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut private_key: Option<SecretKey> = None;
        let mut listen_port: Option<u16> = None;
        let mut seen_interface = false;
        let mut peer: Option<PeerBuilder> = None;
        let mut current_section: Option<Section> = None;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.eq_ignore_ascii_case("[interface]") {
                if seen_interface {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Duplicate [Interface] section".to_string(),
                    });
                }
                seen_interface = true;
                current_section = Some(Section::Interface);
                continue;
            } else if line.eq_ignore_ascii_case("[peer]") {
                if peer.is_some() {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Only one [Peer] section is supported".to_string(),
                    });
                }
                current_section = Some(Section::Peer);
                peer = Some(PeerBuilder::default());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };

            let key = key.trim().to_lowercase();
            // Base64 padding means only the first '=' splits
            let value = value.trim();

            match current_section {
                Some(Section::Interface) => match key.as_str() {
                    "privatekey" => {
                        private_key = Some(SecretKey::from_base64(value)?);
                    }
                    "listenport" => {
                        listen_port = Some(parse_number(value, "ListenPort", line_num)?);
                    }
                    _ => {
                        tracing::debug!("Unknown interface key: {}", key);
                    }
                },
                Some(Section::Peer) => {
                    let peer = peer.as_mut().ok_or(ConfigError::ParseError {
                        line: line_num,
                        message: "Peer value outside of [Peer] section".to_string(),
                    })?;

                    match key.as_str() {
                        "publickey" => {
                            peer.public_key = Some(PublicKey::from_base64(value)?);
                        }
                        "presharedkey" => {
                            peer.preshared_key = Some(keys::from_base64(value, "PresharedKey")?);
                        }
                        "endpoint" => {
                            peer.endpoint = Some(parse_endpoint(value)?);
                        }
                        "persistentkeepalive" => {
                            let secs: u16 =
                                parse_number(value, "PersistentKeepalive", line_num)?;
                            peer.persistent_keepalive = (secs > 0).then_some(secs);
                        }
                        _ => {
                            tracing::debug!("Unknown peer key: {}", key);
                        }
                    }
                }
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Configuration value outside of any section".to_string(),
                    });
                }
            }
        }

        if !seen_interface {
            return Err(ConfigError::MissingField {
                field: "[Interface] section".to_string(),
            });
        }
        let private_key = private_key.ok_or(ConfigError::MissingField {
            field: "PrivateKey".to_string(),
        })?;
        let peer = peer
            .ok_or(ConfigError::MissingField {
                field: "[Peer] section".to_string(),
            })?
            .build()?;

        Ok(EngineConfig {
            interface: InterfaceConfig {
                private_key,
                listen_port,
            },
            peer,
        })
    }

    /// Our public key derived from the private key
    pub fn public_key(&self) -> PublicKey {
        self.interface.private_key.public_key()
    }

    /// Default thresholds with the file's per-peer settings applied
    pub fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            preshared_key: self.peer.preshared_key,
            persistent_keepalive: self
                .peer
                .persistent_keepalive
                .map(|secs| Duration::from_secs(secs.into())),
            ..TunnelConfig::default()
        }
    }
}

/// Section type during parsing
#[derive(Clone, Copy)]
enum Section {
    Interface,
    Peer,
}

/// Builder for PeerConfig during parsing
#[derive(Default)]
struct PeerBuilder {
    public_key: Option<PublicKey>,
    preshared_key: Option<[u8; 32]>,
    endpoint: Option<SocketAddr>,
    persistent_keepalive: Option<u16>,
}

impl PeerBuilder {
    fn build(self) -> Result<PeerConfig, ConfigError> {
        let public_key = self.public_key.ok_or(ConfigError::MissingField {
            field: "PublicKey in [Peer]".to_string(),
        })?;
        if !public_key.is_valid() {
            return Err(ConfigError::InvalidKey {
                field: "PublicKey".to_string(),
            });
        }

        Ok(PeerConfig {
            public_key,
            preshared_key: self.preshared_key,
            endpoint: self.endpoint,
            persistent_keepalive: self.persistent_keepalive,
        })
    }
}

fn parse_number<T: std::str::FromStr>(
    value: &str,
    field: &str,
    line: usize,
) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::ParseError {
        line,
        message: format!("Invalid {}: {}", field, value),
    })
}

/// Parse an endpoint (IP:port). Hostnames are not resolved.
fn parse_endpoint(value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        field: "Endpoint".to_string(),
        reason: format!("expected IP:port, got {}", value),
    })
}
