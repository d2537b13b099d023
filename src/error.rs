//! Error types for the blocka tunnel engine

use thiserror::Error;

/// Main error type for the engine and its drivers
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Wire decoding errors
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Errors surfaced by a tunnel operation
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Network errors (driver only)
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration and key parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Malformed key string for {field}: {reason}")]
    KeyFormat { field: String, reason: String },

    #[error("Invalid key: {field}")]
    InvalidKey { field: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or authentication tag")]
    Decryption,

    #[error("DH computation produced a low-order result")]
    DiffieHellman,
}

/// Why a handshake message was dropped.
///
/// Never surfaced past the tunnel: every variant turns into a silent drop.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("mac1 verification failed")]
    InvalidMac1,

    #[error("Initiation carries an unexpected static key")]
    WrongStaticKey,

    #[error("Timestamp is not newer than the last accepted one")]
    StaleTimestamp,

    #[error("Receiver index {index} matches no pending handshake")]
    UnknownIndex { index: u32 },

    #[error("Message not expected in the current handshake state")]
    UnexpectedMessage,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Malformed wire input.
///
/// Kept apart from authentication failures: a decode error points at a
/// broken transport, not at an adversary, so it is reported to the caller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Invalid message type: {msg_type}")]
    InvalidMessageType { msg_type: u8 },

    #[error("Invalid message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("Reserved header bytes are not zero")]
    NonZeroReserved,

    #[error("Decrypted payload is not a valid IP packet")]
    InvalidIpPacket,
}

/// Errors returned from the tunnel's driving operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelError {
    #[error("Destination buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("Malformed datagram: {0}")]
    Decode(#[from] DecodeError),

    #[error("Session sending counter exhausted, rekey required")]
    SessionExhausted,

    #[error("Connection expired: peer unreachable")]
    ConnectionExpired,
}

impl TunnelError {
    /// Stable numeric code, reported through the C boundary in place of a size
    pub fn code(&self) -> usize {
        match self {
            Self::BufferTooSmall { .. } => 1,
            Self::Decode(DecodeError::InvalidMessageType { .. }) => 2,
            Self::Decode(DecodeError::InvalidMessageLength { .. }) => 3,
            Self::Decode(DecodeError::NonZeroReserved) => 4,
            Self::Decode(DecodeError::InvalidIpPacket) => 5,
            Self::SessionExhausted => 6,
            Self::ConnectionExpired => 7,
        }
    }
}

/// Network-level errors (packet-loop driver)
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("Endpoint not set")]
    NoEndpoint,

    #[error("Handshake timeout after {seconds}s")]
    HandshakeTimeout { seconds: u64 },

    #[error("Too many errors recently ({count})")]
    TooManyErrors { count: u32 },
}

impl EngineError {
    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(ConfigError::FileNotFound { path }) => {
                format!(
                    "Config file not found: {}\n  Check the path and try again.",
                    path
                )
            }

            Self::Config(ConfigError::KeyFormat { field, .. })
            | Self::Config(ConfigError::InvalidKey { field }) => {
                format!(
                    "Invalid {} in config. Expected 32-byte base64-encoded key.",
                    field
                )
            }

            Self::Network(NetworkError::HandshakeTimeout { seconds }) => {
                format!(
                    "Handshake timed out after {}s.\n  \
                    Check network connectivity and that the peer knows our public key.",
                    seconds
                )
            }

            Self::Tunnel(TunnelError::ConnectionExpired) => {
                "Peer stopped answering. The link is down; a new handshake will be attempted on demand."
                    .to_string()
            }

            _ => format!("{}", self),
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,

            Self::Tunnel(TunnelError::BufferTooSmall { .. }) => true,
            Self::Tunnel(TunnelError::SessionExhausted) => true,
            Self::Tunnel(TunnelError::ConnectionExpired) => true,
            Self::Network(NetworkError::TooManyErrors { .. }) => false,
            Self::Network(_) => true,
            Self::Decode(_) => true,
            Self::Tunnel(TunnelError::Decode(_)) => true,

            _ => false,
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Network(_) => 3,
            Self::Decode(_) => 4,
            Self::Crypto(_) => 5,
            Self::Tunnel(_) => 6,
            Self::System(_) => 7,
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct() {
        let errors = [
            TunnelError::BufferTooSmall {
                needed: 148,
                available: 10,
            },
            TunnelError::Decode(DecodeError::InvalidMessageType { msg_type: 9 }),
            TunnelError::Decode(DecodeError::InvalidMessageLength {
                expected: 148,
                got: 3,
            }),
            TunnelError::Decode(DecodeError::NonZeroReserved),
            TunnelError::Decode(DecodeError::InvalidIpPacket),
            TunnelError::SessionExhausted,
            TunnelError::ConnectionExpired,
        ];

        let mut codes: Vec<usize> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn test_config_errors_not_recoverable() {
        let err: EngineError = ConfigError::MissingField {
            field: "PrivateKey".to_string(),
        }
        .into();
        assert!(!err.is_recoverable());
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_exhaustion_is_recoverable() {
        let err: EngineError = TunnelError::SessionExhausted.into();
        assert!(err.is_recoverable());
    }
}
