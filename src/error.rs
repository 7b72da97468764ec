//! Error types for sepwire
//!
//! The split between fatal and droppable errors follows the channel the
//! offending input arrived on: anything malformed on a trusted in-process
//! channel is fatal, anything coming from the network is dropped and
//! logged, transient I/O is retried on the next event.

use thiserror::Error;

/// Main error type for sepwire
#[derive(Error, Debug)]
pub enum SepwireError {
    /// Configuration errors
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors (untrusted input)
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Violation of an internal, trusted channel contract
    #[error("ipc error: {0}")]
    Ipc(#[from] IpcError),

    /// Tunnel device errors
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// System I/O errors
    #[error("system error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("file not found: {path}")]
    FileNotFound { path: String },

    #[error("invalid config at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("invalid address: {value}")]
    InvalidAddress { value: String },

    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("unknown user or group: {name}")]
    UnknownId { name: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed: invalid ciphertext or authentication tag")]
    Decryption,
}

/// Protocol-level errors caused by untrusted input; always contained at
/// the component that decoded the input, never fatal.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid message type: {mtcode}")]
    InvalidMessageType { mtcode: u8 },

    #[error("invalid message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("mac1 verification failed")]
    MacVerificationFailed,

    #[error("handshake does not authenticate")]
    Unauthenticated,

    #[error("unknown peer static key")]
    UnknownPeer,

    #[error("replayed handshake timestamp")]
    ReplayedTimestamp,

    #[error("peer identity does not match pinned flow")]
    PeerMismatch,

    #[error("replayed transport counter {counter}")]
    ReplayDetected { counter: u64 },

    #[error("unknown session id {sessid:#x}")]
    UnknownSession { sessid: u32 },

    #[error("session not usable")]
    SessionExpired,

    #[error("inner source address not allowed for peer")]
    DisallowedSource,

    #[error("no route to destination")]
    NoRoute,
}

/// Violations of the trusted inter-process message contract. Each of
/// these indicates a bug or a compromised sibling process and is fatal
/// for the process that observes it.
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("short internal datagram: expected {expected}, got {got}")]
    ShortMessage { expected: usize, got: usize },

    #[error("unexpected internal message type {mtcode}")]
    UnexpectedMessage { mtcode: u8 },

    #[error("startup message out of order: expected {expected}")]
    StartupOrder { expected: &'static str },

    #[error("unknown interface id {ifnid}")]
    UnknownIfn { ifnid: u32 },

    #[error("unknown peer id {peerid}")]
    UnknownPeerId { peerid: u32 },

    #[error("expected a passed descriptor and got none")]
    MissingFd,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel device errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("failed to open tun device {name}: {reason}")]
    OpenFailed { name: String, reason: String },

    #[error("tun read failed: {reason}")]
    ReadFailed { reason: String },

    #[error("tun write failed: {reason}")]
    WriteFailed { reason: String },
}

impl SepwireError {
    /// Whether this error may be contained by dropping the offending
    /// input. Everything else terminates the process.
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_)
                | Self::Crypto(_)
                | Self::Tunnel(TunnelError::ReadFailed { .. })
                | Self::Tunnel(TunnelError::WriteFailed { .. })
        )
    }
}

/// Result type alias for sepwire operations
pub type Result<T> = std::result::Result<T, SepwireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untrusted_input_errors_are_droppable() {
        assert!(SepwireError::from(ProtocolError::MacVerificationFailed).is_droppable());
        assert!(SepwireError::from(ProtocolError::ReplayDetected { counter: 7 }).is_droppable());
        assert!(SepwireError::from(CryptoError::Decryption).is_droppable());
    }

    #[test]
    fn trusted_channel_errors_are_fatal() {
        let e = SepwireError::from(IpcError::ShortMessage {
            expected: 148,
            got: 12,
        });
        assert!(!e.is_droppable());
        let e = SepwireError::from(ConfigError::MissingField {
            field: "PrivateKey".into(),
        });
        assert!(!e.is_droppable());
    }
}
