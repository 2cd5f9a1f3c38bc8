//! Error types for the tunnel endpoint

use std::net::SocketAddr;
use thiserror::Error;

/// Result type alias for tunnel endpoint operations
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors that can occur while starting or running the endpoint
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Only one half of a certificate/key pair was supplied
    #[error("one of cert or key argument is missing")]
    MissingCredential,

    /// A certificate/key pair could not be loaded or does not match
    #[error("failed to load x509 key pair from {origin}: {reason}")]
    InvalidKeyPair {
        /// Which resolution branch produced the pair (inline, disk, ephemeral)
        origin: &'static str,
        /// What went wrong
        reason: String,
    },

    /// Ephemeral certificate generation failed
    #[error("failed to generate temp cert: {0}")]
    Generation(#[from] GenerationError),

    /// A destination string could not be parsed
    #[error("invalid dst value [{0}]")]
    InvalidRouteSpec(String),

    /// Two routes claim the same path
    #[error("duplicate tunnel path [{0}]")]
    DuplicatePath(String),

    /// The listener could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested bind address
        addr: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// A connection negotiated (or offered only) a protocol version below the minimum
    #[error("unsafe tls version {0}")]
    TlsVersionRejected(String),

    /// TLS configuration error
    #[error("TLS error: {0}")]
    Tls(String),

    /// TLS handshake failed for a reason other than the protocol version
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// Tunnel stream error
    #[error("tunnel stream error: {0}")]
    Tunnel(String),

    /// Connection to a destination failed
    #[error("failed to connect to {dst}: {source}")]
    Connect {
        /// Destination address
        dst: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the ephemeral certificate generator
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The secure random source failed while drawing the serial number
    #[error("generate serial number: {0}")]
    Serial(String),

    /// Key pair generation failed
    #[error("generate key pair: {0}")]
    KeyPair(#[source] rcgen::Error),

    /// The DNS name is not representable in a certificate
    #[error("invalid dns name [{name}]: {reason}")]
    InvalidName {
        /// Offending name
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// Self-signing failed
    #[error("sign certificate: {0}")]
    Signing(#[source] rcgen::Error),

    /// The freshly signed DER did not parse back
    #[error("parse signed certificate: {0}")]
    Parse(String),
}

impl From<rustls::Error> for TunnelError {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e.to_string())
    }
}

impl TunnelError {
    /// Build a bind error for the given address
    pub fn bind(addr: impl ToString, source: std::io::Error) -> Self {
        Self::Bind {
            addr: addr.to_string(),
            source,
        }
    }

    /// Build a connect error for the given destination
    pub fn connect(dst: impl Into<String>, source: std::io::Error) -> Self {
        Self::Connect {
            dst: dst.into(),
            source,
        }
    }

    /// Whether the error is just the peer going away
    pub fn is_connection_closed(&self) -> bool {
        match self {
            Self::Io(e) => is_connection_closed_kind(e.kind()),
            _ => false,
        }
    }
}

/// Check if an I/O error kind just means the other side hung up
pub const fn is_connection_closed_kind(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
    )
}

/// Local/remote pair of an accepted connection, used in error reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionAddrs {
    /// Remote peer address
    pub peer: SocketAddr,
    /// Local listener address
    pub local: SocketAddr,
}
