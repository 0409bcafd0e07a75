//! Error taxonomy.
//!
//! DESIGN
//! ======
//! Connection-level failures ([`TransportError`]) are recoverable: they are
//! surfaced as events and feed the reconnect loop, never returned from a call.
//! Invocation-level failures that come from the peer or from the clock are not
//! errors at all; they resolve as an error-shaped `Response`. What remains for
//! callers is [`ClientError`]: writes that could not happen, bad configuration,
//! and a failed TLS upgrade.

use std::path::PathBuf;
use std::sync::Arc;

use frames::{Id, Kind};

/// Invalid or incomplete configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required option `{0}`")]
    Missing(&'static str),
    #[error("invalid option `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Socket-level failure of one link.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("link i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("session upgrade failed: {0}")]
    Handshake(Arc<HandshakeError>),
    #[error("link task aborted: {0}")]
    Aborted(String),
}

/// Failure to set up the encrypted session.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("invalid PEM in `{field}`: {reason}")]
    Pem { field: &'static str, reason: String },
    #[error("`cert` and `key` must be supplied together")]
    IncompleteIdentity,
    #[error("no trusted CA certificates configured")]
    NoTrustAnchors,
    #[error("invalid server name `{0}`")]
    ServerName(String),
    #[error("tls configuration rejected: {0}")]
    Config(#[from] tokio_rustls::rustls::Error),
    #[error("tls handshake failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A frame that could not be routed to a caller. Logged, never returned.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid frame: {0}")]
    Invalid(String),
    #[error("no pending call for id {0}")]
    UnknownId(Id),
    #[error("error frame without id: {0}")]
    Unroutable(String),
    #[error("unsupported {0} frame for method {1}")]
    Unsupported(Kind, String),
}

/// What public client operations can fail with.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("write failed: {0}")]
    Write(#[from] std::io::Error),
    #[error(transparent)]
    Encode(#[from] frames::CodecError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("handshake failed: {0}")]
    Handshake(Arc<HandshakeError>),
    #[error("connection task has shut down")]
    Shutdown,
}
