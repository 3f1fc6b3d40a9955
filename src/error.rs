//! Typed error taxonomy for the proxy session pipeline.
//!
//! Mirrors the error kinds enumerated in the design doc's handling table:
//! some are per-endpoint/per-upstream recoverable (the session driver
//! matches on them to decide whether to advance), others are terminal.

use std::net::SocketAddr;

use thiserror::Error;

/// Errors that can terminate or redirect a single proxy session.
///
/// Every variant here corresponds to one row of the error handling table:
/// `Resolve` and `Connect` are recoverable (the session driver advances the
/// endpoint or upstream iterator and keeps going); the rest are terminal.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to recover original destination: {0}")]
    OriginalDst(#[source] std::io::Error),

    #[error("socket option failure: {0}")]
    SocketOption(#[source] std::io::Error),

    #[error("DNS resolution failed for {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("TCP connect failed to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("no reachable upstream endpoints for {host}:{port}")]
    NoEndpoints { host: String, port: u16 },

    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),

    #[error("407 response carried no Proxy-Authenticate header")]
    MissingChallenge,

    #[error("unknown or unsupported proxy authentication scheme: {0:?}")]
    UnknownAuthScheme(String),

    #[error("proxy authentication retries exhausted")]
    AuthExhausted,

    #[error("upstream returned unexpected status {status}")]
    UnexpectedStatus { status: u16 },

    #[error("I/O error during handshake: {0}")]
    HandshakeIo(#[source] std::io::Error),

    #[error("all upstream proxies exhausted")]
    UpstreamsExhausted,
}

impl ProxyError {
    /// True if the condition is local to resolving/connecting a single
    /// upstream and the session driver should advance to the next
    /// endpoint or upstream rather than tearing the session down. Every
    /// other variant (malformed responses, auth failures, handshake I/O
    /// errors, ...) is session-fatal per the error handling table.
    pub fn is_endpoint_recoverable(&self) -> bool {
        matches!(
            self,
            ProxyError::Resolve { .. } | ProxyError::Connect { .. } | ProxyError::NoEndpoints { .. }
        )
    }
}
