// Relay error types
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("cannot bind {addr}: {source}")]
    BindFailure {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream {host}:{port} unreachable: {reason}")]
    UpstreamUnreachable {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("upstream authentication failed: {0}")]
    UpstreamAuth(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("relay I/O error: {0}")]
    RelayIo(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Short tag used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::BindFailure { .. } => "bind_failure",
            RelayError::UpstreamUnreachable { .. } => "upstream_unreachable",
            RelayError::UpstreamAuth(_) => "upstream_auth",
            RelayError::MalformedRequest(_) => "malformed_request",
            RelayError::RelayIo(_) => "relay_io",
            RelayError::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
