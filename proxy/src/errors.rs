use crate::config::ValidationError;
use http::StatusCode;
use std::io;

/// Terminal failures of a proxied request. Individual peer failures are
/// absorbed by the engine and never surface here.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ProxyError {
    #[error("proxy request timed out")]
    Timeout,
    #[error("no available peers")]
    NoAvailablePeers,
}

/// Why a single stage attempt against one peer did not produce an answer.
#[derive(thiserror::Error, Debug)]
pub enum PeerError {
    #[error("invalid peer address {peer}: {reason}")]
    InvalidAddress { peer: String, reason: String },
    #[error("failed to build request for {peer}: {reason}")]
    BuildRequest { peer: String, reason: String },
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error("request to {peer} failed: {reason}")]
    Transport { peer: String, reason: String },
    #[error("failed to read response body from {peer}: {reason}")]
    ResponseBody { peer: String, reason: String },
    #[error("{peer} answered with server error {status}")]
    ServerFault { peer: String, status: StatusCode },
    #[error("stage task failed: {0}")]
    Task(String),
}

impl PeerError {
    /// Short label used to tag failure metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerError::InvalidAddress { .. } | PeerError::BuildRequest { .. } => "request",
            PeerError::Timeout(_) => "timeout",
            PeerError::Transport { .. } | PeerError::ResponseBody { .. } => "transport",
            PeerError::ServerFault { .. } => "server_fault",
            PeerError::Task(_) => "task",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("invalid proxy config: {0}")]
    Config(#[from] ValidationError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),
}
