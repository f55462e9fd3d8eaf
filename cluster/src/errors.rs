use crate::config::ValidationError;
use std::time::Duration;

/// Failures reported by an ensemble session.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EnsembleError {
    #[error("connection to the ensemble was lost")]
    ConnectionLoss,
    #[error("session expired")]
    SessionExpired,
    #[error("node {0} does not exist")]
    NoNode(String),
    #[error("node {0} already exists")]
    NodeExists(String),
    #[error("node {0} still has children")]
    NotEmpty(String),
    #[error("invalid path {0:?}")]
    InvalidPath(String),
}

impl EnsembleError {
    /// Errors that go away once the session is re-established.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            EnsembleError::ConnectionLoss | EnsembleError::SessionExpired
        )
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ClusterError {
    #[error("invalid cluster config: {0}")]
    Config(#[from] ValidationError),
    #[error("no ensemble session could be established within {0:?}")]
    ConnectTimeout(Duration),
    #[error("the watcher is closed")]
    Closed,
    #[error("invalid path {0:?}")]
    InvalidPath(String),
    #[error("ensemble error: {0}")]
    Ensemble(#[from] EnsembleError),
}

/// Why serving as a cluster member stopped.
#[derive(thiserror::Error, Debug)]
pub enum MemberError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Proxy(#[from] proxy::errors::ServiceError),
}
