use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Proxy timeout must be greater than 0")]
    ZeroTimeout,

    #[error("Stage timeout ({stage_ms}ms) must be between 1ms and the proxy timeout ({overall_ms}ms)")]
    InvalidStageTimeout { stage_ms: u64, overall_ms: u64 },

    #[error("Peer timeout must be greater than 0")]
    ZeroPeerTimeout,

    #[error("Empty peer address")]
    EmptyPeer,

    #[error("Duplicate peer address: {0}")]
    DuplicatePeer(String),
}

/// Proxy configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Main listener for incoming requests
    pub listener: Listener,
    /// Admin listener for health and readiness probes
    pub admin_listener: Listener,
    #[serde(default)]
    pub timeouts: ProxyTimeouts,
    /// Peers in attempt priority order
    #[serde(default)]
    pub peers: Vec<String>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;
        self.timeouts.validate()?;

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.trim().is_empty() {
                return Err(ValidationError::EmptyPeer);
            }
            if !seen.insert(peer) {
                return Err(ValidationError::DuplicatePeer(peer.clone()));
            }
        }

        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Timeout budget for a single proxied request.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct ProxyTimeouts {
    /// Absolute deadline for the whole proxied request.
    pub timeout_ms: u64,
    /// How long one peer gets before the next one is tried alongside it.
    pub stage_timeout_ms: u64,
    /// Transport timeout for one outbound call. Bounds attempts that keep
    /// running after the request they belonged to was resolved. Defaults to
    /// `timeout_ms`.
    #[serde(default)]
    pub peer_timeout_ms: Option<u64>,
}

impl Default for ProxyTimeouts {
    fn default() -> Self {
        ProxyTimeouts {
            timeout_ms: 100,
            stage_timeout_ms: 50,
            peer_timeout_ms: None,
        }
    }
}

impl ProxyTimeouts {
    pub fn new(timeout: Duration, stage_timeout: Duration) -> Self {
        ProxyTimeouts {
            timeout_ms: timeout.as_millis() as u64,
            stage_timeout_ms: stage_timeout.as_millis() as u64,
            peer_timeout_ms: None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.timeout_ms == 0 {
            return Err(ValidationError::ZeroTimeout);
        }
        if self.stage_timeout_ms == 0 || self.stage_timeout_ms > self.timeout_ms {
            return Err(ValidationError::InvalidStageTimeout {
                stage_ms: self.stage_timeout_ms,
                overall_ms: self.timeout_ms,
            });
        }
        if self.peer_timeout_ms == Some(0) {
            return Err(ValidationError::ZeroPeerTimeout);
        }
        Ok(())
    }

    pub fn overall(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn stage(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn peer(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms.unwrap_or(self.timeout_ms))
    }
}
