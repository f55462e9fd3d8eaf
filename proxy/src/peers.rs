use http::request::Parts;
use std::sync::Arc;

/// Supplies the ordered peer list a request should be proxied to.
///
/// The list is taken fresh for every request so a source backed by live
/// membership always hands out the current view.
pub trait PeerSource: Send + Sync {
    fn peers_for(&self, request: &Parts) -> Vec<String>;

    /// Whether the source has anything to hand out yet. Backs `/ready`.
    fn is_ready(&self) -> bool;
}

/// A fixed peer list, in configured priority order.
#[derive(Clone, Debug, Default)]
pub struct StaticPeers {
    peers: Arc<Vec<String>>,
}

impl StaticPeers {
    pub fn new(peers: Vec<String>) -> Self {
        StaticPeers {
            peers: Arc::new(peers),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl PeerSource for StaticPeers {
    fn peers_for(&self, _request: &Parts) -> Vec<String> {
        self.peers.to_vec()
    }

    fn is_ready(&self) -> bool {
        !self.is_empty()
    }
}
