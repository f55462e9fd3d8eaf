use crate::subscription::WatchUpdates;
use http::request::Parts;
use parking_lot::RwLock;
use proxy::peers::PeerSource;
use std::sync::Arc;

/// Live peer list following the children of a membership path, where every
/// member registers itself as an ephemeral `host:port` child.
#[derive(Clone, Default)]
pub struct PeerDirectory {
    // None until the first snapshot arrived
    peers: Arc<RwLock<Option<Vec<String>>>>,
    // This node's own member name, never handed out as a peer
    own: Option<String>,
}

impl PeerDirectory {
    /// Spawns a task that keeps the directory in sync with `updates`. The
    /// last known list is kept once the watch ends.
    pub fn follow(mut updates: WatchUpdates) -> Self {
        let directory = PeerDirectory::default();
        let peers = directory.peers.clone();

        tokio::spawn(async move {
            while let Some(members) = updates.recv().await {
                tracing::info!(path = updates.path(), peers = members.len(), "peer membership changed");
                *peers.write() = Some(members);
            }
            tracing::debug!(path = updates.path(), "peer membership watch ended");
        });

        directory
    }

    /// Leaves `own` out of the peer list, so a member never proxies to itself.
    pub fn excluding(mut self, own: &str) -> Self {
        self.own = Some(own.to_string());
        self
    }

    /// Current members in sorted order.
    pub fn peers(&self) -> Vec<String> {
        let peers = self.peers.read();
        peers
            .iter()
            .flatten()
            .filter(|peer| Some(peer.as_str()) != self.own.as_deref())
            .cloned()
            .collect()
    }

    /// Whether at least one other member is known.
    pub fn is_ready(&self) -> bool {
        !self.peers().is_empty()
    }
}

impl PeerSource for PeerDirectory {
    fn peers_for(&self, _request: &Parts) -> Vec<String> {
        self.peers()
    }

    fn is_ready(&self) -> bool {
        PeerDirectory::is_ready(self)
    }
}
