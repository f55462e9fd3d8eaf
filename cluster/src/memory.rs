//! An in-process ensemble.
//!
//! Keeps a node tree with sessions, ephemeral owners and one-shot children
//! watches behind a single lock. Besides the client traits it can simulate
//! the failures a real ensemble goes through: a server restart, session
//! expiry and being unreachable.

use crate::ensemble::{
    ChildWatch, Connection, CreateMode, EnsembleConnector, EnsembleSession, SessionEvent,
    SessionId, SessionState, WatchEvent,
};
use crate::errors::EnsembleError;
use crate::paths;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

struct PendingWatch {
    session: SessionId,
    tx: oneshot::Sender<WatchEvent>,
}

struct LiveSession {
    state: SessionState,
    events: mpsc::UnboundedSender<SessionEvent>,
}

struct Node {
    // Set for ephemeral nodes
    owner: Option<SessionId>,
    created: u64,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    last_txn: u64,
    watches: HashMap<String, Vec<PendingWatch>>,
    sessions: HashMap<SessionId, LiveSession>,
    last_session: u64,
    unavailable: bool,
}

impl Tree {
    fn exists(&self, path: &str) -> bool {
        path == paths::ROOT || self.nodes.contains_key(path)
    }

    fn children(&self, path: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|node| paths::parent(node) == Some(path))
            .map(|node| paths::name(node).to_string())
            .collect()
    }

    fn fire(&mut self, path: &str, event: WatchEvent) {
        for watch in self.watches.remove(path).unwrap_or_default() {
            let _ = watch.tx.send(event);
        }
    }

    fn release_dropped_watches(&mut self) {
        for watches in self.watches.values_mut() {
            watches.retain(|watch| !watch.tx.is_closed());
        }
        self.watches.retain(|_, watches| !watches.is_empty());
    }

    fn check_session(&self, id: SessionId) -> Result<(), EnsembleError> {
        match self.sessions.get(&id) {
            None => Err(EnsembleError::SessionExpired),
            Some(session) if session.state != SessionState::Connected => {
                Err(EnsembleError::ConnectionLoss)
            }
            Some(_) => Ok(()),
        }
    }

    fn check_path(path: &str) -> Result<(), EnsembleError> {
        if paths::is_valid(path) {
            Ok(())
        } else {
            Err(EnsembleError::InvalidPath(path.to_string()))
        }
    }

    fn create(&mut self, id: SessionId, path: &str, mode: CreateMode) -> Result<(), EnsembleError> {
        self.check_session(id)?;
        Self::check_path(path)?;
        if self.exists(path) {
            return Err(EnsembleError::NodeExists(path.to_string()));
        }
        let parent = paths::parent(path).unwrap_or(paths::ROOT);
        if !self.exists(parent) {
            return Err(EnsembleError::NoNode(parent.to_string()));
        }

        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(id),
        };
        self.last_txn += 1;
        let created = self.last_txn;
        self.nodes.insert(path.to_string(), Node { owner, created });
        self.fire(parent, WatchEvent::ChildrenChanged);
        Ok(())
    }

    fn delete(&mut self, id: SessionId, path: &str) -> Result<(), EnsembleError> {
        self.check_session(id)?;
        Self::check_path(path)?;
        if path == paths::ROOT {
            return Err(EnsembleError::InvalidPath(path.to_string()));
        }
        if !self.exists(path) {
            return Err(EnsembleError::NoNode(path.to_string()));
        }
        if !self.children(path).is_empty() {
            return Err(EnsembleError::NotEmpty(path.to_string()));
        }
        self.remove_node(path);
        Ok(())
    }

    fn remove_node(&mut self, path: &str) {
        self.nodes.remove(path);
        self.fire(path, WatchEvent::NodeDeleted);
        if let Some(parent) = paths::parent(path) {
            self.fire(parent, WatchEvent::ChildrenChanged);
        }
    }

    fn get_children(
        &mut self,
        id: SessionId,
        path: &str,
        watch: bool,
    ) -> Result<(Vec<String>, Option<ChildWatch>), EnsembleError> {
        self.check_session(id)?;
        Self::check_path(path)?;
        if !self.exists(path) {
            return Err(EnsembleError::NoNode(path.to_string()));
        }

        let children = self.children(path);
        if !watch {
            return Ok((children, None));
        }
        self.release_dropped_watches();
        let (tx, child_watch) = ChildWatch::channel();
        self.watches
            .entry(path.to_string())
            .or_default()
            .push(PendingWatch { session: id, tx });
        Ok((children, Some(child_watch)))
    }

    /// Ends a session: its watches are dropped, then its ephemeral nodes are
    /// deleted so watchers of their parents see them go.
    fn end_session(&mut self, id: SessionId) -> Option<LiveSession> {
        let session = self.sessions.remove(&id)?;

        for watches in self.watches.values_mut() {
            watches.retain(|watch| watch.session != id);
        }
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            self.remove_node(&path);
        }

        Some(session)
    }
}

/// Shared handle to an in-process ensemble. Clones see the same tree.
#[derive(Clone, Default)]
pub struct MemoryEnsemble {
    tree: Arc<Mutex<Tree>>,
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a server restart: every session is disconnected and then
    /// reconnected with its ephemeral nodes retained. Pending watches are lost.
    pub fn restart(&self) {
        let mut tree = self.tree.lock();
        tree.watches.clear();
        for session in tree.sessions.values_mut() {
            let _ = session.events.send(SessionEvent::Disconnected);
            let _ = session.events.send(SessionEvent::Connected);
            session.state = SessionState::Connected;
        }
        tracing::debug!(sessions = tree.sessions.len(), "memory ensemble restarted");
    }

    /// Simulates a dropped client connection that comes back before the session
    /// times out. Sessions, ephemeral nodes and pending watches are retained.
    pub fn interrupt(&self) {
        let tree = self.tree.lock();
        for session in tree.sessions.values() {
            let _ = session.events.send(SessionEvent::Disconnected);
            let _ = session.events.send(SessionEvent::Connected);
        }
    }

    /// Expires one session as the ensemble would after a long partition.
    /// Returns whether the session was live.
    pub fn expire_session(&self, id: SessionId) -> bool {
        let mut tree = self.tree.lock();
        match tree.end_session(id) {
            Some(session) => {
                let _ = session.events.send(SessionEvent::Expired);
                true
            }
            None => false,
        }
    }

    pub fn expire_sessions(&self) {
        let ids: Vec<SessionId> = self.tree.lock().sessions.keys().copied().collect();
        for id in ids {
            self.expire_session(id);
        }
    }

    /// While unavailable, new connections fail with `ConnectionLoss`.
    pub fn set_available(&self, available: bool) {
        self.tree.lock().unavailable = !available;
    }

    /// Watches registered and not yet fired. Dropped watches are released
    /// first, as a client would on dropping its handle.
    pub fn pending_watches(&self) -> usize {
        let mut tree = self.tree.lock();
        tree.release_dropped_watches();
        tree.watches.values().map(Vec::len).sum()
    }

    pub fn session_count(&self) -> usize {
        self.tree.lock().sessions.len()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.tree.lock().exists(path)
    }

    /// Transaction that created the node at `path`. Changes when the node is
    /// deleted and created again.
    pub fn created_txn(&self, path: &str) -> Option<u64> {
        self.tree.lock().nodes.get(path).map(|node| node.created)
    }

    /// Children of `path` as seen from outside any session.
    pub fn children(&self, path: &str) -> Vec<String> {
        self.tree.lock().children(path)
    }
}

#[async_trait]
impl EnsembleConnector for MemoryEnsemble {
    async fn connect(
        &self,
        _servers: &[String],
        _session_timeout: Duration,
    ) -> Result<Connection, EnsembleError> {
        let mut tree = self.tree.lock();
        if tree.unavailable {
            return Err(EnsembleError::ConnectionLoss);
        }

        tree.last_session += 1;
        let id = SessionId(tree.last_session);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tree.sessions.insert(
            id,
            LiveSession {
                state: SessionState::Connected,
                events: events_tx,
            },
        );

        Ok(Connection {
            session: Arc::new(MemorySession {
                id,
                tree: self.tree.clone(),
            }),
            events: events_rx,
        })
    }
}

struct MemorySession {
    id: SessionId,
    tree: Arc<Mutex<Tree>>,
}

#[async_trait]
impl EnsembleSession for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn state(&self) -> SessionState {
        self.tree
            .lock()
            .sessions
            .get(&self.id)
            .map_or(SessionState::Expired, |session| session.state)
    }

    async fn create(&self, path: &str, mode: CreateMode) -> Result<(), EnsembleError> {
        self.tree.lock().create(self.id, path, mode)
    }

    async fn delete(&self, path: &str) -> Result<(), EnsembleError> {
        self.tree.lock().delete(self.id, path)
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, EnsembleError> {
        let (children, _) = self.tree.lock().get_children(self.id, path, false)?;
        Ok(children)
    }

    async fn get_children_w(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, ChildWatch), EnsembleError> {
        match self.tree.lock().get_children(self.id, path, true)? {
            (children, Some(watch)) => Ok((children, watch)),
            (_, None) => Err(EnsembleError::ConnectionLoss),
        }
    }

    async fn close(&self) {
        self.tree.lock().end_session(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::{create_ephemeral, ensure_path, watch_children};

    async fn open(ensemble: &MemoryEnsemble) -> Connection {
        ensemble.connect(&[], Duration::from_secs(5)).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let ensemble = MemoryEnsemble::new();
        let session = open(&ensemble).await.session;

        assert_eq!(
            session.create("/a/b", CreateMode::Persistent).await,
            Err(EnsembleError::NoNode("/a".to_string()))
        );
        session.create("/a", CreateMode::Persistent).await.unwrap();
        session.create("/a/b", CreateMode::Persistent).await.unwrap();
        assert_eq!(
            session.create("/a", CreateMode::Persistent).await,
            Err(EnsembleError::NodeExists("/a".to_string()))
        );
        assert_eq!(
            session.delete("/a").await,
            Err(EnsembleError::NotEmpty("/a".to_string()))
        );
        assert_eq!(session.get_children("/a").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_watch_fires_once() {
        let ensemble = MemoryEnsemble::new();
        let session = open(&ensemble).await.session;
        ensure_path(session.as_ref(), "/peers").await.unwrap();

        let (children, watch) = session.get_children_w("/peers").await.unwrap();
        assert!(children.is_empty());
        assert_eq!(ensemble.pending_watches(), 1);

        session.create("/peers/a", CreateMode::Ephemeral).await.unwrap();
        assert_eq!(watch.await, WatchEvent::ChildrenChanged);
        assert_eq!(ensemble.pending_watches(), 0);

        // Nobody is watching anymore, so this fires nothing
        session.create("/peers/b", CreateMode::Ephemeral).await.unwrap();
        assert_eq!(ensemble.children("/peers"), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_dropped_watch_is_not_pending() {
        let ensemble = MemoryEnsemble::new();
        let session = open(&ensemble).await.session;

        let (_, watch) = session.get_children_w("/").await.unwrap();
        assert_eq!(ensemble.pending_watches(), 1);
        drop(watch);
        assert_eq!(ensemble.pending_watches(), 0);
    }

    #[tokio::test]
    async fn test_restart_keeps_sessions_and_drops_watches() {
        let ensemble = MemoryEnsemble::new();
        let Connection {
            session,
            mut events,
        } = open(&ensemble).await;
        create_ephemeral(session.as_ref(), "/peers/a").await.unwrap();
        let (_, watch) = watch_children(session.as_ref(), "/peers").await.unwrap();

        ensemble.restart();

        assert_eq!(watch.await, WatchEvent::SessionLost);
        assert_eq!(events.recv().await, Some(SessionEvent::Disconnected));
        assert_eq!(events.recv().await, Some(SessionEvent::Connected));
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(ensemble.children("/peers"), vec!["a"]);
    }

    #[tokio::test]
    async fn test_interrupt_keeps_watches() {
        let ensemble = MemoryEnsemble::new();
        let Connection {
            session,
            mut events,
        } = open(&ensemble).await;
        create_ephemeral(session.as_ref(), "/peers/a").await.unwrap();
        let created = ensemble.created_txn("/peers/a");
        let (_, watch) = watch_children(session.as_ref(), "/peers").await.unwrap();

        ensemble.interrupt();

        assert_eq!(events.recv().await, Some(SessionEvent::Disconnected));
        assert_eq!(events.recv().await, Some(SessionEvent::Connected));
        assert_eq!(ensemble.pending_watches(), 1);
        assert_eq!(ensemble.created_txn("/peers/a"), created);

        session.create("/peers/b", CreateMode::Ephemeral).await.unwrap();
        assert_eq!(watch.await, WatchEvent::ChildrenChanged);
    }

    #[tokio::test]
    async fn test_expiry_removes_ephemerals() {
        let ensemble = MemoryEnsemble::new();
        let Connection {
            session,
            mut events,
        } = open(&ensemble).await;
        let observer = open(&ensemble).await.session;

        create_ephemeral(session.as_ref(), "/peers/a").await.unwrap();
        let (children, watch) = watch_children(observer.as_ref(), "/peers").await.unwrap();
        assert_eq!(children, vec!["a"]);

        assert!(ensemble.expire_session(session.id()));
        assert!(!ensemble.expire_session(session.id()));

        assert_eq!(watch.await, WatchEvent::ChildrenChanged);
        assert_eq!(events.recv().await, Some(SessionEvent::Expired));
        assert_eq!(session.state(), SessionState::Expired);
        assert!(ensemble.children("/peers").is_empty());
        assert!(ensemble.exists("/peers"));
        assert_eq!(
            session.get_children("/peers").await,
            Err(EnsembleError::SessionExpired)
        );
    }

    #[tokio::test]
    async fn test_unavailable_refuses_connections() {
        let ensemble = MemoryEnsemble::new();
        ensemble.set_available(false);
        assert_eq!(
            ensemble.connect(&[], Duration::from_secs(5)).await.err(),
            Some(EnsembleError::ConnectionLoss)
        );

        ensemble.set_available(true);
        open(&ensemble).await;
        assert_eq!(ensemble.session_count(), 1);
    }

    #[tokio::test]
    async fn test_close_ends_session() {
        let ensemble = MemoryEnsemble::new();
        let session = open(&ensemble).await.session;
        create_ephemeral(session.as_ref(), "/peers/a").await.unwrap();

        session.close().await;

        assert_eq!(ensemble.session_count(), 0);
        assert!(!ensemble.exists("/peers/a"));
    }
}
