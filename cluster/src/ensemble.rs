//! Client side interface to the coordination ensemble.
//!
//! The watcher only needs a handful of primitives: open a session, create and
//! delete nodes, and list children with an optional one-shot watch. Anything
//! that can provide those can back a [`ClusterWatcher`](crate::ClusterWatcher).

use crate::errors::EnsembleError;
use crate::paths;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
    /// The ensemble dropped the session and every ephemeral node it owned.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Removed by the ensemble once the creating session ends.
    Ephemeral,
}

/// Connectivity changes of one session, in the order they happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Lost the connection, the session may still be alive.
    Disconnected,
    /// Reconnected with the session and its ephemeral nodes retained.
    Connected,
    /// The session is gone for good. A new one has to be opened.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    ChildrenChanged,
    NodeDeleted,
    /// The watch was dropped by the ensemble without firing, typically because
    /// the connection was interrupted.
    SessionLost,
}

/// A one-shot children watch. Resolves once with the event that triggered it.
#[derive(Debug)]
pub struct ChildWatch {
    rx: oneshot::Receiver<WatchEvent>,
}

impl ChildWatch {
    pub fn channel() -> (oneshot::Sender<WatchEvent>, ChildWatch) {
        let (tx, rx) = oneshot::channel();
        (tx, ChildWatch { rx })
    }

    /// Whether the watch is still armed. Once this returns false the watch
    /// must not be awaited anymore.
    pub fn is_pending(&mut self) -> bool {
        matches!(self.rx.try_recv(), Err(oneshot::error::TryRecvError::Empty))
    }
}

impl Future for ChildWatch {
    type Output = WatchEvent;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|event| event.unwrap_or(WatchEvent::SessionLost))
    }
}

#[async_trait]
pub trait EnsembleSession: Send + Sync {
    fn id(&self) -> SessionId;

    fn state(&self) -> SessionState;

    /// Fails with `NoNode` if the parent does not exist.
    async fn create(&self, path: &str, mode: CreateMode) -> Result<(), EnsembleError>;

    async fn delete(&self, path: &str) -> Result<(), EnsembleError>;

    async fn get_children(&self, path: &str) -> Result<Vec<String>, EnsembleError>;

    /// Lists the children of `path` and leaves a watch that fires on the next
    /// change to that list.
    ///
    /// The watch stays registered on the ensemble only as long as the returned
    /// [`ChildWatch`] is held; dropping it releases the registration. A watch
    /// that has not fired survives a reconnect of the same session.
    async fn get_children_w(&self, path: &str)
    -> Result<(Vec<String>, ChildWatch), EnsembleError>;

    /// Ends the session. Ephemeral nodes it owns are removed.
    async fn close(&self);
}

/// An open session plus the stream of its connectivity changes.
pub struct Connection {
    pub session: Arc<dyn EnsembleSession>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

#[async_trait]
pub trait EnsembleConnector: Send + Sync {
    async fn connect(
        &self,
        servers: &[String],
        session_timeout: Duration,
    ) -> Result<Connection, EnsembleError>;
}

/// Creates every missing node on the way to `path`, `path` included.
pub async fn ensure_path(session: &dyn EnsembleSession, path: &str) -> Result<(), EnsembleError> {
    for prefix in paths::prefixes(path) {
        match session.create(prefix, CreateMode::Persistent).await {
            Ok(()) | Err(EnsembleError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Creates an ephemeral node at `path` along with any missing persistent
/// parents. A node that already exists is left alone.
pub async fn create_ephemeral(session: &dyn EnsembleSession, path: &str) -> Result<(), EnsembleError> {
    if let Some(parent) = paths::parent(path) {
        ensure_path(session, parent).await?;
    }
    match session.create(path, CreateMode::Ephemeral).await {
        Ok(()) | Err(EnsembleError::NodeExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Lists the sorted children of `path` with a watch, creating `path` first if
/// it does not exist yet.
pub async fn watch_children(
    session: &dyn EnsembleSession,
    path: &str,
) -> Result<(Vec<String>, ChildWatch), EnsembleError> {
    let (mut children, watch) = match session.get_children_w(path).await {
        Err(EnsembleError::NoNode(_)) => {
            ensure_path(session, path).await?;
            session.get_children_w(path).await?
        }
        result => result?,
    };
    children.sort();
    Ok((children, watch))
}
