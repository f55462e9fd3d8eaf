//! Session lifecycle and the public watch surface.
//!
//! One background session task follows the connectivity events of the
//! current ensemble session:
//!
//! ```text
//!   Connected --Disconnected--> Disconnected --Connected--> Connected (retained)
//!       |                           |
//!       +---------Expired-----------+--> Connecting --> Connected (replaced)
//! ```
//!
//! Every return to `Connected` publishes a new [`Epoch`] generation. A
//! replaced session first gets every tracked ephemeral node recreated, so
//! watchers of the parent paths only see them go if they were gone for good.
//! Each watched path has its own task that reacts to the new generation by
//! re-arming its watch and delivering a fresh snapshot.

use crate::config::ClusterConfig;
use crate::ensemble::{
    self, Connection, EnsembleConnector, EnsembleSession, SessionEvent, SessionId,
};
use crate::errors::{ClusterError, EnsembleError};
use crate::metrics_defs::{
    ALL_METRICS, CLUSTER_CONNECT_FAILURES, CLUSTER_CONNECTED, CLUSTER_EPHEMERALS_RECREATED,
    CLUSTER_SESSION_EVENTS, CLUSTER_WATCHED_PATHS,
};
use crate::path_watch::PathWatch;
use crate::paths;
use crate::registry::{WatchRegistration, WatchRegistry};
use crate::subscription::{ConnectionSignals, WatchUpdates, subscription};
use shared::{counter, gauge};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, mpsc, watch};
use tokio_util::sync::CancellationToken;

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// The session as seen by path tasks.
#[derive(Clone)]
pub(crate) struct Epoch {
    /// Bumped every time the connection comes back, retained or replaced.
    pub(crate) generation: u64,
    pub(crate) connected: bool,
    pub(crate) session: Arc<dyn EnsembleSession>,
}

pub(crate) struct State {
    pub(crate) session: Arc<dyn EnsembleSession>,
    pub(crate) registry: WatchRegistry,
    ephemerals: BTreeSet<String>,
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<State>,
    epoch: watch::Sender<Epoch>,
    connector: Box<dyn EnsembleConnector>,
    config: ClusterConfig,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Shared {
    fn set_disconnected(&self) {
        self.epoch.send_if_modified(|epoch| {
            let was_connected = epoch.connected;
            epoch.connected = false;
            was_connected
        });
        gauge!(CLUSTER_CONNECTED).set(0.0);
    }

    // Called with the state lock held so registrations never straddle a
    // generation change.
    fn advance(&self, session: Arc<dyn EnsembleSession>) {
        self.epoch.send_modify(|epoch| {
            epoch.generation += 1;
            epoch.connected = true;
            epoch.session = session;
        });
        gauge!(CLUSTER_CONNECTED).set(1.0);
    }

    async fn resume(&self) {
        let state = self.state.lock().await;
        self.advance(state.session.clone());
    }

    async fn replace_session(&self, session: Arc<dyn EnsembleSession>) {
        let mut state = self.state.lock().await;
        if self.cancel.is_cancelled() {
            session.close().await;
            return;
        }

        let previous = std::mem::replace(&mut state.session, session.clone());
        if previous.id() != session.id() {
            for path in &state.ephemerals {
                match ensemble::create_ephemeral(session.as_ref(), path).await {
                    Ok(()) => counter!(CLUSTER_EPHEMERALS_RECREATED).increment(1),
                    Err(e) => {
                        tracing::error!(path = %path, error = %e, "failed to recreate ephemeral node")
                    }
                }
            }
        }
        self.advance(session);
    }
}

/// Watches children lists and owns ephemeral nodes on a coordination
/// ensemble, surviving disconnects and session expiry.
///
/// All paths are relative to the configured base path. Clones share the same
/// session; [`close`](Self::close) ends it for all of them.
#[derive(Clone)]
pub struct ClusterWatcher {
    shared: Arc<Shared>,
}

impl ClusterWatcher {
    /// Opens a session and makes sure the base path exists. Keeps retrying
    /// for up to the configured connect timeout.
    pub async fn connect<C>(config: ClusterConfig, connector: C) -> Result<Self, ClusterError>
    where
        C: EnsembleConnector + 'static,
    {
        config.validate()?;
        shared::metrics_defs::describe_all(ALL_METRICS);

        let connect_timeout = config.connect_timeout();
        let Connection { session, events } =
            tokio::time::timeout(connect_timeout, establish(&connector, &config))
                .await
                .map_err(|_| ClusterError::ConnectTimeout(connect_timeout))?;

        if let Err(e) = ensemble::ensure_path(session.as_ref(), &config.base_path).await {
            session.close().await;
            return Err(e.into());
        }

        tracing::info!(
            session_id = %session.id(),
            base_path = %config.base_path,
            "connected to the ensemble"
        );
        gauge!(CLUSTER_CONNECTED).set(1.0);

        let (epoch, _) = watch::channel(Epoch {
            generation: 0,
            connected: true,
            session: session.clone(),
        });
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                session,
                registry: WatchRegistry::default(),
                ephemerals: BTreeSet::new(),
            }),
            epoch,
            connector: Box::new(connector),
            config,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(run_session(shared.clone(), events));

        Ok(ClusterWatcher { shared })
    }

    /// Subscribes to the children of `path`, creating it if needed.
    ///
    /// Several subscriptions on one path share a single ensemble watch. The
    /// returned sequences stay open until [`remove_watch`](Self::remove_watch)
    /// or [`close`](Self::close).
    pub async fn watch_children(
        &self,
        path: &str,
    ) -> Result<(WatchUpdates, ConnectionSignals), ClusterError> {
        let path = self.qualify(path)?;
        let mut state = self.lock_open().await?;

        if let Some(registration) = state.registry.get_mut(&path) {
            let (consumer, updates, signals) = subscription(&path, registration.cancel_token());
            registration.add_consumer(consumer);
            tracing::debug!(
                path = %path,
                consumers = registration.consumer_count(),
                "joined existing watch"
            );
            return Ok((updates, signals));
        }

        // Read while holding the lock, so the first snapshot is the children
        // list at registration time.
        let epoch = self.shared.epoch.subscribe();
        let (snapshot, watch) = match ensemble::watch_children(state.session.as_ref(), &path).await
        {
            Ok((children, watch)) => (Some(children), Some(watch)),
            Err(e) if e.is_connection_error() => {
                tracing::warn!(path = %path, error = %e, "ensemble unavailable, watch is deferred");
                (None, None)
            }
            Err(e) => return Err(e.into()),
        };

        let cancel = self.shared.cancel.child_token();
        let (consumer, updates, signals) = subscription(&path, &cancel);
        let mut registration = WatchRegistration::new(cancel.clone(), snapshot);
        registration.add_consumer(consumer);
        state.registry.insert(path.clone(), registration);
        gauge!(CLUSTER_WATCHED_PATHS).set(state.registry.len() as f64);
        tracing::debug!(path = %path, "watching children");

        PathWatch::new(path, self.shared.clone(), epoch, cancel, watch).spawn();
        Ok((updates, signals))
    }

    /// Ends every subscription on `path`. Unknown paths are ignored.
    pub async fn remove_watch(&self, path: &str) {
        let Ok(path) = self.qualify(path) else {
            return;
        };
        let mut state = self.shared.state.lock().await;
        if state.registry.remove(&path).is_some() {
            gauge!(CLUSTER_WATCHED_PATHS).set(state.registry.len() as f64);
            tracing::debug!(path = %path, "removed watch");
        }
    }

    /// Creates an ephemeral node owned by this watcher's session, along with
    /// any missing parents. It is recreated whenever the session is replaced.
    pub async fn create_ephemeral(&self, path: &str) -> Result<(), ClusterError> {
        let path = self.qualify_node(path)?;
        let mut state = self.lock_open().await?;

        ensemble::create_ephemeral(state.session.as_ref(), &path).await?;
        tracing::debug!(path = %path, "created ephemeral node");
        state.ephemerals.insert(path);
        Ok(())
    }

    /// Deletes an ephemeral node created through this watcher. Nodes it does
    /// not own, or that are already gone, are ignored.
    pub async fn remove_ephemeral(&self, path: &str) -> Result<(), ClusterError> {
        let path = self.qualify_node(path)?;
        let mut state = self.lock_open().await?;

        if !state.ephemerals.remove(&path) {
            return Ok(());
        }
        match state.session.delete(&path).await {
            Ok(()) | Err(EnsembleError::NoNode(_)) => {
                tracing::debug!(path = %path, "removed ephemeral node");
                Ok(())
            }
            Err(e) => {
                state.ephemerals.insert(path);
                Err(e.into())
            }
        }
    }

    /// Ends the session and closes every open watch. Safe to call repeatedly.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.cancel.cancel();

        let mut state = self.shared.state.lock().await;
        state.registry.clear();
        state.ephemerals.clear();
        state.session.close().await;
        self.shared.set_disconnected();
        gauge!(CLUSTER_WATCHED_PATHS).set(0.0);

        tracing::info!(session_id = %state.session.id(), "closed ensemble session");
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst) && self.shared.epoch.borrow().connected
    }

    pub fn session_id(&self) -> SessionId {
        self.shared.epoch.borrow().session.id()
    }

    /// Full paths with at least one registered subscription.
    pub async fn watched_paths(&self) -> Vec<String> {
        self.shared.state.lock().await.registry.paths()
    }

    pub fn base_path(&self) -> &str {
        &self.shared.config.base_path
    }

    fn qualify(&self, path: &str) -> Result<String, ClusterError> {
        paths::join(&self.shared.config.base_path, path)
            .ok_or_else(|| ClusterError::InvalidPath(path.to_string()))
    }

    // Like `qualify`, but never the base path itself.
    fn qualify_node(&self, path: &str) -> Result<String, ClusterError> {
        if path == paths::ROOT {
            return Err(ClusterError::InvalidPath(path.to_string()));
        }
        self.qualify(path)
    }

    async fn lock_open(&self) -> Result<MutexGuard<'_, State>, ClusterError> {
        let state = self.shared.state.lock().await;
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ClusterError::Closed);
        }
        Ok(state)
    }
}

/// Opens a session, retrying with exponential backoff until one is up.
async fn establish(connector: &dyn EnsembleConnector, config: &ClusterConfig) -> Connection {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match connector
            .connect(&config.servers, config.session_timeout())
            .await
        {
            Ok(connection) => return connection,
            Err(e) => {
                counter!(CLUSTER_CONNECT_FAILURES).increment(1);
                tracing::warn!(error = %e, retry_in = ?backoff, "failed to connect to the ensemble");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

async fn run_session(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            // A session whose event stream ended is as good as expired
            event = events.recv() => event.unwrap_or(SessionEvent::Expired),
        };
        counter!(CLUSTER_SESSION_EVENTS, "event" => event_name(event)).increment(1);

        match event {
            SessionEvent::Disconnected => {
                tracing::warn!("lost connection to the ensemble");
                shared.set_disconnected();
            }
            SessionEvent::Connected => {
                tracing::info!("reconnected to the ensemble, session retained");
                shared.resume().await;
            }
            SessionEvent::Expired => {
                tracing::warn!("ensemble session expired, opening a new one");
                shared.set_disconnected();

                let connection = tokio::select! {
                    biased;
                    _ = shared.cancel.cancelled() => break,
                    connection = establish(shared.connector.as_ref(), &shared.config) => connection,
                };
                tracing::info!(session_id = %connection.session.id(), "opened a new ensemble session");
                events = connection.events;
                shared.replace_session(connection.session).await;
            }
        }
    }

    tracing::debug!("session task stopped");
}

fn event_name(event: SessionEvent) -> &'static str {
    match event {
        SessionEvent::Disconnected => "disconnected",
        SessionEvent::Connected => "connected",
        SessionEvent::Expired => "expired",
    }
}
