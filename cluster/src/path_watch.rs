use crate::ensemble::{self, ChildWatch, SessionId, WatchEvent};
use crate::metrics_defs::{CLUSTER_SIGNALS, CLUSTER_SNAPSHOTS};
use crate::subscription::ConnectionEvent;
use crate::watcher::{Epoch, Shared};
use shared::counter;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

const RETRY_INTERVAL: Duration = Duration::from_millis(500);

enum Step {
    Stop,
    EpochChanged,
    Fired(WatchEvent),
    Retry,
}

/// Background task of one watched path.
///
/// Owns the path's only ensemble watch. It is re-armed after every firing and
/// after a session replacement, and kept across a reconnect that retained the
/// session if it has not fired, so repeated reconnects never stack up watches.
/// Snapshots and signals are queued to every consumer of the path without
/// waiting; a slow consumer holds up its own sequences only.
pub(crate) struct PathWatch {
    path: String,
    shared: Arc<Shared>,
    epoch: watch::Receiver<Epoch>,
    cancel: CancellationToken,
    watch: Option<ChildWatch>,
    generation: u64,
    session_id: SessionId,
    // Consumers were told about a disconnect and still wait for a Reconnected
    signalled_down: bool,
    resync_pending: bool,
    retry_at: Option<Instant>,
}

impl PathWatch {
    pub(crate) fn new(
        path: String,
        shared: Arc<Shared>,
        epoch: watch::Receiver<Epoch>,
        cancel: CancellationToken,
        watch: Option<ChildWatch>,
    ) -> Self {
        let (generation, session_id) = {
            let epoch = epoch.borrow();
            (epoch.generation, epoch.session.id())
        };
        let retry_at = watch.is_none().then(|| Instant::now() + RETRY_INTERVAL);

        PathWatch {
            path,
            shared,
            epoch,
            cancel,
            watch,
            generation,
            session_id,
            signalled_down: false,
            resync_pending: false,
            retry_at,
        }
    }

    pub(crate) fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(mut self) {
        loop {
            let retry_at = self.retry_at;
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Stop,
                changed = self.epoch.changed() => match changed {
                    Ok(()) => Step::EpochChanged,
                    Err(_) => Step::Stop,
                },
                event = next_event(&mut self.watch) => Step::Fired(event),
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => Step::Retry,
            };

            let flow = match step {
                Step::Stop => ControlFlow::Break(()),
                Step::EpochChanged => self.on_epoch().await,
                Step::Fired(event) => {
                    self.watch = None;
                    self.on_watch_event(event).await
                }
                Step::Retry => {
                    self.retry_at = None;
                    self.refresh().await
                }
            };
            if flow.is_break() {
                break;
            }
        }

        tracing::debug!(path = %self.path, "path watch stopped");
    }

    async fn on_epoch(&mut self) -> ControlFlow<()> {
        let (generation, connected, session_id) = {
            let epoch = self.epoch.borrow_and_update();
            (epoch.generation, epoch.connected, epoch.session.id())
        };
        let new_generation = generation != self.generation;

        // A generation can be skipped entirely, its disconnect included
        if (new_generation || !connected) && !self.signalled_down {
            self.signalled_down = true;
            self.signal(ConnectionEvent::Disconnected).await?;
        }
        if !new_generation || !connected {
            return ControlFlow::Continue(());
        }

        // A retained session still holds a watch that has not fired, so only
        // the children are read again. Anything else needs a new watch.
        let retained = session_id == self.session_id;
        if !(retained && self.watch.as_mut().is_some_and(ChildWatch::is_pending)) {
            self.watch = None;
        }
        self.generation = generation;
        self.session_id = session_id;
        self.retry_at = None;
        self.resync_pending = true;
        self.refresh().await
    }

    async fn on_watch_event(&mut self, event: WatchEvent) -> ControlFlow<()> {
        match event {
            WatchEvent::ChildrenChanged | WatchEvent::NodeDeleted => self.refresh().await,
            WatchEvent::SessionLost => {
                // Usually followed by a new generation; the timer covers the rest
                if self.epoch.borrow().connected {
                    self.retry_at = Some(Instant::now() + RETRY_INTERVAL);
                }
                ControlFlow::Continue(())
            }
        }
    }

    /// Reads the children, arming a watch unless one is pending, and delivers
    /// them.
    async fn refresh(&mut self) -> ControlFlow<()> {
        let session = self.epoch.borrow().session.clone();

        let read = if self.watch.is_some() {
            session.get_children(&self.path).await.map(|mut children| {
                children.sort();
                children
            })
        } else {
            ensemble::watch_children(session.as_ref(), &self.path)
                .await
                .map(|(children, watch)| {
                    self.watch = Some(watch);
                    children
                })
        };

        match read {
            Ok(children) => {
                self.publish(children).await?;

                if self.resync_pending {
                    self.resync_pending = false;
                    self.signalled_down = false;
                    self.signal(ConnectionEvent::Reconnected).await?;
                }
            }
            Err(e) if e.is_connection_error() => {
                tracing::debug!(path = %self.path, error = %e, "ensemble unavailable, retrying");
                self.retry_at = Some(Instant::now() + RETRY_INTERVAL);
            }
            Err(e) => {
                tracing::warn!(path = %self.path, error = %e, "failed to read children, retrying");
                self.retry_at = Some(Instant::now() + RETRY_INTERVAL);
            }
        }

        ControlFlow::Continue(())
    }

    async fn publish(&self, children: Vec<String>) -> ControlFlow<()> {
        let consumers = {
            let mut state = self.shared.state.lock().await;
            match state.registry.record_snapshot(&self.path, children.clone()) {
                Some(consumers) => consumers,
                None => return ControlFlow::Break(()),
            }
        };

        counter!(CLUSTER_SNAPSHOTS).increment(1);
        tracing::debug!(path = %self.path, children = children.len(), "delivering snapshot");
        for consumer in consumers {
            consumer.push_update(children.clone());
        }
        ControlFlow::Continue(())
    }

    async fn signal(&self, event: ConnectionEvent) -> ControlFlow<()> {
        let consumers = {
            let mut state = self.shared.state.lock().await;
            match state.registry.consumers(&self.path) {
                Some(consumers) => consumers,
                None => return ControlFlow::Break(()),
            }
        };

        let name = match event {
            ConnectionEvent::Disconnected => "disconnected",
            ConnectionEvent::Reconnected => "reconnected",
        };
        counter!(CLUSTER_SIGNALS, "event" => name).increment(1);
        tracing::debug!(path = %self.path, ?event, "signalling consumers");
        for consumer in consumers {
            consumer.push_signal(event);
        }
        ControlFlow::Continue(())
    }
}

async fn next_event(watch: &mut Option<ChildWatch>) -> WatchEvent {
    match watch {
        Some(watch) => watch.await,
        None => std::future::pending().await,
    }
}
