use crate::subscription::Consumer;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// State of one watched path. The path's single ensemble watch is owned by
/// its path task; `cancel` stops that task and every consumer feed.
pub(crate) struct WatchRegistration {
    consumers: Vec<Consumer>,
    snapshot: Option<Vec<String>>,
    cancel: CancellationToken,
}

impl WatchRegistration {
    pub(crate) fn new(cancel: CancellationToken, snapshot: Option<Vec<String>>) -> Self {
        WatchRegistration {
            consumers: Vec::new(),
            snapshot,
            cancel,
        }
    }

    /// Adds a consumer and hands it the last known snapshot, if any.
    pub(crate) fn add_consumer(&mut self, consumer: Consumer) {
        if let Some(snapshot) = &self.snapshot {
            consumer.push_update(snapshot.clone());
        }
        self.consumers.push(consumer);
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    fn live_consumers(&mut self) -> Vec<Consumer> {
        self.consumers.retain(|consumer| !consumer.is_closed());
        self.consumers.clone()
    }

    /// Stops the path task and the feeds of every consumer, which ends their
    /// sequences.
    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }
}

#[derive(Default)]
pub(crate) struct WatchRegistry {
    paths: HashMap<String, WatchRegistration>,
}

impl WatchRegistry {
    pub(crate) fn get_mut(&mut self, path: &str) -> Option<&mut WatchRegistration> {
        self.paths.get_mut(path)
    }

    pub(crate) fn insert(&mut self, path: String, registration: WatchRegistration) {
        if let Some(previous) = self.paths.insert(path, registration) {
            previous.close();
        }
    }

    pub(crate) fn remove(&mut self, path: &str) -> Option<WatchRegistration> {
        let registration = self.paths.remove(path)?;
        registration.close();
        Some(registration)
    }

    /// Removes and closes every registration.
    pub(crate) fn clear(&mut self) {
        for (_, registration) in self.paths.drain() {
            registration.close();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.paths.len()
    }

    pub(crate) fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.paths.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Records `children` as the latest snapshot of `path` and returns who it
    /// must be delivered to. `None` if the path is no longer registered.
    pub(crate) fn record_snapshot(
        &mut self,
        path: &str,
        children: Vec<String>,
    ) -> Option<Vec<Consumer>> {
        let registration = self.paths.get_mut(path)?;
        registration.snapshot = Some(children);
        Some(registration.live_consumers())
    }

    pub(crate) fn consumers(&mut self, path: &str) -> Option<Vec<Consumer>> {
        Some(self.paths.get_mut(path)?.live_consumers())
    }
}
