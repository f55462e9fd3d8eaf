use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// Delivery to a consumer stalls once this many snapshots are unread.
const UPDATES_BUFFER: usize = 8;
// Same for connectivity signals.
const SIGNALS_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The ensemble connection was lost. Snapshots may be stale until the next
    /// `Reconnected`.
    Disconnected,
    /// The connection is back and a fresh snapshot has been delivered.
    Reconnected,
}

/// Children snapshots of one watched path, oldest first.
///
/// The first snapshot is the children list at the time the watch was
/// registered. Ends once the watch is removed or the watcher is closed.
#[derive(Debug)]
pub struct WatchUpdates {
    path: String,
    rx: mpsc::Receiver<Vec<String>>,
}

impl WatchUpdates {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next sorted children list, `None` once the watch is gone.
    pub async fn recv(&mut self) -> Option<Vec<String>> {
        self.rx.recv().await
    }
}

/// Connectivity transitions seen by one watched path.
#[derive(Debug)]
pub struct ConnectionSignals {
    rx: mpsc::Receiver<ConnectionEvent>,
}

impl ConnectionSignals {
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }
}

/// Producer half of one logical subscription.
///
/// Pushing never waits. Each sequence has its own feed task that hands the
/// queued elements to the consumer in order, so a consumer that stops reading
/// only holds up its own elements.
#[derive(Clone)]
pub(crate) struct Consumer {
    updates: mpsc::UnboundedSender<Vec<String>>,
    signals: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Consumer {
    pub(crate) fn push_update(&self, children: Vec<String>) {
        let _ = self.updates.send(children);
    }

    pub(crate) fn push_signal(&self, event: ConnectionEvent) {
        let _ = self.signals.send(event);
    }

    /// Both sequences were dropped by the consumer.
    pub(crate) fn is_closed(&self) -> bool {
        self.updates.is_closed() && self.signals.is_closed()
    }
}

/// Creates a subscription whose sequences end when `cancel` fires. Elements
/// still queued at that point are discarded.
pub(crate) fn subscription(
    path: &str,
    cancel: &CancellationToken,
) -> (Consumer, WatchUpdates, ConnectionSignals) {
    let (updates_queue, updates_feed) = mpsc::unbounded_channel();
    let (signals_queue, signals_feed) = mpsc::unbounded_channel();
    let (updates_tx, updates_rx) = mpsc::channel(UPDATES_BUFFER);
    let (signals_tx, signals_rx) = mpsc::channel(SIGNALS_BUFFER);

    tokio::spawn(feed(updates_feed, updates_tx, cancel.clone()));
    tokio::spawn(feed(signals_feed, signals_tx, cancel.clone()));

    (
        Consumer {
            updates: updates_queue,
            signals: signals_queue,
        },
        WatchUpdates {
            path: path.to_string(),
            rx: updates_rx,
        },
        ConnectionSignals { rx: signals_rx },
    )
}

async fn feed<T>(
    mut queue: mpsc::UnboundedReceiver<T>,
    tx: mpsc::Sender<T>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tx.closed() => break,
            item = queue.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = tx.send(item) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_full_consumer_keeps_its_elements() {
        let cancel = CancellationToken::new();
        let (consumer, _updates, mut signals) = subscription("/foo", &cancel);

        for _ in 0..SIGNALS_BUFFER {
            consumer.push_signal(ConnectionEvent::Disconnected);
            consumer.push_signal(ConnectionEvent::Reconnected);
        }

        for _ in 0..SIGNALS_BUFFER {
            assert_eq!(signals.recv().await, Some(ConnectionEvent::Disconnected));
            assert_eq!(signals.recv().await, Some(ConnectionEvent::Reconnected));
        }

        cancel.cancel();
        assert_eq!(signals.recv().await, None);
    }

    #[tokio::test]
    async fn test_dropped_sequences_close_the_consumer() {
        let cancel = CancellationToken::new();
        let (consumer, updates, signals) = subscription("/foo", &cancel);
        assert!(!consumer.is_closed());

        drop(updates);
        drop(signals);

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while !consumer.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(closed.is_ok(), "the consumer should be closed");
    }
}
