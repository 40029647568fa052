use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};

use exclave_store::MessageStream;

use crate::registry::WaiterRegistry;

/// Background task that owns the stream half of the dedicated subscriber
/// connection and fans release notifications out to the waiters parked on
/// each key.
///
/// Runs until shut down or until the stream ends. A stream end is a
/// transport failure: the reader broadcasts a reset that wakes every waiter
/// across every key, so each falls back to re-attempting its conditional
/// set under its own timeout rather than hanging on a subscription that may
/// never be restored. The reader does not reconnect.
pub(crate) struct NotificationReader {
    stream: MessageStream,
    registry: Arc<Mutex<WaiterRegistry>>,
    reset_tx: broadcast::Sender<()>,
    channel_prefix: String,
    shutdown_rx: mpsc::Receiver<()>,
}

impl NotificationReader {
    pub(crate) fn new(
        stream: MessageStream,
        registry: Arc<Mutex<WaiterRegistry>>,
        reset_tx: broadcast::Sender<()>,
        channel_prefix: String,
        shutdown_rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            stream,
            registry,
            reset_tx,
            channel_prefix,
            shutdown_rx,
        }
    }

    /// Run the reader until shutdown is signaled or the transport fails.
    pub(crate) async fn run(mut self) {
        info!("notification reader starting");

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("notification reader received shutdown signal");
                    break;
                }
                msg = self.stream.next() => match msg {
                    Some(msg) => self.dispatch(&msg.channel).await,
                    None => {
                        warn!("subscriber connection lost; waking all waiters");
                        // The control half points at the dead connection;
                        // clearing it lets later waiters park without
                        // attempting subscriptions that cannot succeed.
                        self.registry.lock().await.control = None;
                        let _ = self.reset_tx.send(());
                        break;
                    }
                }
            }
        }

        info!("notification reader stopped");
    }

    /// Route one release notification to the waiters of its lock key.
    async fn dispatch(&mut self, channel: &str) {
        let prefix = format!("{}:", self.channel_prefix);
        let Some(key) = channel.strip_prefix(&prefix) else {
            debug!(channel, "ignoring message on unrelated channel");
            return;
        };

        let registry = self.registry.lock().await;
        registry.wake(key);
        drop(registry);
        debug!(key, "release notification dispatched");
    }
}
