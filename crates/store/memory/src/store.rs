use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

use exclave_store::{KeyValueStore, Message, MessageStream, StoreError, SubscriberControl};

/// Stored value with its expiry. Expired entries are evicted lazily on the
/// next conditional set or delete for the same key.
#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// One store operation, as recorded by the instrumented store.
///
/// The sequence of [`Acquired`](StoreEvent::Acquired) and
/// [`Deleted`](StoreEvent::Deleted) events for a key is the ground truth for
/// mutual-exclusion assertions: two `Acquired` without an intervening
/// `Deleted` means the atomicity contract was violated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// `set_if_absent` succeeded: the key was newly set.
    Acquired(String),
    /// `set_if_absent` found the key already held.
    Contended(String),
    /// `delete` removed a live key.
    Deleted(String),
    /// A message was published on the channel.
    Published(String),
}

/// One open subscriber connection's routing state.
struct SubscriberSlot {
    channels: HashSet<String>,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct PubSubState {
    next_id: u64,
    slots: HashMap<u64, SubscriberSlot>,
    subscribes: HashMap<String, u64>,
    unsubscribes: HashMap<String, u64>,
}

#[derive(Default)]
struct Shared {
    entries: DashMap<String, Entry>,
    pubsub: Mutex<PubSubState>,
    events: Mutex<Vec<StoreEvent>>,
    fail_commands: AtomicBool,
}

/// In-memory [`KeyValueStore`] with pub/sub fan-out and instrumentation.
///
/// Cloning is cheap and shares the underlying state, so clones behave like
/// independent connections to the same store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a key, or `None` if absent or expired.
    pub fn get(&self, key: &str) -> Option<String> {
        let entry = self.shared.entries.get(key)?;
        if entry.is_expired() {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Snapshot of every operation recorded so far, in order.
    pub async fn events(&self) -> Vec<StoreEvent> {
        self.shared.events.lock().await.clone()
    }

    /// Number of SUBSCRIBE calls issued for a channel.
    pub async fn subscribe_count(&self, channel: &str) -> u64 {
        let pubsub = self.shared.pubsub.lock().await;
        pubsub.subscribes.get(channel).copied().unwrap_or(0)
    }

    /// Number of UNSUBSCRIBE calls issued for a channel.
    pub async fn unsubscribe_count(&self, channel: &str) -> u64 {
        let pubsub = self.shared.pubsub.lock().await;
        pubsub.unsubscribes.get(channel).copied().unwrap_or(0)
    }

    /// Number of subscriber connections currently open.
    pub async fn open_subscribers(&self) -> usize {
        self.shared.pubsub.lock().await.slots.len()
    }

    /// Drop every open subscriber connection, ending each message stream.
    ///
    /// Simulates a transport failure on the notification side-channel. The
    /// command path (set/delete/publish) is unaffected.
    pub async fn drop_subscribers(&self) {
        self.shared.pubsub.lock().await.slots.clear();
    }

    /// Make every command-path call (set/delete/publish) fail with a
    /// connection error until turned off again.
    ///
    /// Simulates losing the store on the command path. The subscriber
    /// side-channel is unaffected.
    pub fn fail_commands(&self, fail: bool) {
        self.shared.fail_commands.store(fail, Ordering::SeqCst);
    }

    fn check_command_path(&self) -> Result<(), StoreError> {
        if self.shared.fail_commands.load(Ordering::SeqCst) {
            return Err(StoreError::Connection(
                "injected connection failure".to_owned(),
            ));
        }
        Ok(())
    }

    async fn record(&self, event: StoreEvent) {
        self.shared.events.lock().await.push(event);
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_command_path()?;
        // Evict an expired holder before testing vacancy.
        self.shared.entries.remove_if(key, |_, entry| entry.is_expired());

        let acquired = match self.shared.entries.entry(key.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Entry {
                    value: value.to_owned(),
                    expires_at: Instant::now() + ttl,
                });
                true
            }
        };

        let event = if acquired {
            StoreEvent::Acquired(key.to_owned())
        } else {
            StoreEvent::Contended(key.to_owned())
        };
        self.record(event).await;
        Ok(acquired)
    }

    async fn delete(&self, key: &str) -> Result<u64, StoreError> {
        self.check_command_path()?;
        // An expired entry counts as already gone, matching store-side TTL
        // semantics.
        self.shared.entries.remove_if(key, |_, entry| entry.is_expired());

        let removed = self.shared.entries.remove(key).is_some();
        if removed {
            self.record(StoreEvent::Deleted(key.to_owned())).await;
        }
        Ok(u64::from(removed))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, StoreError> {
        self.check_command_path()?;
        let pubsub = self.shared.pubsub.lock().await;
        let mut receivers = 0u64;
        for slot in pubsub.slots.values() {
            if slot.channels.contains(channel) {
                let message = Message {
                    channel: channel.to_owned(),
                    payload: payload.to_owned(),
                };
                if slot.tx.send(message).is_ok() {
                    receivers += 1;
                }
            }
        }
        drop(pubsub);

        self.record(StoreEvent::Published(channel.to_owned())).await;
        Ok(receivers)
    }

    async fn subscriber(
        &self,
    ) -> Result<(Box<dyn SubscriberControl>, MessageStream), StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut pubsub = self.shared.pubsub.lock().await;
        let id = pubsub.next_id;
        pubsub.next_id += 1;
        pubsub.slots.insert(
            id,
            SubscriberSlot {
                channels: HashSet::new(),
                tx,
            },
        );
        drop(pubsub);

        let control = MemorySubscriberControl {
            shared: Arc::clone(&self.shared),
            id,
        };
        let stream = Box::pin(UnboundedReceiverStream::new(rx));
        Ok((Box::new(control), stream))
    }
}

/// Control half of an in-memory subscriber connection.
struct MemorySubscriberControl {
    shared: Arc<Shared>,
    id: u64,
}

#[async_trait]
impl SubscriberControl for MemorySubscriberControl {
    async fn subscribe(&mut self, channel: &str) -> Result<(), StoreError> {
        let mut pubsub = self.shared.pubsub.lock().await;
        *pubsub.subscribes.entry(channel.to_owned()).or_insert(0) += 1;
        match pubsub.slots.get_mut(&self.id) {
            Some(slot) => {
                slot.channels.insert(channel.to_owned());
                Ok(())
            }
            None => Err(StoreError::Subscription(
                "subscriber connection closed".to_owned(),
            )),
        }
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), StoreError> {
        let mut pubsub = self.shared.pubsub.lock().await;
        *pubsub.unsubscribes.entry(channel.to_owned()).or_insert(0) += 1;
        match pubsub.slots.get_mut(&self.id) {
            Some(slot) => {
                slot.channels.remove(channel);
                Ok(())
            }
            None => Err(StoreError::Subscription(
                "subscriber connection closed".to_owned(),
            )),
        }
    }
}
