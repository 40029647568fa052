use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::error::StoreError;

/// A pub/sub message delivered on the dedicated subscriber connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel the message arrived on.
    pub channel: String,
    /// Message payload. Lock wake-ups only care that a message arrived, not
    /// what it says.
    pub payload: String,
}

/// Stream half of a dedicated subscriber connection.
///
/// The stream ending (`None`) signals a transport-level failure; there is no
/// per-message error variant. Reconnection is the store client's concern,
/// not the consumer's.
pub type MessageStream = Pin<Box<dyn Stream<Item = Message> + Send>>;

/// Control half of a dedicated subscriber connection.
///
/// Most stores require that a connection in subscriber mode never interleave
/// regular commands, so subscribe/unsubscribe live on their own handle
/// rather than on [`KeyValueStore`].
#[async_trait]
pub trait SubscriberControl: Send {
    /// Begin receiving messages published on `channel`.
    async fn subscribe(&mut self, channel: &str) -> Result<(), StoreError>;

    /// Stop receiving messages published on `channel`.
    async fn unsubscribe(&mut self, channel: &str) -> Result<(), StoreError>;
}

/// Shared, network-accessible key-value store with atomic conditional set
/// and publish/subscribe messaging.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Atomic `SET key value NX PX ttl`: set the key only if it is absent,
    /// with the expiry applied in the same indivisible step. Returns `true`
    /// if the key was newly set.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Delete a key. Returns the number of keys removed (0 or 1); deleting
    /// an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<u64, StoreError>;

    /// Publish a message on a channel. Returns the number of subscribers
    /// that received it; any value is acceptable.
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, StoreError>;

    /// Open the dedicated subscriber connection, split into its control half
    /// and its message stream.
    async fn subscriber(
        &self,
    ) -> Result<(Box<dyn SubscriberControl>, MessageStream), StoreError>;
}
