//! Store trait abstractions for Exclave.
//!
//! Mutual exclusion in Exclave rests entirely on the backing store's atomic
//! conditional set; pub/sub is a latency optimization for waking blocked
//! acquirers and is never relied on for correctness. This crate defines the
//! seam between the lock manager and the store: the [`KeyValueStore`] command
//! path, the [`SubscriberControl`]/[`MessageStream`] halves of the dedicated
//! subscriber connection, and the [`StoreError`] taxonomy.
//!
//! Backends implement these traits; the [`testing`] module provides a
//! conformance suite every backend's tests should run.

pub mod error;
pub mod store;
pub mod testing;

pub use error::StoreError;
pub use store::{KeyValueStore, Message, MessageStream, SubscriberControl};
