//! In-memory store backend for Exclave.
//!
//! Implements [`KeyValueStore`](exclave_store::KeyValueStore) against process
//! memory: a [`dashmap::DashMap`] for keys (with lazy TTL eviction) and an
//! in-process pub/sub fan-out for release notifications. Useful on its own
//! for single-process deployments, and as the instrumented test double for
//! the lock manager's test suite: every conditional set, delete and publish
//! is recorded, subscribe/unsubscribe calls are counted per channel,
//! [`MemoryStore::drop_subscribers`] injects a transport failure on the
//! notification side-channel, and [`MemoryStore::fail_commands`] injects
//! connection failures on the command path.

mod store;

pub use store::{MemoryStore, StoreEvent};
