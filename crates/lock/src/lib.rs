//! Distributed mutual-exclusion locks over a shared key-value store.
//!
//! A [`LockManager`] coordinates independent processes through a store that
//! supports atomic "set if absent with expiry" and publish/subscribe (Redis
//! in production; see the backend crates). Acquisition is one conditional
//! set; contended acquirers park on the key's release channel and retry the
//! set whenever they are woken, so mutual exclusion never depends on
//! notification delivery. A single background [notification reader] fans
//! incoming release messages out to the waiters of each key and, on
//! transport failure, wakes everyone so they degrade to timeout-bounded
//! polling instead of hanging.
//!
//! Holder crashes are covered by the TTL the store places on the lock key;
//! there is no fencing token, so a holder paused past its TTL can still call
//! [`LockManager::release`] and delete a successor's lock. Callers whose
//! critical sections can outlive `lock_ttl` need a different tool.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use exclave_lock::{LockConfig, LockManager};
//! use exclave_store_redis::{RedisConfig, RedisStore};
//!
//! let store = Arc::new(RedisStore::new(&RedisConfig::default())?);
//! let manager = LockManager::new(store, LockConfig::default());
//! manager.start().await?;
//!
//! if manager.acquire("job-42", Duration::from_secs(5)).await? {
//!     // critical section
//!     manager.release("job-42").await?;
//! }
//! ```
//!
//! [notification reader]: LockManager::start

mod config;
mod error;
mod manager;
mod reader;
mod registry;

pub use config::LockConfig;
pub use error::LockError;
pub use manager::{LockHandle, LockManager};
