//! Redis store backend for Exclave.
//!
//! Implements [`KeyValueStore`](exclave_store::KeyValueStore) against a
//! Redis-compatible server.
//!
//! # Features
//!
//! - **Atomic acquisition**: the conditional set is `SET NX PX` issued as a
//!   Lua script, so the existence check and the TTL land in one step.
//! - **Connection pooling**: commands (SET/DEL/PUBLISH) go through a
//!   `deadpool-redis` pool.
//! - **Dedicated subscriber**: Redis forbids regular commands on a
//!   connection in subscriber mode, so [`RedisStore::subscriber`] opens its
//!   own connection and splits it into a control sink and a message stream.
//!
//! # Consistency
//!
//! Against a single Redis instance the conditional set gives full mutual
//! exclusion. Under Sentinel or Cluster failover a lock can be lost; this
//! backend makes no attempt to paper over that.
//!
//! # Example
//!
//! ```ignore
//! use exclave_store_redis::{RedisConfig, RedisStore};
//!
//! let config = RedisConfig::default();
//! let store = RedisStore::new(&config)?;
//! ```

mod config;
mod scripts;
mod store;

pub use config::RedisConfig;
pub use store::RedisStore;
