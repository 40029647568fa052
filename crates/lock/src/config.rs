use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`LockManager`](crate::LockManager).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Expiry placed on the lock key at acquisition. The store removes the
    /// key after this long if the holder never releases (the sole crash
    /// recovery), so it must sit well above the expected critical-section
    /// duration or a live holder loses its lock mid-section.
    pub lock_ttl: Duration,

    /// Prefix prepended to lock keys to form release channel names, keeping
    /// lock notifications clear of unrelated pub/sub traffic on the same
    /// store.
    pub channel_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            channel_prefix: String::from("exclave:released"),
        }
    }
}
