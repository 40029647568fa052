use std::time::Duration;

/// Configuration for the Redis store backend.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g. `redis://127.0.0.1:6379`).
    pub url: String,

    /// Prefix applied to every lock key to avoid collisions with unrelated
    /// data on the same server. Pub/sub channels are not prefixed here; the
    /// lock manager applies its own channel prefix.
    pub prefix: String,

    /// Number of connections in the `deadpool-redis` pool.
    pub pool_size: usize,

    /// Timeout for acquiring a pooled connection.
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::from("redis://127.0.0.1:6379"),
            prefix: String::from("exclave"),
            pool_size: 10,
            connection_timeout: Duration::from_secs(5),
        }
    }
}
