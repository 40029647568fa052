use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use futures::StreamExt;
use redis::Script;

use exclave_store::{KeyValueStore, Message, MessageStream, StoreError, SubscriberControl};

use crate::config::RedisConfig;
use crate::scripts;

/// Redis-backed implementation of [`KeyValueStore`].
///
/// Commands go through a `deadpool-redis` pool; the subscriber side opens a
/// dedicated connection per [`subscriber`](KeyValueStore::subscriber) call.
pub struct RedisStore {
    pool: Pool,
    client: redis::Client,
    prefix: String,
}

impl RedisStore {
    /// Create a new `RedisStore` from the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the pool or client cannot be
    /// created.
    pub fn new(config: &RedisConfig) -> Result<Self, StoreError> {
        let cfg = Config::from_url(&config.url);
        let pool = cfg
            .builder()
            .map(|b| {
                b.max_size(config.pool_size)
                    .wait_timeout(Some(config.connection_timeout))
                    .runtime(Runtime::Tokio1)
                    .build()
            })
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            client,
            prefix: config.prefix.clone(),
        })
    }

    /// Build the full Redis key for a lock.
    fn lock_key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.prefix, key)
    }

    /// Obtain a connection from the pool.
    async fn conn(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let redis_key = self.lock_key(key);
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        let mut conn = self.conn().await?;
        let script = Script::new(scripts::SET_IF_ABSENT);
        let result: i64 = script
            .key(&redis_key)
            .arg(value)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(result == 1)
    }

    async fn delete(&self, key: &str) -> Result<u64, StoreError> {
        let redis_key = self.lock_key(key);
        let mut conn = self.conn().await?;

        let removed: u64 = redis::cmd("DEL")
            .arg(&redis_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(removed)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;

        let receivers: u64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(receivers)
    }

    async fn subscriber(
        &self,
    ) -> Result<(Box<dyn SubscriberControl>, MessageStream), StoreError> {
        let pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| StoreError::Subscription(e.to_string()))?;

        let (sink, stream) = pubsub.split();
        // The raw stream ends when the connection drops, which is exactly
        // the transport-failure signal MessageStream promises.
        let stream = stream.map(|msg| Message {
            channel: msg.get_channel_name().to_owned(),
            payload: msg.get_payload::<String>().unwrap_or_default(),
        });

        Ok((Box::new(RedisSubscriberControl { sink }), Box::pin(stream)))
    }
}

/// Control half of the dedicated Redis subscriber connection.
struct RedisSubscriberControl {
    sink: redis::aio::PubSubSink,
}

#[async_trait]
impl SubscriberControl for RedisSubscriberControl {
    async fn subscribe(&mut self, channel: &str) -> Result<(), StoreError> {
        self.sink
            .subscribe(channel)
            .await
            .map_err(|e| StoreError::Subscription(e.to_string()))
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), StoreError> {
        self.sink
            .unsubscribe(channel)
            .await
            .map_err(|e| StoreError::Subscription(e.to_string()))
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;
    use crate::config::RedisConfig;

    fn test_config() -> RedisConfig {
        RedisConfig {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            prefix: format!("exclave-test-{}", std::process::id()),
            ..RedisConfig::default()
        }
    }

    #[tokio::test]
    async fn store_conformance() {
        let config = test_config();
        let store = RedisStore::new(&config).expect("pool creation should succeed");
        exclave_store::testing::run_store_conformance_tests(&store)
            .await
            .expect("conformance tests should pass");
    }
}
