//! Distributed tier backed by Redis.
//!
//! Uses the blocking client on the blocking thread pool with one lazily
//! (re)established connection. Expiry is delegated to Redis via `SET .. EX`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::Commands;

use super::tier::{CacheEntry, CacheTier};

pub struct RedisTier {
    client: redis::Client,
    key_prefix: String,
    connection: Arc<Mutex<Option<redis::Connection>>>,
}

impl RedisTier {
    pub fn new(url: &str, key_prefix: impl Into<String>) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
            connection: Arc::new(Mutex::new(None)),
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn run<T, F>(&self, op: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T> + Send + 'static,
    {
        let client = self.client.clone();
        let connection = self.connection.clone();
        tokio::task::spawn_blocking(move || {
            let mut slot = connection.lock();
            let mut conn = match slot.take() {
                Some(conn) => conn,
                None => client.get_connection()?,
            };
            let result = op(&mut conn);
            let broken = matches!(&result, Err(e) if e.is_connection_dropped() || e.is_io_error());
            if !broken {
                *slot = Some(conn);
            }
            result
        })
        .await?
        .map_err(anyhow::Error::from)
    }

    async fn keys(&self) -> anyhow::Result<Vec<String>> {
        let pattern = format!("{}*", self.key_prefix);
        self.run(move |conn| {
            let keys: Vec<String> = conn.scan_match::<_, String>(&pattern)?.collect();
            Ok(keys)
        })
        .await
    }
}

#[async_trait]
impl CacheTier for RedisTier {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn load(&self, key: &str) -> anyhow::Result<Option<CacheEntry>> {
        let redis_key = self.redis_key(key);
        let raw: Option<String> = self.run(move |conn| conn.get(redis_key)).await?;
        raw.map(|json| serde_json::from_str(&json).context("decoding cached entry"))
            .transpose()
    }

    async fn store(&self, entry: &CacheEntry, ttl: Duration) -> anyhow::Result<()> {
        let redis_key = self.redis_key(&entry.key);
        let json = serde_json::to_string(entry)?;
        let seconds = ttl.as_secs().max(1);
        self.run(move |conn| {
            redis::cmd("SET")
                .arg(redis_key)
                .arg(json)
                .arg("EX")
                .arg(seconds)
                .query::<()>(conn)
        })
        .await
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        let redis_key = self.redis_key(key);
        self.run(move |conn| conn.del::<_, ()>(redis_key)).await
    }

    async fn clear(&self) -> anyhow::Result<()> {
        let keys = self.keys().await?;
        if keys.is_empty() {
            return Ok(());
        }
        self.run(move |conn| conn.del::<_, ()>(keys)).await
    }

    async fn purge_expired(&self, _ttl: Duration) -> anyhow::Result<usize> {
        // Keys carry their own expiry.
        Ok(0)
    }

    async fn count(&self) -> anyhow::Result<usize> {
        Ok(self.keys().await?.len())
    }
}
