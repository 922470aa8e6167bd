//! Redis store backend
//!
//! Connects lazily on first use. The connection manager reconnects on its
//! own, so a handle is created once and cloned per call.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use swarm_core::{Error, Result};
use tokio::sync::OnceCell;

use super::Store;

/// Store backed by a redis server
pub struct RedisStore {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
}

impl RedisStore {
    /// Create a store for the given connection URL. Does not connect yet.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the URL cannot be parsed.
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(to_store_err)?;
        Ok(Self {
            client,
            manager: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await
            .map_err(to_store_err)?;
        Ok(manager.clone())
    }
}

fn to_store_err(err: redis::RedisError) -> Error {
    Error::StoreUnavailable(err.to_string())
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        conn.get(key).await.map_err(to_store_err)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let () = conn.set(key, value).await.map_err(to_store_err)?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let () = conn.del(key).await.map_err(to_store_err)?;
        Ok(())
    }

    async fn setex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.connection().await?;
        let () = conn
            .set_ex(key, value, ttl_seconds)
            .await
            .map_err(to_store_err)?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.connection().await?;
        let ttl = i64::try_from(ttl_seconds).unwrap_or(i64::MAX);
        let _: i64 = conn.expire(key, ttl).await.map_err(to_store_err)?;
        Ok(())
    }

    async fn sadd(&self, set: &str, member: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let () = conn.sadd(set, member).await.map_err(to_store_err)?;
        Ok(())
    }

    async fn srem(&self, set: &str, member: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let () = conn.srem(set, member).await.map_err(to_store_err)?;
        Ok(())
    }

    async fn smembers(&self, set: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        conn.smembers(set).await.map_err(to_store_err)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .query_async(&mut conn)
                .await
                .map_err(to_store_err)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn setex_many(&self, entries: &[(String, String)], ttl_seconds: u64) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        for (key, value) in entries {
            pipe.set_ex(key, value, ttl_seconds).ignore();
        }
        let () = pipe.query_async(&mut conn).await.map_err(to_store_err)?;
        Ok(())
    }
}
