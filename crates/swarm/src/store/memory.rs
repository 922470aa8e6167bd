//! In-process store backend
//!
//! Backs every test and doubles as a single-node fallback. Expired entries
//! are reclaimed lazily on read, so an expired key is indistinguishable from
//! an absent one.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use swarm_core::Result;
use tokio::sync::Mutex;

use super::Store;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Debug, Default)]
struct Inner {
    kv: HashMap<String, Entry>,
    sets: HashMap<String, HashSet<String>>,
}

/// Thread-safe in-memory store with per-key expiry
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        match inner.kv.get(key) {
            Some(entry) if entry.is_expired() => {
                inner.kv.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.kv.remove(key);
        Ok(())
    }

    async fn setex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let expired = inner.kv.get(key).is_some_and(Entry::is_expired);
        if expired {
            inner.kv.remove(key);
            return Ok(());
        }
        if let Some(entry) = inner.kv.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_seconds));
        }
        Ok(())
    }

    async fn sadd(&self, set: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, set: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(members) = inner.sets.get_mut(set) {
            members.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, set: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        inner.kv.retain(|_, entry| !entry.is_expired());
        Ok(inner
            .kv
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn setex_many(&self, entries: &[(String, String)], ttl_seconds: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let expires_at = Some(Instant::now() + Duration::from_secs(ttl_seconds));
        for (key, value) in entries {
            inner.kv.insert(
                key.clone(),
                Entry {
                    value: value.clone(),
                    expires_at,
                },
            );
        }
        Ok(())
    }
}
