//! Persistence store abstraction
//!
//! A deliberately dumb key-value surface: string values, TTLs, sets, and a
//! prefix scan. All domain logic lives above it, so the in-memory backend and
//! the redis backend are interchangeable.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use swarm_core::Result;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Key-value store contract the coordination core depends on
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a key
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a key without expiry
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key; no-op when absent
    async fn del(&self, key: &str) -> Result<()>;

    /// Write a key with a TTL
    async fn setex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()>;

    /// Reset the TTL on an existing key; no-op when absent
    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<()>;

    /// Add a member to a set
    async fn sadd(&self, set: &str, member: &str) -> Result<()>;

    /// Remove a member from a set
    async fn srem(&self, set: &str, member: &str) -> Result<()>;

    /// Read every member of a set
    async fn smembers(&self, set: &str) -> Result<Vec<String>>;

    /// Yield keys under a prefix. Unordered, and concurrent mutation may
    /// produce duplicates; callers must tolerate both.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>>;

    /// Batch of independent `setex` writes. Best effort only: the batch is
    /// not cross-key atomic and callers must tolerate partial application.
    async fn setex_many(&self, entries: &[(String, String)], ttl_seconds: u64) -> Result<()>;
}
