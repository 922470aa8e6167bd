//! File coordination - locks and conflict detection
//!
//! Locks live in the store as `lock:<repo>:<path>` -> holder task id, with a
//! TTL so a stuck agent is reclaimed without intervention. Acquisition is
//! check-then-write and not atomic across paths; callers treat a conflict
//! discovered mid-work as a failure and release what they hold.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use swarm_core::{LockResult, Result};

use crate::store::Store;

fn lock_key(repo: &str, path: &str) -> String {
    format!("lock:{repo}:{path}")
}

fn lock_prefix(repo: &str) -> String {
    format!("lock:{repo}:")
}

/// Coordinates file access across agents
pub struct FileLockRegistry {
    store: Arc<dyn Store>,
    default_ttl_seconds: u64,
}

impl FileLockRegistry {
    /// Create a registry with the configured default TTL
    pub fn new(store: Arc<dyn Store>, default_ttl_seconds: u64) -> Self {
        Self {
            store,
            default_ttl_seconds,
        }
    }

    /// Check whether any of `paths` is held by a live lock. Returns the
    /// first conflict found, in no particular path order.
    pub async fn check_conflicts(&self, repo: &str, paths: &[String]) -> Result<LockResult> {
        for path in paths {
            if let Some(holder) = self.store.get(&lock_key(repo, path)).await? {
                return Ok(LockResult::conflict(holder, path.clone()));
            }
        }
        Ok(LockResult::acquired())
    }

    /// Acquire locks on every path for `task_id`.
    ///
    /// Conflict checking happens first; if it passes, all entries are
    /// written in one best-effort batch. A concurrent acquirer can still
    /// interleave between check and write.
    pub async fn acquire(
        &self,
        task_id: &str,
        repo: &str,
        paths: &[String],
        ttl_seconds: Option<u64>,
    ) -> Result<LockResult> {
        let conflict = self.check_conflicts(repo, paths).await?;
        if !conflict.acquired {
            return Ok(conflict);
        }

        let ttl = ttl_seconds.unwrap_or(self.default_ttl_seconds);
        let entries: Vec<(String, String)> = paths
            .iter()
            .map(|path| (lock_key(repo, path), task_id.to_string()))
            .collect();
        self.store.setex_many(&entries, ttl).await?;

        tracing::info!(task_id, repo, count = paths.len(), "acquired file locks");
        Ok(LockResult::acquired())
    }

    /// Release every lock in `repo` held by `task_id`. Returns the number
    /// released. Locks held by other tasks are untouched; releasing twice
    /// is harmless.
    pub async fn release(&self, task_id: &str, repo: &str) -> Result<usize> {
        let mut released = 0;
        for key in self.owned_keys(task_id, repo).await? {
            self.store.del(&key).await?;
            released += 1;
        }
        if released > 0 {
            tracing::info!(task_id, repo, count = released, "released file locks");
        }
        Ok(released)
    }

    /// Refresh the TTL on every lock in `repo` held by `task_id`. Returns
    /// the number extended.
    pub async fn extend(
        &self,
        task_id: &str,
        repo: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<usize> {
        let ttl = ttl_seconds.unwrap_or(self.default_ttl_seconds);
        let mut extended = 0;
        for key in self.owned_keys(task_id, repo).await? {
            self.store.expire(&key, ttl).await?;
            extended += 1;
        }
        Ok(extended)
    }

    /// Diagnostic read: every locked path in `repo` with its holder
    pub async fn list(&self, repo: &str) -> Result<HashMap<String, String>> {
        let prefix = lock_prefix(repo);
        let mut locks = HashMap::new();
        for key in self.store.scan(&prefix).await? {
            if let Some(holder) = self.store.get(&key).await? {
                let path = key[prefix.len()..].to_string();
                locks.insert(path, holder);
            }
        }
        Ok(locks)
    }

    // scan may duplicate keys under concurrent mutation; the set dedups
    async fn owned_keys(&self, task_id: &str, repo: &str) -> Result<HashSet<String>> {
        let mut owned = HashSet::new();
        for key in self.store.scan(&lock_prefix(repo)).await? {
            if let Some(holder) = self.store.get(&key).await? {
                if holder == task_id {
                    owned.insert(key);
                }
            }
        }
        Ok(owned)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry() -> FileLockRegistry {
        FileLockRegistry::new(Arc::new(MemoryStore::new()), 1800)
    }

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_acquire_then_conflict() {
        let locks = registry();
        let p = paths(&["src/x.go"]);

        let first = locks.acquire("issue-1", "owner/repo", &p, None).await.unwrap();
        assert!(first.acquired);

        let second = locks.acquire("issue-2", "owner/repo", &p, None).await.unwrap();
        assert!(!second.acquired);
        assert_eq!(second.conflicting_task.as_deref(), Some("issue-1"));
        assert_eq!(second.conflicting_file.as_deref(), Some("src/x.go"));
    }

    #[tokio::test]
    async fn test_release_frees_only_own_locks() {
        let locks = registry();
        locks
            .acquire("issue-1", "owner/repo", &paths(&["a.rs", "b.rs"]), None)
            .await
            .unwrap();
        locks
            .acquire("issue-2", "owner/repo", &paths(&["c.rs"]), None)
            .await
            .unwrap();

        let released = locks.release("issue-1", "owner/repo").await.unwrap();
        assert_eq!(released, 2);

        let remaining = locks.list("owner/repo").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining.get("c.rs").map(String::as_str), Some("issue-2"));

        // idempotent
        assert_eq!(locks.release("issue-1", "owner/repo").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_acquire_succeeds_after_release() {
        let locks = registry();
        let p = paths(&["src/x.go"]);
        locks.acquire("issue-1", "owner/repo", &p, None).await.unwrap();
        locks.release("issue-1", "owner/repo").await.unwrap();
        let result = locks.acquire("issue-2", "owner/repo", &p, None).await.unwrap();
        assert!(result.acquired);
    }

    #[tokio::test]
    async fn test_expired_locks_are_reclaimable() {
        let locks = registry();
        let p = paths(&["src/x.go"]);
        locks
            .acquire("issue-1", "owner/repo", &p, Some(0))
            .await
            .unwrap();
        let result = locks.check_conflicts("owner/repo", &p).await.unwrap();
        assert!(result.acquired);
    }

    #[tokio::test]
    async fn test_locks_are_scoped_per_repo() {
        let locks = registry();
        let p = paths(&["src/x.go"]);
        locks.acquire("issue-1", "owner/alpha", &p, None).await.unwrap();
        let result = locks.check_conflicts("owner/beta", &p).await.unwrap();
        assert!(result.acquired);
        assert_eq!(locks.release("issue-1", "owner/beta").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_extend_refreshes_own_locks() {
        let locks = registry();
        locks
            .acquire("issue-1", "owner/repo", &paths(&["a.rs"]), None)
            .await
            .unwrap();
        let extended = locks.extend("issue-1", "owner/repo", Some(60)).await.unwrap();
        assert_eq!(extended, 1);
        assert_eq!(locks.extend("issue-9", "owner/repo", None).await.unwrap(), 0);
    }
}
