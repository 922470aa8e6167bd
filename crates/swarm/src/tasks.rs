//! Task persistence
//!
//! Layout: `task:<id>` holds the JSON-serialized task; `tasks:active` and
//! `tasks:archived` partition the ids. A task is in exactly one of the two
//! sets, switching on its terminal transition.

use std::sync::Arc;

use swarm_core::{Error, Result, Task};

use crate::store::Store;

/// Set of non-terminal task ids
pub const ACTIVE_SET: &str = "tasks:active";
/// Set of terminal task ids
pub const ARCHIVED_SET: &str = "tasks:archived";

fn task_key(id: &str) -> String {
    format!("task:{id}")
}

/// Serialize/load tasks and maintain set membership
pub struct TaskStore {
    store: Arc<dyn Store>,
}

impl TaskStore {
    /// Create a task store over the given backend
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Load a task by id
    pub async fn load(&self, id: &str) -> Result<Option<Task>> {
        match self.store.get(&task_key(id)).await? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| Error::StoreUnavailable(format!("corrupt task record {id}: {e}"))),
            None => Ok(None),
        }
    }

    /// Write a task record
    pub async fn save(&self, task: &Task) -> Result<()> {
        let json = serde_json::to_string(task)
            .map_err(|e| Error::StoreUnavailable(format!("unserializable task {}: {e}", task.id)))?;
        self.store.set(&task_key(&task.id), &json).await
    }

    /// Write a new task and add it to the active set
    pub async fn insert_active(&self, task: &Task) -> Result<()> {
        self.save(task).await?;
        self.store.sadd(ACTIVE_SET, &task.id).await
    }

    /// Move an id from the active set to the archived set.
    ///
    /// Idempotent, so a crash between the task write and this move is
    /// recovered by replaying the terminal transition.
    pub async fn archive(&self, id: &str) -> Result<()> {
        self.store.srem(ACTIVE_SET, id).await?;
        self.store.sadd(ARCHIVED_SET, id).await
    }

    /// Load every active task, most recently updated first. Ids whose
    /// record has vanished are skipped.
    pub async fn list_active(&self) -> Result<Vec<Task>> {
        let ids = self.store.smembers(ACTIVE_SET).await?;
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = self.load(&id).await? {
                tasks.push(task);
            }
        }
        tasks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(tasks)
    }

    /// Check membership in the active set
    pub async fn is_active(&self, id: &str) -> Result<bool> {
        Ok(self
            .store
            .smembers(ACTIVE_SET)
            .await?
            .iter()
            .any(|member| member == id))
    }

    /// Check membership in the archived set
    pub async fn is_archived(&self, id: &str) -> Result<bool> {
        Ok(self
            .store
            .smembers(ARCHIVED_SET)
            .await?
            .iter()
            .any(|member| member == id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::store::MemoryStore;

    fn task_store() -> TaskStore {
        TaskStore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_round_trip() {
        let store = task_store();
        let task = Task::new("owner/repo", 42, "Fix bug", Utc::now());
        store.insert_active(&task).await.unwrap();

        let loaded = store.load("issue-42").await.unwrap().unwrap();
        assert_eq!(loaded.issue_title, "Fix bug");
        assert!(store.is_active("issue-42").await.unwrap());
        assert!(!store.is_archived("issue-42").await.unwrap());
    }

    #[tokio::test]
    async fn test_archive_moves_between_sets() {
        let store = task_store();
        let task = Task::new("owner/repo", 1, "t", Utc::now());
        store.insert_active(&task).await.unwrap();

        store.archive("issue-1").await.unwrap();
        assert!(!store.is_active("issue-1").await.unwrap());
        assert!(store.is_archived("issue-1").await.unwrap());

        // replaying the move is harmless
        store.archive("issue-1").await.unwrap();
        assert!(store.is_archived("issue-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_active_sorts_newest_first() {
        let store = task_store();
        let mut older = Task::new("owner/repo", 1, "old", Utc::now());
        older.updated_at = Utc::now() - chrono::Duration::minutes(5);
        let newer = Task::new("owner/repo", 2, "new", Utc::now());
        store.insert_active(&older).await.unwrap();
        store.insert_active(&newer).await.unwrap();

        let tasks = store.list_active().await.unwrap();
        assert_eq!(tasks[0].id, "issue-2");
        assert_eq!(tasks[1].id, "issue-1");
    }
}
