//! Task state machine
//!
//! Every read-decide-write span runs under a per-task lease so concurrent
//! webhook deliveries for the same task serialize instead of losing updates.
//! The store offers no transactional read-modify-write, so the lease is a
//! hard requirement, not an optimization.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use swarm_core::{Decision, Error, Result, Task, TaskState, TransitionUpdate};
use tokio::sync::Mutex;

use crate::store::Store;
use crate::tasks::TaskStore;

/// Manages task state transitions and persistence
pub struct StateMachine {
    tasks: TaskStore,
    leases: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StateMachine {
    /// Create a state machine over the given store backend
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            tasks: TaskStore::new(store),
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying task store
    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    async fn lease(&self, id: &str) -> Arc<Mutex<()>> {
        let mut leases = self.leases.lock().await;
        leases.entry(id.to_string()).or_default().clone()
    }

    /// Create a new task in `Queued` and add it to the active set.
    ///
    /// # Errors
    ///
    /// `DuplicateTask` if a task already exists for the issue.
    pub async fn create_task(
        &self,
        repo: &str,
        issue_number: u64,
        issue_title: &str,
    ) -> Result<Task> {
        let id = format!("issue-{issue_number}");
        let lease = self.lease(&id).await;
        let _guard = lease.lock().await;

        if self.tasks.load(&id).await?.is_some() {
            return Err(Error::DuplicateTask {
                repo: repo.to_string(),
                issue_number,
            });
        }

        let task = Task::new(repo, issue_number, issue_title, Utc::now());
        self.tasks.insert_active(&task).await?;
        tracing::info!(task_id = %task.id, issue = issue_number, "created task");
        Ok(task)
    }

    /// Get a task by id
    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.tasks.load(id).await
    }

    /// Get the task tracking an issue, if one exists. Task ids are derived
    /// from issue numbers, but callers should treat that as an internal
    /// detail of this lookup.
    pub async fn get_task_for_issue(&self, repo: &str, issue_number: u64) -> Result<Option<Task>> {
        let task = self.tasks.load(&format!("issue-{issue_number}")).await?;
        Ok(task.filter(|t| t.repo == repo))
    }

    /// Transition a task to a new state, applying `update` side effects.
    ///
    /// Re-applying a transition whose target the task already occupies is a
    /// no-op success, which keeps replayed webhooks harmless. Terminal
    /// transitions move the id to the archived set after the task write;
    /// a crash between the two is recovered by the same replay property.
    ///
    /// # Errors
    ///
    /// `TaskNotFound`, `InvalidTransition`, or `StoreUnavailable`.
    pub async fn transition(
        &self,
        id: &str,
        new_state: TaskState,
        update: TransitionUpdate,
    ) -> Result<Task> {
        let lease = self.lease(id).await;
        let _guard = lease.lock().await;

        let mut task = self
            .tasks
            .load(id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;

        if task.state == new_state {
            tracing::debug!(task_id = id, state = %new_state, "transition replay, no-op");
            return Ok(task);
        }

        let from = task.apply_transition(new_state, update, Utc::now())?;
        self.tasks.save(&task).await?;
        if new_state.is_terminal() {
            self.tasks.archive(id).await?;
        }

        tracing::info!(task_id = id, %from, to = %new_state, "task transition");
        Ok(task)
    }

    /// Append a decision to a task. Does not change state.
    pub async fn record_decision(
        &self,
        id: &str,
        kind: &str,
        human: &str,
        action: &str,
        comment: Option<String>,
        metadata: serde_json::Map<String, Value>,
    ) -> Result<Task> {
        let lease = self.lease(id).await;
        let _guard = lease.lock().await;

        let mut task = self
            .tasks
            .load(id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;

        let now = Utc::now();
        task.record_decision(
            Decision {
                timestamp: now,
                kind: kind.to_string(),
                human: human.to_string(),
                action: action.to_string(),
                comment,
                metadata,
            },
            now,
        );
        self.tasks.save(&task).await?;

        tracing::info!(task_id = id, kind, human, "recorded decision");
        Ok(task)
    }

    /// Fold an agent invocation's token usage and cost into the task
    pub async fn record_usage(
        &self,
        id: &str,
        tokens: &HashMap<String, u64>,
        cost_usd: f64,
    ) -> Result<Task> {
        let lease = self.lease(id).await;
        let _guard = lease.lock().await;

        let mut task = self
            .tasks
            .load(id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        task.record_usage(tokens, cost_usd, Utc::now());
        self.tasks.save(&task).await?;
        Ok(task)
    }

    /// Record the start of an agent invocation on the task
    pub async fn record_agent_start(&self, id: &str, agent_id: &str) -> Result<Task> {
        let lease = self.lease(id).await;
        let _guard = lease.lock().await;

        let mut task = self
            .tasks
            .load(id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        task.agent_ids.push(agent_id.to_string());
        task.current_agent_id = Some(agent_id.to_string());
        task.updated_at = Utc::now();
        self.tasks.save(&task).await?;
        Ok(task)
    }

    /// Clear the task's current agent marker
    pub async fn record_agent_done(&self, id: &str) -> Result<Task> {
        let lease = self.lease(id).await;
        let _guard = lease.lock().await;

        let mut task = self
            .tasks
            .load(id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        task.current_agent_id = None;
        task.updated_at = Utc::now();
        self.tasks.save(&task).await?;
        Ok(task)
    }

    /// Record an agent failure without changing state: sets `last_error`
    /// and bumps `retry_count`. Used when the failure did not occur in
    /// `Executing`, where no transition applies.
    pub async fn record_failure(&self, id: &str, error: &str) -> Result<Task> {
        let lease = self.lease(id).await;
        let _guard = lease.lock().await;

        let mut task = self
            .tasks
            .load(id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        task.last_error = Some(error.to_string());
        task.retry_count += 1;
        task.updated_at = Utc::now();
        self.tasks.save(&task).await?;

        tracing::warn!(task_id = id, error, "recorded agent failure");
        Ok(task)
    }

    /// Update the informational list of paths the task holds locks on.
    /// The lock registry stays authoritative.
    pub async fn set_locked_files(&self, id: &str, files: Vec<String>) -> Result<Task> {
        let lease = self.lease(id).await;
        let _guard = lease.lock().await;

        let mut task = self
            .tasks
            .load(id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        task.locked_files = files;
        task.updated_at = Utc::now();
        self.tasks.save(&task).await?;
        Ok(task)
    }

    /// Every active task, newest update first
    pub async fn list_active_tasks(&self) -> Result<Vec<Task>> {
        self.tasks.list_active().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn machine() -> StateMachine {
        StateMachine::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_create_task_rejects_duplicates() {
        let sm = machine();
        sm.create_task("owner/repo", 42, "t").await.unwrap();
        let err = sm.create_task("owner/repo", 42, "t").await.unwrap_err();
        assert!(matches!(err, Error::DuplicateTask { .. }));
    }

    #[tokio::test]
    async fn test_get_task_for_issue_checks_repo() {
        let sm = machine();
        sm.create_task("owner/repo", 42, "t").await.unwrap();
        assert!(sm
            .get_task_for_issue("owner/repo", 42)
            .await
            .unwrap()
            .is_some());
        assert!(sm
            .get_task_for_issue("other/repo", 42)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_invalid_transition_is_rejected() {
        let sm = machine();
        sm.create_task("owner/repo", 1, "t").await.unwrap();
        let err = sm
            .transition("issue-1", TaskState::Executing, TransitionUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        let task = sm.get_task("issue-1").await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Queued);
    }

    #[tokio::test]
    async fn test_transition_to_current_state_is_noop() {
        let sm = machine();
        sm.create_task("owner/repo", 1, "t").await.unwrap();
        sm.transition("issue-1", TaskState::Planning, TransitionUpdate::default())
            .await
            .unwrap();
        // replaying the same transition neither errors nor double-applies
        let task = sm
            .transition("issue-1", TaskState::Planning, TransitionUpdate::default())
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Planning);
    }

    #[tokio::test]
    async fn test_terminal_transition_moves_set_membership() {
        let sm = machine();
        sm.create_task("owner/repo", 1, "t").await.unwrap();
        for state in [
            TaskState::Planning,
            TaskState::PlanReview,
            TaskState::Approved,
            TaskState::Executing,
            TaskState::PrOpen,
            TaskState::Completed,
        ] {
            sm.transition("issue-1", state, TransitionUpdate::default())
                .await
                .unwrap();
        }
        assert!(!sm.tasks().is_active("issue-1").await.unwrap());
        assert!(sm.tasks().is_archived("issue-1").await.unwrap());
        let task = sm.get_task("issue-1").await.unwrap().unwrap();
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_record_decision_leaves_state_alone() {
        let sm = machine();
        sm.create_task("owner/repo", 1, "t").await.unwrap();
        let task = sm
            .record_decision(
                "issue-1",
                "planner_requested",
                "alice",
                "planner_invoked",
                None,
                serde_json::Map::new(),
            )
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.decisions.len(), 1);
    }

    #[tokio::test]
    async fn test_record_usage_accumulates() {
        let sm = machine();
        sm.create_task("owner/repo", 1, "t").await.unwrap();
        let mut tokens = HashMap::new();
        tokens.insert("model-a".to_string(), 50u64);
        sm.record_usage("issue-1", &tokens, 0.5).await.unwrap();
        let task = sm.record_usage("issue-1", &tokens, 0.25).await.unwrap();
        assert_eq!(task.token_usage.get("model-a"), Some(&100));
        assert!((task.estimated_cost_usd - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_agent_bookkeeping() {
        let sm = machine();
        sm.create_task("owner/repo", 1, "t").await.unwrap();
        let task = sm.record_agent_start("issue-1", "worker-abc").await.unwrap();
        assert_eq!(task.current_agent_id.as_deref(), Some("worker-abc"));
        let task = sm.record_agent_done("issue-1").await.unwrap();
        assert!(task.current_agent_id.is_none());
        assert_eq!(task.agent_ids, vec!["worker-abc".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_decisions_are_not_lost() {
        let sm = Arc::new(machine());
        sm.create_task("owner/repo", 1, "t").await.unwrap();
        let mut handles = Vec::new();
        for i in 0..8 {
            let sm = sm.clone();
            handles.push(tokio::spawn(async move {
                sm.record_decision(
                    "issue-1",
                    "prioritization",
                    &format!("human-{i}"),
                    "reprioritized",
                    None,
                    serde_json::Map::new(),
                )
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let task = sm.get_task("issue-1").await.unwrap().unwrap();
        assert_eq!(task.decisions.len(), 8);
    }
}
