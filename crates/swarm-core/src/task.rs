//! Task lifecycle types and the transition table

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for an agent to pick the issue up
    Queued,
    /// Worker agent is drafting an implementation plan
    Planning,
    /// Plan posted, awaiting human approval
    PlanReview,
    /// Plan approved, execution not yet started
    Approved,
    /// Worker agent is implementing the plan
    Executing,
    /// Pull request opened for the change
    PrOpen,
    /// Reviewer agent is reviewing the PR
    PrAgentReview,
    /// Fixer agent is addressing review feedback
    PrAgentFix,
    /// Execution failed
    Failed,
    /// Fixer agent is triaging the failure
    FixerReview,
    /// Failure escalated to a human
    HumanEscalation,
    /// PR merged, task done
    Completed,
    /// Abandoned or closed without merge
    Archived,
    /// Product manager is drafting a vision
    PmVision,
    /// Vision posted, awaiting human approval
    PmVisionReview,
    /// Product manager is managing the backlog
    PmBacklog,
    /// Feature document posted, awaiting human feedback
    PmFeatureReview,
    /// Feature handed off to the planning flow
    PmHandoffPlanner,
}

impl TaskState {
    /// States this state may transition to
    #[must_use]
    pub fn valid_transitions(self) -> &'static [TaskState] {
        match self {
            Self::Queued => &[Self::Planning, Self::PmVision],
            Self::Planning => &[Self::PlanReview],
            // approve or revise
            Self::PlanReview => &[Self::Approved, Self::Planning],
            Self::Approved => &[Self::Executing],
            Self::Executing => &[Self::PrOpen, Self::Failed],
            Self::PrOpen => &[
                Self::PrAgentReview,
                Self::PrAgentFix,
                Self::Completed,
                Self::Archived,
            ],
            Self::PrAgentReview | Self::PrAgentFix => &[Self::PrOpen],
            Self::Failed => &[Self::FixerReview],
            Self::FixerReview => &[Self::Executing, Self::HumanEscalation],
            // retry or abandon
            Self::HumanEscalation => &[Self::Queued, Self::Archived],
            Self::Completed | Self::Archived => &[],
            Self::PmVision => &[Self::PmVisionReview],
            // revise or proceed
            Self::PmVisionReview => &[Self::PmVision, Self::PmBacklog],
            Self::PmBacklog => &[Self::PmFeatureReview, Self::PmVision],
            Self::PmFeatureReview => &[Self::PmBacklog, Self::PmHandoffPlanner],
            // connects to the issue flow
            Self::PmHandoffPlanner => &[Self::Planning],
        }
    }

    /// Check whether a transition to `next` is permitted
    #[must_use]
    pub fn can_transition_to(self, next: TaskState) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Check if this is a terminal state
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Archived)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Planning => "planning",
            Self::PlanReview => "plan_review",
            Self::Approved => "approved",
            Self::Executing => "executing",
            Self::PrOpen => "pr_open",
            Self::PrAgentReview => "pr_agent_review",
            Self::PrAgentFix => "pr_agent_fix",
            Self::Failed => "failed",
            Self::FixerReview => "fixer_review",
            Self::HumanEscalation => "human_escalation",
            Self::Completed => "completed",
            Self::Archived => "archived",
            Self::PmVision => "pm_vision",
            Self::PmVisionReview => "pm_vision_review",
            Self::PmBacklog => "pm_backlog",
            Self::PmFeatureReview => "pm_feature_review",
            Self::PmHandoffPlanner => "pm_handoff_planner",
        };
        write!(f, "{s}")
    }
}

impl TaskState {
    /// Every state, in table order
    pub const ALL: [TaskState; 18] = [
        Self::Queued,
        Self::Planning,
        Self::PlanReview,
        Self::Approved,
        Self::Executing,
        Self::PrOpen,
        Self::PrAgentReview,
        Self::PrAgentFix,
        Self::Failed,
        Self::FixerReview,
        Self::HumanEscalation,
        Self::Completed,
        Self::Archived,
        Self::PmVision,
        Self::PmVisionReview,
        Self::PmBacklog,
        Self::PmFeatureReview,
        Self::PmHandoffPlanner,
    ];
}

/// Record of a human decision on a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// When the decision was made
    pub timestamp: DateTime<Utc>,
    /// Decision tag, e.g. `plan_approval` or `pm_invoked`
    #[serde(rename = "type")]
    pub kind: String,
    /// GitHub username of the human
    pub human: String,
    /// What the human did
    pub action: String,
    /// Free-form comment text, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Structured context for the decision
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

/// Agent task - tracks an issue through its lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique id, `issue-<N>` within the repository
    pub id: String,
    /// Repository in `owner/name` form
    pub repo: String,
    /// Issue number the task tracks
    pub issue_number: u64,
    /// Issue title at creation time
    pub issue_title: String,
    /// Current lifecycle state
    pub state: TaskState,
    /// Working branch, once execution starts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Pull request number, once opened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,

    /// When the task was created
    pub created_at: DateTime<Utc>,
    /// Advances on every mutation
    pub updated_at: DateTime<Utc>,
    /// First entry into plan review
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_plan_at: Option<DateTime<Utc>>,
    /// When the plan was approved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    /// First time a PR was opened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_opened_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Plan payloads, oldest first
    #[serde(default)]
    pub plan_versions: Vec<Value>,
    /// Always equals `plan_versions.len()`
    #[serde(default)]
    pub current_plan_version: usize,

    /// Human decisions, append-only
    #[serde(default)]
    pub decisions: Vec<Decision>,

    /// Every agent invocation id that has touched the task
    #[serde(default)]
    pub agent_ids: Vec<String>,
    /// Invocation currently running, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_agent_id: Option<String>,

    /// Cumulative tokens per model
    #[serde(default)]
    pub token_usage: HashMap<String, u64>,
    /// Running cost estimate in USD
    #[serde(default)]
    pub estimated_cost_usd: f64,

    /// Paths the task holds locks on (informational; the registry is
    /// authoritative)
    #[serde(default)]
    pub locked_files: Vec<String>,

    /// Last agent error, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Number of recorded failures
    #[serde(default)]
    pub retry_count: u32,
}

impl Task {
    /// Create a new task in `Queued`
    #[must_use]
    pub fn new(repo: &str, issue_number: u64, issue_title: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("issue-{issue_number}"),
            repo: repo.to_string(),
            issue_number,
            issue_title: issue_title.to_string(),
            state: TaskState::Queued,
            branch: None,
            pr_number: None,
            created_at: now,
            updated_at: now,
            first_plan_at: None,
            approved_at: None,
            pr_opened_at: None,
            completed_at: None,
            plan_versions: Vec::new(),
            current_plan_version: 0,
            decisions: Vec::new(),
            agent_ids: Vec::new(),
            current_agent_id: None,
            token_usage: HashMap::new(),
            estimated_cost_usd: 0.0,
            locked_files: Vec::new(),
            last_error: None,
            retry_count: 0,
        }
    }

    /// Apply a validated state transition, updating timeline fields and
    /// folding in `update` side effects. Returns the prior state.
    ///
    /// Timeline fields are set-once; `updated_at` always advances.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the table does not permit the move,
    /// leaving the task unchanged.
    pub fn apply_transition(
        &mut self,
        next: TaskState,
        update: TransitionUpdate,
        now: DateTime<Utc>,
    ) -> Result<TaskState> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        let prior = self.state;
        self.state = next;
        self.updated_at = now;

        match next {
            TaskState::PlanReview => {
                self.first_plan_at.get_or_insert(now);
            }
            TaskState::Approved => {
                self.approved_at.get_or_insert(now);
            }
            TaskState::PrOpen => {
                self.pr_opened_at.get_or_insert(now);
            }
            s if s.is_terminal() => {
                self.completed_at.get_or_insert(now);
            }
            _ => {}
        }

        if let Some(plan) = update.plan {
            self.plan_versions.push(plan);
            self.current_plan_version = self.plan_versions.len();
        }
        if let Some(pr_number) = update.pr_number {
            self.pr_number = Some(pr_number);
        }
        if let Some(branch) = update.branch {
            self.branch = Some(branch);
        }
        if let Some(error) = update.error {
            self.last_error = Some(error);
            self.retry_count += 1;
        }

        Ok(prior)
    }

    /// Append a decision and bump `updated_at`
    pub fn record_decision(&mut self, decision: Decision, now: DateTime<Utc>) {
        self.decisions.push(decision);
        self.updated_at = now;
    }

    /// Fold agent token usage and cost into the task
    pub fn record_usage(
        &mut self,
        tokens: &HashMap<String, u64>,
        cost_usd: f64,
        now: DateTime<Utc>,
    ) {
        for (model, count) in tokens {
            *self.token_usage.entry(model.clone()).or_insert(0) += count;
        }
        self.estimated_cost_usd += cost_usd;
        self.updated_at = now;
    }
}

/// Side effects that may accompany a transition
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    /// Plan payload to append as a new version
    pub plan: Option<Value>,
    /// PR number to set
    pub pr_number: Option<u64>,
    /// Branch name to set
    pub branch: Option<String>,
    /// Error to record; also bumps `retry_count`
    pub error: Option<String>,
}

impl TransitionUpdate {
    /// Update carrying only a plan payload
    #[must_use]
    pub fn with_plan(plan: Value) -> Self {
        Self {
            plan: Some(plan),
            ..Self::default()
        }
    }

    /// Update carrying only an error
    #[must_use]
    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("owner/repo", 42, "Fix bug", Utc::now())
    }

    #[test]
    fn test_queued_transitions() {
        assert_eq!(
            TaskState::Queued.valid_transitions(),
            &[TaskState::Planning, TaskState::PmVision]
        );
    }

    #[test]
    fn test_plan_review_can_revise_or_approve() {
        let valid = TaskState::PlanReview.valid_transitions();
        assert!(valid.contains(&TaskState::Approved));
        assert!(valid.contains(&TaskState::Planning));
    }

    #[test]
    fn test_terminal_states_have_no_successors() {
        assert!(TaskState::Completed.valid_transitions().is_empty());
        assert!(TaskState::Archived.valid_transitions().is_empty());
        assert!(TaskState::Completed.is_terminal());
        assert!(!TaskState::PrOpen.is_terminal());
    }

    #[test]
    fn test_state_serde_matches_display() {
        for s in TaskState::ALL {
            let json = serde_json::to_string(&s).unwrap();
            assert_eq!(json.trim_matches('"'), s.to_string());
            let back: TaskState = serde_json::from_str(&json).unwrap();
            assert_eq!(back, s);
        }
    }

    #[test]
    fn test_new_task_is_queued() {
        let t = task();
        assert_eq!(t.id, "issue-42");
        assert_eq!(t.state, TaskState::Queued);
        assert!(t.decisions.is_empty());
        assert!(t.plan_versions.is_empty());
    }

    #[test]
    fn test_invalid_transition_leaves_task_unchanged() {
        let mut t = task();
        let before = t.updated_at;
        let err = t
            .apply_transition(TaskState::Approved, TransitionUpdate::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: TaskState::Queued,
                to: TaskState::Approved
            }
        ));
        assert_eq!(t.state, TaskState::Queued);
        assert_eq!(t.updated_at, before);
    }

    #[test]
    fn test_plan_payload_advances_version_cursor() {
        let mut t = task();
        t.apply_transition(TaskState::Planning, TransitionUpdate::default(), Utc::now())
            .unwrap();
        t.apply_transition(
            TaskState::PlanReview,
            TransitionUpdate::with_plan(serde_json::json!({"plan": "do the thing"})),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(t.plan_versions.len(), 1);
        assert_eq!(t.current_plan_version, 1);
        assert!(t.first_plan_at.is_some());
    }

    #[test]
    fn test_first_plan_at_is_set_once() {
        let mut t = task();
        t.apply_transition(TaskState::Planning, TransitionUpdate::default(), Utc::now())
            .unwrap();
        t.apply_transition(TaskState::PlanReview, TransitionUpdate::default(), Utc::now())
            .unwrap();
        let first = t.first_plan_at;
        t.apply_transition(TaskState::Planning, TransitionUpdate::default(), Utc::now())
            .unwrap();
        t.apply_transition(TaskState::PlanReview, TransitionUpdate::default(), Utc::now())
            .unwrap();
        assert_eq!(t.first_plan_at, first);
    }

    #[test]
    fn test_error_update_bumps_retry_count() {
        let mut t = task();
        t.apply_transition(TaskState::Planning, TransitionUpdate::default(), Utc::now())
            .unwrap();
        t.apply_transition(TaskState::PlanReview, TransitionUpdate::default(), Utc::now())
            .unwrap();
        t.apply_transition(TaskState::Approved, TransitionUpdate::default(), Utc::now())
            .unwrap();
        t.apply_transition(TaskState::Executing, TransitionUpdate::default(), Utc::now())
            .unwrap();
        t.apply_transition(
            TaskState::Failed,
            TransitionUpdate::with_error("sandbox exploded"),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(t.retry_count, 1);
        assert_eq!(t.last_error.as_deref(), Some("sandbox exploded"));
    }

    #[test]
    fn test_decision_recording() {
        let mut t = task();
        let now = Utc::now();
        t.record_decision(
            Decision {
                timestamp: now,
                kind: "plan_approval".to_string(),
                human: "alice".to_string(),
                action: "approved".to_string(),
                comment: Some("LGTM".to_string()),
                metadata: serde_json::Map::new(),
            },
            now,
        );
        assert_eq!(t.decisions.len(), 1);
        assert_eq!(t.decisions[0].human, "alice");
    }

    #[test]
    fn test_usage_accumulates_per_model() {
        let mut t = task();
        let mut tokens = HashMap::new();
        tokens.insert("haiku".to_string(), 100);
        t.record_usage(&tokens, 0.01, Utc::now());
        t.record_usage(&tokens, 0.01, Utc::now());
        assert_eq!(t.token_usage.get("haiku"), Some(&200));
    }

    #[test]
    fn test_task_serde_round_trip() {
        let mut t = task();
        t.apply_transition(TaskState::Planning, TransitionUpdate::default(), Utc::now())
            .unwrap();
        let json = serde_json::to_string(&t).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state, TaskState::Planning);
        assert_eq!(back.id, t.id);
    }
}
