//! Task router - webhook events to task actions
//!
//! Handlers mutate the store inline so webhook responses stay fast and
//! replayable, and return the agent work they triggered as [`Followup`]
//! values. The HTTP layer spawns those; tests run them to completion.
//! Concurrent agent executions are capped by the `max_concurrent_agents`
//! semaphore. Precondition misses (no task, wrong state) log and skip so the
//! platform never sees an error for them.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use swarm_core::{
    parse_commands, Command, Error, PmMode, Result, Task, TaskState, TransitionUpdate,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::agents::{
    estimate_cost_usd, Agent, AgentContext, AgentResult, FixerAgent, PlannerAgent,
    ProductManagerAgent, ReviewerAgent, WorkerAgent,
};
use crate::cancel::CancelRegistry;
use crate::config::Settings;
use crate::coordination::FileLockRegistry;
use crate::github::CodeHost;
use crate::llm::LlmClient;
use crate::state_machine::StateMachine;

/// Labels that opt an issue into agent handling
pub const AGENT_LABELS: &[&str] = &["agent-ok", "good-first-issue"];

/// Normalized GitHub webhook payload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    /// Event action, e.g. `opened` or `created`
    #[serde(default)]
    pub action: Option<String>,
    /// Repository the event belongs to
    #[serde(default)]
    pub repository: Option<Repository>,
    /// Issue payload, for issue and comment events
    #[serde(default)]
    pub issue: Option<Issue>,
    /// Pull request payload
    #[serde(default)]
    pub pull_request: Option<PullRequest>,
    /// Comment payload
    #[serde(default)]
    pub comment: Option<Comment>,
}

impl WebhookPayload {
    fn repo_name(&self) -> Option<&str> {
        self.repository.as_ref().map(|r| r.full_name.as_str())
    }
}

/// Repository identification
#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    /// `owner/name`
    pub full_name: String,
}

/// Comment author
#[derive(Debug, Clone, Deserialize)]
pub struct User {
    /// GitHub username
    pub login: String,
}

/// Issue label
#[derive(Debug, Clone, Deserialize)]
pub struct IssueLabel {
    /// Label name
    pub name: String,
}

/// Issue payload
#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    /// Issue number
    pub number: u64,
    /// Title, when present
    #[serde(default)]
    pub title: Option<String>,
    /// Body, when present
    #[serde(default)]
    pub body: Option<String>,
    /// Current labels
    #[serde(default)]
    pub labels: Vec<IssueLabel>,
}

/// Comment payload
#[derive(Debug, Clone, Deserialize)]
pub struct Comment {
    /// Comment text
    pub body: String,
    /// Author
    pub user: User,
}

/// Pull request payload
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    /// Set on `closed` events when the PR merged
    #[serde(default)]
    pub merged: Option<bool>,
    /// Head branch info
    pub head: Head,
}

/// PR head branch
#[derive(Debug, Clone, Deserialize)]
pub struct Head {
    /// Branch name
    #[serde(rename = "ref")]
    pub branch: String,
}

/// Agent work triggered by an event. The webhook handler spawns these so
/// the HTTP response never waits on an LLM; tests await them directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Followup {
    /// Plan the issue with the worker agent
    Planning {
        /// Target task
        task_id: String,
        /// Issue body for plan context
        issue_body: String,
    },
    /// Implement the latest approved plan
    Execution {
        /// Target task
        task_id: String,
    },
    /// Review the task's PR
    Review {
        /// Target task
        task_id: String,
        /// Human-requested focus areas
        focus: String,
    },
    /// Address review feedback on the task's PR
    Fix {
        /// Target task
        task_id: String,
        /// Review comments to address
        instructions: String,
    },
    /// Break a feature down into sub-issues
    Breakdown {
        /// Target task
        task_id: String,
        /// Feature description
        issue_body: String,
    },
    /// Run a product-manager pass
    ProductPass {
        /// Target task
        task_id: String,
        /// Requested mode
        mode: PmMode,
        /// Request context
        issue_body: String,
    },
}

/// Routes GitHub events to task actions
#[derive(Clone)]
pub struct TaskRouter {
    settings: Arc<Settings>,
    state: Arc<StateMachine>,
    locks: Arc<FileLockRegistry>,
    host: Arc<dyn CodeHost>,
    llm: Arc<dyn LlmClient>,
    cancels: CancelRegistry,
    agent_slots: Arc<Semaphore>,
}

impl TaskRouter {
    /// Wire up a router over its collaborators
    pub fn new(
        settings: Arc<Settings>,
        state: Arc<StateMachine>,
        locks: Arc<FileLockRegistry>,
        host: Arc<dyn CodeHost>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        let agent_slots = Arc::new(Semaphore::new(settings.max_concurrent_agents));
        Self {
            settings,
            state,
            locks,
            host,
            llm,
            cancels: CancelRegistry::new(),
            agent_slots,
        }
    }

    /// The cancellation registry, for inspection
    #[must_use]
    pub fn cancels(&self) -> &CancelRegistry {
        &self.cancels
    }

    /// Dispatch an event by webhook kind. Unknown kinds are ignored.
    pub async fn handle_event(&self, kind: &str, payload: &WebhookPayload) -> Result<Vec<Followup>> {
        match kind {
            "issues" => self.handle_issue_event(payload).await,
            "issue_comment" => self.handle_comment_event(payload).await,
            "pull_request" => self.handle_pr_event(payload).await,
            "check_run" => {
                Self::handle_check_run_event(payload);
                Ok(Vec::new())
            }
            other => {
                tracing::debug!(kind = other, "ignoring event");
                Ok(Vec::new())
            }
        }
    }

    /// Spawn a followup in the background, logging any failure
    pub fn spawn_followup(&self, followup: Followup) {
        let router = self.clone();
        tokio::spawn(async move {
            if let Err(e) = router.run_followup(followup.clone()).await {
                tracing::error!(?followup, error = %e, "followup failed");
            }
        });
    }

    /// Run a followup to completion
    pub async fn run_followup(&self, followup: Followup) -> Result<()> {
        match followup {
            Followup::Planning {
                task_id,
                issue_body,
            } => self.run_planning(&task_id, &issue_body).await,
            Followup::Execution { task_id } => self.run_execution(&task_id).await,
            Followup::Review { task_id, focus } => self.run_review(&task_id, &focus).await,
            Followup::Fix {
                task_id,
                instructions,
            } => self.run_fix(&task_id, &instructions).await,
            Followup::Breakdown {
                task_id,
                issue_body,
            } => self.run_breakdown(&task_id, &issue_body).await,
            Followup::ProductPass {
                task_id,
                mode,
                issue_body,
            } => self.run_product_pass(&task_id, mode, &issue_body).await,
        }
    }

    /// Handle issue opened/labeled events
    pub async fn handle_issue_event(&self, payload: &WebhookPayload) -> Result<Vec<Followup>> {
        if !matches!(payload.action.as_deref(), Some("opened" | "labeled")) {
            return Ok(Vec::new());
        }
        let (Some(repo), Some(issue)) = (payload.repo_name(), payload.issue.as_ref()) else {
            return Ok(Vec::new());
        };

        let labels: HashSet<&str> = issue.labels.iter().map(|l| l.name.as_str()).collect();
        if !AGENT_LABELS.iter().any(|l| labels.contains(l)) {
            tracing::debug!(issue = issue.number, "issue missing agent label");
            return Ok(Vec::new());
        }

        if self
            .state
            .get_task_for_issue(repo, issue.number)
            .await?
            .is_some()
        {
            tracing::debug!(issue = issue.number, "task already exists");
            return Ok(Vec::new());
        }

        let title = issue.title.as_deref().unwrap_or_default();
        let Some(task) = swallow(
            self.state.create_task(repo, issue.number, title).await,
            "create task from issue",
        )?
        else {
            return Ok(Vec::new());
        };

        tracing::info!(task_id = %task.id, issue = issue.number, "created task from issue");
        Ok(vec![Followup::Planning {
            task_id: task.id,
            issue_body: issue.body.clone().unwrap_or_default(),
        }])
    }

    /// Handle issue/PR comments carrying slash-commands
    pub async fn handle_comment_event(&self, payload: &WebhookPayload) -> Result<Vec<Followup>> {
        if payload.action.as_deref() != Some("created") {
            return Ok(Vec::new());
        }
        let (Some(repo), Some(issue), Some(comment)) = (
            payload.repo_name(),
            payload.issue.as_ref(),
            payload.comment.as_ref(),
        ) else {
            return Ok(Vec::new());
        };

        let commands = parse_commands(&comment.body);
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let author = comment.user.login.as_str();

        let mut followups = Vec::new();
        for command in commands {
            // each command sees the then-current state
            let task = self.state.get_task_for_issue(repo, issue.number).await?;
            tracing::info!(?command, author, issue = issue.number, "processing command");
            self.apply_command(&command, task, repo, issue, author, &mut followups)
                .await?;
        }
        Ok(followups)
    }

    #[allow(clippy::too_many_lines)]
    async fn apply_command(
        &self,
        command: &Command,
        task: Option<Task>,
        repo: &str,
        issue: &Issue,
        author: &str,
        followups: &mut Vec<Followup>,
    ) -> Result<()> {
        match command {
            Command::Approve { comment } => {
                let Some(task) = require_task(task, "approve") else {
                    return Ok(());
                };
                // an already-approved task still records the decision so a
                // replayed webhook stays observable; the transition no-ops
                if !matches!(task.state, TaskState::PlanReview | TaskState::Approved) {
                    tracing::warn!(task_id = %task.id, state = %task.state, "cannot approve");
                    return Ok(());
                }
                let mut metadata = serde_json::Map::new();
                metadata.insert("plan_version".to_string(), json!(task.current_plan_version));
                self.state
                    .record_decision(
                        &task.id,
                        "plan_approval",
                        author,
                        "approved",
                        comment.clone(),
                        metadata,
                    )
                    .await?;
                if task.state == TaskState::PlanReview {
                    swallow(
                        self.state
                            .transition(&task.id, TaskState::Approved, TransitionUpdate::default())
                            .await,
                        "approve transition",
                    )?;
                    followups.push(Followup::Execution { task_id: task.id });
                }
            }

            Command::AgentReview { focus } => {
                let Some(task) = require_task(task, "agent-review") else {
                    return Ok(());
                };
                if task.state != TaskState::PrOpen {
                    tracing::warn!(task_id = %task.id, state = %task.state, "cannot request review");
                    return Ok(());
                }
                self.state
                    .record_decision(
                        &task.id,
                        "pr_review_delegation",
                        author,
                        "agent_review_requested",
                        focus.clone(),
                        serde_json::Map::new(),
                    )
                    .await?;
                swallow(
                    self.state
                        .transition(
                            &task.id,
                            TaskState::PrAgentReview,
                            TransitionUpdate::default(),
                        )
                        .await,
                    "review transition",
                )?;
                followups.push(Followup::Review {
                    task_id: task.id,
                    focus: focus.clone().unwrap_or_default(),
                });
            }

            Command::AgentFix { instructions } => {
                let Some(task) = require_task(task, "agent-fix") else {
                    return Ok(());
                };
                if task.state != TaskState::PrOpen {
                    tracing::warn!(task_id = %task.id, state = %task.state, "cannot request fix");
                    return Ok(());
                }
                self.state
                    .record_decision(
                        &task.id,
                        "pr_fix_delegation",
                        author,
                        "agent_fix_requested",
                        instructions.clone(),
                        serde_json::Map::new(),
                    )
                    .await?;
                swallow(
                    self.state
                        .transition(&task.id, TaskState::PrAgentFix, TransitionUpdate::default())
                        .await,
                    "fix transition",
                )?;
                followups.push(Followup::Fix {
                    task_id: task.id,
                    instructions: instructions.clone().unwrap_or_default(),
                });
            }

            Command::AgentPlan => {
                let task = match task {
                    Some(task) => task,
                    None => {
                        let title = issue.title.as_deref().unwrap_or_default();
                        match swallow(
                            self.state.create_task(repo, issue.number, title).await,
                            "create task for planner",
                        )? {
                            Some(task) => task,
                            None => return Ok(()),
                        }
                    }
                };
                self.state
                    .record_decision(
                        &task.id,
                        "planner_requested",
                        author,
                        "planner_invoked",
                        None,
                        serde_json::Map::new(),
                    )
                    .await?;
                followups.push(Followup::Breakdown {
                    task_id: task.id,
                    issue_body: issue.body.clone().unwrap_or_default(),
                });
            }

            Command::ApprovePlan => {
                let Some(task) = require_task(task, "approve-plan") else {
                    return Ok(());
                };
                self.state
                    .record_decision(
                        &task.id,
                        "planner_approval",
                        author,
                        "plan_approved",
                        None,
                        serde_json::Map::new(),
                    )
                    .await?;
            }

            Command::AgentStop => {
                let Some(task) = require_task(task, "agent-stop") else {
                    return Ok(());
                };
                if task.state.is_terminal() {
                    tracing::warn!(task_id = %task.id, "agent-stop on terminal task");
                    return Ok(());
                }
                self.state
                    .record_decision(
                        &task.id,
                        "agent_stop",
                        author,
                        "stopped",
                        None,
                        serde_json::Map::new(),
                    )
                    .await?;
                // held file locks are left to expire on TTL
                self.cancels.request_stop(&task.id).await;
            }

            Command::AgentPm { mode } => {
                let task = match task {
                    Some(task) => task,
                    None => {
                        let title = issue.title.as_deref().unwrap_or_default();
                        match swallow(
                            self.state.create_task(repo, issue.number, title).await,
                            "create task for pm",
                        )? {
                            Some(task) => task,
                            None => return Ok(()),
                        }
                    }
                };
                let mut metadata = serde_json::Map::new();
                metadata.insert("mode".to_string(), json!(mode.to_string()));
                self.state
                    .record_decision(&task.id, "pm_invoked", author, "invoked", None, metadata)
                    .await?;
                if task.state == TaskState::Queued {
                    swallow(
                        self.state
                            .transition(&task.id, TaskState::PmVision, TransitionUpdate::default())
                            .await,
                        "pm transition",
                    )?;
                }
                followups.push(Followup::ProductPass {
                    task_id: task.id,
                    mode: *mode,
                    issue_body: issue.body.clone().unwrap_or_default(),
                });
            }

            Command::ApproveVision => {
                let Some(task) = require_task(task, "approve-vision") else {
                    return Ok(());
                };
                if task.state != TaskState::PmVisionReview {
                    tracing::warn!(task_id = %task.id, state = %task.state, "cannot approve vision");
                    return Ok(());
                }
                self.state
                    .record_decision(
                        &task.id,
                        "vision_approval",
                        author,
                        "approved",
                        None,
                        serde_json::Map::new(),
                    )
                    .await?;
                swallow(
                    self.state
                        .transition(&task.id, TaskState::PmBacklog, TransitionUpdate::default())
                        .await,
                    "vision transition",
                )?;
            }

            Command::RefineFeature { feedback } => {
                let Some(task) = require_task(task, "refine-feature") else {
                    return Ok(());
                };
                if task.state != TaskState::PmFeatureReview {
                    tracing::warn!(task_id = %task.id, state = %task.state, "cannot refine feature");
                    return Ok(());
                }
                self.state
                    .record_decision(
                        &task.id,
                        "feature_feedback",
                        author,
                        "feedback",
                        Some(feedback.clone()),
                        serde_json::Map::new(),
                    )
                    .await?;
            }

            Command::ApproveFeature => {
                let Some(task) = require_task(task, "approve-feature") else {
                    return Ok(());
                };
                if task.state != TaskState::PmFeatureReview {
                    tracing::warn!(task_id = %task.id, state = %task.state, "cannot approve feature");
                    return Ok(());
                }
                self.state
                    .record_decision(
                        &task.id,
                        "feature_approval",
                        author,
                        "approved",
                        None,
                        serde_json::Map::new(),
                    )
                    .await?;
            }

            Command::AddFeature { description } => {
                let Some(task) = require_task(task, "add-feature") else {
                    return Ok(());
                };
                if !matches!(task.state, TaskState::PmBacklog | TaskState::PmFeatureReview) {
                    tracing::warn!(task_id = %task.id, state = %task.state, "cannot add feature");
                    return Ok(());
                }
                self.state
                    .record_decision(
                        &task.id,
                        "feature_added",
                        author,
                        "added",
                        Some(description.clone()),
                        serde_json::Map::new(),
                    )
                    .await?;
            }

            Command::Prioritize {
                feature_id,
                priority,
            } => {
                let Some(task) = require_task(task, "prioritize") else {
                    return Ok(());
                };
                if !matches!(task.state, TaskState::PmBacklog | TaskState::PmFeatureReview) {
                    tracing::warn!(task_id = %task.id, state = %task.state, "cannot prioritize");
                    return Ok(());
                }
                let mut metadata = serde_json::Map::new();
                metadata.insert("feature_id".to_string(), json!(feature_id));
                metadata.insert("priority".to_string(), json!(priority));
                self.state
                    .record_decision(
                        &task.id,
                        "prioritization",
                        author,
                        "reprioritized",
                        None,
                        metadata,
                    )
                    .await?;
            }

            Command::Handoff { feature_id } => {
                let Some(task) = require_task(task, "handoff") else {
                    return Ok(());
                };
                if task.state != TaskState::PmFeatureReview {
                    tracing::warn!(task_id = %task.id, state = %task.state, "cannot hand off");
                    return Ok(());
                }
                let mut metadata = serde_json::Map::new();
                metadata.insert("feature_id".to_string(), json!(feature_id));
                self.state
                    .record_decision(&task.id, "pm_handoff", author, "handed_off", None, metadata)
                    .await?;
                let stepped = swallow(
                    self.state
                        .transition(
                            &task.id,
                            TaskState::PmHandoffPlanner,
                            TransitionUpdate::default(),
                        )
                        .await,
                    "handoff transition",
                )?;
                if stepped.is_some() {
                    swallow(
                        self.state
                            .transition(&task.id, TaskState::Planning, TransitionUpdate::default())
                            .await,
                        "handoff planning transition",
                    )?;
                    followups.push(Followup::Planning {
                        task_id: task.id,
                        issue_body: issue.body.clone().unwrap_or_default(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Handle PR closed events for agent branches
    pub async fn handle_pr_event(&self, payload: &WebhookPayload) -> Result<Vec<Followup>> {
        let (Some(repo), Some(pr)) = (payload.repo_name(), payload.pull_request.as_ref()) else {
            return Ok(Vec::new());
        };
        let Some(rest) = pr.head.branch.strip_prefix("agent/") else {
            return Ok(Vec::new());
        };
        let Some(issue_number) = rest
            .split('-')
            .next()
            .and_then(|digits| digits.parse::<u64>().ok())
        else {
            return Ok(Vec::new());
        };

        if payload.action.as_deref() != Some("closed") {
            return Ok(Vec::new());
        }
        let Some(task) = self.state.get_task_for_issue(repo, issue_number).await? else {
            return Ok(Vec::new());
        };

        let target = if pr.merged.unwrap_or(false) {
            TaskState::Completed
        } else {
            TaskState::Archived
        };
        swallow(
            self.state
                .transition(&task.id, target, TransitionUpdate::default())
                .await,
            "pr close transition",
        )?;
        tracing::info!(task_id = %task.id, state = %target, "task closed via PR");
        Ok(Vec::new())
    }

    // Reserved for a future CI agent
    fn handle_check_run_event(payload: &WebhookPayload) {
        tracing::debug!(action = ?payload.action, "check_run event ignored");
    }

    // ----- agent pipelines -----

    async fn agent_slot(&self) -> Result<OwnedSemaphorePermit> {
        self.agent_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Agent("agent slots closed".to_string()))
    }

    fn worker(&self) -> Agent {
        Agent::Worker(WorkerAgent::new(self.llm.clone(), self.settings.clone()))
    }

    async fn invoke_agent(
        &self,
        agent: &Agent,
        task_id: &str,
        ctx: &AgentContext,
    ) -> Result<AgentResult> {
        let invocation_id = format!("{}-{}", agent.agent_type(), Uuid::new_v4());
        let task = self.state.record_agent_start(task_id, &invocation_id).await?;
        let result = agent.execute(&task, ctx).await;
        self.state.record_agent_done(task_id).await?;

        let result = result?;
        let cost = estimate_cost_usd(&result.tokens_used);
        let task = self
            .state
            .record_usage(task_id, &result.tokens_used, cost)
            .await?;
        if task.estimated_cost_usd > self.settings.cost_alert_threshold_usd {
            tracing::warn!(
                task_id,
                cost_usd = task.estimated_cost_usd,
                "task cost above alert threshold"
            );
        }
        Ok(result)
    }

    /// Planning pipeline: label, plan with the worker, post the plan, and
    /// move the task to plan review.
    pub async fn run_planning(&self, task_id: &str, issue_body: &str) -> Result<()> {
        let _permit = self.agent_slot().await?;
        if self.cancels.is_stopped(task_id).await {
            tracing::info!(task_id, "planning cancelled before start");
            return Ok(());
        }
        let Some(task) = self.state.get_task(task_id).await? else {
            return Ok(());
        };

        if task.state == TaskState::Queued {
            swallow(
                self.state
                    .transition(task_id, TaskState::Planning, TransitionUpdate::default())
                    .await,
                "planning transition",
            )?;
        }
        self.host
            .set_agent_label(&task.repo, task.issue_number, "agent:planning")
            .await?;

        let ctx = AgentContext::new("plan").with("issue_body", issue_body);
        let outcome = self.invoke_agent(&self.worker(), task_id, &ctx).await;

        match outcome {
            Ok(result) if result.success => {
                if self.cancels.is_stopped(task_id).await {
                    tracing::info!(task_id, "planning cancelled before posting");
                    return Ok(());
                }
                let plan_text = result
                    .output
                    .get("plan")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.host
                    .create_issue_comment(
                        &task.repo,
                        task.issue_number,
                        &format!(
                            "## Implementation plan\n\n{plan_text}\n\n\
                             Reply `/approve` to start execution."
                        ),
                    )
                    .await?;
                swallow(
                    self.state
                        .transition(
                            task_id,
                            TaskState::PlanReview,
                            TransitionUpdate::with_plan(Value::Object(result.output)),
                        )
                        .await,
                    "plan review transition",
                )?;
            }
            Ok(result) => {
                let error = result.error.unwrap_or_else(|| "planning failed".to_string());
                self.state.record_failure(task_id, &error).await?;
            }
            Err(Error::Agent(error)) => {
                self.state.record_failure(task_id, &error).await?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Execution pipeline: lock predicted files, implement the latest plan,
    /// and open a PR.
    pub async fn run_execution(&self, task_id: &str) -> Result<()> {
        let _permit = self.agent_slot().await?;
        if self.cancels.is_stopped(task_id).await {
            tracing::info!(task_id, "execution cancelled before start");
            return Ok(());
        }
        let Some(task) = self.state.get_task(task_id).await? else {
            return Ok(());
        };
        if !matches!(task.state, TaskState::Approved | TaskState::Executing) {
            tracing::warn!(task_id, state = %task.state, "execution in unexpected state");
            return Ok(());
        }

        self.host
            .set_agent_label(&task.repo, task.issue_number, "agent:executing")
            .await?;

        let plan = task.plan_versions.last().cloned().unwrap_or(Value::Null);
        let plan_text = plan
            .get("plan")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        // predict the paths this plan will touch, then claim them
        let analyze_ctx = AgentContext::new("analyze").with("content", plan_text.clone());
        let analysis = self
            .invoke_agent(&self.worker(), task_id, &analyze_ctx)
            .await?;
        let files: Vec<String> = analysis
            .output
            .get("files")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if !files.is_empty() {
            let lock = self.locks.acquire(task_id, &task.repo, &files, None).await?;
            if let Err(Error::LockConflict { task: holder, path }) = lock.into_result() {
                self.host
                    .create_issue_comment(
                        &task.repo,
                        task.issue_number,
                        &format!(
                            "Execution is blocked by task {holder} on file `{path}`. \
                             Retry once it finishes."
                        ),
                    )
                    .await?;
                tracing::info!(task_id, holder, path, "execution blocked on file lock");
                return Ok(());
            }
            self.state.set_locked_files(task_id, files.clone()).await?;
        }

        let run = self.execute_locked(task_id, &task, &plan_text).await;

        // locks are released however execution went
        self.locks.release(task_id, &task.repo).await?;
        self.state.set_locked_files(task_id, Vec::new()).await?;
        run
    }

    async fn execute_locked(&self, task_id: &str, task: &Task, plan_text: &str) -> Result<()> {
        swallow(
            self.state
                .transition(task_id, TaskState::Executing, TransitionUpdate::default())
                .await,
            "executing transition",
        )?;

        let ctx = AgentContext::new("implement").with("plan", plan_text.to_string());
        let outcome = self.invoke_agent(&self.worker(), task_id, &ctx).await;

        let result = match outcome {
            Ok(result) if result.success => result,
            Ok(result) => {
                let error = result
                    .error
                    .unwrap_or_else(|| "implementation failed".to_string());
                swallow(
                    self.state
                        .transition(task_id, TaskState::Failed, TransitionUpdate::with_error(error))
                        .await,
                    "failed transition",
                )?;
                return Ok(());
            }
            Err(Error::Agent(error)) => {
                swallow(
                    self.state
                        .transition(task_id, TaskState::Failed, TransitionUpdate::with_error(error))
                        .await,
                    "failed transition",
                )?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if self.cancels.is_stopped(task_id).await {
            tracing::info!(task_id, "execution cancelled before PR");
            return Ok(());
        }

        let summary = result
            .output
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let branch = format!("agent/{}-{}", task.issue_number, slug(&task.issue_title));
        let base = self.host.default_branch(&task.repo).await?;

        match self
            .host
            .create_pull_request(
                &task.repo,
                &format!("Agent: {}", task.issue_title),
                &format!("Closes #{}.\n\n{summary}", task.issue_number),
                &branch,
                &base,
            )
            .await
        {
            Ok(pr) => {
                swallow(
                    self.state
                        .transition(
                            task_id,
                            TaskState::PrOpen,
                            TransitionUpdate {
                                pr_number: Some(pr.number),
                                branch: Some(branch.clone()),
                                ..TransitionUpdate::default()
                            },
                        )
                        .await,
                    "pr open transition",
                )?;
                self.mark_execution_check(&task.repo, &branch).await;
                tracing::info!(task_id, pr = pr.number, url = %pr.html_url, "opened PR");
            }
            Err(e) => {
                // leave the task in Executing so a retry can re-run
                tracing::warn!(task_id, error = %e, "PR creation failed");
                self.host
                    .create_issue_comment(
                        &task.repo,
                        task.issue_number,
                        &format!(
                            "Could not open a pull request ({e}). The agent's \
                             intended change:\n\n{summary}"
                        ),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    // Best effort; a missing check run never fails the pipeline
    async fn mark_execution_check(&self, repo: &str, branch: &str) {
        let sha = match self.host.branch_sha(repo, branch).await {
            Ok(sha) => sha,
            Err(e) => {
                tracing::debug!(repo, branch, error = %e, "no head sha for check run");
                return;
            }
        };
        match self.host.create_check_run(repo, &sha, "agent-execution").await {
            Ok(check_run_id) => {
                if let Err(e) = self
                    .host
                    .complete_check_run(repo, check_run_id, "success")
                    .await
                {
                    tracing::debug!(repo, error = %e, "could not complete check run");
                }
            }
            Err(e) => tracing::debug!(repo, error = %e, "could not create check run"),
        }
    }

    /// Review pipeline: collect the diff, review it, post the review, and
    /// return the task to `PrOpen`.
    pub async fn run_review(&self, task_id: &str, focus: &str) -> Result<()> {
        let _permit = self.agent_slot().await?;
        if self.cancels.is_stopped(task_id).await {
            return Ok(());
        }
        let Some(task) = self.state.get_task(task_id).await? else {
            return Ok(());
        };
        let Some(pr_number) = task.pr_number else {
            tracing::warn!(task_id, "review requested without a PR");
            return Ok(());
        };

        let files = self.host.pr_files(&task.repo, pr_number).await?;
        let diff = files
            .iter()
            .map(|f| {
                format!(
                    "--- {}\n{}",
                    f.filename,
                    f.patch.as_deref().unwrap_or("(no patch)")
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let agent = Agent::Reviewer(ReviewerAgent::new(self.llm.clone(), self.settings.clone()));
        let ctx = AgentContext::new("review")
            .with("diff", diff)
            .with("focus_areas", focus.to_string());
        let outcome = self.invoke_agent(&agent, task_id, &ctx).await;

        match outcome {
            Ok(result) if result.success => {
                let review = result
                    .output
                    .get("review")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.host
                    .create_pr_review(&task.repo, pr_number, review)
                    .await?;
            }
            Ok(result) => {
                let error = result.error.unwrap_or_else(|| "review failed".to_string());
                self.state.record_failure(task_id, &error).await?;
            }
            Err(Error::Agent(error)) => {
                self.state.record_failure(task_id, &error).await?;
            }
            Err(e) => return Err(e),
        }

        swallow(
            self.state
                .transition(task_id, TaskState::PrOpen, TransitionUpdate::default())
                .await,
            "review return transition",
        )?;
        Ok(())
    }

    /// Fix pipeline: analyze review feedback, post the analysis, and return
    /// the task to `PrOpen`.
    pub async fn run_fix(&self, task_id: &str, instructions: &str) -> Result<()> {
        let _permit = self.agent_slot().await?;
        if self.cancels.is_stopped(task_id).await {
            return Ok(());
        }
        let Some(task) = self.state.get_task(task_id).await? else {
            return Ok(());
        };
        let Some(pr_number) = task.pr_number else {
            tracing::warn!(task_id, "fix requested without a PR");
            return Ok(());
        };

        let agent = Agent::Fixer(FixerAgent::new(self.llm.clone(), self.settings.clone()));
        let ctx = AgentContext::new("fix").with("review_comments", instructions.to_string());
        let outcome = self.invoke_agent(&agent, task_id, &ctx).await;

        match outcome {
            Ok(result) => {
                let analysis = result
                    .output
                    .get("analysis")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.host
                    .create_issue_comment(&task.repo, pr_number, analysis)
                    .await?;
                if !result.success {
                    self.state
                        .record_failure(task_id, "fix needs human input")
                        .await?;
                }
            }
            Err(Error::Agent(error)) => {
                self.state.record_failure(task_id, &error).await?;
            }
            Err(e) => return Err(e),
        }

        swallow(
            self.state
                .transition(task_id, TaskState::PrOpen, TransitionUpdate::default())
                .await,
            "fix return transition",
        )?;
        Ok(())
    }

    /// Planner pipeline: break the feature down and open sub-issues
    pub async fn run_breakdown(&self, task_id: &str, issue_body: &str) -> Result<()> {
        let _permit = self.agent_slot().await?;
        if self.cancels.is_stopped(task_id).await {
            return Ok(());
        }
        let Some(task) = self.state.get_task(task_id).await? else {
            return Ok(());
        };

        let agent = Agent::Planner(PlannerAgent::new(self.llm.clone(), self.settings.clone()));
        let ctx = AgentContext::new("breakdown").with("issue_body", issue_body.to_string());
        let outcome = self.invoke_agent(&agent, task_id, &ctx).await;

        match outcome {
            Ok(result) if result.success => {
                let plan = result
                    .output
                    .get("plan")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.host
                    .create_issue_comment(
                        &task.repo,
                        task.issue_number,
                        &format!("## Breakdown\n\n{plan}\n\nReply `/approve-plan` to accept."),
                    )
                    .await?;

                let sub_tasks = result
                    .output
                    .get("sub_tasks")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for sub_task in &sub_tasks {
                    let title = sub_task
                        .get("title")
                        .and_then(Value::as_str)
                        .unwrap_or("Sub-task");
                    let description = sub_task
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let complexity = sub_task
                        .get("complexity")
                        .and_then(Value::as_str)
                        .unwrap_or("standard");
                    let body = format!("Part of #{}.\n\n{description}", task.issue_number);
                    let labels = vec!["agent-ok".to_string(), format!("complexity:{complexity}")];
                    let issue = self
                        .host
                        .create_issue(&task.repo, title, &body, &labels)
                        .await?;
                    tracing::info!(
                        parent = task.issue_number,
                        sub_issue = issue.number,
                        "created sub-issue"
                    );
                }
            }
            Ok(result) => {
                let error = result
                    .error
                    .unwrap_or_else(|| "breakdown failed".to_string());
                self.state.record_failure(task_id, &error).await?;
            }
            Err(Error::Agent(error)) => {
                self.state.record_failure(task_id, &error).await?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Product-manager pipeline: produce the document for `mode`, store it
    /// in the repository, and advance the PM flow.
    pub async fn run_product_pass(
        &self,
        task_id: &str,
        mode: PmMode,
        issue_body: &str,
    ) -> Result<()> {
        let _permit = self.agent_slot().await?;
        if self.cancels.is_stopped(task_id).await {
            return Ok(());
        }
        let Some(task) = self.state.get_task(task_id).await? else {
            return Ok(());
        };

        let path = match mode {
            PmMode::Vision => "VISION.md",
            PmMode::Backlog | PmMode::Feature => "BACKLOG.md",
        };
        let existing = self
            .host
            .file_content(&task.repo, path, None)
            .await?
            .unwrap_or_default();

        let agent = Agent::ProductManager(ProductManagerAgent::new(
            self.llm.clone(),
            self.settings.clone(),
        ));
        let ctx = AgentContext::new(&mode.to_string())
            .with("existing_document", existing)
            .with("issue_body", issue_body.to_string());
        let outcome = self.invoke_agent(&agent, task_id, &ctx).await;

        match outcome {
            Ok(result) if result.success => {
                let document = result
                    .output
                    .get("document")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.host
                    .put_file(
                        &task.repo,
                        path,
                        document,
                        &format!("Update {path} ({mode} pass)"),
                        None,
                    )
                    .await?;
                self.host
                    .create_issue_comment(
                        &task.repo,
                        task.issue_number,
                        &format!("## Product {mode} draft\n\n{document}"),
                    )
                    .await?;

                let next = match (task.state, mode) {
                    (TaskState::PmVision, _) => Some(TaskState::PmVisionReview),
                    (TaskState::PmBacklog, PmMode::Feature) => Some(TaskState::PmFeatureReview),
                    _ => None,
                };
                if let Some(next) = next {
                    swallow(
                        self.state
                            .transition(task_id, next, TransitionUpdate::default())
                            .await,
                        "pm review transition",
                    )?;
                }
            }
            Ok(result) => {
                let error = result.error.unwrap_or_else(|| "pm pass failed".to_string());
                self.state.record_failure(task_id, &error).await?;
            }
            Err(Error::Agent(error)) => {
                self.state.record_failure(task_id, &error).await?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

/// Log-and-skip for precondition errors inside the router; everything else
/// bubbles so the webhook can 5xx and the platform retries.
fn swallow<T>(result: Result<T>, context: &str) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(
            e @ (Error::InvalidTransition { .. }
            | Error::TaskNotFound(_)
            | Error::DuplicateTask { .. }),
        ) => {
            tracing::warn!(error = %e, context, "skipping");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn require_task(task: Option<Task>, verb: &str) -> Option<Task> {
    if task.is_none() {
        tracing::warn!(verb, "no task found for command");
    }
    task
}

fn slug(title: &str) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let trimmed = slug
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    trimmed.chars().take(30).collect()
}
