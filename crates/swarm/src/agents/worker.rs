//! Worker, reviewer, and fixer agents
//!
//! The worker handles the issue-to-PR flow; the reviewer and fixer operate
//! on open pull requests.

use std::sync::Arc;

use serde_json::{Map, Value};
use swarm_core::{Result, Task};

use super::{AgentContext, AgentCore, AgentResult, TokenTally};
use crate::config::Settings;
use crate::llm::LlmClient;

/// Worker agent that plans issues and implements approved plans
pub struct WorkerAgent {
    core: AgentCore,
}

impl WorkerAgent {
    /// Create a worker over the given LLM endpoint
    pub fn new(llm: Arc<dyn LlmClient>, settings: Arc<Settings>) -> Self {
        Self {
            core: AgentCore::new(llm, settings),
        }
    }

    /// Dispatch on the context action
    pub async fn execute(&self, task: &Task, ctx: &AgentContext) -> Result<AgentResult> {
        match ctx.action() {
            "plan" => self.generate_plan(task, ctx).await,
            "analyze" => self.analyze(ctx).await,
            "implement" => Ok(Self::implement(task, ctx)),
            other => Ok(AgentResult::failure(
                format!("unknown worker action: {other}"),
                TokenTally::default().into_inner(),
            )),
        }
    }

    /// Predict the file paths the work described by `content` will touch
    async fn analyze(&self, ctx: &AgentContext) -> Result<AgentResult> {
        let mut tally = TokenTally::default();
        let content = ctx.str_value("content").unwrap_or_default();
        let files = self.core.analyze_files(&mut tally, content).await?;

        let mut output = Map::new();
        output.insert(
            "files".to_string(),
            Value::Array(files.into_iter().map(Value::String).collect()),
        );

        Ok(AgentResult {
            success: true,
            output,
            error: None,
            tokens_used: tally.into_inner(),
        })
    }

    async fn generate_plan(&self, task: &Task, ctx: &AgentContext) -> Result<AgentResult> {
        let mut tally = TokenTally::default();
        let issue_body = ctx.str_value("issue_body").unwrap_or_default();
        let repo_context = ctx.str_value("repo_context").unwrap_or_default();
        let feedback = ctx.str_value("feedback");

        let system = "You are a senior software engineer planning an implementation. \
                      Create a clear, actionable plan another engineer can follow. \
                      Be specific about files to modify and the approach.";

        let mut prompt = format!(
            "Create an implementation plan for this GitHub issue.\n\n\
             Issue: {}\n\nDescription:\n{issue_body}\n\n\
             Repository context:\n{repo_context}\n",
            task.issue_title
        );
        if let Some(feedback) = feedback {
            prompt.push_str(&format!(
                "\nPrevious plan feedback (incorporate this):\n{feedback}\n"
            ));
        }
        prompt.push_str(
            "\nRespond with a summary, numbered implementation steps, the files \
             to modify, the estimated scope, and any risks.",
        );

        let complexity = self.core.estimate_complexity(&mut tally, issue_body).await?;
        let model = self.core.select_model("planning", &complexity).to_string();
        let plan = self
            .core
            .complete(&mut tally, &model, Some(system), &prompt, 4096)
            .await?;

        let mut output = Map::new();
        output.insert("plan".to_string(), Value::String(plan));
        output.insert("complexity".to_string(), Value::String(complexity));
        output.insert("model_used".to_string(), Value::String(model));

        Ok(AgentResult {
            success: true,
            output,
            error: None,
            tokens_used: tally.into_inner(),
        })
    }

    // TODO: drive a sandbox runner here once one is wired up; until then the
    // result reports the plan that would have been applied.
    fn implement(task: &Task, ctx: &AgentContext) -> AgentResult {
        let plan = ctx.str_value("plan").unwrap_or_default();
        tracing::info!(task_id = %task.id, "implementation requested");

        let mut output = Map::new();
        output.insert(
            "status".to_string(),
            Value::String("implementation_pending".to_string()),
        );
        output.insert(
            "summary".to_string(),
            Value::String(format!(
                "Would apply the approved plan ({} chars) to {}",
                plan.len(),
                task.repo
            )),
        );

        AgentResult {
            success: true,
            output,
            error: None,
            tokens_used: TokenTally::default().into_inner(),
        }
    }
}

/// Agent that reviews PRs on request
pub struct ReviewerAgent {
    core: AgentCore,
}

impl ReviewerAgent {
    /// Create a reviewer over the given LLM endpoint
    pub fn new(llm: Arc<dyn LlmClient>, settings: Arc<Settings>) -> Self {
        Self {
            core: AgentCore::new(llm, settings),
        }
    }

    /// Review the PR diff in the context
    pub async fn execute(&self, _task: &Task, ctx: &AgentContext) -> Result<AgentResult> {
        let mut tally = TokenTally::default();
        let diff = ctx.str_value("diff").unwrap_or_default();
        let focus = ctx.str_value("focus_areas").unwrap_or("General review");

        let system = "You are a senior code reviewer. Provide constructive, specific \
                      feedback. Focus on correctness, maintainability, and potential \
                      bugs. Be concise but thorough.";
        let prompt = format!(
            "Review this pull request.\n\nFocus areas requested by the human:\n\
             {focus}\n\nDiff:\n```diff\n{diff}\n```\n\n\
             Give an overall assessment, then specific comments with file and \
             line references, then any questions for the author."
        );

        let model = self.core.select_model("review", "standard").to_string();
        let review = self
            .core
            .complete(&mut tally, &model, Some(system), &prompt, 4096)
            .await?;

        let mut output = Map::new();
        output.insert("review".to_string(), Value::String(review));

        Ok(AgentResult {
            success: true,
            output,
            error: None,
            tokens_used: tally.into_inner(),
        })
    }
}

/// Agent that addresses PR review feedback
pub struct FixerAgent {
    core: AgentCore,
}

impl FixerAgent {
    /// Create a fixer over the given LLM endpoint
    pub fn new(llm: Arc<dyn LlmClient>, settings: Arc<Settings>) -> Self {
        Self {
            core: AgentCore::new(llm, settings),
        }
    }

    /// Analyze review comments and decide what can be addressed
    pub async fn execute(&self, _task: &Task, ctx: &AgentContext) -> Result<AgentResult> {
        let mut tally = TokenTally::default();
        let review_comments = ctx.str_value("review_comments").unwrap_or_default();
        let current_code = ctx.str_value("current_code").unwrap_or_default();

        let system = "You are a developer addressing code review feedback. Make \
                      minimal, targeted changes for each comment. If a comment \
                      needs clarification or a design decision, answer needs_human \
                      rather than guessing.";
        let prompt = format!(
            "Address these review comments.\n\nReview comments:\n{review_comments}\n\n\
             Current code context:\n{current_code}\n\n\
             For each comment say whether you can address it (yes/no/needs_human), \
             the change you'll make, and why human input is needed if it is."
        );

        let model = self.core.select_model("fix", "standard").to_string();
        let analysis = self
            .core
            .complete(&mut tally, &model, Some(system), &prompt, 4096)
            .await?;

        let can_address = !analysis.to_lowercase().contains("needs_human");
        let mut output = Map::new();
        output.insert("analysis".to_string(), Value::String(analysis));
        output.insert("fully_addressed".to_string(), Value::Bool(can_address));

        Ok(AgentResult {
            success: can_address,
            output,
            error: None,
            tokens_used: tally.into_inner(),
        })
    }
}
