//! Agent variants and their shared execution contract
//!
//! Agents differ only by their type tag and what `execute` does with the
//! context, so the driver is a closed enum behind one operation. The core
//! treats agent output as opaque JSON.

pub mod planner;
pub mod product_manager;
pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use swarm_core::{Result, Task};

use crate::config::Settings;
use crate::llm::{CompletionRequest, LlmClient};

pub use planner::PlannerAgent;
pub use product_manager::ProductManagerAgent;
pub use worker::{FixerAgent, ReviewerAgent, WorkerAgent};

/// Result of one agent execution
#[derive(Debug, Clone)]
pub struct AgentResult {
    /// Whether the agent finished its work
    pub success: bool,
    /// Agent-specific output payload
    pub output: Map<String, Value>,
    /// Failure detail when `success` is false
    pub error: Option<String>,
    /// Tokens consumed, per model
    pub tokens_used: HashMap<String, u64>,
}

impl AgentResult {
    fn failure(error: impl Into<String>, tokens_used: HashMap<String, u64>) -> Self {
        Self {
            success: false,
            output: Map::new(),
            error: Some(error.into()),
            tokens_used,
        }
    }
}

/// Input context for an agent execution: an action discriminator plus
/// agent-specific keys
#[derive(Debug, Clone)]
pub struct AgentContext {
    action: String,
    data: Map<String, Value>,
}

impl AgentContext {
    /// Context for the given action
    #[must_use]
    pub fn new(action: &str) -> Self {
        Self {
            action: action.to_string(),
            data: Map::new(),
        }
    }

    /// Attach a key
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// The action discriminator
    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    /// A string-valued key, if present
    #[must_use]
    pub fn str_value(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// A raw key, if present
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// Running per-model token count for one execution
#[derive(Debug, Default)]
pub struct TokenTally(HashMap<String, u64>);

impl TokenTally {
    fn add(&mut self, model: &str, tokens: u64) {
        *self.0.entry(model.to_string()).or_insert(0) += tokens;
    }

    fn into_inner(self) -> HashMap<String, u64> {
        self.0
    }
}

// Rough blended $/MTok per model tier, input and output averaged
const BLENDED_RATES: &[(&str, f64)] = &[("haiku", 3.0), ("sonnet", 9.0), ("opus", 15.0)];

/// Estimate the cost of a token tally in USD
#[must_use]
pub fn estimate_cost_usd(tokens: &HashMap<String, u64>) -> f64 {
    tokens
        .iter()
        .map(|(model, count)| {
            let rate = BLENDED_RATES
                .iter()
                .find(|(tier, _)| model.contains(tier))
                .map_or(9.0, |(_, rate)| *rate);
            #[allow(clippy::cast_precision_loss)]
            let tokens = *count as f64;
            tokens / 1_000_000.0 * rate
        })
        .sum()
}

/// Shared LLM plumbing for every agent variant
#[derive(Clone)]
pub(crate) struct AgentCore {
    llm: Arc<dyn LlmClient>,
    settings: Arc<Settings>,
}

impl AgentCore {
    pub(crate) fn new(llm: Arc<dyn LlmClient>, settings: Arc<Settings>) -> Self {
        Self { llm, settings }
    }

    /// Pick a model for the task type and complexity estimate
    pub(crate) fn select_model(&self, task_type: &str, complexity: &str) -> &str {
        match complexity {
            "trivial" => &self.settings.model_haiku,
            "complex" => &self.settings.model_opus,
            _ => {
                if matches!(task_type, "file_analysis" | "planning") {
                    &self.settings.model_haiku
                } else {
                    &self.settings.model_sonnet
                }
            }
        }
    }

    pub(crate) async fn complete(
        &self,
        tally: &mut TokenTally,
        model: &str,
        system: Option<&str>,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String> {
        let completion = self
            .llm
            .complete(CompletionRequest {
                model,
                system,
                prompt,
                max_tokens,
            })
            .await?;
        tally.add(model, completion.total_tokens());
        Ok(completion.text)
    }

    /// Classify issue complexity as trivial, standard, or complex
    pub(crate) async fn estimate_complexity(
        &self,
        tally: &mut TokenTally,
        issue_body: &str,
    ) -> Result<String> {
        let prompt = format!(
            "Classify this GitHub issue's implementation complexity.\n\n\
             Issue:\n{issue_body}\n\n\
             Respond with exactly one word: trivial, standard, or complex\n\n\
             trivial: single file, <20 lines, obvious fix\n\
             standard: 2-5 files, clear approach, moderate changes\n\
             complex: architectural changes, multiple components, >5 files"
        );
        let model = self.settings.model_haiku.clone();
        let response = self.complete(tally, &model, None, &prompt, 10).await?;
        let normalized = response.trim().to_lowercase();
        Ok(match normalized.as_str() {
            "trivial" | "complex" => normalized,
            _ => "standard".to_string(),
        })
    }

    /// Predict which file paths an issue will touch
    pub(crate) async fn analyze_files(
        &self,
        tally: &mut TokenTally,
        issue_body: &str,
    ) -> Result<Vec<String>> {
        let prompt = format!(
            "Analyze this GitHub issue and predict which files will need to be \
             modified.\n\nIssue:\n{issue_body}\n\n\
             List only the file paths, one per line. Include files that will be \
             modified and new files that will be created.\n\nFiles:"
        );
        let model = self.settings.model_haiku.clone();
        let response = self.complete(tally, &model, None, &prompt, 1024).await?;

        let mut files: Vec<String> = response
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| {
                line.trim_start_matches("- ")
                    .trim_start_matches("* ")
                    .to_string()
            })
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }
}

/// The closed set of agent variants
pub enum Agent {
    /// Breaks complex features into sub-issues
    Planner(PlannerAgent),
    /// Plans and implements single issues
    Worker(WorkerAgent),
    /// Reviews pull requests on request
    Reviewer(ReviewerAgent),
    /// Addresses review feedback
    Fixer(FixerAgent),
    /// Drives vision, backlog, and feature documents
    ProductManager(ProductManagerAgent),
}

impl Agent {
    /// Type tag for labels and invocation ids
    #[must_use]
    pub fn agent_type(&self) -> &'static str {
        match self {
            Self::Planner(_) => "planner",
            Self::Worker(_) => "worker",
            Self::Reviewer(_) => "reviewer",
            Self::Fixer(_) => "fixer",
            Self::ProductManager(_) => "product_manager",
        }
    }

    /// Execute the agent against a task snapshot
    ///
    /// # Errors
    ///
    /// Returns `Agent` errors from the LLM endpoint; agent-level failures
    /// are reported in the result instead.
    pub async fn execute(&self, task: &Task, ctx: &AgentContext) -> Result<AgentResult> {
        match self {
            Self::Planner(agent) => agent.execute(task, ctx).await,
            Self::Worker(agent) => agent.execute(task, ctx).await,
            Self::Reviewer(agent) => agent.execute(task, ctx).await,
            Self::Fixer(agent) => agent.execute(task, ctx).await,
            Self::ProductManager(agent) => agent.execute(task, ctx).await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_context_round_trip() {
        let ctx = AgentContext::new("plan")
            .with("issue_body", "fix the bug")
            .with("attempt", 2);
        assert_eq!(ctx.action(), "plan");
        assert_eq!(ctx.str_value("issue_body"), Some("fix the bug"));
        assert_eq!(ctx.value("attempt"), Some(&Value::from(2)));
        assert!(ctx.str_value("missing").is_none());
    }

    #[test]
    fn test_cost_estimate_uses_tier_rates() {
        let mut tokens = HashMap::new();
        tokens.insert("claude-haiku-4-5-20251001".to_string(), 1_000_000u64);
        assert!((estimate_cost_usd(&tokens) - 3.0).abs() < 1e-9);
        tokens.insert("claude-opus-4-5-20251101".to_string(), 2_000_000u64);
        assert!((estimate_cost_usd(&tokens) - 33.0).abs() < 1e-9);
    }

    #[test]
    fn test_tally_accumulates() {
        let mut tally = TokenTally::default();
        tally.add("m", 10);
        tally.add("m", 5);
        assert_eq!(tally.into_inner().get("m"), Some(&15));
    }
}
