//! Product-manager agent
//!
//! Produces opaque vision, backlog, and feature documents. The core only
//! stores and relays them; nothing here renders repository markdown.

use std::sync::Arc;

use serde_json::{Map, Value};
use swarm_core::{Result, Task};

use super::{AgentContext, AgentCore, AgentResult, TokenTally};
use crate::config::Settings;
use crate::llm::LlmClient;

/// Product-manager agent for vision, backlog, and feature work
pub struct ProductManagerAgent {
    core: AgentCore,
}

impl ProductManagerAgent {
    /// Create a product manager over the given LLM endpoint
    pub fn new(llm: Arc<dyn LlmClient>, settings: Arc<Settings>) -> Self {
        Self {
            core: AgentCore::new(llm, settings),
        }
    }

    /// Produce the document for the requested mode
    pub async fn execute(&self, task: &Task, ctx: &AgentContext) -> Result<AgentResult> {
        let mode = ctx.action();
        let existing = ctx.str_value("existing_document").unwrap_or_default();
        let feedback = ctx.str_value("feedback").unwrap_or_default();
        let issue_body = ctx.str_value("issue_body").unwrap_or_default();

        let (system, ask) = match mode {
            "vision" => (
                "You are a product manager articulating a product vision. Be \
                 concrete about the problem, the users, and what success looks \
                 like.",
                "Write or revise the product vision for this repository.",
            ),
            "backlog" => (
                "You are a product manager maintaining a feature backlog. Keep \
                 entries small, independently shippable, and ordered by value.",
                "Write or revise the feature backlog, giving each feature a \
                 stable id like feature-1.",
            ),
            "feature" => (
                "You are a product manager specifying a single feature. Cover \
                 the user story, acceptance criteria, and out-of-scope notes.",
                "Write or revise the feature document for the highest-priority \
                 backlog entry.",
            ),
            other => {
                return Ok(AgentResult::failure(
                    format!("unknown product-manager mode: {other}"),
                    TokenTally::default().into_inner(),
                ))
            }
        };

        let mut prompt = format!(
            "{ask}\n\nRepository: {}\nRequest context:\n{issue_body}\n",
            task.repo
        );
        if !existing.is_empty() {
            prompt.push_str(&format!("\nCurrent document:\n{existing}\n"));
        }
        if !feedback.is_empty() {
            prompt.push_str(&format!("\nHuman feedback to incorporate:\n{feedback}\n"));
        }

        let mut tally = TokenTally::default();
        let model = self.core.select_model("product", "standard").to_string();
        let document = self
            .core
            .complete(&mut tally, &model, Some(system), &prompt, 4096)
            .await?;

        let mut output = Map::new();
        output.insert("document".to_string(), Value::String(document));
        output.insert("mode".to_string(), Value::String(mode.to_string()));

        Ok(AgentResult {
            success: true,
            output,
            error: None,
            tokens_used: tally.into_inner(),
        })
    }
}
