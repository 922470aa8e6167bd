//! Planner agent - dependency analysis and work breakdown

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use swarm_core::{Result, Task};

use super::{AgentContext, AgentCore, AgentResult, TokenTally};
use crate::config::Settings;
use crate::llm::LlmClient;

/// A sub-task parsed out of the planner's breakdown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubTask {
    /// Title, suitable for a GitHub issue
    pub title: String,
    /// Accumulated description lines
    pub description: String,
    /// Estimated complexity tag, if stated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complexity: Option<String>,
    /// Titles or numbers of sub-tasks that must land first
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

/// Planner agent for architectural analysis and dependency mapping
pub struct PlannerAgent {
    core: AgentCore,
}

impl PlannerAgent {
    /// Create a planner over the given LLM endpoint
    pub fn new(llm: Arc<dyn LlmClient>, settings: Arc<Settings>) -> Self {
        Self {
            core: AgentCore::new(llm, settings),
        }
    }

    /// Generate a comprehensive plan with a sub-task breakdown
    pub async fn execute(&self, task: &Task, ctx: &AgentContext) -> Result<AgentResult> {
        let mut tally = TokenTally::default();
        let issue_body = ctx.str_value("issue_body").unwrap_or_default();
        let repo_structure = ctx.str_value("repo_structure").unwrap_or_default();

        let system = "You are a technical project manager and architect. Analyze \
                      complex features and break them into well-defined, \
                      implementable tasks. Identify dependencies, risks, and \
                      execution order. Be thorough but practical.";
        let prompt = format!(
            "Analyze this feature request and create an implementation plan.\n\n\
             Feature: {}\n\nDescription:\n{issue_body}\n\n\
             Repository structure:\n{repo_structure}\n\n\
             Start with an executive summary, then a '## Sub-tasks' section \
             breaking the work into discrete issues. For each sub-task give a \
             '### ' heading, a description, 'Complexity:' \
             (trivial/standard/complex), and 'Dependencies:' naming sub-tasks \
             that must land first. Finish with execution order and risks.",
            task.issue_title
        );

        // breakdown work always runs on the strongest model
        let model = self.core.select_model("breakdown", "complex").to_string();
        let plan = self
            .core
            .complete(&mut tally, &model, Some(system), &prompt, 8192)
            .await?;

        let sub_tasks = parse_subtasks(&plan);
        let mut output = Map::new();
        output.insert("plan".to_string(), Value::String(plan));
        output.insert(
            "sub_tasks".to_string(),
            serde_json::to_value(&sub_tasks).unwrap_or(Value::Null),
        );
        output.insert("model_used".to_string(), Value::String(model));

        Ok(AgentResult {
            success: true,
            output,
            error: None,
            tokens_used: tally.into_inner(),
        })
    }
}

/// Pull sub-task entries out of the planner's `## Sub-tasks` section
#[must_use]
pub fn parse_subtasks(plan: &str) -> Vec<SubTask> {
    let mut sub_tasks = Vec::new();
    let mut current: Option<SubTask> = None;
    let mut in_section = false;

    for line in plan.lines() {
        let line = line.trim();

        if line.starts_with("## Sub-tasks") || line.starts_with("## Subtasks") {
            in_section = true;
            continue;
        }
        if in_section && line.starts_with("## ") {
            break;
        }
        if !in_section {
            continue;
        }

        if line.starts_with("### ") || line.starts_with("- **") {
            if let Some(done) = current.take() {
                sub_tasks.push(done);
            }
            let title = line
                .trim_start_matches("### ")
                .trim_start_matches("- **")
                .replace("**", "")
                .trim()
                .to_string();
            current = Some(SubTask {
                title,
                ..SubTask::default()
            });
        } else if let Some(task) = current.as_mut() {
            if let Some(deps) = line
                .strip_prefix("Dependencies:")
                .or_else(|| line.strip_prefix("Depends on:"))
            {
                task.dependencies = deps
                    .split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty() && *d != "None")
                    .map(ToString::to_string)
                    .collect();
            } else if let Some(complexity) = line.strip_prefix("Complexity:") {
                task.complexity = Some(complexity.trim().to_lowercase());
            } else if !line.is_empty() {
                task.description.push_str(line);
                task.description.push('\n');
            }
        }
    }

    if let Some(done) = current.take() {
        sub_tasks.push(done);
    }
    sub_tasks
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const PLAN: &str = "\
## Executive Summary
Split the feature in two.

## Sub-tasks

### Add the data model
Introduce the new table.
Complexity: standard
Dependencies: None

### Wire the API
Expose the endpoint.
Complexity: trivial
Dependencies: Add the data model

## Execution Order
Model first.";

    #[test]
    fn test_parse_subtasks_extracts_entries() {
        let tasks = parse_subtasks(PLAN);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].title, "Add the data model");
        assert_eq!(tasks[0].complexity.as_deref(), Some("standard"));
        assert!(tasks[0].dependencies.is_empty());
        assert_eq!(tasks[1].dependencies, vec!["Add the data model".to_string()]);
        assert!(tasks[1].description.contains("Expose the endpoint."));
    }

    #[test]
    fn test_parse_subtasks_stops_at_next_section() {
        let tasks = parse_subtasks(PLAN);
        assert!(!tasks
            .iter()
            .any(|t| t.description.contains("Model first")));
    }

    #[test]
    fn test_parse_subtasks_without_section_is_empty() {
        assert!(parse_subtasks("## Summary\nNothing here").is_empty());
    }
}
