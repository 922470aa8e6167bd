//! Slash-command grammar for issue and PR comments
//!
//! A command occupies the start of a line: `/<verb>` optionally followed by
//! whitespace and arguments. Multiple commands in one comment are returned in
//! textual order.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Product-manager mode for `/agent-pm`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmMode {
    /// Draft or refine the product vision
    Vision,
    /// Manage the feature backlog
    Backlog,
    /// Draft a single feature document
    Feature,
}

impl PmMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "vision" => Some(Self::Vision),
            "backlog" => Some(Self::Backlog),
            "feature" => Some(Self::Feature),
            _ => None,
        }
    }
}

impl fmt::Display for PmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vision => write!(f, "vision"),
            Self::Backlog => write!(f, "backlog"),
            Self::Feature => write!(f, "feature"),
        }
    }
}

/// A parsed slash-command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/approve [comment]` - approve the current plan
    Approve {
        /// Trailing comment text, if any
        comment: Option<String>,
    },
    /// `/agent-review [focus]` - delegate PR review to the reviewer agent
    AgentReview {
        /// Focus areas requested by the human
        focus: Option<String>,
    },
    /// `/agent-fix [instructions]` - delegate fixes to the fixer agent
    AgentFix {
        /// Instructions for the fixer
        instructions: Option<String>,
    },
    /// `/agent-plan` - invoke the planner agent
    AgentPlan,
    /// `/approve-plan` - approve the planner's breakdown
    ApprovePlan,
    /// `/agent-stop` - soft-cancel in-flight agent work
    AgentStop,
    /// `/agent-pm [mode]` - invoke the product-manager agent
    AgentPm {
        /// Requested mode; defaults to vision
        mode: PmMode,
    },
    /// `/approve-vision` - approve the product vision
    ApproveVision,
    /// `/refine-feature <feedback>` - record feedback on a feature document
    RefineFeature {
        /// Feedback text
        feedback: String,
    },
    /// `/approve-feature` - approve the feature document
    ApproveFeature,
    /// `/add-feature <description>` - add a backlog feature
    AddFeature {
        /// Feature description
        description: String,
    },
    /// `/prioritize <feature-id> <priority>` - reprioritize a feature
    Prioritize {
        /// Backlog feature id
        feature_id: String,
        /// New priority value
        priority: u32,
    },
    /// `/handoff <feature-id>` - hand a feature to the planner flow
    Handoff {
        /// Backlog feature id
        feature_id: String,
    },
}

// Longest verbs first so `/approve-plan` never parses as `/approve`.
// Trailing \r? tolerates CRLF comment bodies.
const COMMAND_PATTERN: &str = r"(?m)^/(approve-vision|approve-feature|approve-plan|refine-feature|add-feature|agent-review|agent-plan|agent-stop|agent-fix|agent-pm|prioritize|handoff|approve)(?:[ \t]+(.*))?\r?$";

// the pattern is a constant exercised by every test below
#[allow(clippy::unwrap_used)]
fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(COMMAND_PATTERN).unwrap())
}

/// Extract all well-formed commands from a comment body, in textual order.
/// Lines that look like a command but carry malformed arguments are dropped.
#[must_use]
pub fn parse_commands(body: &str) -> Vec<Command> {
    pattern()
        .captures_iter(body)
        .filter_map(|caps| {
            let verb = caps.get(1).map(|m| m.as_str())?;
            let args = caps
                .get(2)
                .map(|m| m.as_str().trim())
                .filter(|s| !s.is_empty());
            build(verb, args)
        })
        .collect()
}

fn build(verb: &str, args: Option<&str>) -> Option<Command> {
    let owned = |s: &str| s.to_string();
    match verb {
        "approve" => Some(Command::Approve {
            comment: args.map(owned),
        }),
        "agent-review" => Some(Command::AgentReview {
            focus: args.map(owned),
        }),
        "agent-fix" => Some(Command::AgentFix {
            instructions: args.map(owned),
        }),
        "agent-plan" => Some(Command::AgentPlan),
        "approve-plan" => Some(Command::ApprovePlan),
        "agent-stop" => Some(Command::AgentStop),
        "agent-pm" => {
            let mode = match args {
                Some(arg) => PmMode::parse(arg)?,
                None => PmMode::Vision,
            };
            Some(Command::AgentPm { mode })
        }
        "approve-vision" => Some(Command::ApproveVision),
        "refine-feature" => args.map(|a| Command::RefineFeature {
            feedback: a.to_string(),
        }),
        "approve-feature" => Some(Command::ApproveFeature),
        "add-feature" => args.map(|a| Command::AddFeature {
            description: a.to_string(),
        }),
        "prioritize" => {
            let mut parts = args?.split_whitespace();
            let feature_id = parts.next()?.to_string();
            let priority = parts.next()?.parse().ok()?;
            Some(Command::Prioritize {
                feature_id,
                priority,
            })
        }
        "handoff" => {
            let feature_id = args?.split_whitespace().next()?.to_string();
            Some(Command::Handoff { feature_id })
        }
        _ => None,
    }
}
