//! Anthropic Messages API client

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use swarm_core::{Error, Result};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// One completion request
#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    /// Model id to sample from
    pub model: &'a str,
    /// Optional system prompt
    pub system: Option<&'a str>,
    /// User prompt
    pub prompt: &'a str,
    /// Output token ceiling
    pub max_tokens: u32,
}

/// Text and token accounting from one completion
#[derive(Debug, Clone)]
pub struct Completion {
    /// Concatenated text blocks
    pub text: String,
    /// Prompt tokens billed
    pub input_tokens: u64,
    /// Output tokens billed
    pub output_tokens: u64,
}

impl Completion {
    /// Total tokens consumed by the request
    #[must_use]
    pub const fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// LLM endpoint contract the agents depend on
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one completion
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion>;
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

/// Client for the Anthropic Messages API
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    /// Create a client with the given API key
    #[must_use]
    pub fn new(api_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
            base_url: API_URL.to_string(),
        }
    }

    /// Point the client at a different endpoint, for tests
    #[must_use]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion> {
        let body = MessagesRequest {
            model: request.model,
            max_tokens: request.max_tokens,
            system: request.system,
            messages: [Message {
                role: "user",
                content: request.prompt,
            }],
        };

        let response = self
            .http
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Agent(format!("completion request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Agent(format!(
                "completion returned {status}: {detail}"
            )));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| Error::Agent(format!("malformed completion response: {e}")))?;

        let text = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        tracing::debug!(
            model = request.model,
            input_tokens = parsed.usage.input_tokens,
            output_tokens = parsed.usage.output_tokens,
            "completion"
        );

        Ok(Completion {
            text,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        })
    }
}
