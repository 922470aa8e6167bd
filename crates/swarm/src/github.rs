//! GitHub API client - checks, comments, labels, PRs
//!
//! Authenticates as a GitHub App: a short-lived RS256 JWT buys a per-repo
//! installation token, cached until shortly before expiry. Racing refreshes
//! may fetch a duplicate token; the last writer wins and both tokens work.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use swarm_core::{Error, Result};
use tokio::sync::Mutex;

use crate::config::Settings;

const DEFAULT_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "agent-swarm-orchestrator";
// Refresh installation tokens a minute before GitHub expires them
const TOKEN_SKEW_SECONDS: i64 = 60;

/// Reference to a created pull request
#[derive(Debug, Clone)]
pub struct PullRequestRef {
    /// PR number
    pub number: u64,
    /// Browser URL
    pub html_url: String,
}

/// Reference to a created issue
#[derive(Debug, Clone)]
pub struct IssueRef {
    /// Issue number
    pub number: u64,
    /// Browser URL
    pub html_url: String,
}

/// One changed file in a pull request
#[derive(Debug, Clone, Deserialize)]
pub struct PrFile {
    /// Path within the repository
    pub filename: String,
    /// Unified diff hunk, when GitHub provides one
    #[serde(default)]
    pub patch: Option<String>,
}

/// Code-hosting operations the orchestrator depends on
#[async_trait]
pub trait CodeHost: Send + Sync {
    /// Comment on an issue or PR
    async fn create_issue_comment(&self, repo: &str, issue_number: u64, body: &str) -> Result<()>;

    /// Add labels to an issue or PR
    async fn add_labels(&self, repo: &str, issue_number: u64, labels: &[String]) -> Result<()>;

    /// Remove a label; absent labels are not an error
    async fn remove_label(&self, repo: &str, issue_number: u64, label: &str) -> Result<()>;

    /// Current labels on an issue
    async fn issue_labels(&self, repo: &str, issue_number: u64) -> Result<Vec<String>>;

    /// Open a pull request
    async fn create_pull_request(
        &self,
        repo: &str,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<PullRequestRef>;

    /// Post a PR review comment
    async fn create_pr_review(&self, repo: &str, pr_number: u64, body: &str) -> Result<()>;

    /// Files changed in a PR
    async fn pr_files(&self, repo: &str, pr_number: u64) -> Result<Vec<PrFile>>;

    /// Open a new issue
    async fn create_issue(
        &self,
        repo: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<IssueRef>;

    /// Default branch of the repository
    async fn default_branch(&self, repo: &str) -> Result<String>;

    /// Tip SHA of a branch
    async fn branch_sha(&self, repo: &str, branch: &str) -> Result<String>;

    /// Read a file, if it exists
    async fn file_content(&self, repo: &str, path: &str, branch: Option<&str>) -> Result<Option<String>>;

    /// Create or update a file
    async fn put_file(
        &self,
        repo: &str,
        path: &str,
        content: &str,
        message: &str,
        branch: Option<&str>,
    ) -> Result<()>;

    /// Create a check run on a commit, returning its id
    async fn create_check_run(&self, repo: &str, head_sha: &str, name: &str) -> Result<u64>;

    /// Complete a check run with a conclusion
    async fn complete_check_run(&self, repo: &str, check_run_id: u64, conclusion: &str) -> Result<()>;

    /// Set the `agent:*` state label, removing any other agent labels
    async fn set_agent_label(&self, repo: &str, issue_number: u64, state_label: &str) -> Result<()> {
        let current = self.issue_labels(repo, issue_number).await?;
        for label in &current {
            if label.starts_with("agent:") && label != state_label {
                self.remove_label(repo, issue_number, label).await?;
            }
        }
        if !current.iter().any(|l| l == state_label) {
            self.add_labels(repo, issue_number, &[state_label.to_string()])
                .await?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// GitHub client using App authentication
pub struct GitHubClient {
    http: reqwest::Client,
    app_id: String,
    key: EncodingKey,
    tokens: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
    api_base: String,
}

impl GitHubClient {
    /// Create a client from the App credentials in `settings`.
    ///
    /// # Errors
    ///
    /// Returns `RemoteApi` if the private key is not valid RSA PEM.
    pub fn new(settings: &Arc<Settings>) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(settings.github_app_private_key.as_bytes())
            .map_err(|e| Error::RemoteApi(format!("invalid GitHub App key: {e}")))?;
        Ok(Self {
            http: reqwest::Client::new(),
            app_id: settings.github_app_id.clone(),
            key,
            tokens: Mutex::new(HashMap::new()),
            api_base: DEFAULT_API_BASE.to_string(),
        })
    }

    /// Point the client at a different API host, for tests
    #[must_use]
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.to_string();
        self
    }

    fn app_jwt(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - 60,
            exp: now + 600,
            iss: self.app_id.clone(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| Error::RemoteApi(format!("JWT signing failed: {e}")))
    }

    async fn installation_token(&self, repo: &str) -> Result<String> {
        {
            let tokens = self.tokens.lock().await;
            if let Some((token, expires)) = tokens.get(repo) {
                if Utc::now() + Duration::seconds(TOKEN_SKEW_SECONDS) < *expires {
                    return Ok(token.clone());
                }
            }
        }

        let jwt = self.app_jwt()?;
        let installation: Value = self
            .send_json(
                self.http
                    .get(format!("{}/repos/{repo}/installation", self.api_base))
                    .bearer_auth(&jwt),
            )
            .await?;
        let installation_id = installation
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::RemoteApi("installation lookup missing id".to_string()))?;

        let granted: Value = self
            .send_json(
                self.http
                    .post(format!(
                        "{}/app/installations/{installation_id}/access_tokens",
                        self.api_base
                    ))
                    .bearer_auth(&jwt),
            )
            .await?;
        let token = granted
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::RemoteApi("token grant missing token".to_string()))?
            .to_string();
        let expires = granted
            .get("expires_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map_or_else(
                || Utc::now() + Duration::minutes(50),
                |dt| dt.with_timezone(&Utc),
            );

        self.tokens
            .lock()
            .await
            .insert(repo.to_string(), (token.clone(), expires));
        Ok(token)
    }

    async fn send_json(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = request
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|e| Error::RemoteApi(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::RemoteApi(format!("GitHub returned {status}: {detail}")));
        }
        if response.content_length() == Some(0) {
            return Ok(Value::Null);
        }
        response
            .json()
            .await
            .map_err(|e| Error::RemoteApi(format!("malformed GitHub response: {e}")))
    }

    /// Authenticated request against `/repos/{repo}{path}`. Returns the
    /// status alongside the body so callers can branch on 404.
    async fn repo_request(
        &self,
        method: Method,
        repo: &str,
        path: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, Value)> {
        let token = self.installation_token(repo).await?;
        let mut request = self
            .http
            .request(method, format!("{}/repos/{repo}{path}", self.api_base))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::RemoteApi(format!("request failed: {e}")))?;
        let status = response.status();
        let value = if response.content_length() == Some(0) {
            Value::Null
        } else {
            response.json().await.unwrap_or(Value::Null)
        };
        Ok((status, value))
    }

    async fn repo_json(
        &self,
        method: Method,
        repo: &str,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        let (status, value) = self.repo_request(method, repo, path, body).await?;
        if status.is_success() {
            Ok(value)
        } else {
            Err(Error::RemoteApi(format!(
                "GitHub returned {status} for {path}: {value}"
            )))
        }
    }
}

#[async_trait]
impl CodeHost for GitHubClient {
    async fn create_issue_comment(&self, repo: &str, issue_number: u64, body: &str) -> Result<()> {
        self.repo_json(
            Method::POST,
            repo,
            &format!("/issues/{issue_number}/comments"),
            Some(json!({ "body": body })),
        )
        .await?;
        Ok(())
    }

    async fn add_labels(&self, repo: &str, issue_number: u64, labels: &[String]) -> Result<()> {
        self.repo_json(
            Method::POST,
            repo,
            &format!("/issues/{issue_number}/labels"),
            Some(json!({ "labels": labels })),
        )
        .await?;
        Ok(())
    }

    async fn remove_label(&self, repo: &str, issue_number: u64, label: &str) -> Result<()> {
        let (status, value) = self
            .repo_request(
                Method::DELETE,
                repo,
                &format!("/issues/{issue_number}/labels/{label}"),
                None,
            )
            .await?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Error::RemoteApi(format!(
                "GitHub returned {status} removing label: {value}"
            )))
        }
    }

    async fn issue_labels(&self, repo: &str, issue_number: u64) -> Result<Vec<String>> {
        let value = self
            .repo_json(
                Method::GET,
                repo,
                &format!("/issues/{issue_number}/labels"),
                None,
            )
            .await?;
        Ok(value
            .as_array()
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|l| l.get("name").and_then(Value::as_str))
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_pull_request(
        &self,
        repo: &str,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<PullRequestRef> {
        let value = self
            .repo_json(
                Method::POST,
                repo,
                "/pulls",
                Some(json!({ "title": title, "body": body, "head": head, "base": base })),
            )
            .await?;
        Ok(PullRequestRef {
            number: value.get("number").and_then(Value::as_u64).unwrap_or(0),
            html_url: value
                .get("html_url")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    async fn create_pr_review(&self, repo: &str, pr_number: u64, body: &str) -> Result<()> {
        self.repo_json(
            Method::POST,
            repo,
            &format!("/pulls/{pr_number}/reviews"),
            Some(json!({ "body": body, "event": "COMMENT" })),
        )
        .await?;
        Ok(())
    }

    async fn pr_files(&self, repo: &str, pr_number: u64) -> Result<Vec<PrFile>> {
        let value = self
            .repo_json(Method::GET, repo, &format!("/pulls/{pr_number}/files"), None)
            .await?;
        serde_json::from_value(value)
            .map_err(|e| Error::RemoteApi(format!("malformed PR file list: {e}")))
    }

    async fn create_issue(
        &self,
        repo: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<IssueRef> {
        let value = self
            .repo_json(
                Method::POST,
                repo,
                "/issues",
                Some(json!({ "title": title, "body": body, "labels": labels })),
            )
            .await?;
        Ok(IssueRef {
            number: value.get("number").and_then(Value::as_u64).unwrap_or(0),
            html_url: value
                .get("html_url")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    async fn default_branch(&self, repo: &str) -> Result<String> {
        let value = self.repo_json(Method::GET, repo, "", None).await?;
        Ok(value
            .get("default_branch")
            .and_then(Value::as_str)
            .unwrap_or("main")
            .to_string())
    }

    async fn branch_sha(&self, repo: &str, branch: &str) -> Result<String> {
        let value = self
            .repo_json(Method::GET, repo, &format!("/git/ref/heads/{branch}"), None)
            .await?;
        value
            .pointer("/object/sha")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| Error::RemoteApi(format!("branch ref for {branch} missing sha")))
    }

    async fn file_content(
        &self,
        repo: &str,
        path: &str,
        branch: Option<&str>,
    ) -> Result<Option<String>> {
        let query = branch.map(|b| format!("?ref={b}")).unwrap_or_default();
        let (status, value) = self
            .repo_request(Method::GET, repo, &format!("/contents/{path}{query}"), None)
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Error::RemoteApi(format!(
                "GitHub returned {status} reading {path}"
            )));
        }

        let Some(encoded) = value.get("content").and_then(Value::as_str) else {
            return Ok(None);
        };
        let stripped: String = encoded.chars().filter(|c| *c != '\n').collect();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(stripped)
            .map_err(|e| Error::RemoteApi(format!("undecodable content for {path}: {e}")))?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| Error::RemoteApi(format!("non-UTF-8 content for {path}: {e}")))
    }

    async fn put_file(
        &self,
        repo: &str,
        path: &str,
        content: &str,
        message: &str,
        branch: Option<&str>,
    ) -> Result<()> {
        // updates need the current blob sha
        let query = branch.map(|b| format!("?ref={b}")).unwrap_or_default();
        let (status, existing) = self
            .repo_request(Method::GET, repo, &format!("/contents/{path}{query}"), None)
            .await?;
        let sha = if status.is_success() {
            existing.get("sha").and_then(Value::as_str).map(ToString::to_string)
        } else {
            None
        };

        let mut body = json!({
            "message": message,
            "content": base64::engine::general_purpose::STANDARD.encode(content),
        });
        if let Some(sha) = sha {
            body["sha"] = Value::String(sha);
        }
        if let Some(branch) = branch {
            body["branch"] = Value::String(branch.to_string());
        }

        self.repo_json(Method::PUT, repo, &format!("/contents/{path}"), Some(body))
            .await?;
        Ok(())
    }

    async fn create_check_run(&self, repo: &str, head_sha: &str, name: &str) -> Result<u64> {
        let value = self
            .repo_json(
                Method::POST,
                repo,
                "/check-runs",
                Some(json!({ "name": name, "head_sha": head_sha, "status": "in_progress" })),
            )
            .await?;
        value
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::RemoteApi("check run missing id".to_string()))
    }

    async fn complete_check_run(
        &self,
        repo: &str,
        check_run_id: u64,
        conclusion: &str,
    ) -> Result<()> {
        self.repo_json(
            Method::PATCH,
            repo,
            &format!("/check-runs/{check_run_id}"),
            Some(json!({
                "status": "completed",
                "conclusion": conclusion,
                "completed_at": Utc::now().to_rfc3339(),
            })),
        )
        .await?;
        Ok(())
    }
}
