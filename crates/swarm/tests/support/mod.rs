//! Shared test doubles: an in-memory code host, a scripted LLM, and payload
//! builders for webhook events.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use swarm::config::Settings;
use swarm::coordination::FileLockRegistry;
use swarm::github::{CodeHost, IssueRef, PrFile, PullRequestRef};
use swarm::llm::{Completion, CompletionRequest, LlmClient};
use swarm::router::{TaskRouter, WebhookPayload};
use swarm::state_machine::StateMachine;
use swarm::store::{MemoryStore, Store};
use swarm_core::Result;
use tokio::sync::Mutex;

pub const REPO: &str = "owner/repo";

/// Records every outbound call; answers with canned data
#[derive(Default)]
pub struct MockHost {
    pub comments: Mutex<Vec<(String, u64, String)>>,
    pub labels: Mutex<Vec<(String, u64, String)>>,
    pub created_issues: Mutex<Vec<(String, String)>>,
    pub files: Mutex<HashMap<String, String>>,
    pub prs: Mutex<Vec<(String, String)>>,
    pub reviews: Mutex<Vec<(String, u64, String)>>,
    pub check_runs: Mutex<Vec<(String, String)>>,
    next_pr: AtomicU64,
    next_issue: AtomicU64,
    pub fail_pr_creation: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl CodeHost for MockHost {
    async fn create_issue_comment(&self, repo: &str, issue_number: u64, body: &str) -> Result<()> {
        self.comments
            .lock()
            .await
            .push((repo.to_string(), issue_number, body.to_string()));
        Ok(())
    }

    async fn add_labels(&self, repo: &str, issue_number: u64, labels: &[String]) -> Result<()> {
        let mut held = self.labels.lock().await;
        for label in labels {
            held.push((repo.to_string(), issue_number, label.clone()));
        }
        Ok(())
    }

    async fn remove_label(&self, repo: &str, issue_number: u64, label: &str) -> Result<()> {
        self.labels
            .lock()
            .await
            .retain(|(r, n, l)| !(r == repo && *n == issue_number && l == label));
        Ok(())
    }

    async fn issue_labels(&self, repo: &str, issue_number: u64) -> Result<Vec<String>> {
        Ok(self
            .labels
            .lock()
            .await
            .iter()
            .filter(|(r, n, _)| r == repo && *n == issue_number)
            .map(|(_, _, l)| l.clone())
            .collect())
    }

    async fn create_pull_request(
        &self,
        repo: &str,
        _title: &str,
        _body: &str,
        head: &str,
        _base: &str,
    ) -> Result<PullRequestRef> {
        if self.fail_pr_creation.load(Ordering::SeqCst) {
            return Err(swarm_core::Error::RemoteApi(
                "branch does not exist".to_string(),
            ));
        }
        let number = 100 + self.next_pr.fetch_add(1, Ordering::SeqCst);
        self.prs.lock().await.push((repo.to_string(), head.to_string()));
        Ok(PullRequestRef {
            number,
            html_url: format!("https://example.test/{repo}/pull/{number}"),
        })
    }

    async fn create_pr_review(&self, repo: &str, pr_number: u64, body: &str) -> Result<()> {
        self.reviews
            .lock()
            .await
            .push((repo.to_string(), pr_number, body.to_string()));
        Ok(())
    }

    async fn pr_files(&self, _repo: &str, _pr_number: u64) -> Result<Vec<PrFile>> {
        Ok(vec![PrFile {
            filename: "src/lib.rs".to_string(),
            patch: Some("@@ -1 +1 @@\n-old\n+new".to_string()),
        }])
    }

    async fn create_issue(
        &self,
        repo: &str,
        title: &str,
        _body: &str,
        _labels: &[String],
    ) -> Result<IssueRef> {
        let number = 1000 + self.next_issue.fetch_add(1, Ordering::SeqCst);
        self.created_issues
            .lock()
            .await
            .push((repo.to_string(), title.to_string()));
        Ok(IssueRef {
            number,
            html_url: format!("https://example.test/{repo}/issues/{number}"),
        })
    }

    async fn default_branch(&self, _repo: &str) -> Result<String> {
        Ok("main".to_string())
    }

    async fn branch_sha(&self, _repo: &str, _branch: &str) -> Result<String> {
        Ok("abc123".to_string())
    }

    async fn file_content(
        &self,
        _repo: &str,
        path: &str,
        _branch: Option<&str>,
    ) -> Result<Option<String>> {
        Ok(self.files.lock().await.get(path).cloned())
    }

    async fn put_file(
        &self,
        _repo: &str,
        path: &str,
        content: &str,
        _message: &str,
        _branch: Option<&str>,
    ) -> Result<()> {
        self.files
            .lock()
            .await
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn create_check_run(&self, repo: &str, _head_sha: &str, name: &str) -> Result<u64> {
        self.check_runs
            .lock()
            .await
            .push((repo.to_string(), name.to_string()));
        Ok(1)
    }

    async fn complete_check_run(
        &self,
        _repo: &str,
        _check_run_id: u64,
        _conclusion: &str,
    ) -> Result<()> {
        Ok(())
    }
}

/// Answers prompts by shape, so pipelines see plausible agent output
pub struct ScriptedLlm;

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion> {
        let text = if request.prompt.contains("implementation complexity") {
            "standard".to_string()
        } else if request.prompt.contains("predict which files") {
            "src/lib.rs\nsrc/parser.rs".to_string()
        } else if request.prompt.contains("Create an implementation plan") {
            "## Summary\nRework the parser.\n\n## Files to modify\n- src/parser.rs".to_string()
        } else if request.prompt.contains("Analyze this feature request") {
            "## Executive Summary\nTwo pieces.\n\n## Sub-tasks\n\n### First piece\n\
             Do the first half.\nComplexity: standard\nDependencies: None\n\n\
             ## Execution Order\nFirst piece first."
                .to_string()
        } else if request.prompt.contains("Review this pull request") {
            "Looks correct; one nit on naming.".to_string()
        } else if request.prompt.contains("Address these review comments") {
            "yes - rename the variable as requested".to_string()
        } else {
            "Draft document body.".to_string()
        };
        Ok(Completion {
            text,
            input_tokens: 120,
            output_tokens: 40,
        })
    }
}

/// Everything a scenario needs, wired over one in-memory store
pub struct Rig {
    pub router: TaskRouter,
    pub state: Arc<StateMachine>,
    pub locks: Arc<FileLockRegistry>,
    pub host: Arc<MockHost>,
    pub settings: Arc<Settings>,
}

pub fn rig() -> Rig {
    let settings = Arc::new(Settings {
        github_webhook_secret: "secret".to_string(),
        ..Settings::default()
    });
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let state = Arc::new(StateMachine::new(store.clone()));
    let locks = Arc::new(FileLockRegistry::new(
        store,
        settings.file_lock_ttl_seconds,
    ));
    let host = Arc::new(MockHost::default());
    let router = TaskRouter::new(
        settings.clone(),
        state.clone(),
        locks.clone(),
        host.clone(),
        Arc::new(ScriptedLlm),
    );
    Rig {
        router,
        state,
        locks,
        host,
        settings,
    }
}

pub fn issue_event(action: &str, number: u64, title: &str, body: &str, labels: &[&str]) -> WebhookPayload {
    let labels: Vec<_> = labels.iter().map(|l| json!({"name": l})).collect();
    serde_json::from_value(json!({
        "action": action,
        "repository": {"full_name": REPO},
        "issue": {"number": number, "title": title, "body": body, "labels": labels}
    }))
    .expect("issue payload")
}

pub fn comment_event(number: u64, body: &str, author: &str) -> WebhookPayload {
    serde_json::from_value(json!({
        "action": "created",
        "repository": {"full_name": REPO},
        "issue": {"number": number, "title": "tracked issue", "body": "context", "labels": []},
        "comment": {"body": body, "user": {"login": author}}
    }))
    .expect("comment payload")
}

pub fn pr_closed_event(branch: &str, merged: bool) -> WebhookPayload {
    serde_json::from_value(json!({
        "action": "closed",
        "repository": {"full_name": REPO},
        "pull_request": {"merged": merged, "head": {"ref": branch}}
    }))
    .expect("pr payload")
}
