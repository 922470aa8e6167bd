//! Configuration management
//!
//! Settings are read once from the environment at startup.

use std::env;

/// Application settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// GitHub App id
    pub github_app_id: String,
    /// GitHub App private key, PEM-encoded
    pub github_app_private_key: String,
    /// Shared secret for webhook signatures
    pub github_webhook_secret: String,
    /// Anthropic API key
    pub anthropic_api_key: String,
    /// Redis connection URL
    pub redis_url: String,
    /// Tracing filter directive
    pub log_level: String,
    /// TTL applied to file locks
    pub file_lock_ttl_seconds: u64,
    /// Ceiling on simultaneous agent executions
    pub max_concurrent_agents: usize,
    /// Warn once a task's estimated cost passes this
    pub cost_alert_threshold_usd: f64,
    /// Model for trivial and analysis work
    pub model_haiku: String,
    /// Default model
    pub model_sonnet: String,
    /// Model for complex planning
    pub model_opus: String,
    /// HTTP listen address
    pub bind_addr: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            github_app_id: String::new(),
            github_app_private_key: String::new(),
            github_webhook_secret: String::new(),
            anthropic_api_key: String::new(),
            redis_url: "redis://localhost:6379".to_string(),
            log_level: "INFO".to_string(),
            file_lock_ttl_seconds: 1800,
            max_concurrent_agents: 3,
            cost_alert_threshold_usd: 10.0,
            model_haiku: "claude-haiku-4-5-20251001".to_string(),
            model_sonnet: "claude-sonnet-4-5-20250929".to_string(),
            model_opus: "claude-opus-4-5-20251101".to_string(),
            bind_addr: "0.0.0.0:8000".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a numeric
    /// variable fails to parse.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut settings = Self {
            github_app_id: required("GITHUB_APP_ID")?,
            github_app_private_key: required("GITHUB_APP_PRIVATE_KEY")?,
            github_webhook_secret: required("GITHUB_WEBHOOK_SECRET")?,
            anthropic_api_key: required("ANTHROPIC_API_KEY")?,
            ..Self::default()
        };

        if let Ok(v) = env::var("REDIS_URL") {
            settings.redis_url = v;
        }
        if let Ok(v) = env::var("LOG_LEVEL") {
            settings.log_level = v;
        }
        if let Ok(v) = env::var("FILE_LOCK_TTL_SECONDS") {
            settings.file_lock_ttl_seconds = v.parse()?;
        }
        if let Ok(v) = env::var("MAX_CONCURRENT_AGENTS") {
            settings.max_concurrent_agents = v.parse()?;
        }
        if let Ok(v) = env::var("COST_ALERT_THRESHOLD_USD") {
            settings.cost_alert_threshold_usd = v.parse()?;
        }
        if let Ok(v) = env::var("MODEL_HAIKU") {
            settings.model_haiku = v;
        }
        if let Ok(v) = env::var("MODEL_SONNET") {
            settings.model_sonnet = v;
        }
        if let Ok(v) = env::var("MODEL_OPUS") {
            settings.model_opus = v;
        }
        if let Ok(v) = env::var("BIND_ADDR") {
            settings.bind_addr = v;
        }

        Ok(settings)
    }
}

fn required(name: &str) -> anyhow::Result<String> {
    env::var(name).map_err(|_| anyhow::anyhow!("missing required environment variable {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.redis_url, "redis://localhost:6379");
        assert_eq!(s.file_lock_ttl_seconds, 1800);
        assert_eq!(s.max_concurrent_agents, 3);
        assert!((s.cost_alert_threshold_usd - 10.0).abs() < f64::EPSILON);
    }
}
