use std::sync::Arc;

use anyhow::Context;
use swarm::config::Settings;
use swarm::coordination::FileLockRegistry;
use swarm::github::GitHubClient;
use swarm::llm::AnthropicClient;
use swarm::router::TaskRouter;
use swarm::server::{app, AppState};
use swarm::state_machine::StateMachine;
use swarm::store::RedisStore;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Arc::new(Settings::from_env()?);

    let filter = EnvFilter::try_new(settings.log_level.to_lowercase())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("starting agent swarm orchestrator");

    let store = Arc::new(RedisStore::new(&settings.redis_url)?);
    let state_machine = Arc::new(StateMachine::new(store.clone()));
    let locks = Arc::new(FileLockRegistry::new(
        store,
        settings.file_lock_ttl_seconds,
    ));
    let host = Arc::new(GitHubClient::new(&settings)?);
    let llm = Arc::new(AnthropicClient::new(&settings.anthropic_api_key));

    let router = TaskRouter::new(
        settings.clone(),
        state_machine.clone(),
        locks,
        host,
        llm,
    );

    let state = AppState {
        settings: settings.clone(),
        router,
        state_machine,
    };

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("binding {}", settings.bind_addr))?;
    tracing::info!(addr = %settings.bind_addr, "listening");
    axum::serve(listener, app(state)).await?;

    Ok(())
}
