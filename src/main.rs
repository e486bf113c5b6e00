//! substrate-controld — local AI-inference control plane.
//!
//! Boot sequence on `serve`: init tracing, open the durable store, run
//! startup recovery, spawn the aging loop and the agent/inference
//! worker loops, then (with the `server` feature) serve the HTTP/WS
//! surface until shutdown.

mod config;
#[cfg(feature = "server")]
mod http;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use substrate_artifacts::{ArtifactStore, LocalArtifactStore};
use substrate_core::{AgingConfig, Corridors, DurableStore, PriorityPolicy, RecoveryService};
use substrate_events::EventHub;
use substrate_graph::{GraphDefinition, NodeRegistry};
use substrate_workers::{AgentConfigLoader, AgentWorker, InferenceWorker};

use config::Command;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,substrate_controld=debug".into()),
        )
        .init();

    let cli = config::load();

    match cli.command {
        Command::Migrate => {
            let store = DurableStore::open(&cli.db_path).context("opening durable store")?;
            tracing::info!(sqlite_version = %store.sqlite_version(), "schema migrated");
            Ok(())
        }
        Command::Serve { bind_addr } => serve(cli.db_path, cli.artifact_dir, cli.agents_dir, bind_addr).await,
    }
}

async fn serve(db_path: std::path::PathBuf, artifact_dir: std::path::PathBuf, agents_dir: std::path::PathBuf, bind_addr: String) -> Result<()> {
    let store = Arc::new(DurableStore::open(&db_path).context("opening durable store")?);
    RecoveryService::recover(&store).context("startup recovery")?;

    let artifacts: Arc<dyn ArtifactStore> = Arc::new(LocalArtifactStore::new(artifact_dir));
    let events = Arc::new(EventHub::new());
    let priority_policy = Arc::new(PriorityPolicy::new(Corridors::default(), AgingConfig::default()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(substrate_core::run_aging_loop(
        priority_policy.clone(),
        store.clone(),
        shutdown_rx.clone(),
    ));

    let config_loader: Arc<dyn AgentConfigLoader> = Arc::new(DirectoryAgentConfigLoader::new(agents_dir));
    let agent_worker = Arc::new(AgentWorker::new(store.clone(), events.clone(), artifacts.clone(), config_loader));
    let inference_worker = Arc::new(InferenceWorker::new(store.clone(), events.clone(), Arc::new(UnimplementedModelRunner)));

    {
        let agent_worker = agent_worker.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { agent_worker.run(shutdown_rx).await });
    }
    {
        let inference_worker = inference_worker.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { inference_worker.run(shutdown_rx).await });
    }

    run_http_surface(
        bind_addr,
        store,
        priority_policy,
        events,
        artifacts,
        agent_worker,
        inference_worker,
        shutdown_tx,
    )
    .await
}

#[cfg(feature = "server")]
#[allow(clippy::too_many_arguments)]
async fn run_http_surface(
    bind_addr: String,
    store: Arc<DurableStore>,
    priority_policy: Arc<PriorityPolicy>,
    events: Arc<EventHub>,
    artifacts: Arc<dyn ArtifactStore>,
    agent_worker: Arc<AgentWorker>,
    inference_worker: Arc<InferenceWorker>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
) -> Result<()> {
    let state = http::AppState {
        store,
        priority_policy,
        events,
        artifacts,
        agent_worker,
        inference_worker,
        boot_time: std::time::Instant::now(),
    };
    let app = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {bind_addr}"))?;
    tracing::info!(%bind_addr, "substrate-controld listening");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await;
    result.context("http server error")
}

#[cfg(not(feature = "server"))]
#[allow(clippy::too_many_arguments)]
async fn run_http_surface(
    _bind_addr: String,
    _store: Arc<DurableStore>,
    _priority_policy: Arc<PriorityPolicy>,
    _events: Arc<EventHub>,
    _artifacts: Arc<dyn ArtifactStore>,
    _agent_worker: Arc<AgentWorker>,
    _inference_worker: Arc<InferenceWorker>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
) -> Result<()> {
    tracing::info!("server feature disabled, running workers only until ctrl-c");
    tokio::signal::ctrl_c().await.ok();
    let _ = shutdown_tx.send(true);
    Ok(())
}

/// Loads an agent's graph definition from `{agents_dir}/{agent_id}.json`.
/// The returned registry carries the built-in node types
/// (`NodeRegistry::with_builtins`); an embedder wiring in real node
/// implementations (HTTP calls, LLM calls, ...) does so by replacing
/// this loader with one that registers its own types on top, consistent
/// with `agent_worker.py`'s `AgentLoader` reading a config file per
/// agent id.
struct DirectoryAgentConfigLoader {
    agents_dir: std::path::PathBuf,
}

impl DirectoryAgentConfigLoader {
    fn new(agents_dir: std::path::PathBuf) -> Self {
        Self { agents_dir }
    }
}

#[async_trait::async_trait]
impl AgentConfigLoader for DirectoryAgentConfigLoader {
    async fn load(&self, agent_id: &str) -> substrate_core::Result<Option<(GraphDefinition, NodeRegistry)>> {
        let path = self.agents_dir.join(format!("{agent_id}.json"));
        if !Path::new(&path).exists() {
            return Ok(None);
        }
        let raw = tokio::fs::read_to_string(&path).await?;
        let definition: GraphDefinition = serde_json::from_str(&raw)?;
        Ok(Some((definition, NodeRegistry::with_builtins())))
    }
}

/// Placeholder runner until a concrete inference engine is wired in;
/// every call fails loudly rather than silently returning canned text.
struct UnimplementedModelRunner;

#[async_trait::async_trait]
impl substrate_workers::ModelRunner for UnimplementedModelRunner {
    async fn ensure_loaded(&self, model_id: &str) -> substrate_core::Result<()> {
        Err(substrate_core::SubstrateError::DependencyMissing(format!(
            "no model runner configured for {model_id}"
        )))
    }

    async fn unload(&self) -> substrate_core::Result<()> {
        Ok(())
    }

    async fn run_chat(
        &self,
        model_id: &str,
        _messages: &[substrate_workers::ChatMessage],
        _parameters: &serde_json::Value,
        _on_token: &(dyn substrate_workers::TokenSink),
        _cancellation: &substrate_core::CancellationSignal,
    ) -> substrate_core::Result<(substrate_workers::ChatResult, Option<f64>)> {
        Err(substrate_core::SubstrateError::DependencyMissing(format!(
            "no model runner configured for {model_id}"
        )))
    }
}
