//! Agent Worker (C9): the loop that drains the execution queue.
//! Ported from `agent_worker.py`'s `AgentWorker` — poll, lease,
//! build an executor, run it, finalize. Owns the lease and the
//! terminal status write; the Agent Executor only owns node-level
//! checkpointing (see `substrate_graph::executor`'s module doc).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use substrate_artifacts::ArtifactStore;
use substrate_core::{CancellationSignal, DurableStore, Result, RowStatus, SubstrateError};
use substrate_events::EventHub;
use substrate_graph::{AgentExecutor, GraphDefinition, NodeRegistry};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

const LEASE_TTL_SECS: i64 = 600;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// External collaborator: resolves an `agent_id` to the graph it
/// should run plus the node implementations it needs. Grounded on
/// `agent_worker.py`'s `_load_agent_config` / `AgentLoader`, except the
/// registry is carried alongside the definition here rather than being
/// a single process-wide global, since a Rust node registry is typed
/// per set of implementations an agent actually uses.
#[async_trait]
pub trait AgentConfigLoader: Send + Sync {
    async fn load(&self, agent_id: &str) -> Result<Option<(GraphDefinition, NodeRegistry)>>;
}

pub struct AgentWorker {
    store: Arc<DurableStore>,
    events: Arc<EventHub>,
    artifacts: Arc<dyn ArtifactStore>,
    config_loader: Arc<dyn AgentConfigLoader>,
    lease_token: String,
    running: AsyncMutex<HashMap<Uuid, CancellationSignal>>,
}

impl AgentWorker {
    pub fn new(
        store: Arc<DurableStore>,
        events: Arc<EventHub>,
        artifacts: Arc<dyn ArtifactStore>,
        config_loader: Arc<dyn AgentConfigLoader>,
    ) -> Self {
        Self {
            store,
            events,
            artifacts,
            config_loader,
            lease_token: Uuid::new_v4().to_string(),
            running: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Main loop: poll, lease, execute, finalize. Runs until
    /// `shutdown` fires; a single leased execution always runs to
    /// completion first.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        tracing::info!(lease_token = %self.lease_token, "agent worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.try_run_once().await {
                Ok(true) => continue,
                Ok(false) => {
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(err) => {
                    tracing::error!(%err, "agent worker poll error");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
        tracing::info!("agent worker stopped");
    }

    /// Lease and run a single execution. Returns `Ok(true)` if one was
    /// leased (so the caller should poll again immediately), `Ok(false)`
    /// if the queue was empty.
    async fn try_run_once(&self) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let store = self.store.clone();
        let lease_token = self.lease_token.clone();
        let leased = tokio::task::spawn_blocking(move || store.lease_next_execution(&lease_token, LEASE_TTL_SECS, now))
            .await
            .expect("lease task panicked")?;

        let Some(task) = leased else {
            return Ok(false);
        };

        tracing::info!(execution_id = %task.id, agent_id = %task.agent_id, "agent worker leased execution");

        let cancellation = CancellationSignal::new();
        self.running.lock().await.insert(task.id, cancellation.clone());

        let outcome = self.run_execution(task.id, &task.agent_id, cancellation).await;
        self.running.lock().await.remove(&task.id);

        let completed_at = chrono::Utc::now().timestamp();
        let (status, final_result, error_log) = match outcome {
            Ok(final_result) => (RowStatus::Completed, Some(final_result), None),
            Err(SubstrateError::Canceled) => (RowStatus::Canceled, None, None),
            Err(err) => (RowStatus::Failed, None, Some(err.to_string())),
        };

        self.store.finalize_execution(
            task.id,
            &self.lease_token,
            status,
            completed_at,
            final_result.as_ref(),
            error_log.as_deref(),
        )?;
        self.events
            .publish(
                &format!("execution:{}", task.id),
                serde_json::json!({"type": "execution_finished", "status": status.as_str()}),
            )
            .await;
        tracing::info!(execution_id = %task.id, status = status.as_str(), "agent worker finalized execution");

        Ok(true)
    }

    async fn run_execution(
        &self,
        execution_id: Uuid,
        agent_id: &str,
        cancellation: CancellationSignal,
    ) -> Result<serde_json::Value> {
        let Some((definition, registry)) = self.config_loader.load(agent_id).await? else {
            return Err(SubstrateError::InvalidInput(format!("agent config not found: {agent_id}")));
        };

        let seed = self
            .store
            .latest_completed_node_event(execution_id, substrate_core::INPUT_START_NODE_ID)?
            .and_then(|e| e.intermediate_output)
            .unwrap_or(serde_json::Value::Null);

        let mut executor = AgentExecutor::new(
            execution_id,
            definition,
            registry,
            self.store.clone(),
            self.artifacts.clone(),
            self.events.clone(),
            cancellation,
        );
        let state = executor.run(seed).await?;
        Ok(serde_json::json!({"vars": state.vars, "nodes": state.nodes}))
    }

    /// Signal cancellation for a currently-running execution. A no-op
    /// if it isn't running on this worker (e.g. already finished, or
    /// leased elsewhere).
    pub async fn cancel_execution(&self, execution_id: Uuid) {
        if let Some(signal) = self.running.lock().await.get(&execution_id) {
            signal.set();
            tracing::info!(%execution_id, "cancel requested for running execution");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use substrate_artifacts::InMemoryArtifactStore;
    use substrate_core::{AgingConfig, Corridors, EnqueueService, PriorityPolicy, TaskSource};
    use substrate_graph::{NodeContext, NodeImplementation, NodeOutput};

    struct EchoNode;

    #[async_trait]
    impl NodeImplementation for EchoNode {
        async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput> {
            Ok(NodeOutput::from_value(serde_json::json!({"echoed": ctx.get("value").cloned()})))
        }
    }

    struct StaticLoader;

    #[async_trait]
    impl AgentConfigLoader for StaticLoader {
        async fn load(&self, agent_id: &str) -> Result<Option<(GraphDefinition, NodeRegistry)>> {
            if agent_id != "echo-agent" {
                return Ok(None);
            }
            let definition: GraphDefinition = serde_json::from_value(serde_json::json!({
                "nodes": [
                    {"id": "input_start", "type": "input_start", "config": {}, "input_map": {}, "output_map": {}, "secrets": {}},
                    {"id": "echo", "type": "echo", "config": {}, "input_map": {"value": "var:input"}, "output_map": {}, "secrets": {}}
                ],
                "edges": [
                    {"type": "plain", "source": "input_start", "target": "echo"}
                ],
                "variables": []
            })).unwrap();
            let mut registry = NodeRegistry::new();
            registry.register("input_start", Arc::new(EchoNode));
            registry.register("echo", Arc::new(EchoNode));
            Ok(Some((definition, registry)))
        }
    }

    #[tokio::test]
    async fn worker_runs_one_execution_to_completion() {
        let store = Arc::new(DurableStore::open_in_memory().unwrap());
        let events = Arc::new(EventHub::new());
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(InMemoryArtifactStore::new());
        let policy = PriorityPolicy::new(Corridors::default(), AgingConfig::default());
        let enqueue = EnqueueService::new(&store, &policy);
        let execution_id = enqueue
            .enqueue_execution("echo-agent", serde_json::json!({"input": 42}), TaskSource::ManualRun, None, None)
            .unwrap();

        let worker = AgentWorker::new(store.clone(), events, artifacts, Arc::new(StaticLoader));
        let ran = worker.try_run_once().await.unwrap();
        assert!(ran);

        let row = store.get_execution(execution_id).unwrap().unwrap();
        assert_eq!(row.status, RowStatus::Completed);
        assert!(row.final_result.is_some());
    }

    #[tokio::test]
    async fn empty_queue_returns_false() {
        let store = Arc::new(DurableStore::open_in_memory().unwrap());
        let events = Arc::new(EventHub::new());
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(InMemoryArtifactStore::new());
        let worker = AgentWorker::new(store, events, artifacts, Arc::new(StaticLoader));
        assert!(!worker.try_run_once().await.unwrap());
    }
}
