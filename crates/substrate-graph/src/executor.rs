//! Agent Executor (C8) — the hard core.
//!
//! Walks a [`GraphDefinition`] node by node starting at its single
//! `input_start` entry point, following plain edges or a conditional
//! edge's router, checkpointing each node's output before advancing.
//! Ported from `agent_executor.py`'s `AgentExecutor`, split along one
//! seam: this type owns node execution, checkpointing, and replay; it
//! does not write the execution row's terminal status or lease — that
//! is the Agent Worker's job (so a lease can be attributed to exactly
//! one caller, not buried inside the executor).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use substrate_artifacts::{should_offload, ArtifactStore, DEFAULT_OFFLOAD_THRESHOLD_BYTES};
use substrate_core::{CancellationSignal, DurableStore, NodeEventStatus, Result, SubstrateError};
use substrate_events::EventHub;
use uuid::Uuid;

use crate::definition::{EdgeDef, GraphDefinition, NodeDef, VariableStorage};
use crate::registry::{NodeContext, NodeRegistry};
use crate::router;
use crate::state::AgentState;

pub struct AgentExecutor {
    execution_id: Uuid,
    definition: GraphDefinition,
    registry: NodeRegistry,
    store: Arc<DurableStore>,
    artifacts: Arc<dyn ArtifactStore>,
    events: Arc<EventHub>,
    cancellation: CancellationSignal,
    secrets_in_memory: HashMap<String, String>,
}

impl AgentExecutor {
    pub fn new(
        execution_id: Uuid,
        definition: GraphDefinition,
        registry: NodeRegistry,
        store: Arc<DurableStore>,
        artifacts: Arc<dyn ArtifactStore>,
        events: Arc<EventHub>,
        cancellation: CancellationSignal,
    ) -> Self {
        Self {
            execution_id,
            definition,
            registry,
            store,
            artifacts,
            events,
            cancellation,
            secrets_in_memory: HashMap::new(),
        }
    }

    fn topic(&self) -> String {
        format!("execution:{}", self.execution_id)
    }

    /// Validate, replay any prior checkpoints, then walk the graph to
    /// completion (or cancellation). Returns the final `vars`/`nodes`
    /// state; the caller decides what to persist as `final_result`.
    pub async fn run(&mut self, input: Value) -> Result<AgentState> {
        self.definition
            .validate(&self.registry)
            .map_err(|e| SubstrateError::InvalidInput(e.to_string()))?;

        let mut state = self.replay_execution(input).await?;

        let mut current = self.definition.entry_point().to_string();
        loop {
            state = self.node_wrapper(&current, state).await?;

            let edges = self.definition.edges_from(&current);
            let next = match edges.as_slice() {
                [] => None,
                [EdgeDef::Plain { target, .. }] => Some(target.clone()),
                [EdgeDef::Conditional {
                    condition,
                    target,
                    fallback_target,
                    ..
                }] => {
                    let actual = state.vars.get(&condition.variable).cloned().unwrap_or(Value::Null);
                    Some(router::route(condition, &actual, target, fallback_target).to_string())
                }
                _ => {
                    return Err(SubstrateError::InvalidInput(format!(
                        "node {current} has more than one outgoing edge; graphs must route through a single conditional edge per node"
                    )))
                }
            };

            match next {
                Some(next_id) => current = next_id,
                None => break,
            }
        }

        Ok(state)
    }

    /// Steps A-F for a single node.
    async fn node_wrapper(&mut self, node_id: &str, mut state: AgentState) -> Result<AgentState> {
        // A. Cancellation check.
        if self.cancellation.is_set() {
            tracing::warn!(node_id, "node cancelled before start");
            return Err(SubstrateError::Canceled);
        }

        let node = self
            .definition
            .node(node_id)
            .expect("node_id comes from validated edges/entry point")
            .clone();

        // B. Recovery check (idempotency): a prior run already
        // completed this node, reapply its output without re-running it.
        if let Some(cached) = self.store.latest_completed_node_event(self.execution_id, node_id)? {
            tracing::info!(node_id, "node already completed, recovering from cache");
            let stored = cached.intermediate_output.unwrap_or(Value::Null);
            let rehydrated = self.rehydrate_output(stored).await?;
            let output_refs = self.offload_output_map(&node, &rehydrated).await?;
            state.apply_node_output(&node, node_id, rehydrated, output_refs);
            self.events
                .publish(&self.topic(), serde_json::json!({"type": "node_recovered", "node_id": node_id}))
                .await;
            return Ok(state);
        }

        // C. Collect inputs.
        let params = self.build_execution_context(&node, &state)?;

        // D. Execute.
        self.store.append_node_event(
            self.execution_id,
            node_id,
            NodeEventStatus::Started,
            chrono::Utc::now().timestamp(),
            None,
            None,
        )?;
        self.events
            .publish(&self.topic(), serde_json::json!({"type": "node_start", "node_id": node_id}))
            .await;

        let implementation = self.registry.get(&node.node_type).expect("validated by pre-flight");
        let ctx = NodeContext {
            params,
            cancellation: self.cancellation.clone(),
        };
        let node_result = match implementation.execute(ctx).await {
            Ok(result) => result,
            Err(SubstrateError::Canceled) => {
                tracing::warn!(node_id, "node cancelled during execution");
                return Err(SubstrateError::Canceled);
            }
            Err(err) => {
                tracing::error!(node_id, %err, "node failed");
                self.store.append_node_event(
                    self.execution_id,
                    node_id,
                    NodeEventStatus::Failed,
                    chrono::Utc::now().timestamp(),
                    None,
                    Some(&err.to_string()),
                )?;
                self.events
                    .publish(
                        &self.topic(),
                        serde_json::json!({"type": "node_error", "node_id": node_id, "error": err.to_string()}),
                    )
                    .await;
                return Err(err);
            }
        };

        // E. Process output & persist.
        let raw_output = node_result.as_json();
        let output_for_event = if should_offload(&raw_output, DEFAULT_OFFLOAD_THRESHOLD_BYTES) {
            tracing::info!(node_id, "node output large, offloading to artifact store");
            let uri = self
                .artifacts
                .save(self.execution_id, node_id, &raw_output)
                .await
                .map_err(SubstrateError::from)?;
            serde_json::json!({"__ref": uri})
        } else {
            raw_output.clone()
        };
        self.secrets_in_memory.extend(node_result.secrets.clone());

        self.store.append_node_event(
            self.execution_id,
            node_id,
            NodeEventStatus::Completed,
            chrono::Utc::now().timestamp(),
            Some(&output_for_event),
            None,
        )?;
        self.events
            .publish(
                &self.topic(),
                serde_json::json!({"type": "node_finish", "node_id": node_id, "status": "COMPLETED"}),
            )
            .await;

        // F. Update state.
        let output_refs = self.offload_output_map(&node, &raw_output).await?;
        state.apply_node_output(&node, node_id, raw_output, output_refs);
        Ok(state)
    }

    /// Step C: resolve `input_map`, overlay `config`, add secrets and
    /// the cancellation signal.
    fn build_execution_context(
        &self,
        node: &NodeDef,
        state: &AgentState,
    ) -> Result<HashMap<String, Value>> {
        let mut context: HashMap<String, Value> = match &node.config {
            Value::Object(map) => map.clone().into_iter().collect(),
            Value::Null => HashMap::new(),
            other => HashMap::from([("config".to_string(), other.clone())]),
        };

        for (target_key, source_expr) in &node.input_map {
            let value = state.resolve_slot(source_expr)?;
            context.insert(target_key.clone(), value);
        }

        for (context_key, secret_name) in &node.secrets {
            if let Some(secret) = self.secrets_in_memory.get(secret_name) {
                context.insert(context_key.clone(), Value::String(secret.clone()));
            }
        }

        Ok(context)
    }

    /// Load a value, dereferencing an `{"__ref": uri}` wrapper through
    /// the artifact store if present.
    async fn rehydrate_output(&self, value: Value) -> Result<Value> {
        if let Value::Object(ref map) = value {
            if let Some(Value::String(uri)) = map.get("__ref") {
                return self.artifacts.load(uri).await.map_err(SubstrateError::from);
            }
        }
        Ok(value)
    }

    /// For each `output_map` variable declared `storage: artifact`
    /// whose resolved value crosses the offload threshold, persist it
    /// and return `{var_name: {"__ref": uri}}`; other variables are
    /// left for the caller to read inline from `raw_output`.
    async fn offload_output_map(
        &self,
        node: &NodeDef,
        raw_output: &Value,
    ) -> Result<HashMap<String, Value>> {
        let mut refs = HashMap::new();
        for (var_name, output_key) in &node.output_map {
            let Some(var_def) = self.definition.variable(var_name) else {
                continue;
            };
            if var_def.storage != VariableStorage::Artifact {
                continue;
            }
            let value = raw_output.get(output_key).cloned().unwrap_or(Value::Null);
            if should_offload(&value, DEFAULT_OFFLOAD_THRESHOLD_BYTES) {
                let uri = self
                    .artifacts
                    .save(self.execution_id, &node.id, &value)
                    .await
                    .map_err(SubstrateError::from)?;
                refs.insert(var_name.clone(), serde_json::json!({"__ref": uri}));
            }
        }
        Ok(refs)
    }

    /// Reconstruct state from every COMPLETED node event recorded so
    /// far, in commit order, applying each the same way a live run
    /// would. Used both for crash recovery and for a no-op replay on a
    /// fresh execution (whose only completed event is the seed
    /// `input_start`).
    async fn replay_execution(&self, input: Value) -> Result<AgentState> {
        let events = self.store.execution_events(self.execution_id)?;
        let mut state = AgentState::from_input(input);

        let completed = events
            .into_iter()
            .filter(|e| e.status == NodeEventStatus::Completed);

        let mut replayed = 0usize;
        for event in completed {
            let stored = event.intermediate_output.unwrap_or(Value::Null);
            let rehydrated = self.rehydrate_output(stored).await?;
            let empty_node = NodeDef {
                id: event.node_id.clone(),
                node_type: String::new(),
                config: Value::Null,
                input_map: HashMap::new(),
                output_map: HashMap::new(),
                secrets: HashMap::new(),
            };
            let node = self.definition.node(&event.node_id).unwrap_or(&empty_node);
            let output_refs = self.offload_output_map(node, &rehydrated).await?;
            state.apply_node_output(node, &event.node_id, rehydrated, output_refs);
            replayed += 1;
        }
        tracing::info!(replayed, "replayed execution state from node events");
        Ok(state)
    }
}
