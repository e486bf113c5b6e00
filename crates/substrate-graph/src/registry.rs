//! Node Registry (C7): maps node-type identifiers to executable
//! implementations. Ported from `NodeRegistry` in
//! `agent_executor.py`; implementations may do synchronous or
//! asynchronous work, same as the Python version's dual dispatch
//! between `await node_func(...)` and `run_in_executor`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use substrate_core::{CancellationSignal, Result};

/// Everything a node implementation needs to do its work: resolved
/// input parameters (static config overlaid with `input_map`
/// resolutions and secrets) plus a cancellation signal it should poll
/// on any long-running step.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub params: HashMap<String, Value>,
    pub cancellation: CancellationSignal,
}

impl NodeContext {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }
}

/// A node's return value: the output map consumed by `output_map`,
/// plus any secrets the node minted (e.g. an OAuth token) that should
/// be kept in memory only, never written to the durable store.
#[derive(Debug, Clone, Default)]
pub struct NodeOutput {
    pub output: HashMap<String, Value>,
    pub secrets: HashMap<String, String>,
}

impl NodeOutput {
    pub fn from_value(value: Value) -> Self {
        let output = match value {
            Value::Object(map) => map.into_iter().collect(),
            other => HashMap::from([("value".to_string(), other)]),
        };
        Self {
            output,
            secrets: HashMap::new(),
        }
    }

    /// Re-assemble `output` into a single JSON value, as stored in the
    /// node-event log and as what `node:id.path` navigates.
    pub fn as_json(&self) -> Value {
        Value::Object(self.output.clone().into_iter().collect())
    }
}

/// A single node's executable behavior.
#[async_trait]
pub trait NodeImplementation: Send + Sync {
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput>;
}

/// Built-in implementation for the `input_start` node type. The graph's
/// initial input is seeded onto `AgentState` by the executor before any
/// node runs, so the entry point itself has nothing to do; it exists
/// only so every graph has exactly one valid, registered entry node.
pub struct InputStartNode;

#[async_trait]
impl NodeImplementation for InputStartNode {
    async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput> {
        Ok(NodeOutput::default())
    }
}

/// Registry of available node implementations, keyed by declared node
/// type string.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    implementations: HashMap<String, Arc<dyn NodeImplementation>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            implementations: HashMap::new(),
        }
    }

    /// A registry pre-seeded with the built-in node types every graph
    /// can rely on (currently just `input_start`). Embedders register
    /// their own node types on top of this before validating a graph.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::definition::INPUT_START_TYPE, Arc::new(InputStartNode));
        registry
    }

    pub fn register(&mut self, node_type: impl Into<String>, implementation: Arc<dyn NodeImplementation>) {
        let node_type = node_type.into();
        tracing::debug!(node_type, "registered node type");
        self.implementations.insert(node_type, implementation);
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeImplementation>> {
        self.implementations.get(node_type).cloned()
    }

    /// Node types present in `node_types` with no registered
    /// implementation, deduplicated. Used by pre-flight validation.
    pub fn validate_node_types(&self, node_types: &[String]) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut missing = Vec::new();
        for node_type in node_types {
            if seen.insert(node_type.as_str()) && !self.implementations.contains_key(node_type) {
                missing.push(node_type.clone());
            }
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoNode;

    #[async_trait]
    impl NodeImplementation for EchoNode {
        async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput> {
            Ok(NodeOutput::from_value(Value::Object(
                ctx.params.into_iter().collect(),
            )))
        }
    }

    #[test]
    fn validate_node_types_reports_missing_once_per_type() {
        let mut registry = NodeRegistry::new();
        registry.register("echo", Arc::new(EchoNode));
        let missing = registry.validate_node_types(&[
            "echo".to_string(),
            "mystery".to_string(),
            "mystery".to_string(),
        ]);
        assert_eq!(missing, vec!["mystery".to_string()]);
    }

    #[tokio::test]
    async fn registered_implementation_runs() {
        let mut registry = NodeRegistry::new();
        registry.register("echo", Arc::new(EchoNode));
        let node = registry.get("echo").unwrap();
        let ctx = NodeContext {
            params: HashMap::from([("a".to_string(), serde_json::json!(1))]),
            cancellation: CancellationSignal::new(),
        };
        let out = node.execute(ctx).await.unwrap();
        assert_eq!(out.output.get("a"), Some(&serde_json::json!(1)));
    }
}
