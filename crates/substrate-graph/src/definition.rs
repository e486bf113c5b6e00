//! Graph definition types and pre-flight validation.
//!
//! Ported from `agent_executor.py`'s `AgentExecutor.validate`, kept as
//! plain `serde`-deserializable structs in the style of `ob-workflow`'s
//! `WorkflowDefinition` (`definition.rs`) rather than the Python
//! version's loose `dict` walking.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::registry::NodeRegistry;

/// A complete agent graph: nodes, edges between them, and the
/// declared variable whiteboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub nodes: Vec<NodeDef>,
    pub edges: Vec<EdgeDef>,
    #[serde(default)]
    pub variables: Vec<VariableDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
    /// target-name -> source expression (`var:x` or `node:id.path`)
    #[serde(default)]
    pub input_map: HashMap<String, String>,
    /// variable-name -> output key
    #[serde(default)]
    pub output_map: HashMap<String, String>,
    /// context-key -> secret name, resolved against the executor's
    /// in-memory secret store rather than ever written to the store.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeDef {
    Plain {
        source: String,
        target: String,
    },
    Conditional {
        source: String,
        condition: ConditionDef,
        target: String,
        fallback_target: String,
    },
}

impl EdgeDef {
    pub fn source(&self) -> &str {
        match self {
            EdgeDef::Plain { source, .. } => source,
            EdgeDef::Conditional { source, .. } => source,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionDef {
    pub variable: String,
    #[serde(default = "default_operator")]
    pub operator: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

fn default_operator() -> String {
    "eq".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableStorage {
    Inline,
    Artifact,
}

impl Default for VariableStorage {
    fn default() -> Self {
        Self::Inline
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDef {
    pub id: String,
    #[serde(default)]
    pub storage: VariableStorage,
}

pub const INPUT_START_TYPE: &str = "input_start";

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("no entry point node (type='input_start') found")]
    NoEntryPoint,

    #[error("more than one input_start node: {0:?}")]
    MultipleEntryPoints(Vec<String>),

    #[error("unknown node types: {0:?}")]
    UnknownNodeTypes(Vec<String>),

    #[error("edge references non-existent node: {0} -> {1}")]
    DanglingEdge(String, String),

    #[error("conditional edge from {0} has non-existent fallback: {1}")]
    DanglingFallback(String, String),

    #[error("node {0} input_map references undefined variable: {1}")]
    UndefinedInputVariable(String, String),

    #[error("node {0} output_map references undefined variable: {1}")]
    UndefinedOutputVariable(String, String),

    #[error("conditional edge from {0} references undefined variable: {1}")]
    UndefinedConditionVariable(String, String),
}

impl GraphDefinition {
    /// Fail-fast structural validation, run once before any node
    /// executes. Mirrors the checks in `AgentExecutor.validate` plus
    /// `_validate_node_mappings`.
    pub fn validate(&self, registry: &NodeRegistry) -> Result<(), ValidationError> {
        let node_ids: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        let variable_ids: HashSet<&str> = self.variables.iter().map(|v| v.id.as_str()).collect();

        let node_types: Vec<String> = self.nodes.iter().map(|n| n.node_type.clone()).collect();
        let missing = registry.validate_node_types(&node_types);
        if !missing.is_empty() {
            return Err(ValidationError::UnknownNodeTypes(missing));
        }

        for edge in &self.edges {
            match edge {
                EdgeDef::Plain { source, target } => {
                    if !node_ids.contains(source.as_str()) || !node_ids.contains(target.as_str()) {
                        return Err(ValidationError::DanglingEdge(source.clone(), target.clone()));
                    }
                }
                EdgeDef::Conditional {
                    source,
                    target,
                    fallback_target,
                    condition,
                } => {
                    if !node_ids.contains(source.as_str()) || !node_ids.contains(target.as_str()) {
                        return Err(ValidationError::DanglingEdge(source.clone(), target.clone()));
                    }
                    if !node_ids.contains(fallback_target.as_str()) {
                        return Err(ValidationError::DanglingFallback(
                            source.clone(),
                            fallback_target.clone(),
                        ));
                    }
                    if !variable_ids.contains(condition.variable.as_str()) {
                        return Err(ValidationError::UndefinedConditionVariable(
                            source.clone(),
                            condition.variable.clone(),
                        ));
                    }
                }
            }
        }

        let entry_points: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| n.node_type == INPUT_START_TYPE)
            .map(|n| n.id.clone())
            .collect();
        match entry_points.len() {
            0 => return Err(ValidationError::NoEntryPoint),
            1 => {}
            _ => return Err(ValidationError::MultipleEntryPoints(entry_points)),
        }

        for node in &self.nodes {
            for source_expr in node.input_map.values() {
                if let Some(var_name) = source_expr.strip_prefix("var:") {
                    if !variable_ids.contains(var_name) {
                        return Err(ValidationError::UndefinedInputVariable(
                            node.id.clone(),
                            var_name.to_string(),
                        ));
                    }
                }
                // node:id.path references are resolved at runtime, same
                // as the ported implementation — unmet deps surface as
                // DependencyMissing during execution, not pre-flight.
            }
            for var_name in node.output_map.keys() {
                if !variable_ids.contains(var_name.as_str()) {
                    return Err(ValidationError::UndefinedOutputVariable(
                        node.id.clone(),
                        var_name.clone(),
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn entry_point(&self) -> &str {
        self.nodes
            .iter()
            .find(|n| n.node_type == INPUT_START_TYPE)
            .map(|n| n.id.as_str())
            .expect("validate() guarantees exactly one input_start node")
    }

    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn variable(&self, id: &str) -> Option<&VariableDef> {
        self.variables.iter().find(|v| v.id == id)
    }

    /// Outgoing edges from `node_id`, in declaration order.
    pub fn edges_from(&self, node_id: &str) -> Vec<&EdgeDef> {
        self.edges.iter().filter(|e| e.source() == node_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{NodeContext, NodeImplementation, NodeOutput, NodeRegistry};
    use async_trait::async_trait;

    struct NoopNode;

    #[async_trait]
    impl NodeImplementation for NoopNode {
        async fn execute(&self, _ctx: NodeContext) -> substrate_core::Result<NodeOutput> {
            Ok(NodeOutput::default())
        }
    }

    fn registry() -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        registry.register("input_start", std::sync::Arc::new(NoopNode));
        registry.register("echo", std::sync::Arc::new(NoopNode));
        registry
    }

    fn minimal_graph() -> GraphDefinition {
        GraphDefinition {
            nodes: vec![
                NodeDef {
                    id: "start".into(),
                    node_type: "input_start".into(),
                    config: serde_json::json!({}),
                    input_map: HashMap::new(),
                    output_map: HashMap::new(),
                    secrets: HashMap::new(),
                },
                NodeDef {
                    id: "echo1".into(),
                    node_type: "echo".into(),
                    config: serde_json::json!({}),
                    input_map: HashMap::new(),
                    output_map: HashMap::new(),
                    secrets: HashMap::new(),
                },
            ],
            edges: vec![EdgeDef::Plain {
                source: "start".into(),
                target: "echo1".into(),
            }],
            variables: vec![],
        }
    }

    #[test]
    fn valid_graph_passes() {
        let graph = minimal_graph();
        assert!(graph.validate(&registry()).is_ok());
    }

    #[test]
    fn missing_entry_point_is_rejected() {
        let mut graph = minimal_graph();
        graph.nodes[0].node_type = "echo".into();
        assert!(matches!(
            graph.validate(&registry()),
            Err(ValidationError::NoEntryPoint)
        ));
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let mut graph = minimal_graph();
        graph.edges.push(EdgeDef::Plain {
            source: "echo1".into(),
            target: "ghost".into(),
        });
        assert!(matches!(
            graph.validate(&registry()),
            Err(ValidationError::DanglingEdge(_, _))
        ));
    }

    #[test]
    fn unknown_node_type_is_rejected() {
        let mut graph = minimal_graph();
        graph.nodes[1].node_type = "mystery".into();
        assert!(matches!(
            graph.validate(&registry()),
            Err(ValidationError::UnknownNodeTypes(_))
        ));
    }
}
