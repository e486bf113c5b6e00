//! Agent state: the `vars`/`nodes` whiteboard carried through a graph
//! run, and the `var:`/`node:` slot-resolution rules from
//! `agent_executor.py`'s `_resolve_slot_from_state`.

use std::collections::HashMap;

use serde_json::Value;
use substrate_core::SubstrateError;

use crate::definition::NodeDef;

/// `{ vars: map, nodes: map }`. `vars` is written only through a
/// node's `output_map`; `nodes` accumulates the full output of every
/// node that has completed.
#[derive(Debug, Clone, Default)]
pub struct AgentState {
    pub vars: HashMap<String, Value>,
    pub nodes: HashMap<String, Value>,
}

impl AgentState {
    /// Seed state for a fresh run: `vars` is the caller's input
    /// payload, `nodes` empty.
    pub fn from_input(input: Value) -> Self {
        let vars = match input {
            Value::Object(map) => map.into_iter().collect(),
            other => {
                let mut vars = HashMap::new();
                vars.insert("input".to_string(), other);
                vars
            }
        };
        Self {
            vars,
            nodes: HashMap::new(),
        }
    }

    /// Resolve a node's `input_map` source expression against this
    /// state. `var:name` misses resolve to `Null` (matching the Python
    /// "doesn't raise for var: misses" behavior); `node:id.path` raises
    /// `DependencyMissing` if `id` has not completed yet.
    pub fn resolve_slot(&self, source_expr: &str) -> Result<Value, SubstrateError> {
        if let Some(var_name) = source_expr.strip_prefix("var:") {
            return Ok(self.vars.get(var_name).cloned().unwrap_or(Value::Null));
        }

        if let Some(path) = source_expr.strip_prefix("node:") {
            let mut parts = path.splitn(2, '.');
            let node_id = parts.next().unwrap_or_default();
            let rest = parts.next();

            let Some(root) = self.nodes.get(node_id) else {
                return Err(SubstrateError::DependencyMissing(format!(
                    "node '{node_id}' has not been executed yet (required by {source_expr})"
                )));
            };

            return Ok(match rest {
                Some(field_path) => navigate(root, field_path),
                None => root.clone(),
            });
        }

        Err(SubstrateError::InputMappingInvalid(format!(
            "unsupported input_map source expression: '{source_expr}'. must start with 'var:' or 'node:'"
        )))
    }

    /// Step F: record the node's full output in `nodes`, then apply
    /// `output_map` to write into `vars`, offloading to the artifact
    /// store for any variable declared `storage: artifact` whose value
    /// crosses the offload threshold. Offload is performed by the
    /// caller (the executor owns the artifact store); this method only
    /// shapes the state given the resolved `__ref` value.
    pub fn apply_node_output(
        &mut self,
        node: &NodeDef,
        node_id: &str,
        output: Value,
        output_refs: HashMap<String, Value>,
    ) {
        self.nodes.insert(node_id.to_string(), output.clone());

        for (var_name, output_key) in &node.output_map {
            let value = output_refs
                .get(var_name)
                .cloned()
                .unwrap_or_else(|| output.get(output_key).cloned().unwrap_or(Value::Null));
            self.vars.insert(var_name.clone(), value);
        }
    }
}

fn navigate(value: &Value, path: &str) -> Value {
    let mut current = value;
    for field in path.split('.') {
        match current.get(field) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_miss_resolves_to_null_not_error() {
        let state = AgentState::from_input(serde_json::json!({"a": 1}));
        assert_eq!(state.resolve_slot("var:missing").unwrap(), Value::Null);
    }

    #[test]
    fn node_miss_raises_dependency_missing() {
        let state = AgentState::from_input(serde_json::json!({}));
        let err = state.resolve_slot("node:fetch.rows").unwrap_err();
        assert!(matches!(err, SubstrateError::DependencyMissing(_)));
    }

    #[test]
    fn node_path_navigates_nested_fields() {
        let mut state = AgentState::from_input(serde_json::json!({}));
        state
            .nodes
            .insert("fetch".into(), serde_json::json!({"rows": {"count": 3}}));
        assert_eq!(
            state.resolve_slot("node:fetch.rows.count").unwrap(),
            serde_json::json!(3)
        );
    }

    #[test]
    fn unsupported_prefix_is_input_mapping_invalid() {
        let state = AgentState::from_input(serde_json::json!({}));
        let err = state.resolve_slot("literal:5").unwrap_err();
        assert!(matches!(err, SubstrateError::InputMappingInvalid(_)));
    }
}
