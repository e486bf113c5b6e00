//! Node Registry (C7) and Agent Executor (C8): the graph execution
//! engine, compiled/validated per execution and replayed from durable
//! node events on restart.

pub mod definition;
pub mod executor;
pub mod registry;
pub mod router;
pub mod state;

pub use definition::{ConditionDef, EdgeDef, GraphDefinition, NodeDef, ValidationError, VariableDef, VariableStorage};
pub use executor::AgentExecutor;
pub use registry::{NodeContext, NodeImplementation, NodeOutput, NodeRegistry};
pub use state::AgentState;
pub use substrate_core::CancellationSignal;
