//! Durable store, priority policy, enqueue and recovery services — the
//! control plane's data layer. Every other crate in the workspace
//! depends on this one for its row types and its `SubstrateError`.

pub mod cancel;
pub mod enqueue;
pub mod error;
pub mod priority;
pub mod recovery;
pub mod store;
pub mod types;

pub use cancel::CancellationSignal;
pub use enqueue::EnqueueService;
pub use error::{Result, SubstrateError};
pub use priority::{run_aging_loop, AgingConfig, Corridors, PriorityPolicy};
pub use recovery::RecoveryService;
pub use store::DurableStore;
pub use types::{
    ExecutionRow, InferenceRow, NodeEvent, NodeEventStatus, RowStatus, TaskSource,
    INPUT_START_NODE_ID,
};
