//! Shared error taxonomy for the control plane.
//!
//! One enum, reused by every crate in the workspace, rather than a
//! per-component error type per component the way `ob-workflow` splits
//! `BlobStoreError`/`ListenerError`/`WorkflowError` — the failure modes
//! here cut across every component, so a single enum matches that
//! shape directly.

use uuid::Uuid;

/// Error kinds raised anywhere in the control plane.
#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("dependency missing: {0}")]
    DependencyMissing(String),

    #[error("input mapping invalid: {0}")]
    InputMappingInvalid(String),

    #[error("node execution failed: {0}")]
    NodeExecutionFailed(String),

    #[error("canceled")]
    Canceled,

    #[error("artifact missing: {0}")]
    ArtifactMissing(String),

    #[error("lease lost for row {0}")]
    LeaseLost(Uuid),

    #[error("store busy")]
    StoreBusy,

    #[error("vram exhausted: requested {requested_mb}MB for model {model_id}")]
    VramExhausted { model_id: String, requested_mb: u64 },

    #[error("unknown row: {0}")]
    NotFound(Uuid),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SubstrateError>;
