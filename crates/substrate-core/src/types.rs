//! Data model: execution rows, inference rows, node events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status shared by execution rows and inference rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowStatus {
    Pending,
    Running,
    CancelRequested,
    Completed,
    Failed,
    Canceled,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::CancelRequested => "CANCEL_REQUESTED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl std::str::FromStr for RowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "CANCEL_REQUESTED" => Ok(Self::CancelRequested),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELED" => Ok(Self::Canceled),
            other => Err(format!("unknown row status: {other}")),
        }
    }
}

impl std::fmt::Display for RowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Submission source corridor, used to pick the base-priority band for
/// a newly enqueued row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskSource {
    InteractiveChat,
    ManualRun,
    InternalNodeCall,
    Trigger,
}

impl std::str::FromStr for TaskSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INTERACTIVE_CHAT" | "CHAT" => Ok(Self::InteractiveChat),
            "MANUAL_RUN" => Ok(Self::ManualRun),
            "INTERNAL_NODE_CALL" | "INTERNAL_NODE" => Ok(Self::InternalNodeCall),
            "TRIGGER" => Ok(Self::Trigger),
            other => Err(format!("unknown task source: {other}")),
        }
    }
}

/// An agent-graph execution row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub agent_id: String,
    pub status: RowStatus,
    pub base_priority: i32,
    pub effective_priority: i32,
    pub enqueue_ts: i64,
    pub lease_token: Option<String>,
    pub lease_expiry: Option<i64>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub final_result: Option<serde_json::Value>,
    pub error_log: Option<String>,
}

/// A raw model-inference request row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRow {
    pub id: Uuid,
    pub model_id: String,
    pub status: RowStatus,
    pub prompt: serde_json::Value,
    pub parameters: serde_json::Value,
    pub base_priority: i32,
    pub effective_priority: i32,
    pub enqueue_ts: i64,
    pub lease_token: Option<String>,
    pub lease_expiry: Option<i64>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub result: Option<serde_json::Value>,
    pub tokens_per_second: Option<f64>,
    pub error_log: Option<String>,
}

/// Status of a single node-event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeEventStatus {
    Started,
    Completed,
    Failed,
}

impl NodeEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for NodeEventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTED" => Ok(Self::Started),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown node event status: {other}")),
        }
    }
}

/// An append-only node-event row, keyed by `(execution_id, node_id, sequence)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEvent {
    pub sequence: i64,
    pub execution_id: Uuid,
    pub node_id: String,
    pub status: NodeEventStatus,
    pub timestamp: i64,
    pub intermediate_output: Option<serde_json::Value>,
    pub error_log: Option<String>,
}

/// Well-known node id for the seed `input_start` event written by
/// `enqueue_execution`.
pub const INPUT_START_NODE_ID: &str = "input_start";
