//! HTTP/WS surface, gated behind the `server` feature. Thin — every
//! handler just calls into `EnqueueService`/`DurableStore`/`EventHub`;
//! no business logic lives here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use substrate_artifacts::ArtifactStore;
use substrate_core::{DurableStore, EnqueueService, PriorityPolicy, SubstrateError, TaskSource};
use substrate_events::EventHub;
use substrate_workers::{AgentWorker, InferenceWorker};
use uuid::Uuid;

const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DurableStore>,
    pub priority_policy: Arc<PriorityPolicy>,
    pub events: Arc<EventHub>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub agent_worker: Arc<AgentWorker>,
    pub inference_worker: Arc<InferenceWorker>,
    pub boot_time: Instant,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/executions/run", post(run_execution))
        .route("/executions/:id", get(get_execution))
        .route("/executions/:id/cancel", post(cancel_execution))
        .route("/inference/chat", post(run_inference))
        .route("/inference/:id", get(get_inference))
        .route("/inference/:id/cancel", post(cancel_inference))
        .route("/inference/:id/stream", get(stream_inference))
        .route("/admin/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct RunExecutionRequest {
    agent_id: String,
    input: serde_json::Value,
    source: Option<TaskSource>,
}

async fn run_execution(State(state): State<AppState>, Json(req): Json<RunExecutionRequest>) -> Response {
    let enqueue = EnqueueService::new(&state.store, &state.priority_policy);
    let source = req.source.unwrap_or(TaskSource::ManualRun);
    match enqueue.enqueue_execution(&req.agent_id, req.input, source, None, None) {
        Ok(id) => (StatusCode::ACCEPTED, Json(json!({"execution_id": id, "status": "QUEUED"}))).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_execution(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.store.get_execution(id) {
        Ok(Some(row)) => Json(row_to_json(&row)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response(),
        Err(err) => error_response(err),
    }
}

async fn cancel_execution(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.store.request_execution_cancel(id) {
        Ok(()) => {
            state.agent_worker.cancel_execution(id).await;
            Json(json!({"status": "cancel_requested"})).into_response()
        }
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct RunInferenceRequest {
    model_id: String,
    messages: Vec<serde_json::Value>,
    parameters: Option<serde_json::Value>,
    source: Option<TaskSource>,
}

async fn run_inference(State(state): State<AppState>, Json(req): Json<RunInferenceRequest>) -> Response {
    let enqueue = EnqueueService::new(&state.store, &state.priority_policy);
    let source = req.source.unwrap_or(TaskSource::InteractiveChat);
    let prompt = json!({"messages": req.messages});
    let parameters = req.parameters.unwrap_or_else(|| json!({}));
    match enqueue.enqueue_inference(&req.model_id, prompt, parameters, source, None) {
        Ok(id) => (StatusCode::ACCEPTED, Json(json!({"task_id": id, "status": "QUEUED"}))).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_inference(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.store.get_inference(id) {
        Ok(Some(row)) => Json(json!({
            "id": row.id,
            "model_id": row.model_id,
            "status": row.status.as_str(),
            "prompt": row.prompt,
            "parameters": row.parameters,
            "result": row.result,
            "tokens_per_second": row.tokens_per_second,
            "error_log": row.error_log,
        }))
        .into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response(),
        Err(err) => error_response(err),
    }
}

async fn cancel_inference(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.store.request_inference_cancel(id) {
        Ok(()) => {
            state.inference_worker.cancel_inference(id).await;
            Json(json!({"status": "cancel_requested"})).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn stream_inference(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_inference_socket(socket, state, id))
}

async fn stream_inference_socket(mut socket: WebSocket, state: AppState, id: Uuid) {
    let topic = format!("inference:{id}");
    let mut subscription = state.events.subscribe(&topic).await;
    tracing::info!(task_id = %id, "websocket subscriber attached");

    loop {
        tokio::select! {
            event = subscription.receiver.recv() => {
                let Some(event) = event else { break };
                if socket.send(Message::Text(event.to_string())).await.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(PING_INTERVAL) => {
                let ping = json!({"type": "PING", "task_id": id, "ts": chrono::Utc::now().timestamp()});
                if socket.send(Message::Text(ping.to_string())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                if incoming.is_none() {
                    break;
                }
            }
        }
    }

    state.events.unsubscribe(&topic, subscription.id).await;
    tracing::info!(task_id = %id, "websocket subscriber detached");
}

async fn health(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "ok",
        "sqlite_version": state.store.sqlite_version(),
        "uptime_sec": state.boot_time.elapsed().as_secs(),
    }))
    .into_response()
}

fn row_to_json(row: &substrate_core::ExecutionRow) -> serde_json::Value {
    json!({
        "id": row.id,
        "parent_id": row.parent_id,
        "agent_id": row.agent_id,
        "status": row.status.as_str(),
        "effective_priority": row.effective_priority,
        "final_result": row.final_result,
        "error_log": row.error_log,
    })
}

fn error_response(err: SubstrateError) -> Response {
    let status = match err {
        SubstrateError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        SubstrateError::NotFound(_) => StatusCode::NOT_FOUND,
        SubstrateError::StoreBusy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": err.to_string()}))).into_response()
}
