//! Inference Worker (C10): drains the inference queue sequentially,
//! streaming tokens to subscribers as a model generates them. Ported
//! from `inference_worker.py`'s `CommunityInferenceWorker` — "sequential"
//! names the fact that leasing is one row at a time, not that callers
//! can't run more than one worker instance (GPU admission decides
//! where a given lease's work actually lands).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use substrate_core::{CancellationSignal, DurableStore, Result, RowStatus, SubstrateError};
use substrate_events::EventHub;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::model_runner::{ChatMessage, ModelRunner, TokenSink};

const LEASE_TTL_SECS: i64 = 300;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct InferenceWorker {
    store: Arc<DurableStore>,
    events: Arc<EventHub>,
    model_runner: Arc<dyn ModelRunner>,
    lease_token: String,
    running: AsyncMutex<HashMap<Uuid, CancellationSignal>>,
}

struct PublishingTokenSink {
    events: Arc<EventHub>,
    topic: String,
    task_id: Uuid,
}

#[async_trait]
impl TokenSink for PublishingTokenSink {
    async fn on_token(&self, token: &str) {
        self.events
            .publish(
                &self.topic,
                serde_json::json!({
                    "type": "TOKEN",
                    "task_id": self.task_id,
                    "data": {"text": token},
                    "ts": chrono::Utc::now().timestamp(),
                }),
            )
            .await;
    }
}

impl InferenceWorker {
    pub fn new(store: Arc<DurableStore>, events: Arc<EventHub>, model_runner: Arc<dyn ModelRunner>) -> Self {
        Self {
            store,
            events,
            model_runner,
            lease_token: Uuid::new_v4().to_string(),
            running: AsyncMutex::new(HashMap::new()),
        }
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        tracing::info!(lease_token = %self.lease_token, "inference worker started");
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
                    tracing::error!(%err, "inference worker poll error");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
        tracing::info!("inference worker stopped");
    }

    async fn try_run_once(&self) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let store = self.store.clone();
        let lease_token = self.lease_token.clone();
        let leased = tokio::task::spawn_blocking(move || store.lease_next_inference(&lease_token, LEASE_TTL_SECS, now))
            .await
            .expect("lease task panicked")?;

        let Some(task) = leased else {
            return Ok(false);
        };

        tracing::info!(task_id = %task.id, model_id = %task.model_id, "inference worker leased task");
        let topic = format!("inference:{}", task.id);

        let messages: Vec<ChatMessage> = match task.prompt.get("messages") {
            Some(value) => match serde_json::from_value(value.clone()) {
                Ok(messages) => messages,
                Err(err) => {
                    self.finalize_failed(task.id, format!("prompt parse error: {err}"), &topic).await?;
                    return Ok(true);
                }
            },
            None => Vec::new(),
        };

        let cancellation = CancellationSignal::new();
        self.running.lock().await.insert(task.id, cancellation.clone());

        let sink = PublishingTokenSink {
            events: self.events.clone(),
            topic: topic.clone(),
            task_id: task.id,
        };

        let outcome = async {
            self.model_runner.ensure_loaded(&task.model_id).await?;
            self.model_runner
                .run_chat(&task.model_id, &messages, &task.parameters, &sink, &cancellation)
                .await
        }
        .await;

        self.running.lock().await.remove(&task.id);
        let completed_at = chrono::Utc::now().timestamp();

        match outcome {
            Ok((result, tokens_per_second)) => {
                let result_json = serde_json::to_value(&result)?;
                self.store.finalize_inference(
                    task.id,
                    &self.lease_token,
                    RowStatus::Completed,
                    completed_at,
                    Some(&result_json),
                    tokens_per_second,
                    None,
                )?;
                self.events
                    .publish(
                        &topic,
                        serde_json::json!({
                            "type": "DONE",
                            "task_id": task.id,
                            "data": {"result": result_json, "tokens_per_second": tokens_per_second},
                            "ts": completed_at,
                        }),
                    )
                    .await;
                tracing::info!(task_id = %task.id, "inference worker finalized task");
            }
            Err(SubstrateError::Canceled) => {
                self.store
                    .finalize_inference(task.id, &self.lease_token, RowStatus::Canceled, completed_at, None, None, None)?;
                self.events
                    .publish(&topic, serde_json::json!({"type": "CANCELED", "task_id": task.id, "ts": completed_at}))
                    .await;
            }
            Err(err) => {
                self.finalize_failed(task.id, err.to_string(), &topic).await?;
            }
        }

        Ok(true)
    }

    async fn finalize_failed(&self, task_id: Uuid, message: String, topic: &str) -> Result<()> {
        let completed_at = chrono::Utc::now().timestamp();
        self.store.finalize_inference(
            task_id,
            &self.lease_token,
            RowStatus::Failed,
            completed_at,
            None,
            None,
            Some(&message),
        )?;
        self.events
            .publish(
                topic,
                serde_json::json!({
                    "type": "ERROR",
                    "task_id": task_id,
                    "data": {"message": message},
                    "ts": completed_at,
                }),
            )
            .await;
        tracing::warn!(%task_id, error = %message, "inference worker task failed");
        Ok(())
    }

    pub async fn cancel_inference(&self, task_id: Uuid) {
        if let Some(signal) = self.running.lock().await.get(&task_id) {
            signal.set();
            tracing::info!(%task_id, "cancel requested for running inference task");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_runner::{ChatResult, ChatUsage};
    use substrate_core::{AgingConfig, Corridors, EnqueueService, PriorityPolicy, TaskSource};

    struct StubRunner;

    #[async_trait]
    impl ModelRunner for StubRunner {
        async fn ensure_loaded(&self, _model_id: &str) -> Result<()> {
            Ok(())
        }

        async fn unload(&self) -> Result<()> {
            Ok(())
        }

        async fn run_chat(
            &self,
            _model_id: &str,
            messages: &[ChatMessage],
            _parameters: &serde_json::Value,
            on_token: &(dyn TokenSink),
            _cancellation: &CancellationSignal,
        ) -> Result<(ChatResult, Option<f64>)> {
            on_token.on_token("hello").await;
            let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok((
                ChatResult {
                    text: format!("echo: {last}"),
                    finish_reason: "stop".to_string(),
                    usage: ChatUsage {
                        prompt_tokens: 1,
                        completion_tokens: 1,
                        total_tokens: 2,
                    },
                },
                Some(12.5),
            ))
        }
    }

    #[tokio::test]
    async fn worker_runs_one_task_to_completion() {
        let store = Arc::new(DurableStore::open_in_memory().unwrap());
        let events = Arc::new(EventHub::new());
        let policy = PriorityPolicy::new(Corridors::default(), AgingConfig::default());
        let enqueue = EnqueueService::new(&store, &policy);
        let task_id = enqueue
            .enqueue_inference(
                "tiny-model",
                serde_json::json!({"messages": [{"role": "user", "content": "hi"}]}),
                serde_json::json!({"temperature": 0.7}),
                TaskSource::InteractiveChat,
                None,
            )
            .unwrap();

        let worker = InferenceWorker::new(store.clone(), events, Arc::new(StubRunner));
        assert!(worker.try_run_once().await.unwrap());

        let row = store.get_inference(task_id).unwrap().unwrap();
        assert_eq!(row.status, RowStatus::Completed);
        assert_eq!(row.tokens_per_second, Some(12.5));
    }

    #[tokio::test]
    async fn bad_prompt_json_fails_without_panicking() {
        let store = Arc::new(DurableStore::open_in_memory().unwrap());
        let events = Arc::new(EventHub::new());
        let policy = PriorityPolicy::new(Corridors::default(), AgingConfig::default());
        let enqueue = EnqueueService::new(&store, &policy);
        let task_id = enqueue
            .enqueue_inference(
                "tiny-model",
                serde_json::json!({"messages": "not-an-array"}),
                serde_json::json!({}),
                TaskSource::Trigger,
                None,
            )
            .unwrap();

        let worker = InferenceWorker::new(store.clone(), events, Arc::new(StubRunner));
        assert!(worker.try_run_once().await.unwrap());

        let row = store.get_inference(task_id).unwrap().unwrap();
        assert_eq!(row.status, RowStatus::Failed);
    }
}
