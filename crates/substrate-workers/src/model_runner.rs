//! Model Runner: the external-collaborator contract a concrete LLM
//! backend (llama.cpp bindings, a remote inference server, ...) must
//! satisfy for the Inference Worker to drive it. Ported from
//! `model_runner.py`'s `ModelRunner` — deliberately knows nothing
//! about the store, the queue, leasing, or the Event Hub.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use substrate_core::{CancellationSignal, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResult {
    pub text: String,
    pub finish_reason: String,
    pub usage: ChatUsage,
}

/// Per-token callback invoked as a model streams its response. Takes
/// `&str` rather than `String` so a runner doesn't have to allocate
/// just to report a token it already owns as a borrow.
#[async_trait]
pub trait TokenSink: Send + Sync {
    async fn on_token(&self, token: &str);
}

/// Contract for LLM model runners. Does not know about the store,
/// queue, leasing, or Event Hub — only model loading, unloading, and
/// inference.
#[async_trait]
pub trait ModelRunner: Send + Sync {
    /// Load `model_id` into memory if it is not already resident.
    async fn ensure_loaded(&self, model_id: &str) -> Result<()>;

    /// Unload whatever model is currently resident.
    async fn unload(&self) -> Result<()>;

    /// Run one chat completion, streaming tokens through `on_token` as
    /// they are generated and checking `cancellation` between tokens.
    /// Returns the completed result and an observed tokens/sec rate
    /// (`None` if the runner doesn't measure it).
    async fn run_chat(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        parameters: &serde_json::Value,
        on_token: &(dyn TokenSink),
        cancellation: &CancellationSignal,
    ) -> Result<(ChatResult, Option<f64>)>;
}
