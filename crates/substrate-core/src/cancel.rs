//! Two-phase cooperative cancellation signal: a
//! durable CANCEL_REQUESTED status flip is the record of truth, but a
//! worker also needs an in-memory signal it can poll without a round
//! trip to the store on every step. One shared type so the Agent
//! Executor, Agent Worker, and Inference Worker all observe the same
//! shape of "has cancellation been asked for".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CancellationSignal(Arc<AtomicBool>);

impl CancellationSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
