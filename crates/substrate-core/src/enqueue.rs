//! Enqueue Service (C3): admits new executions and inference tasks.
//!
//! Ported from `dennett/core/enqueue.py`'s `EnqueueService` — the split
//! between `base_priority` (corridor alone) and `effective_priority`
//! (corridor with inheritance applied) is preserved so the priority
//! policy's inheritance mechanic stays inspectable after the fact.

use chrono::Utc;
use uuid::Uuid;

use crate::error::{Result, SubstrateError};
use crate::priority::PriorityPolicy;
use crate::store::DurableStore;
use crate::types::TaskSource;

pub struct EnqueueService<'a> {
    store: &'a DurableStore,
    priority_policy: &'a PriorityPolicy,
}

impl<'a> EnqueueService<'a> {
    pub fn new(store: &'a DurableStore, priority_policy: &'a PriorityPolicy) -> Self {
        Self {
            store,
            priority_policy,
        }
    }

    /// Admit a new agent-graph execution. Inserts the execution row and
    /// its seed `input_start` node event in one transaction and returns
    /// the new execution id.
    pub fn enqueue_execution(
        &self,
        agent_id: &str,
        payload: serde_json::Value,
        source: TaskSource,
        parent_execution_id: Option<Uuid>,
        parent_effective_priority: Option<i32>,
    ) -> Result<Uuid> {
        if agent_id.trim().is_empty() {
            return Err(SubstrateError::InvalidInput(
                "agent_id must not be empty".into(),
            ));
        }
        let id = Uuid::now_v7();
        let now_ts = Utc::now().timestamp();
        let base_priority = self.priority_policy.assign(source, None);
        let effective_priority = self.priority_policy.assign(source, parent_effective_priority);

        self.store.insert_execution(
            id,
            parent_execution_id,
            agent_id,
            base_priority,
            effective_priority,
            now_ts,
            &payload,
        )?;

        tracing::info!(
            execution_id = %id,
            agent_id,
            effective_priority,
            "enqueued execution"
        );
        Ok(id)
    }

    /// Admit a new raw model-inference request.
    pub fn enqueue_inference(
        &self,
        model_id: &str,
        prompt: serde_json::Value,
        parameters: serde_json::Value,
        source: TaskSource,
        parent_effective_priority: Option<i32>,
    ) -> Result<Uuid> {
        if model_id.trim().is_empty() {
            return Err(SubstrateError::InvalidInput(
                "model_id must not be empty".into(),
            ));
        }
        let id = Uuid::now_v7();
        let now_ts = Utc::now().timestamp();
        let base_priority = self.priority_policy.assign(source, None);
        let effective_priority = self.priority_policy.assign(source, parent_effective_priority);

        self.store.insert_inference(
            id,
            model_id,
            &prompt,
            &parameters,
            base_priority,
            effective_priority,
            now_ts,
        )?;

        tracing::info!(
            task_id = %id,
            model_id,
            effective_priority,
            "enqueued inference task"
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::{AgingConfig, Corridors};
    use crate::types::RowStatus;

    fn policy() -> PriorityPolicy {
        PriorityPolicy::new(Corridors::default(), AgingConfig::default())
    }

    #[test]
    fn enqueue_execution_seeds_input_start_event() {
        let store = DurableStore::open_in_memory().unwrap();
        let policy = policy();
        let svc = EnqueueService::new(&store, &policy);

        let id = svc
            .enqueue_execution(
                "agent.summarize",
                serde_json::json!({"text": "hello"}),
                TaskSource::ManualRun,
                None,
                None,
            )
            .unwrap();

        let row = store.get_execution(id).unwrap().unwrap();
        assert_eq!(row.status, RowStatus::Pending);
        assert_eq!(row.effective_priority, 70);

        let events = store.execution_events(id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].node_id, "input_start");
    }

    #[test]
    fn enqueue_execution_rejects_empty_agent_id() {
        let store = DurableStore::open_in_memory().unwrap();
        let policy = policy();
        let svc = EnqueueService::new(&store, &policy);
        let err = svc
            .enqueue_execution("", serde_json::json!({}), TaskSource::ManualRun, None, None)
            .unwrap_err();
        assert!(matches!(err, SubstrateError::InvalidInput(_)));
    }

    #[test]
    fn child_execution_inherits_parent_priority() {
        let store = DurableStore::open_in_memory().unwrap();
        let policy = policy();
        let svc = EnqueueService::new(&store, &policy);

        let child = svc
            .enqueue_execution(
                "agent.child",
                serde_json::json!({}),
                TaskSource::InternalNodeCall,
                None,
                Some(90),
            )
            .unwrap();
        let row = store.get_execution(child).unwrap().unwrap();
        assert_eq!(row.effective_priority, 90);
        assert_eq!(row.base_priority, 50);
    }
}
