//! Priority Policy (C2): corridors, inheritance, and the aging loop.
//!
//! Ported from `priority_policy.py`'s `PriorityPolicy_Base`: fixed
//! corridors per submission source, `max(base, parent)` inheritance to
//! prevent priority inversion across a call chain, and a periodic
//! background sweep that boosts starved PENDING rows up to a cap.

use std::time::Duration;

use crate::error::Result;
use crate::store::DurableStore;
use crate::types::TaskSource;

/// Priority corridor for one submission source, `(base_priority, )`.
/// The default table mirrors the community corridors in
/// `priority_policy.py`; an embedding binary can override a subset via
/// [`PriorityPolicy::with_corridor`].
#[derive(Debug, Clone, Copy)]
pub struct Corridors {
    pub interactive_chat: i32,
    pub manual_run: i32,
    pub internal_node_call: i32,
    pub trigger: i32,
}

impl Default for Corridors {
    fn default() -> Self {
        Self {
            interactive_chat: 90,
            manual_run: 70,
            internal_node_call: 50,
            trigger: 30,
        }
    }
}

impl Corridors {
    fn base_for(&self, source: TaskSource) -> i32 {
        match source {
            TaskSource::InteractiveChat => self.interactive_chat,
            TaskSource::ManualRun => self.manual_run,
            TaskSource::InternalNodeCall => self.internal_node_call,
            TaskSource::Trigger => self.trigger,
        }
    }
}

/// Tunables for the background aging sweep.
#[derive(Debug, Clone, Copy)]
pub struct AgingConfig {
    pub interval: Duration,
    pub starvation_threshold: Duration,
    pub boost: i32,
    pub cap: i32,
}

impl Default for AgingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            starvation_threshold: Duration::from_secs(300),
            boost: 10,
            cap: 65,
        }
    }
}

/// Assigns base/effective priority at enqueue time and runs the
/// anti-starvation aging sweep against the durable store.
pub struct PriorityPolicy {
    corridors: Corridors,
    aging: AgingConfig,
}

impl PriorityPolicy {
    pub fn new(corridors: Corridors, aging: AgingConfig) -> Self {
        Self { corridors, aging }
    }

    /// Mechanic 1 (corridors) + Mechanic 2 (inheritance): the effective
    /// priority of a new row is never lower than its parent's, so a
    /// high-priority agent fanning out into low-priority internal calls
    /// cannot invert behind its own children.
    pub fn assign(&self, source: TaskSource, parent_effective_priority: Option<i32>) -> i32 {
        let base = self.corridors.base_for(source);
        match parent_effective_priority {
            Some(parent) => base.max(parent),
            None => base,
        }
    }

    pub fn aging_config(&self) -> AgingConfig {
        self.aging
    }

    /// Run the aging sweep once. Intended to be called on a fixed
    /// interval by a long-lived task; errors are the caller's to log
    /// and survive, never to let the loop die on.
    pub fn run_aging_once(&self, store: &DurableStore, now: i64) -> Result<(usize, usize)> {
        let threshold_ts = now - self.aging.starvation_threshold.as_secs() as i64;
        store.age_pending(self.aging.boost, self.aging.cap, threshold_ts)
    }
}

/// Drive [`PriorityPolicy::run_aging_once`] forever on `policy.aging.interval`,
/// logging and continuing past any individual sweep's failure — the
/// aging loop must never be allowed to take the process down with it.
pub async fn run_aging_loop(
    policy: std::sync::Arc<PriorityPolicy>,
    store: std::sync::Arc<DurableStore>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(policy.aging_config().interval);
    tracing::info!("aging loop started");
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = chrono::Utc::now().timestamp();
                let policy = policy.clone();
                let store = store.clone();
                let result = tokio::task::spawn_blocking(move || policy.run_aging_once(&store, now)).await;
                match result {
                    Ok(Ok((executions, inference))) => {
                        if executions > 0 || inference > 0 {
                            tracing::info!(executions, inference, "aging loop boosted starved rows");
                        }
                    }
                    Ok(Err(err)) => tracing::error!(%err, "aging sweep failed"),
                    Err(join_err) => tracing::error!(%join_err, "aging sweep task panicked"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("aging loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corridors_rank_interactive_above_trigger() {
        let policy = PriorityPolicy::new(Corridors::default(), AgingConfig::default());
        assert!(
            policy.assign(TaskSource::InteractiveChat, None)
                > policy.assign(TaskSource::Trigger, None)
        );
    }

    #[test]
    fn inheritance_prevents_inversion() {
        let policy = PriorityPolicy::new(Corridors::default(), AgingConfig::default());
        let child = policy.assign(TaskSource::InternalNodeCall, Some(90));
        assert_eq!(child, 90);
    }

    #[test]
    fn inheritance_never_lowers_a_high_base() {
        let policy = PriorityPolicy::new(Corridors::default(), AgingConfig::default());
        let child = policy.assign(TaskSource::InteractiveChat, Some(10));
        assert_eq!(child, 90);
    }

    #[test]
    fn aging_boosts_and_caps_starved_rows() {
        let store = DurableStore::open_in_memory().unwrap();
        let policy = PriorityPolicy::new(Corridors::default(), AgingConfig::default());
        let id = uuid::Uuid::new_v4();
        store
            .insert_execution(id, None, "agent.test", 30, 30, 0, &serde_json::json!({}))
            .unwrap();
        let (boosted, _) = policy.run_aging_once(&store, 10_000).unwrap();
        assert_eq!(boosted, 1);
        let row = store.get_execution(id).unwrap().unwrap();
        assert_eq!(row.effective_priority, 40);
    }

    fn any_source() -> impl proptest::strategy::Strategy<Value = TaskSource> {
        proptest::prop_oneof![
            proptest::strategy::Just(TaskSource::InteractiveChat),
            proptest::strategy::Just(TaskSource::ManualRun),
            proptest::strategy::Just(TaskSource::InternalNodeCall),
            proptest::strategy::Just(TaskSource::Trigger),
        ]
    }

    proptest::proptest! {
        /// (I3, P5) effective_priority is never below the source's own
        /// base corridor and never below an inherited parent priority.
        #[test]
        fn assign_never_drops_below_base_or_parent(
            source in any_source(),
            parent in proptest::option::of(0i32..=100),
        ) {
            let policy = PriorityPolicy::new(Corridors::default(), AgingConfig::default());
            let base = policy.assign(source, None);
            let effective = policy.assign(source, parent);
            proptest::prop_assert!(effective >= base);
            if let Some(p) = parent {
                proptest::prop_assert!(effective >= p);
            }
        }

        /// (P4, I3) one aging tick against a starved row strictly raises
        /// its effective priority, up to the configured cap, and never
        /// lowers it.
        #[test]
        fn aging_tick_is_monotonic_and_capped(start in 0i32..=65) {
            let store = DurableStore::open_in_memory().unwrap();
            let policy = PriorityPolicy::new(Corridors::default(), AgingConfig::default());
            let id = uuid::Uuid::new_v4();
            store
                .insert_execution(id, None, "agent.test", start, start, 0, &serde_json::json!({}))
                .unwrap();

            policy.run_aging_once(&store, 10_000).unwrap();
            let after = store.get_execution(id).unwrap().unwrap().effective_priority;

            proptest::prop_assert!(after >= start);
            proptest::prop_assert!(after <= policy.aging_config().cap);
            if start < policy.aging_config().cap {
                proptest::prop_assert!(after > start);
            }
        }
    }
}
