//! Recovery Service (C4): crash recovery run once at process boot,
//! before any worker loop starts polling.
//!
//! Ported from `dennett/core/recovery.py`'s `StartupRecovery` — any row
//! left RUNNING or CANCEL_REQUESTED by a prior process (killed mid-lease,
//! no graceful finalize) is handed back to PENDING with its lease
//! cleared, so it re-enters the queue exactly once rather than being
//! lost or double-executed.

use crate::error::Result;
use crate::store::DurableStore;

pub struct RecoveryService;

impl RecoveryService {
    /// Reclaim every abandoned RUNNING/CANCEL_REQUESTED row. Must run
    /// to completion before the aging loop or any worker begins
    /// leasing, or a worker could lease a row recovery was about to
    /// reset.
    pub fn recover(store: &DurableStore) -> Result<()> {
        let (executions, inference) = store.recover_abandoned_rows()?;
        if executions > 0 || inference > 0 {
            tracing::warn!(
                executions,
                inference,
                "startup recovery reclaimed abandoned rows"
            );
        } else {
            tracing::info!("startup recovery found no abandoned rows");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RowStatus;
    use uuid::Uuid;

    #[test]
    fn recovers_running_and_cancel_requested_rows() {
        let store = DurableStore::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        store
            .insert_execution(id, None, "agent.a", 50, 50, 0, &serde_json::json!({}))
            .unwrap();
        store.lease_next_execution("lease-1", 600, 0).unwrap();

        let before = store.get_execution(id).unwrap().unwrap();
        assert_eq!(before.status, RowStatus::Running);
        assert!(before.lease_token.is_some());

        RecoveryService::recover(&store).unwrap();

        let after = store.get_execution(id).unwrap().unwrap();
        assert_eq!(after.status, RowStatus::Pending);
        assert!(after.lease_token.is_none());
        assert!(after.lease_expiry.is_none());
    }

    #[test]
    fn leaves_terminal_rows_untouched() {
        let store = DurableStore::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        store
            .insert_execution(id, None, "agent.a", 50, 50, 0, &serde_json::json!({}))
            .unwrap();
        let leased = store.lease_next_execution("lease-1", 600, 0).unwrap().unwrap();
        store
            .finalize_execution(leased.id, "lease-1", RowStatus::Completed, 10, None, None)
            .unwrap();

        RecoveryService::recover(&store).unwrap();

        let after = store.get_execution(id).unwrap().unwrap();
        assert_eq!(after.status, RowStatus::Completed);
    }
}
