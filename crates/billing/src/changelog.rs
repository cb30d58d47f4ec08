//! Organization change log
//!
//! Append-only audit of plan and seat changes. Entries are never updated;
//! corrections are new entries with reason `Reconciled`.

use std::sync::Arc;

use squarelet_shared::{ChangeLog, ChangeLogId, ChangeLogReason, OrgId, PlanSnapshot, UserId};
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::store::{DateRange, Store, StoreTx};

#[derive(Clone)]
pub struct ChangeLogRecorder {
    store: Arc<dyn Store>,
}

impl ChangeLogRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Write one entry inside the caller's transaction
    pub async fn record(
        tx: &mut dyn StoreTx,
        organization: OrgId,
        user: Option<UserId>,
        reason: ChangeLogReason,
        before: PlanSnapshot,
        after: PlanSnapshot,
    ) -> BillingResult<ChangeLog> {
        let entry = ChangeLog {
            id: ChangeLogId::new(),
            created_at: OffsetDateTime::now_utc(),
            organization,
            user,
            reason,
            from_plan: before.plan,
            to_plan: after.plan,
            from_next_plan: before.next_plan,
            to_next_plan: after.next_plan,
            from_max_users: before.max_users,
            to_max_users: after.max_users,
        };
        tx.insert_change_log(&entry).await?;

        tracing::debug!(
            org_id = %organization,
            reason = %reason,
            from_max_users = ?before.max_users,
            to_max_users = ?after.max_users,
            "Recorded organization change"
        );

        Ok(entry)
    }

    /// Entries for an organization, oldest first, optionally within `[from, to)`
    pub async fn list(
        &self,
        organization: OrgId,
        range: Option<DateRange>,
    ) -> BillingResult<Vec<ChangeLog>> {
        self.store.change_logs(organization, range).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use squarelet_shared::{Organization, PlanId};
    use time::Duration;

    #[tokio::test]
    async fn test_record_and_list_in_range() {
        let store = Arc::new(MemoryStore::new());
        let recorder = ChangeLogRecorder::new(store.clone());
        let org = Organization::new("Acme", false, false);
        let plan = PlanId::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_organization(&org).await.unwrap();
        let before = org.snapshot();
        let after = PlanSnapshot {
            plan: Some(plan),
            next_plan: Some(plan),
            max_users: Some(5),
        };
        ChangeLogRecorder::record(
            tx.as_mut(),
            org.id,
            None,
            ChangeLogReason::Updated,
            before,
            after,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let entries = recorder.list(org.id, None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].from_max_users, Some(1));
        assert_eq!(entries[0].to_plan, Some(plan));

        let now = OffsetDateTime::now_utc();
        let past = (now - Duration::days(2), now - Duration::days(1));
        assert!(recorder.list(org.id, Some(past)).await.unwrap().is_empty());
        let around = (now - Duration::hours(1), now + Duration::hours(1));
        assert_eq!(recorder.list(org.id, Some(around)).await.unwrap().len(), 1);
    }
}
