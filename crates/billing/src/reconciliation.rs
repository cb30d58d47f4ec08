//! Provider reconciliation
//!
//! Local billing state may lag the provider but never lead it. When a local
//! write fails after the provider accepted a change, a [`ReconciliationItem`]
//! records the divergence. The [`Reconciler`] later treats the provider as the
//! source of truth and writes compensating change log entries.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use squarelet_shared::{ChangeLogReason, OrgId, Organization, DEFAULT_BILLING_ACCOUNT};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::SharedCatalog;
use crate::changelog::ChangeLogRecorder;
use crate::error::BillingResult;
use crate::provider::ProviderRegistry;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationKind {
    /// Provider seat count changed but local `max_users` did not
    SeatCount,
    /// Subscription linkage differs between provider and local state
    Subscription,
    /// Provider subscription exists with no local record
    OrphanSubscription,
    /// Provider cancelled a subscription that is still recorded locally
    Cancellation,
    /// Provider charged a customer with no local charge record
    UnrecordedCharge,
}

impl ReconciliationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SeatCount => "seat_count",
            Self::Subscription => "subscription",
            Self::OrphanSubscription => "orphan_subscription",
            Self::Cancellation => "cancellation",
            Self::UnrecordedCharge => "unrecorded_charge",
        }
    }
}

impl std::str::FromStr for ReconciliationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seat_count" => Ok(Self::SeatCount),
            "subscription" => Ok(Self::Subscription),
            "orphan_subscription" => Ok(Self::OrphanSubscription),
            "cancellation" => Ok(Self::Cancellation),
            "unrecorded_charge" => Ok(Self::UnrecordedCharge),
            _ => Err(format!("Unknown reconciliation kind: {}", s)),
        }
    }
}

impl std::fmt::Display for ReconciliationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationItem {
    pub id: Uuid,
    pub organization: OrgId,
    pub kind: ReconciliationKind,
    pub provider_subscription_id: Option<String>,
    #[serde(default)]
    pub billing_account: Option<String>,
    pub detail: String,
    pub created_at: OffsetDateTime,
    pub resolved_at: Option<OffsetDateTime>,
}

impl ReconciliationItem {
    pub fn new(
        organization: OrgId,
        kind: ReconciliationKind,
        provider_subscription_id: Option<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization,
            kind,
            provider_subscription_id,
            billing_account: None,
            detail: detail.into(),
            created_at: OffsetDateTime::now_utc(),
            resolved_at: None,
        }
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.billing_account = Some(account.into());
        self
    }

    /// Billing account the provider reference belongs to
    pub fn account(&self) -> &str {
        self.billing_account
            .as_deref()
            .unwrap_or(DEFAULT_BILLING_ACCOUNT)
    }
}

/// Operator-visible queue of divergences
#[derive(Clone)]
pub struct ReconciliationQueue {
    store: Arc<dyn Store>,
}

impl ReconciliationQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Log and persist a divergence. Persisting is best-effort; the error log
    /// line is always written.
    pub async fn record(&self, item: ReconciliationItem) -> ReconciliationItem {
        tracing::error!(
            org_id = %item.organization,
            kind = %item.kind,
            account = %item.account(),
            provider_subscription_id = ?item.provider_subscription_id,
            detail = %item.detail,
            "Billing provider and local state diverged"
        );
        if let Err(e) = self.store.record_reconciliation(&item).await {
            tracing::error!(
                org_id = %item.organization,
                item_id = %item.id,
                error = %e,
                "Failed to persist reconciliation item"
            );
        }
        item
    }

    pub async fn pending(&self) -> BillingResult<Vec<ReconciliationItem>> {
        self.store.pending_reconciliations().await
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub organizations_checked: usize,
    pub subscriptions_removed: usize,
    pub seats_corrected: usize,
    pub items_resolved: usize,
    pub failures: usize,
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    providers: ProviderRegistry,
    catalog: SharedCatalog,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, providers: ProviderRegistry, catalog: SharedCatalog) -> Self {
        Self {
            store,
            providers,
            catalog,
        }
    }

    /// Compare every local subscription with the provider and correct local state
    pub async fn run(&self) -> BillingResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let pending = self.store.pending_reconciliations().await?;

        let mut orgs: BTreeSet<OrgId> = self
            .store
            .list_subscriptions()
            .await?
            .into_iter()
            .map(|s| s.organization)
            .collect();
        orgs.extend(
            pending
                .iter()
                .filter(|i| {
                    !matches!(
                        i.kind,
                        ReconciliationKind::OrphanSubscription
                            | ReconciliationKind::UnrecordedCharge
                    )
                })
                .map(|i| i.organization),
        );

        let mut settled = BTreeSet::new();
        for org in orgs {
            match self.reconcile_organization(org, &mut report).await {
                Ok(()) => {
                    report.organizations_checked += 1;
                    settled.insert(org);
                }
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(org_id = %org, error = %e, "Failed to reconcile organization");
                }
            }
        }

        for item in &pending {
            let resolved = match item.kind {
                ReconciliationKind::OrphanSubscription => self.orphan_settled(item).await,
                // Charges need an operator to record or refund them
                ReconciliationKind::UnrecordedCharge => false,
                _ => settled.contains(&item.organization),
            };
            if resolved {
                self.store.resolve_reconciliation(item.id).await?;
                report.items_resolved += 1;
            }
        }

        tracing::info!(
            organizations = report.organizations_checked,
            removed = report.subscriptions_removed,
            seats = report.seats_corrected,
            resolved = report.items_resolved,
            failures = report.failures,
            "Reconciliation pass finished"
        );

        Ok(report)
    }

    async fn reconcile_organization(
        &self,
        org_id: OrgId,
        report: &mut ReconcileReport,
    ) -> BillingResult<()> {
        let mut tx = self.store.begin().await?;
        let mut org = tx.lock_organization(org_id).await?;
        let before = org.snapshot();
        let subscriptions = tx.subscriptions(org_id).await?;

        let mut removed = 0;
        let mut seats = None;
        for sub in &subscriptions {
            let remote = self
                .providers
                .get(&sub.billing_account)?
                .retrieve_subscription(&sub.provider_subscription_id)
                .await?;
            match remote {
                Some(remote) if remote.status.is_live() => {
                    if remote.quantity != org.max_users {
                        seats = Some(remote.quantity);
                    }
                }
                _ => {
                    tx.delete_subscription(sub.id).await?;
                    removed += 1;
                    if org.subscription_id.as_deref() == Some(sub.provider_subscription_id.as_str())
                    {
                        org.subscription_id = None;
                    }
                    if org.plan == Some(sub.plan) {
                        self.revert_to_free(&mut org);
                    }
                }
            }
        }

        if removed == 0 && seats.is_none() {
            return Ok(());
        }
        if let Some(quantity) = seats {
            org.max_users = quantity;
            report.seats_corrected += 1;
        }
        report.subscriptions_removed += removed;
        org.updated_at = OffsetDateTime::now_utc();

        tx.save_organization(&org).await?;
        ChangeLogRecorder::record(
            tx.as_mut(),
            org.id,
            None,
            ChangeLogReason::Reconciled,
            before,
            org.snapshot(),
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            org_id = %org.id,
            removed,
            max_users = org.max_users,
            "Corrected organization from billing provider"
        );
        Ok(())
    }

    fn revert_to_free(&self, org: &mut Organization) {
        let free = self.catalog.current().free_plan().map(|p| p.id);
        org.plan = free;
        org.next_plan = free;
    }

    /// An orphan is settled once the provider stops billing it or a local row claims it
    async fn orphan_settled(&self, item: &ReconciliationItem) -> bool {
        let Some(provider_id) = item.provider_subscription_id.as_deref() else {
            return false;
        };
        match self.store.subscriptions_for_orgs(&[item.organization]).await {
            Ok(subs) if subs.iter().any(|s| s.provider_subscription_id == provider_id) => {
                return true;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(item_id = %item.id, error = %e, "Failed to load subscriptions");
                return false;
            }
        }
        let provider = match self.providers.get(item.account()) {
            Ok(provider) => provider,
            Err(e) => {
                tracing::warn!(item_id = %item.id, error = %e, "No provider for orphan subscription");
                return false;
            }
        };
        match provider.retrieve_subscription(provider_id).await {
            Ok(Some(remote)) => !remote.status.is_live(),
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(item_id = %item.id, error = %e, "Failed to retrieve orphan subscription");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{CallCounts, MockProvider};
    use crate::provider::{BillingProvider, ProviderSubscriptionStatus};
    use crate::store::MemoryStore;
    use squarelet_shared::{Plan, PlanId, Subscription, SubscriptionId};

    fn reconciler(store: &Arc<MemoryStore>, provider: &Arc<MockProvider>) -> Reconciler {
        Reconciler::new(
            store.clone(),
            ProviderRegistry::single(provider.clone()),
            SharedCatalog::default(),
        )
    }

    fn paid_plan() -> Plan {
        Plan {
            id: PlanId::new(),
            slug: "organization".to_string(),
            name: "Organization".to_string(),
            public: true,
            for_individuals: false,
            for_groups: true,
            base_price: 100,
            price_per_user: 10,
            minimum_users: 5,
            entitlements: vec![],
            billing_account: "muckrock".to_string(),
            private_organizations: vec![],
        }
    }

    async fn setup() -> (Arc<MemoryStore>, Arc<MockProvider>, Organization, String) {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let plan = paid_plan();
        let customer = provider.create_customer("tok_visa", "Newsroom", None).await.unwrap();
        let remote = provider
            .create_subscription(&customer, &plan.provider_plan_id(), 5)
            .await
            .unwrap();

        let mut org = Organization::new("Newsroom", false, false);
        org.plan = Some(plan.id);
        org.next_plan = Some(plan.id);
        org.max_users = 5;
        org.set_customer("muckrock", customer);
        org.subscription_id = Some(remote.id.clone());

        let mut tx = store.begin().await.unwrap();
        tx.insert_plan(&plan).await.unwrap();
        tx.insert_organization(&org).await.unwrap();
        tx.insert_subscription(&Subscription {
            id: SubscriptionId::new(),
            organization: org.id,
            plan: plan.id,
            provider_subscription_id: remote.id.clone(),
            billing_account: "muckrock".to_string(),
            created_at: OffsetDateTime::now_utc(),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        (store, provider, org, remote.id)
    }

    #[tokio::test]
    async fn test_seat_mismatch_takes_provider_quantity() {
        let (store, provider, org, sub_id) = setup().await;
        provider.set_quantity(&sub_id, 8).await;
        store
            .record_reconciliation(&ReconciliationItem::new(
                org.id,
                ReconciliationKind::SeatCount,
                Some(sub_id.clone()),
                "seat update not recorded",
            ))
            .await
            .unwrap();

        let reconciler = reconciler(&store, &provider);
        let report = reconciler.run().await.unwrap();

        assert_eq!(report.seats_corrected, 1);
        assert_eq!(report.items_resolved, 1);
        assert_eq!(store.get_organization(org.id).await.unwrap().unwrap().max_users, 8);
        let logs = store.change_logs(org.id, None).await.unwrap();
        assert_eq!(logs.last().unwrap().reason, ChangeLogReason::Reconciled);
        assert!(store.pending_reconciliations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_provider_subscription_removed_locally() {
        let (store, provider, org, sub_id) = setup().await;
        provider
            .set_status(&sub_id, ProviderSubscriptionStatus::Cancelled)
            .await;

        let reconciler = reconciler(&store, &provider);
        let report = reconciler.run().await.unwrap();

        assert_eq!(report.subscriptions_removed, 1);
        assert!(store.list_subscriptions().await.unwrap().is_empty());
        let org = store.get_organization(org.id).await.unwrap().unwrap();
        assert_eq!(org.subscription_id, None);
        assert_eq!(org.plan, None);
        assert!(org.customer("muckrock").is_some());
    }

    #[tokio::test]
    async fn test_in_sync_organization_is_untouched() {
        let (store, provider, org, _) = setup().await;
        let reconciler = reconciler(&store, &provider);
        let report = reconciler.run().await.unwrap();

        assert_eq!(report.organizations_checked, 1);
        assert_eq!(report.seats_corrected, 0);
        assert!(store.change_logs(org.id, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_resolved_once_provider_stops_billing() {
        let (store, provider, org, _) = setup().await;
        let customer = org.customer("muckrock").unwrap().to_string();
        let orphan = provider
            .create_subscription(&customer, "squarelet_plan_organization", 5)
            .await
            .unwrap();
        store
            .record_reconciliation(&ReconciliationItem::new(
                org.id,
                ReconciliationKind::OrphanSubscription,
                Some(orphan.id.clone()),
                "subscription not recorded",
            )
            .with_account("muckrock"))
            .await
            .unwrap();

        let reconciler = reconciler(&store, &provider);
        assert_eq!(reconciler.run().await.unwrap().items_resolved, 0);

        provider.cancel_subscription(&orphan.id).await.unwrap();
        assert_eq!(reconciler.run().await.unwrap().items_resolved, 1);
    }

    #[tokio::test]
    async fn test_unrecorded_charge_stays_pending() {
        let (store, provider, org, _) = setup().await;
        store
            .record_reconciliation(
                &ReconciliationItem::new(
                    org.id,
                    ReconciliationKind::UnrecordedCharge,
                    None,
                    "charge ch_1 not recorded",
                )
                .with_account("muckrock"),
            )
            .await
            .unwrap();

        let report = reconciler(&store, &provider).run().await.unwrap();

        assert_eq!(report.items_resolved, 0);
        let pending = store.pending_reconciliations().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, ReconciliationKind::UnrecordedCharge);
    }

    #[tokio::test]
    async fn test_subscription_checked_against_its_account() {
        let (store, muckrock, org, sub_id) = setup().await;
        let presspass = Arc::new(MockProvider::new());
        muckrock.set_quantity(&sub_id, 7).await;

        // The subscription's account, not any other, decides the seat count
        let reconciler = Reconciler::new(
            store.clone(),
            ProviderRegistry::new()
                .with_account("muckrock", muckrock.clone())
                .with_account("presspass", presspass.clone()),
            SharedCatalog::default(),
        );
        let report = reconciler.run().await.unwrap();

        assert_eq!(report.seats_corrected, 1);
        assert_eq!(store.get_organization(org.id).await.unwrap().unwrap().max_users, 7);
        assert_eq!(presspass.calls().await, CallCounts::default());
    }
}
