//! Billing Invariants Module
//!
//! Runnable consistency checks over organizations, subscriptions and
//! memberships. Checks only read; a violation names the organizations
//! involved and carries enough context to debug it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use squarelet_shared::{OrgId, OrgState, Organization, PlanId};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::catalog::SharedCatalog;
use crate::error::BillingResult;
use crate::store::Store;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Organization(s) affected
    pub org_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - an organization may be billed twice
    Critical,
    /// High - local state disagrees with what is being charged
    High,
    /// Medium - seat bookkeeping is off
    Medium,
    /// Low - informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    /// True when no violation was found
    pub healthy: bool,
}

const CHECKS: [&str; 7] = [
    "single_subscription_per_plan",
    "paid_subscription_has_customer",
    "plan_minimum_seats",
    "individual_seat_count",
    "individual_single_member",
    "paid_plan_has_subscription",
    "pending_reconciliation",
];

fn violation(
    invariant: &str,
    org: &Organization,
    description: String,
    context: serde_json::Value,
    severity: ViolationSeverity,
) -> InvariantViolation {
    InvariantViolation {
        invariant: invariant.to_string(),
        org_ids: vec![org.id.0],
        description,
        context,
        severity,
    }
}

/// Pending a plan change whose billing cycle has not yet passed
fn in_closing_cycle(org: &Organization, today: Date) -> bool {
    org.state() == OrgState::PendingChange && org.update_on.is_some_and(|date| date >= today)
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    store: Arc<dyn Store>,
    catalog: SharedCatalog,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn Store>, catalog: SharedCatalog) -> Self {
        Self { store, catalog }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();
        for name in CHECKS {
            violations.extend(self.run_check(name).await?);
        }

        let checks_run = CHECKS.len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();

        for v in &violations {
            tracing::warn!(
                invariant = %v.invariant,
                severity = %v.severity,
                org_ids = ?v.org_ids,
                "{}",
                v.description
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_subscription_per_plan" => self.check_single_subscription_per_plan().await,
            "paid_subscription_has_customer" => self.check_subscription_has_customer().await,
            "plan_minimum_seats" => self.check_plan_minimum_seats().await,
            "individual_seat_count" => self.check_individual_seat_count().await,
            "individual_single_member" => self.check_individual_single_member().await,
            "paid_plan_has_subscription" => {
                self.check_paid_plan_has_subscription(OffsetDateTime::now_utc().date())
                    .await
            }
            "pending_reconciliation" => self.check_pending_reconciliation().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }

    async fn organizations(&self) -> BillingResult<HashMap<OrgId, Organization>> {
        Ok(self
            .store
            .list_organizations()
            .await?
            .into_iter()
            .map(|o| (o.id, o))
            .collect())
    }

    /// At most one subscription per (organization, plan)
    async fn check_single_subscription_per_plan(&self) -> BillingResult<Vec<InvariantViolation>> {
        let orgs = self.organizations().await?;
        let mut counts: HashMap<(OrgId, PlanId), Vec<String>> = HashMap::new();
        for sub in self.store.list_subscriptions().await? {
            counts
                .entry((sub.organization, sub.plan))
                .or_default()
                .push(sub.provider_subscription_id);
        }

        Ok(counts
            .into_iter()
            .filter(|(_, subs)| subs.len() > 1)
            .filter_map(|((org, plan), subs)| {
                let org = orgs.get(&org)?;
                Some(violation(
                    "single_subscription_per_plan",
                    org,
                    format!(
                        "Organization '{}' has {} subscriptions to the same plan",
                        org.name,
                        subs.len()
                    ),
                    serde_json::json!({ "plan_id": plan, "subscriptions": subs }),
                    ViolationSeverity::Critical,
                ))
            })
            .collect())
    }

    /// Anything billed must have a customer on the subscription's billing account
    async fn check_subscription_has_customer(&self) -> BillingResult<Vec<InvariantViolation>> {
        let orgs = self.organizations().await?;
        let mut missing: HashMap<OrgId, Vec<String>> = HashMap::new();
        for sub in self.store.list_subscriptions().await? {
            let has_customer = orgs
                .get(&sub.organization)
                .is_some_and(|org| org.customer(&sub.billing_account).is_some());
            if !has_customer {
                missing
                    .entry(sub.organization)
                    .or_default()
                    .push(sub.billing_account);
            }
        }

        Ok(missing
            .into_iter()
            .filter_map(|(id, accounts)| {
                let org = orgs.get(&id)?;
                Some(violation(
                    "paid_subscription_has_customer",
                    org,
                    format!("Organization '{}' has subscriptions but no customer", org.name),
                    serde_json::json!({
                        "subscription_id": org.subscription_id,
                        "billing_accounts": accounts,
                    }),
                    ViolationSeverity::High,
                ))
            })
            .collect())
    }

    async fn check_plan_minimum_seats(&self) -> BillingResult<Vec<InvariantViolation>> {
        let orgs = self.organizations().await?;
        let catalog = self.catalog.current();
        Ok(orgs
            .values()
            .filter(|org| !org.individual)
            .filter_map(|org| {
                let plan = catalog.plan(org.plan?)?;
                (org.max_users < plan.minimum_users).then(|| {
                    violation(
                        "plan_minimum_seats",
                        org,
                        format!(
                            "Organization '{}' has {} seats, below the {} required by '{}'",
                            org.name, org.max_users, plan.minimum_users, plan.slug
                        ),
                        serde_json::json!({
                            "plan": plan.slug,
                            "max_users": org.max_users,
                            "minimum_users": plan.minimum_users,
                        }),
                        ViolationSeverity::Medium,
                    )
                })
            })
            .collect())
    }

    /// Individual organizations carry one seat unless the plan bills per seat
    async fn check_individual_seat_count(&self) -> BillingResult<Vec<InvariantViolation>> {
        let orgs = self.organizations().await?;
        let catalog = self.catalog.current();
        Ok(orgs
            .values()
            .filter(|org| org.individual && org.max_users != 1)
            .filter(|org| {
                !org.plan
                    .and_then(|id| catalog.plan(id))
                    .is_some_and(|p| p.multi_seat_individual())
            })
            .map(|org| {
                violation(
                    "individual_seat_count",
                    org,
                    format!(
                        "Individual organization '{}' has {} seats",
                        org.name, org.max_users
                    ),
                    serde_json::json!({ "max_users": org.max_users }),
                    ViolationSeverity::Medium,
                )
            })
            .collect())
    }

    async fn check_individual_single_member(&self) -> BillingResult<Vec<InvariantViolation>> {
        let orgs = self.organizations().await?;
        let mut result = Vec::new();
        for org in orgs.values().filter(|o| o.individual) {
            let members = self.store.memberships_for_org(org.id).await?;
            if members.len() != 1 {
                result.push(violation(
                    "individual_single_member",
                    org,
                    format!(
                        "Individual organization '{}' has {} members",
                        org.name,
                        members.len()
                    ),
                    serde_json::json!({ "members": members.len() }),
                    ViolationSeverity::High,
                ));
            }
        }
        Ok(result)
    }

    /// A paid current plan is backed by a subscription. A plan kept after
    /// cancellation runs unbilled until its billing cycle date passes.
    async fn check_paid_plan_has_subscription(
        &self,
        today: Date,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let orgs = self.organizations().await?;
        let catalog = self.catalog.current();
        let billed: HashSet<(OrgId, PlanId)> = self
            .store
            .list_subscriptions()
            .await?
            .into_iter()
            .map(|s| (s.organization, s.plan))
            .collect();

        Ok(orgs
            .values()
            .filter(|org| !in_closing_cycle(org, today))
            .filter_map(|org| {
                let plan = catalog.plan(org.plan?)?;
                (!plan.free() && !billed.contains(&(org.id, plan.id))).then(|| {
                    violation(
                        "paid_plan_has_subscription",
                        org,
                        format!(
                            "Organization '{}' is on paid plan '{}' without a subscription",
                            org.name, plan.slug
                        ),
                        serde_json::json!({
                            "plan": plan.slug,
                            "state": org.state().to_string(),
                            "update_on": org.update_on,
                        }),
                        ViolationSeverity::High,
                    )
                })
            })
            .collect())
    }

    /// Unresolved reconciliation items mean local state lags the provider
    async fn check_pending_reconciliation(&self) -> BillingResult<Vec<InvariantViolation>> {
        let orgs = self.organizations().await?;
        Ok(self
            .store
            .pending_reconciliations()
            .await?
            .into_iter()
            .map(|item| InvariantViolation {
                invariant: "pending_reconciliation".to_string(),
                org_ids: vec![item.organization.0],
                description: format!(
                    "Unresolved {} for '{}': {}",
                    item.kind,
                    orgs.get(&item.organization)
                        .map_or("unknown organization", |o| o.name.as_str()),
                    item.detail
                ),
                context: serde_json::json!({
                    "item_id": item.id,
                    "subscription_id": item.provider_subscription_id,
                    "created_at": item.created_at,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciliation::{ReconciliationItem, ReconciliationKind, ReconciliationQueue};
    use crate::store::MemoryStore;
    use squarelet_shared::{
        Membership, Plan, Subscription, SubscriptionId, User, DEFAULT_BILLING_ACCOUNT,
    };
    use time::Duration;

    fn plan(slug: &str, base: u32, min: u32) -> Plan {
        Plan {
            id: PlanId::new(),
            slug: slug.to_string(),
            name: slug.to_string(),
            public: true,
            for_individuals: true,
            for_groups: true,
            base_price: base,
            price_per_user: 0,
            minimum_users: min,
            entitlements: vec![],
            billing_account: "muckrock".to_string(),
            private_organizations: vec![],
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 7);
        assert!(checks.contains(&"single_subscription_per_plan"));
        assert!(checks.contains(&"pending_reconciliation"));
    }

    #[tokio::test]
    async fn test_healthy_store() {
        let store = Arc::new(MemoryStore::new());
        let free = plan("free", 0, 1);
        let user = User::new("alice", "alice@example.com", "Alice");
        let mut org = Organization::new("alice", true, false);
        org.plan = Some(free.id);
        org.next_plan = Some(free.id);

        let mut tx = store.begin().await.unwrap();
        tx.insert_plan(&free).await.unwrap();
        tx.insert_user(&user).await.unwrap();
        tx.insert_organization(&org).await.unwrap();
        tx.insert_membership(&Membership::new(org.id, user.id, true))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let catalog = SharedCatalog::load(store.as_ref()).await.unwrap();
        let summary = InvariantChecker::new(store, catalog)
            .run_all_checks()
            .await
            .unwrap();
        assert!(summary.healthy, "{:?}", summary.violations);
        assert_eq!(summary.checks_passed, 7);
    }

    #[tokio::test]
    async fn test_detects_broken_billing_state() {
        let store = Arc::new(MemoryStore::new());
        let team = plan("team", 100, 5);
        let mut org = Organization::new("Newsroom", false, false);
        org.plan = Some(team.id);
        org.max_users = 3;

        let mut tx = store.begin().await.unwrap();
        tx.insert_plan(&team).await.unwrap();
        tx.insert_organization(&org).await.unwrap();
        tx.insert_subscription(&Subscription {
            id: SubscriptionId::new(),
            organization: org.id,
            plan: team.id,
            provider_subscription_id: "sub_1".to_string(),
            billing_account: DEFAULT_BILLING_ACCOUNT.to_string(),
            created_at: OffsetDateTime::now_utc(),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();
        ReconciliationQueue::new(store.clone())
            .record(ReconciliationItem::new(
                org.id,
                ReconciliationKind::SeatCount,
                Some("sub_1".to_string()),
                "seat update not recorded".to_string(),
            ))
            .await;

        let catalog = SharedCatalog::load(store.as_ref()).await.unwrap();
        let summary = InvariantChecker::new(store, catalog)
            .run_all_checks()
            .await
            .unwrap();

        let failed: HashSet<&str> = summary
            .violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect();
        assert_eq!(
            failed,
            HashSet::from([
                "paid_subscription_has_customer",
                "plan_minimum_seats",
                "pending_reconciliation",
            ])
        );
        assert!(!summary.healthy);
        assert_eq!(summary.checks_failed, 3);
        assert!(summary
            .violations
            .iter()
            .all(|v| v.org_ids == vec![org.id.0]));
    }

    async fn unbilled_paid_org(update_on: Option<Date>) -> (Arc<MemoryStore>, Organization) {
        let store = Arc::new(MemoryStore::new());
        let free = plan("free", 0, 1);
        let team = plan("team", 100, 1);
        let mut org = Organization::new("Newsroom", false, false);
        org.plan = Some(team.id);
        org.next_plan = Some(free.id);
        org.update_on = update_on;

        let mut tx = store.begin().await.unwrap();
        tx.insert_plan(&free).await.unwrap();
        tx.insert_plan(&team).await.unwrap();
        tx.insert_organization(&org).await.unwrap();
        tx.commit().await.unwrap();
        (store, org)
    }

    #[tokio::test]
    async fn test_kept_plan_exempt_until_cycle_passes() {
        let today = OffsetDateTime::now_utc().date();

        for update_on in [today, today + Duration::days(10)] {
            let (store, _) = unbilled_paid_org(Some(update_on)).await;
            let checker =
                InvariantChecker::new(store.clone(), SharedCatalog::load(store.as_ref()).await.unwrap());
            let violations = checker.run_check("paid_plan_has_subscription").await.unwrap();
            assert!(violations.is_empty(), "{:?}", violations);
        }

        for update_on in [Some(today - Duration::days(1)), None] {
            let (store, org) = unbilled_paid_org(update_on).await;
            let checker =
                InvariantChecker::new(store.clone(), SharedCatalog::load(store.as_ref()).await.unwrap());
            let violations = checker.run_check("paid_plan_has_subscription").await.unwrap();
            assert_eq!(violations.len(), 1);
            assert_eq!(violations[0].org_ids, vec![org.id.0]);
        }
    }

    #[tokio::test]
    async fn test_customer_checked_per_billing_account() {
        let store = Arc::new(MemoryStore::new());
        let mut team = plan("team", 100, 1);
        team.billing_account = "presspass".to_string();
        let mut org = Organization::new("Newsroom", false, false);
        org.plan = Some(team.id);
        org.next_plan = Some(team.id);
        // A customer on another account does not cover this subscription
        org.set_customer(DEFAULT_BILLING_ACCOUNT, "cus_1");

        let mut tx = store.begin().await.unwrap();
        tx.insert_plan(&team).await.unwrap();
        tx.insert_organization(&org).await.unwrap();
        tx.insert_subscription(&Subscription {
            id: SubscriptionId::new(),
            organization: org.id,
            plan: team.id,
            provider_subscription_id: "sub_1".to_string(),
            billing_account: "presspass".to_string(),
            created_at: OffsetDateTime::now_utc(),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let checker = InvariantChecker::new(store.clone(), SharedCatalog::default());
        let violations = checker.run_check("paid_subscription_has_customer").await.unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].context["billing_accounts"], serde_json::json!(["presspass"]));
    }
}
