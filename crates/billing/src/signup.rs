//! User registration with an optional paid plan
//!
//! Registration always succeeds on its own: the user and their individual
//! organization are committed first. A paid plan is applied afterwards, and a
//! failure there is handed back as a displayable [`PaymentError`]. A plan
//! offered to individuals subscribes the individual organization; a plan
//! offered to groups also creates and subscribes a group organization.

use std::sync::Arc;

use serde::Deserialize;
use squarelet_shared::{Organization, Plan, User};

use crate::catalog::SharedCatalog;
use crate::error::{BillingError, BillingResult, PaymentError};
use crate::invalidation::{InvalidationDispatcher, InvalidationModel};
use crate::organizations::{OrganizationService, PlanChange};
use crate::store::Store;

/// Seats a new group organization starts with
const GROUP_SIGNUP_SEATS: u32 = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct SignupRequest {
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub name: String,
    /// Plan slug; the free plan when absent
    #[serde(default)]
    pub plan: Option<String>,
    /// Tokenized payment method
    #[serde(default)]
    pub token: Option<String>,
    /// Required when the plan is offered to groups or not to individuals
    #[serde(default)]
    pub organization_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SignupOutcome {
    pub user: User,
    pub individual: Organization,
    pub group: Option<Organization>,
    /// Set when the user registered but the paid plan could not be applied
    pub payment_error: Option<PaymentError>,
}

pub struct SignupService {
    store: Arc<dyn Store>,
    catalog: SharedCatalog,
    organizations: OrganizationService,
    invalidation: InvalidationDispatcher,
}

impl SignupService {
    pub fn new(
        store: Arc<dyn Store>,
        organizations: OrganizationService,
        invalidation: InvalidationDispatcher,
    ) -> Self {
        Self {
            store,
            catalog: organizations.catalog().clone(),
            organizations,
            invalidation,
        }
    }

    pub async fn register(&self, request: SignupRequest) -> BillingResult<SignupOutcome> {
        let plan = self.requested_plan(&request)?;
        if request.username.trim().is_empty() || request.email.trim().is_empty() {
            return Err(BillingError::Validation(
                "Username and email are required".to_string(),
            ));
        }

        let user = User::new(request.username.trim(), request.email.trim(), request.name.trim());
        let mut tx = self.store.begin().await?;
        tx.insert_user(&user).await?;
        let individual = self
            .organizations
            .create_in(tx.as_mut(), &user.username, true, false, user.id)
            .await?;
        tx.commit().await?;

        tracing::info!(user_id = %user.id, username = %user.username, "Registered user");
        self.invalidation
            .dispatch(InvalidationModel::User, &[user.id.0])
            .await;

        let mut outcome = SignupOutcome {
            user,
            individual,
            group: None,
            payment_error: None,
        };
        let Some(plan) = plan.filter(|p| !p.free()) else {
            return Ok(outcome);
        };

        if let Err(err) = self.subscribe(&mut outcome, &plan, &request).await {
            tracing::warn!(
                user_id = %outcome.user.id,
                plan = %plan.slug,
                error = %err,
                "Registered without paid plan"
            );
            outcome.payment_error = Some(match err {
                BillingError::Payment(payment) => payment,
                other => PaymentError::new(other.user_message()),
            });
        }
        Ok(outcome)
    }

    /// Check the request against the catalog before anything is written
    fn requested_plan(&self, request: &SignupRequest) -> BillingResult<Option<Plan>> {
        let Some(slug) = request.plan.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let catalog = self.catalog.current();
        let plan = catalog
            .plan_by_slug(slug)
            .filter(|p| p.public)
            .ok_or_else(|| BillingError::Validation(format!("Unknown plan: {}", slug)))?;

        if !plan.free() && request.token.as_deref().map_or(true, str::is_empty) {
            return Err(BillingError::Validation(
                "A payment method is required for this plan".to_string(),
            ));
        }
        if (plan.for_groups || !plan.for_individuals)
            && request
                .organization_name
                .as_deref()
                .map_or(true, |n| n.trim().is_empty())
        {
            return Err(BillingError::Validation(
                "An organization name is required for this plan".to_string(),
            ));
        }
        Ok(Some(plan.clone()))
    }

    async fn subscribe(
        &self,
        outcome: &mut SignupOutcome,
        plan: &Plan,
        request: &SignupRequest,
    ) -> BillingResult<()> {
        let token = request.token.as_deref();
        if plan.for_individuals {
            outcome.individual = self
                .organizations
                .set_subscription(
                    outcome.individual.id,
                    PlanChange {
                        plan: plan.id,
                        max_users: 1,
                        token,
                        user: Some(outcome.user.id),
                    },
                )
                .await?;
        }
        if !plan.for_groups {
            return Ok(());
        }

        let name = request.organization_name.as_deref().unwrap_or_default();
        let group = self
            .organizations
            .create_organization(name, false, false, outcome.user.id)
            .await?;
        let group_id = group.id;
        outcome.group = Some(group);
        outcome.group = Some(
            self.organizations
                .set_subscription(
                    group_id,
                    PlanChange {
                        plan: plan.id,
                        max_users: GROUP_SIGNUP_SEATS.max(plan.minimum_users),
                        token,
                        user: Some(outcome.user.id),
                    },
                )
                .await?,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invalidation::MemorySink;
    use crate::mock::{CallCounts, MockProvider, DECLINED_TOKEN};
    use crate::provider::ProviderRegistry;
    use crate::reconciliation::ReconciliationQueue;
    use crate::store::MemoryStore;
    use crate::subscriptions::SubscriptionManager;
    use squarelet_shared::PlanId;

    fn plan(slug: &str, base: u32, min: u32, individuals: bool) -> Plan {
        Plan {
            id: PlanId::new(),
            slug: slug.to_string(),
            name: slug.to_string(),
            public: true,
            for_individuals: individuals,
            for_groups: !individuals,
            base_price: base,
            price_per_user: if individuals { 0 } else { 10 },
            minimum_users: min,
            entitlements: vec![],
            billing_account: "muckrock".to_string(),
            private_organizations: vec![],
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        provider: Arc<MockProvider>,
        service: SignupService,
        free: Plan,
        pro: Plan,
        group: Plan,
        both: Plan,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let mut free = plan("free", 0, 1, true);
        free.for_groups = true;
        free.price_per_user = 0;
        let pro = plan("professional", 40, 1, true);
        let group = plan("organization", 100, 7, false);
        let mut both = plan("newsroom", 60, 1, true);
        both.for_groups = true;

        let mut tx = store.begin().await.unwrap();
        for p in [&free, &pro, &group, &both] {
            tx.insert_plan(p).await.unwrap();
        }
        tx.commit().await.unwrap();

        let catalog = SharedCatalog::load(store.as_ref()).await.unwrap();
        let subscriptions = SubscriptionManager::new(
            ProviderRegistry::single(provider.clone()),
            ReconciliationQueue::new(store.clone()),
        );
        let invalidation = InvalidationDispatcher::new(store.clone(), Arc::new(MemorySink::new()));
        let organizations =
            OrganizationService::new(store.clone(), catalog, subscriptions, invalidation.clone());

        Fixture {
            service: SignupService::new(store.clone(), organizations, invalidation),
            store,
            provider,
            free,
            pro,
            group,
            both,
        }
    }

    fn request(plan: Option<&str>, token: Option<&str>) -> SignupRequest {
        SignupRequest {
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            name: "Alice".to_string(),
            plan: plan.map(str::to_string),
            token: token.map(str::to_string),
            organization_name: None,
        }
    }

    #[tokio::test]
    async fn test_free_signup_creates_individual_org() {
        let f = fixture().await;
        let outcome = f.service.register(request(None, None)).await.unwrap();

        assert_eq!(outcome.individual.name, "alice");
        assert!(outcome.individual.individual);
        assert_eq!(outcome.individual.plan, Some(f.free.id));
        assert!(outcome.group.is_none());
        assert!(outcome.payment_error.is_none());
        assert!(f.store.get_user(outcome.user.id).await.unwrap().is_some());
        assert_eq!(f.provider.calls().await, CallCounts::default());
    }

    #[tokio::test]
    async fn test_paid_individual_signup() {
        let f = fixture().await;
        let outcome = f
            .service
            .register(request(Some("professional"), Some("tok_visa")))
            .await
            .unwrap();

        assert_eq!(outcome.individual.plan, Some(f.pro.id));
        assert_eq!(outcome.individual.max_users, 1);
        assert!(outcome.individual.customer("muckrock").is_some());
        assert!(outcome.group.is_none());
        assert_eq!(f.provider.live_subscriptions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_paid_group_signup_uses_minimum_seats() {
        let f = fixture().await;
        let mut req = request(Some("organization"), Some("tok_visa"));
        req.organization_name = Some("Newsroom".to_string());
        let outcome = f.service.register(req).await.unwrap();

        let group = outcome.group.unwrap();
        assert_eq!(group.plan, Some(f.group.id));
        assert_eq!(group.max_users, 7);
        assert_eq!(outcome.individual.plan, Some(f.free.id));
        let members = f.store.memberships_for_org(group.id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert!(members[0].admin);
    }

    #[tokio::test]
    async fn test_declined_card_keeps_registration() {
        let f = fixture().await;
        let outcome = f
            .service
            .register(request(Some("professional"), Some(DECLINED_TOKEN)))
            .await
            .unwrap();

        let payment = outcome.payment_error.unwrap();
        assert_eq!(payment.code.as_deref(), Some("card_declined"));
        assert_eq!(outcome.individual.plan, Some(f.free.id));
        assert!(f.store.get_user(outcome.user.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_request_validation_writes_nothing() {
        let f = fixture().await;

        let err = f
            .service
            .register(request(Some("professional"), None))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        let err = f
            .service
            .register(request(Some("organization"), Some("tok_visa")))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        let err = f
            .service
            .register(request(Some("enterprise"), None))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        assert!(f.store.list_organizations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plan_for_individuals_and_groups_subscribes_both() {
        let f = fixture().await;
        let mut req = request(Some("newsroom"), Some("tok_visa"));
        req.organization_name = Some("Newsroom".to_string());
        let outcome = f.service.register(req).await.unwrap();

        assert!(outcome.payment_error.is_none());
        assert_eq!(outcome.individual.plan, Some(f.both.id));
        assert_eq!(outcome.individual.max_users, 1);
        let group = outcome.group.unwrap();
        assert_eq!(group.plan, Some(f.both.id));
        assert_eq!(group.max_users, GROUP_SIGNUP_SEATS);
        assert!(!group.individual);

        assert_eq!(f.provider.live_subscriptions().await.len(), 2);
        let subs = f.store.list_subscriptions().await.unwrap();
        let orgs: Vec<_> = subs.iter().map(|s| s.organization).collect();
        assert!(orgs.contains(&outcome.individual.id));
        assert!(orgs.contains(&group.id));
    }

    #[tokio::test]
    async fn test_plan_for_individuals_and_groups_needs_organization_name() {
        let f = fixture().await;
        let err = f
            .service
            .register(request(Some("newsroom"), Some("tok_visa")))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        assert!(f.store.list_organizations().await.unwrap().is_empty());
        assert_eq!(f.provider.calls().await, CallCounts::default());
    }
}
