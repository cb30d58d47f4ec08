//! Plan and entitlement catalog
//!
//! The catalog is an immutable snapshot of plans and entitlements loaded from
//! the store. Services share a [`SharedCatalog`] handle and take the current
//! snapshot per operation; [`PlanAdmin`] publishes a fresh snapshot after every
//! committed write.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use squarelet_shared::{slugify, Entitlement, EntitlementId, Organization, Plan, PlanId, Resources};

use crate::error::{BillingError, BillingResult};
use crate::store::Store;

/// Threshold keys where the strictest (largest) value wins
const MAX_KEYS: &[&str] = &["minimum_users", "feature_level"];

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    plans: HashMap<PlanId, Plan>,
    by_slug: HashMap<String, PlanId>,
    entitlements: HashMap<EntitlementId, Entitlement>,
}

impl Catalog {
    pub fn new(plans: Vec<Plan>, entitlements: Vec<Entitlement>) -> Self {
        let by_slug = plans.iter().map(|p| (p.slug.clone(), p.id)).collect();
        Self {
            plans: plans.into_iter().map(|p| (p.id, p)).collect(),
            by_slug,
            entitlements: entitlements.into_iter().map(|e| (e.id, e)).collect(),
        }
    }

    pub async fn load(store: &dyn Store) -> BillingResult<Self> {
        let plans = store.list_plans().await?;
        let entitlements = store.list_entitlements().await?;
        tracing::debug!(
            plans = plans.len(),
            entitlements = entitlements.len(),
            "Loaded plan catalog"
        );
        Ok(Self::new(plans, entitlements))
    }

    pub fn plan(&self, id: PlanId) -> Option<&Plan> {
        self.plans.get(&id)
    }

    pub fn plan_by_slug(&self, slug: &str) -> Option<&Plan> {
        self.by_slug.get(slug).and_then(|id| self.plans.get(id))
    }

    pub fn require_plan(&self, id: PlanId) -> BillingResult<&Plan> {
        self.plan(id)
            .ok_or_else(|| BillingError::NotFound(format!("Plan {} not found", id)))
    }

    /// The plan new organizations start on, when one is configured
    pub fn free_plan(&self) -> Option<&Plan> {
        self.plan_by_slug(Plan::FREE_SLUG)
    }

    pub fn plans(&self) -> impl Iterator<Item = &Plan> {
        self.plans.values()
    }

    pub fn entitlement(&self, id: EntitlementId) -> Option<&Entitlement> {
        self.entitlements.get(&id)
    }

    pub fn entitlements(&self) -> impl Iterator<Item = &Entitlement> {
        self.entitlements.values()
    }

    /// Entitlements of a plan in the plan's display order
    pub fn plan_entitlements<'a>(&'a self, plan: &'a Plan) -> impl Iterator<Item = &'a Entitlement> {
        plan.entitlements
            .iter()
            .filter_map(|id| self.entitlements.get(id))
    }

    /// Whether the organization may select this plan
    pub fn available_to(plan: &Plan, org: &Organization) -> bool {
        plan.public || plan.private_organizations.contains(&org.id) || org.plan == Some(plan.id)
    }

    /// Check a plan and seat count for an organization without side effects
    pub fn validate_selection(
        &self,
        plan: &Plan,
        org: &Organization,
        max_users: u32,
        active_members: u32,
    ) -> BillingResult<()> {
        if org.individual && !plan.for_individuals {
            return Err(BillingError::Validation(format!(
                "The {} plan is not available to individuals",
                plan.name
            )));
        }
        if !org.individual && !plan.for_groups {
            return Err(BillingError::Validation(format!(
                "The {} plan is not available to organizations",
                plan.name
            )));
        }
        if max_users < plan.minimum_users {
            return Err(BillingError::Validation(format!(
                "The {} plan requires at least {} users",
                plan.name, plan.minimum_users
            )));
        }
        if org.individual && max_users != 1 && !plan.multi_seat_individual() {
            return Err(BillingError::Validation(
                "Individual organizations have exactly one user".to_string(),
            ));
        }
        if max_users < active_members {
            return Err(BillingError::Validation(format!(
                "Cannot set users below the current member count of {}",
                active_members
            )));
        }
        if !Self::available_to(plan, org) {
            return Err(BillingError::Validation(format!(
                "The {} plan is not available to this organization",
                plan.name
            )));
        }
        Ok(())
    }

    /// Merge the resources of every entitlement granted by the given plans.
    ///
    /// Entitlements shared by several plans count once. Numbers sum except for
    /// threshold keys, which take the maximum; flags OR together.
    /// `monthly_requests` is derived as `base_requests + requests_per_user * seats`.
    pub fn resolve_resources(&self, plans: &[PlanId], seats: u32) -> Resources {
        let mut seen = BTreeSet::new();
        let mut merged: BTreeMap<String, Value> = BTreeMap::new();

        for plan in plans.iter().filter_map(|id| self.plans.get(id)) {
            for entitlement in self.plan_entitlements(plan) {
                if !seen.insert(entitlement.id) {
                    continue;
                }
                for (key, value) in entitlement.resources.iter() {
                    let combined = match merged.get(key) {
                        Some(existing) => merge_value(key, existing, value),
                        None => value.clone(),
                    };
                    merged.insert(key.clone(), combined);
                }
            }
        }

        let mut resources = Resources(merged);
        if resources.0.contains_key("base_requests") || resources.0.contains_key("requests_per_user")
        {
            let base = resources.get_u64("base_requests").unwrap_or(0);
            let per_user = resources.get_u64("requests_per_user").unwrap_or(0);
            let monthly = base.saturating_add(per_user.saturating_mul(seats as u64));
            resources = resources.with("monthly_requests", monthly);
        }
        resources
    }
}

/// Shared handle to the current catalog snapshot
#[derive(Clone, Default)]
pub struct SharedCatalog {
    inner: Arc<RwLock<Arc<Catalog>>>,
}

impl SharedCatalog {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(catalog))),
        }
    }

    pub async fn load(store: &dyn Store) -> BillingResult<Self> {
        Ok(Self::new(Catalog::load(store).await?))
    }

    /// Snapshot to use for the rest of one operation
    pub fn current(&self) -> Arc<Catalog> {
        self.inner.read().clone()
    }

    pub fn publish(&self, catalog: Catalog) {
        *self.inner.write() = Arc::new(catalog);
    }

    pub async fn reload(&self, store: &dyn Store) -> BillingResult<Arc<Catalog>> {
        let catalog = Arc::new(Catalog::load(store).await?);
        *self.inner.write() = catalog.clone();
        Ok(catalog)
    }
}

impl From<Catalog> for SharedCatalog {
    fn from(catalog: Catalog) -> Self {
        Self::new(catalog)
    }
}

fn merge_value(key: &str, existing: &Value, incoming: &Value) -> Value {
    match (existing, incoming) {
        (Value::Bool(a), Value::Bool(b)) => Value::Bool(*a || *b),
        (Value::Number(a), Value::Number(b)) => {
            let take_max = MAX_KEYS.contains(&key);
            match (a.as_u64(), b.as_u64()) {
                (Some(a), Some(b)) if take_max => Value::from(a.max(b)),
                (Some(a), Some(b)) => Value::from(a.saturating_add(b)),
                _ => {
                    let a = a.as_f64().unwrap_or(0.0);
                    let b = b.as_f64().unwrap_or(0.0);
                    if take_max {
                        Value::from(a.max(b))
                    } else {
                        Value::from(a + b)
                    }
                }
            }
        }
        // Mismatched or non-mergeable values keep the first grant
        _ => existing.clone(),
    }
}

/// Plan administration against the store
pub struct PlanAdmin {
    store: Arc<dyn Store>,
    catalog: SharedCatalog,
}

impl PlanAdmin {
    pub fn new(store: Arc<dyn Store>, catalog: SharedCatalog) -> Self {
        Self { store, catalog }
    }

    /// Publish the committed plan data to every service sharing the catalog
    async fn refresh(&self) {
        if let Err(e) = self.catalog.reload(self.store.as_ref()).await {
            tracing::warn!(error = %e, "Failed to reload plan catalog");
        }
    }

    pub async fn create_plan(&self, plan: &Plan) -> BillingResult<()> {
        if plan.slug.is_empty() || slugify(&plan.slug) != plan.slug {
            return Err(BillingError::Validation(format!(
                "'{}' is not a valid plan slug",
                plan.slug
            )));
        }
        if plan.minimum_users == 0 {
            return Err(BillingError::Validation(
                "Plans require at least one user".to_string(),
            ));
        }
        let mut tx = self.store.begin().await?;
        tx.insert_plan(plan).await?;
        tx.commit().await?;
        self.refresh().await;
        tracing::info!(plan = %plan.slug, "Created plan");
        Ok(())
    }

    pub async fn create_entitlement(&self, entitlement: &Entitlement) -> BillingResult<()> {
        let mut tx = self.store.begin().await?;
        tx.insert_entitlement(entitlement).await?;
        tx.commit().await?;
        self.refresh().await;
        Ok(())
    }

    /// Delete a plan, nulling organization and change log references to it.
    /// Refused while any subscription is still on the plan.
    pub async fn delete_plan(&self, plan: PlanId) -> BillingResult<()> {
        let mut tx = self.store.begin().await?;
        let subscriptions = tx.count_plan_subscriptions(plan).await?;
        if subscriptions > 0 {
            return Err(BillingError::Validation(format!(
                "Plan has {} active subscriptions and cannot be deleted",
                subscriptions
            )));
        }
        tx.detach_plan(plan).await?;
        tx.delete_plan(plan).await?;
        tx.commit().await?;
        self.refresh().await;

        tracing::info!(plan_id = %plan, "Deleted plan");
        Ok(())
    }

    /// Rename a plan's slug. Refused while any organization is on the plan,
    /// since the provider plan identifier derives from it.
    pub async fn change_slug(&self, plan: PlanId, slug: &str) -> BillingResult<()> {
        if slug.is_empty() || slugify(slug) != slug {
            return Err(BillingError::Validation(format!(
                "'{}' is not a valid plan slug",
                slug
            )));
        }
        let mut tx = self.store.begin().await?;
        if tx.plan_referenced(plan).await? {
            return Err(BillingError::Validation(
                "Plan slug cannot change while organizations are on the plan".to_string(),
            ));
        }
        tx.update_plan_slug(plan, slug).await?;
        tx.commit().await?;
        self.refresh().await;

        tracing::info!(plan_id = %plan, slug, "Changed plan slug");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use squarelet_shared::ClientId;

    fn plan(slug: &str, individuals: bool, groups: bool, price_per_user: u32, min: u32) -> Plan {
        Plan {
            id: PlanId::new(),
            slug: slug.to_string(),
            name: slug.to_string(),
            public: true,
            for_individuals: individuals,
            for_groups: groups,
            base_price: 20,
            price_per_user,
            minimum_users: min,
            entitlements: vec![],
            billing_account: "muckrock".to_string(),
            private_organizations: vec![],
        }
    }

    #[test]
    fn test_validate_selection_rules() {
        let catalog = Catalog::default();
        let individual = Organization::new("alice", true, false);
        let group = Organization::new("Newsroom", false, false);
        let pro = plan("professional", true, false, 0, 1);
        let org_plan = plan("organization", false, true, 10, 5);

        assert!(catalog.validate_selection(&pro, &individual, 1, 1).is_ok());
        assert!(catalog.validate_selection(&pro, &individual, 2, 1).is_err());
        assert!(catalog.validate_selection(&pro, &group, 5, 1).is_err());
        assert!(catalog.validate_selection(&org_plan, &individual, 5, 1).is_err());
        assert!(catalog.validate_selection(&org_plan, &group, 4, 1).is_err());
        assert!(catalog.validate_selection(&org_plan, &group, 5, 6).is_err());
        assert!(catalog.validate_selection(&org_plan, &group, 6, 6).is_ok());
    }

    #[test]
    fn test_multi_seat_individual_plan_allows_extra_seats() {
        let catalog = Catalog::default();
        let individual = Organization::new("alice", true, false);
        let multi = plan("pro-team", true, false, 5, 1);
        assert!(catalog.validate_selection(&multi, &individual, 3, 1).is_ok());
    }

    #[test]
    fn test_private_plan_requires_listing() {
        let catalog = Catalog::default();
        let org = Organization::new("Newsroom", false, false);
        let mut private = plan("enterprise", false, true, 0, 1);
        private.public = false;
        assert!(catalog.validate_selection(&private, &org, 5, 1).is_err());
        private.private_organizations.push(org.id);
        assert!(catalog.validate_selection(&private, &org, 5, 1).is_ok());
    }

    #[test]
    fn test_resolve_resources_merges_by_kind() {
        let client = ClientId::new();
        let a = Entitlement::new(
            "Basic",
            "",
            client,
            Resources::new()
                .with("base_requests", 50u64)
                .with("requests_per_user", 10u64)
                .with("feature_level", 1u64)
                .with("proxy", true),
        );
        let b = Entitlement::new(
            "Extra",
            "",
            client,
            Resources::new()
                .with("base_requests", 25u64)
                .with("feature_level", 2u64)
                .with("proxy", false)
                .with("crowdfunds", 3u64),
        );
        let mut p1 = plan("one", true, true, 0, 1);
        p1.entitlements = vec![a.id];
        let mut p2 = plan("two", true, true, 0, 1);
        p2.entitlements = vec![b.id, a.id];
        let ids = [p1.id, p2.id];
        let catalog = Catalog::new(vec![p1, p2], vec![a, b]);

        let resources = catalog.resolve_resources(&ids, 3);
        assert_eq!(resources.get_u64("base_requests"), Some(75));
        assert_eq!(resources.get_u64("requests_per_user"), Some(10));
        assert_eq!(resources.get_u64("monthly_requests"), Some(105));
        assert_eq!(resources.get_u64("feature_level"), Some(2));
        assert_eq!(resources.get_u64("crowdfunds"), Some(3));
        assert_eq!(resources.get_bool("proxy"), Some(true));
    }

    #[test]
    fn test_monthly_requests_saturate() {
        let client = ClientId::new();
        let huge = Entitlement::new(
            "Unlimited",
            "",
            client,
            Resources::new()
                .with("base_requests", u64::MAX - 1)
                .with("requests_per_user", u64::MAX / 2),
        );
        let mut p = plan("unlimited", false, true, 0, 1);
        p.entitlements = vec![huge.id];
        let id = p.id;
        let catalog = Catalog::new(vec![p], vec![huge]);

        let resources = catalog.resolve_resources(&[id], 10);
        assert_eq!(resources.get_u64("monthly_requests"), Some(u64::MAX));
    }

    #[tokio::test]
    async fn test_plan_admin_publishes_catalog() {
        let store: Arc<dyn Store> = Arc::new(crate::store::MemoryStore::new());
        let shared = SharedCatalog::load(store.as_ref()).await.unwrap();
        let admin = PlanAdmin::new(store, shared.clone());
        let team = plan("team", false, true, 10, 5);

        admin.create_plan(&team).await.unwrap();
        assert!(shared.current().plan_by_slug("team").is_some());

        admin.change_slug(team.id, "newsroom").await.unwrap();
        assert!(shared.current().plan_by_slug("team").is_none());
        assert_eq!(shared.current().plan_by_slug("newsroom").map(|p| p.id), Some(team.id));

        admin.delete_plan(team.id).await.unwrap();
        assert!(shared.current().plan(team.id).is_none());
    }

    #[test]
    fn test_lookup_by_slug() {
        let free = plan("free", true, true, 0, 1);
        let id = free.id;
        let catalog = Catalog::new(vec![free], vec![]);
        assert_eq!(catalog.free_plan().map(|p| p.id), Some(id));
        assert!(catalog.plan_by_slug("missing").is_none());
        assert!(catalog.require_plan(PlanId::new()).is_err());
    }
}
