//! Entitlement resolution
//!
//! Computes which entitlements a user can see (`viewable`), holds through a
//! paid subscription (`subscribed`), or administers through an OIDC client
//! (`owned`). Resolution only reads.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use squarelet_shared::{Entitlement, EntitlementId, OrgId, PlanId, Resources, User};

use crate::catalog::{Catalog, SharedCatalog};
use crate::error::{BillingError, BillingResult};
use crate::store::Store;

/// Which entitlement sets to return; both false means "viewable"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementQuery {
    #[serde(default)]
    pub subscribed: bool,
    #[serde(default)]
    pub owned: bool,
}

#[async_trait]
pub trait EntitlementResolver: Send + Sync {
    /// `None` is an anonymous viewer
    async fn viewable(&self, user: Option<&User>) -> BillingResult<Vec<Entitlement>>;

    async fn subscribed(&self, user: &User) -> BillingResult<Vec<Entitlement>>;

    async fn owned(&self, user: &User) -> BillingResult<Vec<Entitlement>>;
}

/// Answer an entitlement query: the union of the requested sets, or the
/// viewable set when none is requested. Deduplicated and ordered by name then id.
pub async fn resolve_entitlements(
    resolver: &dyn EntitlementResolver,
    user: Option<&User>,
    query: EntitlementQuery,
) -> BillingResult<Vec<Entitlement>> {
    if !query.subscribed && !query.owned {
        return resolver.viewable(user).await.map(finalize);
    }
    let Some(user) = user else {
        return Ok(Vec::new());
    };

    let mut result = Vec::new();
    if query.subscribed {
        result.extend(resolver.subscribed(user).await?);
    }
    if query.owned {
        result.extend(resolver.owned(user).await?);
    }
    Ok(finalize(result))
}

fn finalize(mut entitlements: Vec<Entitlement>) -> Vec<Entitlement> {
    entitlements.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
    entitlements.dedup_by(|a, b| a.id == b.id);
    entitlements
}

/// Resolver backed by the store and the plan catalog
pub struct StoreEntitlementResolver {
    store: Arc<dyn Store>,
    catalog: SharedCatalog,
}

impl StoreEntitlementResolver {
    pub fn new(store: Arc<dyn Store>, catalog: SharedCatalog) -> Self {
        Self { store, catalog }
    }

    async fn active_orgs(&self, user: &User) -> BillingResult<Vec<OrgId>> {
        Ok(self
            .store
            .memberships_for_user(user.id)
            .await?
            .into_iter()
            .filter(|m| m.is_active())
            .map(|m| m.organization)
            .collect())
    }


    /// Merged resources of everything the organization holds
    pub async fn organization_resources(&self, org_id: OrgId) -> BillingResult<Resources> {
        let org = self
            .store
            .get_organization(org_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Organization {} not found", org_id)))?;

        let mut plans: Vec<PlanId> = org.plan.into_iter().collect();
        for sub in self.store.subscriptions_for_orgs(&[org_id]).await? {
            if !plans.contains(&sub.plan) {
                plans.push(sub.plan);
            }
        }
        Ok(self.catalog.current().resolve_resources(&plans, org.max_users))
    }
}

fn collect(catalog: &Catalog, plans: impl IntoIterator<Item = PlanId>) -> Vec<Entitlement> {
    let mut ids = BTreeSet::new();
    for plan in plans.into_iter().filter_map(|id| catalog.plan(id)) {
        ids.extend(plan.entitlements.iter().copied());
    }
    lookup(catalog, ids)
}

fn lookup(catalog: &Catalog, ids: BTreeSet<EntitlementId>) -> Vec<Entitlement> {
    ids.into_iter()
        .filter_map(|id| catalog.entitlement(id).cloned())
        .collect()
}

#[async_trait]
impl EntitlementResolver for StoreEntitlementResolver {
    async fn viewable(&self, user: Option<&User>) -> BillingResult<Vec<Entitlement>> {
        let catalog = self.catalog.current();
        let public = catalog.plans().filter(|p| p.public).map(|p| p.id);
        let Some(user) = user else {
            return Ok(collect(&catalog, public.collect::<Vec<_>>()));
        };
        if user.is_staff {
            return Ok(catalog.entitlements().cloned().collect());
        }

        let orgs = self.active_orgs(user).await?;
        let mut plans: Vec<PlanId> = public.collect();
        for org in &orgs {
            if let Some(org) = self.store.get_organization(*org).await? {
                plans.extend(org.plan);
                plans.extend(org.next_plan);
            }
        }
        plans.extend(
            catalog
                .plans()
                .filter(|p| p.private_organizations.iter().any(|o| orgs.contains(o)))
                .map(|p| p.id),
        );

        let mut result = collect(&catalog, plans);
        result.extend(self.owned(user).await?);
        Ok(result)
    }

    async fn subscribed(&self, user: &User) -> BillingResult<Vec<Entitlement>> {
        let orgs = self.active_orgs(user).await?;
        if orgs.is_empty() {
            return Ok(Vec::new());
        }
        let plans: Vec<PlanId> = self
            .store
            .subscriptions_for_orgs(&orgs)
            .await?
            .into_iter()
            .map(|s| s.plan)
            .collect();
        Ok(collect(&self.catalog.current(), plans))
    }

    async fn owned(&self, user: &User) -> BillingResult<Vec<Entitlement>> {
        let admin_of: Vec<OrgId> = self
            .store
            .memberships_for_user(user.id)
            .await?
            .into_iter()
            .filter(|m| m.admin && m.is_active())
            .map(|m| m.organization)
            .collect();
        if admin_of.is_empty() {
            return Ok(Vec::new());
        }

        let clients: HashMap<_, _> = self
            .store
            .list_clients()
            .await?
            .into_iter()
            .map(|c| (c.id, c.owner))
            .collect();
        let catalog = self.catalog.current();
        let ids: BTreeSet<EntitlementId> = catalog
            .entitlements()
            .filter(|e| {
                clients
                    .get(&e.client)
                    .is_some_and(|owner| admin_of.contains(owner))
            })
            .map(|e| e.id)
            .collect();
        Ok(lookup(&catalog, ids))
    }
}
