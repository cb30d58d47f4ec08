//! In-memory store for tests and local development
//!
//! Transactions are serialized by an async mutex held for the life of the
//! transaction, which stands in for row locks. Each transaction works on a copy
//! of the data that replaces the shared state on commit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use squarelet_shared::{
    ChangeLog, Charge, Client, ClientId, Entitlement, EntitlementId, Invitation, InvitationId, Membership,
    OrgId, Organization, Plan, PlanId, Subscription, SubscriptionId, User, UserId,
};
use time::Date;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{DateRange, Store, StoreTx};
use crate::error::{BillingError, BillingResult};
use crate::reconciliation::ReconciliationItem;

#[derive(Debug, Clone, Default)]
struct Data {
    organizations: HashMap<OrgId, Organization>,
    users: HashMap<UserId, User>,
    memberships: HashMap<(OrgId, UserId), Membership>,
    invitations: HashMap<InvitationId, Invitation>,
    plans: HashMap<PlanId, Plan>,
    entitlements: HashMap<EntitlementId, Entitlement>,
    clients: HashMap<ClientId, Client>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    change_logs: Vec<ChangeLog>,
    charges: Vec<Charge>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    committed: Arc<StdMutex<Data>>,
    tx_lock: Arc<Mutex<()>>,
    reconciliation: Arc<StdMutex<Vec<ReconciliationItem>>>,
    fail_next_commit: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail, discarding the transaction's writes
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    fn read<T>(&self, f: impl FnOnce(&Data) -> T) -> BillingResult<T> {
        let data = self
            .committed
            .lock()
            .map_err(|_| BillingError::Internal("memory store poisoned".to_string()))?;
        Ok(f(&data))
    }

    fn reconciliation_items<T>(
        &self,
        f: impl FnOnce(&mut Vec<ReconciliationItem>) -> T,
    ) -> BillingResult<T> {
        let mut items = self
            .reconciliation
            .lock()
            .map_err(|_| BillingError::Internal("memory store poisoned".to_string()))?;
        Ok(f(&mut items))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> BillingResult<Box<dyn StoreTx>> {
        let guard = self.tx_lock.clone().lock_owned().await;
        let working = self.read(|d| d.clone())?;
        Ok(Box::new(MemoryTx {
            _guard: guard,
            working,
            store: self.clone(),
        }))
    }

    async fn get_organization(&self, id: OrgId) -> BillingResult<Option<Organization>> {
        self.read(|d| d.organizations.get(&id).cloned())
    }

    async fn list_organizations(&self) -> BillingResult<Vec<Organization>> {
        self.read(|d| {
            let mut orgs: Vec<_> = d.organizations.values().cloned().collect();
            orgs.sort_by_key(|o| (o.created_at, o.id));
            orgs
        })
    }

    async fn organizations_due(&self, today: Date) -> BillingResult<Vec<Organization>> {
        self.read(|d| {
            let mut orgs: Vec<_> = d
                .organizations
                .values()
                .filter(|o| o.cycle_ended(today))
                .cloned()
                .collect();
            orgs.sort_by_key(|o| (o.update_on, o.id));
            orgs
        })
    }

    async fn get_user(&self, id: UserId) -> BillingResult<Option<User>> {
        self.read(|d| d.users.get(&id).cloned())
    }

    async fn memberships_for_user(&self, user: UserId) -> BillingResult<Vec<Membership>> {
        self.read(|d| {
            d.memberships
                .values()
                .filter(|m| m.user == user)
                .cloned()
                .collect()
        })
    }

    async fn memberships_for_org(&self, org: OrgId) -> BillingResult<Vec<Membership>> {
        self.read(|d| members_of(d, org))
    }

    async fn list_subscriptions(&self) -> BillingResult<Vec<Subscription>> {
        self.read(|d| {
            let mut subs: Vec<_> = d.subscriptions.values().cloned().collect();
            subs.sort_by_key(|s| (s.created_at, s.id));
            subs
        })
    }

    async fn subscriptions_for_orgs(&self, orgs: &[OrgId]) -> BillingResult<Vec<Subscription>> {
        self.read(|d| {
            d.subscriptions
                .values()
                .filter(|s| orgs.contains(&s.organization))
                .cloned()
                .collect()
        })
    }

    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        self.read(|d| d.plans.values().cloned().collect())
    }

    async fn list_entitlements(&self) -> BillingResult<Vec<Entitlement>> {
        self.read(|d| d.entitlements.values().cloned().collect())
    }

    async fn list_clients(&self) -> BillingResult<Vec<Client>> {
        self.read(|d| {
            let mut clients: Vec<_> = d.clients.values().cloned().collect();
            clients.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
            clients
        })
    }

    async fn change_logs(
        &self,
        org: OrgId,
        range: Option<DateRange>,
    ) -> BillingResult<Vec<ChangeLog>> {
        self.read(|d| {
            d.change_logs
                .iter()
                .filter(|c| c.organization == org)
                .filter(|c| match range {
                    Some((from, to)) => c.created_at >= from && c.created_at < to,
                    None => true,
                })
                .cloned()
                .collect()
        })
    }

    async fn invitations_for_org(&self, org: OrgId) -> BillingResult<Vec<Invitation>> {
        self.read(|d| {
            let mut invitations: Vec<_> = d
                .invitations
                .values()
                .filter(|i| i.organization == org)
                .cloned()
                .collect();
            invitations.sort_by_key(|i| (i.created_at, i.id));
            invitations
        })
    }

    async fn charges_for_org(&self, org: OrgId) -> BillingResult<Vec<Charge>> {
        self.read(|d| {
            d.charges
                .iter()
                .filter(|c| c.organization == org)
                .cloned()
                .collect()
        })
    }

    async fn record_reconciliation(&self, item: &ReconciliationItem) -> BillingResult<()> {
        self.reconciliation_items(|items| items.push(item.clone()))
    }

    async fn pending_reconciliations(&self) -> BillingResult<Vec<ReconciliationItem>> {
        self.reconciliation_items(|items| {
            items
                .iter()
                .filter(|i| i.resolved_at.is_none())
                .cloned()
                .collect()
        })
    }

    async fn resolve_reconciliation(&self, id: Uuid) -> BillingResult<()> {
        self.reconciliation_items(|items| {
            if let Some(item) = items.iter_mut().find(|i| i.id == id) {
                item.resolved_at = Some(time::OffsetDateTime::now_utc());
            }
        })
    }
}

fn members_of(data: &Data, org: OrgId) -> Vec<Membership> {
    let mut members: Vec<_> = data
        .memberships
        .values()
        .filter(|m| m.organization == org)
        .cloned()
        .collect();
    members.sort_by_key(|m| (m.created_at, m.user));
    members
}

struct MemoryTx {
    _guard: OwnedMutexGuard<()>,
    working: Data,
    store: MemoryStore,
}

impl MemoryTx {
    fn require_org(&self, id: OrgId) -> BillingResult<()> {
        if self.working.organizations.contains_key(&id) {
            Ok(())
        } else {
            Err(BillingError::NotFound(format!("Organization {} not found", id)))
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn lock_organization(&mut self, id: OrgId) -> BillingResult<Organization> {
        self.working
            .organizations
            .get(&id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("Organization {} not found", id)))
    }

    async fn insert_organization(&mut self, org: &Organization) -> BillingResult<()> {
        self.working.organizations.insert(org.id, org.clone());
        Ok(())
    }

    async fn save_organization(&mut self, org: &Organization) -> BillingResult<()> {
        self.require_org(org.id)?;
        self.working.organizations.insert(org.id, org.clone());
        Ok(())
    }

    async fn insert_user(&mut self, user: &User) -> BillingResult<()> {
        if self
            .working
            .users
            .values()
            .any(|u| u.username == user.username)
        {
            return Err(BillingError::Validation(format!(
                "Username {} is already taken",
                user.username
            )));
        }
        self.working.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn subscriptions(&mut self, org: OrgId) -> BillingResult<Vec<Subscription>> {
        let mut subs: Vec<_> = self
            .working
            .subscriptions
            .values()
            .filter(|s| s.organization == org)
            .cloned()
            .collect();
        subs.sort_by_key(|s| (s.created_at, s.id));
        Ok(subs)
    }

    async fn insert_subscription(&mut self, sub: &Subscription) -> BillingResult<()> {
        if self
            .working
            .subscriptions
            .values()
            .any(|s| s.organization == sub.organization && s.plan == sub.plan)
        {
            return Err(BillingError::Database(format!(
                "duplicate subscription for organization {} and plan {}",
                sub.organization, sub.plan
            )));
        }
        self.working.subscriptions.insert(sub.id, sub.clone());
        Ok(())
    }

    async fn delete_subscription(&mut self, id: SubscriptionId) -> BillingResult<()> {
        self.working.subscriptions.remove(&id);
        Ok(())
    }

    async fn insert_change_log(&mut self, entry: &ChangeLog) -> BillingResult<()> {
        self.working.change_logs.push(entry.clone());
        Ok(())
    }

    async fn memberships(&mut self, org: OrgId) -> BillingResult<Vec<Membership>> {
        Ok(members_of(&self.working, org))
    }

    async fn insert_membership(&mut self, membership: &Membership) -> BillingResult<()> {
        let key = (membership.organization, membership.user);
        if self.working.memberships.contains_key(&key) {
            return Err(BillingError::Validation(
                "User is already a member of this organization".to_string(),
            ));
        }
        self.working.memberships.insert(key, membership.clone());
        Ok(())
    }

    async fn update_membership(&mut self, membership: &Membership) -> BillingResult<()> {
        let key = (membership.organization, membership.user);
        match self.working.memberships.get_mut(&key) {
            Some(existing) => {
                *existing = membership.clone();
                Ok(())
            }
            None => Err(BillingError::NotFound("Membership not found".to_string())),
        }
    }

    async fn delete_membership(&mut self, org: OrgId, user: UserId) -> BillingResult<bool> {
        Ok(self.working.memberships.remove(&(org, user)).is_some())
    }

    async fn insert_invitation(&mut self, invitation: &Invitation) -> BillingResult<()> {
        self.working
            .invitations
            .insert(invitation.id, invitation.clone());
        Ok(())
    }

    async fn take_invitation(&mut self, id: InvitationId) -> BillingResult<Option<Invitation>> {
        Ok(self.working.invitations.remove(&id))
    }

    async fn insert_plan(&mut self, plan: &Plan) -> BillingResult<()> {
        if self
            .working
            .plans
            .values()
            .any(|p| p.slug == plan.slug && p.id != plan.id)
        {
            return Err(BillingError::Validation(format!(
                "Plan slug {} is already in use",
                plan.slug
            )));
        }
        self.working.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn insert_entitlement(&mut self, entitlement: &Entitlement) -> BillingResult<()> {
        self.working
            .entitlements
            .insert(entitlement.id, entitlement.clone());
        Ok(())
    }

    async fn insert_client(&mut self, client: &Client) -> BillingResult<()> {
        self.working.clients.insert(client.id, client.clone());
        Ok(())
    }

    async fn plan_exists(&mut self, plan: PlanId) -> BillingResult<bool> {
        Ok(self.working.plans.contains_key(&plan))
    }

    async fn insert_charge(&mut self, charge: &Charge) -> BillingResult<()> {
        self.require_org(charge.organization)?;
        self.working.charges.push(charge.clone());
        Ok(())
    }

    async fn count_plan_subscriptions(&mut self, plan: PlanId) -> BillingResult<u64> {
        Ok(self
            .working
            .subscriptions
            .values()
            .filter(|s| s.plan == plan)
            .count() as u64)
    }

    async fn plan_referenced(&mut self, plan: PlanId) -> BillingResult<bool> {
        Ok(self
            .working
            .organizations
            .values()
            .any(|o| o.plan == Some(plan) || o.next_plan == Some(plan)))
    }

    async fn detach_plan(&mut self, plan: PlanId) -> BillingResult<()> {
        let target = Some(plan);
        for org in self.working.organizations.values_mut() {
            if org.plan == target {
                org.plan = None;
            }
            if org.next_plan == target {
                org.next_plan = None;
            }
        }
        for entry in self.working.change_logs.iter_mut() {
            for field in [
                &mut entry.from_plan,
                &mut entry.to_plan,
                &mut entry.from_next_plan,
                &mut entry.to_next_plan,
            ] {
                if *field == target {
                    *field = None;
                }
            }
        }
        Ok(())
    }

    async fn delete_plan(&mut self, plan: PlanId) -> BillingResult<()> {
        self.working.plans.remove(&plan);
        Ok(())
    }

    async fn update_plan_slug(&mut self, plan: PlanId, slug: &str) -> BillingResult<()> {
        if self
            .working
            .plans
            .values()
            .any(|p| p.slug == slug && p.id != plan)
        {
            return Err(BillingError::Validation(format!(
                "Plan slug {} is already in use",
                slug
            )));
        }
        match self.working.plans.get_mut(&plan) {
            Some(p) => {
                p.slug = slug.to_string();
                Ok(())
            }
            None => Err(BillingError::NotFound(format!("Plan {} not found", plan))),
        }
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        let this = *self;
        if this.store.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(BillingError::Database("injected commit failure".to_string()));
        }
        let mut committed = this
            .store
            .committed
            .lock()
            .map_err(|_| BillingError::Internal("memory store poisoned".to_string()))?;
        *committed = this.working;
        Ok(())
    }
}
