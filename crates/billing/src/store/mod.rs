//! Persistence boundary
//!
//! Every multi-step mutation runs inside one [`StoreTx`]. Dropping a transaction
//! without calling [`StoreTx::commit`] rolls it back. Organization rows are read
//! through [`StoreTx::lock_organization`], which holds the row until the
//! transaction ends.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use squarelet_shared::{
    ChangeLog, Charge, Client, Entitlement, Invitation, InvitationId, Membership, OrgId, Organization,
    Plan, PlanId, Subscription, SubscriptionId, User, UserId,
};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::reconciliation::ReconciliationItem;

/// Half-open `[from, to)` time window
pub type DateRange = (OffsetDateTime, OffsetDateTime);

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> BillingResult<Box<dyn StoreTx>>;

    async fn get_organization(&self, id: OrgId) -> BillingResult<Option<Organization>>;

    async fn list_organizations(&self) -> BillingResult<Vec<Organization>>;

    /// Organizations whose billing cycle date is on or before `today`
    async fn organizations_due(&self, today: Date) -> BillingResult<Vec<Organization>>;

    async fn get_user(&self, id: UserId) -> BillingResult<Option<User>>;

    async fn memberships_for_user(&self, user: UserId) -> BillingResult<Vec<Membership>>;

    async fn memberships_for_org(&self, org: OrgId) -> BillingResult<Vec<Membership>>;

    async fn list_subscriptions(&self) -> BillingResult<Vec<Subscription>>;

    async fn subscriptions_for_orgs(&self, orgs: &[OrgId]) -> BillingResult<Vec<Subscription>>;

    async fn list_plans(&self) -> BillingResult<Vec<Plan>>;

    async fn list_entitlements(&self) -> BillingResult<Vec<Entitlement>>;

    async fn list_clients(&self) -> BillingResult<Vec<Client>>;

    /// Change log entries for an organization, oldest first
    async fn change_logs(
        &self,
        org: OrgId,
        range: Option<DateRange>,
    ) -> BillingResult<Vec<ChangeLog>>;

    async fn invitations_for_org(&self, org: OrgId) -> BillingResult<Vec<Invitation>>;

    /// Charges made to an organization, oldest first
    async fn charges_for_org(&self, org: OrgId) -> BillingResult<Vec<Charge>>;

    /// Written outside any transaction so it survives the rollback that caused it
    async fn record_reconciliation(&self, item: &ReconciliationItem) -> BillingResult<()>;

    async fn pending_reconciliations(&self) -> BillingResult<Vec<ReconciliationItem>>;

    async fn resolve_reconciliation(&self, id: Uuid) -> BillingResult<()>;
}

#[async_trait]
pub trait StoreTx: Send {
    /// Read an organization and hold its row until the transaction ends
    async fn lock_organization(&mut self, id: OrgId) -> BillingResult<Organization>;

    async fn insert_organization(&mut self, org: &Organization) -> BillingResult<()>;

    async fn save_organization(&mut self, org: &Organization) -> BillingResult<()>;

    async fn insert_user(&mut self, user: &User) -> BillingResult<()>;

    async fn subscriptions(&mut self, org: OrgId) -> BillingResult<Vec<Subscription>>;

    async fn insert_subscription(&mut self, sub: &Subscription) -> BillingResult<()>;

    async fn delete_subscription(&mut self, id: SubscriptionId) -> BillingResult<()>;

    async fn insert_change_log(&mut self, entry: &ChangeLog) -> BillingResult<()>;

    async fn memberships(&mut self, org: OrgId) -> BillingResult<Vec<Membership>>;

    async fn insert_membership(&mut self, membership: &Membership) -> BillingResult<()>;

    async fn update_membership(&mut self, membership: &Membership) -> BillingResult<()>;

    async fn delete_membership(&mut self, org: OrgId, user: UserId) -> BillingResult<bool>;

    async fn insert_invitation(&mut self, invitation: &Invitation) -> BillingResult<()>;

    /// Remove an invitation and return it
    async fn take_invitation(&mut self, id: InvitationId) -> BillingResult<Option<Invitation>>;

    async fn insert_plan(&mut self, plan: &Plan) -> BillingResult<()>;

    async fn insert_entitlement(&mut self, entitlement: &Entitlement) -> BillingResult<()>;

    async fn insert_client(&mut self, client: &Client) -> BillingResult<()>;

    /// Whether the plan row exists; holds it against deletion until the transaction ends
    async fn plan_exists(&mut self, plan: PlanId) -> BillingResult<bool>;

    async fn insert_charge(&mut self, charge: &Charge) -> BillingResult<()>;

    async fn count_plan_subscriptions(&mut self, plan: PlanId) -> BillingResult<u64>;

    /// Whether any organization has the plan as `plan` or `next_plan`
    async fn plan_referenced(&mut self, plan: PlanId) -> BillingResult<bool>;

    /// Null every organization and change log reference to the plan
    async fn detach_plan(&mut self, plan: PlanId) -> BillingResult<()>;

    async fn delete_plan(&mut self, plan: PlanId) -> BillingResult<()>;

    async fn update_plan_slug(&mut self, plan: PlanId, slug: &str) -> BillingResult<()>;

    async fn commit(self: Box<Self>) -> BillingResult<()>;
}

impl dyn StoreTx {
    /// Active (non-disabled) members of an organization
    pub async fn count_active_members(&mut self, org: OrgId) -> BillingResult<u32> {
        let memberships = self.memberships(org).await?;
        Ok(memberships.iter().filter(|m| m.is_active()).count() as u32)
    }
}
