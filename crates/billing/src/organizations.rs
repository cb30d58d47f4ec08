//! Organization lifecycle
//!
//! Plan and seat transitions for organizations:
//!
//! ```text
//! NoPlan -> Active -> PendingChange (next_plan != plan) -> Active (rollover)
//! Active -> Cancelled (plan cleared, billing customer retained)
//! ```
//!
//! Each mutation locks the organization row, validates before contacting the
//! billing provider, and writes exactly one change log entry in the same
//! transaction. Cache invalidations go out after commit. A pending plan change
//! takes effect when [`OrganizationService::rollover_due`] finds the
//! organization's billing cycle date has arrived.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use squarelet_shared::{
    next_billing_date, ChangeLogReason, Membership, OrgId, Organization, Plan, PlanId,
    PlanSnapshot, UserId,
};
use time::{Date, OffsetDateTime};

use crate::catalog::{Catalog, SharedCatalog};
use crate::changelog::ChangeLogRecorder;
use crate::error::{BillingError, BillingResult};
use crate::invalidation::{InvalidationDispatcher, InvalidationModel};
use crate::store::{Store, StoreTx};
use crate::subscriptions::{ProviderEffects, SubscriptionManager};

/// What happens to the plan when an organization cancels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelDisposition {
    /// Keep the plan until the cycle ends, then move to the free plan
    #[default]
    KeepPlan,
    /// Move to the free plan immediately
    RevertToFree,
    /// Clear the plan entirely
    ClearPlan,
}

/// A plan change request for [`OrganizationService::set_subscription`]
#[derive(Debug, Clone)]
pub struct PlanChange<'a> {
    pub plan: PlanId,
    pub max_users: u32,
    /// Tokenized payment method, required when no customer is on file
    pub token: Option<&'a str>,
    pub user: Option<UserId>,
}

/// Outcome of one billing cycle pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RolloverReport {
    pub organizations_checked: usize,
    /// Organizations moved onto their next plan
    pub rolled_over: usize,
    /// Organizations whose cycle date moved forward with no plan change
    pub cycles_advanced: usize,
    pub failures: usize,
}

enum CycleOutcome {
    NotDue,
    Advanced,
    RolledOver,
}

#[derive(Clone)]
pub struct OrganizationService {
    store: Arc<dyn Store>,
    catalog: SharedCatalog,
    subscriptions: SubscriptionManager,
    invalidation: InvalidationDispatcher,
}

impl OrganizationService {
    pub fn new(
        store: Arc<dyn Store>,
        catalog: SharedCatalog,
        subscriptions: SubscriptionManager,
        invalidation: InvalidationDispatcher,
    ) -> Self {
        Self {
            store,
            catalog,
            subscriptions,
            invalidation,
        }
    }

    pub fn catalog(&self) -> &SharedCatalog {
        &self.catalog
    }

    pub async fn get(&self, id: OrgId) -> BillingResult<Organization> {
        self.store
            .get_organization(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Organization {} not found", id)))
    }

    /// Create an organization on the free plan with the creator as its admin
    pub async fn create_organization(
        &self,
        name: &str,
        individual: bool,
        private: bool,
        creator: UserId,
    ) -> BillingResult<Organization> {
        let mut tx = self.store.begin().await?;
        let org = self
            .create_in(tx.as_mut(), name, individual, private, creator)
            .await?;
        tx.commit().await?;

        self.invalidation
            .dispatch(InvalidationModel::User, &[creator.0])
            .await;
        Ok(org)
    }

    /// Organization creation inside an existing transaction
    pub(crate) async fn create_in(
        &self,
        tx: &mut dyn StoreTx,
        name: &str,
        individual: bool,
        private: bool,
        creator: UserId,
    ) -> BillingResult<Organization> {
        if name.trim().is_empty() {
            return Err(BillingError::Validation(
                "Organization name must not be empty".to_string(),
            ));
        }
        let catalog = self.catalog.current();
        let mut org = Organization::new(name.trim(), individual, private);
        let free = catalog.free_plan().map(|p| p.id);
        org.plan = free;
        org.next_plan = free;
        org.update_on = Some(next_billing_date(OffsetDateTime::now_utc().date()));

        tx.insert_organization(&org).await?;
        tx.insert_membership(&Membership::new(org.id, creator, true))
            .await?;
        ChangeLogRecorder::record(
            tx,
            org.id,
            Some(creator),
            ChangeLogReason::Created,
            PlanSnapshot::default(),
            org.snapshot(),
        )
        .await?;

        tracing::info!(
            org_id = %org.id,
            individual,
            plan = ?catalog.free_plan().map(|p| p.slug.as_str()),
            "Created organization"
        );
        Ok(org)
    }

    /// Move the organization onto `change.plan` with `change.max_users` seats.
    ///
    /// The new subscription is created before subscriptions to other plans are
    /// cancelled. If the provider fails the organization is left unchanged.
    pub async fn set_subscription(
        &self,
        org_id: OrgId,
        change: PlanChange<'_>,
    ) -> BillingResult<Organization> {
        let catalog = self.catalog.current();
        let email = self.user_email(change.user).await?;

        let mut tx = self.store.begin().await?;
        let mut org = tx.lock_organization(org_id).await?;
        let plan = locked_plan(tx.as_mut(), &catalog, change.plan).await?;
        let active = tx.count_active_members(org.id).await?;
        catalog.validate_selection(&plan, &org, change.max_users, active)?;
        if !plan.free() {
            self.subscriptions.provider(&plan.billing_account)?;
            if org.customer(&plan.billing_account).is_none() && change.token.is_none() {
                return Err(BillingError::Validation(
                    "A payment method is required for this plan".to_string(),
                ));
            }
        }

        let before = org.snapshot();
        let today = OffsetDateTime::now_utc().date();
        let mut effects = ProviderEffects::new(org.id);
        let result = async {
            self.apply_plan(
                tx.as_mut(),
                &mut org,
                &plan,
                change.max_users,
                change.token,
                email.as_deref(),
                today,
                &mut effects,
            )
            .await?;
            self.finish(tx, &org, change.user, before).await
        }
        .await;

        if let Err(e) = result {
            self.subscriptions.report_failure(&effects, &e).await;
            return Err(e);
        }

        tracing::info!(
            org_id = %org.id,
            plan = %plan.slug,
            max_users = org.max_users,
            update_on = ?org.update_on,
            "Set organization subscription"
        );
        self.invalidation
            .dispatch(InvalidationModel::Organization, &[org.id.0])
            .await;
        Ok(org)
    }

    /// Change the seat count, synchronizing every provider subscription
    pub async fn update_max_users(
        &self,
        org_id: OrgId,
        user: Option<UserId>,
        max_users: u32,
    ) -> BillingResult<Organization> {
        let catalog = self.catalog.current();
        let mut tx = self.store.begin().await?;
        let mut org = tx.lock_organization(org_id).await?;
        let plan_id = org.plan.ok_or_else(|| {
            BillingError::Validation("Organization has no plan to add users to".to_string())
        })?;
        let plan = catalog.require_plan(plan_id)?;
        // Member counts are only enforced when a subscription is created
        catalog.validate_selection(plan, &org, max_users, 0)?;

        if max_users == org.max_users {
            return Ok(org);
        }

        let before = org.snapshot();
        let mut effects = ProviderEffects::new(org.id);
        let result = async {
            for sub in tx.subscriptions(org.id).await? {
                self.subscriptions
                    .modify(&sub, max_users, &mut effects)
                    .await?;
            }
            org.max_users = max_users;
            self.finish(tx, &org, user, before).await
        }
        .await;

        if let Err(e) = result {
            self.subscriptions.report_failure(&effects, &e).await;
            return Err(e);
        }

        tracing::info!(org_id = %org.id, max_users, "Updated organization seats");
        self.invalidation
            .dispatch(InvalidationModel::Organization, &[org.id.0])
            .await;
        Ok(org)
    }

    /// Cancel every provider subscription and apply the disposition to the plan
    pub async fn cancel_subscription(
        &self,
        org_id: OrgId,
        user: Option<UserId>,
        disposition: CancelDisposition,
    ) -> BillingResult<Organization> {
        let mut tx = self.store.begin().await?;
        let mut org = tx.lock_organization(org_id).await?;
        let before = org.snapshot();
        let free = self.catalog.current().free_plan().map(|p| p.id);
        let today = OffsetDateTime::now_utc().date();

        let mut effects = ProviderEffects::new(org.id);
        let result = async {
            for sub in tx.subscriptions(org.id).await? {
                self.subscriptions
                    .cancel(tx.as_mut(), &sub, &mut effects)
                    .await?;
            }
            org.subscription_id = None;
            match disposition {
                // The paid plan runs out the cycle it was billed for
                CancelDisposition::KeepPlan => {
                    org.next_plan = free;
                    if org.update_on.is_none() {
                        org.update_on = Some(today);
                    }
                }
                CancelDisposition::RevertToFree => {
                    org.plan = free;
                    org.next_plan = free;
                    org.update_on = Some(next_billing_date(today));
                }
                CancelDisposition::ClearPlan => {
                    org.plan = None;
                    org.next_plan = None;
                    org.update_on = None;
                }
            }
            self.finish(tx, &org, user, before).await
        }
        .await;

        if let Err(e) = result {
            self.subscriptions.report_failure(&effects, &e).await;
            return Err(e);
        }

        tracing::info!(
            org_id = %org.id,
            ?disposition,
            state = %org.state(),
            update_on = ?org.update_on,
            "Cancelled organization subscription"
        );
        self.invalidation
            .dispatch(InvalidationModel::Organization, &[org.id.0])
            .await;
        Ok(org)
    }

    /// Set the plan that takes effect at the next billing cycle.
    /// `None` cancels at cycle end.
    pub async fn schedule_plan_change(
        &self,
        org_id: OrgId,
        user: Option<UserId>,
        next_plan: Option<PlanId>,
    ) -> BillingResult<Organization> {
        let catalog = self.catalog.current();
        let mut tx = self.store.begin().await?;
        let mut org = tx.lock_organization(org_id).await?;

        if let Some(plan_id) = next_plan {
            let plan = locked_plan(tx.as_mut(), &catalog, plan_id).await?;
            catalog.validate_selection(&plan, &org, seats_for(&plan, &org), 0)?;
            if !plan.free() && org.customer(&plan.billing_account).is_none() {
                return Err(BillingError::Validation(
                    "A payment method on file is required to schedule this plan".to_string(),
                ));
            }
        }
        if org.next_plan == next_plan {
            return Ok(org);
        }

        let before = org.snapshot();
        org.next_plan = next_plan;
        if org.update_on.is_none() {
            org.update_on = Some(next_billing_date(OffsetDateTime::now_utc().date()));
        }
        self.finish(tx, &org, user, before).await?;

        tracing::info!(
            org_id = %org.id,
            next_plan = ?next_plan,
            update_on = ?org.update_on,
            "Scheduled plan change"
        );
        self.invalidation
            .dispatch(InvalidationModel::Organization, &[org.id.0])
            .await;
        Ok(org)
    }

    /// Apply `next_plan` now, without waiting for the billing cycle date
    pub async fn rollover(&self, org_id: OrgId) -> BillingResult<Organization> {
        let catalog = self.catalog.current();
        let today = OffsetDateTime::now_utc().date();
        let mut tx = self.store.begin().await?;
        let mut org = tx.lock_organization(org_id).await?;
        if org.next_plan == org.plan {
            return Ok(org);
        }

        let before = org.snapshot();
        let next = match org.next_plan {
            Some(id) => Some(locked_plan(tx.as_mut(), &catalog, id).await?),
            None => None,
        };

        let mut effects = ProviderEffects::new(org.id);
        let result = async {
            self.apply_next_plan(tx.as_mut(), &mut org, next.as_ref(), today, &mut effects)
                .await?;
            self.finish(tx, &org, None, before).await
        }
        .await;

        if let Err(e) = result {
            self.subscriptions.report_failure(&effects, &e).await;
            return Err(e);
        }

        tracing::info!(org_id = %org.id, plan = ?org.plan, "Rolled over organization plan");
        self.invalidation
            .dispatch(InvalidationModel::Organization, &[org.id.0])
            .await;
        Ok(org)
    }

    /// Close every billing cycle ending on or before `today`.
    ///
    /// Organizations with a pending change move onto `next_plan`; the rest only
    /// have their cycle date moved forward. One failure does not stop the pass.
    pub async fn rollover_due(&self, today: Date) -> BillingResult<RolloverReport> {
        let mut report = RolloverReport::default();

        for org in self.store.organizations_due(today).await? {
            match self.close_cycle(org.id, today).await {
                Ok(CycleOutcome::NotDue) => {}
                Ok(CycleOutcome::Advanced) => {
                    report.organizations_checked += 1;
                    report.cycles_advanced += 1;
                }
                Ok(CycleOutcome::RolledOver) => {
                    report.organizations_checked += 1;
                    report.rolled_over += 1;
                }
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(org_id = %org.id, error = %e, "Failed to close billing cycle");
                }
            }
        }

        tracing::info!(
            %today,
            organizations = report.organizations_checked,
            rolled_over = report.rolled_over,
            advanced = report.cycles_advanced,
            failures = report.failures,
            "Billing cycle pass finished"
        );
        Ok(report)
    }

    async fn close_cycle(&self, org_id: OrgId, today: Date) -> BillingResult<CycleOutcome> {
        let catalog = self.catalog.current();
        let mut tx = self.store.begin().await?;
        let mut org = tx.lock_organization(org_id).await?;
        // Another pass may have closed it since the listing
        if !org.cycle_ended(today) {
            return Ok(CycleOutcome::NotDue);
        }
        let next_cycle = following_cycle(org.update_on.unwrap_or(today), today);

        if org.next_plan == org.plan {
            org.update_on = Some(next_cycle);
            org.updated_at = OffsetDateTime::now_utc();
            tx.save_organization(&org).await?;
            tx.commit().await?;
            return Ok(CycleOutcome::Advanced);
        }

        let before = org.snapshot();
        let next = match org.next_plan {
            Some(id) => Some(locked_plan(tx.as_mut(), &catalog, id).await?),
            None => None,
        };

        let mut effects = ProviderEffects::new(org.id);
        let result = async {
            self.apply_next_plan(tx.as_mut(), &mut org, next.as_ref(), today, &mut effects)
                .await?;
            if org.plan.is_some() {
                org.update_on = Some(next_cycle);
            }
            self.finish(tx, &org, None, before).await
        }
        .await;

        if let Err(e) = result {
            self.subscriptions.report_failure(&effects, &e).await;
            return Err(e);
        }

        tracing::info!(
            org_id = %org.id,
            plan = ?org.plan,
            update_on = ?org.update_on,
            "Billing cycle ended; applied next plan"
        );
        self.invalidation
            .dispatch(InvalidationModel::Organization, &[org.id.0])
            .await;
        Ok(CycleOutcome::RolledOver)
    }

    async fn apply_next_plan(
        &self,
        tx: &mut dyn StoreTx,
        org: &mut Organization,
        next: Option<&Plan>,
        today: Date,
        effects: &mut ProviderEffects,
    ) -> BillingResult<()> {
        match next {
            Some(plan) => {
                let seats = seats_for(plan, org);
                self.apply_plan(tx, org, plan, seats, None, None, today, effects)
                    .await
            }
            None => {
                for sub in tx.subscriptions(org.id).await? {
                    self.subscriptions.cancel(tx, &sub, effects).await?;
                }
                org.subscription_id = None;
                org.plan = None;
                org.update_on = None;
                Ok(())
            }
        }
    }

    /// Provider sequencing shared by plan changes and rollover
    #[allow(clippy::too_many_arguments)]
    async fn apply_plan(
        &self,
        tx: &mut dyn StoreTx,
        org: &mut Organization,
        plan: &Plan,
        max_users: u32,
        token: Option<&str>,
        email: Option<&str>,
        today: Date,
        effects: &mut ProviderEffects,
    ) -> BillingResult<()> {
        let existing = tx.subscriptions(org.id).await?;

        if plan.free() {
            for sub in &existing {
                self.subscriptions.cancel(tx, sub, effects).await?;
            }
            org.subscription_id = None;
        } else {
            let customer_id = self
                .subscriptions
                .ensure_customer(org, &plan.billing_account, token, email, effects)
                .await?;

            let current = match existing.iter().find(|s| s.plan == plan.id) {
                Some(sub) => {
                    if org.max_users != max_users {
                        self.subscriptions.modify(sub, max_users, effects).await?;
                    }
                    sub.provider_subscription_id.clone()
                }
                None => {
                    self.subscriptions
                        .create(tx, org, &customer_id, plan, max_users, effects)
                        .await?
                        .provider_subscription_id
                }
            };

            for sub in existing.iter().filter(|s| s.plan != plan.id) {
                self.subscriptions.cancel(tx, sub, effects).await?;
            }
            org.subscription_id = Some(current);
        }

        // A new plan starts a new billing cycle
        if org.plan != Some(plan.id) || org.update_on.is_none() {
            org.update_on = Some(next_billing_date(today));
        }
        org.plan = Some(plan.id);
        org.next_plan = Some(plan.id);
        org.max_users = max_users;
        Ok(())
    }

    /// Save the organization, write its change log entry, and commit
    async fn finish(
        &self,
        mut tx: Box<dyn StoreTx>,
        org: &Organization,
        user: Option<UserId>,
        before: PlanSnapshot,
    ) -> BillingResult<()> {
        let mut org = org.clone();
        org.updated_at = OffsetDateTime::now_utc();
        tx.save_organization(&org).await?;
        ChangeLogRecorder::record(
            tx.as_mut(),
            org.id,
            user,
            ChangeLogReason::Updated,
            before,
            org.snapshot(),
        )
        .await?;
        tx.commit().await
    }

    async fn user_email(&self, user: Option<UserId>) -> BillingResult<Option<String>> {
        match user {
            Some(id) => Ok(self.store.get_user(id).await?.map(|u| u.email)),
            None => Ok(None),
        }
    }
}

/// Resolve a plan from the catalog and confirm its row still exists,
/// holding it against deletion until the transaction ends
async fn locked_plan(tx: &mut dyn StoreTx, catalog: &Catalog, id: PlanId) -> BillingResult<Plan> {
    let plan = catalog.require_plan(id)?.clone();
    if !tx.plan_exists(id).await? {
        return Err(BillingError::NotFound(format!("Plan {} not found", id)));
    }
    Ok(plan)
}

/// First cycle date after `today`, stepping monthly from `from`
fn following_cycle(from: Date, today: Date) -> Date {
    let mut date = from;
    while date <= today {
        let next = next_billing_date(date);
        if next <= date {
            break;
        }
        date = next;
    }
    date
}

/// Seats an organization carries onto `plan` when it changes without a new seat count
pub fn seats_for(plan: &Plan, org: &Organization) -> u32 {
    if org.individual && !plan.multi_seat_individual() {
        1
    } else {
        org.max_users.max(plan.minimum_users)
    }
}
