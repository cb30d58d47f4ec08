//! Postgres store

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use squarelet_shared::{
    ChangeLog, Charge, Client, Entitlement, EntitlementId, Invitation, InvitationId,
    Membership, OrgId, Organization, Plan, PlanId, Resources, Role, Subscription, SubscriptionId,
    User, UserId,
};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use super::{DateRange, Store, StoreTx};
use crate::error::{BillingError, BillingResult};
use crate::reconciliation::{ReconciliationItem, ReconciliationKind};

const ORG_COLUMNS: &str = "id, name, individual, private, plan_id, next_plan_id, max_users, \
     customers, subscription_id, update_on, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str =
    "id, organization_id, plan_id, provider_subscription_id, billing_account, created_at";

const RECONCILIATION_COLUMNS: &str = "id, organization_id, kind, provider_subscription_id, \
     billing_account, detail, created_at, resolved_at";

const CHANGE_LOG_COLUMNS: &str = "id, created_at, organization_id, user_id, reason, from_plan_id, \
     to_plan_id, from_next_plan_id, to_next_plan_id, from_max_users, to_max_users";

#[derive(Debug, sqlx::FromRow)]
struct OrgRow {
    id: Uuid,
    name: String,
    individual: bool,
    private: bool,
    plan_id: Option<Uuid>,
    next_plan_id: Option<Uuid>,
    max_users: i32,
    customers: Json<BTreeMap<String, String>>,
    subscription_id: Option<String>,
    update_on: Option<Date>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<OrgRow> for Organization {
    fn from(row: OrgRow) -> Self {
        Self {
            id: row.id.into(),
            name: row.name,
            individual: row.individual,
            private: row.private,
            plan: row.plan_id.map(PlanId),
            next_plan: row.next_plan_id.map(PlanId),
            max_users: row.max_users.max(0) as u32,
            customers: row.customers.0,
            subscription_id: row.subscription_id,
            update_on: row.update_on,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    username: String,
    email: String,
    name: String,
    is_staff: bool,
    is_active: bool,
    created_at: OffsetDateTime,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id.into(),
            username: row.username,
            email: row.email,
            name: row.name,
            is_staff: row.is_staff,
            is_active: row.is_active,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MembershipRow {
    organization_id: Uuid,
    user_id: Uuid,
    admin: bool,
    role: i16,
    created_at: OffsetDateTime,
}

impl From<MembershipRow> for Membership {
    fn from(row: MembershipRow) -> Self {
        Self {
            organization: row.organization_id.into(),
            user: row.user_id.into(),
            admin: row.admin,
            role: Role::from_i16(row.role).unwrap_or(Role::Disabled),
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    organization_id: Uuid,
    plan_id: Uuid,
    provider_subscription_id: String,
    billing_account: String,
    created_at: OffsetDateTime,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            id: row.id.into(),
            organization: row.organization_id.into(),
            plan: row.plan_id.into(),
            provider_subscription_id: row.provider_subscription_id,
            billing_account: row.billing_account,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ChargeRow {
    id: Uuid,
    organization_id: Uuid,
    amount: i32,
    fee_amount: i32,
    provider_charge_id: String,
    billing_account: String,
    description: String,
    created_at: OffsetDateTime,
}

impl From<ChargeRow> for Charge {
    fn from(row: ChargeRow) -> Self {
        Self {
            id: row.id.into(),
            organization: row.organization_id.into(),
            amount: row.amount.max(0) as u32,
            fee_amount: row.fee_amount.max(0) as u32,
            provider_charge_id: row.provider_charge_id,
            billing_account: row.billing_account,
            description: row.description,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    slug: String,
    name: String,
    public: bool,
    for_individuals: bool,
    for_groups: bool,
    base_price: i32,
    price_per_user: i32,
    minimum_users: i32,
    billing_account: String,
}

#[derive(Debug, sqlx::FromRow)]
struct PlanLinkRow {
    plan_id: Uuid,
    other_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct EntitlementRow {
    id: Uuid,
    name: String,
    slug: String,
    description: String,
    client_id: Uuid,
    resources: Json<Resources>,
}

impl From<EntitlementRow> for Entitlement {
    fn from(row: EntitlementRow) -> Self {
        Self {
            id: row.id.into(),
            name: row.name,
            slug: row.slug,
            description: row.description,
            client: row.client_id.into(),
            resources: row.resources.0,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ClientRow {
    id: Uuid,
    name: String,
    owner_id: Uuid,
    secret: String,
    webhook_url: Option<String>,
}

impl From<ClientRow> for Client {
    fn from(row: ClientRow) -> Self {
        Self {
            id: row.id.into(),
            name: row.name,
            owner: row.owner_id.into(),
            secret: row.secret,
            webhook_url: row.webhook_url,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ChangeLogRow {
    id: Uuid,
    created_at: OffsetDateTime,
    organization_id: Uuid,
    user_id: Option<Uuid>,
    reason: String,
    from_plan_id: Option<Uuid>,
    to_plan_id: Option<Uuid>,
    from_next_plan_id: Option<Uuid>,
    to_next_plan_id: Option<Uuid>,
    from_max_users: Option<i32>,
    to_max_users: Option<i32>,
}

impl TryFrom<ChangeLogRow> for ChangeLog {
    type Error = BillingError;

    fn try_from(row: ChangeLogRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id.into(),
            created_at: row.created_at,
            organization: row.organization_id.into(),
            user: row.user_id.map(UserId),
            reason: row.reason.parse().map_err(BillingError::Database)?,
            from_plan: row.from_plan_id.map(PlanId),
            to_plan: row.to_plan_id.map(PlanId),
            from_next_plan: row.from_next_plan_id.map(PlanId),
            to_next_plan: row.to_next_plan_id.map(PlanId),
            from_max_users: row.from_max_users.map(|n| n.max(0) as u32),
            to_max_users: row.to_max_users.map(|n| n.max(0) as u32),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InvitationRow {
    id: Uuid,
    organization_id: Uuid,
    email: Option<String>,
    user_id: Option<Uuid>,
    request: bool,
    created_at: OffsetDateTime,
}

impl From<InvitationRow> for Invitation {
    fn from(row: InvitationRow) -> Self {
        Self {
            id: row.id.into(),
            organization: row.organization_id.into(),
            email: row.email,
            user: row.user_id.map(UserId),
            request: row.request,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ReconciliationRow {
    id: Uuid,
    organization_id: Uuid,
    kind: String,
    provider_subscription_id: Option<String>,
    billing_account: Option<String>,
    detail: String,
    created_at: OffsetDateTime,
    resolved_at: Option<OffsetDateTime>,
}

impl TryFrom<ReconciliationRow> for ReconciliationItem {
    type Error = BillingError;

    fn try_from(row: ReconciliationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            organization: row.organization_id.into(),
            kind: row
                .kind
                .parse::<ReconciliationKind>()
                .map_err(BillingError::Database)?,
            provider_subscription_id: row.provider_subscription_id,
            billing_account: row.billing_account,
            detail: row.detail,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
        })
    }
}

fn to_i32(value: u32, field: &str) -> BillingResult<i32> {
    i32::try_from(value).map_err(|_| BillingError::Validation(format!("{} is too large", field)))
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> BillingResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn get_organization(&self, id: OrgId) -> BillingResult<Option<Organization>> {
        let row: Option<OrgRow> = sqlx::query_as(&format!(
            "SELECT {} FROM organizations WHERE id = $1",
            ORG_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_organizations(&self) -> BillingResult<Vec<Organization>> {
        let rows: Vec<OrgRow> = sqlx::query_as(&format!(
            "SELECT {} FROM organizations ORDER BY created_at, id",
            ORG_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn organizations_due(&self, today: Date) -> BillingResult<Vec<Organization>> {
        let rows: Vec<OrgRow> = sqlx::query_as(&format!(
            "SELECT {} FROM organizations WHERE update_on <= $1 ORDER BY update_on, id",
            ORG_COLUMNS
        ))
        .bind(today)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_user(&self, id: UserId) -> BillingResult<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, username, email, name, is_staff, is_active, created_at FROM users WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn memberships_for_user(&self, user: UserId) -> BillingResult<Vec<Membership>> {
        let rows: Vec<MembershipRow> = sqlx::query_as(
            r#"
            SELECT organization_id, user_id, admin, role, created_at
            FROM memberships
            WHERE user_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(user.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn memberships_for_org(&self, org: OrgId) -> BillingResult<Vec<Membership>> {
        let rows: Vec<MembershipRow> = sqlx::query_as(
            r#"
            SELECT organization_id, user_id, admin, role, created_at
            FROM memberships
            WHERE organization_id = $1
            ORDER BY created_at, user_id
            "#,
        )
        .bind(org.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_subscriptions(&self) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions ORDER BY created_at, id",
            SUBSCRIPTION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn subscriptions_for_orgs(&self, orgs: &[OrgId]) -> BillingResult<Vec<Subscription>> {
        let ids: Vec<Uuid> = orgs.iter().map(|o| o.0).collect();
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE organization_id = ANY($1)",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(
            r#"
            SELECT id, slug, name, public, for_individuals, for_groups,
                   base_price, price_per_user, minimum_users, billing_account
            FROM plans
            ORDER BY slug
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let entitlement_links: Vec<PlanLinkRow> = sqlx::query_as(
            "SELECT plan_id, entitlement_id AS other_id FROM plan_entitlements ORDER BY position, entitlement_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let private_links: Vec<PlanLinkRow> = sqlx::query_as(
            "SELECT plan_id, organization_id AS other_id FROM plan_private_organizations",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut entitlements: HashMap<Uuid, Vec<EntitlementId>> = HashMap::new();
        for link in entitlement_links {
            entitlements
                .entry(link.plan_id)
                .or_default()
                .push(link.other_id.into());
        }
        let mut private: HashMap<Uuid, Vec<OrgId>> = HashMap::new();
        for link in private_links {
            private
                .entry(link.plan_id)
                .or_default()
                .push(link.other_id.into());
        }

        Ok(rows
            .into_iter()
            .map(|row| Plan {
                id: row.id.into(),
                entitlements: entitlements.remove(&row.id).unwrap_or_default(),
                private_organizations: private.remove(&row.id).unwrap_or_default(),
                slug: row.slug,
                name: row.name,
                public: row.public,
                for_individuals: row.for_individuals,
                for_groups: row.for_groups,
                base_price: row.base_price.max(0) as u32,
                price_per_user: row.price_per_user.max(0) as u32,
                minimum_users: row.minimum_users.max(1) as u32,
                billing_account: row.billing_account,
            })
            .collect())
    }

    async fn list_entitlements(&self) -> BillingResult<Vec<Entitlement>> {
        let rows: Vec<EntitlementRow> = sqlx::query_as(
            "SELECT id, name, slug, description, client_id, resources FROM entitlements",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_clients(&self) -> BillingResult<Vec<Client>> {
        let rows: Vec<ClientRow> = sqlx::query_as(
            "SELECT id, name, owner_id, secret, webhook_url FROM clients ORDER BY name, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn change_logs(
        &self,
        org: OrgId,
        range: Option<DateRange>,
    ) -> BillingResult<Vec<ChangeLog>> {
        let rows: Vec<ChangeLogRow> = match range {
            Some((from, to)) => {
                sqlx::query_as(&format!(
                    "SELECT {} FROM organization_change_logs \
                     WHERE organization_id = $1 AND created_at >= $2 AND created_at < $3 \
                     ORDER BY created_at, id",
                    CHANGE_LOG_COLUMNS
                ))
                .bind(org.0)
                .bind(from)
                .bind(to)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {} FROM organization_change_logs \
                     WHERE organization_id = $1 ORDER BY created_at, id",
                    CHANGE_LOG_COLUMNS
                ))
                .bind(org.0)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn invitations_for_org(&self, org: OrgId) -> BillingResult<Vec<Invitation>> {
        let rows: Vec<InvitationRow> = sqlx::query_as(
            r#"
            SELECT id, organization_id, email, user_id, request, created_at
            FROM invitations
            WHERE organization_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(org.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn charges_for_org(&self, org: OrgId) -> BillingResult<Vec<Charge>> {
        let rows: Vec<ChargeRow> = sqlx::query_as(
            r#"
            SELECT id, organization_id, amount, fee_amount, provider_charge_id,
                   billing_account, description, created_at
            FROM charges
            WHERE organization_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(org.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn record_reconciliation(&self, item: &ReconciliationItem) -> BillingResult<()> {
        sqlx::query(&format!(
            "INSERT INTO reconciliation_items ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            RECONCILIATION_COLUMNS
        ))
        .bind(item.id)
        .bind(item.organization.0)
        .bind(item.kind.as_str())
        .bind(&item.provider_subscription_id)
        .bind(&item.billing_account)
        .bind(&item.detail)
        .bind(item.created_at)
        .bind(item.resolved_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_reconciliations(&self) -> BillingResult<Vec<ReconciliationItem>> {
        let rows: Vec<ReconciliationRow> = sqlx::query_as(&format!(
            "SELECT {} FROM reconciliation_items WHERE resolved_at IS NULL ORDER BY created_at",
            RECONCILIATION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn resolve_reconciliation(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query(
            "UPDATE reconciliation_items SET resolved_at = NOW() WHERE id = $1 AND resolved_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Transaction handle; sqlx rolls back when dropped uncommitted
struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn lock_organization(&mut self, id: OrgId) -> BillingResult<Organization> {
        let row: Option<OrgRow> = sqlx::query_as(&format!(
            "SELECT {} FROM organizations WHERE id = $1 FOR UPDATE",
            ORG_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(Into::into)
            .ok_or_else(|| BillingError::NotFound(format!("Organization {} not found", id)))
    }

    async fn insert_organization(&mut self, org: &Organization) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO organizations
                (id, name, individual, private, plan_id, next_plan_id, max_users,
                 customers, subscription_id, update_on, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(org.id.0)
        .bind(&org.name)
        .bind(org.individual)
        .bind(org.private)
        .bind(org.plan.map(|p| p.0))
        .bind(org.next_plan.map(|p| p.0))
        .bind(to_i32(org.max_users, "max_users")?)
        .bind(Json(&org.customers))
        .bind(&org.subscription_id)
        .bind(org.update_on)
        .bind(org.created_at)
        .bind(org.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn save_organization(&mut self, org: &Organization) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE organizations
            SET name = $2, individual = $3, private = $4, plan_id = $5, next_plan_id = $6,
                max_users = $7, customers = $8, subscription_id = $9, update_on = $10,
                updated_at = $11
            WHERE id = $1
            "#,
        )
        .bind(org.id.0)
        .bind(&org.name)
        .bind(org.individual)
        .bind(org.private)
        .bind(org.plan.map(|p| p.0))
        .bind(org.next_plan.map(|p| p.0))
        .bind(to_i32(org.max_users, "max_users")?)
        .bind(Json(&org.customers))
        .bind(&org.subscription_id)
        .bind(org.update_on)
        .bind(org.updated_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "Organization {} not found",
                org.id
            )));
        }
        Ok(())
    }

    async fn insert_user(&mut self, user: &User) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, email, name, is_staff, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(user.id.0)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.name)
        .bind(user.is_staff)
        .bind(user.is_active)
        .bind(user.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn subscriptions(&mut self, org: OrgId) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE organization_id = $1 ORDER BY created_at, id",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(org.0)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_subscription(&mut self, sub: &Subscription) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (id, organization_id, plan_id, provider_subscription_id, billing_account, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(sub.id.0)
        .bind(sub.organization.0)
        .bind(sub.plan.0)
        .bind(&sub.provider_subscription_id)
        .bind(&sub.billing_account)
        .bind(sub.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_subscription(&mut self, id: SubscriptionId) -> BillingResult<()> {
        sqlx::query("DELETE FROM subscriptions WHERE id = $1")
            .bind(id.0)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_change_log(&mut self, entry: &ChangeLog) -> BillingResult<()> {
        sqlx::query(&format!(
            "INSERT INTO organization_change_logs ({}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            CHANGE_LOG_COLUMNS
        ))
        .bind(entry.id.0)
        .bind(entry.created_at)
        .bind(entry.organization.0)
        .bind(entry.user.map(|u| u.0))
        .bind(entry.reason.as_str())
        .bind(entry.from_plan.map(|p| p.0))
        .bind(entry.to_plan.map(|p| p.0))
        .bind(entry.from_next_plan.map(|p| p.0))
        .bind(entry.to_next_plan.map(|p| p.0))
        .bind(entry.from_max_users.map(|n| to_i32(n, "from_max_users")).transpose()?)
        .bind(entry.to_max_users.map(|n| to_i32(n, "to_max_users")).transpose()?)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn memberships(&mut self, org: OrgId) -> BillingResult<Vec<Membership>> {
        let rows: Vec<MembershipRow> = sqlx::query_as(
            r#"
            SELECT organization_id, user_id, admin, role, created_at
            FROM memberships
            WHERE organization_id = $1
            ORDER BY created_at, user_id
            "#,
        )
        .bind(org.0)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_membership(&mut self, membership: &Membership) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO memberships (organization_id, user_id, admin, role, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (organization_id, user_id) DO NOTHING
            "#,
        )
        .bind(membership.organization.0)
        .bind(membership.user.0)
        .bind(membership.admin)
        .bind(membership.role.as_i16())
        .bind(membership.created_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::Validation(
                "User is already a member of this organization".to_string(),
            ));
        }
        Ok(())
    }

    async fn update_membership(&mut self, membership: &Membership) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE memberships SET admin = $3, role = $4 WHERE organization_id = $1 AND user_id = $2",
        )
        .bind(membership.organization.0)
        .bind(membership.user.0)
        .bind(membership.admin)
        .bind(membership.role.as_i16())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound("Membership not found".to_string()));
        }
        Ok(())
    }

    async fn delete_membership(&mut self, org: OrgId, user: UserId) -> BillingResult<bool> {
        let result =
            sqlx::query("DELETE FROM memberships WHERE organization_id = $1 AND user_id = $2")
                .bind(org.0)
                .bind(user.0)
                .execute(&mut *self.tx)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_invitation(&mut self, invitation: &Invitation) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO invitations (id, organization_id, email, user_id, request, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(invitation.id.0)
        .bind(invitation.organization.0)
        .bind(&invitation.email)
        .bind(invitation.user.map(|u| u.0))
        .bind(invitation.request)
        .bind(invitation.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn take_invitation(&mut self, id: InvitationId) -> BillingResult<Option<Invitation>> {
        let row: Option<InvitationRow> = sqlx::query_as(
            r#"
            DELETE FROM invitations WHERE id = $1
            RETURNING id, organization_id, email, user_id, request, created_at
            "#,
        )
        .bind(id.0)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn insert_plan(&mut self, plan: &Plan) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO plans
                (id, slug, name, public, for_individuals, for_groups,
                 base_price, price_per_user, minimum_users, billing_account)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(plan.id.0)
        .bind(&plan.slug)
        .bind(&plan.name)
        .bind(plan.public)
        .bind(plan.for_individuals)
        .bind(plan.for_groups)
        .bind(to_i32(plan.base_price, "base_price")?)
        .bind(to_i32(plan.price_per_user, "price_per_user")?)
        .bind(to_i32(plan.minimum_users, "minimum_users")?)
        .bind(&plan.billing_account)
        .execute(&mut *self.tx)
        .await?;

        for (position, entitlement) in plan.entitlements.iter().enumerate() {
            sqlx::query(
                "INSERT INTO plan_entitlements (plan_id, entitlement_id, position) VALUES ($1, $2, $3)",
            )
            .bind(plan.id.0)
            .bind(entitlement.0)
            .bind(position as i32)
            .execute(&mut *self.tx)
            .await?;
        }

        for org in &plan.private_organizations {
            sqlx::query(
                "INSERT INTO plan_private_organizations (plan_id, organization_id) VALUES ($1, $2)",
            )
            .bind(plan.id.0)
            .bind(org.0)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn insert_entitlement(&mut self, entitlement: &Entitlement) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO entitlements (id, name, slug, description, client_id, resources)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entitlement.id.0)
        .bind(&entitlement.name)
        .bind(&entitlement.slug)
        .bind(&entitlement.description)
        .bind(entitlement.client.0)
        .bind(Json(&entitlement.resources))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_client(&mut self, client: &Client) -> BillingResult<()> {
        sqlx::query(
            "INSERT INTO clients (id, name, owner_id, secret, webhook_url) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(client.id.0)
        .bind(&client.name)
        .bind(client.owner.0)
        .bind(&client.secret)
        .bind(&client.webhook_url)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn plan_exists(&mut self, plan: PlanId) -> BillingResult<bool> {
        let row: Option<Uuid> = sqlx::query_scalar("SELECT id FROM plans WHERE id = $1 FOR SHARE")
            .bind(plan.0)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.is_some())
    }

    async fn insert_charge(&mut self, charge: &Charge) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO charges
                (id, organization_id, amount, fee_amount, provider_charge_id,
                 billing_account, description, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(charge.id.0)
        .bind(charge.organization.0)
        .bind(to_i32(charge.amount, "amount")?)
        .bind(to_i32(charge.fee_amount, "fee_amount")?)
        .bind(&charge.provider_charge_id)
        .bind(&charge.billing_account)
        .bind(&charge.description)
        .bind(charge.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn count_plan_subscriptions(&mut self, plan: PlanId) -> BillingResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions WHERE plan_id = $1")
            .bind(plan.0)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn plan_referenced(&mut self, plan: PlanId) -> BillingResult<bool> {
        let referenced: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM organizations WHERE plan_id = $1 OR next_plan_id = $1)",
        )
        .bind(plan.0)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(referenced)
    }

    async fn detach_plan(&mut self, plan: PlanId) -> BillingResult<()> {
        let statements = [
            "UPDATE organizations SET plan_id = NULL WHERE plan_id = $1",
            "UPDATE organizations SET next_plan_id = NULL WHERE next_plan_id = $1",
            "UPDATE organization_change_logs SET from_plan_id = NULL WHERE from_plan_id = $1",
            "UPDATE organization_change_logs SET to_plan_id = NULL WHERE to_plan_id = $1",
            "UPDATE organization_change_logs SET from_next_plan_id = NULL WHERE from_next_plan_id = $1",
            "UPDATE organization_change_logs SET to_next_plan_id = NULL WHERE to_next_plan_id = $1",
        ];
        for statement in statements {
            sqlx::query(statement)
                .bind(plan.0)
                .execute(&mut *self.tx)
                .await?;
        }
        Ok(())
    }

    async fn delete_plan(&mut self, plan: PlanId) -> BillingResult<()> {
        sqlx::query("DELETE FROM plans WHERE id = $1")
            .bind(plan.0)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn update_plan_slug(&mut self, plan: PlanId, slug: &str) -> BillingResult<()> {
        let result = sqlx::query("UPDATE plans SET slug = $2 WHERE id = $1")
            .bind(plan.0)
            .bind(slug)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("Plan {} not found", plan)));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
