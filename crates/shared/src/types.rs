//! Common types used across Squarelet

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

/// Billing account plans are sold through unless they name another
pub const DEFAULT_BILLING_ACCOUNT: &str = "muckrock";

// =============================================================================
// ID Wrappers
// =============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Organization ID wrapper
    OrgId
);
uuid_id!(
    /// User ID wrapper
    UserId
);
uuid_id!(
    /// Plan ID wrapper
    PlanId
);
uuid_id!(
    /// Entitlement ID wrapper
    EntitlementId
);
uuid_id!(
    /// OIDC client ID wrapper
    ClientId
);
uuid_id!(
    /// Local subscription row ID (not the provider's subscription id)
    SubscriptionId
);
uuid_id!(
    /// Change log entry ID wrapper
    ChangeLogId
);
uuid_id!(
    /// Invitation ID wrapper
    InvitationId
);
uuid_id!(
    /// One-off charge ID wrapper
    ChargeId
);

// =============================================================================
// Enums
// =============================================================================

/// Role of a member inside an organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Disabled,
    Administrator,
    Contributor,
    Reviewer,
    Freelancer,
}

impl Default for Role {
    fn default() -> Self {
        Self::Administrator
    }
}

impl Role {
    /// Stored representation (matches the legacy integer choices)
    pub fn as_i16(&self) -> i16 {
        match self {
            Self::Disabled => 0,
            Self::Administrator => 1,
            Self::Contributor => 2,
            Self::Reviewer => 3,
            Self::Freelancer => 4,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::Disabled),
            1 => Some(Self::Administrator),
            2 => Some(Self::Contributor),
            3 => Some(Self::Reviewer),
            4 => Some(Self::Freelancer),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Administrator => write!(f, "administrator"),
            Self::Contributor => write!(f, "contributor"),
            Self::Reviewer => write!(f, "reviewer"),
            Self::Freelancer => write!(f, "freelancer"),
        }
    }
}

/// Why a change log entry was written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeLogReason {
    /// Organization was created
    Created,
    /// Plan or seat count changed
    Updated,
    /// Compensating entry written when local state was corrected from the provider
    Reconciled,
}

impl ChangeLogReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Reconciled => "reconciled",
        }
    }
}

impl std::str::FromStr for ChangeLogReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "updated" => Ok(Self::Updated),
            "reconciled" => Ok(Self::Reconciled),
            _ => Err(format!("Unknown change log reason: {}", s)),
        }
    }
}

impl std::fmt::Display for ChangeLogReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of an organization, derived from its plan fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrgState {
    /// Never had a plan
    NoPlan,
    /// On a plan with no pending change
    Active,
    /// A different plan takes effect at the next billing cycle
    PendingChange,
    /// Plan cleared after cancellation (billing customer retained)
    Cancelled,
}

impl std::fmt::Display for OrgState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoPlan => write!(f, "no_plan"),
            Self::Active => write!(f, "active"),
            Self::PendingChange => write!(f, "pending_change"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

// =============================================================================
// Users & Clients
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub name: String,
    pub is_staff: bool,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
}

impl User {
    pub fn new(username: &str, email: &str, name: &str) -> Self {
        Self {
            id: UserId::new(),
            username: username.to_string(),
            email: email.to_string(),
            name: name.to_string(),
            is_staff: false,
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// An OIDC client application. Entitlements are defined by clients.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub name: String,
    /// Organization whose admins own this client
    pub owner: OrgId,
    #[serde(skip_serializing)]
    pub secret: String,
    /// Where cache invalidations are delivered, if anywhere
    pub webhook_url: Option<String>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("secret", &"[REDACTED]")
            .field("webhook_url", &self.webhook_url)
            .finish()
    }
}

// =============================================================================
// Organizations
// =============================================================================

/// Plan fields captured before/after a mutation for the change log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub plan: Option<PlanId>,
    pub next_plan: Option<PlanId>,
    pub max_users: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrgId,
    pub name: String,
    /// Personal organization of exactly one user
    pub individual: bool,
    pub private: bool,
    pub plan: Option<PlanId>,
    /// Plan that takes effect at the next billing cycle
    pub next_plan: Option<PlanId>,
    pub max_users: u32,
    /// Billing provider customer reference per billing account
    #[serde(default)]
    pub customers: BTreeMap<String, String>,
    /// Billing provider subscription reference for the current plan
    pub subscription_id: Option<String>,
    /// Last day of the current billing cycle; `next_plan` takes effect then
    pub update_on: Option<Date>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Organization {
    pub fn new(name: &str, individual: bool, private: bool) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: OrgId::new(),
            name: name.to_string(),
            individual,
            private,
            plan: None,
            next_plan: None,
            max_users: 1,
            customers: BTreeMap::new(),
            subscription_id: None,
            update_on: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self) -> OrgState {
        match (self.plan, self.next_plan) {
            (Some(plan), Some(next)) if plan != next => OrgState::PendingChange,
            (Some(_), None) => OrgState::PendingChange,
            (Some(_), _) => OrgState::Active,
            (None, _) if self.has_customer() || self.subscription_id.is_some() => {
                OrgState::Cancelled
            }
            (None, _) => OrgState::NoPlan,
        }
    }

    /// Customer reference on the given billing account
    pub fn customer(&self, account: &str) -> Option<&str> {
        self.customers.get(account).map(String::as_str)
    }

    pub fn set_customer(&mut self, account: &str, customer_id: impl Into<String>) {
        self.customers.insert(account.to_string(), customer_id.into());
    }

    pub fn has_customer(&self) -> bool {
        !self.customers.is_empty()
    }

    /// Whether the billing cycle has ended as of `today`
    pub fn cycle_ended(&self, today: Date) -> bool {
        self.update_on.is_some_and(|d| d <= today)
    }

    pub fn snapshot(&self) -> PlanSnapshot {
        PlanSnapshot {
            plan: self.plan,
            next_plan: self.next_plan,
            max_users: Some(self.max_users),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub organization: OrgId,
    pub user: UserId,
    pub admin: bool,
    pub role: Role,
    pub created_at: OffsetDateTime,
}

impl Membership {
    pub fn new(organization: OrgId, user: UserId, admin: bool) -> Self {
        Self {
            organization,
            user,
            admin,
            role: Role::default(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Disabled members do not count against seats and grant nothing
    pub fn is_active(&self) -> bool {
        self.role != Role::Disabled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: InvitationId,
    pub organization: OrgId,
    pub email: Option<String>,
    pub user: Option<UserId>,
    /// true when the user asked to join, false when an admin invited them
    pub request: bool,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Plans & Entitlements
// =============================================================================

/// Feature grants attached to an entitlement, keyed by grant name
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resources(pub BTreeMap<String, serde_json::Value>);

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(|v| v.as_u64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(|v| v.as_bool())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: EntitlementId,
    pub name: String,
    pub slug: String,
    pub description: String,
    /// Client application that defines this entitlement
    pub client: ClientId,
    pub resources: Resources,
}

impl Entitlement {
    pub fn new(name: &str, description: &str, client: ClientId, resources: Resources) -> Self {
        Self {
            id: EntitlementId::new(),
            name: name.to_string(),
            slug: slugify(name),
            description: description.to_string(),
            client,
            resources,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub slug: String,
    pub name: String,
    pub public: bool,
    pub for_individuals: bool,
    pub for_groups: bool,
    pub base_price: u32,
    pub price_per_user: u32,
    pub minimum_users: u32,
    /// Entitlements granted by this plan, in display order
    pub entitlements: Vec<EntitlementId>,
    /// Which billing account the plan is sold through
    pub billing_account: String,
    /// Organizations allowed to see this plan when it is not public
    pub private_organizations: Vec<OrgId>,
}

impl Plan {
    pub const FREE_SLUG: &'static str = "free";

    /// A plan is free when nothing about it is ever charged
    pub fn free(&self) -> bool {
        self.base_price == 0 && self.price_per_user == 0
    }

    /// Identifier of this plan on the billing provider
    pub fn provider_plan_id(&self) -> String {
        format!("squarelet_plan_{}", self.slug)
    }

    /// Individual plans that bill per seat may carry more than one seat
    pub fn multi_seat_individual(&self) -> bool {
        self.for_individuals && self.price_per_user > 0
    }

    /// Monthly cost for the given seat count; seats up to the minimum are included
    pub fn cost(&self, seats: u32) -> u64 {
        let extra = seats.saturating_sub(self.minimum_users) as u64;
        self.base_price as u64 + extra * self.price_per_user as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub organization: OrgId,
    pub plan: PlanId,
    /// Subscription id on the billing provider
    pub provider_subscription_id: String,
    /// Billing account the provider subscription lives on
    pub billing_account: String,
    pub created_at: OffsetDateTime,
}

/// One-off payment taken from an organization's billing customer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Charge {
    pub id: ChargeId,
    pub organization: OrgId,
    /// Amount in cents
    pub amount: u32,
    /// Fee percentage included in `amount`
    pub fee_amount: u32,
    pub provider_charge_id: String,
    pub billing_account: String,
    pub description: String,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLog {
    pub id: ChangeLogId,
    pub created_at: OffsetDateTime,
    pub organization: OrgId,
    pub user: Option<UserId>,
    pub reason: ChangeLogReason,
    pub from_plan: Option<PlanId>,
    pub to_plan: Option<PlanId>,
    pub from_next_plan: Option<PlanId>,
    pub to_next_plan: Option<PlanId>,
    pub from_max_users: Option<u32>,
    pub to_max_users: Option<u32>,
}

/// Same day next month, clamped to the end of shorter months
pub fn next_billing_date(from: Date) -> Date {
    let (year, month) = match from.month() {
        time::Month::December => (from.year() + 1, time::Month::January),
        m => (from.year(), m.next()),
    };
    let day = from.day().min(time::util::days_in_year_month(year, month));
    Date::from_calendar_date(year, month, day).unwrap_or(from.saturating_add(Duration::days(30)))
}

/// URL-safe slug: lowercase ascii alphanumerics separated by single dashes
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(base_price: u32, price_per_user: u32, minimum_users: u32) -> Plan {
        Plan {
            id: PlanId::new(),
            slug: "professional".to_string(),
            name: "Professional".to_string(),
            public: true,
            for_individuals: true,
            for_groups: false,
            base_price,
            price_per_user,
            minimum_users,
            entitlements: vec![],
            billing_account: "muckrock".to_string(),
            private_organizations: vec![],
        }
    }

    #[test]
    fn test_plan_free_requires_both_prices_zero() {
        assert!(plan(0, 0, 1).free());
        assert!(plan(0, 0, 5).free());
        assert!(!plan(40, 0, 1).free());
        assert!(!plan(0, 10, 1).free());
    }

    #[test]
    fn test_plan_cost_includes_minimum_seats() {
        let p = plan(100, 10, 5);
        assert_eq!(p.cost(1), 100);
        assert_eq!(p.cost(5), 100);
        assert_eq!(p.cost(8), 130);
    }

    #[test]
    fn test_provider_plan_id() {
        assert_eq!(plan(1, 0, 1).provider_plan_id(), "squarelet_plan_professional");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Proxy"), "proxy");
        assert_eq!(slugify("MuckRock Professional  (2020)"), "muckrock-professional-2020");
        assert_eq!(slugify("--Data__Liberation--"), "data-liberation");
    }

    #[test]
    fn test_role_roundtrip_and_default() {
        assert_eq!(Role::default(), Role::Administrator);
        for role in [
            Role::Disabled,
            Role::Administrator,
            Role::Contributor,
            Role::Reviewer,
            Role::Freelancer,
        ] {
            assert_eq!(Role::from_i16(role.as_i16()), Some(role));
        }
        assert_eq!(Role::from_i16(9), None);
    }

    #[test]
    fn test_org_state_transitions() {
        let mut org = Organization::new("Acme", false, false);
        assert_eq!(org.state(), OrgState::NoPlan);

        let free = PlanId::new();
        let pro = PlanId::new();
        org.plan = Some(free);
        org.next_plan = Some(free);
        assert_eq!(org.state(), OrgState::Active);

        org.next_plan = Some(pro);
        assert_eq!(org.state(), OrgState::PendingChange);

        org.plan = None;
        org.next_plan = None;
        org.set_customer(DEFAULT_BILLING_ACCOUNT, "cus_123");
        assert_eq!(org.state(), OrgState::Cancelled);
        assert_eq!(org.customer(DEFAULT_BILLING_ACCOUNT), Some("cus_123"));
        assert_eq!(org.customer("presspass"), None);
    }

    #[test]
    fn test_next_billing_date_clamps_month_end() {
        use time::macros::date;
        assert_eq!(next_billing_date(date!(2024 - 01 - 15)), date!(2024 - 02 - 15));
        assert_eq!(next_billing_date(date!(2024 - 01 - 31)), date!(2024 - 02 - 29));
        assert_eq!(next_billing_date(date!(2023 - 01 - 31)), date!(2023 - 02 - 28));
        assert_eq!(next_billing_date(date!(2024 - 12 - 31)), date!(2025 - 01 - 31));
    }

    #[test]
    fn test_cycle_ended() {
        use time::macros::date;
        let mut org = Organization::new("Acme", false, false);
        assert!(!org.cycle_ended(date!(2024 - 03 - 01)));
        org.update_on = Some(date!(2024 - 03 - 01));
        assert!(!org.cycle_ended(date!(2024 - 02 - 29)));
        assert!(org.cycle_ended(date!(2024 - 03 - 01)));
    }

    #[test]
    fn test_client_debug_redacts_secret() {
        let client = Client {
            id: ClientId::new(),
            name: "MuckRock".to_string(),
            owner: OrgId::new(),
            secret: "super-secret".to_string(),
            webhook_url: None,
        };
        let debug = format!("{:?}", client);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
