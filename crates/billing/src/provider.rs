//! Billing provider boundary
//!
//! Everything the subscription manager needs from a payment processor.
//! Implementations never retry; a timeout is a failure like any other.
//! Plans are sold through named billing accounts, each backed by its own
//! provider client in a [`ProviderRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Provider-side view of a subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    pub status: ProviderSubscriptionStatus,
    /// Seat count billed by the provider
    pub quantity: u32,
    /// Provider plan identifier (`squarelet_plan_{slug}`)
    pub plan_identifier: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderSubscriptionStatus {
    Active,
    PastDue,
    Cancelled,
    Other,
}

impl ProviderSubscriptionStatus {
    /// Whether the provider will keep billing this subscription
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::PastDue)
    }
}

/// Provider-side record of a one-off charge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCharge {
    pub id: String,
    /// Amount in cents
    pub amount: u32,
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Create a customer from a tokenized payment method
    async fn create_customer(&self, token: &str, name: &str, email: Option<&str>)
        -> BillingResult<String>;

    async fn create_subscription(
        &self,
        customer_id: &str,
        plan_identifier: &str,
        seats: u32,
    ) -> BillingResult<ProviderSubscription>;

    /// Change the billed seat count
    async fn modify_subscription(&self, subscription_id: &str, seats: u32) -> BillingResult<()>;

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()>;

    /// Current provider state, `None` when the provider has no such subscription
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<ProviderSubscription>>;

    /// Charge the customer's payment method once; `amount` is in cents
    async fn create_charge(
        &self,
        customer_id: &str,
        amount: u32,
        description: &str,
    ) -> BillingResult<ProviderCharge>;
}

/// Billing providers keyed by billing account
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    accounts: HashMap<String, Arc<dyn BillingProvider>>,
    fallback: Option<Arc<dyn BillingProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One provider serving every billing account
    pub fn single(provider: Arc<dyn BillingProvider>) -> Self {
        Self {
            accounts: HashMap::new(),
            fallback: Some(provider),
        }
    }

    pub fn with_account(mut self, account: &str, provider: Arc<dyn BillingProvider>) -> Self {
        self.accounts.insert(account.to_string(), provider);
        self
    }

    /// Provider for a billing account; unknown accounts are a configuration error
    pub fn get(&self, account: &str) -> BillingResult<&Arc<dyn BillingProvider>> {
        self.accounts
            .get(account)
            .or(self.fallback.as_ref())
            .ok_or_else(|| {
                BillingError::Config(format!("No billing provider for account '{}'", account))
            })
    }

    pub fn accounts(&self) -> impl Iterator<Item = &str> {
        self.accounts.keys().map(String::as_str)
    }
}
