//! Stripe-backed billing provider

use async_trait::async_trait;
use stripe::{
    CancelSubscription, Charge, CreateCharge, CreateCustomer, CreateSubscription, CreateSubscriptionItems, Customer,
    CustomerId, PaymentSourceParams, Subscription, SubscriptionId,
    SubscriptionStatus as StripeSubStatus, TokenId, UpdateSubscription, UpdateSubscriptionItems,
};
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;

use crate::error::{BillingError, BillingResult};
use crate::provider::{
    BillingProvider, ProviderCharge, ProviderSubscription, ProviderSubscriptionStatus,
};

#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

impl StripeConfig {
    pub fn new(secret_key: impl Into<String>) -> BillingResult<Self> {
        let secret_key = secret_key.into();
        if secret_key.is_empty() {
            return Err(BillingError::Config(
                "STRIPE_SECRET_KEY must not be empty".to_string(),
            ));
        }
        Ok(Self { secret_key })
    }
}

#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            inner: stripe::Client::new(config.secret_key.clone()),
            config,
        }
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

fn parse_customer_id(id: &str) -> BillingResult<CustomerId> {
    id.parse::<CustomerId>()
        .map_err(|e| BillingError::Internal(format!("Invalid customer ID: {}", e)))
}

fn parse_subscription_id(id: &str) -> BillingResult<SubscriptionId> {
    id.parse::<SubscriptionId>()
        .map_err(|e| BillingError::Internal(format!("Invalid subscription ID '{}': {}", id, e)))
}

fn to_provider_subscription(subscription: &Subscription) -> ProviderSubscription {
    let item = subscription.items.data.first();
    let status = match subscription.status {
        StripeSubStatus::Active | StripeSubStatus::Trialing => ProviderSubscriptionStatus::Active,
        StripeSubStatus::PastDue | StripeSubStatus::Unpaid => ProviderSubscriptionStatus::PastDue,
        StripeSubStatus::Canceled | StripeSubStatus::IncompleteExpired => {
            ProviderSubscriptionStatus::Cancelled
        }
        _ => ProviderSubscriptionStatus::Other,
    };
    ProviderSubscription {
        id: subscription.id.to_string(),
        status,
        quantity: item
            .and_then(|i| i.quantity)
            .map(|q| q.min(u32::MAX as u64) as u32)
            .unwrap_or(1),
        plan_identifier: item.and_then(|i| i.price.as_ref()).map(|p| p.id.to_string()),
    }
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn create_customer(
        &self,
        token: &str,
        name: &str,
        email: Option<&str>,
    ) -> BillingResult<String> {
        let token = token
            .parse::<TokenId>()
            .map_err(|_| BillingError::payment("Invalid payment token"))?;

        let params = CreateCustomer {
            name: Some(name),
            email,
            source: Some(PaymentSourceParams::Token(token)),
            ..Default::default()
        };

        let customer = Customer::create(self.inner(), params).await?;

        tracing::info!(customer_id = %customer.id, "Created Stripe customer");

        Ok(customer.id.to_string())
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        plan_identifier: &str,
        seats: u32,
    ) -> BillingResult<ProviderSubscription> {
        let customer_id = parse_customer_id(customer_id)?;

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(plan_identifier.to_string()),
            quantity: Some(seats as u64),
            ..Default::default()
        }]);

        let subscription = Subscription::create(self.inner(), params).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            plan = %plan_identifier,
            seats,
            "Created Stripe subscription"
        );

        Ok(to_provider_subscription(&subscription))
    }

    async fn modify_subscription(&self, subscription_id: &str, seats: u32) -> BillingResult<()> {
        let sub_id = parse_subscription_id(subscription_id)?;

        // Seat changes apply to the single plan item on the subscription
        let current = Subscription::retrieve(self.inner(), &sub_id, &[]).await?;
        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| BillingError::Internal("No subscription items found".to_string()))?;

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                quantity: Some(seats as u64),
                ..Default::default()
            }]),
            proration_behavior: Some(SubscriptionProrationBehavior::CreateProrations),
            ..Default::default()
        };

        Subscription::update(self.inner(), &sub_id, params).await?;

        tracing::info!(subscription_id = %sub_id, seats, "Updated Stripe subscription seats");

        Ok(())
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        let sub_id = parse_subscription_id(subscription_id)?;

        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: None,
            prorate: None,
        };

        Subscription::cancel(self.inner(), &sub_id, params).await?;

        tracing::info!(subscription_id = %sub_id, "Cancelled Stripe subscription");

        Ok(())
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<ProviderSubscription>> {
        let sub_id = parse_subscription_id(subscription_id)?;

        match Subscription::retrieve(self.inner(), &sub_id, &[]).await {
            Ok(subscription) => Ok(Some(to_provider_subscription(&subscription))),
            Err(stripe::StripeError::Stripe(err)) if err.http_status == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_charge(
        &self,
        customer_id: &str,
        amount: u32,
        description: &str,
    ) -> BillingResult<ProviderCharge> {
        let customer_id = parse_customer_id(customer_id)?;

        let params = CreateCharge {
            amount: Some(i64::from(amount)),
            currency: Some(stripe::Currency::USD),
            customer: Some(customer_id.clone()),
            description: Some(description),
            ..Default::default()
        };

        let charge = Charge::create(self.inner(), params).await?;

        tracing::info!(
            customer_id = %customer_id,
            charge_id = %charge.id,
            amount,
            "Created Stripe charge"
        );

        Ok(ProviderCharge {
            id: charge.id.to_string(),
            amount: u32::try_from(charge.amount).unwrap_or(amount),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_secret_key_rejected() {
        assert!(matches!(
            StripeConfig::new(""),
            Err(BillingError::Config(_))
        ));
    }

    #[test]
    fn test_config_debug_redacts_secret() {
        let config = StripeConfig::new("sk_test_abc").unwrap();
        assert!(!format!("{:?}", config).contains("sk_test_abc"));
    }

    #[test]
    fn test_invalid_subscription_id_rejected() {
        assert!(parse_subscription_id("cus_123").is_err());
        assert!(parse_subscription_id("sub_123").is_ok());
        assert!(parse_customer_id("sub_123").is_err());
        assert!(parse_customer_id("cus_123").is_ok());
    }
}
