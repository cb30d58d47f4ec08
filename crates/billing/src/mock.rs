//! In-memory billing provider for development and tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{BillingError, BillingResult, PaymentError};
use crate::provider::{
    BillingProvider, ProviderCharge, ProviderSubscription, ProviderSubscriptionStatus,
};

/// Token the mock provider always declines
pub const DECLINED_TOKEN: &str = "tok_chargeDeclined";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub create_customer: u32,
    pub create_subscription: u32,
    pub modify_subscription: u32,
    pub cancel_subscription: u32,
    pub create_charge: u32,
}

impl CallCounts {
    /// Calls that changed provider state
    pub fn mutating(&self) -> u32 {
        self.create_customer
            + self.create_subscription
            + self.modify_subscription
            + self.cancel_subscription
            + self.create_charge
    }
}

#[derive(Default)]
struct MockState {
    customers: HashMap<String, String>,
    subscriptions: HashMap<String, ProviderSubscription>,
    charges: Vec<(String, ProviderCharge)>,
    fail_next: Option<PaymentError>,
    calls: CallCounts,
}

/// Billing provider that keeps customers and subscriptions in memory.
///
/// `fail_next` makes the next mutating call fail with the given message;
/// the token [`DECLINED_TOKEN`] is always declined at customer creation.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
    sequence: AtomicU64,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}_mock{:06}", prefix, n)
    }

    pub async fn fail_next(&self, user_message: &str) {
        self.state.lock().await.fail_next = Some(PaymentError::new(user_message));
    }

    pub async fn calls(&self) -> CallCounts {
        self.state.lock().await.calls
    }

    pub async fn subscription(&self, id: &str) -> Option<ProviderSubscription> {
        self.state.lock().await.subscriptions.get(id).cloned()
    }

    /// Subscriptions the provider is still billing
    pub async fn live_subscriptions(&self) -> Vec<ProviderSubscription> {
        let state = self.state.lock().await;
        let mut subs: Vec<_> = state
            .subscriptions
            .values()
            .filter(|s| s.status.is_live())
            .cloned()
            .collect();
        subs.sort_by(|a, b| a.id.cmp(&b.id));
        subs
    }

    /// Charges made so far, as (customer, charge)
    pub async fn charges(&self) -> Vec<(String, ProviderCharge)> {
        self.state.lock().await.charges.clone()
    }

    /// Change provider state behind the application's back, as a dashboard edit would
    pub async fn set_quantity(&self, id: &str, seats: u32) {
        if let Some(sub) = self.state.lock().await.subscriptions.get_mut(id) {
            sub.quantity = seats;
        }
    }

    pub async fn set_status(&self, id: &str, status: ProviderSubscriptionStatus) {
        if let Some(sub) = self.state.lock().await.subscriptions.get_mut(id) {
            sub.status = status;
        }
    }

    fn take_failure(state: &mut MockState) -> BillingResult<()> {
        match state.fail_next.take() {
            Some(err) => Err(BillingError::Payment(err)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BillingProvider for MockProvider {
    async fn create_customer(
        &self,
        token: &str,
        name: &str,
        _email: Option<&str>,
    ) -> BillingResult<String> {
        let mut state = self.state.lock().await;
        state.calls.create_customer += 1;
        Self::take_failure(&mut state)?;
        if token == DECLINED_TOKEN {
            return Err(BillingError::Payment(
                PaymentError::new("Your card was declined.").with_code("card_declined"),
            ));
        }
        let id = self.next_id("cus");
        state.customers.insert(id.clone(), name.to_string());
        Ok(id)
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        plan_identifier: &str,
        seats: u32,
    ) -> BillingResult<ProviderSubscription> {
        let mut state = self.state.lock().await;
        state.calls.create_subscription += 1;
        Self::take_failure(&mut state)?;
        if !state.customers.contains_key(customer_id) {
            return Err(BillingError::payment("No such customer"));
        }
        let sub = ProviderSubscription {
            id: self.next_id("sub"),
            status: ProviderSubscriptionStatus::Active,
            quantity: seats,
            plan_identifier: Some(plan_identifier.to_string()),
        };
        state.subscriptions.insert(sub.id.clone(), sub.clone());
        Ok(sub)
    }

    async fn modify_subscription(&self, subscription_id: &str, seats: u32) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.calls.modify_subscription += 1;
        Self::take_failure(&mut state)?;
        match state.subscriptions.get_mut(subscription_id) {
            Some(sub) if sub.status.is_live() => {
                sub.quantity = seats;
                Ok(())
            }
            _ => Err(BillingError::payment("No such subscription")),
        }
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.calls.cancel_subscription += 1;
        Self::take_failure(&mut state)?;
        match state.subscriptions.get_mut(subscription_id) {
            Some(sub) => {
                sub.status = ProviderSubscriptionStatus::Cancelled;
                Ok(())
            }
            None => Err(BillingError::payment("No such subscription")),
        }
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<ProviderSubscription>> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .get(subscription_id)
            .cloned())
    }

    async fn create_charge(
        &self,
        customer_id: &str,
        amount: u32,
        _description: &str,
    ) -> BillingResult<ProviderCharge> {
        let mut state = self.state.lock().await;
        state.calls.create_charge += 1;
        Self::take_failure(&mut state)?;
        if !state.customers.contains_key(customer_id) {
            return Err(BillingError::payment("No such customer"));
        }
        let charge = ProviderCharge {
            id: self.next_id("ch"),
            amount,
        };
        state
            .charges
            .push((customer_id.to_string(), charge.clone()));
        Ok(charge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscription_lifecycle() {
        let provider = MockProvider::new();
        let customer = provider
            .create_customer("tok_visa", "Acme", None)
            .await
            .unwrap();
        let sub = provider
            .create_subscription(&customer, "squarelet_plan_organization", 5)
            .await
            .unwrap();
        assert_eq!(sub.quantity, 5);

        provider.modify_subscription(&sub.id, 8).await.unwrap();
        assert_eq!(provider.subscription(&sub.id).await.unwrap().quantity, 8);

        provider.cancel_subscription(&sub.id).await.unwrap();
        assert!(provider.live_subscriptions().await.is_empty());
        assert!(provider.modify_subscription(&sub.id, 3).await.is_err());
    }

    #[tokio::test]
    async fn test_declined_token_and_injected_failure() {
        let provider = MockProvider::new();
        let err = provider
            .create_customer(DECLINED_TOKEN, "Acme", None)
            .await
            .unwrap_err();
        assert_eq!(err.user_message(), "Your card was declined.");

        provider.fail_next("Provider unavailable").await;
        assert!(provider.create_customer("tok_visa", "Acme", None).await.is_err());
        assert!(provider.create_customer("tok_visa", "Acme", None).await.is_ok());
        assert_eq!(provider.calls().await.create_customer, 3);
    }

    #[tokio::test]
    async fn test_charge_requires_customer() {
        let provider = MockProvider::new();
        assert!(provider.create_charge("cus_missing", 500, "Data").await.is_err());

        let customer = provider
            .create_customer("tok_visa", "Acme", None)
            .await
            .unwrap();
        let charge = provider.create_charge(&customer, 500, "Data").await.unwrap();
        assert_eq!(charge.amount, 500);
        assert_eq!(provider.charges().await, vec![(customer, charge)]);
        assert_eq!(provider.calls().await.create_charge, 2);
    }
}
