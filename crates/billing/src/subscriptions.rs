//! Subscription management
//!
//! Keeps local subscription rows in step with the billing provider. Provider
//! calls happen inside the caller's transaction so the organization row stays
//! locked; every provider effect is tracked so that a failed local write can be
//! reported for reconciliation instead of being lost.

use std::sync::Arc;

use squarelet_shared::{OrgId, Organization, Plan, Subscription, SubscriptionId};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::provider::{BillingProvider, ProviderCharge, ProviderRegistry};
use crate::reconciliation::{ReconciliationItem, ReconciliationKind, ReconciliationQueue};
use crate::store::StoreTx;

/// A change the provider has accepted but local state has not yet committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEffect {
    CustomerCreated {
        account: String,
        customer_id: String,
    },
    SubscriptionCreated {
        account: String,
        subscription_id: String,
    },
    SeatsModified {
        account: String,
        subscription_id: String,
        seats: u32,
    },
    SubscriptionCancelled {
        account: String,
        subscription_id: String,
    },
    ChargeCreated {
        account: String,
        charge_id: String,
        amount: u32,
    },
}

/// Provider effects of one organization mutation
#[derive(Debug, Clone)]
pub struct ProviderEffects {
    organization: OrgId,
    effects: Vec<ProviderEffect>,
}

impl ProviderEffects {
    pub fn new(organization: OrgId) -> Self {
        Self {
            organization,
            effects: Vec::new(),
        }
    }

    pub fn push(&mut self, effect: ProviderEffect) {
        self.effects.push(effect);
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProviderEffect> {
        self.effects.iter()
    }
}

#[derive(Clone)]
pub struct SubscriptionManager {
    providers: ProviderRegistry,
    queue: ReconciliationQueue,
}

impl SubscriptionManager {
    pub fn new(providers: ProviderRegistry, queue: ReconciliationQueue) -> Self {
        Self { providers, queue }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Provider behind a billing account
    pub fn provider(&self, account: &str) -> BillingResult<&Arc<dyn BillingProvider>> {
        self.providers.get(account)
    }

    /// Return the organization's customer on `account`, creating it from `token` if needed
    pub async fn ensure_customer(
        &self,
        org: &mut Organization,
        account: &str,
        token: Option<&str>,
        email: Option<&str>,
        effects: &mut ProviderEffects,
    ) -> BillingResult<String> {
        if let Some(customer_id) = org.customer(account) {
            return Ok(customer_id.to_string());
        }
        let provider = self.provider(account)?;
        let token = token.ok_or_else(|| {
            BillingError::Validation("A payment method is required for this plan".to_string())
        })?;

        let customer_id = provider.create_customer(token, &org.name, email).await?;
        effects.push(ProviderEffect::CustomerCreated {
            account: account.to_string(),
            customer_id: customer_id.clone(),
        });
        org.set_customer(account, &customer_id);

        tracing::info!(
            org_id = %org.id,
            account,
            customer_id = %customer_id,
            "Created billing customer"
        );
        Ok(customer_id)
    }

    /// Create a provider subscription on the plan's billing account and its local row
    pub async fn create(
        &self,
        tx: &mut dyn StoreTx,
        org: &Organization,
        customer_id: &str,
        plan: &Plan,
        seats: u32,
        effects: &mut ProviderEffects,
    ) -> BillingResult<Subscription> {
        let remote = self
            .provider(&plan.billing_account)?
            .create_subscription(customer_id, &plan.provider_plan_id(), seats)
            .await?;
        effects.push(ProviderEffect::SubscriptionCreated {
            account: plan.billing_account.clone(),
            subscription_id: remote.id.clone(),
        });

        let subscription = Subscription {
            id: SubscriptionId::new(),
            organization: org.id,
            plan: plan.id,
            provider_subscription_id: remote.id,
            billing_account: plan.billing_account.clone(),
            created_at: OffsetDateTime::now_utc(),
        };
        tx.insert_subscription(&subscription).await?;

        tracing::info!(
            org_id = %org.id,
            plan = %plan.slug,
            account = %plan.billing_account,
            subscription_id = %subscription.provider_subscription_id,
            seats,
            "Created subscription"
        );
        Ok(subscription)
    }

    pub async fn modify(
        &self,
        subscription: &Subscription,
        seats: u32,
        effects: &mut ProviderEffects,
    ) -> BillingResult<()> {
        self.provider(&subscription.billing_account)?
            .modify_subscription(&subscription.provider_subscription_id, seats)
            .await?;
        effects.push(ProviderEffect::SeatsModified {
            account: subscription.billing_account.clone(),
            subscription_id: subscription.provider_subscription_id.clone(),
            seats,
        });

        tracing::info!(
            org_id = %subscription.organization,
            subscription_id = %subscription.provider_subscription_id,
            seats,
            "Modified subscription seats"
        );
        Ok(())
    }

    /// Cancel on the provider and remove the local row
    pub async fn cancel(
        &self,
        tx: &mut dyn StoreTx,
        subscription: &Subscription,
        effects: &mut ProviderEffects,
    ) -> BillingResult<()> {
        self.provider(&subscription.billing_account)?
            .cancel_subscription(&subscription.provider_subscription_id)
            .await?;
        effects.push(ProviderEffect::SubscriptionCancelled {
            account: subscription.billing_account.clone(),
            subscription_id: subscription.provider_subscription_id.clone(),
        });
        tx.delete_subscription(subscription.id).await?;

        tracing::info!(
            org_id = %subscription.organization,
            subscription_id = %subscription.provider_subscription_id,
            "Cancelled subscription"
        );
        Ok(())
    }

    /// Charge a customer once on `account`
    pub async fn charge(
        &self,
        account: &str,
        customer_id: &str,
        amount: u32,
        description: &str,
        effects: &mut ProviderEffects,
    ) -> BillingResult<ProviderCharge> {
        let charge = self
            .provider(account)?
            .create_charge(customer_id, amount, description)
            .await?;
        effects.push(ProviderEffect::ChargeCreated {
            account: account.to_string(),
            charge_id: charge.id.clone(),
            amount: charge.amount,
        });

        tracing::info!(
            org_id = %effects.organization,
            account,
            charge_id = %charge.id,
            amount = charge.amount,
            "Charged billing customer"
        );
        Ok(charge)
    }

    /// Record every provider effect of a mutation whose local write failed
    pub async fn report_failure(&self, effects: &ProviderEffects, error: &BillingError) {
        for effect in effects.iter() {
            let (account, kind, reference, detail) = match effect {
                ProviderEffect::CustomerCreated {
                    account,
                    customer_id,
                } => {
                    tracing::warn!(
                        org_id = %effects.organization,
                        account = %account,
                        customer_id = %customer_id,
                        error = %error,
                        "Billing customer created but not saved"
                    );
                    continue;
                }
                ProviderEffect::SubscriptionCreated {
                    account,
                    subscription_id,
                } => (
                    account,
                    ReconciliationKind::OrphanSubscription,
                    Some(subscription_id.clone()),
                    format!("Subscription created but not recorded: {}", error),
                ),
                ProviderEffect::SeatsModified {
                    account,
                    subscription_id,
                    seats,
                } => (
                    account,
                    ReconciliationKind::SeatCount,
                    Some(subscription_id.clone()),
                    format!("Provider seats set to {} but not recorded: {}", seats, error),
                ),
                ProviderEffect::SubscriptionCancelled {
                    account,
                    subscription_id,
                } => (
                    account,
                    ReconciliationKind::Cancellation,
                    Some(subscription_id.clone()),
                    format!("Subscription cancelled but still recorded: {}", error),
                ),
                ProviderEffect::ChargeCreated {
                    account,
                    charge_id,
                    amount,
                } => (
                    account,
                    ReconciliationKind::UnrecordedCharge,
                    None,
                    format!(
                        "Charge {} for {} cents made but not recorded: {}",
                        charge_id, amount, error
                    ),
                ),
            };
            self.queue
                .record(
                    ReconciliationItem::new(effects.organization, kind, reference, detail)
                        .with_account(account),
                )
                .await;
        }
    }
}
