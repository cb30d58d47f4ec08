//! One-off charges
//!
//! Charges an organization's billing customer outside its subscription, on a
//! chosen billing account, and records the charge locally in the same
//! transaction that holds the organization row. A charge the provider accepted
//! but that could not be recorded is reported for reconciliation.

use std::sync::Arc;

use serde::Deserialize;
use squarelet_shared::{Charge, ChargeId, OrgId, UserId, DEFAULT_BILLING_ACCOUNT};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::store::Store;
use crate::subscriptions::{ProviderEffects, SubscriptionManager};

/// Fee percentages above this are refused
const MAX_FEE_PERCENT: u32 = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct ChargeRequest {
    /// Amount in cents
    pub amount: u32,
    /// Fee percentage included in `amount`
    #[serde(default)]
    pub fee_amount: u32,
    pub description: String,
    /// Tokenized payment method, required when no customer is on file
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user: Option<UserId>,
    /// Billing account to charge through; the default account when absent
    #[serde(default)]
    pub billing_account: Option<String>,
}

#[derive(Clone)]
pub struct ChargeService {
    store: Arc<dyn Store>,
    subscriptions: SubscriptionManager,
}

impl ChargeService {
    pub fn new(store: Arc<dyn Store>, subscriptions: SubscriptionManager) -> Self {
        Self {
            store,
            subscriptions,
        }
    }

    pub async fn charge(&self, org_id: OrgId, request: &ChargeRequest) -> BillingResult<Charge> {
        if request.amount == 0 {
            return Err(BillingError::Validation(
                "Charge amount must be positive".to_string(),
            ));
        }
        if request.fee_amount > MAX_FEE_PERCENT {
            return Err(BillingError::Validation(format!(
                "Fee must be between 0 and {} percent",
                MAX_FEE_PERCENT
            )));
        }
        let description = request.description.trim();
        if description.is_empty() {
            return Err(BillingError::Validation(
                "Charge description must not be empty".to_string(),
            ));
        }
        let account = request
            .billing_account
            .as_deref()
            .unwrap_or(DEFAULT_BILLING_ACCOUNT);
        self.subscriptions.provider(account)?;
        let email = match request.user {
            Some(id) => self.store.get_user(id).await?.map(|u| u.email),
            None => None,
        };

        let mut tx = self.store.begin().await?;
        let mut org = tx.lock_organization(org_id).await?;
        let token = request.token.as_deref().filter(|t| !t.is_empty());
        if org.customer(account).is_none() && token.is_none() {
            return Err(BillingError::Validation(
                "A payment method is required for this charge".to_string(),
            ));
        }

        let mut effects = ProviderEffects::new(org.id);
        let result = async {
            let customer_id = self
                .subscriptions
                .ensure_customer(&mut org, account, token, email.as_deref(), &mut effects)
                .await?;
            let remote = self
                .subscriptions
                .charge(account, &customer_id, request.amount, description, &mut effects)
                .await?;

            let charge = Charge {
                id: ChargeId::new(),
                organization: org.id,
                amount: remote.amount,
                fee_amount: request.fee_amount,
                provider_charge_id: remote.id,
                billing_account: account.to_string(),
                description: description.to_string(),
                created_at: OffsetDateTime::now_utc(),
            };
            tx.insert_charge(&charge).await?;
            org.updated_at = OffsetDateTime::now_utc();
            tx.save_organization(&org).await?;
            tx.commit().await?;
            Ok(charge)
        }
        .await;

        match result {
            Ok(charge) => {
                tracing::info!(
                    org_id = %charge.organization,
                    charge_id = %charge.id,
                    account,
                    amount = charge.amount,
                    "Recorded charge"
                );
                Ok(charge)
            }
            Err(e) => {
                self.subscriptions.report_failure(&effects, &e).await;
                Err(e)
            }
        }
    }

    /// Charges made to an organization, oldest first
    pub async fn list(&self, org_id: OrgId) -> BillingResult<Vec<Charge>> {
        self.store.charges_for_org(org_id).await
    }
}
