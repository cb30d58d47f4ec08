// Billing crate clippy configuration
#![allow(clippy::too_many_arguments)] // Provider sequencing threads the transaction and effect log
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Squarelet Billing Core
//!
//! Organization lifecycle and entitlement resolution, backed by Stripe.
//!
//! ## Features
//!
//! - **Catalog**: Plans bundle entitlements; resource grants merge across plans
//! - **Organizations**: Plan changes, seat updates, cancellation, cycle rollover
//! - **Subscriptions**: Provider calls tracked so failures surface for reconciliation
//! - **Billing Accounts**: Plans and charges routed to the provider for their account
//! - **Charges**: One-off charges recorded alongside the provider charge
//! - **Change Log**: One audit entry per plan or seat mutation
//! - **Memberships**: Invitations, join requests, roles
//! - **Signup**: Registration with an optional paid plan
//! - **Entitlements**: Viewable, subscribed and owned sets for access control
//! - **Cache Invalidation**: Signed events for OIDC clients
//! - **Reconciliation & Invariants**: Provider-vs-local checks run by the worker

pub mod catalog;
pub mod changelog;
pub mod charges;
pub mod client;
pub mod entitlement;
pub mod error;
pub mod invalidation;
pub mod invariants;
pub mod memberships;
pub mod mock;
pub mod organizations;
pub mod provider;
pub mod reconciliation;
pub mod signup;
pub mod store;
pub mod subscriptions;


// Catalog
pub use catalog::{Catalog, PlanAdmin, SharedCatalog};

// Change Log
pub use changelog::ChangeLogRecorder;

// Charges
pub use charges::{ChargeRequest, ChargeService};

// Client
pub use client::{StripeClient, StripeConfig};

// Entitlement
pub use entitlement::{
    resolve_entitlements, EntitlementQuery, EntitlementResolver, StoreEntitlementResolver,
};

// Error
pub use error::{BillingError, BillingResult, PaymentError};

// Invalidation
pub use invalidation::{
    InvalidationDispatcher, InvalidationEvent, InvalidationModel, InvalidationSink, MemorySink,
    PendingDelivery,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Memberships
pub use memberships::MembershipService;

// Mock provider
pub use mock::MockProvider;

// Organizations
pub use organizations::{CancelDisposition, OrganizationService, PlanChange, RolloverReport};

// Provider
pub use provider::{
    BillingProvider, ProviderCharge, ProviderRegistry, ProviderSubscription,
    ProviderSubscriptionStatus,
};

// Reconciliation
pub use reconciliation::{
    ReconcileReport, Reconciler, ReconciliationItem, ReconciliationKind, ReconciliationQueue,
};

// Signup
pub use signup::{SignupOutcome, SignupRequest, SignupService};

// Store
pub use store::{MemoryStore, PgStore, Store, StoreTx};

// Subscriptions
pub use subscriptions::{ProviderEffect, ProviderEffects, SubscriptionManager};

use std::sync::Arc;

use squarelet_shared::{Config, ProviderKind};

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub store: Arc<dyn Store>,
    pub providers: ProviderRegistry,
    pub catalog: SharedCatalog,
    pub changelog: ChangeLogRecorder,
    pub charges: ChargeService,
    pub entitlements: StoreEntitlementResolver,
    pub invariants: InvariantChecker,
    pub memberships: MembershipService,
    pub organizations: OrganizationService,
    pub plans: PlanAdmin,
    pub reconciler: Reconciler,
    pub reconciliation: ReconciliationQueue,
    pub signup: SignupService,
}

impl BillingService {
    /// Create a billing service, loading the catalog from the store
    pub async fn new(
        store: Arc<dyn Store>,
        providers: ProviderRegistry,
        sink: Arc<dyn InvalidationSink>,
    ) -> BillingResult<Self> {
        let catalog = SharedCatalog::load(store.as_ref()).await?;
        Ok(Self::with_catalog(store, providers, sink, catalog))
    }

    /// Create a billing service with an explicit catalog. Every service shares
    /// it, so plan administration is visible to all of them at once.
    pub fn with_catalog(
        store: Arc<dyn Store>,
        providers: ProviderRegistry,
        sink: Arc<dyn InvalidationSink>,
        catalog: SharedCatalog,
    ) -> Self {
        let invalidation = InvalidationDispatcher::new(store.clone(), sink);
        let reconciliation = ReconciliationQueue::new(store.clone());
        let subscriptions = SubscriptionManager::new(providers.clone(), reconciliation.clone());
        let organizations = OrganizationService::new(
            store.clone(),
            catalog.clone(),
            subscriptions.clone(),
            invalidation.clone(),
        );

        Self {
            changelog: ChangeLogRecorder::new(store.clone()),
            charges: ChargeService::new(store.clone(), subscriptions),
            entitlements: StoreEntitlementResolver::new(store.clone(), catalog.clone()),
            invariants: InvariantChecker::new(store.clone(), catalog.clone()),
            memberships: MembershipService::new(store.clone(), invalidation.clone()),
            signup: SignupService::new(store.clone(), organizations.clone(), invalidation),
            organizations,
            plans: PlanAdmin::new(store.clone(), catalog.clone()),
            reconciler: Reconciler::new(store.clone(), providers.clone(), catalog.clone()),
            reconciliation,
            store,
            providers,
            catalog,
        }
    }

    /// Connect to Postgres, apply migrations and build the configured providers
    pub async fn from_config(config: &Config) -> BillingResult<Self> {
        let pool = squarelet_shared::create_pool(
            &config.database_url,
            config.database_max_connections,
        )
        .await?;
        squarelet_shared::run_migrations(&pool)
            .await
            .map_err(|e| BillingError::Database(format!("Migrations failed: {}", e)))?;

        let store = Arc::new(PgStore::new(pool));
        let providers = providers_from_config(&config.provider)?;
        Self::new(store.clone(), providers, store).await
    }
}

/// Build the billing providers selected by configuration, one per billing account
pub fn providers_from_config(kind: &ProviderKind) -> BillingResult<ProviderRegistry> {
    match kind {
        ProviderKind::Stripe { accounts } => {
            let mut registry = ProviderRegistry::new();
            for (account, secret_key) in accounts {
                let config = StripeConfig::new(secret_key.clone())?;
                registry = registry.with_account(account, Arc::new(StripeClient::new(config)));
                tracing::info!(account = %account, "Configured Stripe billing account");
            }
            Ok(registry)
        }
        ProviderKind::Mock => {
            tracing::warn!("Using the in-memory billing provider; no payments are processed");
            Ok(ProviderRegistry::single(Arc::new(MockProvider::new())))
        }
    }
}
