//! Squarelet Background Worker
//!
//! Handles scheduled jobs:
//! - Provider reconciliation (`RECONCILE_CRON`, every 15 minutes by default)
//! - Billing invariant checks (`INVARIANT_CRON`, hourly by default)
//! - Billing cycle rollover (`ROLLOVER_CRON`, daily at 02:00 UTC by default)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use squarelet_billing::{BillingService, InvariantCheckSummary, ReconcileReport, RolloverReport};
use squarelet_shared::Config;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

fn log_reconcile_report(report: &ReconcileReport) {
    if report.failures > 0 {
        warn!(
            organizations = report.organizations_checked,
            failures = report.failures,
            "Reconciliation finished with failures"
        );
    } else {
        info!(
            organizations = report.organizations_checked,
            removed = report.subscriptions_removed,
            seats = report.seats_corrected,
            resolved = report.items_resolved,
            "Reconciliation cycle complete"
        );
    }
}

fn log_rollover_report(report: &RolloverReport) {
    if report.failures > 0 {
        warn!(
            organizations = report.organizations_checked,
            rolled_over = report.rolled_over,
            failures = report.failures,
            "Billing cycle rollover finished with failures"
        );
    } else {
        info!(
            organizations = report.organizations_checked,
            rolled_over = report.rolled_over,
            advanced = report.cycles_advanced,
            "Billing cycle rollover complete"
        );
    }
}

fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks = summary.checks_run, "All billing invariants hold");
        return;
    }
    error!(
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Billing invariants violated"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Squarelet Worker");

    let config = Config::from_env()?;
    info!(provider = ?config.provider, "Configuration loaded");

    let billing = Arc::new(BillingService::from_config(&config).await?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Reconcile local subscriptions with the billing provider
    let reconcile_billing = billing.clone();
    scheduler
        .add(Job::new_async(config.reconcile_cron.as_str(), move |_uuid, _l| {
            let billing = reconcile_billing.clone();
            Box::pin(async move {
                info!("Running scheduled provider reconciliation");
                match billing.reconciler.run().await {
                    Ok(report) => log_reconcile_report(&report),
                    Err(e) => error!(error = %e, "Reconciliation failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %config.reconcile_cron, "Scheduled: Provider reconciliation");

    // Job 2: Billing invariant checks
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async(config.invariant_cron.as_str(), move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match billing.invariants.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant checks failed to run"),
                }
            })
        })?)
        .await?;
    info!(cron = %config.invariant_cron, "Scheduled: Billing invariant checks");

    // Job 3: Apply pending plan changes whose billing cycle has ended
    let rollover_billing = billing.clone();
    scheduler
        .add(Job::new_async(config.rollover_cron.as_str(), move |_uuid, _l| {
            let billing = rollover_billing.clone();
            Box::pin(async move {
                let today = OffsetDateTime::now_utc().date();
                info!(%today, "Running billing cycle rollover");
                match billing.organizations.rollover_due(today).await {
                    Ok(report) => log_rollover_report(&report),
                    Err(e) => error!(error = %e, "Billing cycle rollover failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %config.rollover_cron, "Scheduled: Billing cycle rollover");

    // Job 4: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Squarelet Worker started with 4 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
