#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Coachhub Background Worker
//!
//! Handles scheduled jobs including:
//! - Expired trial reconciliation (every 10 minutes by default)
//! - Entitlement invariant checks (daily at 04:00 UTC by default)
//! - Heartbeat logging (hourly)

mod config;

use coachhub_billing::{
    EntitlementService, InvariantCheckSummary, InvariantChecker, ReconcileSummary,
    ViolationSeverity,
};
use coachhub_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::WorkerConfig;

/// Log results of a trial reconciliation sweep
fn log_reconcile_summary(summary: &ReconcileSummary) {
    if summary.failed > 0 {
        warn!(
            scanned = summary.scanned,
            expired = summary.expired,
            unchanged = summary.unchanged,
            failed = summary.failed,
            "Trial reconciliation finished with failures"
        );
    } else {
        info!(
            scanned = summary.scanned,
            expired = summary.expired,
            unchanged = summary.unchanged,
            "Trial reconciliation complete"
        );
    }
}

/// Log invariant violations at a level matching their severity
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "All entitlement invariants hold");
        return;
    }

    for violation in &summary.violations {
        let affected = violation.user_ids.len();
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                affected = affected,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                affected = affected,
                context = %violation.context,
                "{}",
                violation.description
            ),
        }
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Entitlement invariant check found violations"
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

    info!("Starting Coachhub Worker v{}", env!("CARGO_PKG_VERSION"));

    let config = WorkerConfig::from_env()?;
    let pool = create_pool(&config.database_url, config.db_max_connections).await?;

    let entitlements = EntitlementService::postgres(pool.clone());

    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Move trials past their end to expired/free
    let reconcile_service = entitlements.clone();
    scheduler
        .add(Job::new_async(
            config.trial_reconcile_cron.as_str(),
            move |_uuid, _l| {
                let service = reconcile_service.clone();
                Box::pin(async move {
                    info!("Running expired trial reconciliation");
                    match service.reconcile_expired_trials().await {
                        Ok(summary) => log_reconcile_summary(&summary),
                        Err(e) => error!(error = %e, "Trial reconciliation failed"),
                    }
                })
            },
        )?)
        .await?;
    info!(
        cron = %config.trial_reconcile_cron,
        "Scheduled: Expired trial reconciliation"
    );

    // Job 2: Read-only consistency checks
    let invariant_pool = pool.clone();
    scheduler
        .add(Job::new_async(
            config.invariant_check_cron.as_str(),
            move |_uuid, _l| {
                let checker = InvariantChecker::new(invariant_pool.clone());
                Box::pin(async move {
                    info!("Running entitlement invariant checks");
                    match checker.run_all_checks().await {
                        Ok(summary) => log_invariant_summary(&summary),
                        Err(e) => error!(error = %e, "Invariant checks failed"),
                    }
                })
            },
        )?)
        .await?;
    info!(
        cron = %config.invariant_check_cron,
        "Scheduled: Entitlement invariant checks"
    );

    // Job 3: Heartbeat, with pool stats
    let heartbeat_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let pool = heartbeat_pool.clone();
            Box::pin(async move {
                info!(
                    pool_size = pool.size(),
                    idle_connections = pool.num_idle(),
                    "Worker heartbeat"
                );
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (hourly)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Coachhub Worker started successfully with {} scheduled jobs", 3);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if let Err(e) = scheduler.shutdown().await {
        warn!(error = %e, "Scheduler did not shut down cleanly");
    }
    pool.close().await;

    info!("Worker stopped");
    Ok(())
}
