//! HireDesk Entitlement Worker
//!
//! Drives the time-based side of the lifecycle engine:
//! - Lifecycle sweep: trial/period/grace expiries and monthly counter
//!   resets (hourly)
//! - Invariant checks over stored entitlement state (daily at 6:00 UTC)
//! - Health check heartbeat (every 5 minutes)
//!
//! Multiple instances may run at once; every sweep mutation is a
//! conditional update, so overlapping sweeps are safe.

use std::sync::Arc;
use std::time::Duration;

use hiredesk_entitlement::{EngineConfig, EntitlementEngine, PgEntitlementStore};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting HireDesk Entitlement Worker");

    let pool = create_db_pool().await?;

    let store = PgEntitlementStore::new(pool.clone());
    store.run_migrations().await?;
    info!("Migrations applied");

    let config = EngineConfig::from_env();
    info!(
        trial_days = config.trial_days,
        cycle_days = config.cycle_days,
        default_grace_days = config.default_grace_days,
        "Engine configuration loaded"
    );
    let engine = Arc::new(EntitlementEngine::with_postgres(pool, config));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Lifecycle sweep every hour
    // Cron: at minute 0 of every hour - expiries and monthly counter resets
    let sweep_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let engine = sweep_engine.clone();
            Box::pin(async move {
                info!("Running lifecycle sweep");
                let now = time::OffsetDateTime::now_utc();
                match engine.scheduler().run_once(now).await {
                    Ok(summary) => {
                        if summary.errors > 0 {
                            warn!(
                                scanned = summary.scanned,
                                errors = summary.errors,
                                "Lifecycle sweep finished with errors"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Lifecycle sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Lifecycle sweep (hourly)");

    // Job 2: Entitlement invariant checks (daily at 6:00 UTC)
    let invariants_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 0 6 * * *", move |_uuid, _l| {
            let engine = invariants_engine.clone();
            Box::pin(async move {
                info!("Running entitlement invariant checks");
                match engine.invariants().run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks_run = summary.checks_run, "All invariants hold");
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                tenants = ?violation.tenant_ids,
                                description = %violation.description,
                                "Invariant violation detected"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant check run failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Invariant checks (daily at 6:00 UTC)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    scheduler.start().await?;
    info!("Worker started successfully");

    // Keep the worker alive
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
