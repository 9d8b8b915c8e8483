//! Studio Background Worker
//!
//! Handles scheduled jobs including:
//! - Notification outbox flush (every 5 minutes)
//! - Failed webhook replay from stored payloads (hourly)
//! - Webhook ledger and outbox cleanup (daily at 3:00 AM UTC)

use std::sync::Arc;

use anyhow::Context;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use wellness_billing::{BillingService, FlushSummary, WebhookReplayResult};
use wellness_shared::create_pool;

/// Pending notifications retried per flush
const OUTBOX_BATCH_SIZE: i64 = 100;
/// Failed events replayed per run
const REPLAY_BATCH_SIZE: i64 = 50;
/// Age after which processed ledger rows and settled notifications are deleted
const RETENTION_DAYS: i32 = 30;

/// Log results of a replay run
fn log_replay_results(results: &[WebhookReplayResult]) {
    let succeeded = results.iter().filter(|r| r.success).count();
    let failed = results.len() - succeeded;

    info!(
        replayed = results.len(),
        succeeded = succeeded,
        failed = failed,
        "Webhook replay cycle complete"
    );

    for result in results.iter().filter(|r| !r.success) {
        warn!(
            stripe_event_id = %result.stripe_event_id,
            event_type = %result.event_type,
            error = ?result.new_error,
            "Webhook still failing after replay"
        );
    }
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

    info!("Starting Studio Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = create_pool(&database_url).await?;

    let billing = Arc::new(
        BillingService::from_env(pool).context("Failed to create billing service")?,
    );

    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Retry notifications whose first send failed
    let outbox = billing.outbox.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let outbox = outbox.clone();
            Box::pin(async move {
                match outbox.flush_pending(OUTBOX_BATCH_SIZE).await {
                    Ok(summary) if summary == FlushSummary::default() => {}
                    Ok(summary) => info!(
                        sent = summary.sent,
                        failed = summary.failed,
                        abandoned = summary.abandoned,
                        "Notification outbox flushed"
                    ),
                    Err(e) => error!(error = %e, "Failed to flush notification outbox"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Notification outbox flush (every 5 minutes)");

    // Job 2: Replay failed webhooks from their stored payloads
    let webhooks = billing.webhooks.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let webhooks = webhooks.clone();
            Box::pin(async move {
                match webhooks.replay_all_failed(Some(REPLAY_BATCH_SIZE)).await {
                    Ok(results) if results.is_empty() => {}
                    Ok(results) => log_replay_results(&results),
                    Err(e) => error!(error = %e, "Failed to replay webhooks"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Failed webhook replay (hourly)");

    // Job 3: Prune old ledger rows and settled notifications
    let cleanup_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = cleanup_billing.clone();
            Box::pin(async move {
                info!("Running ledger cleanup");
                if let Err(e) = billing.webhooks.cleanup(RETENTION_DAYS).await {
                    error!(error = %e, "Failed to prune webhook ledger");
                }
                match billing.outbox.prune(RETENTION_DAYS).await {
                    Ok(deleted) => info!(deleted = deleted, "Pruned notification outbox"),
                    Err(e) => error!(error = %e, "Failed to prune notification outbox"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Ledger cleanup (daily at 3:00 AM UTC)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Studio Worker started successfully with 3 scheduled jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;

    Ok(())
}
