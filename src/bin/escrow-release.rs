//! Deposit release worker.
//!
//! Prepares the database (migrations, resolution repair, completion guards)
//! and then runs the deposit auto-release scheduler until interrupted. Refuses
//! to start if the completion guards cannot be installed.

use anyhow::{Context, Result};
use clap::Parser;
use escrow::{HttpPaymentProcessor, ReleaseScheduler, setup_database};
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Releases captured deposits to providers once their jobs are done
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Maximum number of database connections
    #[arg(long, env = "DATABASE_POOL_SIZE", default_value_t = 5)]
    pool_size: u32,

    /// Base URL of the payment processor API
    #[arg(long, env = "PROCESSOR_URL")]
    processor_url: String,

    /// API key for the payment processor
    #[arg(long, env = "PROCESSOR_API_KEY", hide_env_values = true)]
    processor_api_key: String,

    /// Currency transfers are made in
    #[arg(long, env = "RELEASE_CURRENCY", default_value = escrow::DEFAULT_CURRENCY)]
    currency: String,

    /// Seconds between release cycles
    #[arg(long, env = "RELEASE_INTERVAL_SECS", default_value_t = 300)]
    interval_secs: u64,

    /// Maximum random seconds added to each interval
    #[arg(long, env = "RELEASE_JITTER_SECS", default_value_t = 10)]
    jitter_secs: u64,

    /// Hours after job completion before a deposit is released
    #[arg(long, env = "RELEASE_DELAY_HOURS", default_value_t = 24)]
    release_delay_hours: u64,

    /// Seconds to wait for the processor before giving up on a transfer
    #[arg(long, env = "TRANSFER_TIMEOUT_SECS", default_value_t = 30)]
    transfer_timeout_secs: u64,

    /// Maximum bookings handled per cycle
    #[arg(long, env = "RELEASE_BATCH_SIZE", default_value_t = 100)]
    batch_size: i64,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,escrow=info,escrow_release=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .init();

    let args = Args::parse();

    let pool = PgPoolOptions::new()
        .max_connections(args.pool_size)
        .connect(&args.database_url)
        .await
        .context("Failed to connect to database")?;

    if let Err(error) = setup_database(&pool).await {
        error!("Refusing to start: {error}");
        return Err(error.into());
    }

    let transfer_timeout = Duration::from_secs(args.transfer_timeout_secs);
    let processor =
        HttpPaymentProcessor::new(&args.processor_url, &args.processor_api_key, transfer_timeout)?;

    let mut scheduler = ReleaseScheduler::new(pool, processor)
        .poll_interval(Duration::from_secs(args.interval_secs))
        .jitter(Duration::from_secs(args.jitter_secs))
        .release_delay(Duration::from_secs(args.release_delay_hours * 60 * 60))
        .transfer_timeout(transfer_timeout)
        .batch_size(args.batch_size)
        .currency(args.currency);
    if args.once {
        scheduler = scheduler.shutdown_after_first_cycle();
    }

    let handle = scheduler.start();

    if !args.once {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("Shutdown requested, finishing current cycle…");
        handle.shutdown();
    }

    handle.wait_for_shutdown().await;
    Ok(())
}
