//! Jobs Worker Service
//!
//! Runs one job processor and one scheduler in a single process.
//!
//! ```text
//! Redis ({stream}:delayed sorted set, tick locks)
//!   ↓ JobScheduler (delayed poll + heartbeat)
//! NATS JetStream ({stream} work queue)
//!   ↓ pull consumer {stream}Consumer
//! JobProcessor → LogPerform
//! ```
//!
//! Configuration comes from the environment: `NATS_URL`, `REDIS_HOST`,
//! `APP_ENV`, `RUST_LOG` and the `JOBS_*` variables read by
//! [`WorkerConfig`].

pub mod config;
pub mod events;
pub mod handler;
pub mod metrics;

pub use config::WorkerConfig;
pub use handler::{heartbeat, LogPerform};

use core_config::nats::NatsConfig;
use core_config::redis::RedisConfig;
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use nats_jobs::{JobProcessor, JobScheduler, RedisLockStore};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

/// Run the worker until SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns an error if configuration is invalid, NATS or Redis cannot be
/// reached, or the job's consumer cannot be created.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let metrics_handle = metrics::init_metrics()?;

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        environment = ?environment,
        "Starting jobs worker"
    );

    let config = WorkerConfig::from_env().wrap_err("Failed to load worker configuration")?;
    let nats_config = NatsConfig::from_env().wrap_err("Failed to load NATS configuration")?;
    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;
    info!(
        stream = %config.stream,
        batch = config.batch,
        pull_interval_ms = config.pull_interval.as_millis() as u64,
        timeout_ms = config.timeout.map(|t| t.as_millis() as u64),
        num_attempts = config.num_attempts,
        "Worker configuration loaded"
    );

    let processor = JobProcessor::connect(&nats_config)
        .await
        .wrap_err_with(|| format!("Failed to connect to NATS at {}", nats_config.url))?;
    let locks = RedisLockStore::from_config(&redis_config)
        .await
        .wrap_err("Failed to connect to Redis")?;

    let event_logger = events::spawn_event_logger(processor.subscribe());

    processor
        .start(config.job_def(LogPerform))
        .await
        .wrap_err_with(|| format!("Failed to start job on stream {}", config.stream))?;

    let scheduler = JobScheduler::new(processor.publisher(), Arc::new(locks));
    scheduler.publish_delayed(config.delayed_poll());
    if let Some(period) = config.heartbeat {
        scheduler.schedule_recurring(heartbeat(&config.stream, period));
    }
    info!(owner = %scheduler.owner(), "Worker running");

    shutdown_signal()
        .await
        .wrap_err("Failed to listen for shutdown signals")?;

    scheduler.stop().await;
    processor
        .stop()
        .await
        .wrap_err("Failed to stop job processor")?;
    if let Err(e) = event_logger.await {
        warn!(error = %e, "Event logger ended abnormally");
    }

    info!(metrics = %metrics_handle.render(), "Jobs worker stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, initiating shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C, initiating shutdown...");
    }

    Ok(())
}
