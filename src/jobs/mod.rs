use crate::metrics;
use std::{sync::Arc, time::Instant};
use tokio::time::{interval, Duration};
use tracing::{error, info};

pub mod tasks;

/// Job scheduler for background tasks
pub struct JobScheduler {
    context: Arc<crate::context::AppContext>,
}

impl JobScheduler {
    pub fn new(context: Arc<crate::context::AppContext>) -> Self {
        Self { context }
    }

    /// Start all background jobs
    pub fn start(self: Arc<Self>) {
        info!("Starting background job scheduler");

        tokio::spawn(Self::preview_reminder_job(Arc::clone(&self)));
        tokio::spawn(Self::credential_cleanup_job(Arc::clone(&self)));
        tokio::spawn(Self::health_check_job(Arc::clone(&self)));

        info!("Background jobs started");
    }

    /// Preview expiry reminders (every `SITEHOST_REMINDER_INTERVAL_SECS`, default 15 minutes)
    async fn preview_reminder_job(scheduler: Arc<Self>) {
        let period = scheduler.context.config.preview.reminder_interval_secs.max(1);
        let mut interval = interval(Duration::from_secs(period));

        loop {
            interval.tick().await;
            let started = Instant::now();

            match tasks::send_preview_reminders(&scheduler.context).await {
                Ok(count) => {
                    if count > 0 {
                        info!("Sent {} preview reminders", count);
                    }
                    metrics::record_background_job("preview_reminders", "success", started.elapsed().as_secs_f64());
                }
                Err(e) => {
                    error!("Preview reminder sweep failed: {}", e);
                    metrics::record_background_job("preview_reminders", "error", started.elapsed().as_secs_f64());
                }
            }
        }
    }

    /// Purge expired pending accounts and sessions (runs every hour)
    async fn credential_cleanup_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(3600));

        loop {
            interval.tick().await;
            let started = Instant::now();

            match tasks::purge_expired_credentials(&scheduler.context).await {
                Ok(count) => {
                    if count > 0 {
                        info!("Purged {} expired pending accounts and sessions", count);
                    }
                    metrics::record_background_job("credential_cleanup", "success", started.elapsed().as_secs_f64());
                }
                Err(e) => {
                    error!("Failed to purge expired credentials: {}", e);
                    metrics::record_background_job("credential_cleanup", "error", started.elapsed().as_secs_f64());
                }
            }
        }
    }

    /// Health check job (runs every 5 minutes)
    async fn health_check_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(300));

        loop {
            interval.tick().await;

            if let Err(e) = tasks::health_check(&scheduler.context).await {
                error!("Health check failed: {}", e);
            }
        }
    }
}
