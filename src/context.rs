/// Application context and dependency injection
use crate::{
    account::{AccountManager, PendingAccountStore},
    billing::{BillingProvider, EventLedger, PaymentReconciler, StripeClient},
    claim::{ClaimCoordinator, PlanPrices},
    config::ServerConfig,
    db,
    directory::SiteDirectory,
    error::{SiteError, SiteResult},
    mailer::{Mailer, Notifier},
    preview::{PreviewGovernor, PreviewPolicy},
    rate_limit::RateLimiter,
};
use chrono::Duration;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub db: SqlitePool,
    pub directory: Arc<SiteDirectory>,
    pub accounts: Arc<AccountManager>,
    pub pending_accounts: Arc<PendingAccountStore>,
    // Billing
    pub billing: Arc<dyn BillingProvider>,
    pub claims: Arc<ClaimCoordinator>,
    pub reconciler: Arc<PaymentReconciler>,
    // Preview lifecycle
    pub previews: Arc<PreviewGovernor>,
    pub rate_limiter: Arc<RateLimiter>,
    pub notifier: Arc<dyn Notifier>,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: ServerConfig) -> SiteResult<Self> {
        config.validate()?;

        Self::ensure_directories(&config).await?;

        let db = db::create_pool(&config.storage.database, db::DatabaseOptions::default()).await?;
        db::run_migrations(&db).await?;
        db::test_connection(&db).await?;

        let billing: Arc<dyn BillingProvider> = Arc::new(StripeClient::new(&config.billing)?);
        let notifier: Arc<dyn Notifier> = Arc::new(Mailer::new(config.email.clone())?);

        Ok(Self::from_parts(config, db, billing, notifier))
    }

    /// Context over an in-memory database with injected collaborators
    pub async fn for_testing(
        config: ServerConfig,
        billing: Arc<dyn BillingProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> SiteResult<Self> {
        let db = db::connect_in_memory().await?;
        Ok(Self::from_parts(config, db, billing, notifier))
    }

    /// Wire services over an already-migrated pool
    pub fn from_parts(
        config: ServerConfig,
        db: SqlitePool,
        billing: Arc<dyn BillingProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let directory = Arc::new(SiteDirectory::new(db.clone()));
        let accounts = Arc::new(AccountManager::new(
            db.clone(),
            Duration::days(config.authentication.session_ttl_days),
        ));
        let pending_accounts = Arc::new(PendingAccountStore::new(db.clone()));

        let claims = Arc::new(ClaimCoordinator::new(
            directory.clone(),
            pending_accounts.clone(),
            billing.clone(),
            PlanPrices {
                basic: config.billing.price_basic.clone(),
                premium: config.billing.price_premium.clone(),
            },
            config.service.public_url.clone(),
        ));

        let reconciler = Arc::new(PaymentReconciler::new(
            directory.clone(),
            pending_accounts.clone(),
            accounts.clone(),
            EventLedger::new(db.clone()),
            notifier.clone(),
            config.billing.webhook_secret.clone(),
            config.billing.signature_tolerance_secs,
            config.service.primary_domain.clone(),
        ));

        let previews = Arc::new(PreviewGovernor::new(
            directory.clone(),
            notifier.clone(),
            PreviewPolicy::default(),
            config.service.public_url.clone(),
        ));

        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));

        Self {
            config: Arc::new(config),
            db,
            directory,
            accounts,
            pending_accounts,
            billing,
            claims,
            reconciler,
            previews,
            rate_limiter,
            notifier,
        }
    }

    /// Ensure required directories exist
    async fn ensure_directories(config: &ServerConfig) -> SiteResult<()> {
        let mut dirs = vec![config.storage.data_directory.clone()];
        if let Some(parent) = config.storage.database.parent() {
            dirs.push(parent.to_path_buf());
        }

        for dir in dirs {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                    SiteError::Internal(format!("Failed to create directory {:?}: {}", dir, e))
                })?;
            }
        }

        Ok(())
    }
}
