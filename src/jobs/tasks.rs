/// Background task implementations
use crate::{context::AppContext, error::SiteResult};
use chrono::Utc;

/// Send due preview reminders
pub async fn send_preview_reminders(ctx: &AppContext) -> SiteResult<u64> {
    ctx.previews.run_reminder_sweep(Utc::now()).await
}

/// Delete expired pending accounts and sessions
pub async fn purge_expired_credentials(ctx: &AppContext) -> SiteResult<u64> {
    let now = Utc::now();
    let pending = ctx.pending_accounts.purge_expired(now).await?;
    let sessions = ctx.accounts.purge_expired_sessions(now).await?;

    Ok(pending + sessions)
}

/// Health check - verify the store is reachable
pub async fn health_check(ctx: &AppContext) -> SiteResult<()> {
    sqlx::query("SELECT 1").fetch_one(&ctx.db).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        account::hash_password,
        billing::{BillingProvider, CheckoutParams, CheckoutSession},
        config::ServerConfig,
        directory::NewSite,
        mailer::Notifier,
    };
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::Arc;

    struct NoopProvider;

    #[async_trait]
    impl BillingProvider for NoopProvider {
        async fn find_or_create_customer(&self, _: &str, _: Option<&str>) -> SiteResult<String> {
            Ok("cus_1".to_string())
        }
        async fn create_checkout_session(&self, _: &CheckoutParams) -> SiteResult<CheckoutSession> {
            Ok(CheckoutSession {
                id: "cs_1".to_string(),
                url: "https://checkout.test".to_string(),
            })
        }
        async fn create_portal_session(&self, _: &str, _: &str) -> SiteResult<String> {
            Ok("https://portal.test".to_string())
        }
    }

    struct NoopNotifier;

    #[async_trait]
    impl Notifier for NoopNotifier {
        async fn send_claim_confirmation(&self, _: &str, _: &str, _: &str) -> SiteResult<()> {
            Ok(())
        }
        async fn send_preview_reminder(&self, _: &str, _: &str, _: &str) -> SiteResult<()> {
            Ok(())
        }
    }

    async fn context() -> AppContext {
        AppContext::for_testing(
            ServerConfig::for_testing("example.site"),
            Arc::new(NoopProvider),
            Arc::new(NoopNotifier),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let ctx = context().await;
        assert!(health_check(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_purge_keeps_live_credentials() {
        let ctx = context().await;
        ctx.pending_accounts
            .create_at("old@example.com", "hunter22!".to_string(), Utc::now() - Duration::hours(30))
            .await
            .unwrap();
        ctx.pending_accounts
            .create("new@example.com", "hunter22!".to_string())
            .await
            .unwrap();

        let hash = hash_password("hunter22!".to_string()).await.unwrap();
        let account = ctx
            .accounts
            .create_with_password_hash("owner@example.com", &hash)
            .await
            .unwrap();
        let token = ctx.accounts.create_session(&account.id).await.unwrap();

        assert_eq!(purge_expired_credentials(&ctx).await.unwrap(), 1);
        assert!(ctx.accounts.validate_session(&token).await.is_ok());
    }

    #[tokio::test]
    async fn test_reminder_job_runs_sweep() {
        let ctx = context().await;
        ctx.directory
            .create_preview_at(
                NewSite {
                    business_name: "Acme Bakery".to_string(),
                    content_ref: "content/acme".to_string(),
                    owner_email: Some("owner@example.com".to_string()),
                },
                Utc::now() - Duration::minutes(19 * 60 + 30),
            )
            .await
            .unwrap();

        assert_eq!(send_preview_reminders(&ctx).await.unwrap(), 1);
        assert_eq!(send_preview_reminders(&ctx).await.unwrap(), 0);
    }
}
