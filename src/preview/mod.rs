/// Preview expiry and edit quota
///
/// `PreviewPolicy` is pure logic over a site's creation time and edit
/// counter. `PreviewGovernor` applies it against the directory: counting
/// edits and sending the one-off expiry reminder.
use crate::{
    directory::{EditAttempt, PaymentStatus, Site, SiteDirectory},
    error::SiteResult,
    mailer::Notifier,
    metrics,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Preview window and quota parameters
#[derive(Debug, Clone)]
pub struct PreviewPolicy {
    /// How long an unpaid site stays viewable
    pub window: Duration,
    /// Edits allowed before claiming
    pub edit_limit: i64,
    /// Reminder is due for sites at least this old...
    pub reminder_from: Duration,
    /// ...and at most this old
    pub reminder_until: Duration,
}

impl Default for PreviewPolicy {
    fn default() -> Self {
        Self {
            window: Duration::hours(24),
            edit_limit: 5,
            reminder_from: Duration::hours(19),
            reminder_until: Duration::hours(20),
        }
    }
}

impl PreviewPolicy {
    pub fn expires_at(&self, site: &Site) -> DateTime<Utc> {
        site.created_at + self.window
    }

    /// Unpaid and past the preview window
    pub fn is_expired(&self, site: &Site, now: DateTime<Utc>) -> bool {
        site.payment_status == PaymentStatus::Unpaid && now > self.expires_at(site)
    }

    /// Edits left before the quota is exhausted, never negative
    pub fn edits_remaining(&self, site: &Site) -> i64 {
        (self.edit_limit - site.preview_edits_used).max(0)
    }
}

/// Wire form of an edit attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditOutcome {
    /// `ok`, `limit_reached` or `unmetered`
    pub status: &'static str,
    pub edits_remaining: Option<i64>,
}

/// Snapshot of a preview for the claim prompt
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewState {
    pub site_id: String,
    pub business_name: String,
    pub payment_status: PaymentStatus,
    pub expired: bool,
    pub expires_at: DateTime<Utc>,
    pub edits_remaining: i64,
}

/// Applies the preview policy to stored sites
pub struct PreviewGovernor {
    directory: Arc<SiteDirectory>,
    notifier: Arc<dyn Notifier>,
    policy: PreviewPolicy,
    public_url: String,
}

impl PreviewGovernor {
    pub fn new(
        directory: Arc<SiteDirectory>,
        notifier: Arc<dyn Notifier>,
        policy: PreviewPolicy,
        public_url: String,
    ) -> Self {
        Self {
            directory,
            notifier,
            policy,
            public_url,
        }
    }

    pub fn policy(&self) -> &PreviewPolicy {
        &self.policy
    }

    /// Current preview state of a site
    pub async fn state(&self, site_id: &str, now: DateTime<Utc>) -> SiteResult<PreviewState> {
        let site = self.directory.find_by_id(site_id).await?;

        Ok(PreviewState {
            expired: self.policy.is_expired(&site, now),
            expires_at: self.policy.expires_at(&site),
            edits_remaining: self.policy.edits_remaining(&site),
            site_id: site.id,
            business_name: site.business_name,
            payment_status: site.payment_status,
        })
    }

    /// Count one edit against the quota
    ///
    /// An exhausted quota is reported as `limit_reached`, not as an error,
    /// and leaves the counter untouched.
    pub async fn record_edit(&self, site_id: &str) -> SiteResult<EditOutcome> {
        let attempt = self
            .directory
            .increment_edit_count(site_id, self.policy.edit_limit)
            .await?;

        Ok(match attempt {
            EditAttempt::Recorded { used } => EditOutcome {
                status: "ok",
                edits_remaining: Some((self.policy.edit_limit - used).max(0)),
            },
            EditAttempt::LimitReached => {
                tracing::debug!(site_id = %site_id, "Preview edit limit reached");
                EditOutcome {
                    status: "limit_reached",
                    edits_remaining: Some(0),
                }
            }
            EditAttempt::Unmetered => EditOutcome {
                status: "unmetered",
                edits_remaining: None,
            },
        })
    }

    /// Send the expiry reminder to every eligible site, at most once per site
    ///
    /// Each site is marked before its reminder goes out; only the sweep that
    /// wins the mark sends. Returns the number of reminders handed to the
    /// notifier.
    pub async fn run_reminder_sweep(&self, now: DateTime<Utc>) -> SiteResult<u64> {
        let candidates = self
            .directory
            .reminder_candidates(now, self.policy.reminder_from, self.policy.reminder_until)
            .await?;

        let mut sent = 0;

        for site in candidates {
            let Some(email) = site.owner_email.as_deref() else {
                continue;
            };

            if !self.directory.mark_reminder_sent(&site.id, now).await? {
                tracing::debug!(site_id = %site.id, "Reminder already claimed by another sweep");
                continue;
            }

            let claim_url = format!("{}/preview/{}", self.public_url, site.id);
            let send = self
                .notifier
                .send_preview_reminder(email, &site.business_name, &claim_url);

            match tokio::time::timeout(std::time::Duration::from_secs(30), send).await {
                Ok(Ok(())) => {
                    metrics::record_reminder("sent");
                    sent += 1;
                }
                Ok(Err(e)) => {
                    metrics::record_reminder("failed");
                    tracing::warn!(site_id = %site.id, "Failed to send preview reminder: {}", e);
                }
                Err(_) => {
                    metrics::record_reminder("timeout");
                    tracing::warn!(site_id = %site.id, "Preview reminder timed out");
                }
            }
        }

        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::directory::{FinalizeClaim, NewSite};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        reminders: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_claim_confirmation(&self, _: &str, _: &str, _: &str) -> SiteResult<()> {
            Ok(())
        }

        async fn send_preview_reminder(&self, to: &str, _: &str, _: &str) -> SiteResult<()> {
            // Yield so concurrent sweeps interleave
            tokio::task::yield_now().await;
            self.reminders.lock().unwrap().push(to.to_string());
            Ok(())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    async fn setup() -> (Arc<SiteDirectory>, Arc<RecordingNotifier>, PreviewGovernor) {
        let directory = Arc::new(SiteDirectory::new(db::connect_in_memory().await.unwrap()));
        let notifier = Arc::new(RecordingNotifier::default());
        let governor = PreviewGovernor::new(
            directory.clone(),
            notifier.clone(),
            PreviewPolicy::default(),
            "https://example.site".to_string(),
        );
        (directory, notifier, governor)
    }

    async fn site_created_at(dir: &SiteDirectory, email: &str, at: DateTime<Utc>) -> Site {
        dir.create_preview_at(
            NewSite {
                business_name: "Bakery".to_string(),
                content_ref: "content/bakery".to_string(),
                owner_email: Some(email.to_string()),
            },
            at,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_expiry_boundary() {
        let (dir, _, governor) = setup().await;
        let site = site_created_at(&dir, "a@example.com", t0()).await;
        let policy = governor.policy();

        let before = t0() + Duration::hours(23) + Duration::minutes(59);
        assert!(!policy.is_expired(&site, before));
        assert_eq!(policy.edits_remaining(&site), 5);

        let after = t0() + Duration::hours(24) + Duration::minutes(1);
        assert!(policy.is_expired(&site, after));
    }

    #[tokio::test]
    async fn test_paid_site_never_expires() {
        let (dir, _, governor) = setup().await;
        let site = site_created_at(&dir, "a@example.com", t0()).await;
        dir.finalize_claim(&FinalizeClaim {
            site_id: site.id.clone(),
            subdomain: "acme".to_string(),
            customer_id: "cus_1".to_string(),
            subscription_id: Some("sub_1".to_string()),
            plan_tier: None,
            owner_email: None,
            owner_user_id: None,
            event_at: 1,
        })
        .await
        .unwrap();

        let site = dir.find_by_id(&site.id).await.unwrap();
        assert!(!governor.policy().is_expired(&site, t0() + Duration::days(30)));
    }

    #[tokio::test]
    async fn test_five_edits_then_limit_reached() {
        let (dir, _, governor) = setup().await;
        let site = site_created_at(&dir, "a@example.com", t0()).await;

        for remaining in (0..5).rev() {
            let outcome = governor.record_edit(&site.id).await.unwrap();
            assert_eq!(outcome.status, "ok");
            assert_eq!(outcome.edits_remaining, Some(remaining));
        }

        let sixth = governor.record_edit(&site.id).await.unwrap();
        assert_eq!(sixth.status, "limit_reached");
        assert_eq!(sixth.edits_remaining, Some(0));

        let site = dir.find_by_id(&site.id).await.unwrap();
        assert_eq!(site.preview_edits_used, 5);
        assert_eq!(governor.policy().edits_remaining(&site), 0);
    }

    #[tokio::test]
    async fn test_reminder_window_selection() {
        let (dir, notifier, governor) = setup().await;
        let now = t0() + Duration::hours(30);

        let due = site_created_at(&dir, "due@example.com", now - Duration::minutes(19 * 60 + 30)).await;
        site_created_at(&dir, "young@example.com", now - Duration::hours(10)).await;
        site_created_at(&dir, "old@example.com", now - Duration::hours(22)).await;

        assert_eq!(governor.run_reminder_sweep(now).await.unwrap(), 1);
        assert_eq!(*notifier.reminders.lock().unwrap(), vec!["due@example.com".to_string()]);

        let due = dir.find_by_id(&due.id).await.unwrap();
        assert_eq!(due.reminder_sent_at, Some(now));

        // Retried sweep sends nothing new
        assert_eq!(governor.run_reminder_sweep(now).await.unwrap(), 0);
        assert_eq!(notifier.reminders.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_sweeps_send_one_reminder() {
        let (dir, notifier, governor) = setup().await;
        let now = t0() + Duration::hours(30);
        site_created_at(&dir, "due@example.com", now - Duration::minutes(19 * 60 + 15)).await;

        let (a, b) = tokio::join!(
            governor.run_reminder_sweep(now),
            governor.run_reminder_sweep(now)
        );

        assert_eq!(a.unwrap() + b.unwrap(), 1);
        assert_eq!(notifier.reminders.lock().unwrap().len(), 1);
    }
}
