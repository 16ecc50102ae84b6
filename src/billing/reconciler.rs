/// Payment reconciliation
///
/// Applies verified provider events to the site directory. Every handler
/// is safe to run more than once: the ledger short-circuits replays and
/// the directory mutations are themselves idempotent and ordered by the
/// provider event timestamp.
use super::{
    events::{BillingEvent, BillingEventKind, CheckoutCompleted, EventEnvelope, SubscriptionChange},
    ledger::{EventLedger, UnresolvedClaim},
    map_subscription_status, verify_signature,
};
use crate::{
    account::{AccountManager, PendingAccountStore},
    directory::{FinalizeClaim, SiteDirectory, SubscriptionStatus},
    error::{SiteError, SiteResult},
    mailer::Notifier,
    metrics,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::{sync::Arc, time::Duration};

const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(30);

/// How long an unfinished ledger claim blocks redeliveries of the same event
const CLAIM_LEASE_SECS: i64 = 300;

/// What happened to an accepted event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    /// Already in the ledger
    Duplicate,
    /// Event type or state with no local effect
    Ignored,
    /// Older than the last event applied to the subscription
    Stale,
    /// No site carries the referenced subscription or site id
    Unlinked,
    /// Paid claim whose subdomain is held by another site
    Conflict,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Applied => "applied",
            ReconcileOutcome::Duplicate => "duplicate",
            ReconcileOutcome::Ignored => "ignored",
            ReconcileOutcome::Stale => "stale",
            ReconcileOutcome::Unlinked => "unlinked",
            ReconcileOutcome::Conflict => "conflict",
        }
    }
}

pub struct PaymentReconciler {
    directory: Arc<SiteDirectory>,
    pending_accounts: Arc<PendingAccountStore>,
    accounts: Arc<AccountManager>,
    ledger: EventLedger,
    notifier: Arc<dyn Notifier>,
    webhook_secret: String,
    tolerance_secs: i64,
    primary_domain: String,
}

impl PaymentReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: Arc<SiteDirectory>,
        pending_accounts: Arc<PendingAccountStore>,
        accounts: Arc<AccountManager>,
        ledger: EventLedger,
        notifier: Arc<dyn Notifier>,
        webhook_secret: String,
        tolerance_secs: i64,
        primary_domain: String,
    ) -> Self {
        Self {
            directory,
            pending_accounts,
            accounts,
            ledger,
            notifier,
            webhook_secret,
            tolerance_secs,
            primary_domain,
        }
    }

    pub fn ledger(&self) -> &EventLedger {
        &self.ledger
    }

    /// Verify, decode and apply a raw webhook delivery
    ///
    /// Signature failures are the only client error. A signed payload that
    /// cannot be decoded will never succeed on retry, so it is logged and
    /// acknowledged.
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> SiteResult<ReconcileOutcome> {
        let signature = signature
            .ok_or_else(|| SiteError::Signature("missing signature header".to_string()))?;

        verify_signature(
            payload,
            signature,
            &self.webhook_secret,
            Utc::now().timestamp(),
            self.tolerance_secs,
        )?;

        let event = match BillingEvent::from_payload(payload) {
            Ok(event) => event,
            Err(e) => {
                let envelope = EventEnvelope::peek(payload);

                if envelope.is_checkout_completed() {
                    tracing::error!(
                        event_id = ?envelope.id,
                        session_id = ?envelope.object_id,
                        error = %e,
                        "Reconciliation gap: paid checkout could not be decoded"
                    );
                    metrics::record_reconciliation_gap("undecodable_checkout");
                } else {
                    tracing::error!(
                        event_id = ?envelope.id,
                        event_type = ?envelope.event_type,
                        error = %e,
                        "Signed billing event could not be decoded"
                    );
                }
                metrics::record_billing_event("undecodable", "ignored");
                return Ok(ReconcileOutcome::Ignored);
            }
        };

        self.process(event).await
    }

    /// Apply a decoded event exactly once
    ///
    /// The ledger claim is taken before any handler runs, so concurrent
    /// deliveries of one event cannot both apply it. A failed handler
    /// releases the claim and the provider's retry runs it again.
    pub async fn process(&self, event: BillingEvent) -> SiteResult<ReconcileOutcome> {
        let lease = ChronoDuration::seconds(CLAIM_LEASE_SECS);

        if !self.ledger.claim(&event.id, &event.event_type, lease).await? {
            tracing::debug!(event_id = %event.id, "Billing event already processed or in flight");
            metrics::record_billing_event(&event.event_type, "duplicate");
            return Ok(ReconcileOutcome::Duplicate);
        }

        let result = match &event.kind {
            BillingEventKind::CheckoutCompleted(checkout) => {
                self.on_checkout_completed(&event, checkout).await
            }
            BillingEventKind::SubscriptionUpdated(change) => {
                self.on_subscription_updated(&event, change).await
            }
            BillingEventKind::SubscriptionDeleted(change) => {
                self.apply_status(&change.subscription_id, SubscriptionStatus::Cancelled, event.created)
                    .await
            }
            BillingEventKind::InvoicePaymentFailed(invoice) => match &invoice.subscription_id {
                Some(subscription_id) => {
                    self.apply_status(subscription_id, SubscriptionStatus::PastDue, event.created)
                        .await
                }
                None => {
                    tracing::debug!(invoice_id = %invoice.invoice_id, "Failed invoice has no subscription");
                    Ok(ReconcileOutcome::Ignored)
                }
            },
            BillingEventKind::Ignored => Ok(ReconcileOutcome::Ignored),
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                metrics::record_billing_event(&event.event_type, "error");
                if let Err(release_err) = self.ledger.release(&event.id).await {
                    tracing::error!(
                        event_id = %event.id,
                        error = %release_err,
                        "Could not release billing event claim"
                    );
                }
                return Err(e);
            }
        };

        self.ledger.mark_processed(&event.id, &event.event_type).await?;
        metrics::record_billing_event(&event.event_type, outcome.as_str());

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            outcome = outcome.as_str(),
            "Processed billing event"
        );

        Ok(outcome)
    }

    async fn on_checkout_completed(
        &self,
        event: &BillingEvent,
        checkout: &CheckoutCompleted,
    ) -> SiteResult<ReconcileOutcome> {
        let metadata = &checkout.metadata;

        if !checkout.is_paid() {
            tracing::info!(
                session_id = %checkout.session_id,
                payment_status = %checkout.payment_status,
                "Checkout completed without payment"
            );
            return Ok(ReconcileOutcome::Ignored);
        }

        let Some(customer_id) = checkout.customer_id.clone() else {
            tracing::error!(
                session_id = %checkout.session_id,
                site_id = %metadata.site_id,
                "Reconciliation gap: paid checkout carries no customer"
            );
            metrics::record_reconciliation_gap("missing_customer");
            return Ok(ReconcileOutcome::Ignored);
        };

        let owner_user_id = self.materialize_owner(checkout).await?;

        let claim = FinalizeClaim {
            site_id: metadata.site_id.clone(),
            subdomain: metadata.subdomain.clone(),
            customer_id: customer_id.clone(),
            subscription_id: checkout.subscription_id.clone(),
            plan_tier: Some(metadata.plan_tier),
            owner_email: Some(metadata.email.clone()),
            owner_user_id,
            event_at: event.created,
        };

        match self.directory.finalize_claim(&claim).await {
            Ok(()) => {}
            Err(SiteError::Conflict(message)) => {
                tracing::error!(
                    session_id = %checkout.session_id,
                    site_id = %metadata.site_id,
                    subdomain = %metadata.subdomain,
                    customer_id = %customer_id,
                    "Unresolved subdomain conflict after payment: {}",
                    message
                );
                metrics::record_reconciliation_gap("subdomain_conflict");
                self.record_unresolved(checkout, &customer_id).await?;
                return Ok(ReconcileOutcome::Conflict);
            }
            Err(SiteError::NotFound(message)) => {
                tracing::error!(
                    session_id = %checkout.session_id,
                    site_id = %metadata.site_id,
                    "Paid checkout for a missing site: {}",
                    message
                );
                metrics::record_reconciliation_gap("site_missing");
                self.record_unresolved(checkout, &customer_id).await?;
                return Ok(ReconcileOutcome::Unlinked);
            }
            Err(e) => {
                tracing::error!(
                    session_id = %checkout.session_id,
                    site_id = %metadata.site_id,
                    error = %e,
                    "Reconciliation gap: payment captured but directory update failed"
                );
                metrics::record_reconciliation_gap("directory_write");
                return Err(e);
            }
        }

        self.send_confirmation(&metadata.site_id, &metadata.email, &metadata.subdomain)
            .await;

        Ok(ReconcileOutcome::Applied)
    }

    /// Turn the staged pending account into a user account
    ///
    /// A replay finds the pending row already consumed and falls back to
    /// the account created the first time.
    async fn materialize_owner(&self, checkout: &CheckoutCompleted) -> SiteResult<Option<String>> {
        let email = &checkout.metadata.email;

        if let Some(token) = &checkout.metadata.account_token {
            if let Some(credential) = self
                .pending_accounts
                .consume(token, email, Utc::now())
                .await?
            {
                let account = self
                    .accounts
                    .create_with_password_hash(&credential.email, &credential.password_hash)
                    .await?;
                tracing::info!(user_id = %account.id, "Created account from paid claim");
                return Ok(Some(account.id));
            }
        }

        Ok(self.accounts.find_by_email(email).await?.map(|a| a.id))
    }

    async fn record_unresolved(&self, checkout: &CheckoutCompleted, customer_id: &str) -> SiteResult<()> {
        self.ledger
            .record_unresolved_claim(&UnresolvedClaim {
                checkout_session_id: checkout.session_id.clone(),
                site_id: checkout.metadata.site_id.clone(),
                subdomain: checkout.metadata.subdomain.clone(),
                billing_customer_id: Some(customer_id.to_string()),
                billing_subscription_id: checkout.subscription_id.clone(),
                detected_at: Utc::now(),
            })
            .await
    }

    async fn send_confirmation(&self, site_id: &str, email: &str, subdomain: &str) {
        let business_name = match self.directory.find_by_id(site_id).await {
            Ok(site) => site.business_name,
            Err(e) => {
                tracing::warn!(site_id = %site_id, error = %e, "Skipping claim confirmation");
                return;
            }
        };
        let site_url = format!("https://{}.{}", subdomain, self.primary_domain);

        let send = self
            .notifier
            .send_claim_confirmation(email, &business_name, &site_url);

        match tokio::time::timeout(CONFIRMATION_TIMEOUT, send).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(site_id = %site_id, error = %e, "Claim confirmation failed");
            }
            Err(_) => {
                tracing::warn!(site_id = %site_id, "Claim confirmation timed out");
            }
        }
    }

    async fn on_subscription_updated(
        &self,
        event: &BillingEvent,
        change: &SubscriptionChange,
    ) -> SiteResult<ReconcileOutcome> {
        match map_subscription_status(&change.status) {
            Some(status) => {
                self.apply_status(&change.subscription_id, status, event.created)
                    .await
            }
            None => {
                tracing::debug!(
                    subscription_id = %change.subscription_id,
                    status = %change.status,
                    "Ignoring subscription status"
                );
                Ok(ReconcileOutcome::Ignored)
            }
        }
    }

    async fn apply_status(
        &self,
        subscription_id: &str,
        status: SubscriptionStatus,
        event_at: i64,
    ) -> SiteResult<ReconcileOutcome> {
        match self
            .directory
            .apply_subscription_status(subscription_id, status, event_at)
            .await
        {
            Ok(()) => Ok(ReconcileOutcome::Applied),
            Err(SiteError::Conflict(_)) => {
                tracing::info!(
                    subscription_id = %subscription_id,
                    status = %status,
                    "Skipping stale subscription event"
                );
                Ok(ReconcileOutcome::Stale)
            }
            Err(SiteError::NotFound(_)) => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    "Subscription event for unknown subscription"
                );
                Ok(ReconcileOutcome::Unlinked)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        billing::signature_header,
        db,
        directory::{NewSite, PaymentStatus},
    };
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::sync::Mutex;

    const SECRET: &str = "whsec_test_secret";

    #[derive(Default)]
    struct RecordingNotifier {
        confirmations: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_claim_confirmation(&self, to: &str, _: &str, site_url: &str) -> SiteResult<()> {
            self.confirmations
                .lock()
                .unwrap()
                .push(format!("{} {}", to, site_url));
            Ok(())
        }

        async fn send_preview_reminder(&self, _: &str, _: &str, _: &str) -> SiteResult<()> {
            Ok(())
        }
    }

    struct Harness {
        reconciler: PaymentReconciler,
        directory: Arc<SiteDirectory>,
        pending: Arc<PendingAccountStore>,
        accounts: Arc<AccountManager>,
        notifier: Arc<RecordingNotifier>,
    }

    async fn harness() -> Harness {
        let pool = db::connect_in_memory().await.unwrap();
        let directory = Arc::new(SiteDirectory::new(pool.clone()));
        let pending = Arc::new(PendingAccountStore::new(pool.clone()));
        let accounts = Arc::new(AccountManager::new(pool.clone(), ChronoDuration::days(30)));
        let notifier = Arc::new(RecordingNotifier::default());

        let reconciler = PaymentReconciler::new(
            directory.clone(),
            pending.clone(),
            accounts.clone(),
            EventLedger::new(pool),
            notifier.clone(),
            SECRET.to_string(),
            300,
            "example.site".to_string(),
        );

        Harness {
            reconciler,
            directory,
            pending,
            accounts,
            notifier,
        }
    }

    async fn preview(directory: &SiteDirectory) -> String {
        directory
            .create_preview(NewSite {
                business_name: "Acme Bakery".to_string(),
                content_ref: "content/acme".to_string(),
                owner_email: None,
            })
            .await
            .unwrap()
            .id
    }

    fn checkout_event(
        event_id: &str,
        session_id: &str,
        site_id: &str,
        subdomain: &str,
        token: Option<&str>,
        created: i64,
    ) -> Vec<u8> {
        let mut metadata = json!({
            "site_id": site_id,
            "subdomain": subdomain,
            "email": "owner@example.com",
            "plan_tier": "basic"
        });
        if let Some(token) = token {
            metadata["account_token"] = json!(token);
        }

        json!({
            "id": event_id,
            "type": "checkout.session.completed",
            "created": created,
            "data": { "object": {
                "id": session_id,
                "customer": format!("cus_{}", session_id),
                "subscription": format!("sub_{}", session_id),
                "payment_status": "paid",
                "metadata": metadata
            }}
        })
        .to_string()
        .into_bytes()
    }

    fn subscription_event(event_id: &str, event_type: &str, sub: &str, status: &str, created: i64) -> Vec<u8> {
        json!({
            "id": event_id,
            "type": event_type,
            "created": created,
            "data": { "object": { "id": sub, "status": status } }
        })
        .to_string()
        .into_bytes()
    }

    async fn deliver(reconciler: &PaymentReconciler, payload: &[u8]) -> SiteResult<ReconcileOutcome> {
        let header = signature_header(payload, SECRET, Utc::now().timestamp());
        reconciler.handle_webhook(payload, Some(&header)).await
    }

    #[tokio::test]
    async fn test_bad_signature_rejected_without_effect() {
        let h = harness().await;
        let site_id = preview(&h.directory).await;
        let payload = checkout_event("evt_1", "cs_1", &site_id, "acme", None, 100);

        let result = h.reconciler.handle_webhook(&payload, Some("t=1,v1=00")).await;
        assert!(matches!(result, Err(SiteError::Signature(_))));

        let result = h.reconciler.handle_webhook(&payload, None).await;
        assert!(matches!(result, Err(SiteError::Signature(_))));

        let site = h.directory.find_by_id(&site_id).await.unwrap();
        assert_eq!(site.payment_status, PaymentStatus::Unpaid);
        assert!(!h.reconciler.ledger().is_processed("evt_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_checkout_completed_publishes_site_and_creates_account() {
        let h = harness().await;
        let site_id = preview(&h.directory).await;
        let token = h
            .pending
            .create("owner@example.com", "hunter22!".to_string())
            .await
            .unwrap();

        let payload = checkout_event("evt_1", "cs_1", &site_id, "acme", Some(&token), 100);
        assert_eq!(deliver(&h.reconciler, &payload).await.unwrap(), ReconcileOutcome::Applied);

        let site = h.directory.find_by_id(&site_id).await.unwrap();
        assert_eq!(site.subdomain.as_deref(), Some("acme"));
        assert!(site.is_servable());

        let account = h.accounts.find_by_email("owner@example.com").await.unwrap().unwrap();
        assert_eq!(site.owner_user_id.as_deref(), Some(account.id.as_str()));

        let confirmations = h.notifier.confirmations.lock().unwrap().clone();
        assert_eq!(confirmations, vec!["owner@example.com https://acme.example.site".to_string()]);
    }

    #[tokio::test]
    async fn test_replayed_event_is_a_no_op() {
        let h = harness().await;
        let site_id = preview(&h.directory).await;
        let payload = checkout_event("evt_1", "cs_1", &site_id, "acme", None, 100);

        assert_eq!(deliver(&h.reconciler, &payload).await.unwrap(), ReconcileOutcome::Applied);
        let first = h.directory.find_by_id(&site_id).await.unwrap();

        for _ in 0..3 {
            assert_eq!(
                deliver(&h.reconciler, &payload).await.unwrap(),
                ReconcileOutcome::Duplicate
            );
        }

        let after = h.directory.find_by_id(&site_id).await.unwrap();
        assert_eq!(after.subdomain, first.subdomain);
        assert_eq!(after.billing_subscription_id, first.billing_subscription_id);
        assert_eq!(h.notifier.confirmations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_apply_once() {
        let h = harness().await;
        let site_id = preview(&h.directory).await;
        let payload = checkout_event("evt_1", "cs_1", &site_id, "acme", None, 100);

        let (a, b) = tokio::join!(
            deliver(&h.reconciler, &payload),
            deliver(&h.reconciler, &payload)
        );
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| o.as_str());

        assert_eq!(
            outcomes,
            vec![ReconcileOutcome::Applied, ReconcileOutcome::Duplicate]
        );
        assert_eq!(h.notifier.confirmations.lock().unwrap().len(), 1);
        assert!(h.reconciler.ledger().is_processed("evt_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_undecodable_checkout_counts_as_gap() {
        let h = harness().await;
        let site_id = preview(&h.directory).await;
        let payload = json!({
            "id": "evt_bad",
            "type": "checkout.session.completed",
            "created": 100,
            "data": { "object": {
                "id": "cs_bad",
                "customer": "cus_bad",
                "payment_status": "paid",
                "metadata": {
                    "site_id": site_id,
                    "subdomain": "acme",
                    "email": "owner@example.com",
                    "plan_tier": "gold"
                }
            }}
        })
        .to_string();
        let gaps = || {
            metrics::RECONCILIATION_GAPS_TOTAL
                .with_label_values(&["undecodable_checkout"])
                .get()
        };

        let before = gaps();
        assert_eq!(
            deliver(&h.reconciler, payload.as_bytes()).await.unwrap(),
            ReconcileOutcome::Ignored
        );
        assert!(gaps() > before);

        let site = h.directory.find_by_id(&site_id).await.unwrap();
        assert_eq!(site.subdomain, None);
        assert!(!h.reconciler.ledger().is_processed("evt_bad").await.unwrap());
    }

    #[tokio::test]
    async fn test_losing_claim_is_recorded_unresolved() {
        let h = harness().await;
        let x = preview(&h.directory).await;
        let y = preview(&h.directory).await;

        let first = checkout_event("evt_x", "cs_x", &x, "acme", None, 100);
        let second = checkout_event("evt_y", "cs_y", &y, "acme", None, 101);

        assert_eq!(deliver(&h.reconciler, &first).await.unwrap(), ReconcileOutcome::Applied);
        assert_eq!(deliver(&h.reconciler, &second).await.unwrap(), ReconcileOutcome::Conflict);

        assert_eq!(
            h.directory.find_by_id(&x).await.unwrap().subdomain.as_deref(),
            Some("acme")
        );
        assert_eq!(h.directory.find_by_id(&y).await.unwrap().subdomain, None);

        let unresolved = h.reconciler.ledger().unresolved_claims().await.unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].site_id, y);
        assert_eq!(unresolved[0].checkout_session_id, "cs_y");
    }

    #[tokio::test]
    async fn test_subscription_lifecycle_respects_event_order() {
        let h = harness().await;
        let site_id = preview(&h.directory).await;
        let checkout = checkout_event("evt_1", "cs_1", &site_id, "acme", None, 100);
        deliver(&h.reconciler, &checkout).await.unwrap();

        let past_due = subscription_event(
            "evt_2",
            "customer.subscription.updated",
            "sub_cs_1",
            "past_due",
            200,
        );
        assert_eq!(deliver(&h.reconciler, &past_due).await.unwrap(), ReconcileOutcome::Applied);
        assert!(!h.directory.find_by_id(&site_id).await.unwrap().is_servable());

        // an older "active" arriving late must not resurrect the site
        let late_active = subscription_event(
            "evt_3",
            "customer.subscription.updated",
            "sub_cs_1",
            "active",
            150,
        );
        assert_eq!(deliver(&h.reconciler, &late_active).await.unwrap(), ReconcileOutcome::Stale);

        let deleted = subscription_event(
            "evt_4",
            "customer.subscription.deleted",
            "sub_cs_1",
            "canceled",
            300,
        );
        assert_eq!(deliver(&h.reconciler, &deleted).await.unwrap(), ReconcileOutcome::Applied);

        let site = h.directory.find_by_id(&site_id).await.unwrap();
        assert_eq!(site.subscription_status, SubscriptionStatus::Cancelled);
        assert_eq!(site.payment_status, PaymentStatus::Unpaid);
        assert_eq!(site.billing_subscription_id, None);
        assert_eq!(site.subdomain.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn test_event_for_unknown_subscription_is_acknowledged() {
        let h = harness().await;
        let payload = subscription_event(
            "evt_1",
            "customer.subscription.updated",
            "sub_missing",
            "active",
            100,
        );

        assert_eq!(deliver(&h.reconciler, &payload).await.unwrap(), ReconcileOutcome::Unlinked);
        assert!(h.reconciler.ledger().is_processed("evt_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_unpaid_checkout_and_unknown_types_are_ignored() {
        let h = harness().await;
        let unknown = json!({
            "id": "evt_9",
            "type": "customer.created",
            "created": 1,
            "data": { "object": { "id": "cus_1" } }
        })
        .to_string();

        assert_eq!(
            deliver(&h.reconciler, unknown.as_bytes()).await.unwrap(),
            ReconcileOutcome::Ignored
        );
        assert_eq!(
            deliver(&h.reconciler, b"{\"not\":\"an event\"}").await.unwrap(),
            ReconcileOutcome::Ignored
        );
    }
}
