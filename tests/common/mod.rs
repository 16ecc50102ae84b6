//! Common test utilities: an in-memory server with fake billing and mail.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use chrono::Utc;
use serde_json::{json, Value};
use sitehost::billing::{
    signature_header, BillingProvider, CheckoutParams, CheckoutSession,
};
use sitehost::config::ServerConfig;
use sitehost::context::AppContext;
use sitehost::directory::{FinalizeClaim, NewSite, PlanTier};
use sitehost::error::{SiteError, SiteResult};
use sitehost::mailer::Notifier;
use sitehost::server::build_router;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

pub const PRIMARY_DOMAIN: &str = "example.site";
pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// Billing provider that records checkouts instead of calling out.
#[derive(Default)]
#[allow(dead_code)]
pub struct FakeProvider {
    pub checkouts: Mutex<Vec<CheckoutParams>>,
    pub portal_requests: Mutex<Vec<String>>,
}

#[async_trait]
impl BillingProvider for FakeProvider {
    async fn find_or_create_customer(&self, email: &str, _phone: Option<&str>) -> SiteResult<String> {
        Ok(format!("cus_{}", email.replace(['@', '.'], "_")))
    }

    async fn create_checkout_session(&self, params: &CheckoutParams) -> SiteResult<CheckoutSession> {
        let mut checkouts = self.checkouts.lock().unwrap();
        checkouts.push(params.clone());
        let n = checkouts.len();
        Ok(CheckoutSession {
            id: format!("cs_test_{}", n),
            url: format!("https://checkout.test/c/{}", n),
        })
    }

    async fn create_portal_session(&self, customer_id: &str, _return_url: &str) -> SiteResult<String> {
        self.portal_requests
            .lock()
            .unwrap()
            .push(customer_id.to_string());
        Ok(format!("https://billing.test/p/{}", customer_id))
    }
}

/// Notifier that remembers what it was asked to send.
#[derive(Default)]
#[allow(dead_code)]
pub struct RecordingNotifier {
    pub confirmations: Mutex<Vec<String>>,
    pub reminders: Mutex<Vec<String>>,
    pub fail: bool,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_claim_confirmation(&self, to: &str, _name: &str, site_url: &str) -> SiteResult<()> {
        if self.fail {
            return Err(SiteError::Internal("smtp down".to_string()));
        }
        self.confirmations
            .lock()
            .unwrap()
            .push(format!("{} {}", to, site_url));
        Ok(())
    }

    async fn send_preview_reminder(&self, to: &str, _name: &str, _claim_url: &str) -> SiteResult<()> {
        self.reminders.lock().unwrap().push(to.to_string());
        Ok(())
    }
}

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub ctx: AppContext,
    pub provider: Arc<FakeProvider>,
    pub notifier: Arc<RecordingNotifier>,
}

#[allow(dead_code)]
impl TestServer {
    pub async fn new() -> Self {
        Self::with_notifier(RecordingNotifier::default()).await
    }

    pub async fn with_notifier(notifier: RecordingNotifier) -> Self {
        Self::build(ServerConfig::for_testing(PRIMARY_DOMAIN), notifier).await
    }

    pub async fn with_config(config: ServerConfig) -> Self {
        Self::build(config, RecordingNotifier::default()).await
    }

    async fn build(config: ServerConfig, notifier: RecordingNotifier) -> Self {
        let provider = Arc::new(FakeProvider::default());
        let notifier = Arc::new(notifier);

        let ctx = AppContext::for_testing(config, provider.clone(), notifier.clone())
        .await
        .expect("Failed to create test context");

        let router = build_router(ctx.clone());

        Self {
            router,
            ctx,
            provider,
            notifier,
        }
    }

    pub async fn preview_site(&self, owner_email: Option<&str>) -> String {
        self.ctx
            .directory
            .create_preview(NewSite {
                business_name: "Acme Bakery".to_string(),
                content_ref: "content/acme".to_string(),
                owner_email: owner_email.map(str::to_string),
            })
            .await
            .expect("Failed to create preview")
            .id
    }

    /// A site that is paid, active and finalized on `subdomain`.
    pub async fn paid_site(&self, subdomain: &str) -> String {
        let id = self.preview_site(None).await;
        self.ctx
            .directory
            .finalize_claim(&FinalizeClaim {
                site_id: id.clone(),
                subdomain: subdomain.to_string(),
                customer_id: format!("cus_{}", subdomain),
                subscription_id: Some(format!("sub_{}", subdomain)),
                plan_tier: Some(PlanTier::Basic),
                owner_email: None,
                owner_user_id: None,
                event_at: 1,
            })
            .await
            .expect("Failed to finalize");
        id
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();

        let status = response.status();
        let headers = response.headers().clone();
        let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();

        let json: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        (status, headers, json)
    }

    pub async fn get(&self, host: &str, uri: &str) -> (StatusCode, HeaderMap, Value) {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .header("host", host)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    pub async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, HeaderMap, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("host", PRIMARY_DOMAIN)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        self.send(request).await
    }

    /// POST a webhook payload signed with the test secret.
    pub async fn deliver(&self, event: &Value) -> (StatusCode, Value) {
        let payload = serde_json::to_vec(event).unwrap();
        let header = signature_header(&payload, WEBHOOK_SECRET, Utc::now().timestamp());
        self.deliver_raw(payload, Some(header)).await
    }

    pub async fn deliver_raw(&self, payload: Vec<u8>, signature: Option<String>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhooks/billing")
            .header("host", PRIMARY_DOMAIN)
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("stripe-signature", signature);
        }

        let (status, _, body) = self.send(builder.body(Body::from(payload)).unwrap()).await;
        (status, body)
    }
}

/// `Location` header of a redirect.
#[allow(dead_code)]
pub fn location(headers: &HeaderMap) -> Option<String> {
    headers
        .get("location")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// A signed-shape `checkout.session.completed` event.
#[allow(dead_code)]
pub fn checkout_completed(
    event_id: &str,
    session_id: &str,
    metadata: Value,
    created: i64,
) -> Value {
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
}

#[allow(dead_code)]
pub fn subscription_event(event_id: &str, event_type: &str, subscription_id: &str, status: &str, created: i64) -> Value {
    json!({
        "id": event_id,
        "type": event_type,
        "created": created,
        "data": { "object": { "id": subscription_id, "status": status } }
    })
}
