/// Stripe REST client
///
/// Form-encoded requests against the v1 API with a bounded timeout. Any
/// transport failure or non-success status becomes
/// `SiteError::ExternalProvider`.
use super::{BillingProvider, CheckoutParams, CheckoutSession};
use crate::{
    config::BillingConfig,
    error::{SiteError, SiteResult},
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

#[derive(Deserialize)]
struct Customer {
    id: String,
}

#[derive(Deserialize)]
struct CustomerList {
    data: Vec<Customer>,
}

#[derive(Deserialize)]
struct PortalSession {
    url: String,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
}

pub struct StripeClient {
    http_client: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl StripeClient {
    pub fn new(config: &BillingConfig) -> SiteResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SiteError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> SiteResult<T> {
        let response = self
            .http_client
            .get(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.api_key)
            .query(query)
            .send()
            .await
            .map_err(|e| SiteError::ExternalProvider(format!("GET {} failed: {}", path, e)))?;

        decode_response(path, response).await
    }

    /// Authenticated POST with a form body; bracketed keys are escaped
    fn form_request<K, V>(&self, path: &str, form: &[(K, V)]) -> reqwest::RequestBuilder
    where
        K: Serialize,
        V: Serialize,
    {
        self.http_client
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.api_key)
            .form(form)
    }

    async fn post_form<T, K, V>(&self, path: &str, form: &[(K, V)]) -> SiteResult<T>
    where
        T: DeserializeOwned,
        K: Serialize,
        V: Serialize,
    {
        let response = self
            .form_request(path, form)
            .send()
            .await
            .map_err(|e| SiteError::ExternalProvider(format!("POST {} failed: {}", path, e)))?;

        decode_response(path, response).await
    }
}

async fn decode_response<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> SiteResult<T> {
    let status = response.status();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .ok()
            .and_then(|b| b.error.message)
            .unwrap_or(body);

        tracing::warn!(path = %path, status = %status, "Billing provider request rejected");
        return Err(SiteError::ExternalProvider(format!(
            "{} returned {}: {}",
            path, status, message
        )));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| SiteError::ExternalProvider(format!("Invalid response from {}: {}", path, e)))
}

/// Form fields for a subscription checkout session
fn checkout_form(params: &CheckoutParams) -> Vec<(String, String)> {
    let mut form = vec![
        ("mode".to_string(), "subscription".to_string()),
        ("customer".to_string(), params.customer_id.clone()),
        ("line_items[0][price]".to_string(), params.price_id.clone()),
        ("line_items[0][quantity]".to_string(), "1".to_string()),
        ("success_url".to_string(), params.success_url.clone()),
        ("cancel_url".to_string(), params.cancel_url.clone()),
        ("client_reference_id".to_string(), params.metadata.site_id.clone()),
        (
            "subscription_data[metadata][site_id]".to_string(),
            params.metadata.site_id.clone(),
        ),
    ];

    for (key, value) in params.metadata.to_pairs() {
        form.push((format!("metadata[{}]", key), value));
    }

    form
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn find_or_create_customer(&self, email: &str, phone: Option<&str>) -> SiteResult<String> {
        let existing: CustomerList = self
            .get("/v1/customers", &[("email", email), ("limit", "1")])
            .await?;

        if let Some(customer) = existing.data.into_iter().next() {
            if let Some(phone) = phone {
                let path = format!("/v1/customers/{}", customer.id);
                let _: Customer = self.post_form(&path, &[("phone", phone)]).await?;
            }
            tracing::debug!(customer_id = %customer.id, "Reusing billing customer");
            return Ok(customer.id);
        }

        let mut form = vec![("email", email)];
        if let Some(phone) = phone {
            form.push(("phone", phone));
        }

        let customer: Customer = self.post_form("/v1/customers", &form).await?;
        tracing::info!(customer_id = %customer.id, "Created billing customer");

        Ok(customer.id)
    }

    async fn create_checkout_session(&self, params: &CheckoutParams) -> SiteResult<CheckoutSession> {
        let form = checkout_form(params);

        let session: CheckoutSession = self.post_form("/v1/checkout/sessions", &form).await?;
        tracing::info!(
            session_id = %session.id,
            site_id = %params.metadata.site_id,
            "Created checkout session"
        );

        Ok(session)
    }

    async fn create_portal_session(&self, customer_id: &str, return_url: &str) -> SiteResult<String> {
        let session: PortalSession = self
            .post_form(
                "/v1/billing_portal/sessions",
                &[("customer", customer_id), ("return_url", return_url)],
            )
            .await?;

        Ok(session.url)
    }
}
