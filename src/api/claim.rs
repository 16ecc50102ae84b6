/// Claim and billing endpoints
use crate::{
    api::extract::{ApiJson, CurrentUser},
    claim::{ClaimRequest, ClaimResponse},
    context::AppContext,
    error::{ErrorResponse, SiteError, SiteResult},
};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

/// Provider signature header on webhook deliveries
pub const SIGNATURE_HEADER: &str = "stripe-signature";

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/claim", post(initiate_claim))
        .route("/webhooks/billing", post(billing_webhook))
        .route("/billing/portal", get(billing_portal))
}

async fn initiate_claim(
    State(ctx): State<AppContext>,
    ApiJson(req): ApiJson<ClaimRequest>,
) -> SiteResult<Json<ClaimResponse>> {
    Ok(Json(ctx.claims.initiate_claim(req).await?))
}

#[derive(Debug, Serialize)]
struct WebhookAck {
    received: bool,
    outcome: &'static str,
}

/// Billing provider webhook
///
/// 400 only for signature failures; anything else that fails is a
/// reconciliation gap and answered with 500 so the provider redelivers.
async fn billing_webhook(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    match ctx.reconciler.handle_webhook(&body, signature).await {
        Ok(outcome) => Json(WebhookAck {
            received: true,
            outcome: outcome.as_str(),
        })
        .into_response(),
        Err(e @ SiteError::Signature(_)) => {
            tracing::warn!(error = %e, "Rejected billing webhook");
            e.into_response()
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                retryable = e.is_retryable(),
                "Billing webhook processing failed"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "ReconciliationError".to_string(),
                    message: "Event not applied; retry later".to_string(),
                }),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortalParams {
    customer_id: String,
}

#[derive(Debug, Serialize)]
struct PortalResponse {
    url: String,
}

/// Self-service billing portal link for one of the caller's customers
async fn billing_portal(
    CurrentUser(user): CurrentUser,
    State(ctx): State<AppContext>,
    Query(params): Query<PortalParams>,
) -> SiteResult<Json<PortalResponse>> {
    if !ctx
        .directory
        .owner_has_customer(&user.id, &params.customer_id)
        .await?
    {
        return Err(SiteError::Authorization(
            "Billing customer does not belong to this account".to_string(),
        ));
    }

    let return_url = format!(
        "{}/dashboard",
        ctx.config.service.public_url.trim_end_matches('/')
    );
    let url = ctx
        .billing
        .create_portal_session(&params.customer_id, &return_url)
        .await?;

    Ok(Json(PortalResponse { url }))
}
