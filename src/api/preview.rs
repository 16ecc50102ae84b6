/// Preview, expiry and tenant render endpoints
use crate::{
    context::AppContext,
    directory::{PaymentStatus, SubscriptionStatus},
    error::{SiteError, SiteResult},
    preview::{EditOutcome, PreviewState},
};
use axum::{
    extract::{Path, Query, RawQuery, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/preview/:site_id", get(preview_state))
        .route("/preview/:site_id/edits", post(record_edit))
        .route("/site-expired", get(site_expired))
        .route("/render/:site_id", get(render_root))
        .route("/render/:site_id/*path", get(render_path))
}

async fn preview_state(
    State(ctx): State<AppContext>,
    Path(site_id): Path<String>,
) -> SiteResult<Json<PreviewState>> {
    Ok(Json(ctx.previews.state(&site_id, Utc::now()).await?))
}

async fn record_edit(
    State(ctx): State<AppContext>,
    Path(site_id): Path<String>,
) -> SiteResult<Json<EditOutcome>> {
    Ok(Json(ctx.previews.record_edit(&site_id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExpiredParams {
    site_id: String,
}

/// Informational view for a site that exists but is not being served
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExpiredView {
    site_id: String,
    business_name: String,
    payment_status: PaymentStatus,
    subscription_status: SubscriptionStatus,
    /// Where the owner can pick the site back up
    claim_url: String,
}

async fn site_expired(
    State(ctx): State<AppContext>,
    Query(params): Query<ExpiredParams>,
) -> SiteResult<Json<ExpiredView>> {
    let site = ctx.directory.find_by_id(&params.site_id).await?;
    let public_url = ctx.config.service.public_url.trim_end_matches('/');

    Ok(Json(ExpiredView {
        claim_url: format!("{}/preview/{}", public_url, site.id),
        site_id: site.id,
        business_name: site.business_name,
        payment_status: site.payment_status,
        subscription_status: site.subscription_status,
    }))
}

/// What the front-end renderer needs to draw a tenant page
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderTarget {
    pub site_id: String,
    pub business_name: String,
    pub content_ref: String,
    pub path: String,
    pub query: Option<String>,
}

async fn render_root(
    State(ctx): State<AppContext>,
    Path(site_id): Path<String>,
    RawQuery(query): RawQuery,
) -> SiteResult<Json<RenderTarget>> {
    render(&ctx, site_id, "/".to_string(), query).await
}

async fn render_path(
    State(ctx): State<AppContext>,
    Path((site_id, path)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> SiteResult<Json<RenderTarget>> {
    render(&ctx, site_id, format!("/{}", path), query).await
}

async fn render(
    ctx: &AppContext,
    site_id: String,
    path: String,
    query: Option<String>,
) -> SiteResult<Json<RenderTarget>> {
    let site = ctx.directory.find_by_id(&site_id).await?;

    // the resolver already checked, but the record may have changed since
    if !site.is_servable() {
        return Err(SiteError::NotFound(format!("Site {} is not being served", site_id)));
    }

    Ok(Json(RenderTarget {
        site_id: site.id,
        business_name: site.business_name,
        content_ref: site.content_ref,
        path,
        query,
    }))
}
