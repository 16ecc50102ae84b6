/// Endpoints for callers inside the deployment (edge proxy, generation step, operators)
use crate::{
    api::extract::{ApiJson, InternalRequest},
    billing::UnresolvedClaim,
    context::AppContext,
    directory::{NewSite, Site, SiteLookup},
    error::SiteResult,
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/internal/lookup-subdomain", get(lookup_subdomain))
        .route("/internal/sites", post(create_site))
        .route("/internal/unresolved-claims", get(unresolved_claims))
}

#[derive(Debug, Deserialize)]
struct LookupParams {
    subdomain: String,
}

/// Minimal tenant projection for a subdomain or slug
async fn lookup_subdomain(
    _internal: InternalRequest,
    State(ctx): State<AppContext>,
    Query(params): Query<LookupParams>,
) -> SiteResult<Json<SiteLookup>> {
    let label = params.subdomain.trim().to_ascii_lowercase();
    Ok(Json(ctx.directory.find_by_host(&label).await?))
}

/// Register a freshly generated preview
async fn create_site(
    _internal: InternalRequest,
    State(ctx): State<AppContext>,
    ApiJson(new): ApiJson<NewSite>,
) -> SiteResult<(StatusCode, Json<Site>)> {
    let site = ctx.directory.create_preview(new).await?;
    Ok((StatusCode::CREATED, Json(site)))
}

/// Paid checkouts that lost their subdomain and need manual follow-up
async fn unresolved_claims(
    _internal: InternalRequest,
    State(ctx): State<AppContext>,
) -> SiteResult<Json<Vec<UnresolvedClaim>>> {
    Ok(Json(ctx.reconciler.ledger().unresolved_claims().await?))
}
