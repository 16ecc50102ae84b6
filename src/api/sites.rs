/// Session and owner endpoints on the primary domain
use crate::{
    account::{LoginRequest, LoginResponse, UserAccount},
    api::extract::{ApiJson, CurrentUser},
    context::AppContext,
    directory::Site,
    error::{SiteError, SiteResult},
    resolver::SESSION_COOKIE,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use validator::Validate;

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/dashboard/sites", get(list_sites))
        .route("/sites/:site_id/slug", put(assign_slug))
        .route("/sites/:site_id", delete(delete_site))
}

fn session_cookie(ctx: &AppContext, value: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, value))
        .path("/")
        .http_only(true)
        .secure(ctx.config.authentication.secure_cookies)
        .same_site(SameSite::Lax)
        .build()
}

async fn login(
    State(ctx): State<AppContext>,
    jar: CookieJar,
    ApiJson(req): ApiJson<LoginRequest>,
) -> SiteResult<(CookieJar, Json<LoginResponse>)> {
    req.validate()?;

    let (account, token) = ctx.accounts.login(&req.email, &req.password).await?;
    tracing::info!(user_id = %account.id, "User signed in");

    Ok((
        jar.add(session_cookie(&ctx, token)),
        Json(LoginResponse {
            user_id: account.id,
            email: account.email,
        }),
    ))
}

async fn logout(State(ctx): State<AppContext>, jar: CookieJar) -> SiteResult<(CookieJar, StatusCode)> {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        ctx.accounts.delete_session(cookie.value()).await?;
    }

    Ok((
        jar.remove(session_cookie(&ctx, String::new())),
        StatusCode::NO_CONTENT,
    ))
}

async fn list_sites(
    CurrentUser(user): CurrentUser,
    State(ctx): State<AppContext>,
) -> SiteResult<Json<Vec<Site>>> {
    Ok(Json(ctx.directory.sites_for_owner(&user.id).await?))
}

#[derive(Debug, Deserialize)]
struct SlugRequest {
    slug: String,
}

#[derive(Debug, Serialize)]
struct SlugResponse {
    slug: String,
}

/// Load a site and check the caller owns it
///
/// Drafts have no owning account yet; they belong to whoever signs in with
/// the email the draft was generated for.
async fn owned_site(ctx: &AppContext, user: &UserAccount, site_id: &str) -> SiteResult<Site> {
    let site = ctx.directory.find_by_id(site_id).await?;

    let owns = match site.owner_user_id.as_deref() {
        Some(owner) => owner == user.id,
        None => site.owner_email.as_deref() == Some(user.email.as_str()),
    };

    if !owns {
        return Err(SiteError::Authorization("Not the owner of this site".to_string()));
    }

    Ok(site)
}

async fn assign_slug(
    CurrentUser(user): CurrentUser,
    State(ctx): State<AppContext>,
    Path(site_id): Path<String>,
    ApiJson(req): ApiJson<SlugRequest>,
) -> SiteResult<Json<SlugResponse>> {
    let site = owned_site(&ctx, &user, &site_id).await?;
    let slug = ctx.directory.assign_slug(&site.id, &req.slug).await?;

    tracing::info!(site_id = %site.id, slug = %slug, "Assigned slug");
    Ok(Json(SlugResponse { slug }))
}

/// Explicit removal of a never-claimed draft
async fn delete_site(
    CurrentUser(user): CurrentUser,
    State(ctx): State<AppContext>,
    Path(site_id): Path<String>,
) -> SiteResult<StatusCode> {
    let site = owned_site(&ctx, &user, &site_id).await?;
    ctx.directory.delete_draft(&site.id).await?;

    Ok(StatusCode::NO_CONTENT)
}
