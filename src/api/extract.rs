/// Request extractors shared by the handlers
use crate::{
    account::UserAccount,
    context::AppContext,
    error::SiteError,
    resolver,
};
use async_trait::async_trait;
use axum::{
    extract::{FromRequest, FromRequestParts, Request},
    http::request::Parts,
    Json,
};
use serde::de::DeserializeOwned;
use subtle::ConstantTimeEq;

/// Header internal callers use to prove they are inside the deployment
pub const INTERNAL_REQUEST_HEADER: &str = "x-internal-request";

/// Signed-in account, from the resolver or the session cookie
#[derive(Debug, Clone)]
pub struct CurrentUser(pub UserAccount);

#[async_trait]
impl FromRequestParts<AppContext> for CurrentUser {
    type Rejection = SiteError;

    async fn from_request_parts(parts: &mut Parts, ctx: &AppContext) -> Result<Self, Self::Rejection> {
        if let Some(user) = parts.extensions.get::<UserAccount>() {
            return Ok(CurrentUser(user.clone()));
        }

        resolver::session_user(ctx, &parts.headers)
            .await
            .map(CurrentUser)
            .ok_or_else(|| SiteError::Authentication("Sign in required".to_string()))
    }
}

/// Marker for endpoints restricted to internal callers
#[derive(Debug, Clone, Copy)]
pub struct InternalRequest;

#[async_trait]
impl FromRequestParts<AppContext> for InternalRequest {
    type Rejection = SiteError;

    async fn from_request_parts(parts: &mut Parts, ctx: &AppContext) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(INTERNAL_REQUEST_HEADER)
            .map(|v| v.as_bytes())
            .unwrap_or_default();
        let expected = ctx.config.authentication.internal_secret.as_bytes();

        if !expected.is_empty() && bool::from(presented.ct_eq(expected)) {
            Ok(InternalRequest)
        } else {
            tracing::warn!(path = %parts.uri.path(), "Rejected request without internal marker");
            Err(SiteError::Authorization("Internal endpoint".to_string()))
        }
    }
}

/// JSON request body whose rejections answer like every other error
///
/// A body that is not JSON, misses a field or carries an unknown enum value
/// is a `Validation` error (400 with `{error, message}`).
#[derive(Debug, Clone)]
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = SiteError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(ApiJson(value))
    }
}
