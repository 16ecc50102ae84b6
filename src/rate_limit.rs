/// Rate limiting for the unauthenticated write endpoints
use crate::{
    config::RateLimitConfig,
    error::{SiteError, SiteResult},
    resolver::{classify_host, request_host, HostKind},
};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use std::{num::NonZeroU32, sync::Arc, time::Duration};

type DirectLimiter = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Which limiter a request is counted against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitClass {
    Claim,
    Login,
    Webhook,
}

impl LimitClass {
    /// Limited endpoints by path; everything else is unmetered
    pub fn for_path(path: &str) -> Option<Self> {
        match path {
            "/claim" => Some(LimitClass::Claim),
            "/auth/login" => Some(LimitClass::Login),
            "/webhooks/billing" => Some(LimitClass::Webhook),
            _ => None,
        }
    }

    /// Limited endpoints as addressed on the primary domain
    ///
    /// Tenant hosts serve site pages at every path, so `acme.<domain>/claim`
    /// never reaches the claim endpoint and is not counted.
    pub fn for_request(host: &str, path: &str, primary_domain: &str) -> Option<Self> {
        match classify_host(host, primary_domain) {
            HostKind::Primary => Self::for_path(path),
            HostKind::Tenant(_) | HostKind::Unrecognized => None,
        }
    }
}

/// Rate limiter manager
#[derive(Clone)]
pub struct RateLimiter {
    enabled: bool,
    claims: Arc<DirectLimiter>,
    logins: Arc<DirectLimiter>,
    webhooks: Arc<DirectLimiter>,
}

fn non_zero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let claim_quota = Quota::per_minute(non_zero(config.claims_per_minute));
        let login_quota = Quota::per_minute(non_zero(config.logins_per_minute));
        // provider retries arrive in bursts after an outage
        let webhook_quota = Quota::per_second(non_zero(config.webhooks_per_second))
            .allow_burst(non_zero(config.webhooks_per_second.saturating_mul(4)));

        Self {
            enabled: config.enabled,
            claims: Arc::new(GovernorLimiter::direct(claim_quota)),
            logins: Arc::new(GovernorLimiter::direct(login_quota)),
            webhooks: Arc::new(GovernorLimiter::direct(webhook_quota)),
        }
    }

    pub fn check(&self, class: LimitClass) -> SiteResult<()> {
        if !self.enabled {
            return Ok(());
        }

        let (limiter, retry_after) = match class {
            LimitClass::Claim => (&self.claims, Duration::from_secs(60)),
            LimitClass::Login => (&self.logins, Duration::from_secs(60)),
            LimitClass::Webhook => (&self.webhooks, Duration::from_secs(1)),
        };

        limiter
            .check()
            .map_err(|_| SiteError::RateLimitExceeded { retry_after })
    }
}

/// Rate limiting middleware
pub async fn rate_limit_middleware(
    State(ctx): State<crate::context::AppContext>,
    request: Request,
    next: Next,
) -> Response {
    let class = LimitClass::for_request(
        &request_host(&request),
        request.uri().path(),
        &ctx.config.service.primary_domain,
    );

    if let Some(class) = class {
        if let Err(e) = ctx.rate_limiter.check(class) {
            tracing::debug!(class = ?class, "Rate limit exceeded");
            return e.into_response();
        }
    }

    next.run(request).await
}
