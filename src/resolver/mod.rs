/// Hostname resolution
///
/// Runs in front of every route. Primary-domain requests are gated on the
/// session cookie; tenant requests cost one directory lookup and are either
/// rewritten to the render route or redirected back to the primary domain.
/// Every failure path ends in a redirect.
use crate::{
    account::UserAccount,
    context::AppContext,
    error::SiteError,
    metrics,
};
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use std::{
    net::IpAddr,
    time::{Duration, Instant},
};

/// Name of the session cookie on the primary domain
pub const SESSION_COOKIE: &str = "session";

/// Internal prefix tenant requests are rewritten onto
pub const RENDER_PREFIX: &str = "/render";

/// Paths that require a session
pub const PROTECTED_PREFIXES: &[&str] = &["/dashboard", "/account", "/billing", "/sites"];

/// Pages an authenticated user is sent away from
pub const AUTH_ONLY_PAGES: &[&str] = &["/login", "/signup"];

/// Which part of the deployment a request is addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKind {
    Primary,
    Tenant(String),
    Unrecognized,
}

/// Classify a `Host` header value against the primary domain
///
/// Ports and a trailing dot are ignored, comparison is case-insensitive.
/// `localhost` and bare IP addresses count as primary so health checks and
/// internal callers reach the service directly.
pub fn classify_host(host: &str, primary_domain: &str) -> HostKind {
    let host = strip_port(host.trim())
        .trim_end_matches('.')
        .to_ascii_lowercase();
    let primary = primary_domain.trim().trim_end_matches('.').to_ascii_lowercase();

    if host.is_empty() || primary.is_empty() {
        return HostKind::Unrecognized;
    }

    if host == primary || host == "localhost" || host.parse::<IpAddr>().is_ok() {
        return HostKind::Primary;
    }

    match host
        .strip_suffix(primary.as_str())
        .and_then(|rest| rest.strip_suffix('.'))
    {
        Some(label) if !label.is_empty() && !label.contains('.') && label != "www" => {
            HostKind::Tenant(label.to_string())
        }
        _ => HostKind::Unrecognized,
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // bracketed IPv6 literal
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) && !name.contains(':') => {
            name
        }
        _ => host,
    }
}

/// Host the client addressed, from the `Host` header or an absolute URI
pub fn request_host(req: &Request) -> String {
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
        .unwrap_or_default()
}

fn path_matches(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

pub fn is_protected(path: &str) -> bool {
    PROTECTED_PREFIXES.iter().any(|p| path_matches(path, p))
}

/// `/login?redirect=<path and query>` for an unauthenticated visitor
pub fn login_redirect(uri: &Uri) -> String {
    let intended = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    format!("/login?redirect={}", urlencoding::encode(intended))
}

/// Tenant request rewritten onto the render route, query preserved verbatim
pub fn render_uri(site_id: &str, uri: &Uri) -> Option<Uri> {
    let path = match uri.path() {
        "" | "/" => String::new(),
        path => path.to_string(),
    };

    let target = match uri.query() {
        Some(query) => format!("{}/{}{}?{}", RENDER_PREFIX, site_id, path, query),
        None => format!("{}/{}{}", RENDER_PREFIX, site_id, path),
    };

    target.parse().ok()
}

/// Plain 302 to `location`
pub fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

/// Account behind the request's session cookie, if any
///
/// Lookup errors count as "not signed in".
pub async fn session_user(ctx: &AppContext, headers: &HeaderMap) -> Option<UserAccount> {
    let jar = CookieJar::from_headers(headers);
    let token = jar.get(SESSION_COOKIE)?.value().to_string();

    match ctx.accounts.validate_session(&token).await {
        Ok(user) => Some(user),
        Err(SiteError::Authentication(_)) => None,
        Err(e) => {
            tracing::warn!(error = %e, "Session lookup failed");
            None
        }
    }
}

/// Host-based routing middleware
pub async fn route_by_host(State(ctx): State<AppContext>, req: Request, next: Next) -> Response {
    let host = request_host(&req);

    match classify_host(&host, &ctx.config.service.primary_domain) {
        HostKind::Primary => gate_primary(&ctx, req, next).await,
        HostKind::Tenant(label) => resolve_tenant(&ctx, &label, req, next).await,
        HostKind::Unrecognized => {
            tracing::debug!(host = %host, "Unrecognized host");
            metrics::record_resolver_outcome("unrecognized");
            found(&home_url(&ctx))
        }
    }
}

async fn gate_primary(ctx: &AppContext, mut req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();

    if path_matches(&path, RENDER_PREFIX) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let protected = is_protected(&path);
    let auth_only = AUTH_ONLY_PAGES.iter().any(|p| path_matches(&path, p));

    if protected || auth_only {
        let user = session_user(ctx, req.headers()).await;

        match user {
            None if protected => {
                metrics::record_resolver_outcome("login_required");
                return found(&login_redirect(req.uri()));
            }
            Some(_) if auth_only => {
                return found("/dashboard");
            }
            Some(user) => {
                req.extensions_mut().insert(user);
            }
            None => {}
        }
    }

    next.run(req).await
}

async fn resolve_tenant(ctx: &AppContext, label: &str, mut req: Request, next: Next) -> Response {
    let started = Instant::now();
    let timeout = Duration::from_millis(ctx.config.service.lookup_timeout_ms);
    let lookup = tokio::time::timeout(timeout, ctx.directory.find_by_host(label)).await;
    metrics::record_lookup_duration(started.elapsed().as_secs_f64());

    let site = match lookup {
        Ok(Ok(site)) => site,
        Ok(Err(SiteError::NotFound(_))) => {
            metrics::record_resolver_outcome("not_found");
            return found(&home_url(ctx));
        }
        Ok(Err(e)) => {
            tracing::warn!(label = %label, error = %e, "Tenant lookup failed");
            metrics::record_resolver_outcome("lookup_error");
            return found(&home_url(ctx));
        }
        Err(_) => {
            tracing::warn!(label = %label, timeout_ms = timeout.as_millis() as u64, "Tenant lookup timed out");
            metrics::record_resolver_outcome("lookup_timeout");
            return found(&home_url(ctx));
        }
    };

    if !site.is_servable() {
        metrics::record_resolver_outcome("expired");
        return found(&format!(
            "{}/site-expired?siteId={}",
            public_url(ctx),
            urlencoding::encode(&site.site_id)
        ));
    }

    let Some(uri) = render_uri(&site.site_id, req.uri()) else {
        metrics::record_resolver_outcome("lookup_error");
        return found(&home_url(ctx));
    };

    metrics::record_resolver_outcome("rewritten");
    *req.uri_mut() = uri;
    next.run(req).await
}

fn public_url(ctx: &AppContext) -> &str {
    ctx.config.service.public_url.trim_end_matches('/')
}

fn home_url(ctx: &AppContext) -> String {
    format!("{}/", public_url(ctx))
}
