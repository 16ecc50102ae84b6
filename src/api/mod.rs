/// API routes and handlers
pub mod claim;
pub mod extract;
pub mod health;
pub mod internal;
pub mod preview;
pub mod sites;

use crate::context::AppContext;
use axum::Router;

/// Build API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .merge(health::routes())
        .merge(internal::routes())
        .merge(claim::routes())
        .merge(preview::routes())
        .merge(sites::routes())
}
