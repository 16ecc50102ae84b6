//! Sitehost - multi-tenant hosting for generated websites
//!
//! Serves each paid site under its own subdomain of the primary domain and
//! carries sites from a free 24-hour preview through claim, payment and
//! subscription changes.

pub mod account;
pub mod api;
pub mod billing;
pub mod claim;
pub mod config;
pub mod context;
pub mod db;
pub mod directory;
pub mod error;
pub mod jobs;
pub mod mailer;
pub mod metrics;
pub mod preview;
pub mod rate_limit;
pub mod resolver;
pub mod server;
pub mod validation;
