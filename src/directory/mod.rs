/// Site directory
///
/// Persisted site records, the minimal routing projection and every
/// mutation other components may perform on a site.

mod models;
mod store;

pub use models::{
    EditAttempt, FinalizeClaim, NewSite, PaymentStatus, PlanTier, Site, SiteLookup, SiteStatus,
    SubscriptionStatus,
};
pub use store::SiteDirectory;
