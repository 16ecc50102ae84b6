/// Billing provider integration
///
/// The provider is reached through the [`BillingProvider`] trait so the
/// claim flow can be exercised without network access. Asynchronous
/// provider events come back through the webhook and are applied by the
/// [`PaymentReconciler`].

mod events;
mod ledger;
mod reconciler;
mod stripe;
mod webhook;

pub use events::{
    map_subscription_status, BillingEvent, BillingEventKind, CheckoutCompleted, EventEnvelope,
    InvoicePaymentFailed, SubscriptionChange,
};
pub use ledger::{EventLedger, UnresolvedClaim};
pub use reconciler::{PaymentReconciler, ReconcileOutcome};
pub use stripe::StripeClient;
pub use webhook::{signature_header, verify_signature};

use crate::{
    directory::PlanTier,
    error::{SiteError, SiteResult},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Claim details carried through the provider's checkout session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimMetadata {
    pub site_id: String,
    pub subdomain: String,
    pub email: String,
    pub phone: Option<String>,
    pub plan_tier: PlanTier,
    /// Raw pending-account token, present when the claimant chose a password
    pub account_token: Option<String>,
}

impl ClaimMetadata {
    /// Flatten into the provider's string-to-string metadata map
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("site_id", self.site_id.clone()),
            ("subdomain", self.subdomain.clone()),
            ("email", self.email.clone()),
            ("plan_tier", self.plan_tier.as_str().to_string()),
        ];
        if let Some(phone) = &self.phone {
            pairs.push(("phone", phone.clone()));
        }
        if let Some(token) = &self.account_token {
            pairs.push(("account_token", token.clone()));
        }
        pairs
    }

    /// Rebuild from the provider's metadata map
    pub fn from_map(map: &HashMap<String, String>) -> SiteResult<Self> {
        let required = |key: &str| -> SiteResult<String> {
            map.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| SiteError::Validation(format!("checkout metadata missing '{}'", key)))
        };
        let optional = |key: &str| -> Option<String> {
            map.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Ok(ClaimMetadata {
            site_id: required("site_id")?,
            subdomain: required("subdomain")?.to_ascii_lowercase(),
            email: required("email")?.to_lowercase(),
            phone: optional("phone"),
            plan_tier: required("plan_tier")?.parse()?,
            account_token: optional("account_token"),
        })
    }
}

/// Parameters for a subscription checkout
#[derive(Debug, Clone)]
pub struct CheckoutParams {
    pub customer_id: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: ClaimMetadata,
}

/// Checkout session created by the provider
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

/// Outbound billing operations
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Reuse the customer registered under `email`, or create one; updates the phone if given
    async fn find_or_create_customer(&self, email: &str, phone: Option<&str>) -> SiteResult<String>;

    /// Start a hosted subscription checkout
    async fn create_checkout_session(&self, params: &CheckoutParams) -> SiteResult<CheckoutSession>;

    /// Self-service billing portal URL for a customer
    async fn create_portal_session(&self, customer_id: &str, return_url: &str) -> SiteResult<String>;
}
