/// Typed billing events
///
/// Payloads are decoded once at the edge into a tagged union; everything
/// past this point matches on [`BillingEventKind`].
use super::ClaimMetadata;
use crate::{
    directory::SubscriptionStatus,
    error::{SiteError, SiteResult},
};
use serde::Deserialize;
use std::collections::HashMap;

/// A verified provider event
#[derive(Debug, Clone, PartialEq)]
pub struct BillingEvent {
    pub id: String,
    /// Provider creation time, unix seconds
    pub created: i64,
    pub event_type: String,
    pub kind: BillingEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BillingEventKind {
    CheckoutCompleted(CheckoutCompleted),
    SubscriptionUpdated(SubscriptionChange),
    SubscriptionDeleted(SubscriptionChange),
    InvoicePaymentFailed(InvoicePaymentFailed),
    /// Event types this service does not act on
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutCompleted {
    pub session_id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub payment_status: String,
    pub metadata: ClaimMetadata,
}

impl CheckoutCompleted {
    /// Money was actually captured (or none was due)
    pub fn is_paid(&self) -> bool {
        matches!(self.payment_status.as_str(), "paid" | "no_payment_required")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionChange {
    pub subscription_id: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvoicePaymentFailed {
    pub invoice_id: String,
    pub subscription_id: Option<String>,
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

#[derive(Deserialize)]
struct RawCheckoutSession {
    id: String,
    customer: Option<String>,
    subscription: Option<String>,
    payment_status: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
struct RawSubscription {
    id: String,
    status: String,
}

#[derive(Deserialize)]
struct RawInvoice {
    id: String,
    subscription: Option<String>,
}

impl BillingEvent {
    /// Decode a webhook body
    pub fn from_payload(payload: &[u8]) -> SiteResult<Self> {
        let raw: RawEvent = serde_json::from_slice(payload)
            .map_err(|e| SiteError::Validation(format!("Malformed billing event: {}", e)))?;

        let kind = match raw.event_type.as_str() {
            CHECKOUT_COMPLETED => {
                let session: RawCheckoutSession = decode_object(raw.data.object)?;
                BillingEventKind::CheckoutCompleted(CheckoutCompleted {
                    metadata: ClaimMetadata::from_map(&session.metadata)?,
                    session_id: session.id,
                    customer_id: session.customer,
                    subscription_id: session.subscription,
                    payment_status: session.payment_status.unwrap_or_default(),
                })
            }
            "customer.subscription.updated" => {
                let sub: RawSubscription = decode_object(raw.data.object)?;
                BillingEventKind::SubscriptionUpdated(SubscriptionChange {
                    subscription_id: sub.id,
                    status: sub.status,
                })
            }
            "customer.subscription.deleted" => {
                let sub: RawSubscription = decode_object(raw.data.object)?;
                BillingEventKind::SubscriptionDeleted(SubscriptionChange {
                    subscription_id: sub.id,
                    status: sub.status,
                })
            }
            "invoice.payment_failed" => {
                let invoice: RawInvoice = decode_object(raw.data.object)?;
                BillingEventKind::InvoicePaymentFailed(InvoicePaymentFailed {
                    invoice_id: invoice.id,
                    subscription_id: invoice.subscription,
                })
            }
            _ => BillingEventKind::Ignored,
        };

        Ok(BillingEvent {
            id: raw.id,
            created: raw.created,
            event_type: raw.event_type,
            kind,
        })
    }
}

/// What can still be read from a payload that fails to decode
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventEnvelope {
    pub id: Option<String>,
    pub event_type: Option<String>,
    /// `data.object.id`, the checkout session for checkout events
    pub object_id: Option<String>,
}

impl EventEnvelope {
    /// Best-effort read of the envelope fields; never fails
    pub fn peek(payload: &[u8]) -> Self {
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) else {
            return Self::default();
        };
        let text = |v: &serde_json::Value| v.as_str().map(str::to_string);

        EventEnvelope {
            id: text(&value["id"]),
            event_type: text(&value["type"]),
            object_id: text(&value["data"]["object"]["id"]),
        }
    }

    pub fn is_checkout_completed(&self) -> bool {
        self.event_type.as_deref() == Some(CHECKOUT_COMPLETED)
    }
}

const CHECKOUT_COMPLETED: &str = "checkout.session.completed";

fn decode_object<T: serde::de::DeserializeOwned>(object: serde_json::Value) -> SiteResult<T> {
    serde_json::from_value(object)
        .map_err(|e| SiteError::Validation(format!("Malformed billing event object: {}", e)))
}

/// Map a provider subscription status onto the local mirror
///
/// `None` means the status carries no local meaning and is ignored.
pub fn map_subscription_status(status: &str) -> Option<SubscriptionStatus> {
    match status {
        "active" | "trialing" => Some(SubscriptionStatus::Active),
        "past_due" | "unpaid" | "incomplete" | "paused" => Some(SubscriptionStatus::PastDue),
        "canceled" | "cancelled" | "incomplete_expired" => Some(SubscriptionStatus::Cancelled),
        _ => None,
    }
}
