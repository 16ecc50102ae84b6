/// Site directory data models
use crate::{
    db::{parse_optional_timestamp, parse_timestamp},
    error::{SiteError, SiteResult},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row};
use std::fmt;
use std::str::FromStr;

/// Publication state of a site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteStatus {
    Preview,
    Published,
}

/// Whether the site has been paid for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
}

/// Health of the billing subscription backing a site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    None,
    Active,
    PastDue,
    Cancelled,
}

/// Purchasable plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Basic,
    Premium,
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl FromStr for $ty {
            type Err = SiteError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(SiteError::Validation(format!(
                        "unknown {} '{}'",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(SiteStatus { Preview => "preview", Published => "published" });
string_enum!(PaymentStatus { Unpaid => "unpaid", Paid => "paid" });
string_enum!(SubscriptionStatus {
    None => "none",
    Active => "active",
    PastDue => "past_due",
    Cancelled => "cancelled",
});
string_enum!(PlanTier { Basic => "basic", Premium => "premium" });

/// Full site record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    pub id: String,
    pub subdomain: Option<String>,
    /// Advisory reservation from an in-flight claim; never routed
    pub pending_subdomain: Option<String>,
    pub slug: Option<String>,
    pub business_name: String,
    pub content_ref: String,
    pub status: SiteStatus,
    pub payment_status: PaymentStatus,
    pub subscription_status: SubscriptionStatus,
    pub plan_tier: Option<PlanTier>,
    pub billing_customer_id: Option<String>,
    pub billing_subscription_id: Option<String>,
    pub owner_email: Option<String>,
    pub owner_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub preview_edits_used: i64,
    pub reminder_sent_at: Option<DateTime<Utc>>,
    pub subscription_event_at: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl Site {
    /// Paid with a healthy subscription
    pub fn is_servable(&self) -> bool {
        self.payment_status == PaymentStatus::Paid
            && self.subscription_status == SubscriptionStatus::Active
    }
}

pub(crate) const SITE_COLUMNS: &str = "id, subdomain, pending_subdomain, slug, business_name, \
    content_ref, status, payment_status, subscription_status, plan_tier, billing_customer_id, \
    billing_subscription_id, owner_email, owner_user_id, created_at, claimed_at, \
    preview_edits_used, reminder_sent_at, subscription_event_at, updated_at";

impl TryFrom<&SqliteRow> for Site {
    type Error = SiteError;

    fn try_from(row: &SqliteRow) -> SiteResult<Self> {
        let plan_tier: Option<String> = row.try_get("plan_tier")?;

        Ok(Site {
            id: row.try_get("id")?,
            subdomain: row.try_get("subdomain")?,
            pending_subdomain: row.try_get("pending_subdomain")?,
            slug: row.try_get("slug")?,
            business_name: row.try_get("business_name")?,
            content_ref: row.try_get("content_ref")?,
            status: row.try_get::<String, _>("status")?.parse()?,
            payment_status: row.try_get::<String, _>("payment_status")?.parse()?,
            subscription_status: row.try_get::<String, _>("subscription_status")?.parse()?,
            plan_tier: plan_tier.as_deref().map(str::parse::<PlanTier>).transpose()?,
            billing_customer_id: row.try_get("billing_customer_id")?,
            billing_subscription_id: row.try_get("billing_subscription_id")?,
            owner_email: row.try_get("owner_email")?,
            owner_user_id: row.try_get("owner_user_id")?,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
            claimed_at: parse_optional_timestamp(row.try_get("claimed_at")?)?,
            preview_edits_used: row.try_get("preview_edits_used")?,
            reminder_sent_at: parse_optional_timestamp(row.try_get("reminder_sent_at")?)?,
            subscription_event_at: row.try_get("subscription_event_at")?,
            updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
        })
    }
}

/// Minimal projection used on the hot routing path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteLookup {
    pub site_id: String,
    pub payment_status: PaymentStatus,
    pub subscription_status: SubscriptionStatus,
}

impl SiteLookup {
    /// Paid with a healthy subscription
    pub fn is_servable(&self) -> bool {
        self.payment_status == PaymentStatus::Paid
            && self.subscription_status == SubscriptionStatus::Active
    }
}

/// Input for a freshly generated preview
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSite {
    pub business_name: String,
    pub content_ref: String,
    pub owner_email: Option<String>,
}

/// Authoritative claim finalization, built from a confirmed checkout
#[derive(Debug, Clone)]
pub struct FinalizeClaim {
    pub site_id: String,
    pub subdomain: String,
    pub customer_id: String,
    pub subscription_id: Option<String>,
    pub plan_tier: Option<PlanTier>,
    pub owner_email: Option<String>,
    pub owner_user_id: Option<String>,
    /// Provider timestamp of the confirming event (unix seconds)
    pub event_at: i64,
}

/// Result of an edit attempt against the preview quota
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditAttempt {
    /// Counted; holds the new number of edits used
    Recorded { used: i64 },
    /// Quota exhausted, counter untouched
    LimitReached,
    /// Paid sites are not metered
    Unmetered,
}
