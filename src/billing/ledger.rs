/// Processed-event ledger and unresolved claim records
use crate::{
    db::{format_timestamp, parse_timestamp},
    error::SiteResult,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

/// A paid checkout whose subdomain could not be finalized
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnresolvedClaim {
    pub checkout_session_id: String,
    pub site_id: String,
    pub subdomain: String,
    pub billing_customer_id: Option<String>,
    pub billing_subscription_id: Option<String>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct EventLedger {
    db: SqlitePool,
}

impl EventLedger {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn is_processed(&self, event_id: &str) -> SiteResult<bool> {
        let seen: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM billing_event WHERE event_id = ?1 AND processed_at IS NOT NULL)",
        )
        .bind(event_id)
        .fetch_one(&self.db)
        .await?;

        Ok(seen)
    }

    /// Take the event for processing
    ///
    /// Returns false when the event is already processed or another worker
    /// holds a claim younger than `lease`. A claim left behind by a crashed
    /// worker can be taken over once the lease runs out.
    pub async fn claim(&self, event_id: &str, event_type: &str, lease: Duration) -> SiteResult<bool> {
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO billing_event (event_id, event_type, claimed_at, processed_at)
            VALUES (?1, ?2, ?3, NULL)
            ON CONFLICT(event_id) DO UPDATE SET claimed_at = excluded.claimed_at
            WHERE billing_event.processed_at IS NULL
              AND billing_event.claimed_at < ?4
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(format_timestamp(now))
        .bind(format_timestamp(now - lease))
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Give up an unfinished claim so a redelivery can run the event again
    pub async fn release(&self, event_id: &str) -> SiteResult<()> {
        sqlx::query("DELETE FROM billing_event WHERE event_id = ?1 AND processed_at IS NULL")
            .bind(event_id)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    /// Record an event as handled; re-marking is a no-op
    pub async fn mark_processed(&self, event_id: &str, event_type: &str) -> SiteResult<()> {
        let now = format_timestamp(Utc::now());

        sqlx::query(
            r#"
            INSERT INTO billing_event (event_id, event_type, claimed_at, processed_at)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(event_id) DO UPDATE SET processed_at = excluded.processed_at
            WHERE billing_event.processed_at IS NULL
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    pub async fn record_unresolved_claim(&self, claim: &UnresolvedClaim) -> SiteResult<()> {
        sqlx::query(
            r#"
            INSERT INTO unresolved_claim
                (checkout_session_id, site_id, subdomain, billing_customer_id,
                 billing_subscription_id, detected_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(checkout_session_id) DO NOTHING
            "#,
        )
        .bind(&claim.checkout_session_id)
        .bind(&claim.site_id)
        .bind(&claim.subdomain)
        .bind(&claim.billing_customer_id)
        .bind(&claim.billing_subscription_id)
        .bind(format_timestamp(claim.detected_at))
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Unresolved claims, oldest first
    pub async fn unresolved_claims(&self) -> SiteResult<Vec<UnresolvedClaim>> {
        let rows = sqlx::query(
            r#"
            SELECT checkout_session_id, site_id, subdomain, billing_customer_id,
                   billing_subscription_id, detected_at
            FROM unresolved_claim
            ORDER BY detected_at
            "#,
        )
        .fetch_all(&self.db)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(UnresolvedClaim {
                    checkout_session_id: row.try_get("checkout_session_id")?,
                    site_id: row.try_get("site_id")?,
                    subdomain: row.try_get("subdomain")?,
                    billing_customer_id: row.try_get("billing_customer_id")?,
                    billing_subscription_id: row.try_get("billing_subscription_id")?,
                    detected_at: parse_timestamp(&row.try_get::<String, _>("detected_at")?)?,
                })
            })
            .collect()
    }
}
