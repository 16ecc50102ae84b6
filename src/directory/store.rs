/// Site directory - the single source of truth for site records
///
/// Every mutation is one SQL statement whose WHERE clause carries its own
/// precondition, so concurrent writers are serialized by the store instead
/// of by in-process locks. Re-applying a mutation with identical inputs
/// leaves the row unchanged.
use super::models::{
    EditAttempt, FinalizeClaim, NewSite, PaymentStatus, Site, SiteLookup, SubscriptionStatus,
    SITE_COLUMNS,
};
use crate::{
    db::format_timestamp,
    error::{SiteError, SiteResult},
    validation,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Site directory service
#[derive(Clone)]
pub struct SiteDirectory {
    db: SqlitePool,
}

impl SiteDirectory {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Insert a freshly generated preview site
    pub async fn create_preview(&self, new: NewSite) -> SiteResult<Site> {
        self.create_preview_at(new, Utc::now()).await
    }

    /// Insert a preview site with an explicit creation time
    pub async fn create_preview_at(&self, new: NewSite, now: DateTime<Utc>) -> SiteResult<Site> {
        if new.business_name.trim().is_empty() {
            return Err(SiteError::Validation("Business name is required".to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let now_str = format_timestamp(now);

        sqlx::query(
            r#"
            INSERT INTO site (id, business_name, content_ref, owner_email, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
        )
        .bind(&id)
        .bind(new.business_name.trim())
        .bind(&new.content_ref)
        .bind(new.owner_email.as_deref().map(|e| e.trim().to_lowercase()))
        .bind(&now_str)
        .execute(&self.db)
        .await?;

        tracing::info!(site_id = %id, "Created preview site");

        self.find_by_id(&id).await
    }

    /// Minimal projection for a tenant host label (subdomain first, then slug)
    pub async fn find_by_host(&self, label: &str) -> SiteResult<SiteLookup> {
        let label = label.to_ascii_lowercase();

        let row = sqlx::query(
            r#"
            SELECT id, payment_status, subscription_status
            FROM site
            WHERE subdomain = ?1 OR slug = ?1
            ORDER BY CASE WHEN subdomain = ?1 THEN 0 ELSE 1 END
            LIMIT 1
            "#,
        )
        .bind(&label)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| SiteError::NotFound(format!("No site for host '{}'", label)))?;

        Ok(SiteLookup {
            site_id: row.try_get("id")?,
            payment_status: row.try_get::<String, _>("payment_status")?.parse()?,
            subscription_status: row.try_get::<String, _>("subscription_status")?.parse()?,
        })
    }

    /// Full site record by id
    pub async fn find_by_id(&self, id: &str) -> SiteResult<Site> {
        let row = sqlx::query(&format!("SELECT {} FROM site WHERE id = ?1", SITE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| SiteError::NotFound(format!("Site {} not found", id)))?;

        Site::try_from(&row)
    }

    /// Whether no site other than `except_site_id` holds `label` as subdomain or slug
    pub async fn is_host_available(&self, label: &str, except_site_id: &str) -> SiteResult<bool> {
        let taken: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM site
                WHERE (subdomain = ?1 OR slug = ?1) AND id <> ?2
            )
            "#,
        )
        .bind(label)
        .bind(except_site_id)
        .fetch_one(&self.db)
        .await?;

        Ok(!taken)
    }

    /// Advisory reservation of a subdomain for an in-flight claim
    ///
    /// Only finalized subdomains and slugs block a reservation, so two
    /// claimants can hold the same pending name; the first payment to be
    /// finalized wins.
    pub async fn reserve_subdomain(&self, id: &str, subdomain: &str) -> SiteResult<()> {
        let now = format_timestamp(Utc::now());

        let result = sqlx::query(
            r#"
            UPDATE site
            SET pending_subdomain = ?2, updated_at = ?3
            WHERE id = ?1
              AND NOT EXISTS (
                  SELECT 1 FROM site other
                  WHERE (other.subdomain = ?2 OR other.slug = ?2) AND other.id <> ?1
              )
            "#,
        )
        .bind(id)
        .bind(subdomain)
        .bind(&now)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.conflict_or_missing(id, format!("Subdomain '{}' is taken", subdomain)).await);
        }

        Ok(())
    }

    /// Authoritative subdomain assignment on confirmed payment
    ///
    /// Refuses (Conflict) when another site already holds the name, or when
    /// this site is already paid under a different subdomain or subscription;
    /// never overwrites the winner. Redelivering the same checkout is a no-op.
    /// Payment and subscription fields only move forward when no newer
    /// subscription event has been applied.
    pub async fn finalize_claim(&self, claim: &FinalizeClaim) -> SiteResult<()> {
        let now = format_timestamp(Utc::now());

        let result = sqlx::query(
            r#"
            UPDATE site
            SET subdomain = ?2,
                pending_subdomain = NULL,
                status = 'published',
                payment_status = CASE
                    WHEN subscription_event_at IS NULL OR subscription_event_at <= ?8 THEN 'paid'
                    ELSE payment_status END,
                subscription_status = CASE
                    WHEN subscription_event_at IS NULL OR subscription_event_at <= ?8 THEN 'active'
                    ELSE subscription_status END,
                billing_subscription_id = CASE
                    WHEN subscription_event_at IS NULL OR subscription_event_at <= ?8 THEN ?4
                    ELSE billing_subscription_id END,
                subscription_event_at = MAX(COALESCE(subscription_event_at, ?8), ?8),
                billing_customer_id = ?3,
                plan_tier = COALESCE(?5, plan_tier),
                owner_email = COALESCE(?6, owner_email),
                owner_user_id = COALESCE(?7, owner_user_id),
                claimed_at = COALESCE(claimed_at, ?9),
                updated_at = ?9
            WHERE id = ?1
              AND (
                  payment_status = 'unpaid'
                  OR (
                      (subdomain IS NULL OR subdomain = ?2)
                      AND (billing_subscription_id IS NULL OR billing_subscription_id IS ?4)
                  )
              )
              AND NOT EXISTS (
                  SELECT 1 FROM site other
                  WHERE (other.subdomain = ?2 OR other.slug = ?2) AND other.id <> ?1
              )
            "#,
        )
        .bind(&claim.site_id)
        .bind(&claim.subdomain)
        .bind(&claim.customer_id)
        .bind(&claim.subscription_id)
        .bind(claim.plan_tier.map(|t| t.as_str()))
        .bind(&claim.owner_email)
        .bind(&claim.owner_user_id)
        .bind(claim.event_at)
        .bind(&now)
        .execute(&self.db)
        .await
        .map_err(|e| unique_to_conflict(e, &claim.subdomain))?;

        if result.rows_affected() == 0 {
            return Err(self
                .conflict_or_missing(
                    &claim.site_id,
                    format!(
                        "Site {} is already claimed, or subdomain '{}' is held by another site",
                        claim.site_id, claim.subdomain
                    ),
                )
                .await);
        }

        tracing::info!(
            site_id = %claim.site_id,
            subdomain = %claim.subdomain,
            "Finalized claim"
        );

        Ok(())
    }

    /// Mirror a provider subscription status, ignoring stale events
    ///
    /// Applies only when the event is not older than the last applied one.
    /// On a timestamp tie a stored `cancelled` wins. Cancellation itself
    /// goes through [`SiteDirectory::cancel_subscription`].
    pub async fn apply_subscription_status(
        &self,
        subscription_id: &str,
        status: SubscriptionStatus,
        event_at: i64,
    ) -> SiteResult<()> {
        if status == SubscriptionStatus::Cancelled {
            return self.cancel_subscription(subscription_id, event_at).await;
        }

        let now = format_timestamp(Utc::now());

        let result = sqlx::query(
            r#"
            UPDATE site
            SET subscription_status = ?2, subscription_event_at = ?3, updated_at = ?4
            WHERE billing_subscription_id = ?1
              AND (
                  subscription_event_at IS NULL
                  OR subscription_event_at < ?3
                  OR (subscription_event_at = ?3 AND subscription_status <> 'cancelled')
              )
            "#,
        )
        .bind(subscription_id)
        .bind(status.as_str())
        .bind(event_at)
        .bind(&now)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.stale_or_missing(subscription_id).await);
        }

        tracing::info!(
            subscription_id = %subscription_id,
            status = %status,
            "Applied subscription status"
        );

        Ok(())
    }

    /// Cancel: subscription `cancelled`, payment `unpaid`, billing linkage cleared
    ///
    /// The subdomain stays on the record so the name is not released.
    pub async fn cancel_subscription(&self, subscription_id: &str, event_at: i64) -> SiteResult<()> {
        let now = format_timestamp(Utc::now());

        let result = sqlx::query(
            r#"
            UPDATE site
            SET subscription_status = 'cancelled',
                payment_status = 'unpaid',
                billing_subscription_id = NULL,
                subscription_event_at = MAX(COALESCE(subscription_event_at, ?2), ?2),
                updated_at = ?3
            WHERE billing_subscription_id = ?1
              AND (subscription_event_at IS NULL OR subscription_event_at <= ?2)
            "#,
        )
        .bind(subscription_id)
        .bind(event_at)
        .bind(&now)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.stale_or_missing(subscription_id).await);
        }

        tracing::info!(subscription_id = %subscription_id, "Cancelled subscription");

        Ok(())
    }

    /// Atomic compare-and-increment of the preview edit counter
    pub async fn increment_edit_count(&self, id: &str, limit: i64) -> SiteResult<EditAttempt> {
        let now = format_timestamp(Utc::now());

        let used: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE site
            SET preview_edits_used = preview_edits_used + 1, updated_at = ?3
            WHERE id = ?1 AND payment_status = 'unpaid' AND preview_edits_used < ?2
            RETURNING preview_edits_used
            "#,
        )
        .bind(id)
        .bind(limit)
        .bind(&now)
        .fetch_optional(&self.db)
        .await?;

        if let Some(used) = used {
            return Ok(EditAttempt::Recorded { used });
        }

        let payment_status: Option<String> =
            sqlx::query_scalar("SELECT payment_status FROM site WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.db)
                .await?;

        let payment_status = payment_status
            .ok_or_else(|| SiteError::NotFound(format!("Site {} not found", id)))?
            .parse::<PaymentStatus>()?;

        match payment_status {
            PaymentStatus::Paid => Ok(EditAttempt::Unmetered),
            PaymentStatus::Unpaid => Ok(EditAttempt::LimitReached),
        }
    }

    /// Assign a custom slug alias
    pub async fn assign_slug(&self, id: &str, slug: &str) -> SiteResult<String> {
        let slug = validation::normalize_host_label(slug)?;
        let now = format_timestamp(Utc::now());

        let result = sqlx::query(
            r#"
            UPDATE site
            SET slug = ?2, updated_at = ?3
            WHERE id = ?1
              AND NOT EXISTS (
                  SELECT 1 FROM site other
                  WHERE (other.subdomain = ?2 OR other.slug = ?2) AND other.id <> ?1
              )
            "#,
        )
        .bind(id)
        .bind(&slug)
        .bind(&now)
        .execute(&self.db)
        .await
        .map_err(|e| unique_to_conflict(e, &slug))?;

        if result.rows_affected() == 0 {
            return Err(self.conflict_or_missing(id, format!("Slug '{}' is taken", slug)).await);
        }

        Ok(slug)
    }

    /// Hard-delete a draft that was never claimed
    ///
    /// Claimed sites are retained even after cancellation.
    pub async fn delete_draft(&self, id: &str) -> SiteResult<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM site
            WHERE id = ?1 AND claimed_at IS NULL AND subdomain IS NULL AND payment_status = 'unpaid'
            "#,
        )
        .bind(id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .conflict_or_missing(id, "Claimed sites cannot be deleted".to_string())
                .await);
        }

        tracing::info!(site_id = %id, "Deleted draft site");
        Ok(())
    }

    /// Unclaimed sites with an owner email created inside `[now - until, now - from]`
    /// that have not been reminded yet
    pub async fn reminder_candidates(
        &self,
        now: DateTime<Utc>,
        from: Duration,
        until: Duration,
    ) -> SiteResult<Vec<Site>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM site
            WHERE payment_status = 'unpaid'
              AND claimed_at IS NULL
              AND reminder_sent_at IS NULL
              AND owner_email IS NOT NULL
              AND created_at >= ?1
              AND created_at <= ?2
            ORDER BY created_at
            "#,
            SITE_COLUMNS
        ))
        .bind(format_timestamp(now - until))
        .bind(format_timestamp(now - from))
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(Site::try_from).collect()
    }

    /// Set `reminder_sent_at` if still unset; true only for the caller that set it
    pub async fn mark_reminder_sent(&self, id: &str, now: DateTime<Utc>) -> SiteResult<bool> {
        let now = format_timestamp(now);

        let result = sqlx::query(
            r#"
            UPDATE site
            SET reminder_sent_at = ?2, updated_at = ?2
            WHERE id = ?1 AND reminder_sent_at IS NULL
            "#,
        )
        .bind(id)
        .bind(&now)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Sites owned by an account, newest first
    pub async fn sites_for_owner(&self, user_id: &str) -> SiteResult<Vec<Site>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM site WHERE owner_user_id = ?1 ORDER BY created_at DESC",
            SITE_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(Site::try_from).collect()
    }

    /// Whether the billing customer belongs to one of the account's sites
    pub async fn owner_has_customer(&self, user_id: &str, customer_id: &str) -> SiteResult<bool> {
        let owned: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM site WHERE owner_user_id = ?1 AND billing_customer_id = ?2)",
        )
        .bind(user_id)
        .bind(customer_id)
        .fetch_one(&self.db)
        .await?;

        Ok(owned)
    }

    async fn site_exists(&self, id: &str) -> SiteResult<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM site WHERE id = ?1)")
            .bind(id)
            .fetch_one(&self.db)
            .await?;

        Ok(exists)
    }

    async fn conflict_or_missing(&self, id: &str, conflict: String) -> SiteError {
        match self.site_exists(id).await {
            Ok(true) => SiteError::Conflict(conflict),
            Ok(false) => SiteError::NotFound(format!("Site {} not found", id)),
            Err(e) => e,
        }
    }

    async fn stale_or_missing(&self, subscription_id: &str) -> SiteError {
        let linked = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM site WHERE billing_subscription_id = ?1)",
        )
        .bind(subscription_id)
        .fetch_one(&self.db)
        .await;

        match linked {
            Ok(true) => SiteError::Conflict(format!(
                "Stale event for subscription {}; a newer event was already applied",
                subscription_id
            )),
            Ok(false) => {
                SiteError::NotFound(format!("No site linked to subscription {}", subscription_id))
            }
            Err(e) => SiteError::Database(e),
        }
    }
}

/// Map a unique-index violation on the host label columns to Conflict
fn unique_to_conflict(err: sqlx::Error, label: &str) -> SiteError {
    let is_unique = err
        .as_database_error()
        .map(|db_err| db_err.is_unique_violation())
        .unwrap_or(false);

    if is_unique {
        SiteError::Conflict(format!("'{}' is already taken", label))
    } else {
        SiteError::Database(err)
    }
}
