/// Account manager implementation using runtime queries
use super::{generate_token, hash_token, normalize_email, verify_password, UserAccount};
use crate::{
    db::{format_timestamp, parse_timestamp},
    error::{SiteError, SiteResult},
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;

/// Account manager service
pub struct AccountManager {
    db: SqlitePool,
    session_ttl: Duration,
}

impl AccountManager {
    /// Create a new account manager
    pub fn new(db: SqlitePool, session_ttl: Duration) -> Self {
        Self { db, session_ttl }
    }

    /// Materialize a user account from an already-hashed credential
    ///
    /// If an account with this email exists it is returned unchanged, so
    /// replayed payment confirmations do not reset a password.
    pub async fn create_with_password_hash(
        &self,
        email: &str,
        password_hash: &str,
    ) -> SiteResult<UserAccount> {
        let email = normalize_email(email);
        let now = format_timestamp(Utc::now());

        sqlx::query(
            r#"
            INSERT INTO user_account (id, email, password_hash, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(email) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&email)
        .bind(password_hash)
        .bind(&now)
        .execute(&self.db)
        .await?;

        self.find_by_email(&email)
            .await?
            .ok_or_else(|| SiteError::Internal(format!("Account for {} vanished", email)))
    }

    /// Find account by email
    pub async fn find_by_email(&self, email: &str) -> SiteResult<Option<UserAccount>> {
        let row = sqlx::query(
            "SELECT id, email, password_hash, created_at FROM user_account WHERE email = ?1",
        )
        .bind(normalize_email(email))
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    /// Verify credentials and open a session; returns the raw session token
    pub async fn login(&self, email: &str, password: &str) -> SiteResult<(UserAccount, String)> {
        let account = self
            .find_by_email(email)
            .await?
            .ok_or_else(|| SiteError::Authentication("Invalid credentials".to_string()))?;

        let valid = verify_password(password.to_string(), account.password_hash.clone()).await?;
        if !valid {
            return Err(SiteError::Authentication("Invalid credentials".to_string()));
        }

        let token = self.create_session(&account.id).await?;
        Ok((account, token))
    }

    /// Create a session for an account
    pub async fn create_session(&self, user_id: &str) -> SiteResult<String> {
        let token = generate_token();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO session (token_hash, user_id, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(hash_token(&token))
        .bind(user_id)
        .bind(format_timestamp(now))
        .bind(format_timestamp(now + self.session_ttl))
        .execute(&self.db)
        .await?;

        Ok(token)
    }

    /// Resolve a session token to its account
    pub async fn validate_session(&self, token: &str) -> SiteResult<UserAccount> {
        let row = sqlx::query(
            r#"
            SELECT u.id, u.email, u.password_hash, u.created_at
            FROM session s
            JOIN user_account u ON u.id = s.user_id
            WHERE s.token_hash = ?1 AND s.expires_at > ?2
            "#,
        )
        .bind(hash_token(token))
        .bind(format_timestamp(Utc::now()))
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| SiteError::Authentication("Invalid or expired session".to_string()))?;

        account_from_row(&row)
    }

    /// Delete a session (logout)
    pub async fn delete_session(&self, token: &str) -> SiteResult<()> {
        sqlx::query("DELETE FROM session WHERE token_hash = ?1")
            .bind(hash_token(token))
            .execute(&self.db)
            .await?;

        Ok(())
    }

    /// Cleanup expired sessions
    pub async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> SiteResult<u64> {
        let result = sqlx::query("DELETE FROM session WHERE expires_at <= ?1")
            .bind(format_timestamp(now))
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }
}

fn account_from_row(row: &SqliteRow) -> SiteResult<UserAccount> {
    Ok(UserAccount {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
    })
}
