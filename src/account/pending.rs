/// Pending accounts staged by a claim until its payment is confirmed
use super::{generate_token, hash_password, hash_token, normalize_email};
use crate::{
    db::format_timestamp,
    error::SiteResult,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};

/// Credential released by consuming a pending account
#[derive(Debug, Clone)]
pub struct PendingCredential {
    pub email: String,
    pub password_hash: String,
}

/// Pending account store
#[derive(Clone)]
pub struct PendingAccountStore {
    db: SqlitePool,
    ttl: Duration,
}

impl PendingAccountStore {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            db,
            ttl: Duration::hours(24),
        }
    }

    /// Stage a pending account; returns the raw token to carry in checkout metadata
    ///
    /// The password is hashed before it reaches the database and the token
    /// is stored only as a digest.
    pub async fn create(&self, email: &str, password: String) -> SiteResult<String> {
        self.create_at(email, password, Utc::now()).await
    }

    pub async fn create_at(
        &self,
        email: &str,
        password: String,
        now: DateTime<Utc>,
    ) -> SiteResult<String> {
        let token = generate_token();
        let password_hash = hash_password(password).await?;

        sqlx::query(
            r#"
            INSERT INTO pending_account (token_hash, email, password_hash, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(hash_token(&token))
        .bind(normalize_email(email))
        .bind(&password_hash)
        .bind(format_timestamp(now))
        .bind(format_timestamp(now + self.ttl))
        .execute(&self.db)
        .await?;

        Ok(token)
    }

    /// Atomically take an unexpired pending account matching token and email
    ///
    /// Single use: the row is deleted by the same statement that reads it,
    /// so a second consumer gets `None`.
    pub async fn consume(
        &self,
        token: &str,
        email: &str,
        now: DateTime<Utc>,
    ) -> SiteResult<Option<PendingCredential>> {
        let row = sqlx::query(
            r#"
            DELETE FROM pending_account
            WHERE token_hash = ?1 AND email = ?2 AND expires_at > ?3
            RETURNING email, password_hash
            "#,
        )
        .bind(hash_token(token))
        .bind(normalize_email(email))
        .bind(format_timestamp(now))
        .fetch_optional(&self.db)
        .await?;

        match row {
            Some(row) => Ok(Some(PendingCredential {
                email: row.try_get("email")?,
                password_hash: row.try_get("password_hash")?,
            })),
            None => Ok(None),
        }
    }

    /// Delete expired pending accounts
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> SiteResult<u64> {
        let result = sqlx::query("DELETE FROM pending_account WHERE expires_at <= ?1")
            .bind(format_timestamp(now))
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn test_consume_is_single_use() {
        let store = PendingAccountStore::new(db::connect_in_memory().await.unwrap());
        let now = Utc::now();

        let token = store
            .create_at("Owner@Example.com", "hunter22!".to_string(), now)
            .await
            .unwrap();

        let credential = store
            .consume(&token, "owner@example.com", now)
            .await
            .unwrap()
            .expect("pending account");
        assert_eq!(credential.email, "owner@example.com");
        assert!(credential.password_hash.starts_with("$argon2id$"));
        assert!(!credential.password_hash.contains("hunter22!"));

        assert!(store.consume(&token, "owner@example.com", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_consume_requires_matching_email_and_unexpired() {
        let store = PendingAccountStore::new(db::connect_in_memory().await.unwrap());
        let now = Utc::now();
        let token = store
            .create_at("owner@example.com", "hunter22!".to_string(), now)
            .await
            .unwrap();

        assert!(store.consume(&token, "other@example.com", now).await.unwrap().is_none());
        assert!(store
            .consume(&token, "owner@example.com", now + Duration::hours(25))
            .await
            .unwrap()
            .is_none());

        assert_eq!(store.purge_expired(now + Duration::hours(25)).await.unwrap(), 1);
    }
}
