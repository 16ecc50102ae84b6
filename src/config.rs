/// Configuration management for Sitehost
use crate::error::{SiteError, SiteResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub billing: BillingConfig,
    pub authentication: AuthConfig,
    pub email: Option<EmailConfig>,
    pub preview: PreviewConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Bind address
    pub hostname: String,
    pub port: u16,
    /// Apex domain tenants live under (e.g. `example.site`)
    pub primary_domain: String,
    /// Public URL of the primary domain, used for redirects and checkout return URLs
    pub public_url: String,
    /// Upper bound on the per-request tenant lookup, in milliseconds
    pub lookup_timeout_ms: u64,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
    pub database: PathBuf,
}

/// Billing provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    pub api_key: String,
    pub webhook_secret: String,
    pub api_base: String,
    pub price_basic: String,
    pub price_premium: String,
    pub timeout_secs: u64,
    /// Accepted clock skew for webhook signature timestamps
    pub signature_tolerance_secs: i64,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared marker value internal callers present in `x-internal-request`
    pub internal_secret: String,
    pub session_ttl_days: i64,
    /// Secure flag on the session cookie (off for plain-http local development)
    pub secure_cookies: bool,
}

/// Email configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub smtp_url: String,
    pub from_address: String,
}

/// Preview lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    pub reminder_interval_secs: u64,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub claims_per_minute: u32,
    pub logins_per_minute: u32,
    pub webhooks_per_second: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> SiteResult<Self> {
        dotenv::dotenv().ok();

        let hostname = env::var("SITEHOST_HOSTNAME").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("SITEHOST_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| SiteError::Validation("Invalid port number".to_string()))?;
        let primary_domain = env::var("SITEHOST_PRIMARY_DOMAIN")
            .unwrap_or_else(|_| "localhost".to_string())
            .to_lowercase();
        let public_url = env::var("SITEHOST_PUBLIC_URL")
            .unwrap_or_else(|_| format!("https://{}", primary_domain))
            .trim_end_matches('/')
            .to_string();
        let lookup_timeout_ms = env::var("SITEHOST_LOOKUP_TIMEOUT_MS")
            .unwrap_or_else(|_| "1500".to_string())
            .parse()
            .unwrap_or(1500);

        let data_directory: PathBuf = env::var("SITEHOST_DATA_DIRECTORY")
            .unwrap_or_else(|_| "./data".to_string())
            .into();
        let database = env::var("SITEHOST_DATABASE_LOCATION")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("sites.sqlite"));

        let api_key = env::var("SITEHOST_BILLING_API_KEY")
            .map_err(|_| SiteError::Validation("Billing API key required".to_string()))?;
        let webhook_secret = env::var("SITEHOST_BILLING_WEBHOOK_SECRET")
            .map_err(|_| SiteError::Validation("Billing webhook secret required".to_string()))?;
        let api_base = env::var("SITEHOST_BILLING_API_BASE")
            .unwrap_or_else(|_| "https://api.stripe.com".to_string());
        let price_basic = env::var("SITEHOST_BILLING_PRICE_BASIC")
            .map_err(|_| SiteError::Validation("Basic plan price id required".to_string()))?;
        let price_premium = env::var("SITEHOST_BILLING_PRICE_PREMIUM")
            .unwrap_or_else(|_| price_basic.clone());
        let timeout_secs = env::var("SITEHOST_BILLING_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);
        let signature_tolerance_secs = env::var("SITEHOST_BILLING_SIGNATURE_TOLERANCE_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);

        let internal_secret = env::var("SITEHOST_INTERNAL_SECRET")
            .map_err(|_| SiteError::Validation("Internal request secret required".to_string()))?;
        let session_ttl_days = env::var("SITEHOST_SESSION_TTL_DAYS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);
        let secure_cookies = env::var("SITEHOST_SECURE_COOKIES")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);

        let email = if let Ok(smtp_url) = env::var("SITEHOST_EMAIL_SMTP_URL") {
            Some(EmailConfig {
                smtp_url,
                from_address: env::var("SITEHOST_EMAIL_FROM_ADDRESS")
                    .unwrap_or_else(|_| format!("noreply@{}", primary_domain)),
            })
        } else {
            None
        };

        let reminder_interval_secs = env::var("SITEHOST_REMINDER_INTERVAL_SECS")
            .unwrap_or_else(|_| "900".to_string())
            .parse()
            .unwrap_or(900);

        let rate_limit_enabled = env::var("SITEHOST_RATE_LIMITS_ENABLED")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);
        let claims_per_minute = env::var("SITEHOST_RATE_LIMIT_CLAIMS_PER_MINUTE")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);
        let logins_per_minute = env::var("SITEHOST_RATE_LIMIT_LOGINS_PER_MINUTE")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);
        let webhooks_per_second = env::var("SITEHOST_RATE_LIMIT_WEBHOOKS_PER_SECOND")
            .unwrap_or_else(|_| "50".to_string())
            .parse()
            .unwrap_or(50);

        let log_level = env::var("RUST_LOG").unwrap_or_else(|_| "sitehost=info,tower_http=info".to_string());
        let log_json = env::var("SITEHOST_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(ServerConfig {
            service: ServiceConfig {
                hostname,
                port,
                primary_domain,
                public_url,
                lookup_timeout_ms,
            },
            storage: StorageConfig {
                data_directory,
                database,
            },
            billing: BillingConfig {
                api_key,
                webhook_secret,
                api_base,
                price_basic,
                price_premium,
                timeout_secs,
                signature_tolerance_secs,
            },
            authentication: AuthConfig {
                internal_secret,
                session_ttl_days,
                secure_cookies,
            },
            email,
            preview: PreviewConfig {
                reminder_interval_secs,
            },
            rate_limit: RateLimitConfig {
                enabled: rate_limit_enabled,
                claims_per_minute,
                logins_per_minute,
                webhooks_per_second,
            },
            logging: LoggingConfig {
                level: log_level,
                json: log_json,
            },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> SiteResult<()> {
        if self.service.primary_domain.is_empty() {
            return Err(SiteError::Validation(
                "Primary domain cannot be empty".to_string(),
            ));
        }

        if self.authentication.internal_secret.len() < 32 {
            return Err(SiteError::Validation(
                "Internal request secret must be at least 32 characters".to_string(),
            ));
        }

        if self.billing.webhook_secret.is_empty() {
            return Err(SiteError::Validation(
                "Billing webhook secret cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Configuration suitable for tests and local development
    pub fn for_testing(primary_domain: &str) -> Self {
        ServerConfig {
            service: ServiceConfig {
                hostname: "127.0.0.1".to_string(),
                port: 0,
                primary_domain: primary_domain.to_string(),
                public_url: format!("https://{}", primary_domain),
                lookup_timeout_ms: 1500,
            },
            storage: StorageConfig {
                data_directory: PathBuf::from("./data"),
                database: PathBuf::from("./data/sites.sqlite"),
            },
            billing: BillingConfig {
                api_key: "sk_test_key".to_string(),
                webhook_secret: "whsec_test_secret".to_string(),
                api_base: "https://api.stripe.com".to_string(),
                price_basic: "price_basic".to_string(),
                price_premium: "price_premium".to_string(),
                timeout_secs: 10,
                signature_tolerance_secs: 300,
            },
            authentication: AuthConfig {
                internal_secret: "internal-secret-internal-secret-0000".to_string(),
                session_ttl_days: 30,
                secure_cookies: false,
            },
            email: None,
            preview: PreviewConfig {
                reminder_interval_secs: 900,
            },
            rate_limit: RateLimitConfig {
                enabled: false,
                claims_per_minute: 30,
                logins_per_minute: 60,
                webhooks_per_second: 50,
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                json: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_short_internal_secret() {
        let mut config = ServerConfig::for_testing("example.site");
        assert!(config.validate().is_ok());

        config.authentication.internal_secret = "short".to_string();
        assert!(matches!(config.validate(), Err(SiteError::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_empty_primary_domain() {
        let mut config = ServerConfig::for_testing("example.site");
        config.service.primary_domain = String::new();
        assert!(config.validate().is_err());
    }
}
