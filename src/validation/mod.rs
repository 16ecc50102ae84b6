/// Host label validation
///
/// Subdomains and slugs share one namespace (a tenant host label), so both
/// go through the same normalization and reserved-name rules.
use crate::error::{SiteError, SiteResult};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Lowercase alphanumerics and inner hyphens, 3 to 63 characters
    static ref HOST_LABEL_RE: Regex =
        Regex::new(r"^[a-z0-9][a-z0-9-]{1,61}[a-z0-9]$").expect("host label pattern");
}

/// Labels that collide with infrastructure or primary-domain routes
pub const RESERVED_LABELS: &[&str] = &[
    "www", "api", "admin", "billing", "app", "dashboard", "account", "accounts", "auth",
    "login", "signup", "logout", "mail", "email", "smtp", "ftp", "support", "help", "status",
    "docs", "blog", "static", "assets", "cdn", "media", "internal", "preview", "render",
    "webhooks", "checkout", "portal", "root", "test", "staging", "dev",
];

/// Whether a normalized label is reserved
pub fn is_reserved(label: &str) -> bool {
    RESERVED_LABELS.contains(&label)
}

/// Normalize a requested subdomain or slug and check it is usable as a host label
pub fn normalize_host_label(input: &str) -> SiteResult<String> {
    let label = input.trim().to_ascii_lowercase();

    if !HOST_LABEL_RE.is_match(&label) {
        return Err(SiteError::Validation(format!(
            "'{}' must be 3-63 characters of a-z, 0-9 and hyphens, and may not start or end with a hyphen",
            input.trim()
        )));
    }

    if is_reserved(&label) {
        return Err(SiteError::Validation(format!("'{}' is reserved", label)));
    }

    Ok(label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_valid_labels() {
        assert_eq!(normalize_host_label("acme").unwrap(), "acme");
        assert_eq!(normalize_host_label("  Acme-Bakery ").unwrap(), "acme-bakery");
        assert_eq!(normalize_host_label("a1b").unwrap(), "a1b");
        assert_eq!(normalize_host_label(&"a".repeat(63)).unwrap().len(), 63);
    }

    #[test]
    fn test_rejects_malformed_labels() {
        for bad in ["ab", "-acme", "acme-", "ac_me", "acme.site", "", "ümlaut"] {
            assert!(
                matches!(normalize_host_label(bad), Err(SiteError::Validation(_))),
                "{} should be rejected",
                bad
            );
        }
        assert!(normalize_host_label(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_rejects_reserved_labels() {
        for reserved in ["www", "API", "admin", "billing"] {
            assert!(normalize_host_label(reserved).is_err());
        }
    }
}
