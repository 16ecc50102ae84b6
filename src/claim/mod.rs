/// Claim coordination
///
/// Turns a visitor's request to keep a preview into a provider checkout.
/// Nothing here marks a site paid: the subdomain is only reserved, and the
/// reconciler makes it authoritative once payment is confirmed.
use crate::{
    account::PendingAccountStore,
    billing::{BillingProvider, CheckoutParams, ClaimMetadata},
    directory::{PaymentStatus, PlanTier, SiteDirectory},
    error::{SiteError, SiteResult},
    metrics,
    validation,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;

/// Claim request body
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    #[validate(length(min = 1, max = 64))]
    pub site_id: String,
    #[validate(length(min = 1, max = 253))]
    pub subdomain: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 3, max = 32))]
    pub phone: Option<String>,
    pub plan_tier: PlanTier,
    #[validate(length(min = 8, max = 128))]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResponse {
    pub checkout_url: String,
}

/// Price identifiers per plan
#[derive(Debug, Clone)]
pub struct PlanPrices {
    pub basic: String,
    pub premium: String,
}

impl PlanPrices {
    pub fn price_for(&self, tier: PlanTier) -> &str {
        match tier {
            PlanTier::Basic => &self.basic,
            PlanTier::Premium => &self.premium,
        }
    }
}

pub struct ClaimCoordinator {
    directory: Arc<SiteDirectory>,
    pending_accounts: Arc<PendingAccountStore>,
    provider: Arc<dyn BillingProvider>,
    prices: PlanPrices,
    public_url: String,
}

impl ClaimCoordinator {
    pub fn new(
        directory: Arc<SiteDirectory>,
        pending_accounts: Arc<PendingAccountStore>,
        provider: Arc<dyn BillingProvider>,
        prices: PlanPrices,
        public_url: String,
    ) -> Self {
        Self {
            directory,
            pending_accounts,
            provider,
            prices,
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    /// Reserve the subdomain and start a checkout
    ///
    /// Two claimants may both get this far for the same name; only the
    /// first confirmed payment is finalized.
    pub async fn initiate_claim(&self, request: ClaimRequest) -> SiteResult<ClaimResponse> {
        let result = self.initiate(request).await;
        metrics::record_claim(match &result {
            Ok(_) => "checkout_created",
            Err(SiteError::Conflict(_)) => "conflict",
            Err(SiteError::Validation(_)) => "invalid",
            Err(SiteError::ExternalProvider(_)) => "provider_error",
            Err(_) => "error",
        });
        result
    }

    async fn initiate(&self, request: ClaimRequest) -> SiteResult<ClaimResponse> {
        let site = self.directory.find_by_id(&request.site_id).await?;
        if site.payment_status == PaymentStatus::Paid {
            return Err(SiteError::Conflict(format!("Site {} is already claimed", site.id)));
        }

        let subdomain = validation::normalize_host_label(&request.subdomain)?;
        request.validate()?;
        let email = request.email.trim().to_lowercase();
        let phone = request
            .phone
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        if !self.directory.is_host_available(&subdomain, &site.id).await? {
            return Err(SiteError::Conflict(format!("Subdomain '{}' is taken", subdomain)));
        }
        self.directory.reserve_subdomain(&site.id, &subdomain).await?;

        let customer_id = self
            .provider
            .find_or_create_customer(&email, phone.as_deref())
            .await?;

        let account_token = match request.password {
            Some(password) => Some(self.pending_accounts.create(&email, password).await?),
            None => None,
        };

        let params = CheckoutParams {
            customer_id,
            price_id: self.prices.price_for(request.plan_tier).to_string(),
            success_url: format!(
                "{}/claim/success?siteId={}&session_id={{CHECKOUT_SESSION_ID}}",
                self.public_url, site.id
            ),
            cancel_url: format!("{}/preview/{}", self.public_url, site.id),
            metadata: ClaimMetadata {
                site_id: site.id.clone(),
                subdomain: subdomain.clone(),
                email,
                phone,
                plan_tier: request.plan_tier,
                account_token,
            },
        };

        let session = self.provider.create_checkout_session(&params).await?;

        tracing::info!(
            site_id = %site.id,
            subdomain = %subdomain,
            session_id = %session.id,
            "Claim initiated"
        );

        Ok(ClaimResponse {
            checkout_url: session.url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        billing::CheckoutSession,
        db,
        directory::{FinalizeClaim, NewSite},
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeProvider {
        fail: bool,
        checkouts: Mutex<Vec<CheckoutParams>>,
    }

    #[async_trait]
    impl BillingProvider for FakeProvider {
        async fn find_or_create_customer(&self, email: &str, _: Option<&str>) -> SiteResult<String> {
            if self.fail {
                return Err(SiteError::ExternalProvider("provider down".to_string()));
            }
            Ok(format!("cus_{}", email))
        }

        async fn create_checkout_session(&self, params: &CheckoutParams) -> SiteResult<CheckoutSession> {
            let mut checkouts = self.checkouts.lock().unwrap();
            checkouts.push(params.clone());
            Ok(CheckoutSession {
                id: format!("cs_{}", checkouts.len()),
                url: format!("https://checkout.test/{}", checkouts.len()),
            })
        }

        async fn create_portal_session(&self, _: &str, _: &str) -> SiteResult<String> {
            Ok("https://portal.test".to_string())
        }
    }

    struct Harness {
        coordinator: ClaimCoordinator,
        directory: Arc<SiteDirectory>,
        provider: Arc<FakeProvider>,
    }

    async fn harness(provider: FakeProvider) -> Harness {
        let pool = db::connect_in_memory().await.unwrap();
        let directory = Arc::new(SiteDirectory::new(pool.clone()));
        let provider = Arc::new(provider);
        let coordinator = ClaimCoordinator::new(
            directory.clone(),
            Arc::new(PendingAccountStore::new(pool)),
            provider.clone(),
            PlanPrices {
                basic: "price_basic".to_string(),
                premium: "price_premium".to_string(),
            },
            "https://example.site/".to_string(),
        );
        Harness {
            coordinator,
            directory,
            provider,
        }
    }

    async fn preview(directory: &SiteDirectory) -> String {
        directory
            .create_preview(NewSite {
                business_name: "Acme Bakery".to_string(),
                content_ref: "content/acme".to_string(),
                owner_email: None,
            })
            .await
            .unwrap()
            .id
    }

    fn request(site_id: &str, subdomain: &str) -> ClaimRequest {
        ClaimRequest {
            site_id: site_id.to_string(),
            subdomain: subdomain.to_string(),
            email: "Owner@Example.com".to_string(),
            phone: None,
            plan_tier: PlanTier::Premium,
            password: Some("hunter22!".to_string()),
        }
    }

    #[tokio::test]
    async fn test_claim_reserves_and_creates_checkout() {
        let h = harness(FakeProvider::default()).await;
        let site_id = preview(&h.directory).await;

        let response = h.coordinator.initiate_claim(request(&site_id, " Acme ")).await.unwrap();
        assert_eq!(response.checkout_url, "https://checkout.test/1");

        let site = h.directory.find_by_id(&site_id).await.unwrap();
        assert_eq!(site.pending_subdomain.as_deref(), Some("acme"));
        assert_eq!(site.subdomain, None);
        assert_eq!(site.payment_status, PaymentStatus::Unpaid);

        let checkouts = h.provider.checkouts.lock().unwrap();
        let params = &checkouts[0];
        assert_eq!(params.price_id, "price_premium");
        assert_eq!(params.metadata.email, "owner@example.com");
        assert!(params.metadata.account_token.is_some());
        assert_eq!(params.cancel_url, format!("https://example.site/preview/{}", site_id));
    }

    #[tokio::test]
    async fn test_claim_rejects_invalid_and_reserved_subdomains() {
        let h = harness(FakeProvider::default()).await;
        let site_id = preview(&h.directory).await;

        for bad in ["ab", "-acme", "www", "admin", "acme.bakery"] {
            let result = h.coordinator.initiate_claim(request(&site_id, bad)).await;
            assert!(matches!(result, Err(SiteError::Validation(_))), "{}", bad);
        }
        assert!(h.provider.checkouts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_rejects_short_password() {
        let h = harness(FakeProvider::default()).await;
        let site_id = preview(&h.directory).await;

        let mut req = request(&site_id, "acme");
        req.password = Some("short".to_string());
        assert!(matches!(
            h.coordinator.initiate_claim(req).await,
            Err(SiteError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_conflicts_on_finalized_name() {
        let h = harness(FakeProvider::default()).await;
        let winner = preview(&h.directory).await;
        let loser = preview(&h.directory).await;

        h.directory
            .finalize_claim(&FinalizeClaim {
                site_id: winner.clone(),
                subdomain: "acme".to_string(),
                customer_id: "cus_1".to_string(),
                subscription_id: Some("sub_1".to_string()),
                plan_tier: Some(PlanTier::Basic),
                owner_email: None,
                owner_user_id: None,
                event_at: 1,
            })
            .await
            .unwrap();

        assert!(matches!(
            h.coordinator.initiate_claim(request(&loser, "acme")).await,
            Err(SiteError::Conflict(_))
        ));
        assert!(matches!(
            h.coordinator.initiate_claim(request(&winner, "other")).await,
            Err(SiteError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_two_claimants_may_both_reach_checkout() {
        let h = harness(FakeProvider::default()).await;
        let x = preview(&h.directory).await;
        let y = preview(&h.directory).await;

        h.coordinator.initiate_claim(request(&x, "acme")).await.unwrap();
        h.coordinator.initiate_claim(request(&y, "acme")).await.unwrap();

        assert_eq!(h.provider.checkouts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_site_and_provider_failure() {
        let h = harness(FakeProvider::default()).await;
        assert!(matches!(
            h.coordinator.initiate_claim(request("missing", "acme")).await,
            Err(SiteError::NotFound(_))
        ));

        let h = harness(FakeProvider {
            fail: true,
            ..Default::default()
        })
        .await;
        let site_id = preview(&h.directory).await;
        let err = h
            .coordinator
            .initiate_claim(request(&site_id, "acme"))
            .await
            .unwrap_err();
        assert!(matches!(err, SiteError::ExternalProvider(_)));
        assert!(err.is_retryable());
    }
}
