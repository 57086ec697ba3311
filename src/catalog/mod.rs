use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Company, Frequency, MetricCode, SiteRecord};

pub mod client;
pub use client::CatalogClient;

/// Catalog failure taxonomy. Transient failures are retried inside the
/// client; `Unavailable` means the retry budget is exhausted and the job
/// coordinator should record the company as failed and move on.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("company {0} not found in catalog")]
    NotFound(i64),
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected catalog payload: {0}")]
    Malformed(String),
}

/// Bounded exponential backoff shared by catalog and store retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given zero-based failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .mul_f64(self.multiplier.powi(attempt as i32))
    }
}

/// Read-only company metadata source.
#[async_trait]
pub trait CompanyCatalog: Send + Sync {
    async fn list_companies(&self) -> Result<Vec<Company>, CatalogError>;
    async fn get_company(&self, company_id: i64) -> Result<Company, CatalogError>;
}

/// Fixed in-memory catalog used for development and tests when no catalog
/// service is reachable.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    companies: Vec<Company>,
}

impl StaticCatalog {
    pub fn new(companies: Vec<Company>) -> Self {
        Self { companies }
    }

    /// Two-company sample set mirroring the shapes the live catalog serves.
    pub fn sample() -> Self {
        Self::new(vec![
            Company {
                id: 707,
                name: "Sample Company 1".to_string(),
                fiscal_start: "January".to_string(),
                reporting_frequencies: vec![Frequency::Month, Frequency::Quarter],
                sites: vec![
                    SiteRecord {
                        internal_site_code: "SITE001".to_string(),
                        site_name: "Plant One".to_string(),
                        parent_site_code: String::new(),
                        ownership: 100.0,
                    },
                    SiteRecord {
                        internal_site_code: "SITE002".to_string(),
                        site_name: "Plant Two".to_string(),
                        parent_site_code: "SITE001".to_string(),
                        ownership: 60.0,
                    },
                ],
                metric_codes: vec![MetricCode {
                    internal_code_id: "code-energy".to_string(),
                    code: "EN-1".to_string(),
                    name: "Energy consumption".to_string(),
                    function: None,
                }],
            },
            Company {
                id: 708,
                name: "Sample Company 2".to_string(),
                fiscal_start: "April".to_string(),
                reporting_frequencies: vec![Frequency::Annual],
                sites: vec![],
                metric_codes: vec![],
            },
        ])
    }
}

#[async_trait]
impl CompanyCatalog for StaticCatalog {
    async fn list_companies(&self) -> Result<Vec<Company>, CatalogError> {
        Ok(self.companies.clone())
    }

    async fn get_company(&self, company_id: i64) -> Result<Company, CatalogError> {
        self.companies
            .iter()
            .find(|c| c.id == company_id)
            .cloned()
            .ok_or(CatalogError::NotFound(company_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_static_catalog_lookup() {
        let catalog = StaticCatalog::sample();
        let company = catalog.get_company(707).await.unwrap();
        assert_eq!(company.sites.len(), 2);
        assert!(matches!(
            catalog.get_company(9999).await,
            Err(CatalogError::NotFound(9999))
        ));
    }
}
