use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{CatalogError, CompanyCatalog, RetryPolicy};
use crate::models::{Company, Frequency, MetricCode, SiteRecord};

/// HTTP client for the company catalog API.
pub struct CatalogClient {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl CatalogClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        Self::with_retry(base_url, RetryPolicy::default())
    }

    pub fn with_retry(base_url: &str, retry: RetryPolicy) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("esg-pipeline/1.0")
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        })
    }

    /// GET with bounded exponential backoff. Non-2xx statuses and transport
    /// errors both count as transient.
    async fn get_json(&self, path: &str) -> Result<Value, CatalogError> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_error = String::new();

        for attempt in 0..self.retry.attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.delay(attempt - 1)).await;
                info!("Retrying catalog request {} (attempt {})", url, attempt + 1);
            }

            debug!("Making catalog request to: {}", url);
            match self.client.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<Value>()
                        .await
                        .map_err(|e| CatalogError::Malformed(e.to_string()));
                }
                Ok(response) => {
                    last_error = format!("status {}", response.status());
                    warn!("Catalog request {} failed: {}", url, last_error);
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!("Catalog request {} failed: {}", url, last_error);
                }
            }
        }

        Err(CatalogError::Unavailable(last_error))
    }

    /// Fiscal start month from the per-company detail endpoint; January when
    /// the catalog has nothing better.
    async fn fetch_fiscal_start(&self, company_id: i64) -> Option<String> {
        let payload = self
            .get_json(&format!("/company/data/{}", company_id))
            .await
            .ok()?;
        let month = payload
            .get("data")?
            .get("company")?
            .get("month")?
            .as_str()?
            .trim()
            .to_string();
        if month.is_empty() {
            None
        } else {
            Some(month)
        }
    }
}

#[async_trait]
impl CompanyCatalog for CatalogClient {
    async fn list_companies(&self) -> Result<Vec<Company>, CatalogError> {
        let payload = self.get_json("/company/data").await?;
        let parsed: CompanyListResponse = serde_json::from_value(payload)
            .map_err(|e| CatalogError::Malformed(e.to_string()))?;

        let companies: Vec<Company> = parsed
            .companies
            .into_iter()
            .map(WireCompany::into_company)
            .collect();
        info!("✅ Fetched {} companies from catalog", companies.len());
        Ok(companies)
    }

    async fn get_company(&self, company_id: i64) -> Result<Company, CatalogError> {
        // The per-company detail endpoint only carries the fiscal month and
        // frequency; sites and metric codes exist solely in the roster
        // payload, so a single-company lookup still fetches the full list.
        let mut company = self
            .list_companies()
            .await?
            .into_iter()
            .find(|c| c.id == company_id)
            .ok_or(CatalogError::NotFound(company_id))?;

        // The detail endpoint is authoritative for the fiscal start month.
        if let Some(month) = self.fetch_fiscal_start(company_id).await {
            company.fiscal_start = month;
        }
        Ok(company)
    }
}

#[derive(Debug, Deserialize)]
struct CompanyListResponse {
    #[serde(default)]
    companies: Vec<WireCompany>,
}

#[derive(Debug, Deserialize)]
struct WireCompany {
    id: i64,
    #[serde(default, alias = "name")]
    company_name: String,
    #[serde(default)]
    month: Option<String>,
    #[serde(default)]
    reporting_frequency: Option<String>,
    #[serde(default)]
    company_sites: Vec<WireSite>,
    #[serde(default)]
    company_codes: Vec<WireCode>,
}

#[derive(Debug, Deserialize)]
struct WireSite {
    #[serde(default)]
    internal_site_code: String,
    #[serde(default)]
    site_name: String,
    #[serde(default, alias = "parentSiteCode")]
    parent_site_code: String,
    #[serde(default)]
    ownership: Value,
}

#[derive(Debug, Deserialize)]
struct WireCode {
    #[serde(default)]
    internal_code_id: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    function: Option<String>,
}

impl WireCompany {
    fn into_company(self) -> Company {
        let fiscal_start = match self.month.as_deref().map(str::trim) {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => {
                warn!("Company {} has no fiscal start month, using January", self.id);
                "January".to_string()
            }
        };

        let reporting_frequencies = self
            .reporting_frequency
            .as_deref()
            .unwrap_or("")
            .split(',')
            .filter(|t| !t.trim().is_empty())
            .filter_map(|t| {
                let parsed = Frequency::parse(t);
                if parsed.is_none() {
                    warn!("Company {}: invalid reporting frequency {:?}", self.id, t);
                }
                parsed
            })
            .collect();

        let sites = self
            .company_sites
            .into_iter()
            .filter(|s| !s.internal_site_code.is_empty())
            .map(|s| SiteRecord {
                ownership: parse_ownership(&s.ownership),
                internal_site_code: s.internal_site_code,
                site_name: s.site_name,
                parent_site_code: s.parent_site_code.trim().to_string(),
            })
            .collect();

        let metric_codes = self
            .company_codes
            .into_iter()
            .filter(|c| !c.internal_code_id.is_empty())
            .map(|c| MetricCode {
                internal_code_id: c.internal_code_id,
                code: c.code,
                name: c.name,
                function: c.function.filter(|f| !f.trim().is_empty()),
            })
            .collect();

        Company {
            id: self.id,
            name: self.company_name,
            fiscal_start,
            reporting_frequencies,
            sites,
            metric_codes,
        }
    }
}

/// Ownership percent from a JSON field that may be a number, a numeric
/// string, or missing entirely; anything unusable defaults to 100.
fn parse_ownership(raw: &Value) -> f64 {
    match raw {
        Value::Number(n) => n.as_f64().unwrap_or(100.0),
        Value::String(s) if !s.trim().is_empty() => s.trim().parse().unwrap_or(100.0),
        _ => 100.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn list_payload() -> Value {
        json!({
            "companies": [
                {
                    "id": 482,
                    "company_name": "Acme Industrial",
                    "month": "April",
                    "reporting_frequency": "month,quater",
                    "company_sites": [
                        {
                            "internal_site_code": "HQ",
                            "site_name": "Headquarters",
                            "parentSiteCode": "",
                            "ownership": ""
                        },
                        {
                            "internal_site_code": "P1",
                            "site_name": "Plant 1",
                            "parentSiteCode": "HQ",
                            "ownership": "37.5"
                        }
                    ],
                    "company_codes": [
                        {"internal_code_id": "c1", "code": "EN-1", "name": "Energy", "function": "average"}
                    ]
                }
            ]
        })
    }

    #[tokio::test]
    async fn test_list_companies_parses_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/company/data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(list_payload()))
            .mount(&server)
            .await;

        let client = CatalogClient::new(&server.uri()).unwrap();
        let companies = client.list_companies().await.unwrap();

        assert_eq!(companies.len(), 1);
        let company = &companies[0];
        assert_eq!(company.fiscal_start, "April");
        // "quater" is normalized to the quarter frequency.
        assert_eq!(
            company.reporting_frequencies,
            vec![Frequency::Month, Frequency::Quarter]
        );
        // Empty ownership defaults to 100, numeric strings parse through.
        assert_eq!(company.sites[0].ownership, 100.0);
        assert_eq!(company.sites[1].ownership, 37.5);
        assert_eq!(company.metric_codes[0].function.as_deref(), Some("average"));
    }

    #[tokio::test]
    async fn test_get_company_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/company/data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"companies": []})))
            .mount(&server)
            .await;

        let client = CatalogClient::new(&server.uri()).unwrap();
        assert!(matches!(
            client.get_company(5).await,
            Err(CatalogError::NotFound(5))
        ));
    }

    #[tokio::test]
    async fn test_unavailable_after_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/company/data"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let retry = RetryPolicy {
            attempts: 3,
            base_delay: std::time::Duration::from_millis(5),
            multiplier: 2.0,
        };
        let client = CatalogClient::with_retry(&server.uri(), retry).unwrap();
        assert!(matches!(
            client.list_companies().await,
            Err(CatalogError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_detail_overrides_fiscal_start() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/company/data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(list_payload()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/company/data/482"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"company": {"month": "July", "reporting_frequency": "month"}}
            })))
            .mount(&server)
            .await;

        let client = CatalogClient::new(&server.uri()).unwrap();
        let company = client.get_company(482).await.unwrap();
        assert_eq!(company.fiscal_start, "July");
    }
}
