//! Shared fixtures for the integration tests.

use chrono::Utc;
use esg_pipeline::models::{
    Company, Frequency, MetricCode, RawObservation, SiteRecord,
};
use esg_pipeline::store::RecordStore;

pub const COMPANY: &str = "482";
pub const METRIC: &str = "c1";

/// Company 482 with a configurable fiscal start and a two-level site tree:
/// root R (100%) owning A (50%) and B (40%).
pub fn test_company(fiscal_start: &str, function: Option<&str>) -> Company {
    Company {
        id: 482,
        name: "Acme Industrial".to_string(),
        fiscal_start: fiscal_start.to_string(),
        reporting_frequencies: vec![Frequency::Month],
        sites: vec![
            site("R", "", 100.0),
            site("A", "R", 50.0),
            site("B", "R", 40.0),
        ],
        metric_codes: vec![MetricCode {
            internal_code_id: METRIC.to_string(),
            code: "EN-1".to_string(),
            name: "Energy consumption".to_string(),
            function: function.map(str::to_string),
        }],
    }
}

pub fn site(code: &str, parent: &str, ownership: f64) -> SiteRecord {
    SiteRecord {
        internal_site_code: code.to_string(),
        site_name: format!("Site {}", code),
        parent_site_code: parent.to_string(),
        ownership,
    }
}

pub fn raw_month(site_code: &str, month: &str, year: i32, qty: &str) -> RawObservation {
    RawObservation {
        id: 0,
        company_code: COMPANY.to_string(),
        site_code: site_code.to_string(),
        internal_code_id: METRIC.to_string(),
        obs_type: "actual".to_string(),
        type_year: year,
        month: month.to_string(),
        quarter: String::new(),
        semi_annual: String::new(),
        qty: qty.to_string(),
        value: 1.0,
        currency: "EUR".to_string(),
        unit: "t".to_string(),
        dimension: Vec::new(),
        narration: "meter".to_string(),
        url: "http://docs".to_string(),
        is_aggregated: false,
        created_at: Utc::now(),
    }
}

/// Seed every month of a calendar year with the same quantity.
pub async fn seed_year(store: &RecordStore, site_code: &str, year: i32, qty: &str) {
    for month in esg_pipeline::calendar::MONTHS {
        store
            .insert_raw(&raw_month(site_code, month, year, qty))
            .await
            .unwrap();
    }
}
