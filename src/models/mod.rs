use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A company as resolved from the catalog API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub id: i64,
    pub name: String,
    /// Fiscal start month name; "January" when the catalog omits it.
    pub fiscal_start: String,
    pub reporting_frequencies: Vec<Frequency>,
    pub sites: Vec<SiteRecord>,
    pub metric_codes: Vec<MetricCode>,
}

impl Company {
    /// Metric code entry by id, if the catalog knows it.
    pub fn metric_code(&self, internal_code_id: &str) -> Option<&MetricCode> {
        self.metric_codes
            .iter()
            .find(|c| c.internal_code_id == internal_code_id)
    }

    /// The site codes the aggregation loop visits: the company-level series
    /// (empty site code) first, then every declared site.
    pub fn site_codes(&self) -> Vec<String> {
        let mut codes = vec![String::new()];
        codes.extend(self.sites.iter().map(|s| s.internal_site_code.clone()));
        codes
    }
}

/// Flat site entry from the catalog; the rollup module assembles these into
/// a forest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteRecord {
    pub internal_site_code: String,
    pub site_name: String,
    /// Empty means root.
    pub parent_site_code: String,
    /// Percent in [0, 100]; parse failures default to 100.
    pub ownership: f64,
}

/// Metric code metadata: display code/name plus the combining function used
/// when folding finer granularities into coarser ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricCode {
    pub internal_code_id: String,
    pub code: String,
    pub name: String,
    pub function: Option<String>,
}

/// Reporting frequency a company declares for its raw observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Month,
    Quarter,
    SemiAnnual,
    Annual,
}

impl Frequency {
    /// Parse a single catalog frequency token. The misspelled "quater" still
    /// appears in live catalog data and is accepted.
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim() {
            "month" => Some(Self::Month),
            "quarter" | "quater" => Some(Self::Quarter),
            "semi_annual" => Some(Self::SemiAnnual),
            "annual" => Some(Self::Annual),
            _ => None,
        }
    }

    /// Number of future periods requested from the forecasting driver.
    pub fn forecast_horizon(self) -> usize {
        match self {
            Self::Month => 35,
            Self::Quarter => 11,
            Self::SemiAnnual => 11,
            Self::Annual => 5,
        }
    }

    /// Seasonality hint for the forecasting driver; 0 disables seasonal
    /// candidates.
    pub fn seasonality(self) -> usize {
        match self {
            Self::Month => 12,
            Self::Quarter => 4,
            Self::SemiAnnual => 2,
            Self::Annual => 0,
        }
    }

    /// The granularity this frequency's raw rows land in.
    pub fn granularity(self) -> Granularity {
        match self {
            Self::Month => Granularity::Monthly,
            Self::Quarter => Granularity::Quarterly,
            Self::SemiAnnual => Granularity::SemiAnnual,
            Self::Annual => Granularity::Yearly,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Month => "month",
            Self::Quarter => "quarter",
            Self::SemiAnnual => "semi_annual",
            Self::Annual => "annual",
        }
    }
}

/// Storage granularity; one table per variant, plus a parallel rollup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Monthly,
    Quarterly,
    SemiAnnual,
    Yearly,
}

impl Granularity {
    pub const ALL: [Granularity; 4] = [
        Granularity::Monthly,
        Granularity::Quarterly,
        Granularity::SemiAnnual,
        Granularity::Yearly,
    ];

    pub fn table(self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::SemiAnnual => "semi_annual",
            Self::Yearly => "yearly",
        }
    }

    pub fn rollup_table(self) -> &'static str {
        match self {
            Self::Monthly => "rollup_monthly",
            Self::Quarterly => "rollup_quarterly",
            Self::SemiAnnual => "rollup_semi_annual",
            Self::Yearly => "rollup_yearly",
        }
    }

    /// Column holding the period label; yearly rows have none.
    pub fn period_column(self) -> Option<&'static str> {
        match self {
            Self::Monthly => Some("month"),
            Self::Quarterly => Some("quarter"),
            Self::SemiAnnual => Some("semi_annual"),
            Self::Yearly => None,
        }
    }

    /// HTTP query spelling used by the rollup data API.
    pub fn from_api_name(name: &str) -> Option<Self> {
        match name {
            "monthly" => Some(Self::Monthly),
            "quarterly" => Some(Self::Quarterly),
            "bi_annual" => Some(Self::SemiAnnual),
            "yearly" => Some(Self::Yearly),
            _ => None,
        }
    }

    pub fn api_name(self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::SemiAnnual => "bi_annual",
            Self::Yearly => "yearly",
        }
    }
}

/// Combining function applied when folding a group of records into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineFn {
    Sum,
    Average,
    Last,
}

impl CombineFn {
    /// Resolve from the metric-code declarations in play: the first non-null
    /// `function` wins, defaulting to sum.
    pub fn resolve<'a, I>(declarations: I) -> Self
    where
        I: IntoIterator<Item = Option<&'a str>>,
    {
        for decl in declarations.into_iter().flatten() {
            return Self::parse(decl);
        }
        Self::Sum
    }

    pub fn parse(token: &str) -> Self {
        match token {
            "average" => Self::Average,
            // "list" is the catalog's historical name for last-value-wins.
            "last" | "list" => Self::Last,
            _ => Self::Sum,
        }
    }
}

/// One raw observation as written by the external ingestion path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawObservation {
    pub id: i64,
    pub company_code: String,
    pub site_code: String,
    pub internal_code_id: String,
    /// "actual", "baselinedata" or "target"; aggregation consumes actuals.
    pub obs_type: String,
    pub type_year: i32,
    pub month: String,
    pub quarter: String,
    pub semi_annual: String,
    pub qty: String,
    pub value: f64,
    pub currency: String,
    pub unit: String,
    pub dimension: Vec<DimensionEntry>,
    pub narration: String,
    pub url: String,
    pub is_aggregated: bool,
    pub created_at: DateTime<Utc>,
}

/// One multi-dimensional attribute tuple attached to an observation.
///
/// `qty` and `value` arrive as either numbers or numeric strings, so both
/// stay as raw JSON values until the merge parses them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionEntry {
    #[serde(default)]
    pub details: Vec<DimensionDetail>,
    #[serde(default)]
    pub qty: Value,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value1: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DimensionDetail {
    pub key: String,
    pub value: String,
}

/// Canonical record in one of the four granularity collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedRecord {
    pub company_code: String,
    pub site_code: String,
    pub internal_code_id: String,
    pub code: String,
    pub code_name: String,
    /// Calendar year of the first member of the group.
    pub type_year: i32,
    /// Fiscal year per the company's start month.
    pub reporting_year: i32,
    /// Month name, or hyphen-joined member months for derived records.
    pub month: String,
    pub quarter: String,
    pub semi_annual: String,
    pub qty: String,
    pub value: f64,
    pub currency: String,
    pub unit: String,
    pub dimension: Vec<DimensionEntry>,
    pub description: String,
    /// Collection the record was derived from, or "prediction".
    pub ref_table: String,
    pub is_forecast: bool,
    pub created_at: DateTime<Utc>,
}

impl AggregatedRecord {
    /// Period label under the given granularity ("" for yearly).
    pub fn period_label(&self, granularity: Granularity) -> &str {
        match granularity {
            Granularity::Monthly => &self.month,
            Granularity::Quarterly => &self.quarter,
            Granularity::SemiAnnual => &self.semi_annual,
            Granularity::Yearly => "",
        }
    }
}

/// Per-site rollup output: the node's own figures plus the ownership-weighted
/// totals contributed by its descendants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollupRecord {
    pub company_code: String,
    pub site_code: String,
    pub internal_code_id: String,
    pub code: String,
    pub code_name: String,
    pub type_year: i32,
    pub reporting_year: i32,
    pub month: String,
    pub quarter: String,
    pub semi_annual: String,
    pub qty: String,
    pub value: f64,
    pub rollup_qty: f64,
    pub rollup_value: f64,
    pub site_ownership: f64,
    pub created_at: DateTime<Utc>,
}

/// Runtime configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub catalog_url: String,
    pub database_path: String,
    pub http_port: u16,
    pub max_concurrent_companies: usize,
    pub job_deadline_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if it exists

        let catalog_url = std::env::var("CATALOG_URL")
            .or_else(|_| std::env::var("COMPANY_DATA_URL"))
            .map_err(|_| {
                anyhow::anyhow!("CATALOG_URL (or COMPANY_DATA_URL) environment variable required")
            })?;

        Ok(Config {
            catalog_url,
            database_path: std::env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "esg_pipeline.db".to_string()),
            http_port: std::env::var("HTTP_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            max_concurrent_companies: std::env::var("MAX_CONCURRENT_COMPANIES")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .unwrap_or(4),
            job_deadline_secs: std::env::var("JOB_DEADLINE_SECS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .unwrap_or(3600),
        })
    }
}

/// Parse a possibly string-encoded numeric, truncating to an integer;
/// non-numeric input counts as zero.
pub fn safe_int(raw: &str) -> i64 {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return 0;
    }
    trimmed.parse::<f64>().map(|v| v as i64).unwrap_or(0)
}

/// Same parse, keeping the fractional part.
pub fn safe_float(raw: &str) -> f64 {
    raw.trim().parse::<f64>().unwrap_or(0.0)
}

/// Safe integer parse of a JSON value that may be a number or a numeric
/// string.
pub fn safe_int_value(raw: &Value) -> i64 {
    match raw {
        Value::Number(n) => n.as_f64().map(|v| v as i64).unwrap_or(0),
        Value::String(s) => safe_int(s),
        _ => 0,
    }
}
