use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::info;

use crate::models::{
    AggregatedRecord, DimensionEntry, Frequency, Granularity, RawObservation, RollupRecord,
};

/// Typed access to the pipeline's document collections, one SQLite table per
/// collection: `raw`, the four granularity tables, and their `rollup_*`
/// counterparts.
#[derive(Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

/// Filter for the paginated rollup data API.
#[derive(Debug, Clone, Default)]
pub struct RollupFilter {
    pub company_code: Option<String>,
    pub type_year: Option<i32>,
    pub internal_code_id: Option<String>,
    pub limit: i64,
    pub skip: i64,
}

impl RecordStore {
    /// Open (creating if missing) the database at the given path and run
    /// migrations.
    pub async fn new(database_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = RecordStore { pool };
        store.run_migrations().await?;
        info!("Record store initialized at {}", database_path);
        Ok(store)
    }

    /// In-memory store for tests. A single pooled connection keeps the
    /// database alive for the store's lifetime.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(":memory:");
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = RecordStore { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS raw (
                id INTEGER PRIMARY KEY,
                company_code TEXT NOT NULL,
                site_code TEXT NOT NULL DEFAULT '',
                internal_code_id TEXT NOT NULL,
                obs_type TEXT NOT NULL DEFAULT 'actual',
                type_year INTEGER NOT NULL,
                month TEXT NOT NULL DEFAULT '',
                quarter TEXT NOT NULL DEFAULT '',
                semi_annual TEXT NOT NULL DEFAULT '',
                qty TEXT NOT NULL DEFAULT '',
                value REAL NOT NULL DEFAULT 0,
                currency TEXT NOT NULL DEFAULT '',
                unit TEXT NOT NULL DEFAULT '',
                dimension TEXT NOT NULL DEFAULT '[]',
                narration TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL DEFAULT '',
                is_aggregated INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_raw_series
             ON raw(company_code, internal_code_id, site_code)",
        )
        .execute(&self.pool)
        .await?;

        for granularity in Granularity::ALL {
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY,
                    company_code TEXT NOT NULL,
                    site_code TEXT NOT NULL DEFAULT '',
                    internal_code_id TEXT NOT NULL,
                    code TEXT NOT NULL DEFAULT '',
                    code_name TEXT NOT NULL DEFAULT '',
                    type_year INTEGER NOT NULL,
                    reporting_year INTEGER NOT NULL,
                    month TEXT NOT NULL DEFAULT '',
                    quarter TEXT NOT NULL DEFAULT '',
                    semi_annual TEXT NOT NULL DEFAULT '',
                    qty TEXT NOT NULL DEFAULT '',
                    value REAL NOT NULL DEFAULT 0,
                    currency TEXT NOT NULL DEFAULT '',
                    unit TEXT NOT NULL DEFAULT '',
                    dimension TEXT NOT NULL DEFAULT '[]',
                    description TEXT NOT NULL DEFAULT '',
                    ref_table TEXT NOT NULL DEFAULT '',
                    is_forecast INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                )",
                granularity.table()
            ))
            .execute(&self.pool)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_series
                 ON {0}(company_code, internal_code_id, site_code)",
                granularity.table()
            ))
            .execute(&self.pool)
            .await?;

            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY,
                    company_code TEXT NOT NULL,
                    site_code TEXT NOT NULL DEFAULT '',
                    internal_code_id TEXT NOT NULL,
                    code TEXT NOT NULL DEFAULT '',
                    code_name TEXT NOT NULL DEFAULT '',
                    type_year INTEGER NOT NULL,
                    reporting_year INTEGER NOT NULL,
                    month TEXT NOT NULL DEFAULT '',
                    quarter TEXT NOT NULL DEFAULT '',
                    semi_annual TEXT NOT NULL DEFAULT '',
                    qty TEXT NOT NULL DEFAULT '',
                    value REAL NOT NULL DEFAULT 0,
                    rollup_qty REAL NOT NULL DEFAULT 0,
                    rollup_value REAL NOT NULL DEFAULT 0,
                    site_ownership REAL NOT NULL DEFAULT 100,
                    created_at TEXT NOT NULL
                )",
                granularity.rollup_table()
            ))
            .execute(&self.pool)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_company
                 ON {0}(company_code, internal_code_id)",
                granularity.rollup_table()
            ))
            .execute(&self.pool)
            .await?;
        }

        info!("Record store migrations completed successfully");
        Ok(())
    }

    // ------------------------------------------------------------------
    // raw collection
    // ------------------------------------------------------------------

    /// Insert a raw observation (test fixtures and external writers).
    pub async fn insert_raw(&self, obs: &RawObservation) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO raw (
                company_code, site_code, internal_code_id, obs_type, type_year,
                month, quarter, semi_annual, qty, value, currency, unit,
                dimension, narration, url, is_aggregated, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&obs.company_code)
        .bind(&obs.site_code)
        .bind(&obs.internal_code_id)
        .bind(&obs.obs_type)
        .bind(obs.type_year)
        .bind(&obs.month)
        .bind(&obs.quarter)
        .bind(&obs.semi_annual)
        .bind(&obs.qty)
        .bind(obs.value)
        .bind(&obs.currency)
        .bind(&obs.unit)
        .bind(serde_json::to_string(&obs.dimension)?)
        .bind(&obs.narration)
        .bind(&obs.url)
        .bind(obs.is_aggregated)
        .bind(obs.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Actual observations for one series, restricted to rows that carry the
    /// period field the frequency expects (annual rows carry none).
    pub async fn find_raw_actuals(
        &self,
        company_code: &str,
        internal_code_id: &str,
        site_code: &str,
        frequency: Frequency,
    ) -> Result<Vec<RawObservation>> {
        let period_clause = match frequency {
            Frequency::Month => "month != ''",
            Frequency::Quarter => "quarter != ''",
            Frequency::SemiAnnual => "semi_annual != ''",
            Frequency::Annual => "month = '' AND quarter = '' AND semi_annual = ''",
        };

        let rows = sqlx::query(&format!(
            "SELECT * FROM raw
             WHERE company_code = ? AND internal_code_id = ? AND site_code = ?
               AND obs_type = 'actual' AND {}
             ORDER BY type_year",
            period_clause
        ))
        .bind(company_code)
        .bind(internal_code_id)
        .bind(site_code)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_raw).collect()
    }

    /// Flag consumed raw rows so external writers can tell them apart.
    pub async fn mark_raw_aggregated(&self, ids: &[i64]) -> Result<()> {
        for id in ids {
            sqlx::query("UPDATE raw SET is_aggregated = 1 WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Earliest calendar year with any raw data for the company.
    pub async fn min_type_year(&self, company_code: &str) -> Result<Option<i32>> {
        let row = sqlx::query("SELECT MIN(type_year) AS min_year FROM raw WHERE company_code = ?")
            .bind(company_code)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<Option<i32>, _>("min_year")?)
    }

    /// Metric codes that appear in the company's actual observations; used
    /// when the catalog carries no code list for the company.
    pub async fn distinct_metric_ids(&self, company_code: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT internal_code_id FROM raw
             WHERE company_code = ? AND obs_type = 'actual'
             ORDER BY internal_code_id",
        )
        .bind(company_code)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| Ok(r.try_get::<String, _>("internal_code_id")?))
            .collect()
    }

    // ------------------------------------------------------------------
    // aggregated collections
    // ------------------------------------------------------------------

    /// Delete-then-insert on the record's identity key. The key includes
    /// `is_forecast`, so forecast rows never displace actuals.
    pub async fn replace_aggregated(
        &self,
        granularity: Granularity,
        record: &AggregatedRecord,
    ) -> Result<()> {
        let table = granularity.table();
        match granularity.period_column() {
            Some(period_column) => {
                sqlx::query(&format!(
                    "DELETE FROM {} WHERE company_code = ? AND site_code = ?
                       AND internal_code_id = ? AND type_year = ? AND {} = ?
                       AND is_forecast = ?",
                    table, period_column
                ))
                .bind(&record.company_code)
                .bind(&record.site_code)
                .bind(&record.internal_code_id)
                .bind(record.type_year)
                .bind(record.period_label(granularity))
                .bind(record.is_forecast)
                .execute(&self.pool)
                .await?;
            }
            None => {
                // Yearly rows have no period label; the fiscal year is the
                // discriminator (two windows can share a calendar year).
                sqlx::query(&format!(
                    "DELETE FROM {} WHERE company_code = ? AND site_code = ?
                       AND internal_code_id = ? AND reporting_year = ?
                       AND is_forecast = ?",
                    table
                ))
                .bind(&record.company_code)
                .bind(&record.site_code)
                .bind(&record.internal_code_id)
                .bind(record.reporting_year)
                .bind(record.is_forecast)
                .execute(&self.pool)
                .await?;
            }
        }

        sqlx::query(&format!(
            "INSERT INTO {} (
                company_code, site_code, internal_code_id, code, code_name,
                type_year, reporting_year, month, quarter, semi_annual,
                qty, value, currency, unit, dimension, description,
                ref_table, is_forecast, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            table
        ))
        .bind(&record.company_code)
        .bind(&record.site_code)
        .bind(&record.internal_code_id)
        .bind(&record.code)
        .bind(&record.code_name)
        .bind(record.type_year)
        .bind(record.reporting_year)
        .bind(&record.month)
        .bind(&record.quarter)
        .bind(&record.semi_annual)
        .bind(&record.qty)
        .bind(record.value)
        .bind(&record.currency)
        .bind(&record.unit)
        .bind(serde_json::to_string(&record.dimension)?)
        .bind(&record.description)
        .bind(&record.ref_table)
        .bind(record.is_forecast)
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Wipe every record of a series from one granularity collection;
    /// run-start cleanup so reruns cannot leave stale periods behind.
    pub async fn clear_series(
        &self,
        granularity: Granularity,
        company_code: &str,
        internal_code_id: &str,
        site_code: &str,
    ) -> Result<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE company_code = ? AND internal_code_id = ? AND site_code = ?",
            granularity.table()
        ))
        .bind(company_code)
        .bind(internal_code_id)
        .bind(site_code)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// All records of one series in a granularity collection (unordered;
    /// callers sort by calendar position).
    pub async fn find_series(
        &self,
        granularity: Granularity,
        company_code: &str,
        internal_code_id: &str,
        site_code: &str,
    ) -> Result<Vec<AggregatedRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM {}
             WHERE company_code = ? AND internal_code_id = ? AND site_code = ?
             ORDER BY type_year, id",
            granularity.table()
        ))
        .bind(company_code)
        .bind(internal_code_id)
        .bind(site_code)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_aggregated).collect()
    }

    /// Every record of a company in a granularity collection (rollup input).
    pub async fn find_for_company(
        &self,
        granularity: Granularity,
        company_code: &str,
    ) -> Result<Vec<AggregatedRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM {} WHERE company_code = ? ORDER BY type_year, id",
            granularity.table()
        ))
        .bind(company_code)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_aggregated).collect()
    }

    // ------------------------------------------------------------------
    // rollup collections
    // ------------------------------------------------------------------

    /// Delete-then-insert a rollup record on the same identity key as its
    /// aggregate counterpart.
    pub async fn replace_rollup(
        &self,
        granularity: Granularity,
        record: &RollupRecord,
    ) -> Result<()> {
        let table = granularity.rollup_table();
        let period_label = match granularity {
            Granularity::Monthly => record.month.as_str(),
            Granularity::Quarterly => record.quarter.as_str(),
            Granularity::SemiAnnual => record.semi_annual.as_str(),
            Granularity::Yearly => "",
        };

        match granularity.period_column() {
            Some(period_column) => {
                sqlx::query(&format!(
                    "DELETE FROM {} WHERE company_code = ? AND site_code = ?
                       AND internal_code_id = ? AND type_year = ? AND {} = ?",
                    table, period_column
                ))
                .bind(&record.company_code)
                .bind(&record.site_code)
                .bind(&record.internal_code_id)
                .bind(record.type_year)
                .bind(period_label)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(&format!(
                    "DELETE FROM {} WHERE company_code = ? AND site_code = ?
                       AND internal_code_id = ? AND reporting_year = ?",
                    table
                ))
                .bind(&record.company_code)
                .bind(&record.site_code)
                .bind(&record.internal_code_id)
                .bind(record.reporting_year)
                .execute(&self.pool)
                .await?;
            }
        }

        sqlx::query(&format!(
            "INSERT INTO {} (
                company_code, site_code, internal_code_id, code, code_name,
                type_year, reporting_year, month, quarter, semi_annual,
                qty, value, rollup_qty, rollup_value, site_ownership, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            table
        ))
        .bind(&record.company_code)
        .bind(&record.site_code)
        .bind(&record.internal_code_id)
        .bind(&record.code)
        .bind(&record.code_name)
        .bind(record.type_year)
        .bind(record.reporting_year)
        .bind(&record.month)
        .bind(&record.quarter)
        .bind(&record.semi_annual)
        .bind(&record.qty)
        .bind(record.value)
        .bind(record.rollup_qty)
        .bind(record.rollup_value)
        .bind(record.site_ownership)
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record count in one rollup collection, optionally per company.
    pub async fn count_rollups(
        &self,
        granularity: Granularity,
        company_code: Option<&str>,
    ) -> Result<i64> {
        let table = granularity.rollup_table();
        let count: i64 = match company_code {
            Some(company) => {
                sqlx::query(&format!(
                    "SELECT COUNT(*) AS n FROM {} WHERE company_code = ?",
                    table
                ))
                .bind(company)
                .fetch_one(&self.pool)
                .await?
                .try_get("n")?
            }
            None => sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", table))
                .fetch_one(&self.pool)
                .await?
                .try_get("n")?,
        };
        Ok(count)
    }

    /// Paginated rollup records plus the total matching count.
    pub async fn find_rollups(
        &self,
        granularity: Granularity,
        filter: &RollupFilter,
    ) -> Result<(Vec<RollupRecord>, i64)> {
        let table = granularity.rollup_table();

        let mut conditions = vec!["1 = 1".to_string()];
        if filter.company_code.is_some() {
            conditions.push("company_code = ?".to_string());
        }
        if filter.type_year.is_some() {
            conditions.push("type_year = ?".to_string());
        }
        if filter.internal_code_id.is_some() {
            conditions.push("internal_code_id = ?".to_string());
        }
        let where_clause = conditions.join(" AND ");

        let count_sql = format!("SELECT COUNT(*) AS n FROM {} WHERE {}", table, where_clause);
        let data_sql = format!(
            "SELECT * FROM {} WHERE {} ORDER BY type_year, site_code, id LIMIT ? OFFSET ?",
            table, where_clause
        );
        let mut count_query = sqlx::query(&count_sql);
        let mut data_query = sqlx::query(&data_sql);

        if let Some(company) = &filter.company_code {
            count_query = count_query.bind(company.clone());
            data_query = data_query.bind(company.clone());
        }
        if let Some(year) = filter.type_year {
            count_query = count_query.bind(year);
            data_query = data_query.bind(year);
        }
        if let Some(code) = &filter.internal_code_id {
            count_query = count_query.bind(code.clone());
            data_query = data_query.bind(code.clone());
        }
        data_query = data_query.bind(filter.limit).bind(filter.skip);

        let total: i64 = count_query.fetch_one(&self.pool).await?.try_get("n")?;
        let rows = data_query.fetch_all(&self.pool).await?;
        let records = rows
            .iter()
            .map(row_to_rollup)
            .collect::<Result<Vec<_>>>()?;

        Ok((records, total))
    }
}

fn parse_created_at(row: &SqliteRow) -> Result<DateTime<Utc>> {
    let raw: String = row.try_get("created_at")?;
    Ok(DateTime::parse_from_rfc3339(&raw)?.with_timezone(&Utc))
}

fn parse_dimension(row: &SqliteRow) -> Result<Vec<DimensionEntry>> {
    let raw: String = row.try_get("dimension")?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&raw).unwrap_or_default())
}

fn row_to_raw(row: &SqliteRow) -> Result<RawObservation> {
    Ok(RawObservation {
        id: row.try_get("id")?,
        company_code: row.try_get("company_code")?,
        site_code: row.try_get("site_code")?,
        internal_code_id: row.try_get("internal_code_id")?,
        obs_type: row.try_get("obs_type")?,
        type_year: row.try_get("type_year")?,
        month: row.try_get("month")?,
        quarter: row.try_get("quarter")?,
        semi_annual: row.try_get("semi_annual")?,
        qty: row.try_get("qty")?,
        value: row.try_get("value")?,
        currency: row.try_get("currency")?,
        unit: row.try_get("unit")?,
        dimension: parse_dimension(row)?,
        narration: row.try_get("narration")?,
        url: row.try_get("url")?,
        is_aggregated: row.try_get("is_aggregated")?,
        created_at: parse_created_at(row)?,
    })
}

fn row_to_aggregated(row: &SqliteRow) -> Result<AggregatedRecord> {
    Ok(AggregatedRecord {
        company_code: row.try_get("company_code")?,
        site_code: row.try_get("site_code")?,
        internal_code_id: row.try_get("internal_code_id")?,
        code: row.try_get("code")?,
        code_name: row.try_get("code_name")?,
        type_year: row.try_get("type_year")?,
        reporting_year: row.try_get("reporting_year")?,
        month: row.try_get("month")?,
        quarter: row.try_get("quarter")?,
        semi_annual: row.try_get("semi_annual")?,
        qty: row.try_get("qty")?,
        value: row.try_get("value")?,
        currency: row.try_get("currency")?,
        unit: row.try_get("unit")?,
        dimension: parse_dimension(row)?,
        description: row.try_get("description")?,
        ref_table: row.try_get("ref_table")?,
        is_forecast: row.try_get("is_forecast")?,
        created_at: parse_created_at(row)?,
    })
}

fn row_to_rollup(row: &SqliteRow) -> Result<RollupRecord> {
    Ok(RollupRecord {
        company_code: row.try_get("company_code")?,
        site_code: row.try_get("site_code")?,
        internal_code_id: row.try_get("internal_code_id")?,
        code: row.try_get("code")?,
        code_name: row.try_get("code_name")?,
        type_year: row.try_get("type_year")?,
        reporting_year: row.try_get("reporting_year")?,
        month: row.try_get("month")?,
        quarter: row.try_get("quarter")?,
        semi_annual: row.try_get("semi_annual")?,
        qty: row.try_get("qty")?,
        value: row.try_get("value")?,
        rollup_qty: row.try_get("rollup_qty")?,
        rollup_value: row.try_get("rollup_value")?,
        site_ownership: row.try_get("site_ownership")?,
        created_at: parse_created_at(row)?,
    })
}
