//! Aggregation engine.
//!
//! One invocation covers one `(company, metric, site, frequency)` series:
//! raw observations are canonicalized into the collection matching the
//! reporting frequency, the series is extended with forecast records, and
//! coarser granularities are derived with the metric's combining function.
//! Every write is a delete-then-insert on the record's identity key, and the
//! series' output collections are cleared up front, so reruns converge to
//! the same state.

pub mod dimensions;
mod derive;

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::calendar;
use crate::forecast;
use crate::models::{
    safe_int, AggregatedRecord, CombineFn, Company, Frequency, Granularity, RawObservation,
};
use crate::store::RecordStore;

use self::derive::DerivedLabels;

/// Per-series result counts, folded into the job summary.
#[derive(Debug, Default, Clone, Copy)]
pub struct SeriesOutcome {
    pub actual_records: usize,
    pub forecast_records: usize,
    pub derived_records: usize,
}

impl SeriesOutcome {
    pub fn total(&self) -> usize {
        self.actual_records + self.forecast_records + self.derived_records
    }
}

pub struct AggregationEngine {
    store: Arc<RecordStore>,
}

impl AggregationEngine {
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self { store }
    }

    /// Aggregate one series. Missing raw data is not an error; the series is
    /// skipped with an empty outcome.
    pub async fn aggregate(
        &self,
        company: &Company,
        internal_code_id: &str,
        site_code: &str,
        year_floor: i32,
        frequency: Frequency,
    ) -> Result<SeriesOutcome> {
        match frequency {
            Frequency::Month => {
                self.aggregate_monthly(company, internal_code_id, site_code, year_floor)
                    .await
            }
            _ => {
                self.aggregate_periodic(company, internal_code_id, site_code, year_floor, frequency)
                    .await
            }
        }
    }

    /// Effective lower bound for the historical window: the configured floor,
    /// or the company's earliest data year when that is older.
    async fn min_year(&self, company_code: &str, year_floor: i32) -> Result<i32> {
        Ok(self
            .store
            .min_type_year(company_code)
            .await?
            .map(|y| y.min(year_floor))
            .unwrap_or(year_floor))
    }

    fn display_code(company: &Company, internal_code_id: &str) -> (String, String, CombineFn) {
        match company.metric_code(internal_code_id) {
            Some(code) => (
                code.code.clone(),
                code.name.clone(),
                CombineFn::resolve([code.function.as_deref()]),
            ),
            None => {
                warn!(
                    "No metric code entry for {} (company {}); emitting empty display fields",
                    internal_code_id, company.id
                );
                (String::new(), String::new(), CombineFn::Sum)
            }
        }
    }

    // ------------------------------------------------------------------
    // monthly reporters
    // ------------------------------------------------------------------

    async fn aggregate_monthly(
        &self,
        company: &Company,
        internal_code_id: &str,
        site_code: &str,
        year_floor: i32,
    ) -> Result<SeriesOutcome> {
        let company_code = company.id.to_string();
        let fiscal_start = company.fiscal_start.as_str();
        let start_idx = match calendar::month_index(fiscal_start) {
            Some(idx) => idx,
            None => {
                warn!(
                    "Company {} has unknown fiscal start {:?}; using January",
                    company_code, fiscal_start
                );
                1
            }
        };

        let raw = self
            .store
            .find_raw_actuals(&company_code, internal_code_id, site_code, Frequency::Month)
            .await?;
        if raw.is_empty() {
            debug!(
                "No monthly observations for ({}, {}, {:?})",
                company_code, internal_code_id, site_code
            );
            return Ok(SeriesOutcome::default());
        }

        let min_year = self.min_year(&company_code, year_floor).await?;

        // Keep rows inside the window; inside the earliest year, only months
        // from the fiscal start onward so the first fiscal segment opens at
        // the start month.
        let mut rows: Vec<RawObservation> = raw
            .into_iter()
            .filter(|r| match calendar::month_index(&r.month) {
                Some(m) => r.type_year > min_year || (r.type_year == min_year && m >= start_idx),
                None => {
                    warn!(
                        "Skipping observation with invalid month {:?} for ({}, {})",
                        r.month, company_code, internal_code_id
                    );
                    false
                }
            })
            .collect();
        rows.sort_by_key(|r| (r.type_year, calendar::month_index(&r.month).unwrap_or(0)));

        if rows.is_empty() {
            return Ok(SeriesOutcome::default());
        }

        for granularity in Granularity::ALL {
            self.store
                .clear_series(granularity, &company_code, internal_code_id, site_code)
                .await?;
        }

        let (code, code_name, combine_fn) = Self::display_code(company, internal_code_id);

        let mut outcome = SeriesOutcome::default();
        let mut history: Vec<f64> = Vec::with_capacity(rows.len());
        let mut consumed: Vec<i64> = Vec::with_capacity(rows.len());

        for row in &rows {
            let reporting_year = calendar::reporting_year(row.type_year, &row.month, fiscal_start)
                .unwrap_or(row.type_year);
            let qty = safe_int(&row.qty);

            let record = AggregatedRecord {
                company_code: company_code.clone(),
                site_code: site_code.to_string(),
                internal_code_id: internal_code_id.to_string(),
                code: code.clone(),
                code_name: code_name.clone(),
                type_year: row.type_year,
                reporting_year,
                month: row.month.clone(),
                quarter: String::new(),
                semi_annual: String::new(),
                qty: qty.to_string(),
                value: row.value,
                currency: row.currency.clone(),
                unit: row.unit.clone(),
                dimension: row.dimension.clone(),
                description: format!("{} {}", row.narration, row.url),
                ref_table: "raw".to_string(),
                is_forecast: false,
                created_at: Utc::now(),
            };
            self.store
                .replace_aggregated(Granularity::Monthly, &record)
                .await?;
            outcome.actual_records += 1;
            history.push(qty as f64);
            consumed.push(row.id);
        }
        self.store.mark_raw_aggregated(&consumed).await?;

        // Forecast extension: continue the month cycle past the last actual.
        let predictions = forecast::forecast(
            &history,
            Frequency::Month.forecast_horizon(),
            Frequency::Month.seasonality(),
        );
        let last = rows.last().expect("rows checked non-empty");
        let mut month = last.month.clone();
        let mut year = last.type_year;
        for prediction in predictions {
            month = calendar::next_month(&month).unwrap_or("January").to_string();
            if month == "January" {
                year += 1;
            }
            let reporting_year =
                calendar::reporting_year(year, &month, fiscal_start).unwrap_or(year);

            let record = AggregatedRecord {
                company_code: company_code.clone(),
                site_code: site_code.to_string(),
                internal_code_id: internal_code_id.to_string(),
                code: code.clone(),
                code_name: code_name.clone(),
                type_year: year,
                reporting_year,
                month: month.clone(),
                quarter: String::new(),
                semi_annual: String::new(),
                qty: (prediction as i64).to_string(),
                value: 0.0,
                currency: String::new(),
                unit: String::new(),
                dimension: Vec::new(),
                description: String::new(),
                ref_table: "prediction".to_string(),
                is_forecast: true,
                created_at: Utc::now(),
            };
            self.store
                .replace_aggregated(Granularity::Monthly, &record)
                .await?;
            outcome.forecast_records += 1;
        }

        // Re-read the canonical series and derive the coarser granularities.
        let mut series = self
            .store
            .find_series(Granularity::Monthly, &company_code, internal_code_id, site_code)
            .await?;
        series.sort_by_key(|r| (r.type_year, calendar::month_index(&r.month).unwrap_or(0)));

        for group in derive::group_by_quarter(&series) {
            let quarter = calendar::quarter_of(&group[0].month).unwrap_or("Q1");
            let record = derive::derived_record(
                &group,
                combine_fn,
                DerivedLabels {
                    quarter: quarter.to_string(),
                    semi_annual: String::new(),
                    reporting_year: None,
                },
                "monthly",
            );
            self.store
                .replace_aggregated(Granularity::Quarterly, &record)
                .await?;
            outcome.derived_records += 1;
        }

        for group in derive::group_by_semester(&series) {
            let semester = calendar::semester_of(&group[0].month).unwrap_or("H1");
            let record = derive::derived_record(
                &group,
                combine_fn,
                DerivedLabels {
                    quarter: String::new(),
                    semi_annual: semester.to_string(),
                    reporting_year: None,
                },
                "monthly",
            );
            self.store
                .replace_aggregated(Granularity::SemiAnnual, &record)
                .await?;
            outcome.derived_records += 1;
        }

        for group in derive::yearly_windows(&series, fiscal_start) {
            let record = derive::derived_record(
                &group,
                combine_fn,
                DerivedLabels {
                    quarter: String::new(),
                    semi_annual: String::new(),
                    reporting_year: None,
                },
                "monthly",
            );
            self.store
                .replace_aggregated(Granularity::Yearly, &record)
                .await?;
            outcome.derived_records += 1;
        }

        info!(
            "✅ Aggregated monthly series ({}, {}, {:?}): {} actual, {} forecast, {} derived",
            company_code,
            internal_code_id,
            site_code,
            outcome.actual_records,
            outcome.forecast_records,
            outcome.derived_records
        );
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // quarter / semi-annual / annual reporters
    // ------------------------------------------------------------------

    async fn aggregate_periodic(
        &self,
        company: &Company,
        internal_code_id: &str,
        site_code: &str,
        year_floor: i32,
        frequency: Frequency,
    ) -> Result<SeriesOutcome> {
        let company_code = company.id.to_string();
        let fiscal_start = company.fiscal_start.as_str();
        let granularity = frequency.granularity();

        let raw = self
            .store
            .find_raw_actuals(&company_code, internal_code_id, site_code, frequency)
            .await?;
        if raw.is_empty() {
            debug!(
                "No {} observations for ({}, {}, {:?})",
                frequency.as_str(),
                company_code,
                internal_code_id,
                site_code
            );
            return Ok(SeriesOutcome::default());
        }

        let min_year = self.min_year(&company_code, year_floor).await?;

        // Normalize the period label and drop rows outside the window.
        let mut rows: Vec<(RawObservation, &'static str)> = raw
            .into_iter()
            .filter(|r| r.type_year >= min_year)
            .filter_map(|r| {
                let label = match frequency {
                    Frequency::Quarter => calendar::normalize_quarter(&r.quarter),
                    Frequency::SemiAnnual => calendar::normalize_semester(&r.semi_annual),
                    _ => Some(""),
                };
                match label {
                    Some(label) => Some((r, label)),
                    None => {
                        warn!(
                            "Skipping observation with invalid {} label for ({}, {})",
                            frequency.as_str(),
                            company_code,
                            internal_code_id
                        );
                        None
                    }
                }
            })
            .collect();
        rows.sort_by_key(|(r, label)| (r.type_year, period_order(label)));

        if rows.is_empty() {
            return Ok(SeriesOutcome::default());
        }

        // Clear the target collection and everything derived from it.
        let downstream: &[Granularity] = match frequency {
            Frequency::Quarter => &[
                Granularity::Quarterly,
                Granularity::SemiAnnual,
                Granularity::Yearly,
            ],
            Frequency::SemiAnnual => &[Granularity::SemiAnnual, Granularity::Yearly],
            _ => &[Granularity::Yearly],
        };
        for g in downstream {
            self.store
                .clear_series(*g, &company_code, internal_code_id, site_code)
                .await?;
        }

        let (code, code_name, combine_fn) = Self::display_code(company, internal_code_id);

        let mut outcome = SeriesOutcome::default();
        let mut history: Vec<f64> = Vec::with_capacity(rows.len());
        let mut consumed: Vec<i64> = Vec::with_capacity(rows.len());

        for (row, label) in &rows {
            let reporting_year = periodic_reporting_year(row.type_year, label, fiscal_start);
            let qty = safe_int(&row.qty);

            let record = AggregatedRecord {
                company_code: company_code.clone(),
                site_code: site_code.to_string(),
                internal_code_id: internal_code_id.to_string(),
                code: code.clone(),
                code_name: code_name.clone(),
                type_year: row.type_year,
                reporting_year,
                month: row.month.clone(),
                quarter: if frequency == Frequency::Quarter {
                    label.to_string()
                } else {
                    String::new()
                },
                semi_annual: if frequency == Frequency::SemiAnnual {
                    label.to_string()
                } else {
                    String::new()
                },
                qty: qty.to_string(),
                value: row.value,
                currency: row.currency.clone(),
                unit: row.unit.clone(),
                dimension: row.dimension.clone(),
                description: format!("{} {}", row.narration, row.url),
                ref_table: "raw".to_string(),
                is_forecast: false,
                created_at: Utc::now(),
            };
            self.store.replace_aggregated(granularity, &record).await?;
            outcome.actual_records += 1;
            history.push(qty as f64);
            consumed.push(row.id);
        }
        self.store.mark_raw_aggregated(&consumed).await?;

        // Forecast extension through the period cycle.
        let predictions = forecast::forecast(
            &history,
            frequency.forecast_horizon(),
            frequency.seasonality(),
        );
        let last = rows.last().expect("rows checked non-empty");
        let mut label: String = last.1.to_string();
        let mut year = last.0.type_year;
        for prediction in predictions {
            match frequency {
                Frequency::Quarter => {
                    label = calendar::next_quarter(&label).to_string();
                    if label == "Q1" {
                        year += 1;
                    }
                }
                Frequency::SemiAnnual => {
                    label = calendar::next_semester(&label).to_string();
                    if label == "H1" {
                        year += 1;
                    }
                }
                _ => year += 1,
            }
            let reporting_year = periodic_reporting_year(year, &label, fiscal_start);

            let record = AggregatedRecord {
                company_code: company_code.clone(),
                site_code: site_code.to_string(),
                internal_code_id: internal_code_id.to_string(),
                code: code.clone(),
                code_name: code_name.clone(),
                type_year: year,
                reporting_year,
                month: String::new(),
                quarter: if frequency == Frequency::Quarter {
                    label.clone()
                } else {
                    String::new()
                },
                semi_annual: if frequency == Frequency::SemiAnnual {
                    label.clone()
                } else {
                    String::new()
                },
                qty: (prediction as i64).to_string(),
                value: 0.0,
                currency: String::new(),
                unit: String::new(),
                dimension: Vec::new(),
                description: String::new(),
                ref_table: "prediction".to_string(),
                is_forecast: true,
                created_at: Utc::now(),
            };
            self.store.replace_aggregated(granularity, &record).await?;
            outcome.forecast_records += 1;
        }

        // Fold upward: quarters into semesters and years, semesters into
        // years. Annual reporters stop at the write-through.
        match frequency {
            Frequency::Quarter => {
                let mut series = self
                    .store
                    .find_series(Granularity::Quarterly, &company_code, internal_code_id, site_code)
                    .await?;
                series.sort_by_key(|r| (r.type_year, period_order(&r.quarter)));

                for group in derive::chunks(&series, 2) {
                    let semester = calendar::quarter_start_month(&group[0].quarter)
                        .and_then(calendar::semester_of)
                        .unwrap_or("H1");
                    let record = derive::derived_record(
                        &group,
                        combine_fn,
                        DerivedLabels {
                            quarter: String::new(),
                            semi_annual: semester.to_string(),
                            reporting_year: None,
                        },
                        "quarterly",
                    );
                    self.store
                        .replace_aggregated(Granularity::SemiAnnual, &record)
                        .await?;
                    outcome.derived_records += 1;
                }

                for group in derive::chunks(&series, 4) {
                    let record = derive::derived_record(
                        &group,
                        combine_fn,
                        DerivedLabels {
                            quarter: String::new(),
                            semi_annual: String::new(),
                            reporting_year: None,
                        },
                        "quarterly",
                    );
                    self.store
                        .replace_aggregated(Granularity::Yearly, &record)
                        .await?;
                    outcome.derived_records += 1;
                }
            }
            Frequency::SemiAnnual => {
                let mut series = self
                    .store
                    .find_series(Granularity::SemiAnnual, &company_code, internal_code_id, site_code)
                    .await?;
                series.sort_by_key(|r| (r.type_year, period_order(&r.semi_annual)));

                for group in derive::chunks(&series, 2) {
                    let record = derive::derived_record(
                        &group,
                        combine_fn,
                        DerivedLabels {
                            quarter: String::new(),
                            semi_annual: String::new(),
                            reporting_year: None,
                        },
                        "semi_annual",
                    );
                    self.store
                        .replace_aggregated(Granularity::Yearly, &record)
                        .await?;
                    outcome.derived_records += 1;
                }
            }
            _ => {}
        }

        info!(
            "✅ Aggregated {} series ({}, {}, {:?}): {} actual, {} forecast, {} derived",
            frequency.as_str(),
            company_code,
            internal_code_id,
            site_code,
            outcome.actual_records,
            outcome.forecast_records,
            outcome.derived_records
        );
        Ok(outcome)
    }
}

/// Sort position of a period label within its year.
fn period_order(label: &str) -> u32 {
    match label {
        "Q1" | "H1" => 1,
        "Q2" => 2,
        "Q3" | "H2" => 3,
        "Q4" => 4,
        _ => 0,
    }
}

/// Fiscal reporting year for a labeled period, keyed on its first calendar
/// month (annual rows align with the fiscal start itself).
fn periodic_reporting_year(type_year: i32, label: &str, fiscal_start: &str) -> i32 {
    let anchor = calendar::quarter_start_month(label)
        .or_else(|| calendar::semester_start_month(label))
        .unwrap_or(fiscal_start);
    calendar::reporting_year(type_year, anchor, fiscal_start).unwrap_or(type_year)
}
