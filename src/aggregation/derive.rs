//! Grouping and folding of finer-granularity records into coarser ones.

use chrono::Utc;

use super::dimensions::merge_dimensions;
use crate::calendar;
use crate::models::{safe_int, AggregatedRecord, CombineFn, DimensionEntry};

/// Apply the combining function to a group, returning the folded
/// `(qty, value)` pair. Sum and average parse quantities as integers
/// (non-numeric counts as zero); last keeps the final member verbatim.
pub fn combine(members: &[&AggregatedRecord], combine_fn: CombineFn) -> (String, f64) {
    match combine_fn {
        CombineFn::Sum => {
            let qty: i64 = members.iter().map(|r| safe_int(&r.qty)).sum();
            let value: i64 = members.iter().map(|r| r.value.trunc() as i64).sum();
            (qty.to_string(), value as f64)
        }
        CombineFn::Average => {
            let n = members.len() as f64;
            let qty: f64 = members.iter().map(|r| safe_int(&r.qty) as f64).sum::<f64>() / n;
            let value: f64 = members.iter().map(|r| r.value.trunc()).sum::<f64>() / n;
            (format_qty(qty), value)
        }
        CombineFn::Last => {
            let last = members[members.len() - 1];
            (last.qty.clone(), last.value)
        }
    }
}

/// Stringify a quantity, dropping a trailing ".0" for whole numbers.
pub fn format_qty(qty: f64) -> String {
    if qty.fract() == 0.0 {
        format!("{}", qty as i64)
    } else {
        format!("{}", qty)
    }
}

/// Group consecutive monthly records by `(type_year, calendar quarter)`.
/// Edge groups may hold fewer than three months.
pub fn group_by_quarter(records: &[AggregatedRecord]) -> Vec<Vec<&AggregatedRecord>> {
    group_consecutive(records, 3, |r| {
        calendar::quarter_of(&r.month).map(|q| (r.type_year, q))
    })
}

/// Group consecutive monthly records by `(type_year, calendar semester)`.
pub fn group_by_semester(records: &[AggregatedRecord]) -> Vec<Vec<&AggregatedRecord>> {
    group_consecutive(records, 6, |r| {
        calendar::semester_of(&r.month).map(|s| (r.type_year, s))
    })
}

fn group_consecutive<'a, K, F>(
    records: &'a [AggregatedRecord],
    max_len: usize,
    key: F,
) -> Vec<Vec<&'a AggregatedRecord>>
where
    K: PartialEq,
    F: Fn(&AggregatedRecord) -> Option<K>,
{
    let mut groups: Vec<Vec<&AggregatedRecord>> = Vec::new();
    let mut current: Vec<&AggregatedRecord> = Vec::new();
    let mut current_key: Option<K> = None;

    for record in records {
        let record_key = match key(record) {
            Some(k) => k,
            None => continue,
        };
        let boundary = current.len() >= max_len
            || current_key.as_ref().map(|k| *k != record_key).unwrap_or(false);
        if boundary && !current.is_empty() {
            groups.push(std::mem::take(&mut current));
        }
        current_key = Some(record_key);
        current.push(record);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Fiscal-year windows over monthly records: the first window runs until the
/// next fiscal start month, every later window is a full 12 months.
pub fn yearly_windows<'a>(
    records: &'a [AggregatedRecord],
    fiscal_start: &str,
) -> Vec<Vec<&'a AggregatedRecord>> {
    let mut groups = Vec::new();
    if records.is_empty() {
        return groups;
    }
    let mut window =
        calendar::first_window_len(fiscal_start, &records[0].month).unwrap_or(12);
    let mut i = 0;
    while i < records.len() {
        let end = (i + window).min(records.len());
        groups.push(records[i..end].iter().collect());
        i = end;
        window = 12;
    }
    groups
}

/// Blind fixed-size folds, used when the source granularity already carries
/// its own period labels (quarters into semesters/years, semesters into
/// years).
pub fn chunks(records: &[AggregatedRecord], size: usize) -> Vec<Vec<&AggregatedRecord>> {
    records.chunks(size).map(|c| c.iter().collect()).collect()
}

/// Fields that vary between the derivation targets.
pub struct DerivedLabels {
    pub quarter: String,
    pub semi_annual: String,
    /// Overrides the first member's reporting year when set (yearly windows
    /// key on the fiscal year of their opening month).
    pub reporting_year: Option<i32>,
}

/// Fold a group into one coarser record.
///
/// The group is forecast iff any member is; forecast groups carry no
/// dimension data. The `month` field records the hyphen-joined member month
/// names.
pub fn derived_record(
    members: &[&AggregatedRecord],
    combine_fn: CombineFn,
    labels: DerivedLabels,
    ref_table: &str,
) -> AggregatedRecord {
    let first = members[0];
    let is_forecast = members.iter().any(|r| r.is_forecast);
    let (qty, value) = combine(members, combine_fn);

    let months: Vec<&str> = members
        .iter()
        .map(|r| r.month.as_str())
        .filter(|m| !m.is_empty())
        .collect();

    let dimension: Vec<DimensionEntry> = if is_forecast {
        Vec::new()
    } else {
        let all: Vec<DimensionEntry> = members
            .iter()
            .flat_map(|r| r.dimension.iter().cloned())
            .collect();
        merge_dimensions(&all)
    };

    AggregatedRecord {
        company_code: first.company_code.clone(),
        site_code: first.site_code.clone(),
        internal_code_id: first.internal_code_id.clone(),
        code: first.code.clone(),
        code_name: first.code_name.clone(),
        type_year: first.type_year,
        reporting_year: labels.reporting_year.unwrap_or(first.reporting_year),
        month: months.join("-"),
        quarter: labels.quarter,
        semi_annual: labels.semi_annual,
        qty,
        value,
        currency: first.currency.clone(),
        unit: first.unit.clone(),
        dimension,
        description: first.description.clone(),
        ref_table: ref_table.to_string(),
        is_forecast,
        created_at: Utc::now(),
    }
}
