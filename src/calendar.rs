//! Fiscal calendar arithmetic.
//!
//! All period math in the pipeline runs over the twelve English month names.
//! A company reports against a fiscal year that begins at its declared start
//! month: months from the start month through December of calendar year Y,
//! plus January through the month before the start month of year Y+1, all
//! belong to reporting year Y+1. A January start collapses the fiscal year
//! onto the calendar year.

pub const MONTHS: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// 1-based index of a month name; None for anything that is not one of the
/// twelve English names.
pub fn month_index(name: &str) -> Option<u32> {
    MONTHS
        .iter()
        .position(|m| *m == name)
        .map(|i| (i + 1) as u32)
}

/// Month name for a 1-based index (wraps modulo 12).
pub fn month_name(index: u32) -> &'static str {
    MONTHS[((index as usize + 11) % 12)]
}

/// Cyclic successor: December wraps to January.
pub fn next_month(name: &str) -> Option<&'static str> {
    let idx = month_index(name)?;
    Some(month_name(idx % 12 + 1))
}

/// Map a calendar month to its fiscal reporting year.
///
/// With a January fiscal start the reporting year is the calendar year.
/// Otherwise months at or after the start month belong to the next
/// reporting year.
pub fn reporting_year(calendar_year: i32, month: &str, fiscal_start: &str) -> Option<i32> {
    let m = month_index(month)?;
    let s = month_index(fiscal_start)?;
    if s == 1 {
        return Some(calendar_year);
    }
    Some(if m >= s {
        calendar_year + 1
    } else {
        calendar_year
    })
}

/// Calendar quarter label: Q1 = Jan-Mar ... Q4 = Oct-Dec.
pub fn quarter_of(month: &str) -> Option<&'static str> {
    let m = month_index(month)?;
    Some(match (m - 1) / 3 {
        0 => "Q1",
        1 => "Q2",
        2 => "Q3",
        _ => "Q4",
    })
}

/// Calendar semester label: H1 = Jan-Jun, H2 = Jul-Dec.
pub fn semester_of(month: &str) -> Option<&'static str> {
    let m = month_index(month)?;
    Some(if m <= 6 { "H1" } else { "H2" })
}

/// Cyclic successor of a quarter label.
pub fn next_quarter(quarter: &str) -> &'static str {
    match quarter {
        "Q1" => "Q2",
        "Q2" => "Q3",
        "Q3" => "Q4",
        _ => "Q1",
    }
}

/// Cyclic successor of a semester label.
pub fn next_semester(semester: &str) -> &'static str {
    match semester {
        "H1" => "H2",
        _ => "H1",
    }
}

/// First calendar month of a quarter label.
pub fn quarter_start_month(quarter: &str) -> Option<&'static str> {
    match quarter {
        "Q1" => Some("January"),
        "Q2" => Some("April"),
        "Q3" => Some("July"),
        "Q4" => Some("October"),
        _ => None,
    }
}

/// First calendar month of a semester label.
pub fn semester_start_month(semester: &str) -> Option<&'static str> {
    match semester {
        "H1" => Some("January"),
        "H2" => Some("July"),
        _ => None,
    }
}

/// Normalize an externally written quarter label to Q1..Q4.
pub fn normalize_quarter(raw: &str) -> Option<&'static str> {
    match raw.trim().to_uppercase().as_str() {
        "Q1" => Some("Q1"),
        "Q2" => Some("Q2"),
        "Q3" => Some("Q3"),
        "Q4" => Some("Q4"),
        _ => None,
    }
}

/// Normalize an externally written semester label; the ingestion side still
/// writes the long "Semester1"/"Semester2" form.
pub fn normalize_semester(raw: &str) -> Option<&'static str> {
    match raw.trim().to_uppercase().as_str() {
        "H1" | "SEMESTER1" => Some("H1"),
        "H2" | "SEMESTER2" => Some("H2"),
        _ => None,
    }
}

/// Length of the first yearly grouping window for a series.
///
/// A series whose first month coincides with the fiscal start gets a full
/// 12-month window. A series that starts mid-cycle gets the months remaining
/// until the next fiscal start, so a January series under an April start
/// opens with a 3-month window (January-March).
pub fn first_window_len(fiscal_start: &str, first_month: &str) -> Option<usize> {
    let s = month_index(fiscal_start)? as i32;
    let f = month_index(first_month)? as i32;
    let offset = (f - s).rem_euclid(12);
    Some((12 - offset) as usize)
}

/// The twelve month names of the fiscal year beginning at `fiscal_start`.
pub fn fiscal_months(fiscal_start: &str) -> Option<Vec<&'static str>> {
    let s = month_index(fiscal_start)? as usize;
    Some((0..12).map(|i| MONTHS[(s - 1 + i) % 12]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_month_index_total_on_names() {
        for (i, name) in MONTHS.iter().enumerate() {
            assert_eq!(month_index(name), Some((i + 1) as u32));
        }
        assert_eq!(month_index("Brumaire"), None);
        assert_eq!(month_index(""), None);
    }

    #[test]
    fn test_next_month_wraps() {
        assert_eq!(next_month("January"), Some("February"));
        assert_eq!(next_month("December"), Some("January"));
        assert_eq!(next_month("nope"), None);
    }

    #[test]
    fn test_reporting_year_january_start_is_identity() {
        for name in MONTHS {
            assert_eq!(reporting_year(2023, name, "January"), Some(2023));
        }
    }

    #[test]
    fn test_reporting_year_april_start() {
        // April..December 2023 roll into reporting year 2024.
        assert_eq!(reporting_year(2023, "April", "April"), Some(2024));
        assert_eq!(reporting_year(2023, "December", "April"), Some(2024));
        // January..March 2023 stay in reporting year 2023.
        assert_eq!(reporting_year(2023, "January", "April"), Some(2023));
        assert_eq!(reporting_year(2023, "March", "April"), Some(2023));
        // January 2024 belongs to the fiscal year opened in April 2023.
        assert_eq!(reporting_year(2024, "January", "April"), Some(2024));
    }

    #[test]
    fn test_reporting_year_rule_all_starts() {
        // reporting_year = calendar + (1 if month_index >= start_index) for
        // every non-January start.
        for start in &MONTHS[1..] {
            let s = month_index(start).unwrap();
            for month in MONTHS {
                let m = month_index(month).unwrap();
                let expected = if m >= s { 2021 } else { 2020 };
                assert_eq!(reporting_year(2020, month, start), Some(expected));
            }
        }
    }

    #[test]
    fn test_quarter_and_semester_labels() {
        assert_eq!(quarter_of("January"), Some("Q1"));
        assert_eq!(quarter_of("March"), Some("Q1"));
        assert_eq!(quarter_of("April"), Some("Q2"));
        assert_eq!(quarter_of("September"), Some("Q3"));
        assert_eq!(quarter_of("December"), Some("Q4"));
        assert_eq!(semester_of("June"), Some("H1"));
        assert_eq!(semester_of("July"), Some("H2"));
    }

    #[test]
    fn test_period_successors() {
        assert_eq!(next_quarter("Q4"), "Q1");
        assert_eq!(next_quarter("Q2"), "Q3");
        assert_eq!(next_semester("H1"), "H2");
        assert_eq!(next_semester("H2"), "H1");
    }

    #[test]
    fn test_first_window_len() {
        // Aligned series: full fiscal year.
        assert_eq!(first_window_len("April", "April"), Some(12));
        // January series under an April start: 3 months until the fiscal
        // year opens.
        assert_eq!(first_window_len("April", "January"), Some(3));
        // Mid-year joiner: June under an April start runs through March.
        assert_eq!(first_window_len("April", "June"), Some(10));
        assert_eq!(first_window_len("January", "January"), Some(12));
        assert_eq!(first_window_len("January", "November"), Some(2));
    }

    #[test]
    fn test_label_normalization() {
        assert_eq!(normalize_quarter(" q2 "), Some("Q2"));
        assert_eq!(normalize_quarter("Q5"), None);
        assert_eq!(normalize_semester("Semester1"), Some("H1"));
        assert_eq!(normalize_semester("h2"), Some("H2"));
        assert_eq!(normalize_semester("Semester3"), None);
        assert_eq!(quarter_start_month("Q3"), Some("July"));
        assert_eq!(semester_start_month("H2"), Some("July"));
    }

    #[test]
    fn test_fiscal_months_cycle() {
        let months = fiscal_months("April").unwrap();
        assert_eq!(months[0], "April");
        assert_eq!(months[8], "December");
        assert_eq!(months[9], "January");
        assert_eq!(months[11], "March");
    }
}
