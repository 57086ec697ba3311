//! End-to-end pipeline tests: raw observations through aggregation,
//! forecast extension and rollup.

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use test_log::test;

use common::{raw_month, seed_year, test_company, COMPANY, METRIC};
use esg_pipeline::aggregation::AggregationEngine;
use esg_pipeline::models::{Frequency, Granularity};
use esg_pipeline::rollup::RollupEngine;
use esg_pipeline::store::{RecordStore, RollupFilter};

const YEAR_FLOOR: i32 = 2017;

#[test(tokio::test)]
async fn fiscal_shift_produces_partial_and_full_windows() {
    let store = Arc::new(RecordStore::in_memory().await.unwrap());
    let engine = AggregationEngine::new(store.clone());
    let company = test_company("April", None);

    seed_year(&store, "", 2023, "10").await;
    engine
        .aggregate(&company, METRIC, "", YEAR_FLOOR, Frequency::Month)
        .await
        .unwrap();

    let yearly = store
        .find_series(Granularity::Yearly, COMPANY, METRIC, "")
        .await
        .unwrap();

    // January-March 2023 collapse into a 3-month partial window reported
    // under fiscal 2023.
    let partial = yearly
        .iter()
        .find(|r| r.reporting_year == 2023)
        .expect("partial fiscal window");
    assert_eq!(partial.qty, "30");
    assert_eq!(partial.month, "January-February-March");
    assert!(!partial.is_forecast);

    // April onward opens fiscal 2024; with the constant history the
    // forecast continues at 10/month, so the window sums to 120.
    let full = yearly
        .iter()
        .find(|r| r.reporting_year == 2024)
        .expect("fiscal 2024 window");
    assert!(full.month.starts_with("April"));
    assert_eq!(full.qty, "120");
}

#[test(tokio::test)]
async fn combining_function_last_takes_final_month() {
    let store = Arc::new(RecordStore::in_memory().await.unwrap());
    let engine = AggregationEngine::new(store.clone());
    let company = test_company("January", Some("last"));

    for (month, qty) in [("January", "5"), ("February", "7"), ("March", "12")] {
        store.insert_raw(&raw_month("", month, 2023, qty)).await.unwrap();
    }
    engine
        .aggregate(&company, METRIC, "", YEAR_FLOOR, Frequency::Month)
        .await
        .unwrap();

    let quarterly = store
        .find_series(Granularity::Quarterly, COMPANY, METRIC, "")
        .await
        .unwrap();
    let q1 = quarterly
        .iter()
        .find(|r| r.quarter == "Q1" && !r.is_forecast)
        .expect("Q1 record");
    assert_eq!(q1.qty, "12");
}

#[test(tokio::test)]
async fn constant_history_forecasts_constant() {
    let store = Arc::new(RecordStore::in_memory().await.unwrap());
    let engine = AggregationEngine::new(store.clone());
    let company = test_company("January", None);

    for month in ["January", "February", "March", "April"] {
        store.insert_raw(&raw_month("", month, 2023, "4")).await.unwrap();
    }
    engine
        .aggregate(&company, METRIC, "", YEAR_FLOOR, Frequency::Month)
        .await
        .unwrap();

    let monthly = store
        .find_series(Granularity::Monthly, COMPANY, METRIC, "")
        .await
        .unwrap();
    let forecasts: Vec<_> = monthly.iter().filter(|r| r.is_forecast).collect();
    assert_eq!(forecasts.len(), Frequency::Month.forecast_horizon());
    assert!(forecasts.iter().all(|r| r.qty == "4"));
    assert!(forecasts.iter().all(|r| r.ref_table == "prediction"));

    // The continuation starts right after the last actual month.
    assert!(monthly
        .iter()
        .any(|r| r.is_forecast && r.month == "May" && r.type_year == 2023));
}

#[test(tokio::test)]
async fn aggregation_rerun_is_idempotent() {
    let store = Arc::new(RecordStore::in_memory().await.unwrap());
    let engine = AggregationEngine::new(store.clone());
    let company = test_company("April", None);

    seed_year(&store, "", 2022, "3").await;
    seed_year(&store, "", 2023, "5").await;

    let snapshot = |records: Vec<esg_pipeline::models::AggregatedRecord>| {
        records
            .into_iter()
            .map(|r| {
                (
                    r.type_year,
                    r.reporting_year,
                    r.month,
                    r.quarter,
                    r.semi_annual,
                    r.qty,
                    r.is_forecast,
                )
            })
            .collect::<Vec<_>>()
    };

    engine
        .aggregate(&company, METRIC, "", YEAR_FLOOR, Frequency::Month)
        .await
        .unwrap();
    let mut first = Vec::new();
    for g in Granularity::ALL {
        first.push(snapshot(
            store.find_series(g, COMPANY, METRIC, "").await.unwrap(),
        ));
    }

    engine
        .aggregate(&company, METRIC, "", YEAR_FLOOR, Frequency::Month)
        .await
        .unwrap();
    for (i, g) in Granularity::ALL.into_iter().enumerate() {
        let rerun = snapshot(store.find_series(g, COMPANY, METRIC, "").await.unwrap());
        assert_eq!(first[i], rerun, "granularity {:?} diverged on rerun", g);
    }
}

#[test(tokio::test)]
async fn missing_metric_code_writes_empty_display_fields() {
    let store = Arc::new(RecordStore::in_memory().await.unwrap());
    let engine = AggregationEngine::new(store.clone());
    let mut company = test_company("January", None);
    company.metric_codes.clear();

    store.insert_raw(&raw_month("", "January", 2023, "5")).await.unwrap();
    store.insert_raw(&raw_month("", "February", 2023, "6")).await.unwrap();

    engine
        .aggregate(&company, METRIC, "", YEAR_FLOOR, Frequency::Month)
        .await
        .unwrap();

    let monthly = store
        .find_series(Granularity::Monthly, COMPANY, METRIC, "")
        .await
        .unwrap();
    assert!(!monthly.is_empty());
    assert!(monthly.iter().all(|r| r.code.is_empty() && r.code_name.is_empty()));
}

#[test(tokio::test)]
async fn rollup_weights_child_contributions_by_ownership() {
    let store = Arc::new(RecordStore::in_memory().await.unwrap());
    let aggregation = AggregationEngine::new(store.clone());
    let rollup = RollupEngine::new(store.clone());
    let company = test_company("January", None);

    // One year of flat monthly data per site: R at 10/month, A at 20/month,
    // B at 30/month.
    seed_year(&store, "R", 2023, "10").await;
    seed_year(&store, "A", 2023, "20").await;
    seed_year(&store, "B", 2023, "30").await;

    for site in ["R", "A", "B"] {
        aggregation
            .aggregate(&company, METRIC, site, YEAR_FLOOR, Frequency::Month)
            .await
            .unwrap();
    }
    rollup.rollup_company(&company).await.unwrap();

    // Yearly 2023: R own 120, A 240, B 360. Child contributions:
    // A offers 240 * 0.5 = 120, B offers 360 * 0.4 = 144.
    let (records, _) = store
        .find_rollups(
            Granularity::Yearly,
            &RollupFilter {
                company_code: Some(COMPANY.to_string()),
                limit: 100,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let root_2023 = records
        .iter()
        .find(|r| r.site_code == "R" && r.reporting_year == 2023)
        .expect("root yearly rollup");
    assert_eq!(root_2023.qty, "120");
    assert_eq!(root_2023.rollup_qty, 264.0);
    assert_eq!(root_2023.site_ownership, 100.0);

    // Monthly rollups exist per month with the per-month arithmetic.
    let (monthly_records, _) = store
        .find_rollups(
            Granularity::Monthly,
            &RollupFilter {
                company_code: Some(COMPANY.to_string()),
                limit: 1000,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let january_root = monthly_records
        .iter()
        .find(|r| r.site_code == "R" && r.month == "January" && r.type_year == 2023)
        .expect("January root rollup");
    assert_eq!(january_root.qty, "10");
    assert_eq!(january_root.rollup_qty, 22.0);
}

#[test(tokio::test)]
async fn rollup_rerun_replaces_rather_than_duplicates() {
    let store = Arc::new(RecordStore::in_memory().await.unwrap());
    let aggregation = AggregationEngine::new(store.clone());
    let rollup = RollupEngine::new(store.clone());
    let company = test_company("January", None);

    seed_year(&store, "R", 2023, "10").await;
    aggregation
        .aggregate(&company, METRIC, "R", YEAR_FLOOR, Frequency::Month)
        .await
        .unwrap();

    rollup.rollup_company(&company).await.unwrap();
    let first = store
        .count_rollups(Granularity::Monthly, Some(COMPANY))
        .await
        .unwrap();
    rollup.rollup_company(&company).await.unwrap();
    let second = store
        .count_rollups(Granularity::Monthly, Some(COMPANY))
        .await
        .unwrap();
    assert_eq!(first, second);
}
