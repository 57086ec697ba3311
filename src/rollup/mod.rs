//! Hierarchical site rollup.
//!
//! The catalog's flat site list forms a forest keyed by site code. For each
//! `(metric, year, period)` group of aggregated records the engine walks the
//! forest bottom-up: every node offers its parent an ownership-weighted
//! contribution of its own figures plus whatever its descendants offered it,
//! and every node that has a record of its own gets exactly one RollupRecord
//! capturing both sides.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::models::{safe_float, AggregatedRecord, Company, Granularity, RollupRecord, SiteRecord};
use crate::store::RecordStore;

/// One node of the site forest.
#[derive(Debug, Clone)]
pub struct SiteNode {
    pub code: String,
    pub name: String,
    pub ownership: f64,
    pub children: Vec<usize>,
}

/// Arena-indexed site forest. Children hold indices into the node vector;
/// sites whose declared parent is unknown are promoted to roots.
#[derive(Debug, Clone, Default)]
pub struct SiteForest {
    nodes: Vec<SiteNode>,
    roots: Vec<usize>,
}

impl SiteForest {
    pub fn from_sites(sites: &[SiteRecord]) -> Self {
        let mut nodes: Vec<SiteNode> = sites
            .iter()
            .map(|s| SiteNode {
                code: s.internal_site_code.clone(),
                name: s.site_name.clone(),
                ownership: s.ownership,
                children: Vec::new(),
            })
            .collect();

        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.code.clone(), i))
            .collect();

        let mut roots = Vec::new();
        for (i, site) in sites.iter().enumerate() {
            if site.parent_site_code.is_empty() {
                roots.push(i);
                continue;
            }
            match index.get(&site.parent_site_code) {
                // Self-parented sites would recurse forever; treat as roots.
                Some(&parent) if parent != i => nodes[parent].children.push(i),
                _ => {
                    warn!(
                        "Parent site {} not found for {}; treating as root",
                        site.parent_site_code, site.internal_site_code
                    );
                    roots.push(i);
                }
            }
        }

        SiteForest { nodes, roots }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn node(&self, idx: usize) -> &SiteNode {
        &self.nodes[idx]
    }

    /// Nested JSON rendering for the site-hierarchy endpoint.
    pub fn to_json(&self) -> Value {
        fn render(forest: &SiteForest, idx: usize) -> Value {
            let node = forest.node(idx);
            json!({
                "internal_site_code": node.code,
                "site_name": node.name,
                "ownership": node.ownership,
                "sites": node.children.iter().map(|&c| render(forest, c)).collect::<Vec<_>>(),
            })
        }
        Value::Array(self.roots.iter().map(|&r| render(self, r)).collect())
    }
}

/// Ownership-weighted totals a node offers its parent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Contribution {
    pub qty: f64,
    pub value: f64,
}

/// Totals for one rollup run.
#[derive(Debug, Default, Clone, Copy)]
pub struct RollupOutcome {
    pub groups_processed: usize,
    pub records_written: usize,
}

pub struct RollupEngine {
    store: Arc<RecordStore>,
}

impl RollupEngine {
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self { store }
    }

    /// Run the rollup for every granularity of one company. Aggregation must
    /// have completed for the company before this is called.
    pub async fn rollup_company(&self, company: &Company) -> Result<RollupOutcome> {
        let forest = SiteForest::from_sites(&company.sites);
        if forest.is_empty() {
            info!("Company {} has no sites; skipping rollup", company.id);
            return Ok(RollupOutcome::default());
        }

        let company_code = company.id.to_string();
        let mut outcome = RollupOutcome::default();
        // One emission per (site, metric, year, period) within a run.
        let mut processed: HashSet<(String, String, i32, String)> = HashSet::new();

        for granularity in Granularity::ALL {
            let records = self.store.find_for_company(granularity, &company_code).await?;
            if records.is_empty() {
                continue;
            }

            // Group records by (metric, year, period label). Yearly windows
            // are identified by fiscal year, labeled periods by calendar
            // year plus label.
            let mut groups: HashMap<(String, i32, String), Vec<AggregatedRecord>> = HashMap::new();
            for record in records {
                let key = (
                    record.internal_code_id.clone(),
                    group_year(&record, granularity),
                    record.period_label(granularity).to_string(),
                );
                groups.entry(key).or_default().push(record);
            }

            for ((metric, year, period), group) in groups {
                let mut by_site: HashMap<&str, Vec<&AggregatedRecord>> = HashMap::new();
                for record in &group {
                    by_site.entry(record.site_code.as_str()).or_default().push(record);
                }

                let mut emitted: Vec<RollupRecord> = Vec::new();
                for &root in forest.roots() {
                    walk(
                        &forest,
                        root,
                        &by_site,
                        granularity,
                        &metric,
                        year,
                        &period,
                        &mut processed,
                        &mut emitted,
                    );
                }

                for record in &emitted {
                    self.store.replace_rollup(granularity, record).await?;
                }
                outcome.records_written += emitted.len();
                outcome.groups_processed += 1;
            }
        }

        info!(
            "✅ Rollup for company {}: {} groups, {} records",
            company.id, outcome.groups_processed, outcome.records_written
        );
        Ok(outcome)
    }
}

/// Year under which records of a group are matched: fiscal year for yearly
/// records, calendar year for labeled periods.
fn group_year(record: &AggregatedRecord, granularity: Granularity) -> i32 {
    match granularity {
        Granularity::Yearly => record.reporting_year,
        _ => record.type_year,
    }
}

/// Post-order walk. Returns the node's contribution to its parent and
/// appends one RollupRecord when the node has its own aggregated record.
#[allow(clippy::too_many_arguments)]
fn walk(
    forest: &SiteForest,
    node_idx: usize,
    by_site: &HashMap<&str, Vec<&AggregatedRecord>>,
    granularity: Granularity,
    metric: &str,
    year: i32,
    period: &str,
    processed: &mut HashSet<(String, String, i32, String)>,
    out: &mut Vec<RollupRecord>,
) -> Contribution {
    let node = forest.node(node_idx);

    let mut child_sum = Contribution::default();
    for &child in &node.children {
        let contribution = walk(
            forest, child, by_site, granularity, metric, year, period, processed, out,
        );
        child_sum.qty += contribution.qty;
        child_sum.value += contribution.value;
    }

    // Duplicate own records can exist when raw history repeats; the most
    // recently written one wins.
    let own = by_site
        .get(node.code.as_str())
        .and_then(|records| records.iter().max_by_key(|r| r.created_at));

    let weight = node.ownership / 100.0;
    match own {
        Some(record) => {
            let own_qty = safe_float(&record.qty);
            let own_value = record.value;

            let key = (
                node.code.clone(),
                metric.to_string(),
                year,
                period.to_string(),
            );
            if processed.insert(key) {
                out.push(RollupRecord {
                    company_code: record.company_code.clone(),
                    site_code: node.code.clone(),
                    internal_code_id: record.internal_code_id.clone(),
                    code: record.code.clone(),
                    code_name: record.code_name.clone(),
                    type_year: record.type_year,
                    reporting_year: record.reporting_year,
                    month: record.month.clone(),
                    quarter: record.quarter.clone(),
                    semi_annual: record.semi_annual.clone(),
                    qty: record.qty.clone(),
                    value: record.value,
                    rollup_qty: child_sum.qty,
                    rollup_value: child_sum.value,
                    site_ownership: node.ownership,
                    created_at: Utc::now(),
                });
            }

            Contribution {
                qty: (own_qty + child_sum.qty) * weight,
                value: (own_value + child_sum.value) * weight,
            }
        }
        // No record of its own: nothing to emit, but descendant totals still
        // flow upward under this node's ownership.
        None => Contribution {
            qty: child_sum.qty * weight,
            value: child_sum.value * weight,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Frequency;
    use crate::models::MetricCode;

    fn site(code: &str, parent: &str, ownership: f64) -> SiteRecord {
        SiteRecord {
            internal_site_code: code.to_string(),
            site_name: format!("Site {}", code),
            parent_site_code: parent.to_string(),
            ownership,
        }
    }

    fn yearly_record(site_code: &str, qty: &str, value: f64) -> AggregatedRecord {
        AggregatedRecord {
            company_code: "482".to_string(),
            site_code: site_code.to_string(),
            internal_code_id: "c1".to_string(),
            code: "EN-1".to_string(),
            code_name: "Energy".to_string(),
            type_year: 2023,
            reporting_year: 2023,
            month: String::new(),
            quarter: String::new(),
            semi_annual: String::new(),
            qty: qty.to_string(),
            value,
            currency: "EUR".to_string(),
            unit: "t".to_string(),
            dimension: Vec::new(),
            description: String::new(),
            ref_table: "monthly".to_string(),
            is_forecast: false,
            created_at: Utc::now(),
        }
    }

    fn two_level_company() -> Company {
        Company {
            id: 482,
            name: "Acme".to_string(),
            fiscal_start: "January".to_string(),
            reporting_frequencies: vec![Frequency::Month],
            sites: vec![
                site("R", "", 100.0),
                site("A", "R", 50.0),
                site("B", "R", 40.0),
            ],
            metric_codes: vec![MetricCode {
                internal_code_id: "c1".to_string(),
                code: "EN-1".to_string(),
                name: "Energy".to_string(),
                function: None,
            }],
        }
    }

    #[test]
    fn test_forest_orphans_become_roots() {
        let forest = SiteForest::from_sites(&[
            site("A", "", 100.0),
            site("B", "A", 50.0),
            site("C", "GHOST", 30.0),
        ]);
        assert_eq!(forest.len(), 3);
        assert_eq!(forest.roots().len(), 2);
        let a = forest.node(forest.roots()[0]);
        assert_eq!(a.code, "A");
        assert_eq!(a.children.len(), 1);
    }

    #[test]
    fn test_forest_json_shape() {
        let forest = SiteForest::from_sites(&[site("A", "", 100.0), site("B", "A", 50.0)]);
        let tree = forest.to_json();
        assert_eq!(tree[0]["internal_site_code"], "A");
        assert_eq!(tree[0]["sites"][0]["internal_site_code"], "B");
        assert_eq!(tree[0]["sites"][0]["ownership"], 50.0);
    }

    #[test]
    fn test_two_level_ownership_arithmetic() {
        // R (100%) with children A (50%, qty 20) and B (40%, qty 30);
        // R's own qty is 10.
        let company = two_level_company();
        let forest = SiteForest::from_sites(&company.sites);

        let r = yearly_record("R", "10", 0.0);
        let a = yearly_record("A", "20", 0.0);
        let b = yearly_record("B", "30", 0.0);
        let mut by_site: HashMap<&str, Vec<&AggregatedRecord>> = HashMap::new();
        by_site.insert("R", vec![&r]);
        by_site.insert("A", vec![&a]);
        by_site.insert("B", vec![&b]);

        let mut processed = HashSet::new();
        let mut out = Vec::new();
        let contribution = walk(
            &forest,
            forest.roots()[0],
            &by_site,
            Granularity::Yearly,
            "c1",
            2023,
            "",
            &mut processed,
            &mut out,
        );

        // own_contribution(A) = 20 * 0.5 = 10, own_contribution(B) = 30 * 0.4 = 12.
        let root = out.iter().find(|r| r.site_code == "R").unwrap();
        assert_eq!(root.qty, "10");
        assert_eq!(root.rollup_qty, 22.0);
        // Root contribution: (10 + 22) * 1.0 = 32.
        assert_eq!(contribution.qty, 32.0);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_node_without_own_record_emits_nothing_but_forwards() {
        let forest = SiteForest::from_sites(&[
            site("R", "", 100.0),
            site("M", "R", 50.0),
            site("L", "M", 100.0),
        ]);
        let r = yearly_record("R", "10", 0.0);
        let l = yearly_record("L", "40", 0.0);
        let mut by_site: HashMap<&str, Vec<&AggregatedRecord>> = HashMap::new();
        by_site.insert("R", vec![&r]);
        by_site.insert("L", vec![&l]);

        let mut processed = HashSet::new();
        let mut out = Vec::new();
        let contribution = walk(
            &forest,
            forest.roots()[0],
            &by_site,
            Granularity::Yearly,
            "c1",
            2023,
            "",
            &mut processed,
            &mut out,
        );

        // M has no record: no emission, but L's 40 flows through M's 50%.
        assert!(out.iter().all(|r| r.site_code != "M"));
        let root = out.iter().find(|r| r.site_code == "R").unwrap();
        assert_eq!(root.rollup_qty, 20.0);
        assert_eq!(contribution.qty, 30.0);
    }

    #[test]
    fn test_duplicate_own_records_latest_wins() {
        let forest = SiteForest::from_sites(&[site("R", "", 100.0)]);
        let older = yearly_record("R", "10", 0.0);
        let mut newer = yearly_record("R", "99", 0.0);
        newer.created_at = older.created_at + chrono::Duration::seconds(5);

        let mut by_site: HashMap<&str, Vec<&AggregatedRecord>> = HashMap::new();
        by_site.insert("R", vec![&older, &newer]);

        let mut processed = HashSet::new();
        let mut out = Vec::new();
        walk(
            &forest,
            forest.roots()[0],
            &by_site,
            Granularity::Yearly,
            "c1",
            2023,
            "",
            &mut processed,
            &mut out,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].qty, "99");
    }

    #[test]
    fn test_processed_set_suppresses_duplicate_emission() {
        let forest = SiteForest::from_sites(&[site("R", "", 100.0)]);
        let r = yearly_record("R", "10", 0.0);
        let mut by_site: HashMap<&str, Vec<&AggregatedRecord>> = HashMap::new();
        by_site.insert("R", vec![&r]);

        let mut processed = HashSet::new();
        let mut out = Vec::new();
        for _ in 0..2 {
            walk(
                &forest,
                forest.roots()[0],
                &by_site,
                Granularity::Yearly,
                "c1",
                2023,
                "",
                &mut processed,
                &mut out,
            );
        }
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn test_rollup_company_end_to_end() {
        let store = Arc::new(RecordStore::in_memory().await.unwrap());
        let engine = RollupEngine::new(store.clone());
        let company = two_level_company();

        for record in [
            yearly_record("R", "10", 100.0),
            yearly_record("A", "20", 200.0),
            yearly_record("B", "30", 300.0),
        ] {
            store
                .replace_aggregated(Granularity::Yearly, &record)
                .await
                .unwrap();
        }

        let outcome = engine.rollup_company(&company).await.unwrap();
        assert_eq!(outcome.records_written, 3);

        let (records, total) = store
            .find_rollups(
                Granularity::Yearly,
                &crate::store::RollupFilter {
                    company_code: Some("482".to_string()),
                    limit: 10,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(total, 3);
        let root = records.iter().find(|r| r.site_code == "R").unwrap();
        assert_eq!(root.rollup_qty, 22.0);
        assert_eq!(root.rollup_value, 220.0);
        assert_eq!(root.site_ownership, 100.0);

        // Rerun converges to the same state.
        let outcome = engine.rollup_company(&company).await.unwrap();
        assert_eq!(outcome.records_written, 3);
        let (_, total) = store
            .find_rollups(
                Granularity::Yearly,
                &crate::store::RollupFilter {
                    company_code: Some("482".to_string()),
                    limit: 10,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(total, 3);
    }
}
