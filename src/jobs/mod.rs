//! Job coordination.
//!
//! Trigger requests become in-process jobs: one registry entry plus a
//! spawned task that fans out over companies. Submissions are refused while
//! a job of the same kind is already running for the same company. Job state
//! lives only in memory; a restart forgets in-flight jobs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::aggregation::AggregationEngine;
use crate::catalog::{CatalogError, CompanyCatalog};
use crate::models::{Company, Config};
use crate::rollup::RollupEngine;
use crate::store::RecordStore;

/// Historical window: years before `current - YEAR_WINDOW` are ignored
/// unless the company's data starts even earlier.
const YEAR_WINDOW: i32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Aggregation,
    Rollup,
}

impl JobKind {
    fn id_prefix(self) -> &'static str {
        match self {
            Self::Aggregation => "agg",
            Self::Rollup => "rollup",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aggregation => "aggregation",
            Self::Rollup => "rollup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Error,
}

/// Aggregate counts reported when a job reaches a terminal state.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct JobSummary {
    pub total_companies: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub series_processed: usize,
    pub series_failed: usize,
    pub records_written: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub job_id: String,
    pub kind: JobKind,
    pub company_id: Option<i64>,
    pub status: JobStatus,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: Option<JobSummary>,
}

impl JobInfo {
    /// Elapsed seconds: total runtime for finished jobs, time-so-far for
    /// running ones.
    pub fn duration_secs(&self) -> f64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{kind} for company {company} is already running as {job_id}")]
    AlreadyRunning {
        kind: &'static str,
        company: String,
        job_id: String,
    },
}

/// Per-company outcome folded into the job summary.
#[derive(Debug, Default, Clone, Copy)]
struct CompanyOutcome {
    series_processed: usize,
    series_failed: usize,
    records_written: usize,
    deadline_hit: bool,
}

/// Cheap-to-clone handle; clones share the job registry and the store.
#[derive(Clone)]
pub struct JobCoordinator {
    catalog: Arc<dyn CompanyCatalog>,
    store: Arc<RecordStore>,
    jobs: Arc<Mutex<HashMap<String, JobInfo>>>,
    max_concurrent: usize,
    deadline: Duration,
}

impl JobCoordinator {
    pub fn new(
        store: Arc<RecordStore>,
        catalog: Arc<dyn CompanyCatalog>,
        config: &Config,
    ) -> Self {
        Self {
            catalog,
            store,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            max_concurrent: config.max_concurrent_companies.max(1),
            deadline: Duration::from_secs(config.job_deadline_secs),
        }
    }

    /// Register and spawn a job. Refuses a `(company, kind)` pair that is
    /// already running.
    pub fn submit(&self, kind: JobKind, company_id: Option<i64>) -> Result<String, SubmitError> {
        let company_label = company_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "all".to_string());

        let job_id = {
            let mut jobs = self.jobs.lock().unwrap();
            if let Some(existing) = jobs.values().find(|j| {
                j.status == JobStatus::Running && j.kind == kind && j.company_id == company_id
            }) {
                return Err(SubmitError::AlreadyRunning {
                    kind: kind.as_str(),
                    company: company_label,
                    job_id: existing.job_id.clone(),
                });
            }

            let mut job_id = format!(
                "{}_{}_{}",
                kind.id_prefix(),
                company_label,
                Utc::now().timestamp()
            );
            let mut bump = 0;
            while jobs.contains_key(&job_id) {
                bump += 1;
                job_id = format!(
                    "{}_{}_{}_{}",
                    kind.id_prefix(),
                    company_label,
                    Utc::now().timestamp(),
                    bump
                );
            }

            jobs.insert(
                job_id.clone(),
                JobInfo {
                    job_id: job_id.clone(),
                    kind,
                    company_id,
                    status: JobStatus::Running,
                    message: format!("{} started", kind.as_str()),
                    started_at: Utc::now(),
                    ended_at: None,
                    summary: None,
                },
            );
            job_id
        };

        let coordinator = self.clone();
        let spawned_id = job_id.clone();
        tokio::spawn(async move {
            coordinator.run_job(spawned_id, kind, company_id).await;
        });

        info!("🚀 Submitted {} job {}", kind.as_str(), job_id);
        Ok(job_id)
    }

    pub fn status(&self, job_id: &str) -> Option<JobInfo> {
        self.jobs.lock().unwrap().get(job_id).cloned()
    }

    pub fn list(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self.jobs.lock().unwrap().values().cloned().collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs
    }

    pub fn active_count(&self) -> usize {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .count()
    }

    fn finish(&self, job_id: &str, status: JobStatus, message: String, summary: Option<JobSummary>) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(job_id) {
            job.status = status;
            job.message = message;
            job.summary = summary;
            job.ended_at = Some(Utc::now());
        }
    }

    async fn run_job(self, job_id: String, kind: JobKind, company_id: Option<i64>) {
        let deadline = Instant::now() + self.deadline;

        let companies = match self.resolve_companies(company_id).await {
            Ok(companies) => companies,
            Err(e) => {
                error!("Job {} failed resolving companies: {}", job_id, e);
                self.finish(&job_id, JobStatus::Error, e.to_string(), None);
                return;
            }
        };
        if companies.is_empty() {
            self.finish(
                &job_id,
                JobStatus::Completed,
                "no companies to process".to_string(),
                Some(JobSummary::default()),
            );
            return;
        }

        let total = companies.len();
        info!("Job {}: processing {} companies", job_id, total);

        let mut summary = JobSummary {
            total_companies: total,
            ..Default::default()
        };
        let mut deadline_hit = false;

        let mut results = stream::iter(companies)
            .map(|company| {
                let coordinator = self.clone();
                async move {
                    let label = company.id;
                    let outcome = match kind {
                        JobKind::Aggregation => {
                            coordinator.aggregate_company(&company, deadline).await
                        }
                        JobKind::Rollup => coordinator.rollup_company(&company, deadline).await,
                    };
                    (label, outcome)
                }
            })
            .buffer_unordered(self.max_concurrent);

        while let Some((company, result)) = results.next().await {
            match result {
                Ok(outcome) => {
                    summary.succeeded += 1;
                    summary.series_processed += outcome.series_processed;
                    summary.series_failed += outcome.series_failed;
                    summary.records_written += outcome.records_written;
                    deadline_hit |= outcome.deadline_hit;
                }
                Err(e) => {
                    summary.failed += 1;
                    error!("Job {}: company {} failed: {}", job_id, company, e);
                }
            }
        }
        drop(results);

        if deadline_hit {
            self.finish(
                &job_id,
                JobStatus::Error,
                "job deadline exceeded; partial results written".to_string(),
                Some(summary),
            );
        } else {
            let message = format!(
                "Processing completed. Success: {}, Errors: {}",
                summary.succeeded, summary.failed
            );
            info!("✅ Job {}: {}", job_id, message);
            self.finish(&job_id, JobStatus::Completed, message, Some(summary));
        }
    }

    async fn resolve_companies(&self, company_id: Option<i64>) -> Result<Vec<Company>, CatalogError> {
        match company_id {
            Some(id) => Ok(vec![self.catalog.get_company(id).await?]),
            None => self.catalog.list_companies().await,
        }
    }

    /// Drive aggregation for one company: every declared frequency, every
    /// metric code, the company-level series and then each site. Series are
    /// processed one at a time; a failing series is logged and counted, not
    /// fatal.
    async fn aggregate_company(
        &self,
        company: &Company,
        deadline: Instant,
    ) -> anyhow::Result<CompanyOutcome> {
        let year_floor = Utc::now().year() - YEAR_WINDOW;
        let engine = AggregationEngine::new(self.store.clone());
        let mut outcome = CompanyOutcome::default();

        let mut metric_ids: Vec<String> = company
            .metric_codes
            .iter()
            .map(|c| c.internal_code_id.clone())
            .collect();
        if metric_ids.is_empty() {
            metric_ids = self
                .store
                .distinct_metric_ids(&company.id.to_string())
                .await?;
            if !metric_ids.is_empty() {
                info!(
                    "Company {}: catalog lists no metric codes, using {} codes found in raw data",
                    company.id,
                    metric_ids.len()
                );
            }
        }
        if metric_ids.is_empty() {
            warn!("Company {}: no metric codes to process", company.id);
            return Ok(outcome);
        }
        if company.reporting_frequencies.is_empty() {
            warn!("Company {}: no valid reporting frequencies", company.id);
            return Ok(outcome);
        }

        let site_codes = company.site_codes();
        for frequency in &company.reporting_frequencies {
            for metric_id in &metric_ids {
                for site_code in &site_codes {
                    if Instant::now() >= deadline {
                        warn!("Company {}: deadline reached, stopping", company.id);
                        outcome.deadline_hit = true;
                        return Ok(outcome);
                    }
                    match engine
                        .aggregate(company, metric_id, site_code, year_floor, *frequency)
                        .await
                    {
                        Ok(series) => {
                            outcome.series_processed += 1;
                            outcome.records_written += series.total();
                        }
                        Err(e) => {
                            outcome.series_failed += 1;
                            error!(
                                "Series failed (company={}, metric={}, site={:?}, frequency={}): {}",
                                company.id,
                                metric_id,
                                site_code,
                                frequency.as_str(),
                                e
                            );
                        }
                    }
                }
            }
        }

        Ok(outcome)
    }

    async fn rollup_company(
        &self,
        company: &Company,
        deadline: Instant,
    ) -> anyhow::Result<CompanyOutcome> {
        let mut outcome = CompanyOutcome::default();
        if Instant::now() >= deadline {
            outcome.deadline_hit = true;
            return Ok(outcome);
        }
        let rollup = RollupEngine::new(self.store.clone())
            .rollup_company(company)
            .await?;
        outcome.series_processed = rollup.groups_processed;
        outcome.records_written = rollup.records_written;
        Ok(outcome)
    }
}
