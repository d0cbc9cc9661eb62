use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::future::{try_join3, try_join_all};
use futures_util::TryFutureExt;
use octocrab::models::RunId;

use crate::cache::{CacheKey, EntityKind};
use crate::client::CiApi;
use crate::cost::{cost_of, Thousandth};
use crate::error::GatherError;
use crate::gather::Gatherer;
use crate::models::{Job, Run, UsageReport};
use crate::monitor::{self, Analysis};
use crate::RepositoryId;

/// A job enriched with its billing data.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct JobRecord {
    pub job: Job,
    /// Runner type from the usage report, `"Free"` when the job was not billed.
    pub runner: String,
    pub cost: Thousandth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Analysis>,
}

/// A completed workflow run with its jobs, billing and monitoring data.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WorkflowRunRecord {
    pub repository: RepositoryId,
    pub run: Run,
    /// Sorted by start time.
    pub jobs: Vec<JobRecord>,
    pub usage: UsageReport,
    pub cost: Thousandth,
    /// Latest job completion. `None` only for a run without completed jobs.
    pub run_completed_at: Option<DateTime<Utc>>,
    /// Monitoring analyses that could not be matched to a job by name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub analyses: Vec<Analysis>,
}

impl<A: CiApi> Gatherer<A> {
    /// Gathers all metrics for a completed workflow run.
    pub async fn workflow_run(
        &self,
        repo: &RepositoryId,
        run_id: RunId,
    ) -> Result<WorkflowRunRecord, GatherError> {
        let key = CacheKey::new(repo, EntityKind::WorkflowRun, run_id);
        let start = Instant::now();
        let record = self
            .cache
            .fetch_or_compute(&key, self.options.force_update, || {
                self.fetch_workflow_run(repo, run_id)
            })
            .await
            .map_err(|source| GatherError::WorkflowRun {
                id: run_id,
                source: Box::new(source),
            })?;
        log::debug!(
            "Gathered workflow run {run_id} of {repo} in {:?}",
            start.elapsed()
        );
        Ok(record)
    }

    async fn fetch_workflow_run(
        &self,
        repo: &RepositoryId,
        run_id: RunId,
    ) -> Result<WorkflowRunRecord, GatherError> {
        log::debug!("Fetching workflow run {run_id} of {repo} from GitHub");
        let run = self.api.workflow_run(repo, run_id).await?;
        if !run.is_completed() {
            return Err(GatherError::RunNotCompleted {
                id: run_id,
                status: run.status.clone().unwrap_or_default(),
            });
        }

        let (mut jobs, usage, analyses) = try_join3(
            self.api.workflow_jobs(repo, run_id).err_into::<GatherError>(),
            self.api.workflow_usage(repo, run_id).err_into::<GatherError>(),
            self.monitoring_analyses(repo, run_id),
        )
        .await?;
        jobs.sort_by_key(|job| job.started_at);

        let run_completed_at = run_completed_at(&jobs);
        let mut records = jobs
            .into_iter()
            .map(|job| {
                let (runner, cost) = cost_of(job.id, &usage)?;
                Ok(JobRecord {
                    job,
                    runner,
                    cost,
                    analysis: None,
                })
            })
            .collect::<Result<Vec<_>, GatherError>>()?;
        let analyses = attach_analyses(&mut records, analyses);
        let cost = records.iter().map(|job| job.cost).sum();

        Ok(WorkflowRunRecord {
            repository: repo.clone(),
            run,
            jobs: records,
            usage,
            cost,
            run_completed_at,
            analyses,
        })
    }

    /// Downloads and decodes every monitoring artifact of the run. A run
    /// without one is not an error.
    async fn monitoring_analyses(
        &self,
        repo: &RepositoryId,
        run_id: RunId,
    ) -> Result<Vec<Analysis>, GatherError> {
        let file_name = self.options.monitor_file_name.as_str();
        let artifacts = self.api.workflow_artifacts(repo, run_id).await?;
        let artifacts = artifacts
            .into_iter()
            .filter(|artifact| artifact.name.ends_with(file_name))
            .collect::<Vec<_>>();
        if artifacts.is_empty() {
            log::debug!("No monitoring data for workflow run {run_id}");
            return Ok(vec![]);
        }

        try_join_all(artifacts.into_iter().map(|artifact| async move {
            log::trace!(
                "Downloading monitoring data '{}' ({}) of workflow run {run_id}",
                artifact.name,
                artifact.id
            );
            let archive = self.api.download_artifact(repo, artifact.id).await?;
            monitor::analyze_archive(&archive, file_name).map_err(|source| {
                GatherError::Monitoring {
                    artifact: artifact.name.clone(),
                    source,
                }
            })
        }))
        .await
    }
}

/// The API only reports `updated_at` for a run, which also moves on
/// unrelated metadata updates, so completion is taken from the jobs.
pub fn run_completed_at(jobs: &[Job]) -> Option<DateTime<Utc>> {
    jobs.iter().filter_map(|job| job.completed_at).max()
}

/// Hands each analysis to the job with the same name and returns the ones no
/// job claimed.
fn attach_analyses(jobs: &mut [JobRecord], analyses: Vec<Analysis>) -> Vec<Analysis> {
    let mut unmatched = vec![];
    for analysis in analyses {
        match jobs
            .iter_mut()
            .find(|job| job.analysis.is_none() && job.job.name == analysis.job_name)
        {
            Some(job) => job.analysis = Some(analysis),
            None => {
                log::warn!(
                    "Monitoring data for job '{}' does not match any job of the run",
                    analysis.job_name
                );
                unmatched.push(analysis);
            }
        }
    }
    unmatched
}
