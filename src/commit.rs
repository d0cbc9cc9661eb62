use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use futures_util::future::{try_join, try_join_all};
use octocrab::models::RunId;
use regex::Regex;

use crate::cache::{CacheKey, EntityKind};
use crate::client::CiApi;
use crate::cost::Thousandth;
use crate::error::GatherError;
use crate::gather::Gatherer;
use crate::merge_queue::MergeQueueEvent;
use crate::models::{CheckRun, Commit};
use crate::workflow_run::WorkflowRunRecord;
use crate::RepositoryId;

/// A commit with the aggregated results of every workflow run it triggered.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CommitRecord {
    pub repository: RepositoryId,
    pub commit: Commit,
    /// In the order GitHub returned them.
    pub check_runs: Vec<CheckRun>,
    /// Merge queue stays that tested this commit. Only filled in when the
    /// commit is gathered as part of a pull request.
    #[serde(default)]
    pub merge_queue_events: Vec<MergeQueueEvent>,
    /// Ascending, without duplicates.
    pub workflow_run_ids: Vec<RunId>,
    pub conclusion: Option<String>,
    pub cost: Thousandth,
    pub start_actions_time: Option<DateTime<Utc>>,
    pub end_actions_time: Option<DateTime<Utc>>,
}

impl CommitRecord {
    pub fn sha(&self) -> &str {
        &self.commit.sha
    }
}

impl<A: CiApi> Gatherer<A> {
    /// Gathers a commit and every workflow run referenced by its check runs.
    ///
    /// Fails as soon as one of the runs fails to gather. Nothing is cached
    /// for the commit in that case.
    pub async fn commit(&self, repo: &RepositoryId, sha: &str) -> Result<CommitRecord, GatherError> {
        let key = CacheKey::new(repo, EntityKind::Commit, sha);
        self.cache
            .fetch_or_compute(&key, self.options.force_update, || {
                self.fetch_commit(repo, sha)
            })
            .await
            .map_err(|source| GatherError::Commit {
                sha: sha.to_string(),
                source: Box::new(source),
            })
    }

    async fn fetch_commit(&self, repo: &RepositoryId, sha: &str) -> Result<CommitRecord, GatherError> {
        log::debug!("Fetching commit {sha} of {repo} from GitHub");
        let (commit, check_runs) =
            try_join(self.api.commit(repo, sha), self.api.check_runs(repo, sha)).await?;

        let run_ids = workflow_run_ids(&check_runs);
        log::debug!(
            "Commit {sha} has {} check runs referencing {} workflow runs",
            check_runs.len(),
            run_ids.len()
        );
        let runs = try_join_all(run_ids.into_iter().map(|id| self.workflow_run(repo, id))).await?;

        let mut record = CommitRecord {
            repository: repo.clone(),
            commit,
            check_runs,
            merge_queue_events: vec![],
            workflow_run_ids: vec![],
            conclusion: None,
            cost: Thousandth::default(),
            start_actions_time: None,
            end_actions_time: None,
        };
        for run in &runs {
            record.add_run(run);
        }
        Ok(record)
    }
}

impl CommitRecord {
    /// Folds one workflow run into the commit aggregate.
    fn add_run(&mut self, run: &WorkflowRunRecord) {
        self.workflow_run_ids.push(run.run.id);
        self.cost = self.cost + run.cost;
        if let Some(conclusion) = &run.run.conclusion {
            if precedence(Some(conclusion)) > precedence(self.conclusion.as_deref()) {
                self.conclusion = Some(conclusion.clone());
            }
        }
        let started_at = run.run.run_started_at.or(run.run.created_at);
        self.start_actions_time = earliest(self.start_actions_time, started_at);
        self.end_actions_time = self.end_actions_time.max(run.run_completed_at);
    }
}

/// Higher wins. Equal ranks keep the conclusion that was seen first.
fn precedence(conclusion: Option<&str>) -> u8 {
    match conclusion {
        None => 0,
        Some("failure") => 4,
        Some("timed_out") => 3,
        Some("in_progress") => 2,
        Some(_) => 1,
    }
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

static RUN_URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/actions/runs/(\d+)").unwrap());

/// Workflow runs referenced by completed check runs, ascending.
pub fn workflow_run_ids(check_runs: &[CheckRun]) -> Vec<RunId> {
    let mut ids = BTreeSet::new();
    for check_run in check_runs {
        if !check_run.is_completed() {
            log::warn!(
                "Check run '{}' ({}) is not completed, skipping it",
                check_run.name,
                check_run.id
            );
            continue;
        }
        let id = [&check_run.html_url, &check_run.details_url]
            .into_iter()
            .flatten()
            .find_map(|url| RUN_URL.captures(url))
            .and_then(|captures| captures[1].parse::<u64>().ok());
        match id {
            Some(id) => {
                ids.insert(id);
            }
            None => log::warn!(
                "Check run '{}' ({}) does not reference a workflow run",
                check_run.name,
                check_run.id
            ),
        }
    }
    ids.into_iter().map(RunId).collect()
}
