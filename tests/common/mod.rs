#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ci_gather::models::{
    Actor, AddedToMergeQueue, Artifact, BeforeCommit, CheckRun, Commit, CommitDetails, GitActor,
    Job, JobBillable, PullRequest, RemovedFromMergeQueue, Run, RunPlatformInfo, UsageReport,
};
use ci_gather::{ApiError, CiApi, RepositoryId};
use octocrab::models::{JobId, RunId};
use serde_json::Map;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn repo() -> RepositoryId {
    RepositoryId::new("kalverra", "octometrics")
}

pub fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 20, 12, 0, 0).unwrap() + chrono::Duration::minutes(minute as i64)
}

pub fn run(id: u64, status: &str, conclusion: Option<&str>) -> Run {
    Run {
        id: RunId(id),
        name: Some(format!("workflow {id}")),
        status: Some(status.to_string()),
        conclusion: conclusion.map(str::to_string),
        run_started_at: Some(at(0)),
        created_at: Some(at(0)),
        // Deliberately later than any job so tests notice if it is used.
        updated_at: Some(at(600)),
        other: Map::new(),
    }
}

pub fn job(id: u64, run_id: u64, name: &str, start: u32, end: u32) -> Job {
    Job {
        id: JobId(id),
        run_id: RunId(run_id),
        name: name.to_string(),
        status: Some("completed".to_string()),
        conclusion: Some("success".to_string()),
        started_at: at(start),
        completed_at: Some(at(end)),
        other: Map::new(),
    }
}

/// `(runner, job id, billed milliseconds)` triples.
pub fn usage(billed: &[(&str, u64, u64)]) -> UsageReport {
    let mut billable: BTreeMap<String, RunPlatformInfo> = BTreeMap::new();
    for (runner, job_id, duration_ms) in billed {
        let info = billable.entry(runner.to_string()).or_default();
        info.total_ms += duration_ms;
        info.jobs += 1;
        info.job_runs.push(JobBillable {
            job_id: JobId(*job_id),
            duration_ms: *duration_ms,
        });
    }
    UsageReport {
        billable,
        run_duration_ms: None,
    }
}

pub fn commit(sha: &str, authored_minute: u32) -> Commit {
    Commit {
        sha: sha.to_string(),
        commit: CommitDetails {
            author: Some(GitActor {
                name: Some("Octo Cat".to_string()),
                email: Some("octocat@github.com".to_string()),
                date: Some(at(authored_minute)),
            }),
            committer: None,
            message: format!("commit {sha}"),
            other: Map::new(),
        },
        other: Map::new(),
    }
}

pub fn check_run(id: u64, run_id: u64, status: &str) -> CheckRun {
    CheckRun {
        id,
        name: format!("check {id}"),
        status: Some(status.to_string()),
        conclusion: None,
        html_url: Some(format!(
            "https://github.com/kalverra/octometrics/actions/runs/{run_id}/job/{id}"
        )),
        details_url: None,
        started_at: None,
        completed_at: None,
        other: Map::new(),
    }
}

pub fn pull_request(number: u64) -> PullRequest {
    PullRequest {
        number,
        title: Some(format!("pull request {number}")),
        state: Some("closed".to_string()),
        other: Map::new(),
    }
}

pub fn added(id: &str, minute: u32) -> AddedToMergeQueue {
    AddedToMergeQueue {
        id: id.to_string(),
        created_at: at(minute),
        actor: Some(Actor {
            login: "octocat".to_string(),
        }),
        enqueuer: Some(Actor {
            login: "octocat".to_string(),
        }),
    }
}

pub fn removed(id: &str, minute: u32, sha: &str) -> RemovedFromMergeQueue {
    RemovedFromMergeQueue {
        id: id.to_string(),
        created_at: at(minute),
        actor: None,
        reason: Some("MERGED".to_string()),
        before_commit: Some(BeforeCommit {
            oid: sha.to_string(),
        }),
    }
}

/// Zips a monitoring log the way the monitoring action uploads it.
pub fn monitoring_archive(file_name: &str, lines: &[&str]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    writer
        .start_file(file_name, zip::write::FileOptions::default())
        .unwrap();
    for line in lines {
        writeln!(writer, "{line}").unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// In-memory GitHub. Missing entries answer with a 404.
#[derive(Default)]
pub struct MockApi {
    pub runs: HashMap<u64, Run>,
    pub jobs: HashMap<u64, Vec<Job>>,
    pub usage: HashMap<u64, UsageReport>,
    pub artifacts: HashMap<u64, Vec<Artifact>>,
    pub archives: HashMap<u64, Vec<u8>>,
    pub commits: HashMap<String, Commit>,
    pub check_runs: HashMap<String, Vec<CheckRun>>,
    pub pull_requests: HashMap<u64, PullRequest>,
    pub pull_request_commits: HashMap<u64, Vec<Commit>>,
    pub added: HashMap<u64, Vec<AddedToMergeQueue>>,
    pub removed: HashMap<u64, Vec<RemovedFromMergeQueue>>,
    calls: Mutex<Vec<String>>,
}

impl MockApi {
    pub fn with_run(mut self, run: Run, jobs: Vec<Job>, usage: UsageReport) -> Self {
        let id = run.id.0;
        self.runs.insert(id, run);
        self.jobs.insert(id, jobs);
        self.usage.insert(id, usage);
        self
    }

    pub fn with_artifact(mut self, run_id: u64, artifact_id: u64, name: &str, archive: Vec<u8>) -> Self {
        self.artifacts.entry(run_id).or_default().push(Artifact {
            id: artifact_id,
            name: name.to_string(),
            expired: false,
            other: Map::new(),
        });
        self.archives.insert(artifact_id, archive);
        self
    }

    pub fn with_commit(mut self, commit: Commit, check_runs: Vec<CheckRun>) -> Self {
        self.check_runs.insert(commit.sha.clone(), check_runs);
        self.commits.insert(commit.sha.clone(), commit);
        self
    }

    /// Number of calls whose name starts with `prefix`.
    pub fn calls(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn not_found<T>(route: String) -> Result<T, ApiError> {
    Err(ApiError::Status {
        route,
        status: 404,
        body: r#"{"message":"Not Found"}"#.to_string(),
    })
}

fn lookup<K, T>(map: &HashMap<K, T>, key: &K, route: String) -> Result<T, ApiError>
where
    K: std::hash::Hash + Eq,
    T: Clone,
{
    match map.get(key) {
        Some(value) => Ok(value.clone()),
        None => not_found(route),
    }
}

#[async_trait]
impl CiApi for MockApi {
    async fn workflow_run(&self, _repo: &RepositoryId, run_id: RunId) -> Result<Run, ApiError> {
        self.record(format!("workflow_run {run_id}"));
        lookup(&self.runs, &run_id.0, format!("runs/{run_id}"))
    }

    async fn workflow_jobs(&self, _repo: &RepositoryId, run_id: RunId) -> Result<Vec<Job>, ApiError> {
        self.record(format!("workflow_jobs {run_id}"));
        lookup(&self.jobs, &run_id.0, format!("runs/{run_id}/jobs"))
    }

    async fn workflow_usage(
        &self,
        _repo: &RepositoryId,
        run_id: RunId,
    ) -> Result<UsageReport, ApiError> {
        self.record(format!("workflow_usage {run_id}"));
        lookup(&self.usage, &run_id.0, format!("runs/{run_id}/timing"))
    }

    async fn workflow_artifacts(
        &self,
        _repo: &RepositoryId,
        run_id: RunId,
    ) -> Result<Vec<Artifact>, ApiError> {
        self.record(format!("workflow_artifacts {run_id}"));
        Ok(self.artifacts.get(&run_id.0).cloned().unwrap_or_default())
    }

    async fn download_artifact(
        &self,
        _repo: &RepositoryId,
        artifact_id: u64,
    ) -> Result<Vec<u8>, ApiError> {
        self.record(format!("download_artifact {artifact_id}"));
        lookup(&self.archives, &artifact_id, format!("artifacts/{artifact_id}/zip"))
    }

    async fn commit(&self, _repo: &RepositoryId, sha: &str) -> Result<Commit, ApiError> {
        self.record(format!("commit {sha}"));
        lookup(&self.commits, &sha.to_string(), format!("commits/{sha}"))
    }

    async fn check_runs(&self, _repo: &RepositoryId, sha: &str) -> Result<Vec<CheckRun>, ApiError> {
        self.record(format!("check_runs {sha}"));
        Ok(self.check_runs.get(sha).cloned().unwrap_or_default())
    }

    async fn pull_request(
        &self,
        _repo: &RepositoryId,
        number: u64,
    ) -> Result<PullRequest, ApiError> {
        self.record(format!("pull_request {number}"));
        lookup(&self.pull_requests, &number, format!("pulls/{number}"))
    }

    async fn pull_request_commits(
        &self,
        _repo: &RepositoryId,
        number: u64,
    ) -> Result<Vec<Commit>, ApiError> {
        self.record(format!("pull_request_commits {number}"));
        Ok(self.pull_request_commits.get(&number).cloned().unwrap_or_default())
    }

    async fn merge_queue_added(
        &self,
        _repo: &RepositoryId,
        number: u64,
    ) -> Result<Vec<AddedToMergeQueue>, ApiError> {
        self.record(format!("merge_queue_added {number}"));
        Ok(self.added.get(&number).cloned().unwrap_or_default())
    }

    async fn merge_queue_removed(
        &self,
        _repo: &RepositoryId,
        number: u64,
    ) -> Result<Vec<RemovedFromMergeQueue>, ApiError> {
        self.record(format!("merge_queue_removed {number}"));
        Ok(self.removed.get(&number).cloned().unwrap_or_default())
    }
}
