use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use octocrab::models::{JobId, RunId};
use thiserror::Error;

/// Failures talking to GitHub. None of these are retried here; the only retry
/// happens inside the rate-limit middleware before one of them is produced.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("GitHub API timeout after {timeout:?} on {route}")]
    Timeout { route: String, timeout: Duration },

    #[error("unexpected status code {status} on {route}: {body}")]
    Status {
        route: String,
        status: u16,
        body: String,
    },

    #[error("rate limit still exhausted on {route} after {attempts} attempts")]
    RateLimited { route: String, attempts: u32 },

    #[error("malformed response from {route}: {source}")]
    Malformed {
        route: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("GraphQL query failed: {0}")]
    GraphQl(String),

    #[error("pull request number {0} is too large for the GraphQL API")]
    InvalidPullRequestNumber(u64),

    #[error("expected a redirect from {route}, got status code {status}")]
    Redirect { route: String, status: u16 },

    #[error(transparent)]
    Octocrab(#[from] octocrab::Error),

    #[error(transparent)]
    Download(#[from] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum GatherError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("workflow run '{id}' is not completed (status '{status}')")]
    RunNotCompleted { id: RunId, status: String },

    #[error("no rate available for runner {runner} (job '{job_id}')")]
    UnknownRunner { job_id: JobId, runner: String },

    #[error(
        "'added' merge queue event {added_id} at {added_at} is after the corresponding \
         'removed' merge queue event {removed_id} at {removed_at} for pull request {number}"
    )]
    MergeQueueOrder {
        number: u64,
        added_id: String,
        added_at: DateTime<Utc>,
        removed_id: String,
        removed_at: DateTime<Utc>,
    },

    #[error("failed to read cached data from {}: {source}", path.display())]
    CacheRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode cached data from {}: {source}", path.display())]
    CacheDecode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write cached data to {}: {source}", path.display())]
    CacheWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode monitoring artifact '{artifact}': {source:#}")]
    Monitoring {
        artifact: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to gather workflow run '{id}': {source}")]
    WorkflowRun {
        id: RunId,
        #[source]
        source: Box<GatherError>,
    },

    #[error("failed to gather commit '{sha}': {source}")]
    Commit {
        sha: String,
        #[source]
        source: Box<GatherError>,
    },

    #[error("failed to gather pull request {number}: {source}")]
    PullRequest {
        number: u64,
        #[source]
        source: Box<GatherError>,
    },
}

impl GatherError {
    /// Strips the entity wrappers added on the way up and returns the error
    /// that actually stopped the gather.
    pub fn root(&self) -> &GatherError {
        match self {
            GatherError::WorkflowRun { source, .. }
            | GatherError::Commit { source, .. }
            | GatherError::PullRequest { source, .. } => source.root(),
            other => other,
        }
    }
}
