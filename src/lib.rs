//! Gathers GitHub Actions execution data for commits, pull requests and
//! workflow runs, prices every job and memoizes the enriched records on disk.

pub mod cache;
pub mod client;
pub mod commit;
pub mod config;
pub mod cost;
pub mod error;
pub mod gather;
pub mod merge_queue;
pub mod models;
pub mod monitor;
pub mod pull_request;
pub mod ratelimit;
pub mod workflow_run;

pub use client::{CiApi, GitHubApi};
pub use commit::CommitRecord;
pub use config::{ApiConfig, GatherOptions};
pub use cost::Thousandth;
pub use error::{ApiError, GatherError};
pub use gather::Gatherer;
pub use merge_queue::MergeQueueEvent;
pub use pull_request::PullRequestRecord;
pub use workflow_run::{JobRecord, WorkflowRunRecord};

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RepositoryId {
    pub owner: String,
    pub name: String,
}

impl RepositoryId {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}
