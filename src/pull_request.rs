use std::collections::BTreeSet;

use futures_util::future::{try_join, try_join_all};
use futures_util::TryFutureExt;

use crate::cache::{CacheKey, EntityKind};
use crate::client::CiApi;
use crate::commit::CommitRecord;
use crate::error::GatherError;
use crate::gather::Gatherer;
use crate::merge_queue::{merge_queue_events, MergeQueueEvent};
use crate::models::PullRequest;
use crate::RepositoryId;

/// A pull request with every commit that ran CI for it, including the
/// temporary commits the merge queue created.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PullRequestRecord {
    pub repository: RepositoryId,
    pub pull_request: PullRequest,
    pub merge_queue_events: Vec<MergeQueueEvent>,
    /// Sorted by author date.
    pub commits: Vec<CommitRecord>,
}

impl PullRequestRecord {
    pub fn number(&self) -> u64 {
        self.pull_request.number
    }

    pub fn cost(&self) -> crate::cost::Thousandth {
        self.commits.iter().map(|commit| commit.cost).sum()
    }
}

impl<A: CiApi> Gatherer<A> {
    pub async fn pull_request(
        &self,
        repo: &RepositoryId,
        number: u64,
    ) -> Result<PullRequestRecord, GatherError> {
        let key = CacheKey::new(repo, EntityKind::PullRequest, number);
        self.cache
            .fetch_or_compute(&key, self.options.force_update, || {
                self.fetch_pull_request(repo, number)
            })
            .await
            .map_err(|source| GatherError::PullRequest {
                number,
                source: Box::new(source),
            })
    }

    async fn fetch_pull_request(
        &self,
        repo: &RepositoryId,
        number: u64,
    ) -> Result<PullRequestRecord, GatherError> {
        log::debug!("Fetching pull request {number} of {repo} from GitHub");
        let pull_request = self.api.pull_request(repo, number).await?;
        let (listed, events) = try_join(
            self.api
                .pull_request_commits(repo, number)
                .err_into::<GatherError>(),
            merge_queue_events(&self.api, repo, number),
        )
        .await?;

        // Merge queue commits that were also pushed to the branch are
        // gathered once.
        let mut shas = listed
            .into_iter()
            .map(|commit| commit.sha)
            .collect::<BTreeSet<_>>();
        for sha in events.iter().filter_map(|event| event.commit.as_deref()) {
            if shas.insert(sha.to_string()) {
                log::trace!("Commit {sha} of pull request {number} was only seen by the merge queue");
            }
        }

        let tagged = &events;
        let mut commits = try_join_all(shas.iter().map(|sha| async move {
            let mut record = self.commit(repo, sha).await?;
            record.merge_queue_events = tagged
                .iter()
                .filter(|event| event.commit.as_deref() == Some(sha.as_str()))
                .cloned()
                .collect();
            Ok::<_, GatherError>(record)
        }))
        .await?;
        commits.sort_by_key(|commit| commit.commit.author_date());
        log::info!(
            "Gathered pull request {number} of {repo} with {} commits and {} merge queue events",
            commits.len(),
            events.len()
        );

        Ok(PullRequestRecord {
            repository: repo.clone(),
            pull_request,
            merge_queue_events: events,
            commits,
        })
    }
}
