//! Pairs the "added to merge queue" and "removed from merge queue" timeline
//! events of a pull request into queue occurrences.

use chrono::{DateTime, Utc};
use futures_util::future::try_join;

use crate::client::CiApi;
use crate::error::GatherError;
use crate::models::{Actor, AddedToMergeQueue, RemovedFromMergeQueue};
use crate::RepositoryId;

/// One stay of a pull request in the merge queue.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MergeQueueEvent {
    /// The SHA the queue tested, known once the pull request left the queue.
    pub commit: Option<String>,
    pub added_id: String,
    pub added_time: DateTime<Utc>,
    pub added_actor: Option<String>,
    pub added_enqueuer: Option<String>,
    pub removed_id: Option<String>,
    pub removed_time: Option<DateTime<Utc>>,
    pub removed_actor: Option<String>,
    pub removed_reason: Option<String>,
}

impl MergeQueueEvent {
    pub fn is_removed(&self) -> bool {
        self.removed_time.is_some()
    }
}

/// Fetches both timelines of a pull request and pairs them.
pub async fn merge_queue_events<A: CiApi + ?Sized>(
    api: &A,
    repo: &RepositoryId,
    number: u64,
) -> Result<Vec<MergeQueueEvent>, GatherError> {
    let (added, removed) = try_join(
        api.merge_queue_added(repo, number),
        api.merge_queue_removed(repo, number),
    )
    .await?;
    log::trace!(
        "Pull request {number} of {repo}: {} added and {} removed merge queue events",
        added.len(),
        removed.len()
    );
    pair_events(number, added, removed)
}

/// Both lists are sorted by creation time and paired by position. An
/// addition without a matching removal means the pull request is still
/// queued.
pub fn pair_events(
    number: u64,
    mut added: Vec<AddedToMergeQueue>,
    mut removed: Vec<RemovedFromMergeQueue>,
) -> Result<Vec<MergeQueueEvent>, GatherError> {
    added.sort_by_key(|event| event.created_at);
    removed.sort_by_key(|event| event.created_at);

    if removed.len() > added.len() {
        log::warn!(
            "Pull request {number} has {} 'removed' merge queue events but only {} 'added' ones, \
             ignoring the surplus",
            removed.len(),
            added.len()
        );
        removed.truncate(added.len());
    }

    let mut removed = removed.into_iter();
    added
        .into_iter()
        .map(|added| {
            let mut event = MergeQueueEvent {
                commit: None,
                added_id: added.id,
                added_time: added.created_at,
                added_actor: login(added.actor),
                added_enqueuer: login(added.enqueuer),
                removed_id: None,
                removed_time: None,
                removed_actor: None,
                removed_reason: None,
            };
            if let Some(removed) = removed.next() {
                if event.added_time > removed.created_at {
                    return Err(GatherError::MergeQueueOrder {
                        number,
                        added_id: event.added_id,
                        added_at: event.added_time,
                        removed_id: removed.id,
                        removed_at: removed.created_at,
                    });
                }
                event.commit = removed.before_commit.map(|commit| commit.oid);
                event.removed_id = Some(removed.id);
                event.removed_time = Some(removed.created_at);
                event.removed_actor = login(removed.actor);
                event.removed_reason = removed.reason;
            }
            Ok(event)
        })
        .collect()
}

fn login(actor: Option<Actor>) -> Option<String> {
    actor.map(|actor| actor.login).filter(|login| !login.is_empty())
}
