use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use octocrab::models::RunId;
use octocrab::service::middleware::retry::RetryConfig;
use octocrab::{FromResponse, Octocrab, Page};
use reqwest::header::LOCATION;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::models::{
    AddedToMergeQueue, Artifact, CheckRun, CheckRunsPage, Commit, Job, PullRequest,
    RemovedFromMergeQueue, Run, UsageReport,
};
use crate::ratelimit::{Quota, RateLimiter, Verdict};
use crate::RepositoryId;

const USER_AGENT: &str = concat!("ci-gather/", env!("CARGO_PKG_VERSION"));

/// Remote queries the gatherers are built on.
#[async_trait]
pub trait CiApi: Send + Sync {
    async fn workflow_run(&self, repo: &RepositoryId, run_id: RunId) -> Result<Run, ApiError>;

    /// All jobs of a run, every attempt included.
    async fn workflow_jobs(&self, repo: &RepositoryId, run_id: RunId) -> Result<Vec<Job>, ApiError>;

    async fn workflow_usage(
        &self,
        repo: &RepositoryId,
        run_id: RunId,
    ) -> Result<UsageReport, ApiError>;

    async fn workflow_artifacts(
        &self,
        repo: &RepositoryId,
        run_id: RunId,
    ) -> Result<Vec<Artifact>, ApiError>;

    /// Raw bytes of the artifact archive.
    async fn download_artifact(
        &self,
        repo: &RepositoryId,
        artifact_id: u64,
    ) -> Result<Vec<u8>, ApiError>;

    async fn commit(&self, repo: &RepositoryId, sha: &str) -> Result<Commit, ApiError>;

    async fn check_runs(&self, repo: &RepositoryId, sha: &str) -> Result<Vec<CheckRun>, ApiError>;

    async fn pull_request(&self, repo: &RepositoryId, number: u64)
        -> Result<PullRequest, ApiError>;

    async fn pull_request_commits(
        &self,
        repo: &RepositoryId,
        number: u64,
    ) -> Result<Vec<Commit>, ApiError>;

    /// `AddedToMergeQueueEvent` timeline items, in whatever order GitHub sends them.
    async fn merge_queue_added(
        &self,
        repo: &RepositoryId,
        number: u64,
    ) -> Result<Vec<AddedToMergeQueue>, ApiError>;

    /// `RemovedFromMergeQueueEvent` timeline items, in whatever order GitHub sends them.
    async fn merge_queue_removed(
        &self,
        repo: &RepositoryId,
        number: u64,
    ) -> Result<Vec<RemovedFromMergeQueue>, ApiError>;
}

/// Fetches `first` and then every page the previous one links to as
/// `rel="next"`.
async fn collect_pages<T, F, Fut>(first: String, mut fetch_page: F) -> Result<Vec<T>, ApiError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<Page<T>, ApiError>>,
{
    let mut items = vec![];
    let mut next = Some(first);
    while let Some(route) = next {
        let mut page = fetch_page(route).await?;
        items.append(&mut page.take_items());
        next = page.next.map(|uri| uri.to_string());
    }
    Ok(items)
}

/// Outcome of a single request attempt.
enum Attempt<T> {
    Done(T),
    Retry(Duration),
}

fn log_exchange(method: &str, route: &str, status: StatusCode, elapsed: Duration, quota: Quota) {
    log::debug!(
        "GitHub API {method} {route}: {status} in {elapsed:?} ({} calls remaining)",
        quota
            .remaining
            .map(|remaining| remaining.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    );
}

pub struct GitHubApi {
    client: Octocrab,
    /// Resolves artifact redirects without following them.
    redirect_client: reqwest::Client,
    /// Fetches artifact payloads from the storage host, without credentials.
    download_client: reqwest::Client,
    rate_limiter: RateLimiter,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
    download_timeout: Duration,
    per_page: u8,
}

impl GitHubApi {
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        let mut builder = Octocrab::builder();
        // Retrying is left to the rate limiter, anything else fails the call.
        builder.add_retry_config(RetryConfig::None);
        let mut builder = builder.base_uri(config.base_url.as_str())?;
        if let Some(token) = &config.token {
            builder = builder.personal_token(token.clone());
        }
        let client = builder.build()?;

        let redirect_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let download_client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;

        Ok(Self {
            client,
            redirect_client,
            download_client,
            rate_limiter: RateLimiter::new(
                config.sleep_when_rate_limited,
                config.max_rate_limit_retries,
            ),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
            timeout: config.timeout,
            download_timeout: config.download_timeout,
            per_page: config.per_page,
        })
    }

    pub fn from_env() -> Result<Self, ApiError> {
        Self::new(ApiConfig::from_env())
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Sends one request through the rate-limit middleware and decodes the
    /// body. Non-2xx answers that are not rate limits come back as
    /// `ApiError::Status`.
    async fn execute<T>(&self, route: &str, body: Option<&Value>) -> Result<T, ApiError>
    where
        T: FromResponse + Send,
    {
        let mut attempt = 0u32;
        loop {
            self.wait_for_quota().await;

            let outcome = tokio::time::timeout(self.timeout, self.attempt(route, body, attempt))
                .await
                .map_err(|_| ApiError::Timeout {
                    route: route.to_string(),
                    timeout: self.timeout,
                })??;
            match outcome {
                Attempt::Done(value) => return Ok(value),
                Attempt::Retry(delay) => {
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt<T>(
        &self,
        route: &str,
        body: Option<&Value>,
        attempt: u32,
    ) -> Result<Attempt<T>, ApiError>
    where
        T: FromResponse + Send,
    {
        let method = if body.is_some() { "POST" } else { "GET" };
        let start = Instant::now();
        let response = match body {
            Some(body) => self.client._post(route, Some(body)).await?,
            None => self.client._get(route).await?,
        };
        let status = response.status();
        let quota = Quota::from_headers(response.headers());
        self.rate_limiter.record(quota);
        log_exchange(method, route, status, start.elapsed(), quota);

        match self
            .rate_limiter
            .verdict(status, response.headers(), attempt, Utc::now())
        {
            Verdict::Proceed => {}
            Verdict::Retry(delay) => return Ok(Attempt::Retry(delay)),
            Verdict::GiveUp => {
                return Err(ApiError::RateLimited {
                    route: route.to_string(),
                    attempts: attempt + 1,
                })
            }
        }

        if !status.is_success() {
            return Err(ApiError::Status {
                route: route.to_string(),
                status: status.as_u16(),
                body: self.client.body_to_string(response).await?,
            });
        }
        Ok(Attempt::Done(T::from_response(response).await?))
    }

    async fn wait_for_quota(&self) {
        if let Some(delay) = self.rate_limiter.delay_before_request(Utc::now()) {
            log::warn!("GitHub API quota exhausted, sleeping {delay:?} until limit reset");
            tokio::time::sleep(delay).await;
        }
    }

    async fn get_json<T>(&self, route: &str) -> Result<T, ApiError>
    where
        T: DeserializeOwned + Send,
    {
        self.execute(route, None).await
    }

    fn paged_route(&self, route: &str, page: u32) -> String {
        let separator = if route.contains('?') { '&' } else { '?' };
        format!("{route}{separator}per_page={}&page={page}", self.per_page)
    }

    /// Every item of a listing octocrab can page, following its `Link`
    /// headers.
    async fn all_pages<T>(&self, route: &str) -> Result<Vec<T>, ApiError>
    where
        T: DeserializeOwned + Send,
    {
        collect_pages(self.paged_route(route, 1), |route| async move {
            self.execute::<Page<T>>(&route, None).await
        })
        .await
    }

    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, ApiError> {
        let payload = json!({ "query": query, "variables": variables });
        let envelope: GraphQlResponse = self.execute("/graphql", Some(&payload)).await?;
        if !envelope.errors.is_empty() {
            let messages = envelope
                .errors
                .into_iter()
                .map(|error| error.message)
                .collect::<Vec<_>>();
            return Err(ApiError::GraphQl(messages.join("; ")));
        }
        envelope
            .data
            .ok_or_else(|| ApiError::GraphQl("response carried no data".to_string()))
    }

    /// Pages through one kind of pull request timeline item.
    async fn timeline<T: DeserializeOwned>(
        &self,
        repo: &RepositoryId,
        number: u64,
        item_type: &str,
        fragment: &str,
    ) -> Result<Vec<T>, ApiError> {
        let pr_number =
            i32::try_from(number).map_err(|_| ApiError::InvalidPullRequestNumber(number))?;
        let query = format!(
            "query($owner: String!, $repo: String!, $number: Int!, $cursor: String) {{
  repository(owner: $owner, name: $repo) {{
    pullRequest(number: $number) {{
      timelineItems(itemTypes: [{item_type}], first: 100, after: $cursor) {{
        pageInfo {{ hasNextPage endCursor }}
        nodes {{ ... on {fragment} }}
      }}
    }}
  }}
}}"
        );

        let mut items = vec![];
        let mut cursor: Option<String> = None;
        loop {
            let variables = json!({
                "owner": repo.owner,
                "repo": repo.name,
                "number": pr_number,
                "cursor": cursor,
            });
            let data = self.graphql(&query, variables).await?;
            let timeline: TimelineData<T> =
                serde_json::from_value(data).map_err(|source| ApiError::Malformed {
                    route: "/graphql".to_string(),
                    source,
                })?;
            let timeline_items = timeline.repository.pull_request.timeline_items;
            items.extend(timeline_items.nodes);
            match timeline_items.page_info {
                PageInfo {
                    has_next_page: true,
                    end_cursor: Some(end_cursor),
                } => cursor = Some(end_cursor),
                _ => break,
            }
        }
        Ok(items)
    }

    /// Asks the API where the artifact archive lives.
    async fn artifact_location(&self, route: &str) -> Result<String, ApiError> {
        let url = format!("{}{route}", self.base_url);
        let mut attempt = 0u32;
        loop {
            self.wait_for_quota().await;

            let mut request = self.redirect_client.get(&url);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            let start = Instant::now();
            let response = tokio::time::timeout(self.timeout, request.send())
                .await
                .map_err(|_| ApiError::Timeout {
                    route: route.to_string(),
                    timeout: self.timeout,
                })??;
            let status = response.status();
            let quota = Quota::from_headers(response.headers());
            self.rate_limiter.record(quota);
            log_exchange("GET", route, status, start.elapsed(), quota);

            match self
                .rate_limiter
                .verdict(status, response.headers(), attempt, Utc::now())
            {
                Verdict::Proceed => {}
                Verdict::Retry(delay) => {
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Verdict::GiveUp => {
                    return Err(ApiError::RateLimited {
                        route: route.to_string(),
                        attempts: attempt + 1,
                    })
                }
            }

            let location = status
                .is_redirection()
                .then(|| response.headers().get(LOCATION))
                .flatten()
                .and_then(|value| value.to_str().ok());
            return match location {
                Some(location) => Ok(location.to_string()),
                None => Err(ApiError::Redirect {
                    route: route.to_string(),
                    status: status.as_u16(),
                }),
            };
        }
    }
}

#[derive(serde::Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(serde::Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(serde::Deserialize)]
struct TimelineData<T> {
    repository: TimelineRepository<T>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimelineRepository<T> {
    pull_request: TimelinePullRequest<T>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimelinePullRequest<T> {
    timeline_items: TimelineItems<T>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimelineItems<T> {
    page_info: PageInfo,
    nodes: Vec<T>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    #[serde(default)]
    end_cursor: Option<String>,
}

#[async_trait]
impl CiApi for GitHubApi {
    async fn workflow_run(&self, repo: &RepositoryId, run_id: RunId) -> Result<Run, ApiError> {
        self.get_json(&format!(
            "/repos/{}/{}/actions/runs/{run_id}",
            repo.owner, repo.name
        ))
        .await
    }

    async fn workflow_jobs(&self, repo: &RepositoryId, run_id: RunId) -> Result<Vec<Job>, ApiError> {
        let route = format!(
            "/repos/{}/{}/actions/runs/{run_id}/jobs?filter=all",
            repo.owner, repo.name
        );
        self.all_pages(&route).await
    }

    async fn workflow_usage(
        &self,
        repo: &RepositoryId,
        run_id: RunId,
    ) -> Result<UsageReport, ApiError> {
        self.get_json(&format!(
            "/repos/{}/{}/actions/runs/{run_id}/timing",
            repo.owner, repo.name
        ))
        .await
    }

    async fn workflow_artifacts(
        &self,
        repo: &RepositoryId,
        run_id: RunId,
    ) -> Result<Vec<Artifact>, ApiError> {
        let route = format!(
            "/repos/{}/{}/actions/runs/{run_id}/artifacts",
            repo.owner, repo.name
        );
        self.all_pages(&route).await
    }

    async fn download_artifact(
        &self,
        repo: &RepositoryId,
        artifact_id: u64,
    ) -> Result<Vec<u8>, ApiError> {
        let route = format!(
            "/repos/{}/{}/actions/artifacts/{artifact_id}/zip",
            repo.owner, repo.name
        );
        let location = self.artifact_location(&route).await?;
        log::trace!("Downloading artifact {artifact_id} from {location}");

        let download = async {
            let response = self
                .download_client
                .get(&location)
                .send()
                .await?
                .error_for_status()?;
            Ok::<_, reqwest::Error>(response.bytes().await?.to_vec())
        };
        let payload = tokio::time::timeout(self.download_timeout, download)
            .await
            .map_err(|_| ApiError::Timeout {
                route: location.clone(),
                timeout: self.download_timeout,
            })??;
        Ok(payload)
    }

    async fn commit(&self, repo: &RepositoryId, sha: &str) -> Result<Commit, ApiError> {
        self.get_json(&format!("/repos/{}/{}/commits/{sha}", repo.owner, repo.name))
            .await
    }

    async fn check_runs(&self, repo: &RepositoryId, sha: &str) -> Result<Vec<CheckRun>, ApiError> {
        let route = format!(
            "/repos/{}/{}/commits/{sha}/check-runs?filter=all",
            repo.owner, repo.name
        );
        // octocrab's `Page` does not know the `check_runs` envelope, so this
        // listing is paged by its `total_count`.
        let mut check_runs = vec![];
        let mut page = 1;
        loop {
            let body: CheckRunsPage = self.get_json(&self.paged_route(&route, page)).await?;
            let last = body.check_runs.is_empty();
            check_runs.extend(body.check_runs);
            if last || check_runs.len() as u64 >= body.total_count {
                return Ok(check_runs);
            }
            page += 1;
        }
    }

    async fn pull_request(
        &self,
        repo: &RepositoryId,
        number: u64,
    ) -> Result<PullRequest, ApiError> {
        self.get_json(&format!("/repos/{}/{}/pulls/{number}", repo.owner, repo.name))
            .await
    }

    async fn pull_request_commits(
        &self,
        repo: &RepositoryId,
        number: u64,
    ) -> Result<Vec<Commit>, ApiError> {
        let route = format!("/repos/{}/{}/pulls/{number}/commits", repo.owner, repo.name);
        self.all_pages(&route).await
    }

    async fn merge_queue_added(
        &self,
        repo: &RepositoryId,
        number: u64,
    ) -> Result<Vec<AddedToMergeQueue>, ApiError> {
        self.timeline(
            repo,
            number,
            "ADDED_TO_MERGE_QUEUE_EVENT",
            "AddedToMergeQueueEvent { id createdAt actor { login } enqueuer { login } }",
        )
        .await
    }

    async fn merge_queue_removed(
        &self,
        repo: &RepositoryId,
        number: u64,
    ) -> Result<Vec<RemovedFromMergeQueue>, ApiError> {
        self.timeline(
            repo,
            number,
            "REMOVED_FROM_MERGE_QUEUE_EVENT",
            "RemovedFromMergeQueueEvent { id createdAt actor { login } reason beforeCommit { oid } }",
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    fn page<T>(items: Vec<T>, next: Option<u32>) -> Page<T> {
        let mut page = Page::default();
        page.items = items;
        page.next = next.map(|next| {
            format!("https://api.github.com/repositories/1/pulls/2/commits?per_page=100&page={next}")
                .parse()
                .unwrap()
        });
        page
    }

    fn page_number(route: &str) -> u32 {
        route.rsplit("page=").next().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn paged_route_keeps_existing_query() {
        let api = GitHubApi::new(ApiConfig::default()).unwrap();
        assert_eq!(
            api.paged_route("/repos/o/r/actions/runs/1/jobs?filter=all", 1),
            "/repos/o/r/actions/runs/1/jobs?filter=all&per_page=100&page=1"
        );
        assert_eq!(
            api.paged_route("/repos/o/r/pulls/2/commits", 3),
            "/repos/o/r/pulls/2/commits?per_page=100&page=3"
        );
    }

    #[tokio::test]
    async fn collects_every_item_across_uneven_pages() {
        for sizes in [vec![], vec![7], vec![3, 3, 1], vec![1, 5, 0, 2], vec![0]] {
            let total: usize = sizes.iter().sum();
            let mut pages: VecDeque<Vec<usize>> = VecDeque::new();
            let mut next = 0;
            for size in &sizes {
                pages.push_back((next..next + size).collect());
                next += size;
            }
            if pages.is_empty() {
                pages.push_back(vec![]);
            }
            let page_count = pages.len() as u32;
            let mut requested = vec![];

            let first = "/repos/o/r/pulls/2/commits?per_page=100&page=1".to_string();
            let items = collect_pages(first, |route| {
                let number = page_number(&route);
                requested.push(number);
                let items = pages.pop_front().unwrap_or_default();
                async move { Ok(page(items, (number < page_count).then_some(number + 1))) }
            })
            .await
            .unwrap();

            assert_eq!(items, (0..total).collect::<Vec<_>>());
            assert_eq!(requested, (1..=page_count).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn next_link_is_followed_as_absolute_uri() {
        let mut requested = vec![];
        let first = "/repos/o/r/pulls/2/commits?per_page=100&page=1".to_string();
        let items = collect_pages(first, |route| {
            requested.push(route.clone());
            async move {
                let number = page_number(&route);
                Ok(page(vec![number], (number == 1).then_some(2)))
            }
        })
        .await
        .unwrap();

        assert_eq!(items, vec![1, 2]);
        assert_eq!(
            requested[1],
            "https://api.github.com/repositories/1/pulls/2/commits?per_page=100&page=2"
        );
    }

    #[tokio::test]
    async fn page_error_stops_pagination() {
        let mut calls = 0;
        let first = "/x?page=1".to_string();
        let result: Result<Vec<u32>, ApiError> = collect_pages(first, |route| {
            calls += 1;
            async move {
                let number = page_number(&route);
                if number == 2 {
                    Err(ApiError::GraphQl("boom".to_string()))
                } else {
                    Ok(page(vec![number], Some(number + 1)))
                }
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }
}
