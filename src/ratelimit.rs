//! Rate-limit middleware for the GitHub client.
//!
//! The limiter keeps the last quota GitHub reported and decides, per response,
//! whether the request was rejected because the quota ran out and how long to
//! back off before trying again.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;

/// Remaining calls at which the low quota warning starts.
const LOW_QUOTA_WARNING: u64 = 50;
/// Back off used for secondary rate limits that carry neither `Retry-After`
/// nor an exhausted primary quota.
const SECONDARY_LIMIT_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quota {
    pub remaining: Option<u64>,
    pub limit: Option<u64>,
    pub used: Option<u64>,
    pub reset: Option<DateTime<Utc>>,
}

impl Quota {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            remaining: header_u64(headers, "x-ratelimit-remaining"),
            limit: header_u64(headers, "x-ratelimit-limit"),
            used: header_u64(headers, "x-ratelimit-used"),
            reset: header_u64(headers, "x-ratelimit-reset")
                .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single()),
        }
    }

    fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }
}

/// What the client should do with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    Retry(Duration),
    GiveUp,
}

#[derive(Debug)]
pub struct RateLimiter {
    sleep_when_limited: bool,
    max_retries: u32,
    quota: Mutex<Quota>,
}

impl RateLimiter {
    pub fn new(sleep_when_limited: bool, max_retries: u32) -> Self {
        Self {
            sleep_when_limited,
            max_retries,
            quota: Mutex::new(Quota::default()),
        }
    }

    pub fn quota(&self) -> Quota {
        *self.quota.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores the quota carried by a response. Responses without rate-limit
    /// headers (e.g. redirects) leave the known state untouched.
    pub fn record(&self, quota: Quota) {
        if quota.remaining.is_none() {
            return;
        }
        *self.quota.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = quota;

        if let Some(remaining) = quota.remaining {
            if remaining <= LOW_QUOTA_WARNING && remaining % 10 == 0 {
                log::warn!(
                    "GitHub API request nearing rate limit: {remaining} of {} calls remaining, reset at {}",
                    quota.limit.unwrap_or_default(),
                    quota
                        .reset
                        .map(|reset| reset.to_rfc3339())
                        .unwrap_or_else(|| "unknown".to_string())
                );
            }
        }
    }

    /// How long to wait before sending a request, when the last known quota is
    /// already spent and its reset lies in the future.
    pub fn delay_before_request(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.sleep_when_limited {
            return None;
        }
        let quota = self.quota();
        if !quota.is_exhausted() {
            return None;
        }
        let reset = quota.reset?;
        (reset - now).to_std().ok().filter(|delay| !delay.is_zero())
    }

    /// Classifies a response. `attempt` counts the retries already made for
    /// this request.
    pub fn verdict(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Verdict {
        let Some(delay) = rate_limit_delay(status, headers, now) else {
            return Verdict::Proceed;
        };
        if !self.sleep_when_limited || attempt >= self.max_retries {
            return Verdict::GiveUp;
        }
        log::warn!(
            "GitHub API rate limit hit (status {status}), sleeping {delay:?} until limit reset"
        );
        Verdict::Retry(delay)
    }
}

/// Returns the back off for a rate-limited response, `None` when the response
/// is not a rate-limit rejection.
fn rate_limit_delay(status: StatusCode, headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    if status != StatusCode::FORBIDDEN && status != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }
    if let Some(secs) = header_u64(headers, "retry-after") {
        return Some(Duration::from_secs(secs));
    }
    let quota = Quota::from_headers(headers);
    if quota.is_exhausted() {
        let delay = quota
            .reset
            .and_then(|reset| (reset - now).to_std().ok())
            .unwrap_or_default();
        return Some(delay);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Some(SECONDARY_LIMIT_BACKOFF);
    }
    // A plain 403 is a permission problem, not a limit.
    None
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use reqwest::header::{HeaderMap, HeaderValue};

    use super::*;

    fn headers(pairs: &[(&'static str, String)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 20, 0, 0, 0).unwrap()
    }

    #[test]
    fn parses_quota_headers() {
        let reset = now() + chrono::Duration::seconds(30);
        let quota = Quota::from_headers(&headers(&[
            ("x-ratelimit-remaining", "12".to_string()),
            ("x-ratelimit-limit", "5000".to_string()),
            ("x-ratelimit-used", "4988".to_string()),
            ("x-ratelimit-reset", reset.timestamp().to_string()),
        ]));
        assert_eq!(quota.remaining, Some(12));
        assert_eq!(quota.limit, Some(5000));
        assert_eq!(quota.used, Some(4988));
        assert_eq!(quota.reset, Some(reset));
    }

    #[test]
    fn exhausted_quota_waits_until_reset() {
        let limiter = RateLimiter::new(true, 3);
        let reset = now() + chrono::Duration::seconds(42);
        let response_headers = headers(&[
            ("x-ratelimit-remaining", "0".to_string()),
            ("x-ratelimit-reset", reset.timestamp().to_string()),
        ]);
        assert_eq!(
            limiter.verdict(StatusCode::FORBIDDEN, &response_headers, 0, now()),
            Verdict::Retry(Duration::from_secs(42))
        );

        limiter.record(Quota::from_headers(&response_headers));
        assert_eq!(limiter.delay_before_request(now()), Some(Duration::from_secs(42)));
        assert_eq!(limiter.delay_before_request(reset), None);
    }

    #[test]
    fn retry_after_takes_precedence() {
        let limiter = RateLimiter::new(true, 3);
        let response_headers = headers(&[
            ("retry-after", "7".to_string()),
            ("x-ratelimit-remaining", "0".to_string()),
        ]);
        assert_eq!(
            limiter.verdict(StatusCode::TOO_MANY_REQUESTS, &response_headers, 0, now()),
            Verdict::Retry(Duration::from_secs(7))
        );
    }

    #[test]
    fn plain_forbidden_is_not_a_limit() {
        let limiter = RateLimiter::new(true, 3);
        let response_headers = headers(&[("x-ratelimit-remaining", "4000".to_string())]);
        assert_eq!(
            limiter.verdict(StatusCode::FORBIDDEN, &response_headers, 0, now()),
            Verdict::Proceed
        );
        assert_eq!(
            limiter.verdict(StatusCode::OK, &HeaderMap::new(), 0, now()),
            Verdict::Proceed
        );
    }

    #[test]
    fn gives_up_when_sleeping_is_disabled_or_retries_run_out() {
        let response_headers = headers(&[("retry-after", "1".to_string())]);
        let no_sleep = RateLimiter::new(false, 3);
        assert_eq!(
            no_sleep.verdict(StatusCode::TOO_MANY_REQUESTS, &response_headers, 0, now()),
            Verdict::GiveUp
        );
        let limiter = RateLimiter::new(true, 2);
        assert_eq!(
            limiter.verdict(StatusCode::TOO_MANY_REQUESTS, &response_headers, 2, now()),
            Verdict::GiveUp
        );
    }

    #[test]
    fn responses_without_quota_keep_known_state() {
        let limiter = RateLimiter::new(true, 3);
        limiter.record(Quota {
            remaining: Some(100),
            ..Quota::default()
        });
        limiter.record(Quota::default());
        assert_eq!(limiter.quota().remaining, Some(100));
    }
}
