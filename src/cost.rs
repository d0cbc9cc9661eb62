use std::fmt::{Display, Formatter};
use std::iter::Sum;
use std::ops::Add;

use octocrab::models::JobId;

use crate::error::GatherError;
use crate::models::UsageReport;

/// Runner reported for jobs that do not show up in the usage report.
pub const FREE_RUNNER: &str = "Free";

/// Cost in thousandths of a dollar (tenths of a cent).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct Thousandth(pub u64);

impl Add for Thousandth {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sum for Thousandth {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Self(iter.map(|v| v.0).sum::<u64>())
    }
}

impl Display for Thousandth {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}", self.0 as f64 / 1000.0)
    }
}

/// Finds the job in the usage report and prices it.
///
/// Only whole minutes are billed, partial minutes are dropped.
pub fn cost_of(job_id: JobId, usage: &UsageReport) -> Result<(String, Thousandth), GatherError> {
    for (runner, info) in &usage.billable {
        let Some(job) = info.job_runs.iter().find(|job| job.job_id == job_id) else {
            continue;
        };
        let per_minute = rate_per_minute(runner).ok_or_else(|| GatherError::UnknownRunner {
            job_id,
            runner: runner.clone(),
        })?;
        let minutes = job.duration_ms / 60_000;
        return Ok((runner.clone(), Thousandth(per_minute.0 * minutes)));
    }
    Ok((FREE_RUNNER.to_string(), Thousandth(0)))
}

/// Taken from:
/// https://docs.github.com/en/billing/managing-billing-for-your-products/managing-billing-for-github-actions/about-billing-for-github-actions#per-minute-rates
pub fn rate_per_minute(runner: &str) -> Option<Thousandth> {
    let per_minute = match runner {
        "UBUNTU" | "UBUNTU_2_CORE" => 8,
        "UBUNTU_4_CORE" => 16,
        "UBUNTU_8_CORE" => 32,
        "UBUNTU_16_CORE" => 64,
        "UBUNTU_32_CORE" => 128,
        "UBUNTU_64_CORE" => 256,

        "UBUNTU_ARM" | "UBUNTU_2_CORE_ARM" => 5,
        "UBUNTU_4_CORE_ARM" => 10,
        "UBUNTU_8_CORE_ARM" => 20,
        "UBUNTU_16_CORE_ARM" => 40,
        "UBUNTU_32_CORE_ARM" => 80,
        "UBUNTU_64_CORE_ARM" => 160,

        "WINDOWS" | "WINDOWS_2_CORE" => 16,
        "WINDOWS_4_CORE" => 32,
        "WINDOWS_8_CORE" => 64,
        "WINDOWS_16_CORE" => 128,
        "WINDOWS_32_CORE" => 256,
        "WINDOWS_64_CORE" => 512,

        "MACOS" => 80,
        "MACOS_12_CORE" => 120,
        _ => return None,
    };
    Some(Thousandth(per_minute))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use octocrab::models::JobId;

    use super::*;
    use crate::models::{JobBillable, RunPlatformInfo};

    fn usage(entries: &[(&str, u64, u64)]) -> UsageReport {
        let mut billable: BTreeMap<String, RunPlatformInfo> = BTreeMap::new();
        for (runner, job_id, duration_ms) in entries {
            billable
                .entry(runner.to_string())
                .or_default()
                .job_runs
                .push(JobBillable {
                    job_id: JobId(*job_id),
                    duration_ms: *duration_ms,
                });
        }
        UsageReport {
            billable,
            run_duration_ms: None,
        }
    }

    #[test]
    fn partial_minutes_are_not_billed() {
        let report = usage(&[("UBUNTU_4_CORE", 1, 5 * 60_000 + 59_999)]);
        let (runner, cost) = cost_of(JobId(1), &report).unwrap();
        assert_eq!(runner, "UBUNTU_4_CORE");
        assert_eq!(cost, Thousandth(80));
    }

    #[test]
    fn job_in_second_bucket() {
        let report = usage(&[("UBUNTU", 1, 60_000), ("UBUNTU_16_CORE_ARM", 2, 3 * 60_000)]);
        assert_eq!(
            cost_of(JobId(2), &report).unwrap(),
            ("UBUNTU_16_CORE_ARM".to_string(), Thousandth(120))
        );
    }

    #[test]
    fn missing_job_is_free() {
        let report = usage(&[("UBUNTU", 1, 60_000)]);
        assert_eq!(
            cost_of(JobId(7), &report).unwrap(),
            (FREE_RUNNER.to_string(), Thousandth(0))
        );
    }

    #[test]
    fn unknown_runner_only_fails_for_its_jobs() {
        let report = usage(&[("SELF_HOSTED_GPU", 1, 60_000), ("UBUNTU", 2, 60_000)]);
        assert!(matches!(
            cost_of(JobId(1), &report),
            Err(GatherError::UnknownRunner { runner, .. }) if runner == "SELF_HOSTED_GPU"
        ));
        assert_eq!(cost_of(JobId(2), &report).unwrap().1, Thousandth(8));
    }

    #[test]
    fn display_in_dollars() {
        assert_eq!(Thousandth(1234).to_string(), "1.234");
        assert_eq!(vec![Thousandth(8), Thousandth(16)].into_iter().sum::<Thousandth>(), Thousandth(24));
    }
}
