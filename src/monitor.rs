//! Decoding of the monitoring artifact uploaded by the resource sampler.
//!
//! The artifact is a zip archive holding one JSON-lines file. Every line is a
//! log record whose `message` says what kind of measurement it carries.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Environment variable set by the sampler with the job's display name, the
/// only reliable way to tie an analysis to an API job.
const JOB_NAME_ENV_VAR: &str = "GITHUB_JOB_NAME";
const LOG_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Analysis {
    pub job_name: String,
    pub system_info: SystemInfo,
    /// Measurements keyed by CPU number.
    pub cpu_measurements: BTreeMap<u32, Vec<CpuMeasurement>>,
    pub memory_measurements: Vec<MemoryMeasurement>,
    pub disk_measurements: Vec<DiskMeasurement>,
    pub io_measurements: Vec<IoMeasurement>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    pub cpu: Vec<SystemCpuInfo>,
    pub memory: Option<SystemTotal>,
    pub disk: Option<SystemTotal>,
    pub github_actions_env_vars: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemCpuInfo {
    pub num: u32,
    pub model: String,
    pub vendor: String,
    pub family: String,
    pub cache_size: i32,
    pub cores: i32,
    pub mhz: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemTotal {
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuMeasurement {
    pub time: DateTime<Utc>,
    pub num: u32,
    pub used_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMeasurement {
    pub time: DateTime<Utc>,
    pub available: u64,
    pub used: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskMeasurement {
    pub time: DateTime<Utc>,
    pub used: u64,
    pub available: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoMeasurement {
    pub time: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "message")]
enum Entry {
    #[serde(rename = "CPU System Info")]
    CpuInfo {
        #[serde(default, alias = "cpu")]
        num: u32,
        #[serde(default)]
        model: String,
        #[serde(default)]
        vendor: String,
        #[serde(default)]
        family: String,
        #[serde(default)]
        cache_size: i32,
        #[serde(default)]
        cores: i32,
        #[serde(default)]
        mhz: f64,
    },
    #[serde(rename = "System Memory Info")]
    MemoryInfo {
        #[serde(default)]
        total: u64,
    },
    #[serde(rename = "System Disk Info")]
    DiskInfo {
        #[serde(default)]
        total: u64,
    },
    #[serde(
        rename = "Observed GitHub Actions Environment Variables",
        alias = "GitHub Actions Environment Variables"
    )]
    EnvVars {
        #[serde(default, alias = "env_vars")]
        github_actions_env_vars: BTreeMap<String, Value>,
    },
    #[serde(rename = "Observed CPU Usage")]
    Cpu {
        #[serde(deserialize_with = "log_time")]
        time: DateTime<Utc>,
        #[serde(default, alias = "cpu")]
        num: u32,
        #[serde(default, alias = "percent")]
        used_percent: f64,
    },
    #[serde(rename = "Observed Memory Usage")]
    Memory {
        #[serde(deserialize_with = "log_time")]
        time: DateTime<Utc>,
        #[serde(default)]
        available: u64,
        #[serde(default)]
        used: u64,
    },
    #[serde(rename = "Observed Disk Usage")]
    Disk {
        #[serde(deserialize_with = "log_time")]
        time: DateTime<Utc>,
        #[serde(default)]
        used: u64,
        #[serde(default)]
        available: u64,
        #[serde(default)]
        used_percent: f64,
    },
    #[serde(rename = "Observed IO Usage")]
    Io {
        #[serde(deserialize_with = "log_time")]
        time: DateTime<Utc>,
        #[serde(default)]
        bytes_sent: u64,
        #[serde(default)]
        bytes_recv: u64,
        #[serde(default)]
        packets_sent: u64,
        #[serde(default)]
        packets_recv: u64,
    },
    /// Start/stop notices and anything a newer sampler adds.
    #[serde(other)]
    Unknown,
}

/// The sampler writes millisecond timestamps without an offset (UTC); RFC 3339
/// is accepted as well.
fn log_time<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    if let Ok(time) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(time.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, LOG_TIME_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(serde::de::Error::custom)
}

impl Analysis {
    fn apply(&mut self, entry: Entry) {
        match entry {
            Entry::CpuInfo {
                num,
                model,
                vendor,
                family,
                cache_size,
                cores,
                mhz,
            } => self.system_info.cpu.push(SystemCpuInfo {
                num,
                model,
                vendor,
                family,
                cache_size,
                cores,
                mhz,
            }),
            Entry::MemoryInfo { total } => self.system_info.memory = Some(SystemTotal { total }),
            Entry::DiskInfo { total } => self.system_info.disk = Some(SystemTotal { total }),
            Entry::EnvVars {
                github_actions_env_vars,
            } => {
                if let Some(Value::String(job_name)) = github_actions_env_vars.get(JOB_NAME_ENV_VAR) {
                    self.job_name = job_name.clone();
                }
                self.system_info.github_actions_env_vars = Some(github_actions_env_vars);
            }
            Entry::Cpu {
                time,
                num,
                used_percent,
            } => self
                .cpu_measurements
                .entry(num)
                .or_default()
                .push(CpuMeasurement {
                    time,
                    num,
                    used_percent,
                }),
            Entry::Memory {
                time,
                available,
                used,
            } => self.memory_measurements.push(MemoryMeasurement {
                time,
                available,
                used,
            }),
            Entry::Disk {
                time,
                used,
                available,
                used_percent,
            } => self.disk_measurements.push(DiskMeasurement {
                time,
                used,
                available,
                used_percent,
            }),
            Entry::Io {
                time,
                bytes_sent,
                bytes_recv,
                packets_sent,
                packets_recv,
            } => self.io_measurements.push(IoMeasurement {
                time,
                bytes_sent,
                bytes_recv,
                packets_sent,
                packets_recv,
            }),
            Entry::Unknown => {}
        }
    }
}

/// Decodes the JSON-lines monitor log. Blank lines are skipped, a line that
/// is not a JSON object fails the whole decode.
pub fn analyze<R: BufRead>(reader: R) -> anyhow::Result<Analysis> {
    let mut analysis = Analysis::default();
    let mut lines_scanned = 0usize;
    for (index, line) in reader.lines().enumerate() {
        let line = line.context("failed to read monitor data")?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: Entry = serde_json::from_str(&line)
            .with_context(|| format!("failed to parse entry {}", index + 1))?;
        analysis.apply(entry);
        lines_scanned += 1;
    }
    log::debug!("Finished analyzing monitor data, {lines_scanned} lines scanned");
    Ok(analysis)
}

/// Spills the downloaded archive to a temporary file, finds the entry whose
/// name ends with `file_name` and decodes it.
pub fn analyze_archive(archive: &[u8], file_name: &str) -> anyhow::Result<Analysis> {
    let mut spill = tempfile::tempfile().context("failed to create temp file for artifact")?;
    spill
        .write_all(archive)
        .context("failed to write artifact to temp file")?;
    spill.seek(SeekFrom::Start(0))?;

    let mut zip = zip::ZipArchive::new(spill).context("failed to open artifact archive")?;
    let index = (0..zip.len())
        .find(|&index| {
            zip.by_index(index)
                .map(|entry| entry.name().ends_with(file_name))
                .unwrap_or(false)
        })
        .with_context(|| format!("artifact archive has no entry named '{file_name}'"))?;
    let entry = zip.by_index(index)?;
    analyze(BufReader::new(entry))
}
