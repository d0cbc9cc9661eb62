//! On-disk memoization of gathered records.
//!
//! Documents live at `<data_dir>/<owner>/<repo>/<kind>/<id>.json`. There is no
//! expiry: a document is only replaced when a gather is forced.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::GatherError;
use crate::RepositoryId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Commit,
    PullRequest,
    WorkflowRun,
}

impl EntityKind {
    pub fn dir_name(self) -> &'static str {
        match self {
            EntityKind::Commit => "commits",
            EntityKind::PullRequest => "pull_requests",
            EntityKind::WorkflowRun => "workflow_runs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub repository: RepositoryId,
    pub kind: EntityKind,
    pub id: String,
}

impl CacheKey {
    pub fn new(repository: &RepositoryId, kind: EntityKind, id: impl Display) -> Self {
        Self {
            repository: repository.clone(),
            kind,
            id: id.to_string(),
        }
    }
}

/// Per-key slot. The flag is set once the key was computed by this process.
type Slot = Arc<tokio::sync::Mutex<bool>>;

#[derive(Debug)]
pub struct Cache {
    data_dir: PathBuf,
    /// One entry per document path ever requested. Never pruned, so it
    /// grows with the number of distinct keys gathered through this cache.
    slots: Mutex<HashMap<PathBuf, Slot>>,
}

impl Cache {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn path(&self, key: &CacheKey) -> PathBuf {
        self.data_dir
            .join(&key.repository.owner)
            .join(&key.repository.name)
            .join(key.kind.dir_name())
            .join(format!("{}.json", key.id))
    }

    /// Returns the cached document for `key`, or runs `compute` and stores its
    /// result.
    ///
    /// Concurrent callers for the same key wait for the first one and then
    /// read what it wrote. A forced call recomputes a key only once per
    /// `Cache`; later forced calls read the fresh document.
    pub async fn fetch_or_compute<T, F, Fut>(
        &self,
        key: &CacheKey,
        force_update: bool,
        compute: F,
    ) -> Result<T, GatherError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GatherError>>,
    {
        let path = self.path(key);
        let slot = self.slot(&path);
        let mut computed = slot.lock().await;

        if !force_update || *computed {
            if let Some(record) = read(&path)? {
                log::debug!("Read {} from local file", path.display());
                return Ok(record);
            }
        }

        let record = compute().await?;
        let data = serde_json::to_vec(&record).map_err(|source| GatherError::CacheWrite {
            path: path.clone(),
            source: std::io::Error::new(ErrorKind::InvalidData, source),
        })?;
        write_atomic(&path, &data).map_err(|source| GatherError::CacheWrite {
            path: path.clone(),
            source,
        })?;
        *computed = true;
        log::debug!("Wrote {}", path.display());
        Ok(record)
    }

    fn slot(&self, path: &Path) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.entry(path.to_path_buf()).or_default().clone()
    }
}

fn read<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, GatherError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(GatherError::CacheRead {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|source| GatherError::CacheDecode {
            path: path.to_path_buf(),
            source,
        })
}

/// Writes to a temp file next to `path`, then renames it over `path`.
fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "cache path has no parent"))?;
    create_private_dir(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|error| error.error)?;
    Ok(())
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}
