#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::error::SoragenError;
use crate::task::model::{EndpointConfig, Task};

pub const SNAPSHOT_VERSION: u32 = 1;

const TASKS_FILE: &str = "tasks.json";
const ENDPOINT_FILE: &str = "endpoint.json";

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum TaskSnapshot {
    Versioned { version: u32, tasks: Vec<Task> },
    Bare(Vec<Task>),
}

#[derive(Debug, Serialize, Deserialize)]
struct EndpointSnapshot {
    #[serde(default = "unversioned")]
    version: u32,
    #[serde(flatten)]
    endpoint: EndpointConfig,
}

fn unversioned() -> u32 {
    SNAPSHOT_VERSION
}

/// Whole-snapshot JSON files for the task collection and the endpoint.
#[derive(Debug, Clone)]
pub struct SnapshotStorage {
    dir: PathBuf,
}

impl SnapshotStorage {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn tasks_path(&self) -> PathBuf {
        self.dir.join(TASKS_FILE)
    }

    #[must_use]
    pub fn endpoint_path(&self) -> PathBuf {
        self.dir.join(ENDPOINT_FILE)
    }

    pub fn ensure_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create store dir {}", self.dir.display()))
    }

    /// `Ok(None)` when nothing has been persisted yet.
    pub fn read_tasks(&self) -> Result<Option<Vec<Task>>, SoragenError> {
        let path = self.tasks_path();
        let Some(value) = read_json(&path)? else {
            return Ok(None);
        };
        let snapshot: TaskSnapshot = parse_snapshot(&path, value)?;
        match snapshot {
            TaskSnapshot::Versioned { tasks, .. } | TaskSnapshot::Bare(tasks) => Ok(Some(tasks)),
        }
    }

    pub fn write_tasks(&self, tasks: &[Task]) -> anyhow::Result<()> {
        let snapshot = TaskSnapshot::Versioned {
            version: SNAPSHOT_VERSION,
            tasks: tasks.to_vec(),
        };
        self.write_atomic(&self.tasks_path(), &serde_json::to_vec_pretty(&snapshot)?)
    }

    pub fn read_endpoint(&self) -> Result<Option<EndpointConfig>, SoragenError> {
        let path = self.endpoint_path();
        let Some(value) = read_json(&path)? else {
            return Ok(None);
        };
        let snapshot: EndpointSnapshot = parse_snapshot(&path, value)?;
        Ok(Some(snapshot.endpoint))
    }

    pub fn write_endpoint(&self, endpoint: &EndpointConfig) -> anyhow::Result<()> {
        let snapshot = EndpointSnapshot {
            version: SNAPSHOT_VERSION,
            endpoint: endpoint.clone(),
        };
        self.write_atomic(&self.endpoint_path(), &serde_json::to_vec_pretty(&snapshot)?)
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> anyhow::Result<()> {
        self.ensure_dir()?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }
}

fn read_json(path: &Path) -> Result<Option<serde_json::Value>, SoragenError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SoragenError::IoPath {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| SoragenError::PersistenceRead {
            path: path.to_path_buf(),
            msg: e.to_string(),
        })
}

/// The version is checked before the typed parse, so a newer layout is
/// reported as such even when it no longer matches the current types.
fn parse_snapshot<T: serde::de::DeserializeOwned>(
    path: &Path,
    value: serde_json::Value,
) -> Result<T, SoragenError> {
    if let Some(version) = value.get("version").and_then(serde_json::Value::as_u64) {
        let version = u32::try_from(version).unwrap_or(u32::MAX);
        if version > SNAPSHOT_VERSION {
            return Err(SoragenError::UnsupportedSnapshot {
                path: path.to_path_buf(),
                version,
                supported: SNAPSHOT_VERSION,
            });
        }
    }
    serde_json::from_value(value).map_err(|e| SoragenError::PersistenceRead {
        path: path.to_path_buf(),
        msg: e.to_string(),
    })
}
