#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use crate::error::SoragenError;
use crate::task::model::{EndpointConfig, Task, TaskSpec, TaskStatus, TaskUpdate};
use crate::task::storage::SnapshotStorage;

/// Owner of the task collection and endpoint configuration.
///
/// Tasks are kept in insertion order with the newest batch first. Every
/// mutation rewrites the corresponding snapshot in full.
#[derive(Debug)]
pub struct TaskStore {
    storage: SnapshotStorage,
    tasks: Vec<Task>,
    endpoint: EndpointConfig,
}

impl TaskStore {
    /// Reads both snapshots, falling back to an empty collection and the
    /// default endpoint when a snapshot is missing or unreadable.
    ///
    /// A snapshot written by a newer release is an error instead: falling
    /// back would let the next write replace it with a downgraded copy.
    pub fn load(storage: SnapshotStorage) -> Result<Self, SoragenError> {
        let tasks = match storage.read_tasks() {
            Ok(tasks) => tasks.unwrap_or_default(),
            Err(e @ SoragenError::UnsupportedSnapshot { .. }) => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "discarding task snapshot");
                Vec::new()
            }
        };
        let endpoint = match storage.read_endpoint() {
            Ok(endpoint) => endpoint.unwrap_or_default(),
            Err(e @ SoragenError::UnsupportedSnapshot { .. }) => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "discarding endpoint snapshot");
                EndpointConfig::default()
            }
        };
        tracing::debug!(
            dir = %storage.dir().display(),
            tasks = tasks.len(),
            "loaded store"
        );
        Ok(Self {
            storage,
            tasks,
            endpoint,
        })
    }

    #[must_use]
    pub fn storage(&self) -> &SnapshotStorage {
        &self.storage
    }

    #[must_use]
    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    /// Storage order.
    #[must_use]
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    #[must_use]
    pub fn newest_first(&self) -> Vec<&Task> {
        let mut out: Vec<&Task> = self.tasks.iter().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    #[must_use]
    pub fn gallery(&self) -> Vec<&Task> {
        self.newest_first()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Success && t.video_url.is_some())
            .collect()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Exact id first, then a unique id prefix.
    pub fn find(&self, pattern: &str) -> Result<&Task, SoragenError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(SoragenError::TaskNotFound(pattern.to_owned()));
        }
        if let Some(task) = self.get(pattern) {
            return Ok(task);
        }
        let mut matches = self.tasks.iter().filter(|t| t.id.starts_with(pattern));
        match (matches.next(), matches.next()) {
            (Some(task), None) => Ok(task),
            (Some(_), Some(_)) => Err(SoragenError::AmbiguousTask(pattern.to_owned())),
            (None, _) => Err(SoragenError::TaskNotFound(pattern.to_owned())),
        }
    }

    #[must_use]
    pub fn counts(&self) -> BTreeMap<TaskStatus, usize> {
        let mut counts = BTreeMap::new();
        for t in &self.tasks {
            *counts.entry(t.status).or_insert(0) += 1;
        }
        counts
    }

    /// Creates one PROCESSING task per spec, prepends the batch and persists
    /// it with a single write.
    pub fn create_tasks(&mut self, specs: Vec<TaskSpec>) -> anyhow::Result<Vec<Task>> {
        if specs.is_empty() {
            return Ok(Vec::new());
        }

        let created_at = now_millis();
        let mut created: Vec<Task> = Vec::with_capacity(specs.len());
        for spec in specs {
            let mut id = Task::new_id();
            while self.get(&id).is_some() || created.iter().any(|t| t.id == id) {
                id = Task::new_id();
            }
            created.push(Task::from_spec(id, created_at, spec));
        }

        let mut next = created.clone();
        next.extend(self.tasks.iter().cloned());
        self.storage.write_tasks(&next)?;
        self.tasks = next;

        tracing::info!(count = created.len(), "created tasks");
        Ok(created)
    }

    /// Merges `update` into the task with `id` and persists.
    ///
    /// Unknown ids and rejected transitions leave the collection unchanged;
    /// the snapshot is rewritten either way. The live collection only changes
    /// once the write succeeds.
    pub fn update_task(&mut self, id: &str, update: TaskUpdate) -> anyhow::Result<Option<Task>> {
        let mut next = self.tasks.clone();
        let mut updated = None;
        if let Some(task) = next.iter_mut().find(|t| t.id == id) {
            match task.apply(update) {
                Ok(()) => {
                    tracing::debug!(id, status = task.status.as_str(), "task updated");
                    updated = Some(task.clone());
                }
                Err(e) => tracing::warn!(id, error = %e, "ignoring task update"),
            }
        } else {
            tracing::debug!(id, "update for unknown task");
        }
        self.storage.write_tasks(&next)?;
        self.tasks = next;
        Ok(updated)
    }

    pub fn delete_task(&mut self, id: &str) -> anyhow::Result<bool> {
        let next: Vec<Task> = self.tasks.iter().filter(|t| t.id != id).cloned().collect();
        let removed = next.len() != self.tasks.len();
        self.storage.write_tasks(&next)?;
        self.tasks = next;
        if removed {
            tracing::info!(id, "deleted task");
        }
        Ok(removed)
    }

    pub fn save_configuration(&mut self, endpoint: EndpointConfig) -> anyhow::Result<()> {
        self.storage.write_endpoint(&endpoint)?;
        self.endpoint = endpoint;
        Ok(())
    }
}

fn now_millis() -> i64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    i64::try_from(nanos).unwrap_or(i64::MAX)
}
