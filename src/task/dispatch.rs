#![forbid(unsafe_code)]

use tokio::task::JoinSet;

use crate::generation::{GenerationClient, GenerationError};
use crate::task::model::{Task, TaskSpec, TaskUpdate};
use crate::task::store::TaskStore;

pub const MAX_BATCH: usize = 10;

#[must_use]
pub fn clamp_batch_size(n: usize) -> usize {
    n.clamp(1, MAX_BATCH)
}

/// One user submission: a prompt repeated `count` times.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub prefix: String,
    pub body: String,
    pub suffix: String,
    pub image: Option<String>,
    pub count: usize,
}

impl SubmitRequest {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.body.trim().is_empty() {
            anyhow::bail!("prompt must not be empty");
        }
        Ok(())
    }

    #[must_use]
    pub fn specs(&self) -> Vec<TaskSpec> {
        let spec = TaskSpec {
            prompt_prefix: self.prefix.clone(),
            prompt_body: self.body.clone(),
            prompt_suffix: self.suffix.clone(),
            reference_image: self.image.clone(),
        };
        vec![spec; clamp_batch_size(self.count)]
    }
}

/// Outcome of one generation call, keyed by the task it belongs to.
#[derive(Debug)]
pub struct Completion {
    pub id: String,
    pub outcome: Result<String, GenerationError>,
}

impl Completion {
    #[must_use]
    pub fn into_update(self) -> TaskUpdate {
        match self.outcome {
            Ok(url) => TaskUpdate::succeeded(url),
            Err(e) => TaskUpdate::failed(e.to_string()),
        }
    }
}

/// Tasks of one submission and their in-flight generation calls.
pub struct Batch {
    tasks: Vec<Task>,
    inflight: JoinSet<Completion>,
}

impl Batch {
    #[must_use]
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Next finished call in completion order; `None` once all are done.
    pub async fn next_completion(&mut self) -> Option<Completion> {
        loop {
            match self.inflight.join_next().await? {
                Ok(completion) => return Some(completion),
                Err(e) => tracing::error!(error = %e, "generation call aborted"),
            }
        }
    }
}

/// Creates the batch's tasks and starts one generation call per task
/// without waiting for any of them.
pub fn dispatch(
    store: &mut TaskStore,
    client: &GenerationClient,
    request: &SubmitRequest,
) -> anyhow::Result<Batch> {
    request.validate()?;
    store.endpoint().ensure_present()?;

    let tasks = store.create_tasks(request.specs())?;
    let mut inflight = JoinSet::new();
    for task in &tasks {
        let client = client.clone();
        let endpoint = store.endpoint().clone();
        let id = task.id.clone();
        let prompt = task.prompt();
        let image = task.reference_image.clone();
        inflight.spawn(async move {
            let outcome = client.generate(&endpoint, &prompt, image.as_deref()).await;
            match &outcome {
                Ok(url) => tracing::info!(id = %id, url = %url, "generation succeeded"),
                Err(e) => tracing::warn!(id = %id, error = %e, "generation failed"),
            }
            Completion { id, outcome }
        });
    }

    Ok(Batch { tasks, inflight })
}

/// Applies a completion to the live collection.
pub fn settle(store: &mut TaskStore, completion: Completion) -> anyhow::Result<Option<Task>> {
    let id = completion.id.clone();
    store.update_task(&id, completion.into_update())
}
