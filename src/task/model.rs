#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SoragenError;

pub const DEFAULT_API_URL: &str = "https://mj.do/v1/chat/completions";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    /// Reserved for a queued-but-not-dispatched state; nothing assigns it yet.
    Pending,
    Processing,
    Success,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Where generation requests go and the credential sent with them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    #[serde(alias = "endpointUrl")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_owned(),
            api_key: String::new(),
        }
    }
}

impl EndpointConfig {
    pub fn ensure_present(&self) -> Result<(), SoragenError> {
        if self.api_url.trim().is_empty() {
            return Err(SoragenError::EndpointNotConfigured("URL"));
        }
        if self.api_key.trim().is_empty() {
            return Err(SoragenError::EndpointNotConfigured("API key"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskSpec {
    pub prompt_prefix: String,
    pub prompt_body: String,
    pub prompt_suffix: String,
    pub reference_image: Option<String>,
}

impl TaskSpec {
    #[must_use]
    pub fn prompt(&self) -> String {
        join_prompt(&self.prompt_prefix, &self.prompt_body, &self.prompt_suffix)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub created_at: i64,
    #[serde(default, alias = "prefix")]
    pub prompt_prefix: String,
    #[serde(alias = "prompt")]
    pub prompt_body: String,
    #[serde(default, alias = "suffix")]
    pub prompt_suffix: String,
    #[serde(
        default,
        alias = "padImageBase64",
        skip_serializing_if = "Option::is_none"
    )]
    pub reference_image: Option<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, alias = "errorMsg", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Task {
    #[must_use]
    pub fn new_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    #[must_use]
    pub fn from_spec(id: String, created_at: i64, spec: TaskSpec) -> Self {
        Self {
            id,
            created_at,
            prompt_prefix: spec.prompt_prefix,
            prompt_body: spec.prompt_body,
            prompt_suffix: spec.prompt_suffix,
            reference_image: spec.reference_image,
            status: TaskStatus::Processing,
            video_url: None,
            error_message: None,
        }
    }

    #[must_use]
    pub fn prompt(&self) -> String {
        join_prompt(&self.prompt_prefix, &self.prompt_body, &self.prompt_suffix)
    }

    /// Merges `update` into this task.
    ///
    /// A task that already reached SUCCESS or FAILED never changes again, and
    /// nothing moves a task back to PROCESSING; both cases return an error and
    /// leave the task untouched.
    pub fn apply(&mut self, update: TaskUpdate) -> Result<(), SoragenError> {
        if self.status.is_terminal() {
            return Err(SoragenError::Other(format!(
                "task {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        if let Some(status) = update.status {
            if matches!(status, TaskStatus::Pending | TaskStatus::Processing)
                && status != self.status
            {
                return Err(SoragenError::Other(format!(
                    "task {} cannot move to {}",
                    self.id,
                    status.as_str()
                )));
            }
            self.status = status;
        }
        if let Some(url) = update.video_url {
            self.video_url = Some(url);
        }
        if let Some(msg) = update.error_message {
            self.error_message = Some(msg);
        }

        match self.status {
            TaskStatus::Success => self.error_message = None,
            TaskStatus::Failed => self.video_url = None,
            TaskStatus::Pending | TaskStatus::Processing => {
                self.video_url = None;
                self.error_message = None;
            }
        }
        Ok(())
    }
}

/// Partial field set merged into a task by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub video_url: Option<String>,
    pub error_message: Option<String>,
}

impl TaskUpdate {
    #[must_use]
    pub fn succeeded(video_url: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Success),
            video_url: Some(video_url.into()),
            error_message: None,
        }
    }

    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status: Some(TaskStatus::Failed),
            video_url: None,
            error_message: Some(if message.trim().is_empty() {
                "unknown error".to_owned()
            } else {
                message
            }),
        }
    }
}

fn join_prompt(prefix: &str, body: &str, suffix: &str) -> String {
    [prefix, body, suffix]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processing() -> Task {
        Task::from_spec(
            Task::new_id(),
            1_700_000_000_000,
            TaskSpec {
                prompt_body: "a cat surfing".to_owned(),
                ..TaskSpec::default()
            },
        )
    }

    #[test]
    fn prompt_skips_empty_segments() {
        let spec = TaskSpec {
            prompt_prefix: "anime style".to_owned(),
            prompt_body: "a cat surfing".to_owned(),
            prompt_suffix: String::new(),
            reference_image: None,
        };
        assert_eq!(spec.prompt(), "anime style a cat surfing");

        let spec = TaskSpec {
            prompt_suffix: "4k".to_owned(),
            ..spec
        };
        assert_eq!(spec.prompt(), "anime style a cat surfing 4k");
    }

    #[test]
    fn success_sets_url_only() {
        let mut task = processing();
        task.apply(TaskUpdate::succeeded("https://x/y.mp4")).unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.video_url.as_deref(), Some("https://x/y.mp4"));
        assert!(task.error_message.is_none());
    }

    #[test]
    fn failure_sets_message_only() {
        let mut task = processing();
        task.apply(TaskUpdate::failed("")).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("unknown error"));
        assert!(task.video_url.is_none());
    }

    #[test]
    fn terminal_tasks_do_not_transition_again() {
        let mut task = processing();
        task.apply(TaskUpdate::failed("boom")).unwrap();
        let before = task.clone();

        assert!(task.apply(TaskUpdate::succeeded("https://x/y.mp4")).is_err());
        assert_eq!(task, before);
    }

    #[test]
    fn processing_cannot_be_reassigned_pending() {
        let mut task = processing();
        let update = TaskUpdate {
            status: Some(TaskStatus::Pending),
            ..TaskUpdate::default()
        };
        assert!(task.apply(update).is_err());
        assert_eq!(task.status, TaskStatus::Processing);
    }

    #[test]
    fn legacy_field_names_are_accepted() {
        let raw = r#"{
            "id": "abc",
            "createdAt": 1700000000000,
            "prefix": "p",
            "prompt": "body",
            "suffix": "s",
            "padImageBase64": "data:image/png;base64,AAAA",
            "status": "FAILED",
            "errorMsg": "API Error 500: nope"
        }"#;
        let task: Task = serde_json::from_str(raw).unwrap();
        assert_eq!(task.prompt_prefix, "p");
        assert_eq!(task.prompt_body, "body");
        assert_eq!(task.prompt_suffix, "s");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("API Error 500: nope"));
        assert!(task.reference_image.is_some());
    }

    #[test]
    fn endpoint_presence_check() {
        let mut endpoint = EndpointConfig::default();
        assert!(endpoint.ensure_present().is_err());
        endpoint.api_key = "Bearer sk-test".to_owned();
        endpoint.ensure_present().unwrap();
        endpoint.api_url = "  ".to_owned();
        assert!(endpoint.ensure_present().is_err());
    }
}
