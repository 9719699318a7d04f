#![forbid(unsafe_code)]

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SoragenError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid config key '{0}'")]
    InvalidConfigKey(String),

    #[error("invalid config value for '{key}': {msg}")]
    InvalidConfigValue { key: String, msg: String },

    #[error("unreadable snapshot {path}: {msg}")]
    PersistenceRead { path: PathBuf, msg: String },

    #[error("snapshot {path} has version {version}, newer than this build supports ({supported})")]
    UnsupportedSnapshot {
        path: PathBuf,
        version: u32,
        supported: u32,
    },

    #[error("endpoint {0} is not configured (run 'soragen endpoint set')")]
    EndpointNotConfigured(&'static str),

    #[error("task not found matching pattern: {0}")]
    TaskNotFound(String),

    #[error("multiple tasks match pattern: {0}")]
    AmbiguousTask(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error at {path}: {source}")]
    IoPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}
