//! Error types shared by the descriptor, target and remote modules.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Descriptor is structurally wrong (not a mapping, unknown kind, non-list values)
    #[error("invalid descriptor: {0}")]
    Validation(String),

    /// A file, database or dump that a target expected is missing
    #[error("not found: {0}")]
    NotFound(String),

    /// An external command (mysqldump, pg_dump, psql, ...) exited non-zero
    #[error("command failed with status {status}: {command}")]
    ExternalTool { command: String, status: i32 },

    /// Uploaded object does not match the local file
    #[error("remote object {key} does not match local file: {reason}")]
    RemoteInconsistency { key: String, reason: String },

    /// A name that cannot be turned into an artifact filename or remote key
    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("key {key:?} in bucket {bucket:?} doesn't exist or we have no access to it")]
    MissingRemoteKey { bucket: String, key: String },

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yml::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
