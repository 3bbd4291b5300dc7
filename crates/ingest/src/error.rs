use std::path::PathBuf;
use thiserror::Error;

/// Failure kinds surfaced by a pass or by a single job
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid filename format: {filename} ({reason})")]
    InvalidFilenameFormat { filename: String, reason: String },

    #[error("transcode failed for {input}: {message}")]
    TranscodeFailed { input: PathBuf, message: String },

    #[error("failed to provision unit {unit}: {message}")]
    ProvisionFailed { unit: String, message: String },

    #[error("failed to publish {key} to {unit}: {message}")]
    PublishFailed {
        unit: String,
        key: String,
        message: String,
    },

    #[error("metadata update failed for season {season} episode {episode}: {message}")]
    MetadataUpdateFailed {
        season: u32,
        episode: u32,
        message: String,
    },

    #[error("staging directory {dir} is unreadable: {source}")]
    StagingUnreadable {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is corrupt: {message}")]
    StateCorrupt { path: PathBuf, message: String },

    #[error("state file {path} could not be read: {message}")]
    StateUnreadable { path: PathBuf, message: String },

    #[error("failed to save state: {0}")]
    StateSaveFailed(String),

    #[error("allocator state is inconsistent: {0}")]
    StateInvariant(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;

impl IngestError {
    /// Whether the source file stays in staging so the next pass retries it.
    /// Only an operator can fix a bad file name, but it is kept all the same.
    pub fn retried_next_pass(&self) -> bool {
        !matches!(self, IngestError::InvalidFilenameFormat { .. })
    }
}

/// Render an anyhow chain on one line, the way it ends up in notifications
pub(crate) fn chain_message(err: &anyhow::Error) -> String {
    format!("{:#}", err)
}
