use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{IngestError, Result};
use crate::filename::{parse_episode_id, EpisodeId};

/// One staged file on its way through a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub source_path: PathBuf,
    /// File stem; names the artifact directory and the path inside the unit
    pub key: String,
    pub id: EpisodeId,
    pub raw_bytes: u64,
}

impl Job {
    /// Build a job from a discovered file, extracting the episode id from its name
    pub fn from_source(source_path: &Path, raw_bytes: u64, filename_offset: usize) -> Result<Self> {
        let invalid = |reason: &str| IngestError::InvalidFilenameFormat {
            filename: source_path.display().to_string(),
            reason: reason.to_string(),
        };

        let filename = source_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| invalid("file name is not valid UTF-8"))?;
        let key = source_path
            .file_stem()
            .and_then(|n| n.to_str())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| invalid("empty file stem"))?
            .to_string();

        let id = parse_episode_id(filename, filename_offset)?;

        Ok(Self {
            source_path: source_path.to_path_buf(),
            key,
            id,
            raw_bytes,
        })
    }
}

/// Per-job states of a pass, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Extracting,
    Transcoding,
    Allocating,
    Publishing,
    UpdatingMetadata,
    CleaningUp,
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStage::Extracting => "extracting",
            JobStage::Transcoding => "transcoding",
            JobStage::Allocating => "allocating",
            JobStage::Publishing => "publishing",
            JobStage::UpdatingMetadata => "updating metadata",
            JobStage::CleaningUp => "cleaning up",
        };
        f.write_str(name)
    }
}
