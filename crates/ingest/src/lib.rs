pub mod config;
pub mod error;
pub mod filename;
pub mod job;
pub mod scan;
pub mod state;
pub mod retry;
pub mod transcode;
pub mod allocator;
pub mod provision;
pub mod publish;
pub mod metadata;
pub mod notify;
pub mod pipeline;
pub mod schedule;

pub use config::IngestConfig;
pub use error::IngestError;
pub use filename::EpisodeId;
pub use job::{Job, JobStage};
pub use pipeline::{Collaborators, PassReport, Pipeline};
pub use state::{AllocatorState, JsonStateStore, StateStore, StorageUnit};
