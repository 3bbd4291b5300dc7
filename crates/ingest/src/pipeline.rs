use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use chrono::Utc;
use log::{debug, error, info, warn};
use reqwest::Client;

use crate::allocator::{credit_publish, journaled_unit, select_unit, Allocation};
use crate::config::IngestConfig;
use crate::error::{chain_message, IngestError, Result};
use crate::job::{Job, JobStage};
use crate::metadata::{DataApiEpisodeStore, DisabledEpisodeStore, EpisodeStore, UpdateOutcome};
use crate::notify::{notify_best_effort, Notifier, NullNotifier, TelegramNotifier};
use crate::provision::{GithubUnitCreator, UnitCreator, UnitProvisioner};
use crate::publish::{GitPublisher, Publisher};
use crate::retry::RetryPolicy;
use crate::scan::{discover, ScanResult};
use crate::state::{is_corrupt, AllocatorState, JsonStateStore, StateStore, StateViolation};
use crate::transcode::{FfmpegTranscoder, Transcoder};

/// External collaborators of a pass
#[derive(Clone)]
pub struct Collaborators {
    pub state_store: Arc<dyn StateStore>,
    pub transcoder: Arc<dyn Transcoder>,
    pub unit_creator: Arc<dyn UnitCreator>,
    pub publisher: Arc<dyn Publisher>,
    pub episodes: Arc<dyn EpisodeStore>,
    pub notifier: Arc<dyn Notifier>,
}

/// Counters for one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub discovered: usize,
    pub completed: usize,
    pub failed: usize,
    /// Files left alone this pass (still being written)
    pub skipped: usize,
    /// Whether the state file was written at any point of the pass
    pub state_saved: bool,
}

/// Allocator state owned by the running pass, with the last durable copy
struct PassState {
    state: AllocatorState,
    saved: AllocatorState,
    wrote: bool,
    /// Sources whose publish is only in memory; removed once a save lands
    pending_removal: Vec<PathBuf>,
}

impl PassState {
    fn dirty(&self) -> bool {
        self.state != self.saved
    }
}

/// Drives discovery, transcoding, allocation, publish, metadata update and
/// cleanup for every staged file, one job at a time.
pub struct Pipeline {
    cfg: IngestConfig,
    parts: Collaborators,
    provisioner: UnitProvisioner,
    retry: RetryPolicy,
}

impl Pipeline {
    pub fn new(cfg: IngestConfig, parts: Collaborators, retry: RetryPolicy) -> Self {
        let provisioner = UnitProvisioner::new(parts.unit_creator.clone(), cfg.unit_prefix.clone(), retry.clone());
        Self {
            cfg,
            parts,
            provisioner,
            retry,
        }
    }

    /// Wire the production collaborators from configuration
    pub fn from_config(cfg: IngestConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.http_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        let episodes: Arc<dyn EpisodeStore> = match &cfg.episode_db {
            Some(db) => Arc::new(DataApiEpisodeStore::new(client.clone(), db.clone())),
            None => {
                warn!("No episode database configured, video URLs will only be logged");
                Arc::new(DisabledEpisodeStore)
            }
        };
        let notifier: Arc<dyn Notifier> = match &cfg.telegram {
            Some(tg) => Arc::new(TelegramNotifier::new(client.clone(), tg.clone())),
            None => Arc::new(NullNotifier),
        };

        let parts = Collaborators {
            state_store: Arc::new(JsonStateStore::new(cfg.state_file.clone(), cfg.initial_unit_id())),
            transcoder: Arc::new(FfmpegTranscoder::new(cfg.transcode.clone())),
            unit_creator: Arc::new(GithubUnitCreator::new(
                client,
                cfg.git.api_base.clone(),
                cfg.git.token.clone(),
            )),
            publisher: Arc::new(GitPublisher::new(
                cfg.git.clone(),
                cfg.transcode.manifest_name.clone(),
                cfg.checkouts_dir(),
            )),
            episodes,
            notifier,
        };
        let retry = RetryPolicy::new(&cfg.retry);
        Ok(Self::new(cfg, parts, retry))
    }

    pub fn config(&self) -> &IngestConfig {
        &self.cfg
    }

    async fn notify(&self, message: &str) {
        notify_best_effort(self.parts.notifier.as_ref(), &self.retry, message).await;
    }

    /// Run one pass. A pass-level failure is logged and notified before it
    /// is returned; the next scheduled pass starts over.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let started = Utc::now();
        match self.pass().await {
            Ok(report) => {
                if report.discovered > 0 {
                    info!(
                        "Pass finished in {}s: {} completed, {} failed, {} skipped",
                        (Utc::now() - started).num_seconds(),
                        report.completed,
                        report.failed,
                        report.skipped
                    );
                }
                Ok(report)
            }
            Err(e) => {
                error!("Pass aborted: {}", e);
                self.notify(&format!("🔥 CRITICAL ERROR: {}", e)).await;
                Err(e)
            }
        }
    }

    async fn pass(&self) -> Result<PassReport> {
        let mut report = PassReport::default();

        let state = self.parts.state_store.load().map_err(|e| {
            let path = self.cfg.state_file.clone();
            let message = chain_message(&e);
            if is_corrupt(&e) {
                IngestError::StateCorrupt { path, message }
            } else {
                IngestError::StateUnreadable { path, message }
            }
        })?;

        let results = discover(
            &self.cfg.staging_dir,
            &self.cfg.media_extensions,
            Duration::from_secs(self.cfg.stability_check_secs),
        )
        .await?;
        report.discovered = results.len();
        if results.is_empty() {
            debug!("Nothing staged");
            return Ok(report);
        }

        self.check_state(&state).await?;

        let mut pass = PassState {
            saved: state.clone(),
            wrote: false,
            state,
            pending_removal: Vec::new(),
        };

        for result in results {
            let (path, size) = match result {
                ScanResult::Candidate(path, size) => (path, size),
                ScanResult::Skipped(path, reason) => {
                    info!("Skipping {} this pass: {}", path.display(), reason);
                    report.skipped += 1;
                    continue;
                }
            };

            match self.process_job(&path, size, &mut pass).await {
                Ok(()) => report.completed += 1,
                Err((stage, e)) => {
                    report.failed += 1;
                    let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
                    error!("❌ {} failed while {}: {}", name, stage, e);
                    if e.retried_next_pass() {
                        info!("{} stays in staging and will be retried next pass", name);
                    }
                    self.notify(&format!("❌ Error processing {} ({}): {}", name, stage, e)).await;
                }
            }
        }

        // Saving
        if pass.dirty() {
            self.save(&mut pass).map_err(|e| IngestError::StateSaveFailed(chain_message(&e)))?;
        }
        report.state_saved = pass.wrote;
        let pending = std::mem::take(&mut pass.pending_removal);
        for source in pending {
            self.remove_source(&source).await;
        }

        Ok(report)
    }

    /// Surface counter drift. A missing current unit makes allocation
    /// impossible, everything else is a warning.
    async fn check_state(&self, state: &AllocatorState) -> Result<()> {
        let violations = state.check_invariants(self.cfg.capacity_ceiling_bytes, &self.cfg.unit_prefix);
        for violation in &violations {
            if let StateViolation::CurrentUnitMissing(_) = violation {
                return Err(IngestError::StateInvariant(violation.to_string()));
            }
        }
        if !violations.is_empty() {
            let text: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
            warn!("State check: {}", text.join("; "));
            self.notify(&format!("⚠️ State check: {}", text.join("; "))).await;
        }
        Ok(())
    }

    fn save(&self, pass: &mut PassState) -> anyhow::Result<()> {
        self.parts.state_store.save(&pass.state)?;
        pass.saved = pass.state.clone();
        pass.wrote = true;
        Ok(())
    }

    /// Save after a mutation that must not be lost. Failures are reported and
    /// left for the end-of-pass save.
    async fn checkpoint(&self, pass: &mut PassState) -> bool {
        match self.save(pass) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to save state: {:#}", e);
                self.notify(&format!("🔥 Failed to save state: {:#}", e)).await;
                false
            }
        }
    }

    async fn remove_source(&self, source: &Path) {
        match tokio::fs::remove_file(source).await {
            Ok(()) => debug!("Removed source {}", source.display()),
            Err(e) => {
                error!("Failed to remove source {}: {}", source.display(), e);
                self.notify(&format!("⚠️ Could not remove {}: {}", source.display(), e)).await;
            }
        }
    }

    async fn process_job(
        &self,
        source: &Path,
        size: u64,
        pass: &mut PassState,
    ) -> std::result::Result<(), (JobStage, IngestError)> {
        // Extracting
        let job = Job::from_source(source, size, self.cfg.filename_offset)
            .map_err(|e| (JobStage::Extracting, e))?;
        let (season, episode) = (job.id.season, job.id.episode);
        info!("Job {}: {} ({} bytes)", job.key, job.id, job.raw_bytes);
        self.notify(&format!("⏳ Processing started: Season {} Episode {}", season, episode)).await;

        // Transcoding
        self.notify("🔧 HLS conversion in progress...").await;
        let artifact_dir = self.cfg.artifacts_dir().join(&job.key);
        let artifact = self
            .parts
            .transcoder
            .transcode(&job.source_path, &artifact_dir)
            .await
            .map_err(|e| {
                (
                    JobStage::Transcoding,
                    IngestError::TranscodeFailed {
                        input: job.source_path.clone(),
                        message: chain_message(&e),
                    },
                )
            })?;

        // Allocating: a job the journal already placed goes back to its unit
        let allocation = match journaled_unit(&pass.state, &job.key) {
            Some(unit_id) => {
                info!("{} was already published to {}, publishing there again", job.key, unit_id);
                Allocation {
                    unit_id,
                    provisioned: false,
                }
            }
            None => select_unit(
                &mut pass.state,
                artifact.total_bytes,
                self.cfg.capacity_ceiling_bytes,
                &self.provisioner,
            )
            .await
            .map_err(|e| (JobStage::Allocating, e))?,
        };
        if allocation.provisioned {
            self.notify(&format!("🆕 Created new repository: {}", allocation.unit_id)).await;
            // The remote unit exists now; losing it would reuse its name
            self.checkpoint(pass).await;
        }

        // Publishing
        let unit_id = allocation.unit_id;
        self.notify(&format!("⬆️ Uploading to {}", unit_id)).await;
        let publisher = self.parts.publisher.as_ref();
        let (dir, key, unit) = (artifact.dir.as_path(), job.key.as_str(), unit_id.as_str());
        let outcome = self
            .retry
            .run(&format!("publish {} to {}", key, unit), move |_| publisher.publish(dir, key, unit))
            .await
            .map_err(|e| {
                (
                    JobStage::Publishing,
                    IngestError::PublishFailed {
                        unit: unit_id.clone(),
                        key: job.key.clone(),
                        message: chain_message(&e),
                    },
                )
            })?;

        let credited = credit_publish(&mut pass.state, &job.key, &unit_id, artifact.total_bytes, outcome)
            .map_err(|e| (JobStage::Publishing, e))?;
        if !credited {
            info!("{} was already credited to {}, not counting it twice", job.key, unit_id);
        }
        let durable = self.checkpoint(pass).await;

        // UpdatingMetadata: the publish stands whatever happens here
        let url = self.parts.publisher.public_url(&unit_id, &job.key);
        let episodes = self.parts.episodes.as_ref();
        let (id, url_ref) = (job.id, url.as_str());
        match self
            .retry
            .run("episode update", move |_| episodes.set_video_url(id, url_ref))
            .await
        {
            Ok(UpdateOutcome::Updated) => info!("Episode {} now points at {}", job.id, url),
            Ok(UpdateOutcome::NoMatch) => {
                warn!("No episode record matched {}; URL {} not stored", job.id, url);
                self.notify(&format!("⚠️ No episode record for Season {} Episode {}\n🔗 {}", season, episode, url))
                    .await;
            }
            Err(e) => {
                let err = IngestError::MetadataUpdateFailed {
                    season,
                    episode,
                    message: chain_message(&e),
                };
                error!("{} (while {})", err, JobStage::UpdatingMetadata);
                self.notify(&format!("❌ {}\n🔗 {}", err, url)).await;
            }
        }

        // CleaningUp: the source goes only once its credit is durable
        if durable {
            self.remove_source(&job.source_path).await;
        } else {
            pass.pending_removal.push(job.source_path.clone());
        }
        if let Err(e) = tokio::fs::remove_dir_all(&artifact.dir).await {
            warn!("Failed to remove artifact {}: {}", artifact.dir.display(), e);
        }

        self.notify(&format!(
            "✅ Episode completed! Season {} Episode {}\n🔗 {}",
            season, episode, url
        ))
        .await;
        Ok(())
    }
}
