use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use tokio::process::Command;
use tokio::time::timeout;
use walkdir::WalkDir;

use crate::config::TranscodeSettings;

/// Keep only the end of ffmpeg's stderr; the useful part is the last lines
const STDERR_TAIL_BYTES: usize = 4000;

/// HLS output of one transcode: a playlist plus its segments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodedArtifact {
    pub dir: PathBuf,
    pub manifest: PathBuf,
    /// Sum of all file sizes in `dir`
    pub total_bytes: u64,
    pub file_count: usize,
}

impl TranscodedArtifact {
    /// Measure an artifact directory and make sure the playlist is there
    pub fn measure(dir: &Path, manifest_name: &str) -> Result<Self> {
        let manifest = dir.join(manifest_name);
        if !manifest.is_file() {
            anyhow::bail!("playlist {} was not produced", manifest.display());
        }

        let mut total_bytes = 0;
        let mut file_count = 0;
        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = entry.with_context(|| format!("Failed to walk artifact dir: {}", dir.display()))?;
            if entry.file_type().is_file() {
                let meta = entry
                    .metadata()
                    .with_context(|| format!("Failed to stat: {}", entry.path().display()))?;
                total_bytes += meta.len();
                file_count += 1;
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
            total_bytes,
            file_count,
        })
    }
}

/// External transcoding step. Blocks until the tool exits.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(&self, input: &Path, output_dir: &Path) -> Result<TranscodedArtifact>;
}

/// Runs the local ffmpeg binary to produce HLS output
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    settings: TranscodeSettings,
}

impl FfmpegTranscoder {
    pub fn new(settings: TranscodeSettings) -> Self {
        Self { settings }
    }

    /// ffmpeg arguments: fast x264 preset at a fixed CRF, fixed-bitrate AAC,
    /// VOD playlist with every segment listed, all CPU threads
    pub fn build_args(&self, input: &Path, output_dir: &Path) -> Vec<String> {
        let s = &self.settings;
        let mut args = Vec::new();

        // Overwrite, no stdin interaction
        args.push("-y".to_string());
        args.push("-nostdin".to_string());

        args.push("-i".to_string());
        args.push(input.display().to_string());

        args.push("-c:v".to_string());
        args.push(s.video_codec.clone());
        args.push("-preset".to_string());
        args.push(s.preset.clone());
        args.push("-crf".to_string());
        args.push(s.crf.to_string());

        args.push("-c:a".to_string());
        args.push(s.audio_codec.clone());
        args.push("-b:a".to_string());
        args.push(s.audio_bitrate.clone());

        args.push("-hls_time".to_string());
        args.push(s.segment_secs.to_string());
        args.push("-hls_list_size".to_string());
        args.push("0".to_string());
        args.push("-threads".to_string());
        args.push("0".to_string());
        args.push("-f".to_string());
        args.push("hls".to_string());

        args.push(output_dir.join(&s.manifest_name).display().to_string());
        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, input: &Path, output_dir: &Path) -> Result<TranscodedArtifact> {
        // Leftovers from an earlier failed attempt would be published with the new output
        if output_dir.exists() {
            debug!("Removing stale artifact dir: {}", output_dir.display());
            tokio::fs::remove_dir_all(output_dir)
                .await
                .with_context(|| format!("Failed to clear stale output: {}", output_dir.display()))?;
        }
        tokio::fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("Failed to create output dir: {}", output_dir.display()))?;

        let args = self.build_args(input, output_dir);
        debug!("ffmpeg args: {:?}", args);

        let mut cmd = Command::new(&self.settings.ffmpeg_bin);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().with_context(|| {
            format!(
                "Failed to spawn ffmpeg at: {}. Ensure ffmpeg is installed and accessible.",
                self.settings.ffmpeg_bin.display()
            )
        })?;

        let limit = Duration::from_secs(self.settings.timeout_secs);
        // On timeout the child is dropped, and kill_on_drop terminates it
        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(result) => result.context("Failed to wait for ffmpeg process")?,
            Err(_) => {
                return Err(anyhow!(
                    "ffmpeg timed out after {} seconds and was killed",
                    self.settings.timeout_secs
                ));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "ffmpeg exited with {}: {}",
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr_tail(&stderr)
            ));
        }

        let artifact = TranscodedArtifact::measure(output_dir, &self.settings.manifest_name)?;
        info!(
            "Transcoded {} -> {} ({} files, {} bytes)",
            input.display(),
            output_dir.display(),
            artifact.file_count,
            artifact.total_bytes
        );
        Ok(artifact)
    }
}

fn stderr_tail(stderr: &str) -> &str {
    let trimmed = stderr.trim_end();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed;
    }
    let mut start = trimmed.len() - STDERR_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}
