use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// 4.5 GiB, the hard ceiling for a single storage unit
pub const DEFAULT_CAPACITY_CEILING: u64 = 4_831_838_208;

/// Configuration for the HLS ingest daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Directory scanned for newly uploaded media files
    pub staging_dir: PathBuf,
    /// Scratch space for transcoded artifacts and unit working copies
    pub work_dir: PathBuf,
    /// Path of the persisted allocator state (JSON)
    pub state_file: PathBuf,
    /// File extensions eligible for ingest (compared case-insensitively)
    pub media_extensions: Vec<String>,
    /// Index of the season digit in the file name
    pub filename_offset: usize,
    /// Maximum cumulative bytes a single unit may hold
    pub capacity_ceiling_bytes: u64,
    /// Unit ids are `unit_prefix` followed by an ordinal
    pub unit_prefix: String,
    /// Interval in seconds between passes
    pub scan_interval_secs: u64,
    /// Seconds between the two size checks that detect in-flight uploads (0 disables)
    pub stability_check_secs: u64,
    /// Timeout for every outbound HTTP request
    pub http_timeout_secs: u64,
    pub transcode: TranscodeSettings,
    pub git: GitSettings,
    pub episode_db: Option<EpisodeDbSettings>,
    pub telegram: Option<TelegramSettings>,
    pub retry: RetrySettings,
}

/// ffmpeg invocation parameters for HLS output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeSettings {
    pub ffmpeg_bin: PathBuf,
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
    pub audio_codec: String,
    pub audio_bitrate: String,
    /// Target HLS segment duration in seconds
    pub segment_secs: u32,
    /// Playlist file name written inside the artifact directory
    pub manifest_name: String,
    /// Kill ffmpeg after this many seconds
    pub timeout_secs: u64,
}

/// Remote git storage units (GitHub repositories by default)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSettings {
    pub git_bin: PathBuf,
    /// Account owning every unit
    pub owner: String,
    /// Access token, usually provided via GITHUB_TOKEN
    pub token: Option<String>,
    /// REST endpoint used to create units
    pub api_base: String,
    /// Base of clone URLs: `{remote_base}/{owner}/{unit}.git`
    pub remote_base: String,
    /// Branch used in public URLs
    pub branch: String,
    /// Public CDN base for published playlists
    pub cdn_base: String,
    pub author_name: String,
    pub author_email: String,
    /// Per git command timeout
    pub timeout_secs: u64,
}

/// Episode database reached through a MongoDB Data API compatible endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EpisodeDbSettings {
    /// Full URL of the `updateOne` action
    pub endpoint: String,
    pub api_key: Option<String>,
    pub data_source: String,
    pub database: String,
    pub collection: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramSettings {
    pub token: String,
    pub chat_id: String,
    pub api_base: String,
}

/// Retry policy shared by every external call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: usize,
    /// Delay before each retry; the last entry repeats
    pub backoff_secs: Vec<u64>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            video_codec: "libx264".to_string(),
            preset: "ultrafast".to_string(),
            crf: 23,
            audio_codec: "aac".to_string(),
            audio_bitrate: "128k".to_string(),
            segment_secs: 6,
            manifest_name: "video.m3u8".to_string(),
            timeout_secs: 6 * 60 * 60,
        }
    }
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            git_bin: PathBuf::from("git"),
            owner: "miraItalia".to_string(),
            token: None,
            api_base: "https://api.github.com".to_string(),
            remote_base: "https://github.com".to_string(),
            branch: "master".to_string(),
            cdn_base: "https://cdn.jsdelivr.net/gh".to_string(),
            author_name: "ingestd".to_string(),
            author_email: "ingestd@localhost".to_string(),
            timeout_secs: 30 * 60,
        }
    }
}

impl Default for EpisodeDbSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: None,
            data_source: "Cluster0".to_string(),
            database: "test".to_string(),
            collection: "episodes".to_string(),
        }
    }
}

impl Default for TelegramSettings {
    fn default() -> Self {
        Self {
            token: String::new(),
            chat_id: String::new(),
            api_base: "https://api.telegram.org".to_string(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_secs: vec![2, 10, 30],
        }
    }
}

impl IngestConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            staging_dir: PathBuf::from("/data/uploads"),
            work_dir: PathBuf::from("/data/temp"),
            state_file: PathBuf::from("/data/state.json"),
            media_extensions: vec!["mp4".to_string()],
            filename_offset: 1,
            capacity_ceiling_bytes: DEFAULT_CAPACITY_CEILING,
            unit_prefix: "miraEp".to_string(),
            scan_interval_secs: 300,
            stability_check_secs: 5,
            http_timeout_secs: 30,
            transcode: TranscodeSettings::default(),
            git: GitSettings::default(),
            episode_db: None,
            telegram: None,
            retry: RetrySettings::default(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist.
    /// Secrets from the environment override whatever the file contains.
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // Try JSON first, then TOML
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.apply_env(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
        Ok(config)
    }

    /// Apply secret overrides. `lookup` is `std::env::var` outside of tests.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("GITHUB_TOKEN") {
            self.git.token = Some(token);
        }

        if let Some(token) = lookup("TELEGRAM_TOKEN") {
            let telegram = self.telegram.get_or_insert_with(TelegramSettings::default);
            telegram.token = token;
        }
        if let Some(chat_id) = lookup("TELEGRAM_CHAT_ID") {
            if let Some(telegram) = self.telegram.as_mut() {
                telegram.chat_id = chat_id;
            }
        }
        // A half-configured channel is treated as absent
        if self
            .telegram
            .as_ref()
            .is_some_and(|t| t.token.is_empty() || t.chat_id.is_empty())
        {
            self.telegram = None;
        }

        if let Some(key) = lookup("EPISODE_DB_API_KEY") {
            if let Some(db) = self.episode_db.as_mut() {
                db.api_key = Some(key);
            }
        }
    }

    /// Initial unit used when no state has been persisted yet
    pub fn initial_unit_id(&self) -> String {
        format!("{}1", self.unit_prefix)
    }

    /// Directory holding transcoded artifacts, one subdirectory per job key
    pub fn artifacts_dir(&self) -> PathBuf {
        self.work_dir.join("hls")
    }

    /// Directory holding short-lived unit working copies
    pub fn checkouts_dir(&self) -> PathBuf {
        self.work_dir.join("units")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_reference_deployment() {
        let cfg = IngestConfig::default_config();
        assert_eq!(cfg.capacity_ceiling_bytes, 9 * 1024 * 1024 * 1024 / 2);
        assert_eq!(cfg.scan_interval_secs, 300);
        assert_eq!(cfg.initial_unit_id(), "miraEp1");
        assert_eq!(cfg.transcode.manifest_name, "video.m3u8");
        assert!(cfg.telegram.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingest.toml");
        std::fs::write(
            &path,
            "staging_dir = \"/srv/up\"\nunit_prefix = \"ep\"\n\n[transcode]\ncrf = 28\n",
        )
        .unwrap();

        let cfg = IngestConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.staging_dir, PathBuf::from("/srv/up"));
        assert_eq!(cfg.unit_prefix, "ep");
        assert_eq!(cfg.transcode.crf, 28);
        assert_eq!(cfg.transcode.preset, "ultrafast");
        assert_eq!(cfg.retry.max_attempts, 3);
    }

    #[test]
    fn test_json_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingest.json");
        std::fs::write(&path, r#"{"capacity_ceiling_bytes": 1000, "media_extensions": ["mp4", "mkv"]}"#).unwrap();

        let cfg = IngestConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.capacity_ceiling_bytes, 1000);
        assert_eq!(cfg.media_extensions, vec!["mp4", "mkv"]);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let cfg = IngestConfig::load_config(Some(Path::new("/nonexistent/ingest.toml"))).unwrap();
        assert_eq!(cfg.unit_prefix, "miraEp");
    }

    #[test]
    fn test_env_overrides_secrets() {
        let env: HashMap<&str, &str> = [
            ("GITHUB_TOKEN", "ghp_secret"),
            ("TELEGRAM_TOKEN", "bot123"),
            ("TELEGRAM_CHAT_ID", "42"),
        ]
        .into_iter()
        .collect();

        let mut cfg = IngestConfig::default_config();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.git.token.as_deref(), Some("ghp_secret"));
        let telegram = cfg.telegram.expect("telegram configured");
        assert_eq!(telegram.token, "bot123");
        assert_eq!(telegram.chat_id, "42");
    }

    #[test]
    fn test_telegram_without_chat_is_disabled() {
        let mut cfg = IngestConfig::default_config();
        cfg.apply_env(|k| (k == "TELEGRAM_TOKEN").then(|| "bot123".to_string()));
        assert!(cfg.telegram.is_none());
    }
}
