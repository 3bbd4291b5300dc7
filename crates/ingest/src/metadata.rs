use anyhow::{Context, Result};
use async_trait::async_trait;
use log::warn;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::config::EpisodeDbSettings;
use crate::filename::EpisodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    /// No record matched (season, episode)
    NoMatch,
}

/// Episode database: one conditional update keyed by (season, episode)
#[async_trait]
pub trait EpisodeStore: Send + Sync {
    async fn set_video_url(&self, id: EpisodeId, url: &str) -> Result<UpdateOutcome>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateOneResponse {
    matched_count: u64,
}

/// `updateOne` through a MongoDB Data API compatible HTTP endpoint
#[derive(Debug, Clone)]
pub struct DataApiEpisodeStore {
    client: Client,
    settings: EpisodeDbSettings,
}

impl DataApiEpisodeStore {
    pub fn new(client: Client, settings: EpisodeDbSettings) -> Self {
        Self { client, settings }
    }

    fn request_body(&self, id: EpisodeId, url: &str) -> serde_json::Value {
        json!({
            "dataSource": self.settings.data_source,
            "database": self.settings.database,
            "collection": self.settings.collection,
            "filter": { "season": id.season, "episodeNumber": id.episode },
            "update": { "$set": { "videoUrl": url } },
        })
    }
}

#[async_trait]
impl EpisodeStore for DataApiEpisodeStore {
    async fn set_video_url(&self, id: EpisodeId, url: &str) -> Result<UpdateOutcome> {
        let mut request = self
            .client
            .post(&self.settings.endpoint)
            .json(&self.request_body(id, url));
        if let Some(key) = &self.settings.api_key {
            request = request.header("api-key", key);
        }

        let response: UpdateOneResponse = request
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.settings.endpoint))?
            .error_for_status()?
            .json()
            .await
            .context("Failed to decode updateOne response")?;

        if response.matched_count == 0 {
            Ok(UpdateOutcome::NoMatch)
        } else {
            Ok(UpdateOutcome::Updated)
        }
    }
}

/// Used when no database is configured; every update is a logged no-op
#[derive(Debug, Clone, Default)]
pub struct DisabledEpisodeStore;

#[async_trait]
impl EpisodeStore for DisabledEpisodeStore {
    async fn set_video_url(&self, id: EpisodeId, url: &str) -> Result<UpdateOutcome> {
        warn!("Episode database not configured, {} not recorded for {}", url, id);
        Ok(UpdateOutcome::NoMatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_one_request_shape() {
        let store = DataApiEpisodeStore::new(
            Client::new(),
            EpisodeDbSettings {
                endpoint: "http://db.local/action/updateOne".to_string(),
                collection: "episodes".to_string(),
                ..Default::default()
            },
        );
        let body = store.request_body(EpisodeId { season: 2, episode: 11 }, "https://cdn/x.m3u8");

        assert_eq!(body["collection"], "episodes");
        assert_eq!(body["filter"]["season"], 2);
        assert_eq!(body["filter"]["episodeNumber"], 11);
        assert_eq!(body["update"]["$set"]["videoUrl"], "https://cdn/x.m3u8");
    }

    #[test]
    fn test_response_decoding() {
        let r: UpdateOneResponse = serde_json::from_str(r#"{"matchedCount":0,"modifiedCount":0}"#).unwrap();
        assert_eq!(r.matched_count, 0);
    }

    #[tokio::test]
    async fn test_disabled_store_reports_no_match() {
        let outcome = DisabledEpisodeStore
            .set_video_url(EpisodeId { season: 1, episode: 1 }, "u")
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::NoMatch);
    }
}
