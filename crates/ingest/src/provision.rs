use std::sync::Arc;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use crate::error::{chain_message, IngestError};
use crate::retry::RetryPolicy;
use crate::state::{AllocatorState, StorageUnit};

/// External "create storage unit" call
#[async_trait]
pub trait UnitCreator: Send + Sync {
    async fn create_unit(&self, unit_id: &str) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct CreateRepoRequest<'a> {
    name: &'a str,
    auto_init: bool,
    private: bool,
}

/// Creates public, auto-initialised GitHub repositories
#[derive(Debug, Clone)]
pub struct GithubUnitCreator {
    client: Client,
    api_base: String,
    token: Option<String>,
}

impl GithubUnitCreator {
    pub fn new(client: Client, api_base: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token,
        }
    }
}

#[async_trait]
impl UnitCreator for GithubUnitCreator {
    async fn create_unit(&self, unit_id: &str) -> Result<()> {
        let token = self
            .token
            .as_deref()
            .context("no git token configured, cannot create repositories")?;

        let url = format!("{}/user/repos", self.api_base);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("token {}", token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "ingestd")
            .json(&CreateRepoRequest {
                name: unit_id,
                auto_init: true,
                private: false,
            })
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        // A crash between creation and the state save leaves the repo behind
        if status == StatusCode::UNPROCESSABLE_ENTITY && body.contains("already exists") {
            info!("Repository {} already exists, reusing it", unit_id);
            return Ok(());
        }
        anyhow::bail!("repository creation returned {}: {}", status, body.trim())
    }
}

/// Synthesises unit ids and registers new units in the allocator state
#[derive(Clone)]
pub struct UnitProvisioner {
    creator: Arc<dyn UnitCreator>,
    prefix: String,
    retry: RetryPolicy,
}

impl UnitProvisioner {
    pub fn new(creator: Arc<dyn UnitCreator>, prefix: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            creator,
            prefix: prefix.into(),
            retry,
        }
    }

    /// Id the next provisioned unit will get
    pub fn next_unit_id(&self, state: &AllocatorState) -> String {
        format!("{}{}", self.prefix, state.next_unit_ordinal)
    }

    /// Create the next unit remotely, then register it with zero usage.
    /// The state is untouched when the remote call fails.
    pub async fn provision(&self, state: &mut AllocatorState) -> Result<String, IngestError> {
        let unit_id = self.next_unit_id(state);
        info!("🆕 Provisioning new unit {}", unit_id);

        let creator = self.creator.as_ref();
        let id = unit_id.as_str();
        self.retry
            .run(&format!("create unit {}", unit_id), move |_| creator.create_unit(id))
            .await
            .map_err(|e| IngestError::ProvisionFailed {
                unit: unit_id.clone(),
                message: chain_message(&e),
            })?;

        state.next_unit_ordinal += 1;
        state.units.insert(unit_id.clone(), StorageUnit::default());
        Ok(unit_id)
    }
}
