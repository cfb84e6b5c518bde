//! Catalog sources - where tool definitions come from
//!
//! The registry assembles its catalog from any number of sources: static
//! definition files shipped with the deployment, plus workflows discovered
//! from a remote catalog service.

use async_trait::async_trait;
use thiserror::Error;

use conjure_types::ToolDefinition;

/// Errors from catalog sources
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to fetch catalog: {message}")]
    Fetch { message: String },

    #[error("Failed to parse catalog: {message}")]
    Parse { message: String },
}

/// A provider of tool definitions
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Name for logging
    fn name(&self) -> &str;

    /// Fetch the current set of definitions from this source
    async fn fetch(&self) -> Result<Vec<ToolDefinition>, SourceError>;
}

/// Definitions parsed from a static JSON document
pub struct StaticCatalogSource {
    definitions: Vec<ToolDefinition>,
}

impl StaticCatalogSource {
    pub fn new(definitions: Vec<ToolDefinition>) -> Self {
        Self { definitions }
    }

    /// Parse a JSON array of tool definitions
    pub fn from_json(json: &str) -> Result<Self, SourceError> {
        let definitions: Vec<ToolDefinition> =
            serde_json::from_str(json).map_err(|e| SourceError::Parse {
                message: e.to_string(),
            })?;
        Ok(Self { definitions })
    }
}

#[async_trait]
impl CatalogSource for StaticCatalogSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch(&self) -> Result<Vec<ToolDefinition>, SourceError> {
        Ok(self.definitions.clone())
    }
}

/// Definitions discovered from a remote workflow catalog over HTTP.
///
/// The remote service exposes a JSON array of tool definitions at a single
/// endpoint; authentication is a bearer token when configured.
pub struct RemoteCatalogSource {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl RemoteCatalogSource {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            api_key,
        }
    }
}

#[async_trait]
impl CatalogSource for RemoteCatalogSource {
    fn name(&self) -> &str {
        "remote-workflow-catalog"
    }

    async fn fetch(&self) -> Result<Vec<ToolDefinition>, SourceError> {
        let mut request = self.client.get(&self.url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| SourceError::Fetch {
            message: e.to_string(),
        })?;

        if !response.status().is_success() {
            return Err(SourceError::Fetch {
                message: format!("HTTP {}", response.status()),
            });
        }

        let definitions: Vec<ToolDefinition> =
            response.json().await.map_err(|e| SourceError::Parse {
                message: e.to_string(),
            })?;

        tracing::debug!(
            source = self.name(),
            count = definitions.len(),
            "fetched remote catalog"
        );
        Ok(definitions)
    }
}
