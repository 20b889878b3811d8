//! Invoice field extraction through an external document service.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Extracted invoice fields keyed by field name.
pub type Fields = BTreeMap<String, String>;

#[async_trait]
pub trait FieldExtractor: Send + Sync {
    async fn extract_fields(&self, path: &Path) -> Result<Fields, ExtractError>;
}

/// Settings for [`HttpFieldExtractor`].
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub endpoint: String,
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ExtractRequest<'a> {
    file_name: &'a str,
    mime_type: &'a str,
    /// Base64 encoded document body.
    content: String,
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    #[serde(default)]
    fields: serde_json::Map<String, Value>,
}

/// Posts each document as JSON to a document-understanding endpoint.
///
/// The service answers `{"fields": {"numero_nota": "...", ...}}`. Non-string
/// values are kept in their JSON text form and nulls are dropped.
pub struct HttpFieldExtractor {
    config: ExtractorConfig,
    client: Client,
}

impl HttpFieldExtractor {
    pub fn new(config: ExtractorConfig) -> Result<Self, ExtractError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExtractError::Connection(e.to_string()))?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }
}

fn into_fields(raw: serde_json::Map<String, Value>) -> Fields {
    raw.into_iter()
        .filter_map(|(key, value)| match value {
            Value::Null => None,
            Value::String(s) => Some((key, s.trim().to_string())),
            other => Some((key, other.to_string())),
        })
        .collect()
}

#[async_trait]
impl FieldExtractor for HttpFieldExtractor {
    async fn extract_fields(&self, path: &Path) -> Result<Fields, ExtractError> {
        let body = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let request = ExtractRequest {
            file_name: &file_name,
            mime_type: "application/pdf",
            content: base64::engine::general_purpose::STANDARD.encode(&body),
        };

        debug!("Extracting fields from {}", file_name);
        let resp = self
            .client
            .post(&self.config.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| ExtractError::Connection(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ExtractError::Api(format!("HTTP {}", resp.status())));
        }

        let parsed: ExtractResponse = resp
            .json()
            .await
            .map_err(|e| ExtractError::Parse(e.to_string()))?;

        Ok(into_fields(parsed.fields))
    }
}
