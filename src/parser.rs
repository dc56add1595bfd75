//! Client for the document-parsing sidecar (OCR / PDF-to-markdown).

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("parser request failed: {0}")]
    Connection(String),
    #[error("parser returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("failed to parse converter response: {0}")]
    Malformed(String),
    #[error("parser returned no extractable text for {0}")]
    Empty(String),
}

#[async_trait]
pub trait DocumentParser: Send + Sync + 'static {
    /// Convert raw file bytes into markdown/plain text.
    async fn parse(&self, filename: &str, bytes: &[u8]) -> Result<String, ParseError>;
}

pub struct OcrClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl OcrClient {
    pub fn from_config(config: &AppConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to create HTTP client");

        Self {
            client,
            base_url: config.ocr_service_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.ocr_timeout_seconds),
        }
    }

    async fn convert(&self, filename: &str, bytes: &[u8]) -> Result<String, ParseError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        let payload = json!({
            "sources": [{
                "kind": "base64",
                "data": encoded,
                "filename": filename,
            }]
        });

        debug!(filename, size = bytes.len(), "sending document to parser");

        let response = self
            .client
            .post(format!("{}/v1/convert/source", self.base_url))
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ParseError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ParseError::Http { status, body });
        }

        let converted: ConvertResponse = response
            .json()
            .await
            .map_err(|e| ParseError::Malformed(e.to_string()))?;

        let text = converted
            .documents
            .into_iter()
            .next()
            .and_then(|doc| doc.text())
            .or_else(|| converted.fallback.text());

        match text {
            Some(text) => {
                info!(filename, chars = text.len(), "parser extracted text");
                Ok(text)
            }
            None => Err(ParseError::Empty(filename.to_string())),
        }
    }
}

#[async_trait]
impl DocumentParser for OcrClient {
    async fn parse(&self, filename: &str, bytes: &[u8]) -> Result<String, ParseError> {
        self.convert(filename, bytes).await
    }
}

#[derive(Deserialize)]
struct ConvertResponse {
    #[serde(default)]
    documents: Vec<ConvertedDocument>,
    #[serde(flatten)]
    fallback: ConvertedDocument,
}

/// The converter has shipped the text under several keys across versions.
#[derive(Default, Deserialize)]
struct ConvertedDocument {
    #[serde(default)]
    md_content: Option<String>,
    #[serde(default)]
    markdown: Option<String>,
    #[serde(default)]
    output: Option<String>,
}

impl ConvertedDocument {
    fn text(self) -> Option<String> {
        self.md_content
            .or(self.markdown)
            .or(self.output)
            .filter(|text| !text.is_empty())
    }
}
