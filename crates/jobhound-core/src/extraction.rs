use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::ExtractionConfig;

/// Structured event pulled out of a message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedEvent {
    pub title: String,
    pub starts_at: DateTime<Utc>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("extraction request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("extraction service returned status {0}")]
    Status(u16),
    #[error("extraction timed out")]
    Timeout,
    #[error("extraction failed: {0}")]
    Failed(String),
}

/// Best-effort enrichment. Callers log failures and carry on.
#[async_trait]
pub trait EventExtractor: Send + Sync {
    async fn extract_event(
        &self,
        body: &str,
        template: &str,
    ) -> Result<Option<ExtractedEvent>, ExtractionError>;
}

#[derive(Serialize)]
struct ExtractionRequest<'a> {
    body: &'a str,
    template: &'a str,
}

#[derive(Deserialize)]
struct ExtractionResponse {
    event: Option<ExtractedEvent>,
}

/// Posts `{body, template}` to an extraction service and expects
/// `{"event": {...} | null}` back.
#[derive(Clone)]
pub struct HttpEventExtractor {
    http: Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpEventExtractor {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into(),
            timeout,
        }
    }

    /// Builds an extractor when an endpoint is configured.
    pub fn from_config(config: &ExtractionConfig) -> Option<Self> {
        config
            .endpoint
            .as_ref()
            .filter(|endpoint| !endpoint.trim().is_empty())
            .map(|endpoint| Self::new(endpoint.clone(), Duration::from_secs(config.timeout_secs)))
    }
}

#[async_trait]
impl EventExtractor for HttpEventExtractor {
    async fn extract_event(
        &self,
        body: &str,
        template: &str,
    ) -> Result<Option<ExtractedEvent>, ExtractionError> {
        let request = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&ExtractionRequest { body, template });

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                ExtractionError::Timeout
            } else {
                ExtractionError::Transport(err)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractionError::Status(status.as_u16()));
        }

        let parsed: ExtractionResponse = response.json().await?;
        Ok(parsed.event)
    }
}

/// Scripted extractor for tests. Returns `Ok(None)` once the script runs out.
#[derive(Debug, Default, Clone)]
pub struct MockExtractor {
    responses: Arc<Mutex<VecDeque<Result<Option<ExtractedEvent>, String>>>>,
    call_count: Arc<AtomicUsize>,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue(&self, response: Result<Option<ExtractedEvent>, String>) {
        self.responses.lock().await.push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventExtractor for MockExtractor {
    async fn extract_event(
        &self,
        _body: &str,
        _template: &str,
    ) -> Result<Option<ExtractedEvent>, ExtractionError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        match self.responses.lock().await.pop_front() {
            Some(Ok(event)) => Ok(event),
            Some(Err(message)) => Err(ExtractionError::Failed(message)),
            None => Ok(None),
        }
    }
}
