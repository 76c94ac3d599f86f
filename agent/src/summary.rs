//! Best-effort AI summaries of recent transitions.
//!
//! The summary service is a black box: a window of transition events goes
//! in, free text comes out. Callers treat every failure as "no summary".

use async_trait::async_trait;
use reqwest::Client;
use sentinel_engine::TransitionEvent;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SummaryError {
    #[error("summary request failed: {0}")]
    Request(String),

    #[error("summary service returned no text")]
    Empty,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, events: &[TransitionEvent]) -> Result<String, SummaryError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SummaryRequest<'a> {
    events: &'a [TransitionEvent],
}

#[derive(Deserialize)]
struct SummaryResponse {
    #[serde(default)]
    summary: String,
}

/// Posts `{"events": [...]}` and reads `{"summary": "..."}`.
pub struct HttpSummarizer {
    client: Client,
    url: String,
}

impl HttpSummarizer {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SummaryError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SummaryError::Request(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, events: &[TransitionEvent]) -> Result<String, SummaryError> {
        let response = self
            .client
            .post(&self.url)
            .json(&SummaryRequest { events })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SummaryError::Request(e.to_string()))?;

        let body: SummaryResponse = response
            .json()
            .await
            .map_err(|e| SummaryError::Request(e.to_string()))?;

        let summary = body.summary.trim();
        if summary.is_empty() {
            Err(SummaryError::Empty)
        } else {
            Ok(summary.to_string())
        }
    }
}
