//! HTTP/JSON client for the remote store.

use super::protocol::{PullQuery, PullResponse, PushRequest, PushedRecord, RemoteErrorBody};
use super::{PullPage, RemoteError, RemoteStore};
use crate::identity::Credential;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use sentinel_engine::{PushAck, RemoteVersion, SyncRecord};
use std::time::Duration;

pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpRemoteStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transient(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn transport_error(&self, e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else {
            RemoteError::Transient(e.to_string())
        }
    }
}

/// Map a non-success response to an error class.
async fn status_error(response: Response) -> RemoteError {
    let status = response.status();
    let body: RemoteErrorBody = response.json().await.unwrap_or_default();
    let message = match body.message() {
        m if m.is_empty() => status.to_string(),
        m => m,
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthenticated(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::Transient(message)
        }
        s if s.is_client_error() => RemoteError::Rejected(message),
        _ => RemoteError::Transient(message),
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn pull(
        &self,
        credential: &Credential,
        since: RemoteVersion,
        limit: u32,
    ) -> Result<PullPage, RemoteError> {
        let response = self
            .client
            .get(self.url("/changes"))
            .bearer_auth(&credential.token)
            .query(&PullQuery { since, limit })
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let body: PullResponse = response
            .json()
            .await
            .map_err(|e| self.transport_error(e))?;
        Ok(PullPage {
            changes: body.changes,
            has_more: body.has_more,
        })
    }

    async fn push(
        &self,
        credential: &Credential,
        device_id: &str,
        batch: &[SyncRecord],
    ) -> Result<PushAck, RemoteError> {
        let request = PushRequest {
            device_id: device_id.to_string(),
            records: batch.iter().map(PushedRecord::from).collect(),
        };

        let response = self
            .client
            .post(self.url(&format!("/devices/{device_id}/records")))
            .bearer_auth(&credential.token)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        response.json().await.map_err(|e| self.transport_error(e))
    }

    async fn probe(&self) -> Result<(), RemoteError> {
        let response = self
            .client
            .get(self.url("/health"))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(RemoteError::Transient(response.status().to_string()))
        }
    }
}
