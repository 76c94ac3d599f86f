//! The remote realtime store, as seen from one agent.
//!
//! Only the sync workers talk to it. Every call is made under a timeout by
//! the caller.

mod http;
mod protocol;

pub use http::HttpRemoteStore;
pub use protocol::*;

use crate::identity::Credential;
use async_trait::async_trait;
use sentinel_engine::{ErrorClass, PushAck, RemoteChange, RemoteVersion, SyncRecord};
use std::time::Duration;

/// Remote store errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("remote unavailable: {0}")]
    Transient(String),

    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote refused credential: {0}")]
    Unauthenticated(String),

    /// The request itself was refused; resending it unchanged will not help
    #[error("remote rejected request: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RemoteError::Transient(_) | RemoteError::Timeout(_) => ErrorClass::Transient,
            RemoteError::Unauthenticated(_) => ErrorClass::Unauthenticated,
            RemoteError::Rejected(_) => ErrorClass::DataIntegrity,
        }
    }
}

/// One page of remote changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullPage {
    pub changes: Vec<RemoteChange>,
    pub has_more: bool,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Changes with version greater than `since`, oldest first.
    async fn pull(
        &self,
        credential: &Credential,
        since: RemoteVersion,
        limit: u32,
    ) -> Result<PullPage, RemoteError>;

    /// Push a batch of one device's pending records.
    async fn push(
        &self,
        credential: &Credential,
        device_id: &str,
        batch: &[SyncRecord],
    ) -> Result<PushAck, RemoteError>;

    /// Cheap reachability check; needs no credential.
    async fn probe(&self) -> Result<(), RemoteError>;
}
