//! Principal identity and renewable credentials.
//!
//! The agent does not implement an authentication protocol. It holds
//! whatever credential the host application last handed it and tells the
//! sync workers when a fresh one arrives.

use sentinel_engine::Timestamp;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tokio::sync::watch;

/// A bearer credential for the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub principal_id: String,
    pub token: String,
    /// Expiry in milliseconds since the epoch; `None` never expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Timestamp>,
}

impl Credential {
    pub fn new(principal_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, expires_at: Timestamp) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("no credential configured")]
    Missing,

    #[error("credential for '{0}' expired")]
    Expired(String),
}

/// Source of credentials for remote calls.
pub trait IdentityProvider: Send + Sync {
    /// A currently valid credential.
    fn credential(&self, now: Timestamp) -> Result<Credential, IdentityError>;

    /// Changes whenever a new credential is installed.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// Holds the credential installed by the host application.
pub struct StaticIdentity {
    current: RwLock<Option<Credential>>,
    generation: watch::Sender<u64>,
}

impl StaticIdentity {
    pub fn new(initial: Option<Credential>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            current: RwLock::new(initial),
            generation,
        }
    }

    /// Install a new credential and wake any worker waiting for one.
    pub fn refresh(&self, credential: Credential) {
        tracing::info!(principal_id = %credential.principal_id, "Credential refreshed");
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(credential);
        self.generation.send_modify(|g| *g += 1);
    }

    pub fn principal_id(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|c| c.principal_id.clone())
    }
}

impl IdentityProvider for StaticIdentity {
    fn credential(&self, now: Timestamp) -> Result<Credential, IdentityError> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            None => Err(IdentityError::Missing),
            Some(c) if c.is_expired(now) => Err(IdentityError::Expired(c.principal_id.clone())),
            Some(c) => Ok(c.clone()),
        }
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credential() {
        let identity = StaticIdentity::new(None);
        assert_eq!(identity.credential(0), Err(IdentityError::Missing));
    }

    #[test]
    fn expired_credential() {
        let identity = StaticIdentity::new(Some(Credential::new("alice", "t1").expiring_at(1_000)));
        assert!(identity.credential(999).is_ok());
        assert_eq!(
            identity.credential(1_000),
            Err(IdentityError::Expired("alice".into()))
        );
    }

    #[tokio::test]
    async fn refresh_notifies_subscribers() {
        let identity = StaticIdentity::new(None);
        let mut rx = identity.subscribe();
        identity.refresh(Credential::new("alice", "t2"));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
        assert_eq!(identity.credential(0).unwrap().token, "t2");
    }
}
