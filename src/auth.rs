//! Bearer-token access for the REST and push channels.
//!
//! Token issuance lives in an external collaborator; this crate only needs
//! an accessor and the retry-once contract: a 401 triggers exactly one
//! `refresh()` before the call is treated as a hard auth failure. The sync
//! queue must never spin on a persistently bad token.

use async_trait::async_trait;

use crate::error::{Result, SyncError};

#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// Current bearer token for outgoing calls.
    async fn access_token(&self) -> Result<String>;

    /// Attempt to obtain a fresh token after a 401. Called at most once per
    /// request; a failure here makes the request a terminal `Auth` error.
    async fn refresh(&self) -> Result<String>;
}

/// Fixed-token provider for deployments where the terminal is provisioned
/// with a long-lived key (and for tests). `refresh` hands back the same
/// token, so a persistent 401 terminates instead of looping.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String> {
        if self.token.is_empty() {
            return Err(SyncError::Auth("no access token configured".into()));
        }
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> Result<String> {
        self.access_token().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider_returns_token() {
        let provider = StaticTokenProvider::new("tok-1");
        assert_eq!(provider.access_token().await.unwrap(), "tok-1");
        assert_eq!(provider.refresh().await.unwrap(), "tok-1");
    }

    #[tokio::test]
    async fn test_empty_token_is_auth_error() {
        let provider = StaticTokenProvider::new("");
        assert!(matches!(
            provider.access_token().await,
            Err(SyncError::Auth(_))
        ));
    }
}
