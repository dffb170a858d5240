use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{runtime::Handle, sync::Mutex};
use tracing::{debug, info, warn};
use url::Url;

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> Result<String>;
}

pub struct MissingTokenRefresher;

#[async_trait]
impl TokenRefresher for MissingTokenRefresher {
    async fn refresh(&self) -> Result<String> {
        Err(anyhow!("no token refresher configured"))
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("token refresh timed out after {0:?}")]
    TimedOut(Duration),
    #[error("token refresh failed: {0}")]
    Failed(#[source] anyhow::Error),
    #[error("concurrent token refresh failed: {0}")]
    Concurrent(String),
}

#[derive(Debug, Clone, Copy)]
pub struct Rejection<'a> {
    pub skip_auth: bool,
    /// Unauthorized responses seen for this request, including this one.
    pub chain_len: u32,
    pub sent_token: Option<&'a str>,
}

/// Bearer token shared by every outbound call, refreshed on demand.
///
/// Refreshes are single-flight: callers rejected with the same stale token
/// queue on one lock and all but the first reuse the outcome of its attempt,
/// the fetched token or the failure.
pub struct CredentialGate {
    token: RwLock<Option<String>>,
    refresher: Arc<dyn TokenRefresher>,
    // Failure of the latest attempt, `None` after a success.
    refresh_lock: Mutex<Option<String>>,
    attempts: AtomicU64,
    refresh_timeout: Duration,
    max_chain: u32,
    refreshes: AtomicU64,
}

impl CredentialGate {
    pub fn new(
        initial_token: Option<String>,
        refresher: Arc<dyn TokenRefresher>,
        refresh_timeout: Duration,
        max_chain: u32,
    ) -> Self {
        Self {
            token: RwLock::new(initial_token),
            refresher,
            refresh_lock: Mutex::new(None),
            attempts: AtomicU64::new(0),
            refresh_timeout,
            max_chain,
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn current_token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Decides whether a rejected request may be replayed, returning the
    /// token to replay with. `None` means the original failure stands.
    pub async fn authenticate(&self, rejection: Rejection<'_>) -> Option<String> {
        if rejection.skip_auth {
            debug!("auth: request opted out of authentication, not refreshing");
            return None;
        }
        if rejection.chain_len >= self.max_chain {
            warn!(
                chain_len = rejection.chain_len,
                max_chain = self.max_chain,
                "auth: giving up after repeated unauthorized responses"
            );
            return None;
        }
        match self.refresh_after_rejection(rejection.sent_token).await {
            Ok(token) => Some(token),
            Err(err) => {
                warn!(error = %err, "auth: token refresh failed");
                None
            }
        }
    }

    /// Blocking bridge for callers on threads outside the runtime's workers.
    /// Waits at most the refresh timeout.
    pub fn authenticate_blocking(
        &self,
        handle: &Handle,
        rejection: Rejection<'_>,
    ) -> Option<String> {
        handle.block_on(self.authenticate(rejection))
    }

    pub async fn refresh_after_rejection(
        &self,
        rejected_token: Option<&str>,
    ) -> Result<String, RefreshError> {
        let attempts_seen = self.attempts.load(Ordering::Acquire);
        let mut last_failure = self.refresh_lock.lock().await;

        if let Some(current) = self.current_token() {
            if rejected_token != Some(current.as_str()) {
                debug!("auth: token already refreshed by a concurrent request");
                return Ok(current);
            }
        }
        if self.attempts.load(Ordering::Acquire) != attempts_seen {
            if let Some(reason) = last_failure.as_ref() {
                debug!("auth: refresh this request waited on failed, not retrying");
                return Err(RefreshError::Concurrent(reason.clone()));
            }
        }

        let outcome = match tokio::time::timeout(self.refresh_timeout, self.refresher.refresh())
            .await
        {
            Ok(Ok(token)) => Ok(token),
            Ok(Err(err)) => Err(RefreshError::Failed(err)),
            Err(_) => Err(RefreshError::TimedOut(self.refresh_timeout)),
        };
        self.attempts.fetch_add(1, Ordering::Release);

        match outcome {
            Ok(token) => {
                *last_failure = None;
                self.refreshes.fetch_add(1, Ordering::Relaxed);
                self.set_token(Some(token.clone()));
                info!("auth: access token refreshed");
                Ok(token)
            }
            Err(err) => {
                *last_failure = Some(err.to_string());
                Err(err)
            }
        }
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

pub struct HttpTokenRefresher {
    http: Client,
    endpoint: Url,
    refresh_token: RwLock<Option<String>>,
}

impl HttpTokenRefresher {
    pub fn new(http: Client, base: &Url, refresh_token: Option<String>) -> Result<Self> {
        let endpoint = base
            .join("auth/refresh")
            .context("failed to build refresh url")?;
        Ok(Self {
            http,
            endpoint,
            refresh_token: RwLock::new(refresh_token),
        })
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.refresh_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self) -> Result<String> {
        let refresh_token = self
            .refresh_token()
            .ok_or_else(|| anyhow!("no refresh token stored"))?;
        let response: RefreshResponse = self
            .http
            .post(self.endpoint.clone())
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("invalid refresh response")?;
        if let Some(rotated) = response.refresh_token {
            *self
                .refresh_token
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(rotated);
        }
        Ok(response.access_token)
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
