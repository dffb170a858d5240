use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;
use storage::{LocalCache, MutationQueue, Storage};
use tracing::info;

pub mod api;
pub mod auth;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod realtime;
pub mod rollback;
pub mod scheduler;
pub mod worker;

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

pub use api::{ApiClient, RemoteApi};
pub use auth::{CredentialGate, HttpTokenRefresher, Rejection, TokenRefresher};
pub use crate::config::{ReconnectPolicy, RetryPolicy, SyncSettings};
pub use coordinator::SyncCoordinator;
pub use error::{DispatchError, RealtimeError};
pub use realtime::{ConnectionState, RealtimeChannel};
pub use rollback::{apply_rollback, plan_rollback, RollbackAction};
pub use scheduler::{
    AssumeSatisfied, ConstraintProbe, Constraints, Job, TaskResult, TaskScheduler, TokioScheduler,
};
pub use worker::{PassOutcome, PassReport, SyncWorker};

pub struct SyncEngine {
    pub storage: Storage,
    pub gate: Arc<CredentialGate>,
    pub worker: Arc<SyncWorker>,
    pub coordinator: Arc<SyncCoordinator>,
    pub realtime: Arc<RealtimeChannel>,
}

impl SyncEngine {
    pub fn build(
        settings: &SyncSettings,
        storage: Storage,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Result<Self> {
        let base = settings.base_url()?;
        let http = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .context("failed to build http client")?;
        let refresher =
            HttpTokenRefresher::new(http.clone(), &base, settings.refresh_token.clone())?;
        let gate = Arc::new(CredentialGate::new(
            settings.access_token.clone(),
            Arc::new(refresher),
            settings.refresh_timeout(),
            settings.max_auth_chain,
        ));

        let queue: Arc<dyn MutationQueue> = Arc::new(storage.clone());
        let cache: Arc<dyn LocalCache> = Arc::new(storage.clone());
        let remote: Arc<dyn RemoteApi> =
            Arc::new(ApiClient::new(http, base.clone(), Arc::clone(&gate)));
        let worker = Arc::new(SyncWorker::new(
            Arc::clone(&queue),
            Arc::clone(&cache),
            remote,
            settings.retry_policy(),
        ));
        let coordinator = SyncCoordinator::new(
            Arc::clone(&worker),
            queue,
            scheduler,
            settings.sync_interval(),
            settings.archive_retention(),
        );
        let realtime = RealtimeChannel::new(
            crate::config::ws_url(&base)?,
            Arc::clone(&gate),
            cache,
            settings.reconnect_policy(),
        );

        Ok(Self {
            storage,
            gate,
            worker,
            coordinator,
            realtime,
        })
    }

    /// Schedules periodic sync and archival, requests a first pass and opens
    /// the realtime channel when credentials are available.
    pub async fn start(&self, user_id: Option<String>) -> Result<()> {
        self.coordinator.schedule_periodic_sync();
        self.coordinator.schedule_archival();
        self.coordinator.request_immediate_sync();
        self.realtime.set_user_id(user_id).await;
        match self.realtime.connect().await {
            Ok(()) => {}
            Err(RealtimeError::MissingCredentials) => {
                info!("engine: no access token yet, realtime channel left disconnected");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.coordinator.cancel_periodic_sync();
        self.realtime.close().await;
    }
}
