use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use shared::domain::{
    split_composite_id, EntityKind, MessageStatus, MutationRecord, MutationStatus, OperationKind,
};
use storage::{LocalCache, MutationQueue};
use tracing::{debug, error, info, warn};

use crate::{
    api::RemoteApi,
    config::RetryPolicy,
    error::DispatchError,
    rollback::{apply_rollback, plan_rollback},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Success,
    RetryRequested,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub examined: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Records that ran out of retries this pass, also counted in `failed`.
    pub exhausted: usize,
    pub recovered: u64,
    /// Shortest backoff among records left pending.
    pub next_retry_in: Option<Duration>,
}

impl PassReport {
    pub fn outcome(&self) -> PassOutcome {
        if self.retried > 0 || self.exhausted > 0 {
            PassOutcome::RetryRequested
        } else {
            PassOutcome::Success
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Completed,
    Retry(Duration),
    Failed,
    Exhausted,
}

pub struct SyncWorker {
    queue: Arc<dyn MutationQueue>,
    cache: Arc<dyn LocalCache>,
    remote: Arc<dyn RemoteApi>,
    policy: RetryPolicy,
}

impl SyncWorker {
    pub fn new(
        queue: Arc<dyn MutationQueue>,
        cache: Arc<dyn LocalCache>,
        remote: Arc<dyn RemoteApi>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            cache,
            remote,
            policy,
        }
    }

    /// Runs one pass over every pending record, oldest first, one at a time.
    ///
    /// Only queue I/O errors abort the pass; delivery failures are recorded
    /// on the records themselves.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let stale_after = chrono::Duration::from_std(self.policy.stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let recovered = self.queue.reset_stale(Utc::now() - stale_after).await?;
        if recovered > 0 {
            warn!(recovered, "sync: returned abandoned in-progress mutations to pending");
        }

        let records = self.queue.pending_records().await?;
        let mut report = PassReport {
            examined: records.len(),
            recovered,
            ..PassReport::default()
        };
        if records.is_empty() {
            debug!("sync: queue empty");
            return Ok(report);
        }

        for record in &records {
            match self.process(record).await? {
                RecordOutcome::Completed => report.completed += 1,
                RecordOutcome::Failed => report.failed += 1,
                RecordOutcome::Exhausted => {
                    report.failed += 1;
                    report.exhausted += 1;
                }
                RecordOutcome::Retry(delay) => {
                    report.retried += 1;
                    report.next_retry_in = Some(
                        report
                            .next_retry_in
                            .map_or(delay, |current| current.min(delay)),
                    );
                }
            }
        }

        info!(
            examined = report.examined,
            completed = report.completed,
            retried = report.retried,
            failed = report.failed,
            exhausted = report.exhausted,
            "sync: pass finished"
        );
        Ok(report)
    }

    async fn process(&self, record: &MutationRecord) -> Result<RecordOutcome> {
        self.queue
            .update_status(record.id, MutationStatus::InProgress)
            .await?;

        let err = match self.dispatch(record).await {
            Ok(()) => {
                self.queue
                    .update_status(record.id, MutationStatus::Completed)
                    .await?;
                self.after_delivery(record).await;
                debug!(
                    mutation_id = record.id.0,
                    entity_type = %record.entity_type,
                    "sync: mutation delivered"
                );
                return Ok(RecordOutcome::Completed);
            }
            Err(err) => err,
        };

        if err.is_permanent() {
            if err.is_conflict() {
                warn!(
                    mutation_id = record.id.0,
                    entity_type = %record.entity_type,
                    entity_id = %record.entity_id,
                    "sync: server rejected mutation as conflicting, keeping server state"
                );
            } else {
                warn!(
                    mutation_id = record.id.0,
                    entity_type = %record.entity_type,
                    error = %err,
                    "sync: mutation can never be delivered"
                );
            }
            self.queue
                .update_status(record.id, MutationStatus::Failed)
                .await?;
            self.rollback(record).await;
            return Ok(RecordOutcome::Failed);
        }

        let attempts = record.retry_count.saturating_add(1);
        if attempts >= self.policy.max_retries {
            error!(
                mutation_id = record.id.0,
                entity_type = %record.entity_type,
                attempts,
                error = %err,
                "sync: mutation failed permanently after retries"
            );
            self.queue
                .update_retry(record.id, attempts, MutationStatus::Failed)
                .await?;
            self.rollback(record).await;
            return Ok(RecordOutcome::Exhausted);
        }

        let delay = self.policy.backoff_for(record.retry_count);
        warn!(
            mutation_id = record.id.0,
            entity_type = %record.entity_type,
            attempts,
            backoff_ms = delay.as_millis() as u64,
            error = %err,
            "sync: delivery failed, will retry"
        );
        self.queue
            .update_retry(record.id, attempts, MutationStatus::Pending)
            .await?;
        Ok(RecordOutcome::Retry(delay))
    }

    async fn dispatch(&self, record: &MutationRecord) -> Result<(), DispatchError> {
        let remote = self.remote.as_ref();
        match (&record.entity_type, record.operation) {
            (EntityKind::Follow, operation) => {
                let (_, following_id) = composite_key(record)?;
                match operation {
                    OperationKind::Create => remote.follow_user(following_id).await,
                    OperationKind::Delete => remote.unfollow_user(following_id).await,
                    OperationKind::Update => Err(unsupported(record)),
                }
            }
            (EntityKind::Like, operation) => {
                let (_, post_id) = composite_key(record)?;
                match operation {
                    OperationKind::Create => remote.like_post(post_id).await,
                    OperationKind::Delete => remote.unlike_post(post_id).await,
                    OperationKind::Update => Err(unsupported(record)),
                }
            }
            (EntityKind::NotificationRead, _) => {
                remote.mark_notification_read(&record.entity_id).await
            }
            (EntityKind::NotificationReadAll, _) => remote.mark_all_notifications_read().await,
            (EntityKind::ChallengeJoin, _) => remote.join_challenge(&record.entity_id).await,
            (EntityKind::ChatMessage, OperationKind::Create) => {
                let body = payload_json(record)?;
                let chat_id = body
                    .get("chat_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        DispatchError::Invalid(format!(
                            "chat message {} payload has no chat_id",
                            record.entity_id
                        ))
                    })?
                    .to_string();
                remote.send_chat_message(&chat_id, &body).await
            }
            (kind, OperationKind::Create) => {
                remote
                    .create(&kind.resource_path(), &payload_json(record)?)
                    .await
            }
            (kind, OperationKind::Update) => {
                remote
                    .update(
                        &kind.resource_path(),
                        &record.entity_id,
                        &payload_json(record)?,
                    )
                    .await
            }
            (kind, OperationKind::Delete) => {
                remote
                    .delete(&kind.resource_path(), &record.entity_id)
                    .await
            }
        }
    }

    async fn after_delivery(&self, record: &MutationRecord) {
        if record.entity_type != EntityKind::ChatMessage || record.operation != OperationKind::Create
        {
            return;
        }
        if let Err(err) = self
            .cache
            .set_message_status(&record.entity_id, MessageStatus::Sent)
            .await
        {
            warn!(
                message_id = %record.entity_id,
                error = %err,
                "sync: failed to mark delivered message as sent"
            );
        }
    }

    async fn rollback(&self, record: &MutationRecord) {
        let Some(action) = plan_rollback(record) else {
            debug!(
                mutation_id = record.id.0,
                entity_type = %record.entity_type,
                operation = %record.operation,
                "sync: no local rollback for mutation"
            );
            return;
        };
        match apply_rollback(self.cache.as_ref(), &action).await {
            Ok(()) => info!(
                mutation_id = record.id.0,
                ?action,
                "sync: rolled back optimistic write"
            ),
            Err(err) => error!(
                mutation_id = record.id.0,
                ?action,
                error = %err,
                "sync: rollback failed, local row left as is"
            ),
        }
    }
}

fn composite_key(record: &MutationRecord) -> Result<(&str, &str), DispatchError> {
    split_composite_id(&record.entity_id).ok_or_else(|| {
        DispatchError::Invalid(format!(
            "{} id '{}' is not a two-part key",
            record.entity_type, record.entity_id
        ))
    })
}

fn payload_json(record: &MutationRecord) -> Result<Value, DispatchError> {
    serde_json::from_str(&record.payload).map_err(|err| {
        DispatchError::Invalid(format!(
            "payload of mutation {} is not JSON: {err}",
            record.id
        ))
    })
}

fn unsupported(record: &MutationRecord) -> DispatchError {
    DispatchError::Unsupported {
        entity_type: record.entity_type.to_string(),
        operation: record.operation.to_string(),
    }
}

#[cfg(test)]
#[path = "tests/worker_tests.rs"]
mod tests;
