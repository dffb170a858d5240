use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use storage::Storage;

use crate::{
    api::RemoteApi,
    config::RetryPolicy,
    error::DispatchError,
    scheduler::{Constraints, Job, TaskScheduler},
    worker::SyncWorker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Conflict,
    Unavailable,
}

/// Scripted remote that records every call it receives.
pub struct FakeRemote {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    calls: Mutex<Vec<String>>,
}

impl FakeRemote {
    pub fn always(reply: Reply) -> Arc<Self> {
        Self::scripted(Vec::new(), reply)
    }

    pub fn scripted(replies: Vec<Reply>, fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            fallback,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn answer(&self, call: String) -> Result<(), DispatchError> {
        self.calls.lock().unwrap().push(call);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        match reply {
            Reply::Ok => Ok(()),
            Reply::Conflict => Err(DispatchError::Conflict("already exists".into())),
            Reply::Unavailable => Err(DispatchError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "try later".into(),
            }),
        }
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn create(&self, path: &str, _body: &Value) -> Result<(), DispatchError> {
        self.answer(format!("POST {path}"))
    }

    async fn update(&self, path: &str, id: &str, _body: &Value) -> Result<(), DispatchError> {
        self.answer(format!("PUT {path}/{id}"))
    }

    async fn delete(&self, path: &str, id: &str) -> Result<(), DispatchError> {
        self.answer(format!("DELETE {path}/{id}"))
    }

    async fn follow_user(&self, user_id: &str) -> Result<(), DispatchError> {
        self.answer(format!("follow {user_id}"))
    }

    async fn unfollow_user(&self, user_id: &str) -> Result<(), DispatchError> {
        self.answer(format!("unfollow {user_id}"))
    }

    async fn like_post(&self, post_id: &str) -> Result<(), DispatchError> {
        self.answer(format!("like {post_id}"))
    }

    async fn unlike_post(&self, post_id: &str) -> Result<(), DispatchError> {
        self.answer(format!("unlike {post_id}"))
    }

    async fn mark_notification_read(&self, notification_id: &str) -> Result<(), DispatchError> {
        self.answer(format!("read {notification_id}"))
    }

    async fn mark_all_notifications_read(&self) -> Result<(), DispatchError> {
        self.answer("read-all".into())
    }

    async fn join_challenge(&self, challenge_id: &str) -> Result<(), DispatchError> {
        self.answer(format!("join {challenge_id}"))
    }

    async fn send_chat_message(&self, chat_id: &str, _body: &Value) -> Result<(), DispatchError> {
        self.answer(format!("message {chat_id}"))
    }
}

pub async fn memory_storage() -> Storage {
    Storage::new("sqlite::memory:").await.expect("db")
}

pub fn worker_for(storage: &Storage, remote: Arc<FakeRemote>) -> SyncWorker {
    SyncWorker::new(
        Arc::new(storage.clone()),
        Arc::new(storage.clone()),
        remote,
        RetryPolicy::default(),
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub name: String,
    pub constraints: Constraints,
    pub initial_delay: Duration,
    pub interval: Option<Duration>,
    pub replace_existing: bool,
}

/// Scheduler that only records what it was asked to run.
#[derive(Default)]
pub struct RecordingScheduler {
    pub jobs: Mutex<Vec<ScheduledJob>>,
    pub cancelled: Mutex<Vec<String>>,
}

impl RecordingScheduler {
    pub fn jobs(&self) -> Vec<ScheduledJob> {
        self.jobs.lock().unwrap().clone()
    }
}

impl TaskScheduler for RecordingScheduler {
    fn schedule_recurring(&self, job: Job, interval: Duration) -> bool {
        self.jobs.lock().unwrap().push(ScheduledJob {
            name: job.name,
            constraints: job.constraints,
            initial_delay: job.initial_delay,
            interval: Some(interval),
            replace_existing: false,
        });
        true
    }

    fn schedule_once(&self, job: Job, replace_existing: bool) -> bool {
        self.jobs.lock().unwrap().push(ScheduledJob {
            name: job.name,
            constraints: job.constraints,
            initial_delay: job.initial_delay,
            interval: None,
            replace_existing,
        });
        true
    }

    fn cancel(&self, name: &str) -> bool {
        self.cancelled.lock().unwrap().push(name.to_string());
        true
    }

    fn is_scheduled(&self, name: &str) -> bool {
        self.jobs.lock().unwrap().iter().any(|job| job.name == name)
    }
}
