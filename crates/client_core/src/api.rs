use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::{
    auth::{CredentialGate, Rejection},
    error::DispatchError,
};

#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn create(&self, path: &str, body: &Value) -> Result<(), DispatchError>;
    async fn update(&self, path: &str, id: &str, body: &Value) -> Result<(), DispatchError>;
    async fn delete(&self, path: &str, id: &str) -> Result<(), DispatchError>;
    async fn follow_user(&self, user_id: &str) -> Result<(), DispatchError>;
    async fn unfollow_user(&self, user_id: &str) -> Result<(), DispatchError>;
    async fn like_post(&self, post_id: &str) -> Result<(), DispatchError>;
    async fn unlike_post(&self, post_id: &str) -> Result<(), DispatchError>;
    async fn mark_notification_read(&self, notification_id: &str) -> Result<(), DispatchError>;
    async fn mark_all_notifications_read(&self) -> Result<(), DispatchError>;
    async fn join_challenge(&self, challenge_id: &str) -> Result<(), DispatchError>;
    async fn send_chat_message(&self, chat_id: &str, body: &Value) -> Result<(), DispatchError>;
}

pub struct ApiClient {
    http: Client,
    base: Url,
    gate: Arc<CredentialGate>,
}

impl ApiClient {
    pub fn new(http: Client, base: Url, gate: Arc<CredentialGate>) -> Self {
        Self { http, base, gate }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, DispatchError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| DispatchError::Invalid(format!("cannot extend base url {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn execute(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&Value>,
    ) -> Result<(), DispatchError> {
        let url = self.endpoint(segments)?;
        let mut token = self.gate.current_token();
        let mut unauthorized = 0u32;
        loop {
            let mut request = self.http.request(method.clone(), url.clone());
            if let Some(token) = &token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                unauthorized += 1;
                let rejection = Rejection {
                    skip_auth: false,
                    chain_len: unauthorized,
                    sent_token: token.as_deref(),
                };
                let refreshed = self.gate.authenticate(rejection).await;
                if let Some(fresh) = refreshed {
                    debug!(%method, %url, "api: replaying request with refreshed token");
                    token = Some(fresh);
                    continue;
                }
            }
            if !status.is_success() {
                return Err(DispatchError::from_response(response).await);
            }
            return Ok(());
        }
    }
}

#[async_trait]
impl RemoteApi for ApiClient {
    async fn create(&self, path: &str, body: &Value) -> Result<(), DispatchError> {
        self.execute(Method::POST, &[path], Some(body)).await
    }

    async fn update(&self, path: &str, id: &str, body: &Value) -> Result<(), DispatchError> {
        self.execute(Method::PUT, &[path, id], Some(body)).await
    }

    async fn delete(&self, path: &str, id: &str) -> Result<(), DispatchError> {
        self.execute(Method::DELETE, &[path, id], None).await
    }

    async fn follow_user(&self, user_id: &str) -> Result<(), DispatchError> {
        self.execute(Method::POST, &["users", user_id, "follow"], None)
            .await
    }

    async fn unfollow_user(&self, user_id: &str) -> Result<(), DispatchError> {
        self.execute(Method::POST, &["users", user_id, "unfollow"], None)
            .await
    }

    async fn like_post(&self, post_id: &str) -> Result<(), DispatchError> {
        self.execute(Method::POST, &["posts", post_id, "like"], None)
            .await
    }

    async fn unlike_post(&self, post_id: &str) -> Result<(), DispatchError> {
        self.execute(Method::DELETE, &["posts", post_id, "like"], None)
            .await
    }

    async fn mark_notification_read(&self, notification_id: &str) -> Result<(), DispatchError> {
        self.execute(
            Method::POST,
            &["notifications", notification_id, "read"],
            None,
        )
        .await
    }

    async fn mark_all_notifications_read(&self) -> Result<(), DispatchError> {
        self.execute(Method::POST, &["notifications", "read-all"], None)
            .await
    }

    async fn join_challenge(&self, challenge_id: &str) -> Result<(), DispatchError> {
        self.execute(Method::POST, &["challenges", challenge_id, "join"], None)
            .await
    }

    async fn send_chat_message(&self, chat_id: &str, body: &Value) -> Result<(), DispatchError> {
        self.execute(Method::POST, &["chats", chat_id, "messages"], Some(body))
            .await
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
