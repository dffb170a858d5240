use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use anyhow::Result;
use chrono::Utc;
use futures::{SinkExt, Stream, StreamExt};
use shared::{
    domain::MessageStatus,
    protocol::{PresenceStatus, ReactionAction, RealtimeEvent},
};
use storage::LocalCache;
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{auth::CredentialGate, config::ReconnectPolicy, error::RealtimeError};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

enum StreamEnd {
    Closed,
    Failed(String),
}

struct ChannelState {
    attempt: u32,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    supervisor: Option<JoinHandle<()>>,
    user_id: Option<String>,
}

/// Push connection that mirrors server events into the local cache and
/// rebroadcasts them to subscribers.
///
/// Reconnects after abnormal closure with capped exponential backoff; after
/// the last allowed attempt fails it stays disconnected until `connect` is
/// called again.
pub struct RealtimeChannel {
    ws_url: Url,
    gate: Arc<CredentialGate>,
    cache: Arc<dyn LocalCache>,
    policy: ReconnectPolicy,
    events: broadcast::Sender<RealtimeEvent>,
    state: watch::Sender<ConnectionState>,
    inner: Mutex<ChannelState>,
    /// Bumped on every connect and close so superseded supervisors go quiet.
    session: StdMutex<u64>,
}

impl RealtimeChannel {
    pub fn new(
        ws_url: Url,
        gate: Arc<CredentialGate>,
        cache: Arc<dyn LocalCache>,
        policy: ReconnectPolicy,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            ws_url,
            gate,
            cache,
            policy,
            events,
            state,
            inner: Mutex::new(ChannelState {
                attempt: 0,
                outbound: None,
                supervisor: None,
                user_id: None,
            }),
            session: StdMutex::new(0),
        })
    }

    pub async fn set_user_id(&self, user_id: Option<String>) {
        self.inner.lock().await.user_id = user_id;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> WatchStream<ConnectionState> {
        WatchStream::new(self.state.subscribe())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.events.subscribe()
    }

    /// Events as a stream; a lagging subscriber skips what it missed.
    pub fn events(&self) -> impl Stream<Item = RealtimeEvent> {
        tokio_stream::StreamExt::filter_map(BroadcastStream::new(self.events.subscribe()), |item| {
            item.ok()
        })
    }

    pub async fn reconnect_attempt(&self) -> u32 {
        self.inner.lock().await.attempt
    }

    pub async fn connect(self: &Arc<Self>) -> Result<(), RealtimeError> {
        let mut inner = self.inner.lock().await;
        if inner
            .supervisor
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return Ok(());
        }
        if self.gate.current_token().is_none() {
            return Err(RealtimeError::MissingCredentials);
        }

        let session = {
            let mut current = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            *current += 1;
            *current
        };
        let channel = Arc::clone(self);
        inner.supervisor = Some(tokio::spawn(async move { channel.supervise(session).await }));
        Ok(())
    }

    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.attempt = 0;
        {
            let mut current = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            *current += 1;
            self.state.send_replace(ConnectionState::Disconnected);
        }
        if let Some(outbound) = inner.outbound.take() {
            let _ = outbound.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "client closing".into(),
            })));
        }
        if let Some(supervisor) = inner.supervisor.take() {
            supervisor.abort();
        }
        info!("realtime: channel closed");
    }

    /// Queues a presence frame. Returns `false` when it was dropped because
    /// the channel is not connected or no user is known.
    pub async fn send_presence(&self, status: PresenceStatus) -> bool {
        let inner = self.inner.lock().await;
        let (Some(user_id), Some(outbound)) = (inner.user_id.clone(), inner.outbound.as_ref())
        else {
            debug!(status = status.as_str(), "realtime: presence dropped, channel not ready");
            return false;
        };
        let frame = match (RealtimeEvent::PresenceUpdate { user_id, status }).encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "realtime: failed to encode presence");
                return false;
            }
        };
        outbound.send(Message::Text(frame)).is_ok()
    }

    fn is_current(&self, session: u64) -> bool {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) == session
    }

    fn set_state(&self, session: u64, state: ConnectionState) -> bool {
        let current = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != session {
            return false;
        }
        self.state.send_replace(state);
        true
    }

    async fn open(&self, token: &str) -> Result<Socket, RealtimeError> {
        let mut request = self.ws_url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
        let (socket, _) = connect_async(request).await?;
        Ok(socket)
    }

    async fn supervise(self: Arc<Self>, session: u64) {
        loop {
            let Some(token) = self.gate.current_token() else {
                warn!("realtime: no access token, staying disconnected");
                self.set_state(session, ConnectionState::Disconnected);
                return;
            };
            if !self.set_state(session, ConnectionState::Connecting) {
                return;
            }

            match self.open(&token).await {
                Ok(socket) => {
                    let (outbound, queued) = mpsc::unbounded_channel::<Message>();
                    {
                        let mut inner = self.inner.lock().await;
                        if !self.is_current(session) {
                            return;
                        }
                        inner.attempt = 0;
                        inner.outbound = Some(outbound);
                    }
                    self.set_state(session, ConnectionState::Connected);
                    info!(url = %self.ws_url, "realtime: connected");
                    match self.pump(session, socket, queued).await {
                        StreamEnd::Closed => {
                            info!("realtime: server closed the connection");
                            self.set_state(session, ConnectionState::Disconnected);
                            return;
                        }
                        StreamEnd::Failed(reason) => {
                            warn!(%reason, "realtime: connection lost");
                        }
                    }
                }
                Err(err) => warn!(error = %err, "realtime: connect failed"),
            }

            let attempt = {
                let mut inner = self.inner.lock().await;
                if !self.is_current(session) {
                    return;
                }
                if inner.attempt >= self.policy.max_attempts {
                    None
                } else {
                    let attempt = inner.attempt;
                    inner.attempt += 1;
                    Some(attempt)
                }
            };
            let Some(attempt) = attempt else {
                warn!(
                    attempts = self.policy.max_attempts,
                    "realtime: giving up reconnecting"
                );
                self.set_state(session, ConnectionState::Disconnected);
                return;
            };

            let delay = self.policy.delay_for(attempt);
            if !self.set_state(session, ConnectionState::Reconnecting) {
                return;
            }
            debug!(attempt, delay_ms = delay.as_millis() as u64, "realtime: reconnect scheduled");
            tokio::time::sleep(delay).await;
        }
    }

    async fn pump(
        &self,
        session: u64,
        socket: Socket,
        mut queued: mpsc::UnboundedReceiver<Message>,
    ) -> StreamEnd {
        let (mut writer, mut reader) = socket.split();
        let writer_task = tokio::spawn(async move {
            while let Some(message) = queued.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = writer.send(message).await {
                    debug!(error = %err, "realtime: write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let end = loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => self.handle_frame(&text).await,
                Some(Ok(Message::Close(frame))) => {
                    let normal = frame
                        .as_ref()
                        .map_or(true, |frame| frame.code == CloseCode::Normal);
                    if normal {
                        break StreamEnd::Closed;
                    }
                    break StreamEnd::Failed(format!("closed abnormally: {frame:?}"));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => break StreamEnd::Failed(err.to_string()),
                None => break StreamEnd::Failed("stream ended".into()),
            }
        };

        {
            let mut inner = self.inner.lock().await;
            if self.is_current(session) {
                inner.outbound = None;
            }
        }
        writer_task.abort();
        end
    }

    async fn handle_frame(&self, text: &str) {
        let event = match RealtimeEvent::decode(text) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "realtime: dropping undecodable frame");
                return;
            }
        };
        if let Err(err) = self.apply(&event).await {
            warn!(kind = event.kind(), error = %err, "realtime: failed to store event");
        }
        let _ = self.events.send(event);
    }

    async fn apply(&self, event: &RealtimeEvent) -> Result<()> {
        match event {
            RealtimeEvent::NewMessage { message } => {
                self.cache
                    .upsert_message(message, MessageStatus::Delivered)
                    .await
            }
            RealtimeEvent::PresenceUpdate { user_id, status } => {
                self.cache
                    .update_presence(user_id, *status, Utc::now())
                    .await
            }
            RealtimeEvent::ReactionChange {
                message_id,
                user_id,
                emoji,
                action: ReactionAction::Add,
            } => self.cache.upsert_reaction(message_id, user_id, emoji).await,
            RealtimeEvent::ReactionChange {
                message_id,
                user_id,
                emoji,
                action: ReactionAction::Remove,
            } => self.cache.remove_reaction(message_id, user_id, emoji).await,
            RealtimeEvent::TypingIndicator { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
