use super::*;
use crate::{auth::MissingTokenRefresher, test_support::memory_storage};
use axum::{
    extract::{
        ws::{close_code, CloseFrame as WsCloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::Response,
    routing::get,
    Router,
};
use shared::domain::ChatMessage;
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use storage::Storage;
use tokio::net::TcpListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    KeepOpen,
    CloseNormally,
    DropFirstConnection,
}

#[derive(Clone)]
struct WsServer {
    frames: Arc<Vec<String>>,
    mode: Mode,
    connections: Arc<AtomicUsize>,
    bearers: Arc<StdMutex<Vec<Option<String>>>>,
    received: mpsc::UnboundedSender<String>,
}

struct Harness {
    url: Url,
    connections: Arc<AtomicUsize>,
    bearers: Arc<StdMutex<Vec<Option<String>>>>,
    received: mpsc::UnboundedReceiver<String>,
}

impl Harness {
    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn upgrade(
    State(server): State<WsServer>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let bearer = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    server.bearers.lock().unwrap().push(bearer);
    let connection = server.connections.fetch_add(1, Ordering::SeqCst) + 1;
    ws.on_upgrade(move |socket| serve_socket(server, socket, connection))
}

async fn serve_socket(server: WsServer, mut socket: WebSocket, connection: usize) {
    if server.mode == Mode::DropFirstConnection && connection == 1 {
        return;
    }
    for frame in server.frames.iter() {
        if socket.send(WsMessage::Text(frame.clone())).await.is_err() {
            return;
        }
    }
    if server.mode == Mode::CloseNormally {
        let _ = socket
            .send(WsMessage::Close(Some(WsCloseFrame {
                code: close_code::NORMAL,
                reason: "bye".into(),
            })))
            .await;
        return;
    }
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            WsMessage::Text(text) => {
                let _ = server.received.send(text);
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
}

async fn spawn_ws(frames: Vec<String>, mode: Mode) -> Harness {
    let (received_tx, received) = mpsc::unbounded_channel();
    let server = WsServer {
        frames: Arc::new(frames),
        mode,
        connections: Arc::new(AtomicUsize::new(0)),
        bearers: Arc::new(StdMutex::new(Vec::new())),
        received: received_tx,
    };
    let harness_connections = Arc::clone(&server.connections);
    let harness_bearers = Arc::clone(&server.bearers);
    let app = Router::new().route("/ws", get(upgrade)).with_state(server);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    Harness {
        url: Url::parse(&format!("ws://{addr}/ws")).expect("url"),
        connections: harness_connections,
        bearers: harness_bearers,
        received,
    }
}

async fn refused_url() -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    Url::parse(&format!("ws://{addr}/ws")).expect("url")
}

fn quick_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        base: Duration::from_millis(10),
        max: Duration::from_millis(40),
        max_attempts,
    }
}

fn channel_for(
    url: Url,
    storage: &Storage,
    token: Option<&str>,
    policy: ReconnectPolicy,
) -> Arc<RealtimeChannel> {
    let gate = Arc::new(CredentialGate::new(
        token.map(str::to_string),
        Arc::new(MissingTokenRefresher),
        Duration::from_secs(1),
        3,
    ));
    RealtimeChannel::new(url, gate, Arc::new(storage.clone()), policy)
}

async fn wait_for_state(channel: &RealtimeChannel, target: ConnectionState) {
    let mut states = channel.watch_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(state) = states.next().await {
            if state == target {
                return;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("channel never reached {target:?}, now {:?}", channel.state()));
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

fn incoming_message() -> ChatMessage {
    ChatMessage {
        id: "m1".into(),
        chat_id: "c1".into(),
        sender_id: "u2".into(),
        content: "see you at the gym".into(),
        media_url: None,
        sent_at: Utc::now(),
    }
}

#[tokio::test]
async fn server_events_are_stored_then_broadcast() {
    let frames = vec![
        RealtimeEvent::NewMessage {
            message: incoming_message(),
        }
        .encode()
        .expect("frame"),
        RealtimeEvent::PresenceUpdate {
            user_id: "u2".into(),
            status: PresenceStatus::Online,
        }
        .encode()
        .expect("frame"),
        RealtimeEvent::ReactionChange {
            message_id: "m1".into(),
            user_id: "u2".into(),
            emoji: "fire".into(),
            action: ReactionAction::Add,
        }
        .encode()
        .expect("frame"),
        RealtimeEvent::TypingIndicator {
            chat_id: "c1".into(),
            user_id: "u2".into(),
            is_typing: true,
        }
        .encode()
        .expect("frame"),
    ];
    let harness = spawn_ws(frames, Mode::KeepOpen).await;
    let storage = memory_storage().await;
    let channel = channel_for(harness.url.clone(), &storage, Some("t1"), quick_policy(3));
    let mut events = channel.subscribe();
    let mut streamed = Box::pin(channel.events());

    channel.connect().await.expect("connect");
    channel.connect().await.expect("already running");

    let mut kinds = Vec::new();
    for _ in 0..4 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("event");
        kinds.push(event.kind());
    }
    assert_eq!(kinds, vec!["new_message", "presence", "reaction", "typing"]);
    let mut streamed_kinds = Vec::new();
    for _ in 0..4 {
        let event = tokio::time::timeout(Duration::from_secs(5), streamed.next())
            .await
            .expect("streamed in time")
            .expect("stream open");
        streamed_kinds.push(event.kind());
    }
    assert_eq!(streamed_kinds, kinds);
    assert_eq!(channel.state(), ConnectionState::Connected);
    assert_eq!(harness.connections(), 1);
    assert_eq!(
        harness.bearers.lock().unwrap().clone(),
        vec![Some("Bearer t1".to_string())]
    );

    let stored = storage.message("m1").await.expect("load").expect("message");
    assert_eq!(stored.status, MessageStatus::Delivered);
    assert_eq!(stored.message.content, "see you at the gym");
    let presence = storage.presence("u2").await.expect("load").expect("presence");
    assert!(presence.is_online);
    assert_eq!(
        storage.reactions("m1").await.expect("load"),
        vec![("u2".to_string(), "fire".to_string())]
    );

    channel.close().await;
    assert_eq!(channel.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn undecodable_frames_are_dropped_without_disconnecting() {
    let frames = vec![
        r#"{"type":"mystery","payload":1}"#.to_string(),
        "not json at all".to_string(),
        r#"{"type":"presence","user_id":"u2"}"#.to_string(),
    ];
    let harness = spawn_ws(frames, Mode::KeepOpen).await;
    let storage = memory_storage().await;
    let channel = channel_for(harness.url.clone(), &storage, Some("t1"), quick_policy(3));
    let mut events = channel.subscribe();

    channel.connect().await.expect("connect");
    wait_for_state(&channel, ConnectionState::Connected).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(channel.state(), ConnectionState::Connected);
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert!(storage.presence("u2").await.expect("load").is_none());
    assert_eq!(harness.connections(), 1);
    channel.close().await;
}

#[tokio::test]
async fn connecting_without_a_token_fails() {
    let storage = memory_storage().await;
    let channel = channel_for(refused_url().await, &storage, None, quick_policy(3));

    assert!(matches!(
        channel.connect().await,
        Err(RealtimeError::MissingCredentials)
    ));
    assert_eq!(channel.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn presence_frames_reach_the_server_once_connected() {
    let mut harness = spawn_ws(Vec::new(), Mode::KeepOpen).await;
    let storage = memory_storage().await;
    let channel = channel_for(harness.url.clone(), &storage, Some("t1"), quick_policy(3));

    assert!(!channel.send_presence(PresenceStatus::Online).await);

    channel.set_user_id(Some("me".into())).await;
    channel.connect().await.expect("connect");
    wait_for_state(&channel, ConnectionState::Connected).await;
    assert!(channel.send_presence(PresenceStatus::Away).await);

    let frame = tokio::time::timeout(Duration::from_secs(5), harness.received.recv())
        .await
        .expect("frame in time")
        .expect("frame");
    assert_eq!(
        RealtimeEvent::decode(&frame).expect("decode"),
        RealtimeEvent::PresenceUpdate {
            user_id: "me".into(),
            status: PresenceStatus::Away,
        }
    );

    channel.close().await;
    assert!(!channel.send_presence(PresenceStatus::Offline).await);
}

#[tokio::test]
async fn abnormal_drop_reconnects_and_resets_the_attempt_counter() {
    let harness = spawn_ws(Vec::new(), Mode::DropFirstConnection).await;
    let storage = memory_storage().await;
    let channel = channel_for(harness.url.clone(), &storage, Some("t1"), quick_policy(5));

    channel.connect().await.expect("connect");
    eventually(|| harness.connections() >= 2 && channel.state() == ConnectionState::Connected)
        .await;

    assert_eq!(channel.reconnect_attempt().await, 0);
    channel.close().await;
}

#[tokio::test]
async fn normal_server_close_does_not_reconnect() {
    let harness = spawn_ws(Vec::new(), Mode::CloseNormally).await;
    let storage = memory_storage().await;
    let channel = channel_for(harness.url.clone(), &storage, Some("t1"), quick_policy(5));

    channel.connect().await.expect("connect");
    eventually(|| harness.connections() == 1).await;
    wait_for_state(&channel, ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(harness.connections(), 1);
    assert_eq!(channel.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn reconnecting_gives_up_after_the_last_attempt() {
    let storage = memory_storage().await;
    let channel = channel_for(refused_url().await, &storage, Some("t1"), quick_policy(2));

    channel.connect().await.expect("connect");
    for _ in 0..500 {
        if channel.reconnect_attempt().await == 2
            && channel.state() == ConnectionState::Disconnected
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(channel.reconnect_attempt().await, 2);
    assert_eq!(channel.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn close_cancels_a_pending_reconnect() {
    let storage = memory_storage().await;
    let channel = channel_for(
        refused_url().await,
        &storage,
        Some("t1"),
        ReconnectPolicy {
            base: Duration::from_secs(30),
            max: Duration::from_secs(60),
            max_attempts: 5,
        },
    );

    channel.connect().await.expect("connect");
    wait_for_state(&channel, ConnectionState::Reconnecting).await;
    assert_eq!(channel.reconnect_attempt().await, 1);

    channel.close().await;
    assert_eq!(channel.state(), ConnectionState::Disconnected);
    assert_eq!(channel.reconnect_attempt().await, 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(channel.state(), ConnectionState::Disconnected);
}
