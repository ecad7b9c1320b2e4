//! End-to-end tests for collab-client.
//!
//! Runs real sessions against an in-process relay that behaves like the
//! production one: it fans frames out to the other sockets of the same
//! document and announces joins and leaves. Durable saves go to an
//! `InMemoryStore` so tests can count and fail them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use collab_client::{SessionConfig, SessionHandle, SessionStatus};
use collab_core::{
    BackupStorage, BoardDocument, Cadence, ConnectionState, Document, DocumentId, InMemoryStorage,
    InMemoryStore, Node, NoteDocument, NoteOp, OfflinePolicy, ReconnectConfig, SessionEvent,
    SessionIdentity,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Test relay
// ============================================================================

struct Peer {
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct RelayState {
    peers: Mutex<HashMap<u64, Peer>>,
    /// Every text frame received from any client, in arrival order.
    frames: Mutex<Vec<String>>,
    /// Request URIs of accepted sockets.
    uris: Mutex<Vec<String>>,
    /// Close codes received from clients.
    close_codes: Mutex<Vec<Option<u16>>>,
    echo_to_sender: AtomicBool,
    /// Drop incoming TCP connections before the handshake.
    refuse: AtomicBool,
    next_id: AtomicU64,
    accepted: AtomicUsize,
}

impl RelayState {
    fn send_to_others(&self, from: u64, frame: &str, include_sender: bool) {
        for (id, peer) in self.peers.lock().unwrap().iter() {
            if *id != from || include_sender {
                let _ = peer.tx.send(Message::Text(frame.to_string().into()));
            }
        }
    }
}

struct Relay {
    addr: SocketAddr,
    state: Arc<RelayState>,
    _accept_task: JoinHandle<()>,
}

impl Relay {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(RelayState::default());

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if accept_state.refuse.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }
                tokio::spawn(serve(stream, Arc::clone(&accept_state)));
            }
        });

        Self {
            addr,
            state,
            _accept_task: accept_task,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Push a frame to every connected client.
    fn inject(&self, frame: Value) {
        self.state.send_to_others(u64::MAX, &frame.to_string(), true);
    }

    /// Hang up on every client.
    fn drop_all(&self) {
        self.state.peers.lock().unwrap().clear();
    }

    fn refuse(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    fn echo_to_sender(&self, echo: bool) {
        self.state.echo_to_sender.store(echo, Ordering::SeqCst);
    }

    fn peer_count(&self) -> usize {
        self.state.peers.lock().unwrap().len()
    }

    fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    fn frames(&self) -> Vec<String> {
        self.state.frames.lock().unwrap().clone()
    }

    fn uris(&self) -> Vec<String> {
        self.state.uris.lock().unwrap().clone()
    }

    fn close_codes(&self) -> Vec<Option<u16>> {
        self.state.close_codes.lock().unwrap().clone()
    }
}

async fn serve(stream: TcpStream, state: Arc<RelayState>) {
    let uri = Arc::new(Mutex::new(String::new()));
    let captured = Arc::clone(&uri);
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        *captured.lock().unwrap() = request.uri().to_string();
        Ok(response)
    };
    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(_) => return,
    };

    let uri = uri.lock().unwrap().clone();
    let query = reqwest::Url::parse(&format!("ws://relay{}", uri)).unwrap();
    let param = |name: &str| {
        query
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.to_string())
            .unwrap_or_default()
    };
    let user_id = param("user_id");
    let username = param("username");
    state.uris.lock().unwrap().push(uri);

    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let id = state.next_id.fetch_add(1, Ordering::SeqCst);

    let online = {
        let mut peers = state.peers.lock().unwrap();
        peers.insert(id, Peer { tx });
        peers.len()
    };
    state.accepted.fetch_add(1, Ordering::SeqCst);
    let joined = json!({"type": "user_joined", "user_id": user_id, "username": username, "online": online});
    state.send_to_others(id, &joined.to_string(), false);

    // Writer ends (and closes the socket) once the peer is removed from the map.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                return;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                let text = text.to_string();
                state.frames.lock().unwrap().push(text.clone());
                let echo = state.echo_to_sender.load(Ordering::SeqCst);
                state.send_to_others(id, &text, echo);
            }
            Message::Close(frame) => {
                state
                    .close_codes
                    .lock()
                    .unwrap()
                    .push(frame.map(|f| u16::from(f.code)));
                break;
            }
            _ => {}
        }
    }

    let removed = state.peers.lock().unwrap().remove(&id).is_some();
    writer.abort();
    if removed {
        let online = state.peers.lock().unwrap().len();
        let left = json!({"type": "user_left", "user_id": user_id, "online": online});
        state.send_to_others(id, &left.to_string(), false);
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn fast_config() -> SessionConfig {
    SessionConfig {
        cadence: None,
        reconnect: ReconnectConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_attempts: 5,
        },
        backup_interval: Duration::ZERO,
        ..Default::default()
    }
}

fn note_config() -> SessionConfig {
    SessionConfig {
        cadence: Some(Cadence {
            broadcast: Duration::from_millis(20),
            save: Duration::from_millis(100),
        }),
        ..fast_config()
    }
}

fn board_config() -> SessionConfig {
    SessionConfig {
        cadence: Some(Cadence {
            broadcast: Duration::ZERO,
            save: Duration::from_millis(100),
        }),
        ..fast_config()
    }
}

async fn open<D: Document>(
    relay: &Relay,
    store: &Arc<InMemoryStore<D>>,
    id: &str,
    user_id: u64,
    username: &str,
    config: SessionConfig,
) -> SessionHandle<D> {
    SessionHandle::open(
        &relay.url(),
        DocumentId::from(id),
        SessionIdentity::new(user_id, username),
        store.clone(),
        Arc::new(InMemoryStorage::new()),
        config,
    )
    .await
    .expect("Failed to open session")
}

async fn wait_status<D: Document>(
    session: &SessionHandle<D>,
    what: &str,
    predicate: impl FnMut(&SessionStatus) -> bool,
) -> SessionStatus {
    let mut rx = session.watch_status();
    let status = timeout(TIMEOUT, rx.wait_for(predicate))
        .await
        .unwrap_or_else(|_| panic!("Timed out waiting for {}", what))
        .expect("Session ended");
    status.clone()
}

async fn wait_connected<D: Document>(session: &SessionHandle<D>) {
    wait_status(session, "connection", |s| s.connection == ConnectionState::Connected).await;
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Timed out waiting for {}", what));
}

async fn wait_for_document<D: Document>(
    session: &SessionHandle<D>,
    what: &str,
    mut predicate: impl FnMut(&D) -> bool,
) -> D {
    timeout(TIMEOUT, async {
        loop {
            let document = session.document().await.unwrap();
            if predicate(&document) {
                return document;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Timed out waiting for {}", what))
}

/// Record every event a session emits.
fn record<D: Document>(session: &SessionHandle<D>) -> (Arc<Mutex<Vec<SessionEvent<D>>>>, collab_core::Subscription) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let subscription = session.subscribe(move |event| sink.lock().unwrap().push(event));
    (events, subscription)
}

fn note_store() -> Arc<InMemoryStore<NoteDocument>> {
    Arc::new(InMemoryStore::with_document("1", NoteDocument::new("Shared", "")))
}

fn content_frames(relay: &Relay) -> Vec<Value> {
    relay
        .frames()
        .iter()
        .filter_map(|f| serde_json::from_str::<Value>(f).ok())
        .filter(|f| f["type"] == "content_change")
        .collect()
}

// ============================================================================
// Propagation between peers
// ============================================================================

#[tokio::test]
async fn test_note_edit_reaches_peer() {
    let relay = Relay::start().await;
    let store = note_store();
    let ana = open(&relay, &store, "1", 1, "ana", note_config()).await;
    let bob = open(&relay, &store, "1", 2, "bob", note_config()).await;
    wait_connected(&ana).await;
    wait_connected(&bob).await;
    wait_until("both sockets", || relay.peer_count() == 2).await;

    let (events, _sub) = record(&bob);
    ana.edit_content("hello").unwrap();

    let note = wait_for_document(&bob, "bob to see the edit", |n| n.content == "hello").await;
    assert_eq!(note.title, "Shared");

    let remote = events
        .lock()
        .unwrap()
        .iter()
        .find_map(|e| match e {
            SessionEvent::RemoteOperation(op) => Some(op.clone()),
            _ => None,
        })
        .expect("Expected a remote operation event");
    assert_eq!(remote.username.as_deref(), Some("ana"));
    assert_eq!(
        remote.op,
        NoteOp::ContentChange {
            content: "hello".into()
        }
    );

    // Bob must not bounce the value he just received.
    sleep(Duration::from_millis(100)).await;
    let frames = content_frames(&relay);
    assert_eq!(frames.len(), 1, "Expected exactly one content frame: {:?}", frames);
    assert_eq!(frames[0]["user_id"], json!(1));
    assert_eq!(frames[0]["username"], json!("ana"));
}

#[tokio::test]
async fn test_socket_url_carries_identity() {
    let relay = Relay::start().await;
    let store = note_store();
    let session = open(&relay, &store, "1", 42, "carol", note_config()).await;
    wait_connected(&session).await;

    let uris = relay.uris();
    assert_eq!(uris, vec!["/ws/notes/1?user_id=42&username=carol".to_string()]);
}

#[tokio::test]
async fn test_typing_burst_is_coalesced() {
    let relay = Relay::start().await;
    let store = note_store();
    let session = open(&relay, &store, "1", 1, "ana", note_config()).await;
    wait_connected(&session).await;

    for text in ["h", "he", "hel", "hell", "hello"] {
        session.edit_content(text).unwrap();
    }

    wait_until("a content frame", || !content_frames(&relay).is_empty()).await;
    sleep(Duration::from_millis(100)).await;
    let frames = content_frames(&relay);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["content"], json!("hello"));
}

#[tokio::test]
async fn test_cursor_moves_are_sent_immediately() {
    let relay = Relay::start().await;
    let store = note_store();
    let session = open(
        &relay,
        &store,
        "1",
        1,
        "ana",
        SessionConfig {
            // Long broadcast window: only non-coalescing ops can arrive in time.
            cadence: Some(Cadence {
                broadcast: Duration::from_secs(10),
                save: Duration::from_secs(10),
            }),
            ..fast_config()
        },
    )
    .await;
    wait_connected(&session).await;

    session.move_cursor(7).unwrap();
    wait_until("cursor frame", || {
        relay.frames().iter().any(|f| f.contains("cursor_position"))
    })
    .await;
}

// ============================================================================
// Echo suppression and inbound frames
// ============================================================================

#[tokio::test]
async fn test_own_echo_is_ignored() {
    let relay = Relay::start().await;
    relay.echo_to_sender(true);
    let store = note_store();
    let session = open(&relay, &store, "1", 7, "ana", note_config()).await;
    wait_connected(&session).await;
    let (events, _sub) = record(&session);

    relay.inject(json!({"type": "content_change", "content": "spoofed", "user_id": 7, "username": "ana"}));
    relay.inject(json!({"type": "content_change", "content": "from bob", "user_id": 8, "username": "bob"}));

    wait_for_document(&session, "peer edit", |n| n.content == "from bob").await;
    let seen: Vec<String> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            SessionEvent::RemoteOperation(op) => match &op.op {
                NoteOp::ContentChange { content } => Some(content.clone()),
                _ => None,
            },
            _ => None,
        })
        .collect();
    assert_eq!(seen, vec!["from bob".to_string()]);
}

#[tokio::test]
async fn test_malformed_frames_are_skipped() {
    let relay = Relay::start().await;
    let store = note_store();
    let session = open(&relay, &store, "1", 1, "ana", note_config()).await;
    wait_connected(&session).await;

    relay.inject(json!("not an object"));
    relay.inject(json!({"content": "no type"}));
    relay.inject(json!({"type": "mystery"}));
    relay.inject(json!({"type": "content_change", "content": "still alive", "user_id": 2}));

    wait_for_document(&session, "edit after garbage", |n| n.content == "still alive").await;
    assert_eq!(session.status().connection, ConnectionState::Connected);
}

#[tokio::test]
async fn test_board_state_frame_replaces_document() {
    let relay = Relay::start().await;
    let mut initial = BoardDocument::default();
    initial.nodes.push(Node::new("old", "text", 0.0, 0.0));
    let store = Arc::new(InMemoryStore::with_document("b1", initial));
    let session = open(&relay, &store, "b1", 1, "ana", board_config()).await;
    wait_connected(&session).await;
    assert!(session.document().await.unwrap().node("old").is_some());

    relay.inject(json!({
        "type": "state",
        "nodes": [{"id": "n1", "type": "note", "x": 10, "y": 20}],
        "edges": [],
        "online": 3
    }));

    let board = wait_for_document(&session, "state replace", |b| b.node("n1").is_some()).await;
    assert!(board.node("old").is_none());
    assert_eq!(board.nodes.len(), 1);
    wait_status(&session, "online count", |s| s.presence.online == 3).await;
}

#[tokio::test]
async fn test_version_notice_is_surfaced() {
    let relay = Relay::start().await;
    let store = note_store();
    let session = open(&relay, &store, "1", 1, "ana", note_config()).await;
    wait_connected(&session).await;
    let (events, _sub) = record(&session);

    relay.inject(json!({"type": "version_created", "username": "bob", "version_number": 4}));
    wait_until("notice", || {
        events.lock().unwrap().iter().any(|e| {
            matches!(e, SessionEvent::Notice(n) if n.version_number == Some(4) && n.username.as_deref() == Some("bob"))
        })
    })
    .await;
    assert_eq!(session.document().await.unwrap().content, "");
}

// ============================================================================
// Presence
// ============================================================================

#[tokio::test]
async fn test_presence_join_and_clear_on_disconnect() {
    let relay = Relay::start().await;
    let store = note_store();
    let ana = open(&relay, &store, "1", 1, "ana", note_config()).await;
    wait_connected(&ana).await;

    let bob = open(&relay, &store, "1", 2, "bob", note_config()).await;
    let status = wait_status(&ana, "bob to join", |s| {
        s.presence.members.iter().any(|m| m.username == "bob")
    })
    .await;
    assert_eq!(status.presence.online, 2);

    bob.close().await.unwrap();
    wait_status(&ana, "bob to leave", |s| s.presence.members.is_empty()).await;

    // Rejoin, then lose the relay: the roster must not outlive the socket.
    let _bob = open(&relay, &store, "1", 2, "bob", note_config()).await;
    wait_status(&ana, "bob to rejoin", |s| !s.presence.members.is_empty()).await;
    relay.refuse(true);
    relay.drop_all();
    let status = wait_status(&ana, "disconnect", |s| s.connection != ConnectionState::Connected).await;
    assert!(status.presence.members.is_empty());
}

#[tokio::test]
async fn test_online_count_clears_on_disconnect() {
    let relay = Relay::start().await;
    let store = Arc::new(InMemoryStore::with_document("b1", BoardDocument::default()));
    let session = open(&relay, &store, "b1", 1, "ana", board_config()).await;
    wait_connected(&session).await;

    // Board relays report only a count, never a member list.
    relay.inject(json!({"type": "state", "nodes": [], "edges": [], "online": 3}));
    wait_status(&session, "online count", |s| s.presence.online == 3).await;
    let (events, _sub) = record(&session);

    relay.refuse(true);
    relay.drop_all();
    wait_until("presence cleared event", || {
        events.lock().unwrap().iter().any(|e| {
            matches!(e, SessionEvent::PresenceChanged(p) if p.online == 0 && p.members.is_empty())
        })
    })
    .await;
}

// ============================================================================
// Reconnection
// ============================================================================

#[tokio::test]
async fn test_reconnects_after_drop() {
    let relay = Relay::start().await;
    let store = note_store();
    let session = open(&relay, &store, "1", 1, "ana", note_config()).await;
    wait_connected(&session).await;
    let (events, _sub) = record(&session);

    relay.drop_all();
    wait_until("second connection", || relay.accepted() == 2).await;
    let status = wait_status(&session, "reconnected", |s| s.connection == ConnectionState::Connected).await;
    assert_eq!(status.attempts, 0);

    let states: Vec<ConnectionState> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ConnectionChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect();
    assert!(states.contains(&ConnectionState::Reconnecting));
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let relay = Relay::start().await;
    let store = note_store();
    let session = open(&relay, &store, "1", 1, "ana", note_config()).await;
    wait_connected(&session).await;
    let (events, _sub) = record(&session);

    relay.refuse(true);
    relay.drop_all();
    let status = wait_status(&session, "give up", |s| {
        s.connection == ConnectionState::Disconnected && s.attempts == 5
    })
    .await;
    assert!(status.presence.members.is_empty());

    // No further attempts once the budget is spent.
    sleep(Duration::from_millis(150)).await;
    assert_eq!(session.status().connection, ConnectionState::Disconnected);

    // Edits made while offline are dropped and reported.
    session.edit_content("lost").unwrap();
    wait_until("drop report", || {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, SessionEvent::OperationDropped))
    })
    .await;

    // An explicit reopen starts over.
    relay.refuse(false);
    session.reconnect().unwrap();
    let status = wait_status(&session, "reopen", |s| s.connection == ConnectionState::Connected).await;
    assert_eq!(status.attempts, 0);
}

#[tokio::test]
async fn test_offline_queue_flushes_on_reconnect() {
    let relay = Relay::start().await;
    let store = note_store();
    let config = SessionConfig {
        offline: OfflinePolicy::Queue { capacity: 8 },
        reconnect: ReconnectConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_attempts: 100,
        },
        ..note_config()
    };
    let session = open(&relay, &store, "1", 1, "ana", config).await;
    wait_connected(&session).await;

    relay.refuse(true);
    relay.drop_all();
    wait_status(&session, "disconnect", |s| s.connection != ConnectionState::Connected).await;

    session.edit_content("written offline").unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(content_frames(&relay).is_empty());

    relay.refuse(false);
    wait_until("queued edit to arrive", || {
        content_frames(&relay)
            .iter()
            .any(|f| f["content"] == "written offline")
    })
    .await;
}

#[tokio::test]
async fn test_offline_queue_keeps_frames_that_fail_to_send() {
    let relay = Relay::start().await;
    let store = note_store();
    let config = SessionConfig {
        offline: OfflinePolicy::Queue { capacity: 64 },
        reconnect: ReconnectConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_attempts: 100,
        },
        ..note_config()
    };
    let session = open(&relay, &store, "1", 1, "ana", config).await;
    wait_connected(&session).await;
    let (events, _sub) = record(&session);

    // Cursor moves go out immediately, so some of them hit the socket after
    // the relay hung up but before the session noticed the close.
    relay.drop_all();
    for position in 0..40 {
        session.move_cursor(position).unwrap();
        sleep(Duration::from_millis(1)).await;
    }

    wait_until("every cursor frame to arrive", || {
        let frames = relay.frames();
        (0..40).all(|position| {
            frames.iter().any(|f| {
                serde_json::from_str::<Value>(f)
                    .map(|v| v["type"] == "cursor_position" && v["position"] == position)
                    .unwrap_or(false)
            })
        })
    })
    .await;
    assert!(!events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, SessionEvent::OperationDropped)));
}

// ============================================================================
// Durable saves
// ============================================================================

#[tokio::test]
async fn test_many_edits_one_save() {
    let relay = Relay::start().await;
    let store = note_store();
    let session = open(&relay, &store, "1", 1, "ana", note_config()).await;

    for i in 0..10 {
        session.edit_content(format!("draft {}", i)).unwrap();
    }
    assert!(
        wait_status(&session, "unsaved", |s| s.has_unsaved_changes)
            .await
            .has_unsaved_changes
    );

    wait_until("save", || store.save_count() == 1).await;
    wait_status(&session, "saved", |s| !s.has_unsaved_changes).await;
    sleep(Duration::from_millis(250)).await;

    assert_eq!(store.save_count(), 1);
    let saved = store.get(&DocumentId::from("1")).unwrap();
    assert_eq!(saved.content, "draft 9");
    assert_eq!(saved.title, "Shared");
}

#[tokio::test]
async fn test_failed_save_keeps_changes_and_retries() {
    let relay = Relay::start().await;
    let store = note_store();
    store.set_fail_saves(true);
    let session = open(&relay, &store, "1", 1, "ana", note_config()).await;
    let (events, _sub) = record(&session);

    session.edit_content("important").unwrap();
    wait_until("failed save", || store.save_count() >= 1).await;
    wait_until("failure event", || {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, SessionEvent::SaveFailed { .. }))
    })
    .await;
    assert!(session.status().has_unsaved_changes);
    assert_eq!(session.document().await.unwrap().content, "important");

    store.set_fail_saves(false);
    wait_status(&session, "retry to succeed", |s| !s.has_unsaved_changes).await;
    assert_eq!(store.get(&DocumentId::from("1")).unwrap().content, "important");
    assert!(store.save_count() >= 2);
}

#[tokio::test]
async fn test_force_save_and_cancel() {
    let relay = Relay::start().await;
    let store = note_store();
    let config = SessionConfig {
        cadence: Some(Cadence {
            broadcast: Duration::from_millis(20),
            save: Duration::from_secs(10),
        }),
        ..fast_config()
    };
    let session = open(&relay, &store, "1", 1, "ana", config).await;

    session.rename("Renamed").unwrap();
    session.force_save().await.unwrap();
    assert_eq!(store.save_count(), 1);
    assert_eq!(store.get(&DocumentId::from("1")).unwrap().title, "Renamed");
    assert!(!session.status().has_unsaved_changes);

    // Nothing pending: force_save is a no-op.
    session.force_save().await.unwrap();
    assert_eq!(store.save_count(), 1);

    session.edit_content("discard me").unwrap();
    wait_status(&session, "unsaved", |s| s.has_unsaved_changes).await;
    session.cancel_auto_save().unwrap();
    wait_status(&session, "cancelled", |s| !s.has_unsaved_changes).await;
    session.close().await.unwrap();
    assert_eq!(store.save_count(), 1);
}

#[tokio::test]
async fn test_close_saves_pending_changes() {
    let relay = Relay::start().await;
    let store = note_store();
    let config = SessionConfig {
        cadence: Some(Cadence {
            broadcast: Duration::from_millis(20),
            save: Duration::from_secs(10),
        }),
        ..fast_config()
    };
    let session = open(&relay, &store, "1", 1, "ana", config).await;
    wait_connected(&session).await;

    session.edit_content("last words").unwrap();
    session.close().await.unwrap();

    assert_eq!(store.save_count(), 1);
    assert_eq!(store.get(&DocumentId::from("1")).unwrap().content, "last words");
    wait_until("close frame", || !relay.close_codes().is_empty()).await;
    assert_eq!(relay.close_codes(), vec![Some(1000)]);
    // The pending broadcast went out before the socket closed.
    assert!(content_frames(&relay).iter().any(|f| f["content"] == "last words"));
}

// ============================================================================
// Boards
// ============================================================================

#[tokio::test]
async fn test_board_ops_broadcast_immediately_and_save_together() {
    let relay = Relay::start().await;
    let store = Arc::new(InMemoryStore::with_document("b1", BoardDocument::default()));
    let config = SessionConfig {
        cadence: Some(Cadence {
            broadcast: Duration::ZERO,
            save: Duration::from_millis(150),
        }),
        ..fast_config()
    };
    let ana = open(&relay, &store, "b1", 1, "ana", config.clone()).await;
    let bob = open(&relay, &store, "b1", 2, "bob", config).await;
    wait_connected(&ana).await;
    wait_connected(&bob).await;
    wait_until("both sockets", || relay.peer_count() == 2).await;

    ana.add_node(Node::new("n1", "text", 0.0, 0.0)).unwrap();
    ana.add_node(Node::new("n2", "text", 100.0, 0.0)).unwrap();

    // Peers see the nodes well before the save window closes.
    wait_for_document(&bob, "nodes on bob", |b| b.nodes.len() == 2).await;
    assert_eq!(store.save_count(), 0);

    wait_until("board save", || store.save_count() == 1).await;
    sleep(Duration::from_millis(300)).await;
    assert_eq!(store.save_count(), 1);
    let saved = store.get(&DocumentId::from("b1")).unwrap();
    assert_eq!(saved.nodes.len(), 2);

    ana.delete_node("n1").unwrap();
    wait_for_document(&bob, "delete on bob", |b| b.node("n1").is_none()).await;
}

// ============================================================================
// Local backups
// ============================================================================

#[tokio::test]
async fn test_periodic_local_backups() {
    let relay = Relay::start().await;
    let store = note_store();
    let backups = Arc::new(InMemoryStorage::new());
    let config = SessionConfig {
        backup_interval: Duration::from_millis(30),
        backup_capacity: 3,
        ..note_config()
    };
    // Backups work without a relay connection.
    relay.refuse(true);
    let session = SessionHandle::open(
        &relay.url(),
        DocumentId::from("1"),
        SessionIdentity::new(1u64, "ana"),
        store.clone(),
        backups.clone(),
        config,
    )
    .await
    .unwrap();

    session.edit_content("keep me safe").unwrap();
    let listed = timeout(TIMEOUT, async {
        loop {
            let listed = session.list_backups().await.unwrap();
            if listed.len() == 3 && listed[0].preview.starts_with("keep me safe") {
                return listed;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Timed out waiting for backups");
    assert!(listed[0].timestamp >= listed[1].timestamp);

    let restored = session.restore(0).await.unwrap().unwrap();
    assert_eq!(restored.content, "keep me safe");
    assert!(session.restore(10).await.unwrap().is_none());
    assert!(backups.get("note_1_backup").unwrap().is_some());
}

#[tokio::test]
async fn test_manual_backup_and_clear() {
    let relay = Relay::start().await;
    let store = note_store();
    let session = open(&relay, &store, "1", 1, "ana", note_config()).await;

    session.snapshot().await.unwrap();
    session.edit_content("second").unwrap();
    session.snapshot().await.unwrap();

    let listed = session.list_backups().await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed[0].preview.starts_with("second"));
    assert_eq!(session.restore(1).await.unwrap().unwrap().content, "");

    session.clear_backups().await.unwrap();
    assert!(session.list_backups().await.unwrap().is_empty());
}
