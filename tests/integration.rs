//! End-to-end tests over real WebSocket connections.
//!
//! These start a real server and connect real clients, exercising the
//! full join / edit / presence / comment pipeline.

use dashsync::client::{ClientConfig, ClientProfile, CollabClient, EngineEvent};
use dashsync::protocol::{CursorPosition, OperationDraft, OperationType, ServerMessage, Session};
use dashsync::server::{CollabServer, ServerConfig};
use dashsync::sync::SyncOutcome;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};
use tokio_tungstenite::tungstenite::Message;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_server_with(max_participants_per_room: usize) -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_participants_per_room,
        broadcast_capacity: 64,
    };
    let server = CollabServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give the server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn start_test_server() -> u16 {
    start_server_with(10).await
}

/// Receive events until one matches, panicking on timeout.
async fn wait_for<F>(events: &mut mpsc::Receiver<EngineEvent>, mut pred: F) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

/// Connect a client and wait until the socket is up.
async fn connect_client(
    port: u16,
    document_id: &str,
    user_id: &str,
) -> (CollabClient, mpsc::Receiver<EngineEvent>) {
    let config = ClientConfig::new(format!("ws://127.0.0.1:{port}"));
    let mut client = CollabClient::new(
        config,
        document_id,
        ClientProfile::new(user_id, user_id.to_uppercase()),
    );
    let mut events = client.take_events().unwrap();
    client.connect().await;
    wait_for(&mut events, |e| matches!(e, EngineEvent::Connected { .. })).await;
    (client, events)
}

fn draft(title: &str) -> OperationDraft {
    OperationDraft::new(
        OperationType::Update,
        vec!["widgets".into(), "w1".into()],
        json!({ "title": title }),
    )
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}/ws/dash-1/alice");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_server_rejects_bad_paths() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}/nope");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_err(), "Handshake without identity should fail");
}

#[tokio::test]
async fn test_client_joins_and_receives_session() {
    let port = start_test_server().await;
    let (client, mut events) = connect_client(port, "dash-1", "alice").await;

    let event = wait_for(&mut events, |e| {
        matches!(e, EngineEvent::SessionJoined { .. })
    })
    .await;
    match event {
        EngineEvent::SessionJoined { session } => {
            assert_eq!(session.document_id, "dash-1");
            assert_eq!(session.version, 0);
            assert!(session.participants.contains("alice"));
        }
        other => panic!("expected SessionJoined, got {other:?}"),
    }
    assert_eq!(client.watermark().await, 0);
}

#[tokio::test]
async fn test_two_clients_see_each_other() {
    let port = start_test_server().await;
    let (_alice, mut alice_events) = connect_client(port, "dash-1", "alice").await;
    let (bob, mut bob_events) = connect_client(port, "dash-1", "bob").await;

    let event = wait_for(&mut alice_events, |e| {
        matches!(e, EngineEvent::UserJoined { .. })
    })
    .await;
    match event {
        EngineEvent::UserJoined { presence } => {
            assert_eq!(presence.user_id, "bob");
            assert_eq!(presence.username, "BOB");
        }
        other => panic!("expected UserJoined, got {other:?}"),
    }

    // Bob's roster from session_joined already lists alice.
    let event = wait_for(&mut bob_events, |e| {
        matches!(e, EngineEvent::SessionJoined { .. })
    })
    .await;
    match event {
        EngineEvent::SessionJoined { session } => {
            assert!(session.participants.contains("alice"));
            assert!(session.participants.contains("bob"));
        }
        other => panic!("expected SessionJoined, got {other:?}"),
    }
    assert_eq!(bob.active_presences().await.len(), 1);
}

#[tokio::test]
async fn test_operation_confirmed_and_broadcast() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connect_client(port, "dash-1", "alice").await;
    let (bob, mut bob_events) = connect_client(port, "dash-1", "bob").await;

    let submitted = alice.submit(draft("Revenue")).await.unwrap();

    // The submitter gets its ack with the assigned version.
    let event = wait_for(&mut alice_events, |e| {
        matches!(e, EngineEvent::OperationConfirmed { .. })
    })
    .await;
    match event {
        EngineEvent::OperationConfirmed { operation } => {
            assert_eq!(operation.id, submitted.id);
            assert_eq!(operation.version, 1);
        }
        other => panic!("expected OperationConfirmed, got {other:?}"),
    }

    // Everyone else gets the applied operation.
    let event = wait_for(&mut bob_events, |e| {
        matches!(e, EngineEvent::RemoteOperation { .. })
    })
    .await;
    match event {
        EngineEvent::RemoteOperation { operation } => {
            assert_eq!(operation.id, submitted.id);
            assert_eq!(operation.version, 1);
            assert_eq!(operation.origin_user, "alice");
        }
        other => panic!("expected RemoteOperation, got {other:?}"),
    }

    assert_eq!(alice.watermark().await, 1);
    assert_eq!(bob.watermark().await, 1);
    assert!(alice.pending().await.is_idle());
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connect_client(port, "dash-1", "alice").await;

    // Build up some history first.
    for title in ["one", "two", "three"] {
        alice.submit(draft(title)).await.unwrap();
        wait_for(&mut alice_events, |e| {
            matches!(e, EngineEvent::OperationConfirmed { .. })
        })
        .await;
    }
    assert_eq!(alice.watermark().await, 3);

    // A late joiner starts at v0 and must converge automatically.
    let (bob, mut bob_events) = connect_client(port, "dash-1", "bob").await;
    let event = wait_for(&mut bob_events, |e| {
        matches!(e, EngineEvent::SyncCompleted { .. })
    })
    .await;
    match event {
        EngineEvent::SyncCompleted { outcome } => {
            assert_eq!(
                outcome,
                SyncOutcome::Replayed {
                    applied: 3,
                    version: 3
                }
            );
        }
        other => panic!("expected SyncCompleted, got {other:?}"),
    }
    assert_eq!(bob.watermark().await, 3);
    assert_eq!(bob.history().await.len(), 3);
}

#[tokio::test]
async fn test_cursor_moves_reach_other_clients() {
    let port = start_test_server().await;
    let (alice, _alice_events) = connect_client(port, "dash-1", "alice").await;
    let (_bob, mut bob_events) = connect_client(port, "dash-1", "bob").await;

    // Out-of-range coordinates must arrive clamped.
    alice
        .update_cursor(CursorPosition {
            x: 120.0,
            y: 42.0,
            element_ref: Some("chart-1".into()),
        })
        .await;

    let event = wait_for(&mut bob_events, |e| {
        matches!(e, EngineEvent::CursorMoved { .. })
    })
    .await;
    match event {
        EngineEvent::CursorMoved { user_id, cursor } => {
            assert_eq!(user_id, "alice");
            assert_eq!(cursor.x, 100.0);
            assert_eq!(cursor.y, 42.0);
            assert_eq!(cursor.element_ref.as_deref(), Some("chart-1"));
        }
        other => panic!("expected CursorMoved, got {other:?}"),
    }
}

#[tokio::test]
async fn test_activity_updates_reach_other_clients() {
    let port = start_test_server().await;
    let (alice, _alice_events) = connect_client(port, "dash-1", "alice").await;
    let (bob, mut bob_events) = connect_client(port, "dash-1", "bob").await;

    alice
        .update_activity("editing Revenue chart", Some("chart-1".into()))
        .await;

    let event = wait_for(&mut bob_events, |e| {
        matches!(e, EngineEvent::ActivityUpdated { .. })
    })
    .await;
    match event {
        EngineEvent::ActivityUpdated {
            user_id,
            action,
            element_id,
        } => {
            assert_eq!(user_id, "alice");
            assert_eq!(action, "editing Revenue chart");
            assert_eq!(element_id.as_deref(), Some("chart-1"));
        }
        other => panic!("expected ActivityUpdated, got {other:?}"),
    }

    let presences = bob.active_presences().await;
    let alice_presence = presences.iter().find(|p| p.user_id == "alice").unwrap();
    assert_eq!(
        alice_presence.current_action.as_deref(),
        Some("editing Revenue chart")
    );
}

#[tokio::test]
async fn test_comment_thread_lifecycle() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connect_client(port, "dash-1", "alice").await;
    let (bob, mut bob_events) = connect_client(port, "dash-1", "bob").await;

    let comment = alice
        .add_comment("chart-1", "axis label is wrong", None)
        .await;

    // Bob receives the comment; alice's echo reconciles by id.
    wait_for(&mut bob_events, |e| {
        matches!(e, EngineEvent::CommentAdded { .. })
    })
    .await;
    wait_for(&mut alice_events, |e| {
        matches!(e, EngineEvent::CommentAdded { .. })
    })
    .await;
    assert_eq!(alice.comment_threads().await.len(), 1);
    assert_eq!(bob.comment_threads().await.len(), 1);

    // Bob replies into the thread.
    bob.reply_to_comment(comment.id, "fixed in v2").await.unwrap();
    wait_for(&mut alice_events, |e| {
        matches!(e, EngineEvent::CommentAdded { .. })
    })
    .await;
    let threads = alice.comment_threads().await;
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].replies.len(), 1);
    assert_eq!(threads[0].replies[0].author, "bob");

    // Alice resolves; bob observes.
    assert!(alice.resolve_comment(comment.id).await);
    wait_for(&mut bob_events, |e| {
        matches!(e, EngineEvent::CommentResolved { .. })
    })
    .await;
    assert!(bob.comment_threads().await[0].resolved);
}

#[tokio::test]
async fn test_departure_is_announced() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connect_client(port, "dash-1", "alice").await;
    let (bob, _bob_events) = connect_client(port, "dash-1", "bob").await;

    wait_for(&mut alice_events, |e| {
        matches!(e, EngineEvent::UserJoined { .. })
    })
    .await;

    bob.disconnect().await;

    let event = wait_for(&mut alice_events, |e| {
        matches!(e, EngineEvent::UserLeft { .. })
    })
    .await;
    match event {
        EngineEvent::UserLeft { user_id } => assert_eq!(user_id, "bob"),
        other => panic!("expected UserLeft, got {other:?}"),
    }
    assert!(alice.active_presences().await.is_empty());
    let session = alice.session().await;
    assert!(!session.participants.contains("bob"));
}

#[tokio::test]
async fn test_malformed_frame_gets_error_reply() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}/ws/dash-1/alice");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    // First inbound frame is session_joined.
    let raw = timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let msg = ServerMessage::decode(raw.to_text().unwrap()).unwrap();
    assert!(matches!(msg, ServerMessage::SessionJoined { .. }));

    ws.send(Message::Text("this is not json".into())).await.unwrap();

    let raw = timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let msg = ServerMessage::decode(raw.to_text().unwrap()).unwrap();
    assert!(matches!(msg, ServerMessage::Error { .. }));
}

#[tokio::test]
async fn test_full_room_is_refused() {
    let port = start_server_with(1).await;
    let (_alice, mut alice_events) = connect_client(port, "dash-1", "alice").await;
    wait_for(&mut alice_events, |e| {
        matches!(e, EngineEvent::SessionJoined { .. })
    })
    .await;

    let url = format!("ws://127.0.0.1:{port}/ws/dash-1/bob");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let raw = timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let msg = ServerMessage::decode(raw.to_text().unwrap()).unwrap();
    match msg {
        ServerMessage::Error { message } => assert_eq!(message, "room is full"),
        other => panic!("expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_documents_are_isolated() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connect_client(port, "dash-a", "alice").await;
    let (bob, mut bob_events) = connect_client(port, "dash-b", "bob").await;

    alice.submit(draft("only in dash-a")).await.unwrap();
    wait_for(&mut alice_events, |e| {
        matches!(e, EngineEvent::OperationConfirmed { .. })
    })
    .await;

    // Bob must see nothing from the other document.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(bob.watermark().await, 0);
    loop {
        match timeout(Duration::from_millis(50), bob_events.recv()).await {
            Ok(Some(EngineEvent::RemoteOperation { .. })) => {
                panic!("operation leaked across documents")
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
}

#[tokio::test]
async fn test_sync_rerequested_after_drop_mid_catch_up() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let joined = ServerMessage::SessionJoined {
        session: {
            let mut session = Session::new("dash-1");
            session.version = 5;
            session.participants.insert("alice".into());
            session
        },
        presence: vec![],
    }
    .encode()
    .unwrap();

    let server = tokio::spawn(async move {
        // First connection: answer the join with a session five versions
        // ahead, swallow the resulting sync_request, then drop the
        // socket without replying.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::Text(joined.clone().into())).await.unwrap();
        loop {
            let frame = ws.next().await.unwrap().unwrap();
            if frame
                .to_text()
                .map(|t| t.contains("sync_request"))
                .unwrap_or(false)
            {
                break;
            }
        }
        drop(ws);

        // The reconnect gets the same greeting; the client must issue
        // a fresh sync_request even though the first one went
        // unanswered.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::Text(joined.into())).await.unwrap();
        loop {
            let frame = timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("no sync_request after reconnect")
                .unwrap()
                .unwrap();
            if frame
                .to_text()
                .map(|t| t.contains("sync_request"))
                .unwrap_or(false)
            {
                return;
            }
        }
    });

    let mut config = ClientConfig::new(format!("ws://127.0.0.1:{port}"));
    config.reconnect.base_delay = Duration::from_millis(50);
    let mut client = CollabClient::new(config, "dash-1", ClientProfile::new("alice", "Alice"));
    let mut events = client.take_events().unwrap();
    client.connect().await;

    wait_for(&mut events, |e| matches!(e, EngineEvent::Connected { .. })).await;
    wait_for(&mut events, |e| matches!(e, EngineEvent::Disconnected { .. })).await;
    wait_for(&mut events, |e| {
        matches!(e, EngineEvent::Connected { resumed: true })
    })
    .await;

    timeout(Duration::from_secs(3), server)
        .await
        .expect("server task timed out")
        .unwrap();
}

#[tokio::test]
async fn test_second_submit_while_pending_is_rejected() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connect_client(port, "dash-1", "alice").await;

    // Submit twice back to back; the ack for the first has not landed
    // yet, so the second must be refused without reaching the wire.
    alice.submit(draft("first")).await.unwrap();
    let second = alice.submit(draft("second")).await;
    assert!(second.is_err());

    wait_for(&mut alice_events, |e| {
        matches!(e, EngineEvent::OperationConfirmed { .. })
    })
    .await;
    assert_eq!(alice.watermark().await, 1);

    // With the slot free again, submitting works.
    alice.submit(draft("third")).await.unwrap();
    wait_for(&mut alice_events, |e| {
        matches!(e, EngineEvent::OperationConfirmed { .. })
    })
    .await;
    assert_eq!(alice.watermark().await, 2);
}
