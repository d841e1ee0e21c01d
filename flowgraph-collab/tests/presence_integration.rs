//! Presence over a real relay: join/update/leave events, slot ownership,
//! and ephemerality.

use flowgraph_collab::{CollabSession, PeerInfo, ServerConfig, SessionConfig, SyncMessage, SyncServer};
use flowgraph_core::{
    color_for_user, AwarenessMessage, CollabEvent, CursorPosition, EventKind, PresenceState,
    PresenceStatus,
};
use futures_util::SinkExt;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

async fn start_test_server() -> (String, Arc<SyncServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
        storage_path: None,
    };
    let server = Arc::new(SyncServer::with_store(config, None));
    let s = server.clone();
    tokio::spawn(async move {
        let _ = s.serve(listener).await;
    });
    (format!("ws://127.0.0.1:{port}"), server)
}

fn session(user: &str, name: &str) -> CollabSession {
    CollabSession::open("p1", SessionConfig::for_testing(user, name, None)).unwrap()
}

async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..150 {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// Collects every presence event a session receives.
fn record_presence(session: &CollabSession) -> Arc<Mutex<Vec<CollabEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    for kind in [EventKind::UserJoined, EventKind::UserUpdated, EventKind::UserLeft] {
        let l = log.clone();
        session.on(kind, move |e| l.lock().unwrap().push(e.clone()));
    }
    log
}

async fn raw_binary(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    frame: &SyncMessage,
) {
    ws.send(Message::Binary(frame.encode().unwrap().into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_join_update_leave() {
    let (url, _server) = start_test_server().await;
    let alice = session("alice", "Alice");
    let bob = session("bob", "Bob");
    let alice_log = record_presence(&alice);
    let bob_log = record_presence(&bob);

    assert!(alice.connect(&url).await);
    assert!(bob.connect(&url).await);

    // Each side learns about the other, the late joiner via the relay cache.
    assert!(eventually(|| alice.get_online_users().len() == 1).await);
    assert!(eventually(|| bob.get_online_users().len() == 1).await);
    let seen_by_alice = alice.get_online_users().remove(0);
    assert_eq!(seen_by_alice.user_id, "bob");
    assert_eq!(seen_by_alice.name, "Bob");
    assert_eq!(seen_by_alice.color, color_for_user("bob"));
    assert!(eventually(|| !bob_log.lock().unwrap().is_empty()).await);
    assert!(matches!(bob_log.lock().unwrap()[0], CollabEvent::UserJoined(ref s) if s.user_id == "alice"));

    bob.update_cursor(CursorPosition::on_node("n1", 4.0, 2.0));
    assert!(
        eventually(|| {
            alice.get_online_users()[0].cursor == Some(CursorPosition::on_node("n1", 4.0, 2.0))
        })
        .await
    );

    bob.disconnect().await;
    assert!(eventually(|| alice.get_online_users().is_empty()).await);
    assert!(bob.get_online_users().is_empty());
    assert!(
        eventually(|| {
            alice_log
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, CollabEvent::UserLeft(_)))
        })
        .await
    );
    sleep(Duration::from_millis(100)).await;

    let events = alice_log.lock().unwrap().clone();
    assert!(matches!(events.first(), Some(CollabEvent::UserJoined(s)) if s.user_id == "bob"));
    assert!(events
        .iter()
        .any(|e| matches!(e, CollabEvent::UserUpdated(s) if s.cursor.is_some())));
    let left: Vec<&CollabEvent> = events
        .iter()
        .filter(|e| matches!(e, CollabEvent::UserLeft(_)))
        .collect();
    assert_eq!(left.len(), 1);
}

#[tokio::test]
async fn test_presence_is_ephemeral() {
    let (url, _server) = start_test_server().await;
    let alice = session("alice", "Alice");
    let bob = session("bob", "Bob");
    assert!(alice.connect(&url).await);
    assert!(bob.connect(&url).await);

    alice.add_node("n1", json!({"label": "Start"})).unwrap();
    bob.update_cursor(CursorPosition::on_node("n1", 1.0, 1.0));
    bob.set_status(PresenceStatus::Editing);
    assert!(
        eventually(|| {
            alice
                .get_online_users()
                .first()
                .is_some_and(|u| u.status == PresenceStatus::Editing)
        })
        .await
    );
    let ops_before = alice.document().operation_count();

    bob.disconnect().await;
    assert!(eventually(|| alice.get_online_users().is_empty()).await);

    // Presence never touched the durable document.
    assert_eq!(alice.document().operation_count(), ops_before);
    assert_eq!(ops_before, 1);
    assert!(alice.get_snapshots().is_empty());
    let data = alice.get_current_data();
    assert_eq!(data.nodes.len(), 1);
    assert!(data.edges.is_empty());
}

#[tokio::test]
async fn test_same_user_two_sessions_two_slots() {
    let (url, _server) = start_test_server().await;
    let alice = session("alice", "Alice");
    let laptop = session("carol", "Carol");
    let phone = session("carol", "Carol");
    assert!(alice.connect(&url).await);
    assert!(laptop.connect(&url).await);
    assert!(phone.connect(&url).await);

    assert!(eventually(|| alice.get_online_users().len() == 2).await);
    assert!(alice.get_online_users().iter().all(|u| u.user_id == "carol"));

    phone.disconnect().await;
    assert!(eventually(|| alice.get_online_users().len() == 1).await);
}

#[tokio::test]
async fn test_relay_rejects_foreign_slot() {
    let (url, server) = start_test_server().await;
    let alice = session("alice", "Alice");
    assert!(alice.connect(&url).await);

    let mallory = Uuid::new_v4();
    let victim = Uuid::new_v4();
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}/p1"))
        .await
        .unwrap();
    raw_binary(
        &mut ws,
        &SyncMessage::peer_joined("p1", &PeerInfo::new(mallory, "mallory", "Mallory")).unwrap(),
    )
    .await;

    let forged = AwarenessMessage::State {
        session_id: victim,
        clock: 1,
        state: PresenceState::new("victim", "Victim"),
    };
    raw_binary(&mut ws, &SyncMessage::awareness(mallory, "p1", 1, &forged).unwrap()).await;

    let mut rejected = false;
    for _ in 0..100 {
        if server.stats().await.rejected_awareness == 1 {
            rejected = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(rejected);
    assert!(alice
        .get_online_users()
        .iter()
        .all(|u| u.user_id != "victim"));

    // Writing its own slot is accepted.
    let own = AwarenessMessage::State {
        session_id: mallory,
        clock: 2,
        state: PresenceState::new("mallory", "Mallory"),
    };
    raw_binary(&mut ws, &SyncMessage::awareness(mallory, "p1", 2, &own).unwrap()).await;
    assert!(eventually(|| alice.get_online_users().iter().any(|u| u.user_id == "mallory")).await);
}

#[tokio::test]
async fn test_dropped_connection_clears_presence() {
    let (url, _server) = start_test_server().await;
    let alice = session("alice", "Alice");
    assert!(alice.connect(&url).await);

    let ghost = Uuid::new_v4();
    {
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}/p1"))
            .await
            .unwrap();
        raw_binary(
            &mut ws,
            &SyncMessage::peer_joined("p1", &PeerInfo::new(ghost, "ghost", "Ghost")).unwrap(),
        )
        .await;
        let hello = AwarenessMessage::State {
            session_id: ghost,
            clock: 1,
            state: PresenceState::new("ghost", "Ghost"),
        };
        raw_binary(&mut ws, &SyncMessage::awareness(ghost, "p1", 1, &hello).unwrap()).await;
        assert!(eventually(|| alice.get_online_users().len() == 1).await);
        // Socket dropped without a leave frame.
    }

    assert!(eventually(|| alice.get_online_users().is_empty()).await);
}
