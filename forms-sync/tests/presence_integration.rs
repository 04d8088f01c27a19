//! End-to-end presence tests: join, leave, disconnect, and snapshot ordering
//! as observed by real WebSocket clients.

use std::sync::Arc;

use forms_sync::client::{FormClient, FormEvent};
use forms_sync::identity::{Identity, Role, TokenIssuer, TokenVerifier};
use forms_sync::protocol::ServerEvent;
use forms_sync::server::{ServerConfig, SyncServer};
use forms_sync::storage::{MemoryStore, ResponseStore};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

const SECRET: &[u8] = b"presence-test-secret";

async fn start_test_server(docs: &[Uuid]) -> (u16, Arc<SyncServer>) {
    let store = Arc::new(MemoryStore::new());
    for doc in docs {
        store.create_response(*doc).await.unwrap();
    }
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(SyncServer::with_store(
        ServerConfig::default(),
        Arc::new(TokenVerifier::new(SECRET)),
        store,
    ));
    let s = server.clone();
    tokio::spawn(async move {
        s.serve(listener).await.unwrap();
    });
    (port, server)
}

async fn connect_as(port: u16, name: &str, role: Role) -> (FormClient, mpsc::Receiver<FormEvent>) {
    let token = TokenIssuer::new(SECRET).issue(&Identity::new(
        name,
        format!("{name}@example.com"),
        role,
    ));
    let mut client = FormClient::new(format!("ws://127.0.0.1:{port}"), Some(token));
    let mut rx = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    assert_eq!(recv(&mut rx).await, FormEvent::Connected);
    (client, rx)
}

async fn recv(rx: &mut mpsc::Receiver<FormEvent>) -> FormEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("Should receive event within timeout")
        .expect("Event channel closed")
}

/// Next presence snapshot as a list of participant ids.
async fn next_presence(rx: &mut mpsc::Receiver<FormEvent>) -> Vec<String> {
    match recv(rx).await {
        FormEvent::Server(ServerEvent::ActiveParticipants { participants, .. }) => {
            participants.into_iter().map(|p| p.id).collect()
        }
        other => panic!("Expected activeParticipants, got {other:?}"),
    }
}

#[tokio::test]
async fn test_two_clients_join_then_one_disconnects() {
    let doc = Uuid::new_v4();
    let (port, server) = start_test_server(&[doc]).await;

    let (a, mut rx_a) = connect_as(port, "alice", Role::Respondent).await;
    let (mut b, mut rx_b) = connect_as(port, "bob", Role::Respondent).await;

    a.join(doc).await.unwrap();
    assert_eq!(next_presence(&mut rx_a).await.len(), 1);

    b.join(doc).await.unwrap();
    assert_eq!(next_presence(&mut rx_a).await, vec!["alice", "bob"]);
    assert_eq!(next_presence(&mut rx_b).await, vec!["alice", "bob"]);

    b.disconnect().await;
    assert_eq!(next_presence(&mut rx_a).await, vec!["alice"]);
    assert_eq!(server.manager().snapshot(doc).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_snapshot_ordered_by_join_time() {
    let doc = Uuid::new_v4();
    let (port, _server) = start_test_server(&[doc]).await;

    let names = ["carol", "alice", "bob", "dave"];
    let mut clients = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let (client, mut rx) = connect_as(port, name, Role::Respondent).await;
        client.join(doc).await.unwrap();
        assert_eq!(next_presence(&mut rx).await.len(), i + 1);
        clients.push((client, rx));
    }

    let (late, mut rx_late) = connect_as(port, "admin", Role::Admin).await;
    late.request_participants(doc).await.unwrap();
    assert_eq!(next_presence(&mut rx_late).await, names.to_vec());
}

#[tokio::test]
async fn test_repeated_join_does_not_duplicate() {
    let doc = Uuid::new_v4();
    let (port, _server) = start_test_server(&[doc]).await;
    let (a, mut rx_a) = connect_as(port, "alice", Role::Respondent).await;

    for _ in 0..3 {
        a.join(doc).await.unwrap();
        assert_eq!(next_presence(&mut rx_a).await, vec!["alice"]);
    }
}

#[tokio::test]
async fn test_explicit_leave() {
    let doc = Uuid::new_v4();
    let (port, server) = start_test_server(&[doc]).await;
    let (a, mut rx_a) = connect_as(port, "alice", Role::Respondent).await;
    let (b, mut rx_b) = connect_as(port, "bob", Role::Respondent).await;

    a.join(doc).await.unwrap();
    next_presence(&mut rx_a).await;
    b.join(doc).await.unwrap();
    next_presence(&mut rx_a).await;
    next_presence(&mut rx_b).await;

    b.leave(doc).await.unwrap();
    assert_eq!(next_presence(&mut rx_a).await, vec!["alice"]);

    a.leave(doc).await.unwrap();
    // Round-trip on the same connection so the leave has been processed
    a.request_participants(doc).await.unwrap();
    assert!(next_presence(&mut rx_a).await.is_empty());
    assert_eq!(server.manager().registry().room_count().await, 0);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let doc1 = Uuid::new_v4();
    let doc2 = Uuid::new_v4();
    let (port, _server) = start_test_server(&[doc1, doc2]).await;

    let (a, mut rx_a) = connect_as(port, "alice", Role::Respondent).await;
    let (b, mut rx_b) = connect_as(port, "bob", Role::Respondent).await;

    a.join(doc1).await.unwrap();
    assert_eq!(next_presence(&mut rx_a).await, vec!["alice"]);
    b.join(doc2).await.unwrap();
    assert_eq!(next_presence(&mut rx_b).await, vec!["bob"]);

    // Alice sees nothing from doc2
    a.request_participants(doc1).await.unwrap();
    assert_eq!(next_presence(&mut rx_a).await, vec!["alice"]);
}

#[tokio::test]
async fn test_disconnect_leaves_all_rooms() {
    let doc1 = Uuid::new_v4();
    let doc2 = Uuid::new_v4();
    let (port, _server) = start_test_server(&[doc1, doc2]).await;

    let (watcher, mut rx_w) = connect_as(port, "watcher", Role::Admin).await;
    let (mut a, mut rx_a) = connect_as(port, "alice", Role::Respondent).await;

    watcher.join(doc1).await.unwrap();
    next_presence(&mut rx_w).await;
    watcher.join(doc2).await.unwrap();
    next_presence(&mut rx_w).await;

    a.join(doc1).await.unwrap();
    next_presence(&mut rx_a).await;
    a.join(doc2).await.unwrap();
    next_presence(&mut rx_a).await;
    assert_eq!(next_presence(&mut rx_w).await, vec!["watcher", "alice"]);
    assert_eq!(next_presence(&mut rx_w).await, vec!["watcher", "alice"]);

    a.disconnect().await;
    assert_eq!(next_presence(&mut rx_w).await, vec!["watcher"]);
    assert_eq!(next_presence(&mut rx_w).await, vec!["watcher"]);
}
