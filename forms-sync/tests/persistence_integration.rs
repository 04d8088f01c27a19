//! Persistence integration tests: edits and final submissions made through a
//! live server land in RocksDB and survive a restart.

use std::sync::Arc;

use forms_sync::client::{FormClient, FormEvent};
use forms_sync::identity::{Identity, Role, TokenIssuer, TokenVerifier};
use forms_sync::protocol::ServerEvent;
use forms_sync::server::{ServerConfig, SyncServer};
use forms_sync::storage::{FieldValues, ResponseStore, RocksStore, StoreConfig};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

const SECRET: &[u8] = b"persistence-test-secret";

async fn start_test_server(store: Arc<RocksStore>) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = SyncServer::with_store(
        ServerConfig::default(),
        Arc::new(TokenVerifier::new(SECRET)),
        store,
    );
    let handle = tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (port, handle)
}

async fn connect_as(port: u16, name: &str) -> (FormClient, mpsc::Receiver<FormEvent>) {
    let token = TokenIssuer::new(SECRET).issue(&Identity::new(
        name,
        format!("{name}@example.com"),
        Role::Respondent,
    ));
    let mut client = FormClient::new(format!("ws://127.0.0.1:{port}"), Some(token));
    let mut rx = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    (client, rx)
}

/// Skip events until `pred` matches one.
async fn wait_for(
    rx: &mut mpsc::Receiver<FormEvent>,
    pred: impl Fn(&ServerEvent) -> bool,
) -> ServerEvent {
    loop {
        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("Should receive event within timeout")
            .expect("Event channel closed");
        if let FormEvent::Server(event) = event {
            if pred(&event) {
                return event;
            }
        }
    }
}

/// Wait until every other holder of the store (server, connection tasks) is gone.
async fn release(store: Arc<RocksStore>) {
    for _ in 0..200 {
        if Arc::strong_count(&store) == 1 {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("store still shared after shutdown");
}

#[tokio::test]
async fn test_edits_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let doc = Uuid::new_v4();

    {
        let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&path)).unwrap());
        store.create_response(doc).await.unwrap();
        let (port, handle) = start_test_server(store.clone()).await;

        let (mut a, mut rx_a) = connect_as(port, "alice").await;
        a.join(doc).await.unwrap();
        wait_for(&mut rx_a, |e| matches!(e, ServerEvent::ActiveParticipants { .. })).await;

        a.update(doc, "q1", json!("yes"), 0).await.unwrap();
        wait_for(&mut rx_a, |e| matches!(e, ServerEvent::FormUpdated { version: 1, .. })).await;
        a.update(doc, "q2", json!({"choice": [1, 3]}), 1).await.unwrap();
        wait_for(&mut rx_a, |e| matches!(e, ServerEvent::FormUpdated { version: 2, .. })).await;

        let mut answers = FieldValues::new();
        answers.insert("q1".into(), json!("yes"));
        a.submit(doc, answers).await.unwrap();
        wait_for(&mut rx_a, |e| matches!(e, ServerEvent::FormSubmitted { .. })).await;

        a.disconnect().await;
        handle.abort();
        release(store).await;
    }

    // Restart on the same directory
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&path)).unwrap());
    let state = store.load_state(doc).await.unwrap();
    assert_eq!(state.version, 2);
    assert_eq!(state.values["q1"], json!("yes"));
    assert_eq!(state.values["q2"], json!({"choice": [1, 3]}));

    let submissions = store.list_submissions(doc).await.unwrap();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].submitter_id, "alice");

    // A new server picks up where the old one stopped
    let (port, _handle) = start_test_server(store.clone()).await;
    let (b, mut rx_b) = connect_as(port, "bob").await;
    b.join(doc).await.unwrap();
    b.update(doc, "q1", json!("stale"), 0).await.unwrap();
    match wait_for(&mut rx_b, |e| matches!(e, ServerEvent::FormConflict { .. })).await {
        ServerEvent::FormConflict { latest_version, .. } => assert_eq!(latest_version, 2),
        _ => unreachable!(),
    }

    b.request_state(doc).await.unwrap();
    match wait_for(&mut rx_b, |e| matches!(e, ServerEvent::FormState { .. })).await {
        ServerEvent::FormState { values, version, .. } => {
            assert_eq!(version, 2);
            assert_eq!(values["q1"], json!("yes"));
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_conflicting_clients_single_winner_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let doc = Uuid::new_v4();
    store.create_response(doc).await.unwrap();
    let (port, _handle) = start_test_server(store.clone()).await;

    let mut clients = Vec::new();
    for i in 0..4 {
        let (client, mut rx) = connect_as(port, &format!("user{i}")).await;
        client.join(doc).await.unwrap();
        wait_for(&mut rx, |e| matches!(e, ServerEvent::ActiveParticipants { .. })).await;
        clients.push((client, rx));
    }

    for (i, (client, _)) in clients.iter().enumerate() {
        client.update(doc, "q1", json!(i), 0).await.unwrap();
    }

    // Every client hears either its own conflict or learns the winner
    let mut conflicts = 0;
    for (client, rx) in &mut clients {
        client.request_state(doc).await.unwrap();
        loop {
            match wait_for(rx, |e| {
                matches!(e, ServerEvent::FormConflict { .. } | ServerEvent::FormState { .. })
            })
            .await
            {
                ServerEvent::FormConflict { .. } => conflicts += 1,
                _ => break,
            }
        }
    }
    assert_eq!(conflicts, 3);
    assert_eq!(store.get_version(doc).await.unwrap(), 1);
}
