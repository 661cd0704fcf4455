//! Integration tests for presence bookkeeping across connect/disconnect.

use parley_chat::client::{ChatClient, ChatEvent};
use parley_chat::config::ServerConfig;
use parley_chat::presence::PresenceRegistry;
use parley_chat::protocol::ServerEvent;
use parley_chat::server::ChatServer;
use parley_chat::store::MemoryStore;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration, Instant};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server over `store`, return its URL.
async fn start_test_server(store: Arc<MemoryStore>, cleanup_attempts: u32) -> String {
    let port = free_port().await;
    let config = ServerConfig {
        presence_cleanup_attempts: cleanup_attempts,
        ..ServerConfig::bound_to(format!("127.0.0.1:{port}"))
    };
    let server = ChatServer::with_store(config, store);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

async fn connect_client(url: &str) -> (ChatClient, Receiver<ChatEvent>) {
    let mut client = ChatClient::new(url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    let _ = timeout(Duration::from_secs(1), events.recv()).await; // Connected
    (client, events)
}

async fn join(client: &ChatClient, events: &mut Receiver<ChatEvent>, room: &str) {
    client.join_room(room).await.unwrap();
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(ChatEvent::Server(ServerEvent::History(_)))) => return,
            Ok(Some(_)) => continue,
            other => panic!("Expected history, got {other:?}"),
        }
    }
}

/// Poll until `room`'s presence count reaches `expected` or time runs out.
async fn wait_for_count(presence: &PresenceRegistry, room: &str, expected: usize) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if presence.count(room).await.ok() == Some(expected) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_join_adds_presence() {
    let store = Arc::new(MemoryStore::new());
    let url = start_test_server(store.clone(), 3).await;
    let presence = PresenceRegistry::new(store);

    let (client, mut events) = connect_client(&url).await;
    join(&client, &mut events, "general").await;
    assert_eq!(presence.count("general").await.unwrap(), 1);

    // Joining again keeps a single entry
    join(&client, &mut events, "general").await;
    assert_eq!(presence.count("general").await.unwrap(), 1);
}

#[tokio::test]
async fn test_disconnect_clears_presence_in_every_room() {
    let store = Arc::new(MemoryStore::new());
    let url = start_test_server(store.clone(), 3).await;
    let presence = PresenceRegistry::new(store);

    let (mut client, mut events) = connect_client(&url).await;
    join(&client, &mut events, "a").await;
    join(&client, &mut events, "b").await;
    assert_eq!(presence.count("a").await.unwrap(), 1);
    assert_eq!(presence.count("b").await.unwrap(), 1);

    client.disconnect().await;

    assert!(wait_for_count(&presence, "a", 0).await);
    assert!(wait_for_count(&presence, "b", 0).await);
}

#[tokio::test]
async fn test_disconnect_announces_user_left() {
    let store = Arc::new(MemoryStore::new());
    let url = start_test_server(store, 3).await;

    let (mut leaver, mut events_l) = connect_client(&url).await;
    let (watcher, mut events_w) = connect_client(&url).await;
    join(&leaver, &mut events_l, "r").await;
    join(&watcher, &mut events_w, "r").await;

    leaver.disconnect().await;

    loop {
        match timeout(Duration::from_secs(2), events_w.recv()).await {
            Ok(Some(ChatEvent::Server(ServerEvent::UserLeft(notice)))) => {
                assert_eq!(notice.username, "User");
                break;
            }
            Ok(Some(_)) => continue,
            other => panic!("Expected userLeft, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_presence_cleanup_retries_through_outage() {
    let store = Arc::new(MemoryStore::new());
    let url = start_test_server(store.clone(), 6).await;
    let presence = PresenceRegistry::new(store.clone());

    let (mut client, mut events) = connect_client(&url).await;
    join(&client, &mut events, "r").await;

    store.set_available(false);
    client.disconnect().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    store.set_available(true);

    assert!(wait_for_count(&presence, "r", 0).await);
}
