//! Integration tests for cross-instance fanout.
//!
//! Two servers share one in-memory store, standing in for two processes
//! sharing one Redis. Clients connect to different instances and must see
//! the same room.

use parley_chat::client::{ChatClient, ChatEvent};
use parley_chat::config::ServerConfig;
use parley_chat::presence::PresenceRegistry;
use parley_chat::protocol::{ChatMessage, ServerEvent};
use parley_chat::server::ChatServer;
use parley_chat::store::MemoryStore;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server over `store` on a free port, return its URL.
async fn start_instance(store: Arc<MemoryStore>) -> String {
    let port = free_port().await;
    let config = ServerConfig::bound_to(format!("127.0.0.1:{port}"));
    let server = ChatServer::with_store(config, store);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

async fn connect_client(url: &str, name: &str) -> (ChatClient, Receiver<ChatEvent>) {
    let mut client = ChatClient::new(url).with_username(name);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    let _ = timeout(Duration::from_secs(1), events.recv()).await; // Connected
    (client, events)
}

async fn wait_for<F>(events: &mut Receiver<ChatEvent>, mut pred: F) -> ServerEvent
where
    F: FnMut(&ServerEvent) -> bool,
{
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(ChatEvent::Server(event))) if pred(&event) => return event,
            Ok(Some(_)) => continue,
            other => panic!("Expected server event, got {other:?}"),
        }
    }
}

async fn join(client: &ChatClient, events: &mut Receiver<ChatEvent>, room: &str) -> Vec<ChatMessage> {
    client.join_room(room).await.unwrap();
    match wait_for(events, |e| matches!(e, ServerEvent::History(_))).await {
        ServerEvent::History(history) => history,
        _ => unreachable!(),
    }
}

async fn collect_messages(events: &mut Receiver<ChatEvent>, window: Duration) -> Vec<String> {
    let mut texts = Vec::new();
    while let Ok(Some(event)) = timeout(window, events.recv()).await {
        if let ChatEvent::Server(ServerEvent::Message(msg)) = event {
            texts.push(msg.text);
        }
    }
    texts
}

#[tokio::test]
async fn test_message_crosses_instances_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    let url_a = start_instance(store.clone()).await;
    let url_b = start_instance(store).await;

    let (alice, mut events_a) = connect_client(&url_a, "alice").await;
    let (bob, mut events_b) = connect_client(&url_b, "bob").await;
    join(&alice, &mut events_a, "general").await;
    join(&bob, &mut events_b, "general").await;

    alice.send_message("general", "from A").await.unwrap();
    bob.send_message("general", "from B").await.unwrap();

    for events in [&mut events_a, &mut events_b] {
        let mut texts = collect_messages(events, Duration::from_millis(300)).await;
        texts.sort();
        assert_eq!(texts, vec!["from A", "from B"]);
    }
}

#[tokio::test]
async fn test_history_shared_between_instances() {
    let store = Arc::new(MemoryStore::new());
    let url_a = start_instance(store.clone()).await;
    let url_b = start_instance(store).await;

    let (writer, mut wevents) = connect_client(&url_a, "w").await;
    join(&writer, &mut wevents, "r").await;
    writer.send_message("r", "persisted").await.unwrap();
    wait_for(&mut wevents, |e| matches!(e, ServerEvent::Message(_))).await;

    let (reader, mut revents) = connect_client(&url_b, "r").await;
    let history = join(&reader, &mut revents, "r").await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].text, "persisted");
    assert_eq!(history[0].username, "w");
}

#[tokio::test]
async fn test_typing_crosses_instances_but_not_back() {
    let store = Arc::new(MemoryStore::new());
    let url_a = start_instance(store.clone()).await;
    let url_b = start_instance(store).await;

    let (alice, mut events_a) = connect_client(&url_a, "alice").await;
    let (bob, mut events_b) = connect_client(&url_b, "bob").await;
    join(&alice, &mut events_a, "r").await;
    join(&bob, &mut events_b, "r").await;
    wait_for(&mut events_a, |e| matches!(e, ServerEvent::UserJoined(n) if n.username == "bob")).await;

    alice.set_typing("r", true).await.unwrap();
    match wait_for(&mut events_b, |e| matches!(e, ServerEvent::Typing(_))).await {
        ServerEvent::Typing(notice) => assert_eq!(notice.username, "alice"),
        _ => unreachable!(),
    }

    let mut echoed = false;
    while let Ok(Some(event)) = timeout(Duration::from_millis(200), events_a.recv()).await {
        echoed |= matches!(event, ChatEvent::Server(ServerEvent::Typing(_)));
    }
    assert!(!echoed, "Typing must not reach its sender");
}

#[tokio::test]
async fn test_presence_spans_instances() {
    let store = Arc::new(MemoryStore::new());
    let url_a = start_instance(store.clone()).await;
    let url_b = start_instance(store.clone()).await;

    let (alice, mut events_a) = connect_client(&url_a, "alice").await;
    let (bob, mut events_b) = connect_client(&url_b, "bob").await;
    join(&alice, &mut events_a, "lobby").await;
    join(&bob, &mut events_b, "lobby").await;

    let presence = PresenceRegistry::new(store);
    assert_eq!(presence.count("lobby").await.unwrap(), 2);
}

#[tokio::test]
async fn test_rooms_isolated_across_instances() {
    let store = Arc::new(MemoryStore::new());
    let url_a = start_instance(store.clone()).await;
    let url_b = start_instance(store).await;

    let (alice, mut events_a) = connect_client(&url_a, "alice").await;
    let (bob, mut events_b) = connect_client(&url_b, "bob").await;
    join(&alice, &mut events_a, "one").await;
    join(&bob, &mut events_b, "two").await;

    alice.send_message("one", "only one").await.unwrap();
    assert_eq!(collect_messages(&mut events_a, Duration::from_millis(200)).await, vec!["only one"]);
    assert!(collect_messages(&mut events_b, Duration::from_millis(200)).await.is_empty());
}
