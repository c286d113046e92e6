//! Delivery and registry tests
//!
//! Verifies the fan-out guarantees that hold across components:
//! - a dead recipient never blocks or fails delivery to live ones
//! - oversized payloads are truncated under the limit with a marker
//! - conversation-scoped relays reach exactly that conversation
//! - unregistering leaves no trace in any index

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use gateway_core::broadcast::{guard_payload, TRUNCATION_MARKER};
use gateway_core::runtime::{ScriptedLoader, ScriptedRuntime};
use gateway_core::{
    AdmissionConfig, AdmissionController, Broadcaster, ChatOrchestrator, ClientMessage, Connection,
    ConnectionRegistry, DeliveryConfig, DeliveryMessage, HealthMonitor, HeartbeatConfig,
    InMemorySessionStore, MessageId, OrchestratorConfig, Outbound,
};

fn connect(
    registry: &ConnectionRegistry,
    user: &str,
    conversation: Option<&str>,
) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
    let (conn, rx) = Connection::open(user, conversation.map(String::from), 16);
    assert!(registry.register(&conn));
    (conn, rx)
}

fn texts(rx: &mut mpsc::Receiver<Outbound>) -> Vec<serde_json::Value> {
    let mut out = Vec::new();
    while let Ok(Outbound::Text(frame)) = rx.try_recv() {
        out.push(serde_json::from_str(&frame).unwrap());
    }
    out
}

fn chunk(content: impl Into<String>) -> DeliveryMessage {
    DeliveryMessage::Chunk {
        message_id: MessageId::new(),
        index: 0,
        content: content.into(),
    }
}

// =============================================================================
// Partial Failure
// =============================================================================

#[tokio::test]
async fn test_dead_recipient_is_evicted_without_failing_the_others() {
    let registry = ConnectionRegistry::new();
    let broadcaster = Broadcaster::new(registry.clone(), DeliveryConfig::default());

    let (first, mut first_rx) = connect(&registry, "alice", None);
    let (second, second_rx) = connect(&registry, "alice", None);
    let (third, mut third_rx) = connect(&registry, "alice", None);
    drop(second_rx);

    let result = tokio_test::assert_ok!(broadcaster.send_to_user(&chunk("hi"), "alice").await);

    assert_eq!(result.successful, 2);
    assert_eq!(result.failed, 1);
    assert_eq!(result.failed_ids, vec![second.id()]);

    assert_eq!(texts(&mut first_rx).len(), 1);
    assert_eq!(texts(&mut third_rx).len(), 1);
    assert!(!registry.contains(second.id()));
    assert!(!second.is_connected());
    assert!(registry.contains(first.id()));
    assert!(registry.contains(third.id()));
    assert_eq!(registry.connections_for_user("alice").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_recipient_times_out() {
    let registry = ConnectionRegistry::new();
    let broadcaster = Broadcaster::new(
        registry.clone(),
        DeliveryConfig {
            send_timeout: Duration::from_millis(100),
            ..DeliveryConfig::default()
        },
    );

    // Capacity one, pre-filled: the next send can only wait
    let (stalled, _stalled_rx) = Connection::open("alice", None, 1);
    registry.register(&stalled);
    stalled
        .send_frame(Arc::from("backlog"), Duration::from_millis(10))
        .await
        .unwrap();
    let (_live, mut live_rx) = connect(&registry, "alice", None);

    let result = broadcaster
        .send_to_user(&chunk("hi"), "alice")
        .await
        .unwrap();

    assert_eq!(result.successful, 1);
    assert_eq!(result.failed_ids, vec![stalled.id()]);
    assert_eq!(texts(&mut live_rx).len(), 1);
    assert!(!registry.contains(stalled.id()));
}

// =============================================================================
// Payload Guard
// =============================================================================

#[tokio::test]
async fn test_large_chunk_is_truncated_under_the_limit() {
    let registry = ConnectionRegistry::new();
    let broadcaster = Broadcaster::new(
        registry.clone(),
        DeliveryConfig {
            max_payload_bytes: 2_000,
            ..DeliveryConfig::default()
        },
    );
    let (_conn, mut rx) = connect(&registry, "alice", None);

    broadcaster
        .send_to_user(&chunk("x".repeat(10_000)), "alice")
        .await
        .unwrap();

    let Ok(Outbound::Text(frame)) = rx.try_recv() else {
        panic!("expected a text frame");
    };
    assert!(frame.len() <= 2_000, "frame is {} bytes", frame.len());

    let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
    let content = value["content"].as_str().unwrap();
    assert!(content.ends_with(TRUNCATION_MARKER));
    assert!(content.len() < 10_000);
}

#[test]
fn test_guard_keeps_small_messages_intact() {
    let message = chunk("short");
    let encoded = guard_payload(&message, 2_000).unwrap();
    assert_eq!(encoded, message.to_json().unwrap());
}

// =============================================================================
// Conversation Scope
// =============================================================================

#[tokio::test]
async fn test_typing_reaches_only_its_conversation() {
    let registry = ConnectionRegistry::new();
    let runtime = Arc::new(ScriptedRuntime::fragments(&["unused"]));
    let orchestrator = ChatOrchestrator::new(
        Arc::new(AdmissionController::new(
            AdmissionConfig::default(),
            Arc::new(ScriptedLoader::new(runtime)),
        )),
        registry.clone(),
        Broadcaster::new(registry.clone(), DeliveryConfig::default()),
        HealthMonitor::new(HeartbeatConfig::disabled(), registry.clone()),
        Arc::new(InMemorySessionStore::new()),
        OrchestratorConfig::default(),
    );

    let (alice, mut alice_rx) = connect(&registry, "alice", Some("42"));
    let (_bob, mut bob_rx) = connect(&registry, "bob", Some("42"));
    let (_carol, mut carol_rx) = connect(&registry, "carol", Some("7"));

    orchestrator
        .handle_client_message(
            &alice,
            ClientMessage::Typing {
                conversation_id: Some("42".into()),
                typing: true,
            },
        )
        .await;

    let alice_frames = texts(&mut alice_rx);
    let bob_frames = texts(&mut bob_rx);
    assert_eq!(alice_frames.len(), 1);
    assert_eq!(bob_frames.len(), 1);
    assert_eq!(bob_frames[0]["type"], "typing");
    assert_eq!(bob_frames[0]["conversation_id"], "42");
    assert_eq!(bob_frames[0]["user_id"], "alice");
    assert!(texts(&mut carol_rx).is_empty());
}

// =============================================================================
// Registry Consistency
// =============================================================================

#[tokio::test]
async fn test_unregister_leaves_no_dangling_entries() {
    let registry = ConnectionRegistry::new();
    let mut connections = Vec::new();
    for i in 0..20 {
        let user = format!("user-{}", i % 4);
        let conversation = (i % 3 != 0).then(|| format!("conv-{}", i % 5));
        let (conn, rx) = Connection::open(user, conversation, 4);
        registry.register(&conn);
        connections.push((conn, rx));
    }
    assert_eq!(registry.len(), 20);

    let mut handles = Vec::new();
    for (conn, _rx) in &connections {
        let registry = registry.clone();
        let id = conn.id();
        handles.push(tokio::spawn(async move { registry.unregister(id) }));
    }
    for handle in futures::future::join_all(handles).await {
        assert!(handle.unwrap().is_some());
    }

    assert!(registry.is_empty());
    assert!(registry.user_ids().is_empty());
    assert!(registry.conversation_ids().is_empty());
    for (conn, _rx) in &connections {
        assert!(!registry.is_indexed(conn.id()));
        assert!(!registry.contains(conn.id()));
    }

    // Second removal is a no-op
    assert!(registry.unregister(connections[0].0.id()).is_none());
}

#[tokio::test]
async fn test_rebind_moves_between_conversation_indexes() {
    let registry = ConnectionRegistry::new();
    let (conn, _rx) = connect(&registry, "alice", Some("42"));

    assert!(registry.rebind(conn.id(), Some("7".into())));
    assert!(registry.connections_for_conversation("42").is_empty());
    assert_eq!(registry.connections_for_conversation("7").len(), 1);
    assert_eq!(registry.conversation_ids(), vec!["7".to_string()]);

    registry.unregister(conn.id());
    assert!(registry.conversation_ids().is_empty());
    assert!(registry.user_ids().is_empty());
}
