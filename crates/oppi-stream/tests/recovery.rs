#![allow(missing_docs, unused_results)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oppi_api::{ControlPlane, SessionSummary, Workspace};
use oppi_core::protocol::SubscriptionLevel;
use oppi_core::{SessionId, StreamError};
use oppi_stream::testing::{MemoryConnector, command_result};
use oppi_stream::{
    ConnectionCoordinator, ConnectionEvent, ConnectionStatus, CoordinatorConfig, SubscriptionState,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::time::Instant;

use common::{coordinator, next_event};

async fn subscribes(server: &MemoryConnector, n: usize) -> Vec<Value> {
    let mut frames = Vec::new();
    for _ in 0..n {
        frames.push(server.next_outbound_of("subscribe").await);
    }
    frames
}

#[tokio::test(start_paused = true)]
async fn reconnect_resubscribes_focused_full_and_others_notifications() {
    let server = MemoryConnector::acking_subscriptions();
    let coordinator = coordinator(&server);
    let mut events = coordinator.events();
    let s1 = SessionId::from_raw("s1");
    let s2 = SessionId::from_raw("s2");

    let mut stream = coordinator.stream_session(&s1).await.unwrap();
    coordinator.watch_session(&s2).await.unwrap();
    for seq in 1..=3 {
        server.push(json!({"type": "text_delta", "sessionId": "s1", "seq": seq}));
    }
    for _ in 0..3 {
        stream.recv().await.unwrap();
    }
    server.drain_outbound();

    server.drop_connection();
    next_event(&mut events, |e| matches!(e, ConnectionEvent::ConnectionLost { .. })).await;
    assert_eq!(
        coordinator.router().subscription_state(&s1),
        Some(SubscriptionState::Lost)
    );
    next_event(&mut events, |e| matches!(e, ConnectionEvent::StreamConnected)).await;
    assert_eq!(server.connect_count(), 2);

    let frames = subscribes(&server, 2).await;
    let focused = frames.iter().find(|f| f["sessionId"] == "s1").unwrap();
    assert_eq!(focused["level"], "full");
    assert_eq!(focused["sinceSeq"], 3);
    let background = frames.iter().find(|f| f["sessionId"] == "s2").unwrap();
    assert_eq!(background["level"], "notifications");
    assert!(background.get("sinceSeq").is_none());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        coordinator.router().subscription_state(&s1),
        Some(SubscriptionState::Subscribed(SubscriptionLevel::Full))
    );

    // The original channel keeps flowing on the new socket.
    server.push(json!({"type": "text_delta", "sessionId": "s1", "seq": 4}));
    assert_eq!(stream.recv().await.unwrap().seq, Some(4));
}

#[tokio::test(start_paused = true)]
async fn exhausted_focused_resubscribe_is_surfaced() {
    let server = MemoryConnector::acking_subscriptions();
    let coordinator = coordinator(&server);
    let mut events = coordinator.events();
    let s1 = SessionId::from_raw("s1");
    let _stream = coordinator.stream_session(&s1).await.unwrap();
    server.drain_outbound();

    server.set_responder(|cmd| {
        let mut reply = command_result(cmd, "subscribe", false);
        reply["error"] = json!("session not found");
        vec![reply]
    });
    server.drop_connection();
    next_event(&mut events, |e| matches!(e, ConnectionEvent::ConnectionLost { .. })).await;
    next_event(&mut events, |e| matches!(e, ConnectionEvent::StreamConnected)).await;
    let resubscribed_at = Instant::now();

    let event = next_event(&mut events, |e| {
        matches!(e, ConnectionEvent::ResubscribeFailed { .. })
    })
    .await;
    let ConnectionEvent::ResubscribeFailed { session_id, error } = event else {
        unreachable!();
    };
    assert_eq!(session_id, s1);
    assert_eq!(
        error,
        StreamError::rejected("subscribe", Some("session not found".into()))
    );
    // attempt × 500ms between attempts: 500ms + 1000ms.
    assert_eq!(resubscribed_at.elapsed(), Duration::from_millis(1500));
    assert_eq!(subscribes(&server, 3).await.len(), 3);

    assert_eq!(coordinator.status(), ConnectionStatus::Connected);
    assert_eq!(
        coordinator.router().subscription_state(&s1),
        Some(SubscriptionState::Lost)
    );
}

#[tokio::test(start_paused = true)]
async fn silent_busy_session_is_probed_then_reported() {
    let server = MemoryConnector::acking_subscriptions();
    let coordinator = coordinator(&server);
    let mut events = coordinator.events();
    let needed = Arc::new(Mutex::new(Vec::new()));
    {
        let needed = needed.clone();
        coordinator.set_reconnect_handler(move |id| needed.lock().push(id.clone()));
    }
    let s1 = SessionId::from_raw("s1");
    let _stream = coordinator.stream_session(&s1).await.unwrap();

    server.push(json!({"type": "agent_start", "sessionId": "s1"}));
    let started = Instant::now();
    let probe = server.next_outbound_of("get_state").await;
    assert_eq!(probe["sessionId"], "s1");
    assert_eq!(started.elapsed(), Duration::from_secs(15));

    let event = next_event(&mut events, |e| {
        matches!(e, ConnectionEvent::ReconnectNeeded { .. })
    })
    .await;
    assert_eq!(event, ConnectionEvent::ReconnectNeeded { session_id: s1.clone() });
    assert_eq!(started.elapsed(), Duration::from_secs(45));
    assert_eq!(*needed.lock(), vec![s1]);
    assert!(!coordinator.watchdog().is_armed());
    assert_eq!(server.connect_count(), 1, "handler owns the reconnect decision");
}

#[tokio::test(start_paused = true)]
async fn agent_activity_keeps_watchdog_quiet() {
    let server = MemoryConnector::acking_subscriptions();
    let coordinator = coordinator(&server);
    let s1 = SessionId::from_raw("s1");
    let _stream = coordinator.stream_session(&s1).await.unwrap();

    server.push(json!({"type": "agent_start", "sessionId": "s1"}));
    for seq in 1..=6 {
        tokio::time::sleep(Duration::from_secs(10)).await;
        server.push(json!({"type": "text_delta", "sessionId": "s1", "seq": seq}));
    }
    server.push(json!({"type": "agent_end", "sessionId": "s1"}));
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(
        server.drain_outbound().iter().all(|f| f["type"] != "get_state"),
        "no probe while events keep arriving"
    );
    assert!(!coordinator.watchdog().is_armed());
}

#[tokio::test(start_paused = true)]
async fn watchdog_reconnects_itself_without_handler() {
    let server = MemoryConnector::acking_subscriptions();
    let coordinator = coordinator(&server);
    let mut events = coordinator.events();
    let s1 = SessionId::from_raw("s1");
    let _stream = coordinator.stream_session(&s1).await.unwrap();

    server.push(json!({"type": "agent_start", "sessionId": "s1"}));
    next_event(&mut events, |e| matches!(e, ConnectionEvent::ReconnectNeeded { .. })).await;
    next_event(&mut events, |e| matches!(e, ConnectionEvent::StreamConnected)).await;
    assert_eq!(server.connect_count(), 2);
    let frame = server.next_outbound_of("subscribe").await;
    assert_eq!(frame["sessionId"], "s1");
}

struct FakeControlPlane {
    fetched: Mutex<Vec<SessionId>>,
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn list_sessions(&self) -> oppi_api::Result<Vec<SessionSummary>> {
        Ok(Vec::new())
    }

    async fn get_session(&self, id: &SessionId) -> oppi_api::Result<SessionSummary> {
        self.fetched.lock().push(id.clone());
        Ok(serde_json::from_value(json!({
            "id": id,
            "status": "busy",
            "createdAt": 1_700_000_000_000_i64,
            "lastActivity": 1_700_000_100_000_i64,
            "messageCount": 4,
            "cost": 0.12,
        }))
        .unwrap())
    }

    async fn list_workspaces(&self) -> oppi_api::Result<Vec<Workspace>> {
        Ok(Vec::new())
    }
}

#[tokio::test(start_paused = true)]
async fn degraded_stream_falls_back_to_rest_refresh() {
    let server = MemoryConnector::acking_subscriptions();
    let plane = Arc::new(FakeControlPlane {
        fetched: Mutex::new(Vec::new()),
    });
    let coordinator = ConnectionCoordinator::new(
        Arc::new(server.clone()),
        CoordinatorConfig::default(),
        Some(plane.clone() as Arc<dyn ControlPlane>),
    );
    let mut events = coordinator.events();
    let s1 = SessionId::from_raw("s1");
    let _stream = coordinator.stream_session(&s1).await.unwrap();

    // Keep the stream down past the first REST poll.
    server.fail_next_opens(4);
    server.drop_connection();
    let event = next_event(&mut events, |e| {
        matches!(e, ConnectionEvent::SessionSnapshot(_))
    })
    .await;
    let ConnectionEvent::SessionSnapshot(summary) = event else {
        unreachable!();
    };
    assert_eq!(summary.id, s1);
    assert!(summary.is_busy());

    next_event(&mut events, |e| {
        matches!(e, ConnectionEvent::StatusChanged(ConnectionStatus::Connected))
    })
    .await;
    let fetched = plane.fetched.lock().len();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(plane.fetched.lock().len(), fetched, "polling stops once connected");
}
