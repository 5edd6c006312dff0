#![allow(missing_docs, unused_results)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use oppi_core::protocol::{PermissionAction, SubscriptionLevel, TurnKind, TurnStage};
use oppi_core::{SessionId, StreamError};
use oppi_stream::testing::{MemoryConnector, command_result, turn_ack};
use oppi_stream::{ConnectionStatus, StageObserver, SubscriptionState};
use parking_lot::Mutex;
use serde_json::{Map, json};
use tokio::time::Instant;

use common::coordinator;

#[tokio::test(start_paused = true)]
async fn prompt_returns_after_dispatched_not_queued() {
    let server = MemoryConnector::acking_subscriptions();
    let coordinator = coordinator(&server);
    let s1 = SessionId::from_raw("s1");
    let _stream = coordinator.stream_session(&s1).await.unwrap();

    let stages = Arc::new(Mutex::new(Vec::new()));
    let observer: StageObserver = {
        let stages = stages.clone();
        Arc::new(move |stage: &TurnStage| stages.lock().push(stage.clone()))
    };
    let task = {
        let (coordinator, s1) = (coordinator.clone(), s1.clone());
        tokio::spawn(async move {
            coordinator
                .send_turn(TurnKind::Prompt, &s1, "hi", Vec::new(), Some(observer))
                .await
        })
    };

    let prompt = server.next_outbound_of("prompt").await;
    assert_eq!(prompt["sessionId"], "s1");
    assert_eq!(prompt["message"], "hi");
    assert!(prompt["turnId"].is_string());

    server.push(turn_ack(&prompt, "queued"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!task.is_finished(), "queued must not satisfy dispatched");

    server.push(turn_ack(&prompt, "dispatched"));
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.stage, Some(TurnStage::Dispatched));
    assert_eq!(outcome.request_id.as_str(), prompt["requestId"].as_str().unwrap());
    assert_eq!(*stages.lock(), vec![TurnStage::Queued, TurnStage::Dispatched]);
}

#[tokio::test(start_paused = true)]
async fn unanswered_command_times_out() {
    let server = MemoryConnector::acking_subscriptions();
    let coordinator = coordinator(&server);
    let s1 = SessionId::from_raw("s1");
    let _stream = coordinator.stream_session(&s1).await.unwrap();

    let started = Instant::now();
    let err = coordinator
        .send_command(&s1, "get_fork_messages", Map::new())
        .await
        .unwrap_err();
    assert_eq!(err, StreamError::timeout("get_fork_messages"));
    assert_eq!(started.elapsed(), Duration::from_secs(8));
    assert_eq!(coordinator.connection_state().pending_commands, 0);
}

#[tokio::test(start_paused = true)]
async fn command_result_data_is_returned() {
    let server = MemoryConnector::acking_subscriptions();
    server.set_responder(|cmd| match cmd["type"].as_str() {
        Some("subscribe") => vec![command_result(cmd, "subscribe", true)],
        Some("get_fork_messages") => {
            let mut reply = command_result(cmd, "get_fork_messages", true);
            reply["data"] = json!({"messages": [{"entryId": cmd["entryId"]}]});
            vec![reply]
        }
        _ => Vec::new(),
    });
    let coordinator = coordinator(&server);
    let s1 = SessionId::from_raw("s1");
    let _stream = coordinator.stream_session(&s1).await.unwrap();

    let mut params = Map::new();
    params.insert("entryId".into(), json!("e7"));
    let data = coordinator
        .send_command(&s1, "get_fork_messages", params)
        .await
        .unwrap();
    assert_eq!(data, Some(json!({"messages": [{"entryId": "e7"}]})));
}

#[tokio::test(start_paused = true)]
async fn rejection_surfaces_server_reason() {
    let server = MemoryConnector::acking_subscriptions();
    let coordinator = coordinator(&server);
    let s1 = SessionId::from_raw("s1");
    let _stream = coordinator.stream_session(&s1).await.unwrap();

    let task = {
        let (coordinator, s1) = (coordinator.clone(), s1.clone());
        tokio::spawn(async move { coordinator.send_steer(&s1, "stop").await })
    };
    let steer = server.next_outbound_of("steer").await;
    let mut reply = command_result(&steer, "steer", false);
    reply["error"] = json!("Session is not busy");
    server.push(reply);

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        StreamError::rejected("steer", Some("Session is not busy".into()))
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(
        server.drain_outbound().iter().all(|f| f["type"] != "steer"),
        "rejections are not retried"
    );
}

#[tokio::test(start_paused = true)]
async fn permission_response_is_sent_unwrapped() {
    let server = MemoryConnector::acking_subscriptions();
    let coordinator = coordinator(&server);
    let s2 = SessionId::from_raw("s2");
    coordinator.watch_session(&s2).await.unwrap();

    coordinator
        .respond_permission(&s2, "perm-1", PermissionAction::Allow)
        .await
        .unwrap();
    let frame = server.next_outbound_of("permission_response").await;
    assert_eq!(frame["sessionId"], "s2");
    assert_eq!(frame["id"], "perm-1");
    assert_eq!(frame["action"], "allow");
}

#[tokio::test(start_paused = true)]
async fn restreaming_cancels_pending_unsubscribe() {
    let server = MemoryConnector::acking_subscriptions();
    let coordinator = coordinator(&server);
    let s1 = SessionId::from_raw("s1");

    let first = coordinator.stream_session(&s1).await.unwrap();
    drop(first);
    let _second = coordinator.stream_session(&s1).await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let kinds: Vec<String> = server
        .drain_outbound()
        .iter()
        .filter_map(|f| f["type"].as_str().map(str::to_owned))
        .collect();
    let last_subscribe = kinds.iter().rposition(|k| k == "subscribe").unwrap();
    assert!(
        !kinds[last_subscribe..].iter().any(|k| k == "unsubscribe"),
        "stray unsubscribe after subscribe: {kinds:?}"
    );
    assert_eq!(
        coordinator.router().subscription_state(&s1),
        Some(SubscriptionState::Subscribed(SubscriptionLevel::Full))
    );
}

#[tokio::test(start_paused = true)]
async fn superseded_unsubscribe_leaves_nothing_pending() {
    let server = MemoryConnector::new();
    server.set_responder(|cmd| match cmd["type"].as_str() {
        Some("subscribe") => vec![command_result(cmd, "subscribe", true)],
        _ => Vec::new(),
    });
    let coordinator = coordinator(&server);
    let s1 = SessionId::from_raw("s1");

    drop(coordinator.stream_session(&s1).await.unwrap());
    let unsubscribe = server.next_outbound_of("unsubscribe").await;
    assert_eq!(unsubscribe["sessionId"], "s1");
    let _stream = coordinator.stream_session(&s1).await.unwrap();
    let resubscribe = server.next_outbound_of("subscribe").await;
    assert_eq!(resubscribe["level"], "full");

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(coordinator.connection_state().pending_commands, 0);
    assert!(
        server.drain_outbound().iter().all(|f| f["type"] != "unsubscribe"),
        "unsubscribe must not follow the new subscribe"
    );
    assert_eq!(
        coordinator.router().subscription_state(&s1),
        Some(SubscriptionState::Subscribed(SubscriptionLevel::Full))
    );
}

#[tokio::test(start_paused = true)]
async fn stale_stream_drop_does_not_unsubscribe() {
    let server = MemoryConnector::acking_subscriptions();
    let coordinator = coordinator(&server);
    let s1 = SessionId::from_raw("s1");

    let first = coordinator.stream_session(&s1).await.unwrap();
    let _second = coordinator.stream_session(&s1).await.unwrap();
    drop(first);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(
        server
            .drain_outbound()
            .iter()
            .all(|f| f["type"] != "unsubscribe")
    );
    assert_eq!(coordinator.connection_state().focused, Some(s1));
}

#[tokio::test(start_paused = true)]
async fn only_one_session_holds_full() {
    let server = MemoryConnector::acking_subscriptions();
    let coordinator = coordinator(&server);
    let s1 = SessionId::from_raw("s1");
    let s2 = SessionId::from_raw("s2");

    let mut first = coordinator.stream_session(&s1).await.unwrap();
    assert_eq!(coordinator.router().full_sessions(), vec![s1.clone()]);
    let _second = coordinator.stream_session(&s2).await.unwrap();
    assert_eq!(coordinator.router().full_sessions(), vec![s2.clone()]);

    // The demoted session's channel ends and it drops to notifications.
    assert!(first.recv().await.is_none());
    let demoted = loop {
        let frame = server.next_outbound_of("subscribe").await;
        if frame["sessionId"] == "s1" && frame["level"] == "notifications" {
            break frame;
        }
    };
    assert!(demoted.get("sinceSeq").is_none());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        coordinator.router().subscription_state(&s1),
        Some(SubscriptionState::Subscribed(SubscriptionLevel::Notifications))
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_fails_every_pending_turn() {
    let server = MemoryConnector::acking_subscriptions();
    let coordinator = coordinator(&server);
    let s1 = SessionId::from_raw("s1");
    let _stream = coordinator.stream_session(&s1).await.unwrap();

    let tasks: Vec<_> = (0..3)
        .map(|i| {
            let (coordinator, s1) = (coordinator.clone(), s1.clone());
            tokio::spawn(async move { coordinator.send_prompt(&s1, &format!("turn {i}")).await })
        })
        .collect();
    for _ in 0..3 {
        server.next_outbound_of("prompt").await;
    }
    assert_eq!(coordinator.connection_state().pending_commands, 3);

    server.drop_connection();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap_err(), StreamError::NotConnected);
    }
    assert_eq!(coordinator.connection_state().pending_commands, 0);
}

#[tokio::test(start_paused = true)]
async fn teardown_resolves_turns_and_commands() {
    let server = MemoryConnector::acking_subscriptions();
    let coordinator = coordinator(&server);
    let s1 = SessionId::from_raw("s1");
    let _stream = coordinator.stream_session(&s1).await.unwrap();
    server.drain_outbound();

    let mut turns = Vec::new();
    for i in 0..2 {
        let (coordinator, s1) = (coordinator.clone(), s1.clone());
        turns.push(tokio::spawn(async move {
            coordinator.send_follow_up(&s1, &format!("later {i}")).await.map(|_| ())
        }));
    }
    let mut commands = Vec::new();
    for _ in 0..2 {
        let (coordinator, s1) = (coordinator.clone(), s1.clone());
        commands.push(tokio::spawn(async move {
            coordinator.request_state(&s1).await.map(|_| ())
        }));
    }
    for _ in 0..4 {
        server.next_outbound().await;
    }
    assert_eq!(coordinator.connection_state().pending_commands, 4);

    coordinator.teardown();
    assert_eq!(coordinator.connection_state().pending_commands, 0);
    for task in turns.into_iter().chain(commands) {
        assert_eq!(task.await.unwrap(), Err(StreamError::NotConnected));
    }
    assert_eq!(coordinator.status(), ConnectionStatus::Disconnected);
    assert_eq!(coordinator.router().tracked_sessions(), Vec::<SessionId>::new());
}

#[tokio::test(start_paused = true)]
async fn send_before_connect_is_not_connected() {
    let server = MemoryConnector::new();
    let coordinator = coordinator(&server);
    let err = coordinator
        .request_state(&SessionId::from_raw("s1"))
        .await
        .unwrap_err();
    assert_eq!(err, StreamError::NotConnected);
    assert!(err.is_reconnect_eligible());
}

#[tokio::test(start_paused = true)]
async fn close_session_unsubscribes_background_session() {
    let server = MemoryConnector::acking_subscriptions();
    let coordinator = coordinator(&server);
    let s1 = SessionId::from_raw("s1");
    let s2 = SessionId::from_raw("s2");
    let _stream = coordinator.stream_session(&s1).await.unwrap();
    coordinator.watch_session(&s2).await.unwrap();
    server.drain_outbound();

    coordinator.close_session(&s2);
    let frame = server.next_outbound_of("unsubscribe").await;
    assert_eq!(frame["sessionId"], "s2");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(coordinator.router().subscription_state(&s2), None);
    assert_eq!(coordinator.router().tracked_sessions(), vec![s1.clone()]);
    assert_eq!(coordinator.connection_state().focused, Some(s1));
}

#[tokio::test(start_paused = true)]
async fn switch_endpoint_moves_subscriptions_to_new_server() {
    let first = MemoryConnector::acking_subscriptions();
    let coordinator = coordinator(&first);
    let s1 = SessionId::from_raw("s1");
    let stream = coordinator.stream_session(&s1).await.unwrap();

    let second = MemoryConnector::acking_subscriptions();
    coordinator.switch_endpoint(Arc::new(second.clone()));
    assert_eq!(coordinator.status(), ConnectionStatus::Disconnected);
    assert_eq!(coordinator.connection_state().focused, None);
    drop(stream);

    let _stream = coordinator.stream_session(&s1).await.unwrap();
    let frame = second.next_outbound_of("subscribe").await;
    assert_eq!(frame["sessionId"], "s1");
    assert_eq!(frame["level"], "full");
    assert_eq!(first.connect_count(), 1);
    assert_eq!(second.connect_count(), 1);
    assert_eq!(coordinator.status(), ConnectionStatus::Connected);
}
