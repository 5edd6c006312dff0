#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use oppi_stream::testing::MemoryConnector;
use oppi_stream::{ConnectionCoordinator, ConnectionEvent, CoordinatorConfig};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

pub fn coordinator(server: &MemoryConnector) -> ConnectionCoordinator {
    ConnectionCoordinator::new(Arc::new(server.clone()), CoordinatorConfig::default(), None)
}

/// Next event matching `pred`, skipping everything else.
pub async fn next_event<F>(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    pred: F,
) -> ConnectionEvent
where
    F: Fn(&ConnectionEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(600), wait)
        .await
        .expect("timed out waiting for event")
}
