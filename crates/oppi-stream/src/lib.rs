//! # oppi-stream
//!
//! Session streaming and command correlation over one multiplexed socket
//! per server.
//!
//! Leaf-first:
//!
//! - [`waiter`]: single-resolution result holder and the send-timeout race
//! - [`socket`]: connector seam (`tokio-tungstenite` implementation)
//! - [`transport`]: one physical connection with heartbeat and backoff
//! - [`registry`]: request-ID correlation, staged turn acknowledgements
//! - [`router`]: per-session channels, focus, resubscription
//! - [`watchdog`]: zombie-connection detection for the busy session
//! - [`coordinator`]: wires everything together for one server
//!
//! [`testing::MemoryConnector`] drives the engine in-process for tests.

#![deny(unsafe_code)]

pub mod config;
pub mod coordinator;
pub mod events;
pub mod registry;
pub mod router;
pub mod socket;
pub mod telemetry;
pub mod testing;
pub mod transport;
pub mod waiter;
pub mod watchdog;

pub use config::{
    CoordinatorConfig, RegistryConfig, RouterConfig, TransportConfig, WatchdogConfig,
};
pub use coordinator::{ConnectionCoordinator, ConnectionSnapshot, ReconnectHandler};
pub use events::ConnectionEvent;
pub use registry::{CommandRegistry, CommandSink, StageObserver, TurnAttempt, TurnOutcome};
pub use router::{FrameHook, SessionStream, SubscriptionRouter, SubscriptionState};
pub use socket::{Connector, Socket, SocketSink, WireMessage, WsConnector};
pub use transport::{ConnectionStatus, StreamTransport, TransportEvent, TransportEvents};
pub use waiter::Waiter;
pub use watchdog::{LivenessDelegate, LivenessWatchdog, WatchdogAction};
