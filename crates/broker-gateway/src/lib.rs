//! WebSocket fan-out layer for the interaction broker.
//!
//! Wires [`broker_core`]'s store/broker onto a subscriber registry, a
//! fan-out router, and a WebSocket transport, following the module split
//! `astrid-gateway::discord_proxy` uses for its own upstream connection
//! (protocol / connection / heartbeat), generalized here to a server
//! accepting many downstream connections instead of one upstream one.

pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod subscriber;
pub mod sweeper;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use registry::SubscriberRegistry;
pub use router::FanoutRouter;
pub use server::GatewayServer;
