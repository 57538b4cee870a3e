//! DecoyNet Node
//!
//! The agent that runs on each decoy host. It keeps one reconnecting
//! Command stream to the server, executes the commands it receives and
//! relays decoy-port connections back to the server as Tunnel streams.
//!
//! ## Components
//!
//! - **ReconnectState**: connection state machine and exponential backoff
//! - **ConnectionManager**: owns the Command stream and the response queue
//! - **Dispatcher**: routes each command to its handler
//! - **TunnelManager**: decoy-port listeners and their Tunnel streams
//! - **NodeStore**: persisted port forwards and task records
//! - **ResourceReporter**: periodic telemetry
//! - **NodeAgent**: wires the above together from settings

mod agent;
mod connection;
mod dispatcher;
mod handlers;
mod reconnect;
mod registration;
mod resource;
mod store;
mod tunnel;

pub use agent::NodeAgent;
pub use connection::{ConnectionConfig, ConnectionManager, ExitReason, Outbound, ResponseQueue};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use handlers::flush::{is_filtered, InterfaceSource, SystemInterfaces};
pub use handlers::remove::{DecoyInterfaces, IpLinkDecoys};
pub use handlers::scan::{parse_targets, HostProber, ScanConfig, TcpProber};
pub use reconnect::{transition, Backoff, ConnectionEvent, ConnectionState, ReconnectState};
pub use registration::build_registration;
pub use resource::ResourceReporter;
pub use store::{NodeStore, TaskRecord};
pub use tunnel::TunnelManager;

use decoynet_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Transport error: {0}")]
    Transport(#[from] CoreError),

    #[error("Not connected to the server")]
    Disconnected,

    #[error("Response queue full")]
    QueueFull,

    #[error("Invalid scan range: {0}")]
    InvalidRange(String),

    #[error("Listener already bound: {0}")]
    AlreadyBound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;
