//! DecoyNet Server
//!
//! Server half of the node control plane.
//!
//! ## Components
//!
//! - **SessionRegistry**: one command session per connected node; `dispatch`
//!   and `await_response` are the orchestration-facing surface
//! - **TunnelRelay**: dials the backend named by each Tunnel stream and
//!   relays bytes both ways
//! - **NodeDirectory**: registration records, telemetry and presence
//! - **StreamServer**: accepts connections and routes them by stream kind
//! - **IpcServer**: JSON-RPC 2.0 control socket for operators

mod directory;
mod ipc;
mod listener;
mod registry;
mod relay;

pub use directory::{NodeDirectory, NodeRecord, PresenceEvent};
pub use ipc::{ControlHandler, IpcConfig, IpcHandler, IpcServer};
pub use listener::{ServerConfig, StreamServer};
pub use registry::{NoopPresence, PresenceSink, RegistryConfig, SessionRegistry, RESPONSE_SEND_TIMEOUT};
pub use relay::TunnelRelay;

use decoynet_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Missing node identity in stream metadata")]
    MissingIdentity,

    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Timed out waiting for a response from {0}")]
    Timeout(String),

    #[error("Tunnel rejected: {0}")]
    TunnelRejected(String),

    #[error("Dial failed: {0}")]
    DialFailed(String),

    #[error("Transport error: {0}")]
    Transport(#[from] CoreError),

    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
