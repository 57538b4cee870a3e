//! DecoyNet IPC Client
//!
//! Talks to the server's control socket (JSON-RPC 2.0, one message per
//! line). Used by `decoynet ctl`.

mod client;
mod protocol;

pub use client::IpcClient;
pub use protocol::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Server is not running (no control socket)")]
    ServerNotRunning,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Server error {code}: {message}")]
    ServerError { code: i32, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IpcError>;
