//! IPC Client implementation

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use decoynet_core::{CommandPayload, CommandResponse};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use crate::protocol::{DispatchResult, NodeInfo, RpcMessage, RpcRequest};
use crate::{IpcError, Result};

/// Client for the server control socket.
///
/// Each request uses its own connection.
pub struct IpcClient {
    socket_path: PathBuf,
    request_id: AtomicU64,
}

impl IpcClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            request_id: AtomicU64::new(1),
        }
    }

    /// Connect and verify the server answers
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let client = Self::new(socket_path.to_path_buf());
        client.nodes().await?;
        Ok(client)
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a raw JSON-RPC request
    pub async fn send_request(&self, method: &str, params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound || e.kind() == std::io::ErrorKind::ConnectionRefused {
                IpcError::ServerNotRunning
            } else {
                IpcError::ConnectionFailed(e.to_string())
            }
        })?;

        let (reader, mut writer) = stream.into_split();
        let request = RpcRequest::new(method, params, self.next_id());
        let request_json = serde_json::to_string(&request)?;
        debug!("Sending request: {}", request_json);

        writer.write_all(request_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        // Presence notifications may arrive ahead of the response
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let message = loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Err(IpcError::InvalidResponse("connection closed".to_string()));
            }
            let message: RpcMessage =
                serde_json::from_str(&line).map_err(|e| IpcError::InvalidResponse(e.to_string()))?;
            if message.is_notification() {
                debug!("Skipping notification: {}", line.trim());
                continue;
            }
            break message;
        };
        debug!("Received response: {}", line.trim());

        if let Some(error) = message.error {
            return Err(IpcError::ServerError {
                code: error.code,
                message: error.message,
            });
        }

        Ok(message.result.unwrap_or(serde_json::Value::Null))
    }

    /// Known nodes with presence
    pub async fn nodes(&self) -> Result<Vec<NodeInfo>> {
        let result = self.send_request("nodes", None).await?;
        serde_json::from_value(result).map_err(|e| IpcError::InvalidResponse(e.to_string()))
    }

    /// Queue a command for a node
    pub async fn dispatch(&self, node_id: &str, task_id: Option<&str>, payload: CommandPayload) -> Result<DispatchResult> {
        let params = serde_json::json!({
            "node_id": node_id,
            "task_id": task_id,
            "payload": payload,
        });
        let result = self.send_request("dispatch", Some(params)).await?;
        serde_json::from_value(result).map_err(|e| IpcError::InvalidResponse(e.to_string()))
    }

    /// Wait for the next response from a node
    pub async fn await_response(&self, node_id: &str, timeout: Duration) -> Result<CommandResponse> {
        let params = serde_json::json!({
            "node_id": node_id,
            "timeout_ms": timeout.as_millis() as u64,
        });
        let result = self.send_request("await", Some(params)).await?;
        serde_json::from_value(result).map_err(|e| IpcError::InvalidResponse(e.to_string()))
    }

    /// Tear down a node's session
    pub async fn close(&self, node_id: &str) -> Result<()> {
        let params = serde_json::json!({ "node_id": node_id });
        self.send_request("close", Some(params)).await?;
        Ok(())
    }
}
