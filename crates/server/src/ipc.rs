//! Operator control socket
//!
//! JSON-RPC 2.0, one request per line, over a Unix socket. Presence
//! changes are pushed to every connected client as `presence`
//! notifications between responses.
//!
//! ## Methods
//!
//! - `nodes` - known nodes with registration, telemetry and presence
//! - `dispatch` - queue a command: `{node_id, task_id?, payload}`
//! - `await` - next response from a node: `{node_id, timeout_ms?}`
//! - `close` - tear down a node's session: `{node_id}`

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use decoynet_core::{CommandPayload, CommandRequest};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::directory::{NodeDirectory, PresenceEvent};
use crate::registry::SessionRegistry;
use crate::{Result, ServerError};

const DEFAULT_AWAIT_TIMEOUT_MS: u64 = 30_000;

/// IPC server configuration
#[derive(Debug, Clone)]
pub struct IpcConfig {
    pub socket_path: PathBuf,
}

impl Default for IpcConfig {
    fn default() -> Self {
        let runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            socket_path: PathBuf::from(runtime).join("decoynet.sock"),
        }
    }
}

/// JSON-RPC request
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Option<serde_json::Value>,
    pub id: serde_json::Value,
}

/// JSON-RPC response
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcError>,
    pub id: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

impl JsonRpcResponse {
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: serde_json::Value, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError { code, message }),
            id,
        }
    }
}

/// Server-initiated notification (no id)
#[derive(Debug, Serialize)]
struct JsonRpcNotification<'a, T: Serialize> {
    jsonrpc: &'static str,
    method: &'a str,
    params: T,
}

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = std::result::Result<serde_json::Value, String>> + Send + 'a>>;

/// Handler for IPC requests
pub trait IpcHandler: Send + Sync {
    fn handle(&self, method: &str, params: Option<serde_json::Value>) -> HandlerFuture<'_>;
}

pub struct IpcServer {
    config: IpcConfig,
    cancel: CancellationToken,
    event_tx: Option<broadcast::Sender<PresenceEvent>>,
}

impl IpcServer {
    pub fn new(config: IpcConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            event_tx: None,
        }
    }

    /// Stream presence events to every client
    pub fn set_event_sender(&mut self, tx: broadcast::Sender<PresenceEvent>) {
        self.event_tx = Some(tx);
    }

    /// Cancelling this token stops the server and removes the socket file
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.config.socket_path
    }

    /// Serve until cancelled
    pub async fn start<H: IpcHandler + 'static>(&self, handler: H) -> Result<()> {
        if self.config.socket_path.exists() {
            std::fs::remove_file(&self.config.socket_path)?;
        }
        if let Some(parent) = self.config.socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let listener = UnixListener::bind(&self.config.socket_path)
            .map_err(|e| ServerError::IpcError(format!("Failed to bind: {}", e)))?;
        info!("Control socket listening on {:?}", self.config.socket_path);

        let handler = Arc::new(handler);
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, _addr)) => {
                        let handler = handler.clone();
                        let event_rx = self.event_tx.as_ref().map(|tx| tx.subscribe());
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_connection(stream, handler, event_rx).await {
                                warn!("Control connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
                _ = self.cancel.cancelled() => {
                    info!("Control socket shutting down");
                    break;
                }
            }
        }

        let _ = std::fs::remove_file(&self.config.socket_path);
        Ok(())
    }

    async fn handle_connection<H: IpcHandler + 'static>(
        stream: UnixStream,
        handler: Arc<H>,
        event_rx: Option<broadcast::Receiver<PresenceEvent>>,
    ) -> Result<()> {
        let (reader, writer) = stream.into_split();
        let writer = Arc::new(tokio::sync::Mutex::new(writer));

        let request_writer = writer.clone();
        let request_task = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Read error: {}", e);
                        break;
                    }
                }
                if line.trim().is_empty() {
                    continue;
                }
                debug!("Received: {}", line.trim());

                let response = match serde_json::from_str::<JsonRpcRequest>(&line) {
                    Ok(request) if request.jsonrpc != "2.0" => JsonRpcResponse::error(
                        request.id,
                        -32600,
                        "Invalid Request: jsonrpc must be '2.0'".to_string(),
                    ),
                    Ok(request) => match handler.handle(&request.method, request.params).await {
                        Ok(result) => JsonRpcResponse::success(request.id, result),
                        Err(msg) => JsonRpcResponse::error(request.id, -32000, msg),
                    },
                    Err(e) => JsonRpcResponse::error(serde_json::Value::Null, -32700, format!("Parse error: {}", e)),
                };

                let encoded = match serde_json::to_string(&response) {
                    Ok(s) => s,
                    Err(e) => {
                        error!("Serialize error: {}", e);
                        break;
                    }
                };
                let mut w = request_writer.lock().await;
                if write_line(&mut *w, &encoded).await.is_err() {
                    break;
                }
            }
        });

        let event_task = event_rx.map(|mut rx| {
            let event_writer = writer.clone();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            let notification = JsonRpcNotification {
                                jsonrpc: "2.0",
                                method: "presence",
                                params: &event,
                            };
                            let Ok(encoded) = serde_json::to_string(&notification) else {
                                continue;
                            };
                            let mut w = event_writer.lock().await;
                            if write_line(&mut *w, &encoded).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Presence stream lagged, missed {} events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        });

        let _ = request_task.await;
        if let Some(task) = event_task {
            task.abort();
        }
        Ok(())
    }
}

async fn write_line<W: AsyncWrite + Unpin>(w: &mut W, line: &str) -> std::io::Result<()> {
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await?;
    w.flush().await
}

#[derive(Debug, Deserialize)]
struct NodeParams {
    node_id: String,
}

#[derive(Debug, Deserialize)]
struct DispatchParams {
    node_id: String,
    #[serde(default)]
    task_id: Option<String>,
    payload: CommandPayload,
}

#[derive(Debug, Deserialize)]
struct AwaitParams {
    node_id: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<serde_json::Value>) -> std::result::Result<T, String> {
    let params = params.ok_or_else(|| "Missing params".to_string())?;
    serde_json::from_value(params).map_err(|e| format!("Invalid params: {}", e))
}

/// Control methods backed by the session registry and node directory
pub struct ControlHandler {
    registry: Arc<SessionRegistry>,
    directory: Arc<NodeDirectory>,
}

impl ControlHandler {
    pub fn new(registry: Arc<SessionRegistry>, directory: Arc<NodeDirectory>) -> Self {
        Self { registry, directory }
    }

    fn nodes(&self) -> std::result::Result<serde_json::Value, String> {
        let mut records = self.directory.list();
        for record in &mut records {
            record.online = self.registry.is_connected(&record.node_id);
        }
        serde_json::to_value(records).map_err(|e| e.to_string())
    }

    async fn dispatch(&self, params: DispatchParams) -> std::result::Result<serde_json::Value, String> {
        let task_id = params.task_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let request = CommandRequest::new(task_id.clone(), params.node_id.clone(), params.payload);
        let cmd_type = request.cmd_type();
        self.registry
            .dispatch(&params.node_id, request)
            .await
            .map_err(|e| e.to_string())?;
        info!("Dispatched {} (task {}) to {}", cmd_type, task_id, params.node_id);
        Ok(serde_json::json!({ "task_id": task_id, "cmd_type": cmd_type.to_string() }))
    }

    async fn await_response(&self, params: AwaitParams) -> std::result::Result<serde_json::Value, String> {
        let timeout = Duration::from_millis(params.timeout_ms.unwrap_or(DEFAULT_AWAIT_TIMEOUT_MS));
        let response = self
            .registry
            .await_response(&params.node_id, timeout)
            .await
            .map_err(|e| e.to_string())?;
        serde_json::to_value(response).map_err(|e| e.to_string())
    }
}

impl IpcHandler for ControlHandler {
    fn handle(&self, method: &str, params: Option<serde_json::Value>) -> HandlerFuture<'_> {
        let method = method.to_string();
        Box::pin(async move {
            match method.as_str() {
                "nodes" => self.nodes(),
                "dispatch" => self.dispatch(parse_params(params)?).await,
                "await" => self.await_response(parse_params(params)?).await,
                "close" => {
                    let params: NodeParams = parse_params(params)?;
                    self.registry.close(&params.node_id);
                    Ok(serde_json::json!({ "closed": params.node_id }))
                }
                other => Err(format!("Method not found: {}", other)),
            }
        })
    }
}
