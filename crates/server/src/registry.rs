//! Per-node command sessions
//!
//! Each node holds exactly one Command stream. The registry owns the
//! session map and is the only way to reach a node: `dispatch` pushes a
//! request onto the node's outbound queue, `await_response` pops from its
//! inbound queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use decoynet_core::{recv_frame, send_frame, split, CommandRequest, CommandResponse, FramedStream, StreamOpen};
use decoynet_settings::SessionSettings;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Result, ServerError};

/// Deadline for parking a received response in a full inbound queue
pub const RESPONSE_SEND_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Receives presence flips as sessions open and close
pub trait PresenceSink: Send + Sync + 'static {
    fn set_online(&self, node_id: &str, online: bool);
}

/// Presence sink that ignores every change
pub struct NoopPresence;

impl PresenceSink for NoopPresence {
    fn set_online(&self, _node_id: &str, _online: bool) {}
}

/// Queue sizing for new sessions
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub outbound_capacity: usize,
    pub inbound_capacity: usize,
    /// Responses that cannot be queued within this window are dropped
    pub response_send_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_QUEUE_CAPACITY,
            inbound_capacity: DEFAULT_QUEUE_CAPACITY,
            response_send_timeout: RESPONSE_SEND_TIMEOUT,
        }
    }
}

impl From<&SessionSettings> for RegistryConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            outbound_capacity: settings.outbound_capacity.max(1),
            inbound_capacity: settings.inbound_capacity.max(1),
            response_send_timeout: Duration::from_millis(settings.response_send_timeout_ms),
        }
    }
}

struct NodeSession {
    node_id: String,
    outbound: Mutex<Option<mpsc::Sender<CommandRequest>>>,
    inbound_tx: mpsc::Sender<CommandResponse>,
    inbound_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<CommandResponse>>>,
    closed: Mutex<bool>,
    cancel: CancellationToken,
    response_send_timeout: Duration,
}

impl NodeSession {
    /// Returns false if the session was already closed
    fn close(&self) -> bool {
        let mut closed = self.closed.lock();
        if *closed {
            return false;
        }
        *closed = true;

        self.cancel.cancel();
        self.outbound.lock().take();

        let inbound = self.inbound_rx.clone();
        let node_id = self.node_id.clone();
        tokio::spawn(async move {
            let mut rx = inbound.lock().await;
            rx.close();
            let mut discarded = 0usize;
            while rx.try_recv().is_ok() {
                discarded += 1;
            }
            if discarded > 0 {
                debug!("Discarded {} unread responses from {}", discarded, node_id);
            }
        });
        true
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    async fn deliver(&self, response: CommandResponse) {
        match self.inbound_tx.send_timeout(response, self.response_send_timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(response)) => {
                warn!(
                    "Inbound queue for {} full for {:?}, dropping {} response (task {})",
                    self.node_id,
                    self.response_send_timeout,
                    response.cmd_type(),
                    response.task_id
                );
            }
            Err(SendTimeoutError::Closed(_)) => {
                debug!("Session {} closed, discarding response", self.node_id);
            }
        }
    }
}

/// Registry of live node sessions
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<NodeSession>>>,
    config: RegistryConfig,
    presence: Arc<dyn PresenceSink>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig, presence: Arc<dyn PresenceSink>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            presence,
        }
    }

    /// Serve one inbound Command stream until it ends.
    ///
    /// Registers the node named in `open`, runs the send and receive loops,
    /// and unregisters on exit. A later session for the same node id
    /// replaces this one in the map and stops it.
    pub async fn open_session(&self, open: &StreamOpen, stream: FramedStream) -> Result<()> {
        let node_id = open.node_id().ok_or(ServerError::MissingIdentity)?.to_string();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<CommandRequest>(self.config.outbound_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel::<CommandResponse>(self.config.inbound_capacity);
        let session = Arc::new(NodeSession {
            node_id: node_id.clone(),
            outbound: Mutex::new(Some(outbound_tx)),
            inbound_tx,
            inbound_rx: Arc::new(tokio::sync::Mutex::new(inbound_rx)),
            closed: Mutex::new(false),
            cancel: CancellationToken::new(),
            response_send_timeout: self.config.response_send_timeout,
        });

        let previous = self.sessions.write().insert(node_id.clone(), session.clone());
        if let Some(previous) = previous {
            warn!("Node {} opened a second session, replacing the old one", node_id);
            previous.close();
        }
        info!("Node {} connected", node_id);
        self.presence.set_online(&node_id, true);

        let (mut sink, mut source) = split(stream);

        let send_session = session.clone();
        let send_loop = tokio::spawn(async move {
            let cancel = send_session.cancel.clone();
            loop {
                let request = tokio::select! {
                    _ = cancel.cancelled() => break,
                    request = outbound_rx.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };
                debug!("Sending {} (task {}) to {}", request.cmd_type(), request.task_id, send_session.node_id);
                if let Err(e) = send_frame(&mut sink, &request).await {
                    warn!("Send to {} failed: {}", send_session.node_id, e);
                    break;
                }
            }
            send_session.close();
        });

        let recv_session = session.clone();
        let recv_loop = tokio::spawn(async move {
            let cancel = recv_session.cancel.clone();
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = recv_frame::<_, CommandResponse>(&mut source) => frame,
                };
                match frame {
                    Ok(Some(response)) => {
                        debug!(
                            "Received {} response (task {}) from {}",
                            response.cmd_type(),
                            response.task_id,
                            recv_session.node_id
                        );
                        recv_session.deliver(response).await;
                    }
                    Ok(None) => {
                        debug!("Node {} closed its command stream", recv_session.node_id);
                        break;
                    }
                    Err(e) if e.is_decode() => {
                        warn!("Dropping undecodable frame from {}: {}", recv_session.node_id, e);
                    }
                    Err(e) => {
                        warn!("Receive from {} failed: {}", recv_session.node_id, e);
                        break;
                    }
                }
            }
            recv_session.close();
        });

        let _ = tokio::join!(send_loop, recv_loop);

        session.close();
        let still_present = {
            let mut sessions = self.sessions.write();
            if sessions.get(&node_id).is_some_and(|current| Arc::ptr_eq(current, &session)) {
                sessions.remove(&node_id);
            }
            sessions.contains_key(&node_id)
        };
        if !still_present {
            self.presence.set_online(&node_id, false);
        }
        info!("Node {} disconnected", node_id);
        Ok(())
    }

    fn lookup(&self, node_id: &str) -> Result<Arc<NodeSession>> {
        self.sessions
            .read()
            .get(node_id)
            .cloned()
            .ok_or_else(|| ServerError::NotFound(node_id.to_string()))
    }

    /// Queue a command for a node, waiting while its outbound queue is full
    pub async fn dispatch(&self, node_id: &str, request: CommandRequest) -> Result<()> {
        let session = self.lookup(node_id)?;
        let sender = session
            .outbound
            .lock()
            .clone()
            .ok_or_else(|| ServerError::SessionClosed(node_id.to_string()))?;

        debug!("Dispatching {} (task {}) to {}", request.cmd_type(), request.task_id, node_id);
        sender
            .send(request)
            .await
            .map_err(|_| ServerError::SessionClosed(node_id.to_string()))
    }

    /// Wait up to `timeout` for the next response from a node
    pub async fn await_response(&self, node_id: &str, timeout: Duration) -> Result<CommandResponse> {
        let session = self.lookup(node_id)?;
        if session.is_closed() {
            return Err(ServerError::SessionClosed(node_id.to_string()));
        }

        let wait = async {
            let mut rx = session.inbound_rx.lock().await;
            // A response already delivered wins over a concurrent close
            tokio::select! {
                biased;
                response = rx.recv() => response,
                _ = session.cancel.cancelled() => None,
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(ServerError::SessionClosed(node_id.to_string())),
            Err(_) => Err(ServerError::Timeout(node_id.to_string())),
        }
    }

    /// Tear down a node's session. Closing an unknown or closed node is a no-op.
    pub fn close(&self, node_id: &str) {
        let session = self.sessions.write().remove(node_id);
        if let Some(session) = session {
            if session.close() {
                info!("Closed session for {}", node_id);
            }
        }
    }

    /// Connected node ids, sorted
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.sessions.read().keys().cloned().collect();
        nodes.sort();
        nodes
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.sessions.read().contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use decoynet_core::{
        expect_frame, framed, CommandPayload, NetworkFlushRequest, NetworkFlushResponse, ResponsePayload, StreamKind,
    };

    #[derive(Default)]
    struct RecordingPresence {
        changes: Mutex<Vec<(String, bool)>>,
    }

    impl PresenceSink for RecordingPresence {
        fn set_online(&self, node_id: &str, online: bool) {
            self.changes.lock().push((node_id.to_string(), online));
        }
    }

    fn registry_with(config: RegistryConfig) -> (Arc<SessionRegistry>, Arc<RecordingPresence>) {
        let presence = Arc::new(RecordingPresence::default());
        (Arc::new(SessionRegistry::new(config, presence.clone())), presence)
    }

    /// Start a session for `node_id` and return the node's end of the stream
    fn connect(registry: &Arc<SessionRegistry>, node_id: &str) -> (FramedStream, tokio::task::JoinHandle<Result<()>>) {
        let (server_io, node_io) = tokio::io::duplex(64 * 1024);
        let registry = registry.clone();
        let open = StreamOpen::command(node_id);
        let handle = tokio::spawn(async move { registry.open_session(&open, framed(Box::new(server_io))).await });
        (framed(Box::new(node_io)), handle)
    }

    async fn wait_connected(registry: &SessionRegistry, node_id: &str) {
        for _ in 0..100 {
            if registry.is_connected(node_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{} never connected", node_id);
    }

    fn flush_request(task: &str, node: &str) -> CommandRequest {
        CommandRequest::new(task, node, CommandPayload::NetworkFlush(NetworkFlushRequest::default()))
    }

    fn flush_response(task: &str, node: &str) -> CommandResponse {
        CommandResponse::new(
            task,
            node,
            ResponsePayload::NetworkFlush(NetworkFlushResponse { interfaces: vec![] }),
        )
    }

    #[tokio::test]
    async fn test_dispatch_and_await() {
        let (registry, _) = registry_with(RegistryConfig::default());
        let (mut node, _handle) = connect(&registry, "node-1");
        wait_connected(&registry, "node-1").await;

        registry.dispatch("node-1", flush_request("t1", "node-1")).await.unwrap();
        let request: CommandRequest = expect_frame(&mut node).await.unwrap();
        assert_eq!(request.task_id, "t1");

        send_frame(&mut node, &CommandResponse::reply(&request, ResponsePayload::NetworkFlush(Default::default())))
            .await
            .unwrap();
        let response = registry.await_response("node-1", Duration::from_secs(2)).await.unwrap();
        assert_eq!(response.task_id, "t1");
        assert_eq!(response.node_id, "node-1");
    }

    #[tokio::test]
    async fn test_presence_flips() {
        let (registry, presence) = registry_with(RegistryConfig::default());
        let (node, handle) = connect(&registry, "node-p");
        wait_connected(&registry, "node-p").await;

        drop(node);
        handle.await.unwrap().unwrap();

        assert!(!registry.is_connected("node-p"));
        let changes = presence.changes.lock().clone();
        assert_eq!(
            changes,
            vec![("node-p".to_string(), true), ("node-p".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_second_session_replaces_first() {
        let (registry, presence) = registry_with(RegistryConfig::default());
        let (_first, first_handle) = connect(&registry, "dup");
        wait_connected(&registry, "dup").await;
        let (mut second, _second_handle) = connect(&registry, "dup");

        // The first session is stopped once the second replaces it
        first_handle.await.unwrap().unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.is_connected("dup"));
        assert!(!presence.changes.lock().contains(&("dup".to_string(), false)));

        registry.dispatch("dup", flush_request("t2", "dup")).await.unwrap();
        let request: CommandRequest = expect_frame(&mut second).await.unwrap();
        assert_eq!(request.task_id, "t2");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (registry, _) = registry_with(RegistryConfig::default());
        let (_node, handle) = connect(&registry, "node-c");
        wait_connected(&registry, "node-c").await;

        registry.close("node-c");
        registry.close("node-c");
        registry.close("never-seen");

        handle.await.unwrap().unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_responses_queue_while_nobody_awaits() {
        let (registry, _) = registry_with(RegistryConfig::default());
        let (mut node, _handle) = connect(&registry, "node-q");
        wait_connected(&registry, "node-q").await;

        for i in 0..3 {
            send_frame(&mut node, &flush_response(&format!("t{}", i), "node-q")).await.unwrap();
        }
        for i in 0..3 {
            let response = registry.await_response("node-q", Duration::from_secs(2)).await.unwrap();
            assert_eq!(response.task_id, format!("t{}", i));
        }
    }

    #[tokio::test]
    async fn test_full_inbound_queue_drops_response() {
        let config = RegistryConfig {
            inbound_capacity: 1,
            response_send_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let (registry, _) = registry_with(config);
        let (mut node, _handle) = connect(&registry, "node-d");
        wait_connected(&registry, "node-d").await;

        send_frame(&mut node, &flush_response("kept", "node-d")).await.unwrap();
        send_frame(&mut node, &flush_response("dropped", "node-d")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let response = registry.await_response("node-d", Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.task_id, "kept");
        let result = registry.await_response("node-d", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ServerError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_skipped() {
        use futures::SinkExt;

        let (registry, _) = registry_with(RegistryConfig::default());
        let (mut node, _handle) = connect(&registry, "node-u");
        wait_connected(&registry, "node-u").await;

        node.send(bytes_of(&[0xff, 0xff])).await.unwrap();
        send_frame(&mut node, &flush_response("after", "node-u")).await.unwrap();

        let response = registry.await_response("node-u", Duration::from_secs(2)).await.unwrap();
        assert_eq!(response.task_id, "after");
        assert!(registry.is_connected("node-u"));
    }

    fn bytes_of(data: &[u8]) -> bytes::Bytes {
        bytes::Bytes::copy_from_slice(data)
    }

    #[test]
    fn test_config_from_settings() {
        let settings = SessionSettings {
            outbound_capacity: 0,
            inbound_capacity: 4,
            response_send_timeout_ms: 250,
        };
        let config = RegistryConfig::from(&settings);
        assert_eq!(config.outbound_capacity, 1);
        assert_eq!(config.inbound_capacity, 4);
        assert_eq!(config.response_send_timeout, Duration::from_millis(250));
    }

    // ==================== NEGATIVE TESTS ====================

    #[tokio::test]
    async fn test_missing_identity() {
        let (registry, _) = registry_with(RegistryConfig::default());
        let (server_io, _node_io) = tokio::io::duplex(1024);
        let open = StreamOpen::new(StreamKind::Command);
        let result = registry.open_session(&open, framed(Box::new(server_io))).await;
        assert!(matches!(result, Err(ServerError::MissingIdentity)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_unknown_node() {
        let (registry, _) = registry_with(RegistryConfig::default());
        let result = registry.dispatch("ghost", flush_request("t", "ghost")).await;
        assert!(matches!(result, Err(ServerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_await_unknown_node() {
        let (registry, _) = registry_with(RegistryConfig::default());
        let result = registry.await_response("ghost", Duration::from_millis(10)).await;
        assert!(matches!(result, Err(ServerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_await_times_out() {
        let (registry, _) = registry_with(RegistryConfig::default());
        let (_node, _handle) = connect(&registry, "quiet");
        wait_connected(&registry, "quiet").await;
        let result = registry.await_response("quiet", Duration::from_millis(30)).await;
        assert!(matches!(result, Err(ServerError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_pending_await_ends_when_node_drops() {
        let (registry, _) = registry_with(RegistryConfig::default());
        let (node, _handle) = connect(&registry, "flaky");
        wait_connected(&registry, "flaky").await;

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.await_response("flaky", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(node);

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ServerError::SessionClosed(_))));
    }
}
