//! Command stream lifecycle
//!
//! The manager dials the server, registers, opens the Command stream and
//! runs a send loop and a receive loop over it. Any failure drops back to
//! `Disconnected` and a retry is scheduled with exponential backoff until
//! the manager is stopped or the node is decommissioned.

use std::sync::Arc;
use std::time::Duration;

use decoynet_core::{
    recv_frame, send_frame, split, unary_call, CommandRequest, CommandResponse, CoreError, Dialer, RegisterRequest,
    StreamKind, StreamOpen, DEFAULT_HANDSHAKE_TIMEOUT, METADATA_NODE_ID,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::reconnect::{Backoff, ConnectionEvent, ConnectionState, ReconnectState};
use crate::{NodeError, Result};

/// Item on the outbound queue
#[derive(Debug)]
pub enum Outbound {
    Response(CommandResponse),
    /// Completed once every earlier item has been written
    Flush(oneshot::Sender<()>),
}

/// Outbound response queue.
///
/// A fresh channel is attached on every connect, so responses submitted
/// while disconnected are lost rather than replayed.
pub struct ResponseQueue {
    current: Mutex<Option<mpsc::Sender<Outbound>>>,
    submit_timeout: Duration,
}

impl ResponseQueue {
    pub fn new(submit_timeout: Duration) -> Self {
        Self {
            current: Mutex::new(None),
            submit_timeout,
        }
    }

    /// Replace the current channel with a new one of `capacity`
    pub fn attach(&self, capacity: usize) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *self.current.lock() = Some(tx);
        rx
    }

    pub fn detach(&self) {
        self.current.lock().take();
    }

    pub fn is_attached(&self) -> bool {
        self.current.lock().is_some()
    }

    fn sender(&self) -> Result<mpsc::Sender<Outbound>> {
        self.current.lock().clone().ok_or(NodeError::Disconnected)
    }

    /// Queue a response, waiting at most the submit timeout for space
    pub async fn submit(&self, response: CommandResponse) -> Result<()> {
        let tx = self.sender()?;
        match tx.send_timeout(Outbound::Response(response), self.submit_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(NodeError::QueueFull),
            Err(SendTimeoutError::Closed(_)) => Err(NodeError::Disconnected),
        }
    }

    /// Wait until everything queued so far has been written to the stream
    pub async fn flush(&self) -> Result<()> {
        let tx = self.sender()?;
        let (done_tx, done_rx) = oneshot::channel();
        let wait = async {
            tx.send(Outbound::Flush(done_tx))
                .await
                .map_err(|_| NodeError::Disconnected)?;
            done_rx.await.map_err(|_| NodeError::Disconnected)
        };
        tokio::time::timeout(self.submit_timeout, wait)
            .await
            .map_err(|_| NodeError::QueueFull)?
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub node_id: String,
    pub backoff: Backoff,
    pub response_queue_capacity: usize,
    /// Bound on registering and opening the Command stream
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            backoff: Backoff::default(),
            response_queue_capacity: 10,
            connect_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Why [`ConnectionManager::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Stopped,
    /// A NodeRemove command was executed; the node must not reconnect
    Decommissioned,
}

enum SessionEnd {
    Lost,
    Cancelled,
    Decommissioned,
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    dialer: Arc<dyn Dialer>,
    dispatcher: Arc<Dispatcher>,
    responses: Arc<ResponseQueue>,
    registration: Option<RegisterRequest>,
    state: Mutex<ReconnectState>,
    cancel: CancellationToken,
    running: watch::Sender<bool>,
}

/// Clears the running flag however `run` exits
struct RunningGuard<'a>(&'a watch::Sender<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        dialer: Arc<dyn Dialer>,
        dispatcher: Arc<Dispatcher>,
        responses: Arc<ResponseQueue>,
    ) -> Self {
        let state = Mutex::new(ReconnectState::new(config.backoff.clone()));
        Self {
            config,
            dialer,
            dispatcher,
            responses,
            registration: None,
            state,
            cancel: CancellationToken::new(),
            running: watch::Sender::new(false),
        }
    }

    /// Register with this payload before every Command stream attempt
    pub fn with_registration(mut self, registration: RegisterRequest) -> Self {
        self.registration = Some(registration);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().state()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal the manager to stop without waiting. `run` returns once its
    /// loops and any pending reconnect timer have unwound; use
    /// [`shutdown`](Self::shutdown) to wait for that.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait until `run` has returned
    pub async fn shutdown(&self) {
        self.stop();
        let mut running = self.running.subscribe();
        let _ = running.wait_for(|running| !*running).await;
    }

    fn apply(&self, event: ConnectionEvent) -> Option<Duration> {
        self.state.lock().apply(event)
    }

    /// Connect and keep reconnecting until stopped or decommissioned
    pub async fn run(&self) -> ExitReason {
        self.running.send_replace(true);
        let _guard = RunningGuard(&self.running);
        self.run_loop().await
    }

    async fn run_loop(&self) -> ExitReason {
        loop {
            if self.cancel.is_cancelled() {
                self.apply(ConnectionEvent::Stop);
                return ExitReason::Stopped;
            }

            self.apply(ConnectionEvent::Attempt);
            let delay = match self.connect_once().await {
                Ok(SessionEnd::Decommissioned) => {
                    self.apply(ConnectionEvent::Stop);
                    self.cancel.cancel();
                    info!("Node {} decommissioned", self.config.node_id);
                    return ExitReason::Decommissioned;
                }
                Ok(SessionEnd::Cancelled) => {
                    self.apply(ConnectionEvent::Stop);
                    return ExitReason::Stopped;
                }
                Ok(SessionEnd::Lost) => {
                    warn!("Command stream lost");
                    self.apply(ConnectionEvent::Failed)
                }
                Err(e) => {
                    warn!("Connection attempt failed: {}", e);
                    self.apply(ConnectionEvent::Failed)
                }
            };

            let delay = delay.unwrap_or_else(|| self.state.lock().backoff().current());
            info!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.apply(ConnectionEvent::Stop);
                    return ExitReason::Stopped;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect_once(&self) -> Result<SessionEnd> {
        let node_id = &self.config.node_id;

        let handshake = async {
            if let Some(registration) = &self.registration {
                let open = StreamOpen::new(StreamKind::Register).with_metadata(METADATA_NODE_ID, node_id.as_str());
                unary_call(self.dialer.as_ref(), open, registration).await?;
                debug!("Registered as {}", node_id);
            }
            let stream = self.dialer.open(StreamOpen::command(node_id)).await?;
            Ok::<_, CoreError>(stream)
        };

        // A server that accepts but never answers must not stall reconnection
        let stream = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            result = tokio::time::timeout(self.config.connect_timeout, handshake) => match result {
                Ok(stream) => stream?,
                Err(_) => {
                    warn!("No answer from server within {:?}", self.config.connect_timeout);
                    return Err(CoreError::Timeout.into());
                }
            },
        };
        self.apply(ConnectionEvent::Established);
        info!("Command stream to server open as {}", node_id);

        let (mut sink, mut source) = split(stream);
        let mut outbound = self.responses.attach(self.config.response_queue_capacity);
        let session = self.cancel.child_token();

        let send_loop = async {
            loop {
                let item = tokio::select! {
                    _ = session.cancelled() => break,
                    item = outbound.recv() => match item {
                        Some(item) => item,
                        None => break,
                    },
                };
                match item {
                    Outbound::Response(response) => {
                        debug!("Sending {} response (task {})", response.cmd_type(), response.task_id);
                        if let Err(e) = send_frame(&mut sink, &response).await {
                            warn!("Send failed: {}", e);
                            break;
                        }
                    }
                    Outbound::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            session.cancel();
        };

        let recv_loop = async {
            let end = loop {
                let frame = tokio::select! {
                    _ = session.cancelled() => break self.end_reason(),
                    frame = recv_frame::<_, CommandRequest>(&mut source) => frame,
                };
                match frame {
                    Ok(Some(request)) => {
                        debug!("Received {} (task {})", request.cmd_type(), request.task_id);
                        if self.dispatcher.dispatch(request).await == DispatchOutcome::Decommission {
                            if let Err(e) = self.responses.flush().await {
                                warn!("Decommission acknowledgement not confirmed: {}", e);
                            }
                            break SessionEnd::Decommissioned;
                        }
                    }
                    Ok(None) => {
                        debug!("Server closed the command stream");
                        break SessionEnd::Lost;
                    }
                    Err(e) if e.is_decode() => {
                        warn!("Dropping undecodable command: {}", e);
                    }
                    Err(e) => {
                        warn!("Receive failed: {}", e);
                        break SessionEnd::Lost;
                    }
                }
            };
            session.cancel();
            end
        };

        let ((), end) = tokio::join!(send_loop, recv_loop);
        self.responses.detach();
        Ok(end)
    }

    fn end_reason(&self) -> SessionEnd {
        if self.cancel.is_cancelled() {
            SessionEnd::Cancelled
        } else {
            SessionEnd::Lost
        }
    }
}
