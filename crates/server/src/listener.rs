//! Stream endpoint
//!
//! Accepts node connections and routes each by the kind named in its
//! opening frame.

use std::sync::Arc;
use std::time::Duration;

use decoynet_core::{
    expect_frame, send_frame, Ack, FramedStream, NodeResource, RegisterRequest, StreamAcceptor, StreamKind,
    StreamOpen, DEFAULT_HANDSHAKE_TIMEOUT,
};
use decoynet_settings::ServerSettings;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::directory::NodeDirectory;
use crate::registry::{RegistryConfig, SessionRegistry};
use crate::relay::TunnelRelay;
use crate::{Result, ServerError};

/// Stream server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub handshake_timeout: Duration,
    pub dial_timeout: Duration,
    pub max_tunnels: usize,
    pub registry: RegistryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7443".to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            dial_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_tunnels: 4096,
            registry: RegistryConfig::default(),
        }
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            listen_addr: settings.listen_addr.clone(),
            handshake_timeout: settings.handshake_timeout(),
            dial_timeout: settings.dial_timeout(),
            max_tunnels: settings.max_tunnels,
            registry: RegistryConfig::from(&settings.session),
        }
    }
}

#[derive(Clone)]
pub struct StreamServer {
    acceptor: StreamAcceptor,
    registry: Arc<SessionRegistry>,
    directory: Arc<NodeDirectory>,
    relay: Arc<TunnelRelay>,
    cancel: CancellationToken,
}

impl StreamServer {
    pub fn new(config: &ServerConfig, acceptor: StreamAcceptor) -> Self {
        let directory = Arc::new(NodeDirectory::new());
        let registry = Arc::new(SessionRegistry::new(config.registry.clone(), directory.clone()));
        Self {
            acceptor: acceptor.handshake_timeout(config.handshake_timeout),
            registry,
            directory,
            relay: Arc::new(
                TunnelRelay::new(config.max_tunnels, config.dial_timeout).open_timeout(config.handshake_timeout),
            ),
            cancel: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn directory(&self) -> Arc<NodeDirectory> {
        self.directory.clone()
    }

    pub fn relay(&self) -> Arc<TunnelRelay> {
        self.relay.clone()
    }

    /// Cancelling this token stops the accept loop
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Accept connections until cancelled
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("Stream endpoint listening on {}", addr);
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Stream endpoint shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((tcp, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(tcp).await {
                                debug!("Connection from {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_connection(&self, tcp: TcpStream) -> Result<()> {
        let (open, stream) = self.acceptor.accept(tcp).await?;
        debug!("Accepted {} stream", open.kind);

        match open.kind {
            StreamKind::Command => {
                let result = self.registry.open_session(&open, stream).await;
                if let Err(ServerError::MissingIdentity) = &result {
                    warn!("Rejected command stream without a node id");
                }
                result
            }
            StreamKind::Tunnel => {
                let node_id = open.node_id().unwrap_or("unknown").to_string();
                self.relay.serve(&node_id, stream).await.map(|_| ())
            }
            StreamKind::Register => self.handle_register(stream).await,
            StreamKind::Resource => self.handle_resource(&open, stream).await,
        }
    }

    async fn handle_register(&self, mut stream: FramedStream) -> Result<()> {
        let request: RegisterRequest = expect_frame(&mut stream).await?;
        let ack = match self.directory.register(request) {
            Ok(()) => Ack::ok(),
            Err(msg) => {
                warn!("Registration rejected: {}", msg);
                Ack::rejected(msg)
            }
        };
        send_frame(&mut stream, &ack).await?;
        Ok(())
    }

    async fn handle_resource(&self, open: &StreamOpen, mut stream: FramedStream) -> Result<()> {
        let report: NodeResource = expect_frame(&mut stream).await?;
        if let Some(node_id) = open.node_id() {
            if node_id != report.node_uid {
                debug!("Resource report for {} arrived on a stream opened by {}", report.node_uid, node_id);
            }
        }
        let ack = match self.directory.report(report) {
            Ok(()) => Ack::ok(),
            Err(msg) => Ack::rejected(msg),
        };
        send_frame(&mut stream, &ack).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use decoynet_core::{unary_call, CoreError, Dialer, ResourceInfo, StreamConnector};

    async fn start() -> (StreamServer, String) {
        let config = ServerConfig {
            handshake_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let server = StreamServer::new(&config, StreamAcceptor::plain());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let running = server.clone();
        tokio::spawn(async move { running.run(listener).await });
        (server, addr)
    }

    #[tokio::test]
    async fn test_register_is_acknowledged() {
        let (server, addr) = start().await;
        let connector = StreamConnector::plain(addr);
        let request = RegisterRequest {
            node_uid: "edge-1".to_string(),
            ip: "10.0.0.1".to_string(),
            ..Default::default()
        };
        unary_call(&connector, StreamOpen::new(StreamKind::Register), &request)
            .await
            .unwrap();

        let record = server.directory().get("edge-1").unwrap();
        assert_eq!(record.registration.unwrap().ip, "10.0.0.1");
        server.cancel_token().cancel();
    }

    #[tokio::test]
    async fn test_resource_report() {
        let (server, addr) = start().await;
        let connector = StreamConnector::plain(addr);
        let report = NodeResource {
            node_uid: "edge-2".to_string(),
            resource_info: ResourceInfo {
                listeners: 5,
                ..Default::default()
            },
        };
        unary_call(&connector, StreamOpen::new(StreamKind::Resource), &report)
            .await
            .unwrap();
        assert_eq!(server.directory().get("edge-2").unwrap().resources.unwrap().listeners, 5);
    }

    #[tokio::test]
    async fn test_command_stream_registers_session() {
        let (server, addr) = start().await;
        let connector = StreamConnector::plain(addr);
        let _stream = connector.open(StreamOpen::command("edge-3")).await.unwrap();

        let registry = server.registry();
        for _ in 0..100 {
            if registry.is_connected("edge-3") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(registry.is_connected("edge-3"));
        assert!(server.directory().get("edge-3").unwrap().online);
    }

    // ==================== NEGATIVE TESTS ====================

    #[tokio::test]
    async fn test_register_without_uid_is_rejected() {
        let (_server, addr) = start().await;
        let connector = StreamConnector::plain(addr);
        let result = unary_call(
            &connector,
            StreamOpen::new(StreamKind::Register),
            &RegisterRequest::default(),
        )
        .await;
        assert!(matches!(result, Err(CoreError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_command_stream_without_identity_is_closed() {
        let (server, addr) = start().await;
        let connector = StreamConnector::plain(addr);
        let mut stream = connector.open(StreamOpen::new(StreamKind::Command)).await.unwrap();

        let frame: decoynet_core::Result<Option<Ack>> = decoynet_core::recv_frame(&mut stream).await;
        assert!(matches!(frame, Ok(None) | Err(_)));
        assert!(server.registry().is_empty());
    }
}
