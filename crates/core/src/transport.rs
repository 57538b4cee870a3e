//! Stream transport
//!
//! Plain TCP for lab use, mutual TLS in deployment. Both sides exchange
//! [`StreamOpen`] as the first frame so the server can route the
//! connection before reading anything else.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{ClientConfig, ServerConfig, ServerName};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::{expect_frame, framed, send_frame, Ack, CoreError, FramedStream, Result, StreamOpen};

/// Default bound on TCP connect and on the opening handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Object-safe duplex byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens streams to the server.
///
/// The node agent is generic over this so tests can substitute in-memory
/// connections for real sockets.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Connect and announce `open` as the first frame
    async fn open(&self, open: StreamOpen) -> Result<FramedStream>;
}

/// Perform a unary call: open, send one request, read one [`Ack`].
///
/// A negative acknowledgement is returned as [`CoreError::Rejected`].
pub async fn unary_call<D, T>(dialer: &D, open: StreamOpen, request: &T) -> Result<()>
where
    D: Dialer + ?Sized,
    T: Serialize + Sync,
{
    let mut stream = dialer.open(open).await?;
    send_frame(&mut stream, request).await?;
    let ack: Ack = expect_frame(&mut stream).await?;
    if ack.ok {
        Ok(())
    } else {
        Err(CoreError::Rejected(ack.message.unwrap_or_default()))
    }
}

struct TlsClient {
    connector: TlsConnector,
    server_name: ServerName,
}

/// TCP (optionally TLS) dialer for the server's stream endpoint
pub struct StreamConnector {
    addr: String,
    tls: Option<TlsClient>,
    connect_timeout: Duration,
}

impl StreamConnector {
    /// Plain TCP connector
    pub fn plain(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            tls: None,
            connect_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Mutual TLS connector; `server_name` must match the server certificate
    pub fn with_tls(addr: impl Into<String>, config: Arc<ClientConfig>, server_name: &str) -> Result<Self> {
        let server_name = ServerName::try_from(server_name)
            .map_err(|_| CoreError::InvalidServerName(server_name.to_string()))?;
        Ok(Self {
            addr: addr.into(),
            tls: Some(TlsClient {
                connector: TlsConnector::from(config),
                server_name,
            }),
            connect_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        })
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> Result<BoxedStream> {
        // The deadline covers the TLS handshake as well as the TCP connect
        let dial = async {
            let tcp = TcpStream::connect(&self.addr).await?;
            tcp.set_nodelay(true)?;
            let io: BoxedStream = match &self.tls {
                Some(tls) => Box::new(tls.connector.connect(tls.server_name.clone(), tcp).await?),
                None => Box::new(tcp),
            };
            Ok::<_, CoreError>(io)
        };
        tokio::time::timeout(self.connect_timeout, dial)
            .await
            .map_err(|_| CoreError::Timeout)?
    }
}

#[async_trait]
impl Dialer for StreamConnector {
    async fn open(&self, open: StreamOpen) -> Result<FramedStream> {
        debug!("Opening {} stream to {}", open.kind, self.addr);
        let io = self.connect().await?;
        let mut stream = framed(io);
        send_frame(&mut stream, &open).await?;
        Ok(stream)
    }
}

/// Server side of the stream endpoint
#[derive(Clone)]
pub struct StreamAcceptor {
    tls: Option<TlsAcceptor>,
    handshake_timeout: Duration,
}

impl StreamAcceptor {
    pub fn plain() -> Self {
        Self {
            tls: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_tls(config: Arc<ServerConfig>) -> Self {
        Self {
            tls: Some(TlsAcceptor::from(config)),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Complete the TLS handshake (if configured) and read the opening frame
    pub async fn accept(&self, tcp: TcpStream) -> Result<(StreamOpen, FramedStream)> {
        tcp.set_nodelay(true)?;
        let handshake = async {
            let io: BoxedStream = match &self.tls {
                Some(acceptor) => Box::new(acceptor.accept(tcp).await?),
                None => Box::new(tcp),
            };
            let mut stream = framed(io);
            let open: StreamOpen = expect_frame(&mut stream).await?;
            Ok::<_, CoreError>((open, stream))
        };

        tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| CoreError::Timeout)?
    }
}
