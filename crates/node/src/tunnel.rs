//! Decoy-port listeners
//!
//! Every port forward is an independent TCP listener. Each accepted
//! connection opens its own Tunnel stream to the server, announces the
//! target address and then pumps bytes both ways. Tunnels outlive the
//! listener that accepted them and the Command stream.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use decoynet_core::{pump, send_frame, split, Dialer, PortForwardSpec, StreamOpen, TunnelFrame};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::store::NodeStore;
use crate::{NodeError, Result};

struct Listener {
    spec: PortForwardSpec,
    bound: SocketAddr,
    cancel: CancellationToken,
}

pub struct TunnelManager {
    node_id: String,
    dialer: Arc<dyn Dialer>,
    store: Arc<NodeStore>,
    listeners: DashMap<String, Listener>,
    limiter: Arc<Semaphore>,
    max_tunnels: usize,
    active: Arc<AtomicUsize>,
}

impl TunnelManager {
    pub fn new(node_id: impl Into<String>, dialer: Arc<dyn Dialer>, store: Arc<NodeStore>, max_tunnels: usize) -> Self {
        let max_tunnels = max_tunnels.max(1);
        Self {
            node_id: node_id.into(),
            dialer,
            store,
            listeners: DashMap::new(),
            limiter: Arc::new(Semaphore::new(max_tunnels)),
            max_tunnels,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Re-bind every persisted forward. Returns how many listeners came up;
    /// failures are logged per forward.
    pub async fn start_persisted(&self) -> usize {
        let forwards = match self.store.port_forwards() {
            Ok(forwards) => forwards,
            Err(e) => {
                error!("Could not read persisted port forwards: {}", e);
                return 0;
            }
        };

        let mut started = 0;
        for spec in forwards {
            match self.bind(spec.clone()).await {
                Ok(addr) => {
                    debug!("Restored forward {} -> {}", addr, spec.target_addr);
                    started += 1;
                }
                Err(e) => warn!("Could not restore forward {}: {}", spec.local_addr, e),
            }
        }
        info!("Restored {} decoy listeners", started);
        started
    }

    /// Bind a new forward and persist it
    pub async fn add_forward(&self, spec: PortForwardSpec) -> Result<SocketAddr> {
        let addr = self.bind(spec.clone()).await?;
        self.store.add_port_forward(spec)?;
        Ok(addr)
    }

    async fn bind(&self, spec: PortForwardSpec) -> Result<SocketAddr> {
        if self.listeners.contains_key(&spec.local_addr) {
            return Err(NodeError::AlreadyBound(spec.local_addr));
        }

        let listener = TcpListener::bind(&spec.local_addr).await?;
        let bound = listener.local_addr()?;
        let cancel = CancellationToken::new();

        let key = spec.local_addr.clone();
        self.listeners.insert(
            key,
            Listener {
                spec: spec.clone(),
                bound,
                cancel: cancel.clone(),
            },
        );

        let acceptor = Acceptor {
            node_id: self.node_id.clone(),
            dialer: self.dialer.clone(),
            limiter: self.limiter.clone(),
            max_tunnels: self.max_tunnels,
            active: self.active.clone(),
            target: spec.target_addr.clone(),
        };
        tokio::spawn(acceptor.run(listener, cancel));

        info!("Listening on {} for {}", bound, spec.target_addr);
        Ok(bound)
    }

    /// Close every listener whose local address starts with `ip` and forget
    /// its persisted forward. No match is not an error.
    pub fn close_ip_tunnel(&self, ip: &str) -> Result<usize> {
        let keys: Vec<String> = self
            .listeners
            .iter()
            .filter(|entry| entry.key().starts_with(ip))
            .map(|entry| entry.key().clone())
            .collect();

        let mut closed = 0;
        for key in keys {
            if let Some((_, listener)) = self.listeners.remove(&key) {
                listener.cancel.cancel();
                debug!("Closed listener {}", listener.bound);
                closed += 1;
            }
        }
        self.store.remove_port_forwards_with_prefix(ip)?;

        if closed > 0 {
            info!("Closed {} listeners for {}", closed, ip);
        }
        Ok(closed)
    }

    /// Close all listeners without touching the store
    pub fn close_all(&self) -> usize {
        let keys: Vec<String> = self.listeners.iter().map(|entry| entry.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.listeners.remove(&key))
            .map(|(_, listener)| listener.cancel.cancel())
            .count()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Tunnels currently relaying
    pub fn active_tunnels(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Forwards with a live listener, and the address each is bound to
    pub fn listeners(&self) -> Vec<(PortForwardSpec, SocketAddr)> {
        self.listeners
            .iter()
            .map(|entry| (entry.spec.clone(), entry.bound))
            .collect()
    }
}

/// Accept loop for one listener
struct Acceptor {
    node_id: String,
    dialer: Arc<dyn Dialer>,
    limiter: Arc<Semaphore>,
    max_tunnels: usize,
    active: Arc<AtomicUsize>,
    target: String,
}

impl Acceptor {
    async fn run(self, listener: TcpListener, cancel: CancellationToken) {
        let acceptor = Arc::new(self);
        loop {
            let (socket, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept error on decoy listener: {}", e);
                        continue;
                    }
                },
            };

            let permit = match acceptor.limiter.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(
                        "Dropping connection from {}: {} tunnels already active",
                        peer, acceptor.max_tunnels
                    );
                    drop(socket);
                    continue;
                }
            };

            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Err(e) = acceptor.relay(socket, peer, permit).await {
                    warn!("Tunnel from {} to {} failed: {}", peer, acceptor.target, e);
                }
            });
        }
    }

    async fn relay(&self, socket: TcpStream, peer: SocketAddr, _permit: OwnedSemaphorePermit) -> Result<()> {
        // Counted from accept, so a tunnel still opening is already active
        self.active.fetch_add(1, Ordering::SeqCst);
        let result = self.open_and_pump(socket, peer).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn open_and_pump(&self, socket: TcpStream, peer: SocketAddr) -> Result<()> {
        let _ = socket.set_nodelay(true);
        let stream = self.dialer.open(StreamOpen::tunnel(&self.node_id)).await?;
        let (mut sink, source) = split(stream);
        send_frame(&mut sink, &TunnelFrame::open(self.target.as_str())).await?;

        debug!("Tunnel {} -> {} open", peer, self.target);
        let stats = pump(socket, sink, source).await;

        debug!(
            "Tunnel {} -> {} closed ({} bytes out, {} bytes in)",
            peer, self.target, stats.sent, stats.received
        );
        Ok(())
    }
}
