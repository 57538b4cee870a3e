//! Server end of Tunnel streams
//!
//! Each Tunnel stream names its backend in the opening frame. The relay
//! dials that address once and pumps bytes until either side closes.

use std::sync::Arc;
use std::time::Duration;

use decoynet_core::{expect_frame, pump, split, FramedStream, TunnelFrame, TunnelStats};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::{Result, ServerError};

pub struct TunnelRelay {
    limiter: Arc<Semaphore>,
    max_tunnels: usize,
    dial_timeout: Duration,
    open_timeout: Duration,
}

impl TunnelRelay {
    pub fn new(max_tunnels: usize, dial_timeout: Duration) -> Self {
        let max_tunnels = max_tunnels.max(1);
        Self {
            limiter: Arc::new(Semaphore::new(max_tunnels)),
            max_tunnels,
            dial_timeout,
            open_timeout: dial_timeout,
        }
    }

    /// How long a stream may hold a slot before naming its target
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Tunnels currently being relayed
    pub fn active(&self) -> usize {
        self.max_tunnels - self.limiter.available_permits()
    }

    /// Relay one Tunnel stream. Streams over the concurrency cap are
    /// closed before anything is dialed.
    pub async fn serve(&self, node_id: &str, stream: FramedStream) -> Result<TunnelStats> {
        let _permit = match self.limiter.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    "Rejecting tunnel from {}: {} tunnels already active",
                    node_id, self.max_tunnels
                );
                return Err(ServerError::TunnelRejected(format!(
                    "limit of {} tunnels reached",
                    self.max_tunnels
                )));
            }
        };

        let (sink, mut source) = split(stream);
        let first: TunnelFrame = match tokio::time::timeout(self.open_timeout, expect_frame(&mut source)).await {
            Ok(first) => first?,
            Err(_) => {
                warn!("Tunnel from {} sent no opening frame within {:?}", node_id, self.open_timeout);
                return Err(ServerError::Timeout(node_id.to_string()));
            }
        };
        if first.address.is_empty() {
            return Err(ServerError::TunnelRejected("missing target address".to_string()));
        }

        let mut target = match tokio::time::timeout(self.dial_timeout, TcpStream::connect(&first.address)).await {
            Ok(Ok(target)) => target,
            Ok(Err(e)) => {
                warn!("Tunnel from {} could not reach {}: {}", node_id, first.address, e);
                return Err(ServerError::DialFailed(format!("{}: {}", first.address, e)));
            }
            Err(_) => {
                warn!("Tunnel from {} timed out dialing {}", node_id, first.address);
                return Err(ServerError::DialFailed(format!("{}: timed out", first.address)));
            }
        };
        let _ = target.set_nodelay(true);

        // Peers should send an address-only opening frame, but accept a payload too
        if !first.chunk.is_empty() {
            target.write_all(&first.chunk).await?;
        }

        debug!("Tunnel from {} connected to {}", node_id, first.address);
        let stats = pump(target, sink, source).await;
        info!(
            "Tunnel {} -> {} closed ({} bytes in, {} bytes out)",
            node_id, first.address, stats.sent, stats.received
        );
        Ok(stats)
    }
}
