//! Periodic resource telemetry
//!
//! Each report is a unary call on its own Resource stream. A failed report
//! is logged and skipped; the next tick tries again.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use decoynet_core::{unary_call, Dialer, NodeResource, ResourceInfo, StreamKind, StreamOpen, METADATA_NODE_ID};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::tunnel::TunnelManager;
use crate::Result;

pub struct ResourceReporter {
    node_id: String,
    dialer: Arc<dyn Dialer>,
    tunnels: Arc<TunnelManager>,
    interval: Duration,
    started: Instant,
}

impl ResourceReporter {
    pub fn new(node_id: impl Into<String>, dialer: Arc<dyn Dialer>, tunnels: Arc<TunnelManager>, interval: Duration) -> Self {
        Self {
            node_id: node_id.into(),
            dialer,
            tunnels,
            interval,
            started: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> NodeResource {
        NodeResource {
            node_uid: self.node_id.clone(),
            resource_info: ResourceInfo {
                active_tunnels: self.tunnels.active_tunnels() as u32,
                listeners: self.tunnels.listener_count() as u32,
                uptime_secs: self.started.elapsed().as_secs(),
                load_average: load_average(),
                timestamp: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
            },
        }
    }

    pub async fn report_once(&self) -> Result<()> {
        let open = StreamOpen::new(StreamKind::Resource).with_metadata(METADATA_NODE_ID, self.node_id.as_str());
        unary_call(self.dialer.as_ref(), open, &self.snapshot()).await?;
        Ok(())
    }

    /// Report every interval until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.report_once().await {
                Ok(()) => debug!("Resource report sent"),
                Err(e) => warn!("Resource report failed: {}", e),
            }
        }
    }
}

/// 1-minute load average from /proc/loadavg
fn load_average() -> Option<f64> {
    let content = std::fs::read_to_string("/proc/loadavg").ok()?;
    parse_loadavg(&content)
}

fn parse_loadavg(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}
