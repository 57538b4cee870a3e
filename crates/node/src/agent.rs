//! Node agent
//!
//! Builds every component from [`NodeSettings`] and runs them until the
//! connection manager exits.

use std::sync::Arc;
use std::time::Duration;

use decoynet_core::{Dialer, PortForwardSpec};
use decoynet_settings::NodeSettings;
use tracing::{info, warn};

use crate::connection::{ConnectionConfig, ConnectionManager, ExitReason, ResponseQueue};
use crate::dispatcher::Dispatcher;
use crate::handlers::flush::{InterfaceSource, SystemInterfaces};
use crate::handlers::remove::IpLinkDecoys;
use crate::handlers::scan::{ScanConfig, TcpProber};
use crate::reconnect::Backoff;
use crate::registration::build_registration;
use crate::resource::ResourceReporter;
use crate::store::NodeStore;
use crate::tunnel::TunnelManager;
use crate::{NodeError, Result};

pub struct NodeAgent {
    node_id: String,
    tunnels: Arc<TunnelManager>,
    reporter: Arc<ResourceReporter>,
    manager: Arc<ConnectionManager>,
}

impl NodeAgent {
    pub fn new(settings: &NodeSettings, dialer: Arc<dyn Dialer>) -> Result<Self> {
        Self::with_interfaces(settings, dialer, Arc::new(SystemInterfaces))
    }

    /// Build with a custom interface source (used for registration and
    /// NetworkFlush)
    pub fn with_interfaces(
        settings: &NodeSettings,
        dialer: Arc<dyn Dialer>,
        interfaces: Arc<dyn InterfaceSource>,
    ) -> Result<Self> {
        let node_id = settings.node_id.trim().to_string();
        if node_id.is_empty() {
            return Err(NodeError::Config("node_id is not set".to_string()));
        }

        let store = Arc::new(NodeStore::open(&settings.state_dir)?);
        let responses = Arc::new(ResponseQueue::new(Duration::from_millis(settings.submit_timeout_ms)));
        let tunnels = Arc::new(TunnelManager::new(
            node_id.as_str(),
            dialer.clone(),
            store.clone(),
            settings.max_tunnels,
        ));

        let dispatcher = Dispatcher::new(node_id.as_str(), responses.clone(), store, tunnels.clone())
            .with_prober(Arc::new(TcpProber::from(&settings.scan)))
            .with_scan_config(ScanConfig::from(&settings.scan))
            .with_interfaces(interfaces.clone())
            .with_decoys(Arc::new(IpLinkDecoys::new(settings.decoy_interface_prefix.as_str())));

        let config = ConnectionConfig {
            node_id: node_id.clone(),
            backoff: Backoff::from(&settings.reconnect),
            response_queue_capacity: settings.response_queue_capacity,
            connect_timeout: settings.connect_timeout(),
        };
        let manager = ConnectionManager::new(config, dialer.clone(), Arc::new(dispatcher), responses)
            .with_registration(build_registration(&node_id, interfaces.as_ref()));

        let reporter = ResourceReporter::new(
            node_id.as_str(),
            dialer,
            tunnels.clone(),
            Duration::from_secs(settings.resource_interval_secs.max(1)),
        );

        Ok(Self {
            node_id,
            tunnels,
            reporter: Arc::new(reporter),
            manager: Arc::new(manager),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    /// Retire a decoy IP: close its listeners and drop its persisted
    /// forwards. Safe to call before `run`, in which case the forwards are
    /// simply not restored.
    pub fn close_ip_tunnel(&self, ip: &str) -> Result<usize> {
        self.tunnels.close_ip_tunnel(ip)
    }

    /// Ask the agent to stop without waiting; `run` then returns
    /// `ExitReason::Stopped`
    pub fn stop(&self) {
        self.manager.stop();
    }

    /// Stop and wait for the connection manager to finish
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }

    /// Restore persisted forwards, add `forwards`, then run until stopped
    /// or decommissioned.
    pub async fn run(&self, forwards: Vec<PortForwardSpec>) -> Result<ExitReason> {
        info!("Starting node agent {}", self.node_id);

        self.tunnels.start_persisted().await;
        for spec in forwards {
            match self.tunnels.add_forward(spec.clone()).await {
                Ok(addr) => info!("Forwarding {} -> {}", addr, spec.target_addr),
                Err(NodeError::AlreadyBound(_)) => {}
                Err(e) => warn!("Could not add forward {}: {}", spec.local_addr, e),
            }
        }

        let reporting = self.manager.cancel_token().child_token();
        let reporter = self.reporter.clone();
        let telemetry = {
            let reporting = reporting.clone();
            tokio::spawn(async move { reporter.run(reporting).await })
        };

        let reason = self.manager.run().await;

        reporting.cancel();
        let _ = telemetry.await;
        if reason == ExitReason::Stopped {
            self.tunnels.close_all();
        }

        info!("Node agent {} exiting: {:?}", self.node_id, reason);
        Ok(reason)
    }
}
