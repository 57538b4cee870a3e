//! Shared fixtures: a real server on loopback and node agents dialing it

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use decoynet_core::{Dialer, InterfaceInfo, PortForwardSpec, StreamAcceptor, StreamConnector};
use decoynet_node::{ExitReason, InterfaceSource, NodeAgent};
use decoynet_server::{ServerConfig, StreamServer};
use decoynet_settings::{NodeSettings, ReconnectSettings};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Start a plain-TCP server on an ephemeral loopback port
pub async fn start_server(config: ServerConfig) -> (StreamServer, SocketAddr) {
    decoynet_logging::init_test();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = StreamServer::new(&config, StreamAcceptor::plain());
    let running = server.clone();
    tokio::spawn(async move { running.run(listener).await });
    (server, addr)
}

pub fn node_settings(node_id: &str, server: SocketAddr, state_dir: &Path) -> NodeSettings {
    NodeSettings {
        node_id: node_id.to_string(),
        server_addr: server.to_string(),
        state_dir: state_dir.to_path_buf(),
        resource_interval_secs: 3600,
        reconnect: ReconnectSettings {
            floor_secs: 1,
            ceiling_secs: 2,
            multiplier: 2,
        },
        ..Default::default()
    }
}

/// Fixed interface list so results do not depend on the test host
pub struct StaticInterfaces(pub Vec<(&'static str, &'static str)>);

impl InterfaceSource for StaticInterfaces {
    fn interfaces(&self) -> Vec<InterfaceInfo> {
        self.0
            .iter()
            .map(|(name, address)| InterfaceInfo {
                name: name.to_string(),
                address: address.to_string(),
                network: "10.20.0.0".to_string(),
                mask: "255.255.255.0".to_string(),
            })
            .collect()
    }

    fn mac_address(&self, _name: &str) -> Option<String> {
        Some("02:00:00:00:00:aa".to_string())
    }
}

pub fn default_interfaces() -> Arc<StaticInterfaces> {
    Arc::new(StaticInterfaces(vec![
        ("lo", "127.0.0.1"),
        ("eth0", "10.20.0.5"),
        ("hy-0", "10.20.0.50"),
        ("hy-1", "10.20.0.51"),
    ]))
}

pub fn start_agent(
    settings: &NodeSettings,
    forwards: Vec<PortForwardSpec>,
) -> (Arc<NodeAgent>, JoinHandle<decoynet_node::Result<ExitReason>>) {
    let dialer: Arc<dyn Dialer> = Arc::new(StreamConnector::plain(settings.server_addr.as_str()));
    let agent = Arc::new(NodeAgent::with_interfaces(settings, dialer, default_interfaces()).unwrap());
    let running = agent.clone();
    let handle = tokio::spawn(async move { running.run(forwards).await });
    (agent, handle)
}

/// Poll `check` until it holds or five seconds pass
pub async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
