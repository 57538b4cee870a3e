//! DecoyNet CLI
//!
//! One binary for all three roles: the control-plane server, the node
//! agent that runs on each decoy host, and `ctl` for operators.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use decoynet_core::{
    client_tls_config, server_tls_config, CommandPayload, Dialer, NetScanRequest, NetworkFlushRequest,
    NodeRemoveRequest, PortForwardSpec, ResponsePayload, StreamAcceptor, StreamConnector, TlsPaths,
};
use decoynet_ipc_client::IpcClient;
use decoynet_logging::LogLevel;
use decoynet_node::{ExitReason, NodeAgent};
use decoynet_server::{ControlHandler, IpcConfig, IpcServer, ServerConfig, StreamServer};
use decoynet_settings::{default_settings_path, Settings, TlsSettings};

/// DecoyNet - decoy node control plane
#[derive(Parser)]
#[command(name = "decoynet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control-plane server
    Server {
        /// Stream endpoint listen address
        #[arg(short, long)]
        listen: Option<String>,

        /// Control socket path
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Run the node agent
    Node {
        /// Node identity
        #[arg(long)]
        node_id: Option<String>,

        /// Server stream endpoint
        #[arg(short, long)]
        server: Option<String>,

        /// Decoy port forward (format: local_addr=target_addr), repeatable
        #[arg(short, long)]
        forward: Vec<String>,

        /// Retired decoy IP whose persisted forwards are dropped, repeatable
        #[arg(long)]
        close_ip: Vec<String>,
    },

    /// Operate a running server through its control socket
    Ctl {
        /// Control socket path
        #[arg(long)]
        socket: Option<PathBuf>,

        #[command(subcommand)]
        action: CtlAction,
    },
}

#[derive(Subcommand)]
enum CtlAction {
    /// List known nodes
    Nodes,

    /// Sweep a network for live hosts
    Scan {
        node: String,

        /// CIDR network (e.g. 192.168.1.0/24)
        #[arg(short, long, default_value = "")]
        network: String,

        /// Explicit range list, takes precedence over --network
        #[arg(short, long, default_value = "")]
        range: String,

        /// Addresses never probed, repeatable
        #[arg(short, long)]
        exclude: Vec<String>,

        /// Network record id echoed in results
        #[arg(long, default_value = "0")]
        net_id: i64,

        /// Print results until the scan finishes
        #[arg(short, long)]
        wait: bool,
    },

    /// Report a node's network interfaces
    Flush {
        node: String,

        /// Interface name filter, repeatable
        #[arg(short, long)]
        filter: Vec<String>,
    },

    /// Decommission a node
    Remove { node: String },

    /// Wait for the next response from a node
    Await {
        node: String,

        /// Timeout in seconds
        #[arg(short, long, default_value = "30")]
        timeout: u64,
    },

    /// Drop a node's session
    Close { node: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    decoynet_logging::init(LogLevel::from_verbose(cli.verbose));

    let config_path = cli.config.clone().unwrap_or_else(default_settings_path);
    let settings = Settings::load_from(&config_path)
        .with_context(|| format!("Failed to load settings from {:?}", config_path))?;

    match cli.command {
        Commands::Server { listen, socket } => run_server(settings, listen, socket).await,
        Commands::Node {
            node_id,
            server,
            forward,
            close_ip,
        } => run_node(settings, node_id, server, forward, close_ip).await,
        Commands::Ctl { socket, action } => {
            let socket = socket.unwrap_or_else(|| settings.server.control_socket.clone());
            run_ctl(socket, action).await
        }
    }
}

fn tls_paths(tls: &TlsSettings) -> TlsPaths {
    TlsPaths {
        ca_cert: tls.ca_cert.clone(),
        cert: tls.cert.clone(),
        key: tls.key.clone(),
    }
}

// ============================================================================
// Server
// ============================================================================

async fn run_server(mut settings: Settings, listen: Option<String>, socket: Option<PathBuf>) -> Result<()> {
    if let Some(listen) = listen {
        settings.server.listen_addr = listen;
    }
    if let Some(socket) = socket {
        settings.server.control_socket = socket;
    }

    let config = ServerConfig::from(&settings.server);
    let acceptor = match &settings.tls {
        Some(tls) => {
            let tls_config = server_tls_config(&tls_paths(tls)).context("Failed to load TLS credentials")?;
            StreamAcceptor::with_tls(tls_config)
        }
        None => {
            warn!("No TLS configured; accepting plain TCP streams");
            StreamAcceptor::plain()
        }
    }
    .handshake_timeout(config.handshake_timeout);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("Stream endpoint listening on {}", listener.local_addr()?);

    let server = StreamServer::new(&config, acceptor);

    let mut ipc = IpcServer::new(IpcConfig {
        socket_path: settings.server.control_socket.clone(),
    });
    ipc.set_event_sender(server.directory().event_sender());
    let ipc_cancel = ipc.cancel_token();
    let handler = ControlHandler::new(server.registry(), server.directory());
    let ipc_task = tokio::spawn(async move {
        if let Err(e) = ipc.start(handler).await {
            warn!("Control socket stopped: {}", e);
        }
    });

    let stream_cancel = server.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            stream_cancel.cancel();
        }
    });

    let result = server.run(listener).await;
    ipc_cancel.cancel();
    let _ = ipc_task.await;
    result.context("Stream endpoint failed")
}

// ============================================================================
// Node
// ============================================================================

fn parse_forwards(specs: &[String]) -> Result<Vec<PortForwardSpec>> {
    specs
        .iter()
        .map(|s| PortForwardSpec::parse(s).with_context(|| format!("Invalid forward '{}', expected local=target", s)))
        .collect()
}

async fn run_node(
    mut settings: Settings,
    node_id: Option<String>,
    server: Option<String>,
    forward: Vec<String>,
    close_ip: Vec<String>,
) -> Result<()> {
    if let Some(node_id) = node_id {
        settings.node.node_id = node_id;
    }
    if let Some(server) = server {
        settings.node.server_addr = server;
    }
    let forwards = parse_forwards(&forward)?;

    let node = &settings.node;
    let dialer: Arc<dyn Dialer> = match &settings.tls {
        Some(tls) => {
            let tls_config = client_tls_config(&tls_paths(tls)).context("Failed to load TLS credentials")?;
            Arc::new(
                StreamConnector::with_tls(node.server_addr.as_str(), tls_config, &node.server_name)?
                    .connect_timeout(node.connect_timeout()),
            )
        }
        None => {
            warn!("No TLS configured; connecting over plain TCP");
            Arc::new(StreamConnector::plain(node.server_addr.as_str()).connect_timeout(node.connect_timeout()))
        }
    };

    let agent = Arc::new(NodeAgent::new(node, dialer)?);
    for ip in &close_ip {
        agent
            .close_ip_tunnel(ip)
            .with_context(|| format!("Failed to drop forwards for {}", ip))?;
        info!("Dropped persisted forwards for {}", ip);
    }
    {
        let agent = agent.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Stopping node agent");
                agent.stop();
            }
        });
    }

    match agent.run(forwards).await? {
        ExitReason::Decommissioned => info!("Node decommissioned, exiting"),
        ExitReason::Stopped => info!("Node stopped"),
    }
    Ok(())
}

// ============================================================================
// Ctl
// ============================================================================

async fn run_ctl(socket: PathBuf, action: CtlAction) -> Result<()> {
    let client = IpcClient::new(socket);

    match action {
        CtlAction::Nodes => {
            let nodes = client.nodes().await?;
            if nodes.is_empty() {
                println!("No nodes known");
            }
            for node in nodes {
                let state = if node.online { "online" } else { "offline" };
                let ip = node.registration.as_ref().map(|r| r.ip.as_str()).unwrap_or("-");
                let tunnels = node.resources.as_ref().map(|r| r.active_tunnels).unwrap_or(0);
                println!("{:<24} {:<8} {:<16} tunnels={}", node.node_id, state, ip, tunnels);
            }
        }
        CtlAction::Scan {
            node,
            network,
            range,
            exclude,
            net_id,
            wait,
        } => {
            if network.is_empty() && range.is_empty() {
                bail!("Either --network or --range is required");
            }
            let payload = CommandPayload::NetScan(NetScanRequest {
                network,
                ip_range: range,
                filter_ip_list: exclude,
                net_id,
            });
            let result = client.dispatch(&node, None, payload).await?;
            println!("Dispatched {} as task {}", result.cmd_type, result.task_id);
            if wait {
                loop {
                    let response = client.await_response(&node, Duration::from_secs(300)).await?;
                    let ResponsePayload::NetScan(scan) = response.payload else {
                        print_response(&response.payload)?;
                        continue;
                    };
                    if scan.is_terminal() {
                        match scan.error {
                            Some(error) => println!("Scan failed: {}", error),
                            None => println!("Scan finished"),
                        }
                        break;
                    }
                    println!(
                        "{:<16} {:<18} {:>5.1}%",
                        scan.ip.unwrap_or_default(),
                        scan.mac.unwrap_or_else(|| "-".to_string()),
                        scan.progress
                    );
                }
            }
        }
        CtlAction::Flush { node, filter } => {
            let payload = CommandPayload::NetworkFlush(NetworkFlushRequest { filter_names: filter });
            let result = client.dispatch(&node, None, payload).await?;
            info!("Dispatched task {}", result.task_id);
            let response = client.await_response(&node, Duration::from_secs(30)).await?;
            print_response(&response.payload)?;
        }
        CtlAction::Remove { node } => {
            let payload = CommandPayload::NodeRemove(NodeRemoveRequest {});
            let result = client.dispatch(&node, None, payload).await?;
            info!("Dispatched task {}", result.task_id);
            let response = client.await_response(&node, Duration::from_secs(60)).await?;
            print_response(&response.payload)?;
        }
        CtlAction::Await { node, timeout } => {
            let response = client.await_response(&node, Duration::from_secs(timeout)).await?;
            println!("Task {} from {}", response.task_id, response.node_id);
            print_response(&response.payload)?;
        }
        CtlAction::Close { node } => {
            client.close(&node).await?;
            println!("Closed session for {}", node);
        }
    }

    Ok(())
}

fn print_response(payload: &ResponsePayload) -> Result<()> {
    match payload {
        ResponsePayload::NetworkFlush(flush) => {
            for iface in &flush.interfaces {
                println!("{:<16} {:<16} {:<16} {}", iface.name, iface.address, iface.network, iface.mask);
            }
        }
        ResponsePayload::NodeRemove(ack) => {
            if ack.ok {
                println!("Node removed");
            } else {
                println!("Node removed with errors: {}", ack.message.as_deref().unwrap_or("unknown"));
            }
        }
        ResponsePayload::NetScan(_) => {
            println!("{}", serde_json::to_string_pretty(payload)?);
        }
    }
    Ok(())
}
