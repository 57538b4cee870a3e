//! Command dispatch
//!
//! Routes every request from the Command stream to its handler by payload
//! type. NetScan runs in the background and streams its results; the other
//! commands complete before the next request is read.

use std::sync::Arc;

use decoynet_core::{CmdType, CommandPayload, CommandRequest, CommandResponse, ResponsePayload};
use decoynet_settings::ScanSettings;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::ResponseQueue;
use crate::handlers::flush::{self, InterfaceSource, SystemInterfaces};
use crate::handlers::remove::{self, DecoyInterfaces, IpLinkDecoys};
use crate::handlers::scan::{self, HostProber, ScanConfig, TcpProber};
use crate::store::{NodeStore, TaskRecord};
use crate::tunnel::TunnelManager;

/// What the connection should do after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Continue,
    /// The node has been torn down and must exit
    Decommission,
}

pub struct Dispatcher {
    node_id: String,
    responses: Arc<ResponseQueue>,
    store: Arc<NodeStore>,
    tunnels: Arc<TunnelManager>,
    prober: Arc<dyn HostProber>,
    scan_config: ScanConfig,
    interfaces: Arc<dyn InterfaceSource>,
    decoys: Arc<dyn DecoyInterfaces>,
    scans: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        node_id: impl Into<String>,
        responses: Arc<ResponseQueue>,
        store: Arc<NodeStore>,
        tunnels: Arc<TunnelManager>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            responses,
            store,
            tunnels,
            prober: Arc::new(TcpProber::from(&ScanSettings::default())),
            scan_config: ScanConfig::default(),
            interfaces: Arc::new(SystemInterfaces),
            decoys: Arc::new(IpLinkDecoys::new("hy-")),
            scans: CancellationToken::new(),
        }
    }

    pub fn with_prober(mut self, prober: Arc<dyn HostProber>) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_scan_config(mut self, config: ScanConfig) -> Self {
        self.scan_config = config;
        self
    }

    pub fn with_interfaces(mut self, interfaces: Arc<dyn InterfaceSource>) -> Self {
        self.interfaces = interfaces;
        self
    }

    pub fn with_decoys(mut self, decoys: Arc<dyn DecoyInterfaces>) -> Self {
        self.decoys = decoys;
        self
    }

    pub async fn dispatch(&self, request: CommandRequest) -> DispatchOutcome {
        let cmd_type = request.cmd_type();
        if let Err(e) = self.store.add_task(TaskRecord::new(request.task_id.as_str(), cmd_type)) {
            warn!("Could not record task {}: {}", request.task_id, e);
        }

        match request.payload {
            CommandPayload::NetScan(ref scan_request) => {
                self.spawn_scan(request.task_id.clone(), scan_request.clone());
                DispatchOutcome::Continue
            }
            CommandPayload::NetworkFlush(ref flush_request) => {
                let result = flush::run(flush_request, self.interfaces.as_ref());
                debug!("NetworkFlush reporting {} interfaces", result.interfaces.len());
                self.reply(&request, ResponsePayload::NetworkFlush(result)).await;
                self.finish_task(&request.task_id);
                DispatchOutcome::Continue
            }
            CommandPayload::NodeRemove(_) => {
                info!("NodeRemove received (task {})", request.task_id);
                self.scans.cancel();
                let ack = remove::decommission(self.decoys.as_ref(), &self.tunnels, &self.store).await;
                if !ack.ok {
                    warn!("Decommission finished with errors");
                }
                self.reply(&request, ResponsePayload::NodeRemove(ack)).await;
                DispatchOutcome::Decommission
            }
        }
    }

    async fn reply(&self, request: &CommandRequest, payload: ResponsePayload) {
        let response = CommandResponse::new(request.task_id.as_str(), self.node_id.as_str(), payload);
        if let Err(e) = self.responses.submit(response).await {
            warn!("Dropping {} response (task {}): {}", request.cmd_type(), request.task_id, e);
        }
    }

    fn finish_task(&self, task_id: &str) {
        if let Err(e) = self.store.remove_task(task_id) {
            warn!("Could not clear task {}: {}", task_id, e);
        }
    }

    fn spawn_scan(&self, task_id: String, request: decoynet_core::NetScanRequest) {
        let node_id = self.node_id.clone();
        let responses = self.responses.clone();
        let store = self.store.clone();
        let prober = self.prober.clone();
        let config = self.scan_config.clone();
        let cancel = self.scans.child_token();

        tokio::spawn(async move {
            let emit = |result| {
                let response = CommandResponse::new(task_id.as_str(), node_id.as_str(), ResponsePayload::NetScan(result));
                let responses = responses.clone();
                async move {
                    if let Err(e) = responses.submit(response).await {
                        warn!("Dropping {} result: {}", CmdType::NetScan, e);
                    }
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => info!("NetScan task {} cancelled", task_id),
                _ = scan::run(&request, prober.as_ref(), &config, emit) => {
                    if let Err(e) = store.remove_task(&task_id) {
                        warn!("Could not clear task {}: {}", task_id, e);
                    }
                }
            }
        });
    }
}
