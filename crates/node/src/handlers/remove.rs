//! NodeRemove: fail-stop decommission
//!
//! Removes decoy interfaces, closes every decoy listener and wipes the
//! state store. Cleanup failures are reported in the acknowledgement but
//! never stop the decommission.

use async_trait::async_trait;
use decoynet_core::NodeRemoveResponse;
use pnet::datalink;
use tracing::{info, warn};

use crate::store::NodeStore;
use crate::tunnel::TunnelManager;
use crate::{NodeError, Result};

/// Decoy network interfaces owned by this agent
#[async_trait]
pub trait DecoyInterfaces: Send + Sync + 'static {
    /// Delete all decoy interfaces, returning how many were removed
    async fn remove_decoys(&self) -> Result<usize>;
}

/// Deletes interfaces named with a fixed prefix using `ip link delete`
pub struct IpLinkDecoys {
    prefix: String,
}

impl IpLinkDecoys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    fn decoy_names(&self) -> Vec<String> {
        if self.prefix.is_empty() {
            return Vec::new();
        }
        datalink::interfaces()
            .into_iter()
            .map(|iface| iface.name)
            .filter(|name| name.starts_with(&self.prefix))
            .collect()
    }
}

#[async_trait]
impl DecoyInterfaces for IpLinkDecoys {
    async fn remove_decoys(&self) -> Result<usize> {
        let mut removed = 0;
        let mut failures = Vec::new();

        for name in self.decoy_names() {
            let status = tokio::process::Command::new("ip")
                .args(["link", "delete", &name])
                .status()
                .await;
            match status {
                Ok(status) if status.success() => {
                    info!("Removed decoy interface {}", name);
                    removed += 1;
                }
                Ok(status) => failures.push(format!("{}: ip exited with {}", name, status)),
                Err(e) => failures.push(format!("{}: {}", name, e)),
            }
        }

        if failures.is_empty() {
            Ok(removed)
        } else {
            Err(NodeError::Cleanup(failures.join("; ")))
        }
    }
}

/// Clear everything this node owns and build the acknowledgement
pub async fn decommission(decoys: &dyn DecoyInterfaces, tunnels: &TunnelManager, store: &NodeStore) -> NodeRemoveResponse {
    let mut failures = Vec::new();

    match decoys.remove_decoys().await {
        Ok(n) => info!("Removed {} decoy interfaces", n),
        Err(e) => {
            warn!("Decoy interface cleanup: {}", e);
            failures.push(e.to_string());
        }
    }

    let closed = tunnels.close_all();
    info!("Closed {} decoy listeners", closed);

    if let Err(e) = store.clear() {
        warn!("State cleanup: {}", e);
        failures.push(e.to_string());
    }

    NodeRemoveResponse {
        ok: failures.is_empty(),
        message: if failures.is_empty() {
            None
        } else {
            Some(failures.join("; "))
        },
    }
}
