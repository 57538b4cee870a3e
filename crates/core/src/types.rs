//! Shared data types

use serde::{Deserialize, Serialize};

/// A persisted decoy port forward.
///
/// The node binds `local_addr` and relays every accepted connection to
/// `target_addr`, which the server dials on the node's behalf.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortForwardSpec {
    pub local_addr: String,
    pub target_addr: String,
}

impl PortForwardSpec {
    pub fn new(local_addr: impl Into<String>, target_addr: impl Into<String>) -> Self {
        Self {
            local_addr: local_addr.into(),
            target_addr: target_addr.into(),
        }
    }

    /// Parse the CLI form `local=target`
    pub fn parse(s: &str) -> Option<Self> {
        let (local, target) = s.split_once('=')?;
        let (local, target) = (local.trim(), target.trim());
        if local.is_empty() || target.is_empty() {
            return None;
        }
        Some(Self::new(local, target))
    }
}

/// One IPv4 address bound to a local network interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    /// Interface name (e.g. `eth0`)
    pub name: String,
    /// Address assigned to the interface
    pub address: String,
    /// Network address (address & mask)
    pub network: String,
    /// Dotted netmask
    pub mask: String,
}
