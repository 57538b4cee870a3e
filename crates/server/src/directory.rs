//! Node directory
//!
//! Keeps what the server knows about each node outside its command
//! session: the last registration, the last telemetry report and whether
//! a Command stream is currently open.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use decoynet_core::{NodeResource, RegisterRequest, ResourceInfo};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::registry::PresenceSink;

const EVENT_CAPACITY: usize = 256;

/// Presence change broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PresenceEvent {
    Online { node_id: String },
    Offline { node_id: String },
}

/// Everything known about one node
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub registration: Option<RegisterRequest>,
    pub resources: Option<ResourceInfo>,
    pub online: bool,
    /// Unix seconds of the last registration, report or presence change
    pub last_seen: u64,
}

pub struct NodeDirectory {
    records: RwLock<HashMap<String, NodeRecord>>,
    events: broadcast::Sender<PresenceEvent>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Default for NodeDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeDirectory {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            records: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to presence changes
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<PresenceEvent> {
        self.events.clone()
    }

    fn update<F: FnOnce(&mut NodeRecord)>(&self, node_id: &str, f: F) {
        let mut records = self.records.write();
        let record = records.entry(node_id.to_string()).or_insert_with(|| NodeRecord {
            node_id: node_id.to_string(),
            ..Default::default()
        });
        f(record);
        record.last_seen = now_secs();
    }

    /// Store a registration, keyed by its `node_uid`
    pub fn register(&self, request: RegisterRequest) -> Result<(), String> {
        if request.node_uid.is_empty() {
            return Err("node_uid is required".to_string());
        }
        info!(
            "Node {} registered from {} (version {}, {} interfaces)",
            request.node_uid,
            request.ip,
            request.version,
            request.network_list.len()
        );
        let node_id = request.node_uid.clone();
        self.update(&node_id, |record| record.registration = Some(request));
        Ok(())
    }

    /// Store the latest telemetry report
    pub fn report(&self, report: NodeResource) -> Result<(), String> {
        if report.node_uid.is_empty() {
            return Err("node_uid is required".to_string());
        }
        debug!(
            "Node {} reports {} tunnels, {} listeners",
            report.node_uid, report.resource_info.active_tunnels, report.resource_info.listeners
        );
        self.update(&report.node_uid, |record| record.resources = Some(report.resource_info));
        Ok(())
    }

    pub fn get(&self, node_id: &str) -> Option<NodeRecord> {
        self.records.read().get(node_id).cloned()
    }

    /// All known nodes, sorted by id
    pub fn list(&self) -> Vec<NodeRecord> {
        let mut records: Vec<NodeRecord> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        records
    }
}

impl PresenceSink for NodeDirectory {
    fn set_online(&self, node_id: &str, online: bool) {
        self.update(node_id, |record| record.online = online);
        let event = if online {
            PresenceEvent::Online {
                node_id: node_id.to_string(),
            }
        } else {
            PresenceEvent::Offline {
                node_id: node_id.to_string(),
            }
        };
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
