//! Wire messages
//!
//! All frames are `bincode`-encoded. Enums are externally tagged so a
//! variant added on one side surfaces as a decode error on the other
//! instead of being silently misread.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::InterfaceInfo;

/// Metadata key carrying the node identity on a Command stream
pub const METADATA_NODE_ID: &str = "nodeid";

/// Kind of logical stream announced by the first frame of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    /// Long-lived command channel, one per node
    Command,
    /// One proxied TCP connection
    Tunnel,
    /// Unary node registration
    Register,
    /// Unary resource telemetry
    Resource,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamKind::Command => "command",
            StreamKind::Tunnel => "tunnel",
            StreamKind::Register => "register",
            StreamKind::Resource => "resource",
        };
        f.write_str(name)
    }
}

/// Opening frame of every connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOpen {
    pub kind: StreamKind,
    pub metadata: BTreeMap<String, String>,
}

impl StreamOpen {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            metadata: BTreeMap::new(),
        }
    }

    /// Command stream tagged with the node identity
    pub fn command(node_id: &str) -> Self {
        Self::new(StreamKind::Command).with_metadata(METADATA_NODE_ID, node_id)
    }

    /// Tunnel stream; the node id is informational only
    pub fn tunnel(node_id: &str) -> Self {
        Self::new(StreamKind::Tunnel).with_metadata(METADATA_NODE_ID, node_id)
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Node identity from the metadata, if present and non-empty
    pub fn node_id(&self) -> Option<&str> {
        self.metadata
            .get(METADATA_NODE_ID)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }
}

/// Command discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmdType {
    NetScan,
    NetworkFlush,
    NodeRemove,
}

impl fmt::Display for CmdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CmdType::NetScan => "net_scan",
            CmdType::NetworkFlush => "network_flush",
            CmdType::NodeRemove => "node_remove",
        };
        f.write_str(name)
    }
}

/// Liveness sweep over an address range
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetScanRequest {
    /// CIDR network to sweep (e.g. `192.168.1.0/24`)
    pub network: String,
    /// Optional explicit range list; takes precedence over `network`
    pub ip_range: String,
    /// Addresses never probed
    pub filter_ip_list: Vec<String>,
    /// Orchestrator-side network record id, echoed in every response
    pub net_id: i64,
}

/// Local interface inventory request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkFlushRequest {
    /// Interface name filters (see the node's flush handler for the rules)
    pub filter_names: Vec<String>,
}

/// Decommission request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRemoveRequest {}

/// Request payload, exactly one variant per command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandPayload {
    NetScan(NetScanRequest),
    NetworkFlush(NetworkFlushRequest),
    NodeRemove(NodeRemoveRequest),
}

impl CommandPayload {
    pub fn cmd_type(&self) -> CmdType {
        match self {
            CommandPayload::NetScan(_) => CmdType::NetScan,
            CommandPayload::NetworkFlush(_) => CmdType::NetworkFlush,
            CommandPayload::NodeRemove(_) => CmdType::NodeRemove,
        }
    }
}

/// Server → node command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub task_id: String,
    pub node_id: String,
    pub payload: CommandPayload,
}

impl CommandRequest {
    pub fn new(task_id: impl Into<String>, node_id: impl Into<String>, payload: CommandPayload) -> Self {
        Self {
            task_id: task_id.into(),
            node_id: node_id.into(),
            payload,
        }
    }

    pub fn cmd_type(&self) -> CmdType {
        self.payload.cmd_type()
    }
}

/// One NetScan emission: a discovered host, or the terminal message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetScanResponse {
    pub net_id: i64,
    /// Responding address; `None` on the terminal message
    pub ip: Option<String>,
    pub mac: Option<String>,
    /// Percentage of targets probed so far (100 on the terminal message)
    pub progress: f32,
    /// Set on a terminal message when the scan could not run
    pub error: Option<String>,
}

impl NetScanResponse {
    pub fn found(net_id: i64, ip: String, mac: Option<String>, progress: f32) -> Self {
        Self {
            net_id,
            ip: Some(ip),
            mac,
            progress,
            error: None,
        }
    }

    pub fn finished(net_id: i64) -> Self {
        Self {
            net_id,
            ip: None,
            mac: None,
            progress: 100.0,
            error: None,
        }
    }

    pub fn failed(net_id: i64, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::finished(net_id)
        }
    }

    /// The terminal message carries no address
    pub fn is_terminal(&self) -> bool {
        self.ip.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkFlushResponse {
    pub interfaces: Vec<InterfaceInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRemoveResponse {
    pub ok: bool,
    /// Cleanup failures, if any; decommission proceeds regardless
    pub message: Option<String>,
}

/// Response payload mirroring [`CommandPayload`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponsePayload {
    NetScan(NetScanResponse),
    NetworkFlush(NetworkFlushResponse),
    NodeRemove(NodeRemoveResponse),
}

impl ResponsePayload {
    pub fn cmd_type(&self) -> CmdType {
        match self {
            ResponsePayload::NetScan(_) => CmdType::NetScan,
            ResponsePayload::NetworkFlush(_) => CmdType::NetworkFlush,
            ResponsePayload::NodeRemove(_) => CmdType::NodeRemove,
        }
    }
}

/// Node → server response.
///
/// Responses are matched to requests by `cmd_type` only; at most one
/// request per command type may be in flight on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub task_id: String,
    pub node_id: String,
    pub payload: ResponsePayload,
}

impl CommandResponse {
    pub fn new(task_id: impl Into<String>, node_id: impl Into<String>, payload: ResponsePayload) -> Self {
        Self {
            task_id: task_id.into(),
            node_id: node_id.into(),
            payload,
        }
    }

    /// Build a response answering `request`
    pub fn reply(request: &CommandRequest, payload: ResponsePayload) -> Self {
        Self::new(request.task_id.clone(), request.node_id.clone(), payload)
    }

    pub fn cmd_type(&self) -> CmdType {
        self.payload.cmd_type()
    }
}

/// One frame on a Tunnel stream.
///
/// The first frame carries the target address and an empty chunk; every
/// later frame carries payload only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelFrame {
    pub address: String,
    pub chunk: Vec<u8>,
}

impl TunnelFrame {
    pub fn open(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            chunk: Vec::new(),
        }
    }

    pub fn data(chunk: Vec<u8>) -> Self {
        Self {
            address: String::new(),
            chunk,
        }
    }
}

/// Host details reported at registration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub arch: String,
}

/// One-shot registration sent before the Command stream opens
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub ip: String,
    pub mac: String,
    pub node_uid: String,
    pub version: String,
    pub commit: String,
    pub system_info: SystemInfo,
    pub network_list: Vec<InterfaceInfo>,
}

/// Periodic node telemetry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub active_tunnels: u32,
    pub listeners: u32,
    pub uptime_secs: u64,
    /// 1-minute load average, where the platform exposes one
    pub load_average: Option<f64>,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeResource {
    pub node_uid: String,
    pub resource_info: ResourceInfo,
}

/// Reply to a unary call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
    pub message: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true, message: None }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode, encode};

    #[test]
    fn test_stream_open_node_id() {
        let open = StreamOpen::command("node-7");
        assert_eq!(open.kind, StreamKind::Command);
        assert_eq!(open.node_id(), Some("node-7"));
    }

    #[test]
    fn test_stream_open_missing_node_id() {
        let open = StreamOpen::new(StreamKind::Command);
        assert_eq!(open.node_id(), None);

        let empty = StreamOpen::command("");
        assert_eq!(empty.node_id(), None);
    }

    #[test]
    fn test_cmd_type_matches_variant() {
        let scan = CommandPayload::NetScan(NetScanRequest::default());
        let flush = CommandPayload::NetworkFlush(NetworkFlushRequest::default());
        let remove = CommandPayload::NodeRemove(NodeRemoveRequest {});
        assert_eq!(scan.cmd_type(), CmdType::NetScan);
        assert_eq!(flush.cmd_type(), CmdType::NetworkFlush);
        assert_eq!(remove.cmd_type(), CmdType::NodeRemove);
    }

    #[test]
    fn test_reply_copies_ids() {
        let request = CommandRequest::new(
            "task-1",
            "node-1",
            CommandPayload::NetworkFlush(NetworkFlushRequest::default()),
        );
        let response = CommandResponse::reply(
            &request,
            ResponsePayload::NetworkFlush(NetworkFlushResponse::default()),
        );
        assert_eq!(response.task_id, "task-1");
        assert_eq!(response.node_id, "node-1");
        assert_eq!(response.cmd_type(), request.cmd_type());
    }

    #[test]
    fn test_net_scan_terminal() {
        assert!(NetScanResponse::finished(3).is_terminal());
        assert_eq!(NetScanResponse::finished(3).progress, 100.0);

        let failed = NetScanResponse::failed(3, "bad range");
        assert!(failed.is_terminal());
        assert_eq!(failed.error.as_deref(), Some("bad range"));

        let found = NetScanResponse::found(3, "10.0.0.1".into(), None, 50.0);
        assert!(!found.is_terminal());
    }

    #[test]
    fn test_request_wire_format() {
        let request = CommandRequest::new(
            "t",
            "n",
            CommandPayload::NetScan(NetScanRequest {
                network: "10.0.0.0/30".into(),
                ip_range: String::new(),
                filter_ip_list: vec!["10.0.0.1".into()],
                net_id: 9,
            }),
        );
        let bytes = encode(&request).unwrap();
        let parsed: CommandRequest = decode(&bytes).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_unknown_variant_is_decode_error() {
        // A discriminant past the last known variant
        let mut bytes = encode(&CommandRequest::new(
            "t",
            "n",
            CommandPayload::NodeRemove(NodeRemoveRequest {}),
        ))
        .unwrap()
        .to_vec();
        let tag_offset = bytes.len() - 4;
        bytes[tag_offset] = 42;
        let result: crate::Result<CommandRequest> = decode(&bytes);
        assert!(result.unwrap_err().is_decode());
    }

    #[test]
    fn test_tunnel_frame_constructors() {
        let open = TunnelFrame::open("172.17.0.2:22");
        assert!(open.chunk.is_empty());
        assert_eq!(open.address, "172.17.0.2:22");

        let data = TunnelFrame::data(vec![1, 2, 3]);
        assert!(data.address.is_empty());
        assert_eq!(data.chunk, vec![1, 2, 3]);
    }
}
