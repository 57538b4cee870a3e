//! JSON-RPC 2.0 protocol types

use decoynet_core::{RegisterRequest, ResourceInfo};
use serde::{Deserialize, Serialize};

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    pub id: u64,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Option<serde_json::Value>, id: u64) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
            id,
        }
    }
}

/// Any line the server writes: a response (has `id`) or a notification
/// (has `method`, no `id`)
#[derive(Debug, Clone, Deserialize)]
pub struct RpcMessage {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
}

impl RpcMessage {
    pub fn is_notification(&self) -> bool {
        self.id.is_none() && self.method.is_some()
    }
}

/// JSON-RPC 2.0 error
#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// One entry of the `nodes` result
#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    #[serde(default)]
    pub registration: Option<RegisterRequest>,
    #[serde(default)]
    pub resources: Option<ResourceInfo>,
    pub online: bool,
    #[serde(default)]
    pub last_seen: u64,
}

/// Result of the `dispatch` method
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchResult {
    pub task_id: String,
    pub cmd_type: String,
}

/// `presence` notification payload
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PresenceNotice {
    Online { node_id: String },
    Offline { node_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_request_serialization() {
        let request = RpcRequest::new("await", Some(serde_json::json!({"node_id": "edge-1"})), 1);
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"await\""));
    }

    #[test]
    fn test_rpc_request_no_params() {
        let request = RpcRequest::new("nodes", None, 1);
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_response_is_not_notification() {
        let json = r#"{"jsonrpc":"2.0","result":{"closed":"edge-1"},"error":null,"id":1}"#;
        let message: RpcMessage = serde_json::from_str(json).unwrap();
        assert!(!message.is_notification());
        assert!(message.result.is_some());
    }

    #[test]
    fn test_presence_notification() {
        let json = r#"{"jsonrpc":"2.0","method":"presence","params":{"event":"online","node_id":"edge-1"}}"#;
        let message: RpcMessage = serde_json::from_str(json).unwrap();
        assert!(message.is_notification());
        let notice: PresenceNotice = serde_json::from_value(message.params.unwrap()).unwrap();
        assert_eq!(
            notice,
            PresenceNotice::Online {
                node_id: "edge-1".to_string()
            }
        );
    }

    #[test]
    fn test_rpc_response_with_error() {
        let json = r#"{"jsonrpc":"2.0","result":null,"error":{"code":-32000,"message":"Node not found: x"},"id":1}"#;
        let message: RpcMessage = serde_json::from_str(json).unwrap();
        assert!(message.result.is_none());
        assert_eq!(message.error.as_ref().unwrap().code, -32000);
    }

    #[test]
    fn test_node_info_minimal() {
        let json = r#"{"node_id":"edge-2","online":true}"#;
        let info: NodeInfo = serde_json::from_str(json).unwrap();
        assert!(info.online);
        assert!(info.registration.is_none());
    }
}
