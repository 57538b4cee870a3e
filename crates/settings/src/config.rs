//! Configuration types

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{default_config_dir, default_settings_path, Result, SettingsError};

/// Main settings structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Central server settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Node agent settings
    #[serde(default)]
    pub node: NodeSettings,

    /// Mutual TLS credentials; plain TCP when absent
    #[serde(default)]
    pub tls: Option<TlsSettings>,

    /// Custom settings file path (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

impl Settings {
    /// Load settings from the default path, or create defaults
    pub fn load_or_default() -> Result<Self> {
        Self::load_from(&default_settings_path())
    }

    /// Load settings from a specific path, or create defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(SettingsError::ReadError)?;
            let mut settings: Settings =
                serde_json::from_str(&content).map_err(SettingsError::ParseError)?;
            settings.config_path = Some(path.to_path_buf());
            info!("Loaded settings from {:?}", path);
            Ok(settings)
        } else {
            let mut settings = Self::default();
            settings.config_path = Some(path.to_path_buf());
            Ok(settings)
        }
    }

    /// Save settings to the configured path
    pub fn save(&self) -> Result<()> {
        let path = self.config_path.clone().unwrap_or_else(default_settings_path);
        self.save_to(&path)
    }

    /// Save settings to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SettingsError::CreateDirError)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(SettingsError::ParseError)?;
        std::fs::write(path, content).map_err(SettingsError::WriteError)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }
}

/// PEM paths for mutual TLS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    pub ca_cert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Central server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Stream endpoint nodes connect to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Operator JSON-RPC socket
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,

    /// Time allowed for TLS + opening frame
    #[serde(default = "default_ten")]
    pub handshake_timeout_secs: u64,

    /// Time allowed to dial a tunnel target
    #[serde(default = "default_ten")]
    pub dial_timeout_secs: u64,

    /// Concurrent tunnel streams across all nodes
    #[serde(default = "default_server_max_tunnels")]
    pub max_tunnels: usize,

    #[serde(default)]
    pub session: SessionSettings,
}

fn default_listen_addr() -> String {
    "0.0.0.0:7443".to_string()
}

fn default_control_socket() -> PathBuf {
    let runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(runtime).join("decoynet.sock")
}

fn default_ten() -> u64 {
    10
}

fn default_server_max_tunnels() -> usize {
    4096
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            control_socket: default_control_socket(),
            handshake_timeout_secs: default_ten(),
            dial_timeout_secs: default_ten(),
            max_tunnels: default_server_max_tunnels(),
            session: SessionSettings::default(),
        }
    }
}

impl ServerSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

/// Per-node session queues on the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Commands queued per node before `dispatch` blocks
    #[serde(default = "default_queue_capacity")]
    pub outbound_capacity: usize,

    /// Responses buffered per node while no caller awaits
    #[serde(default = "default_queue_capacity")]
    pub inbound_capacity: usize,

    /// How long a received response may wait for queue space before it is dropped
    #[serde(default = "default_five_seconds_ms")]
    pub response_send_timeout_ms: u64,
}

fn default_queue_capacity() -> usize {
    10
}

fn default_five_seconds_ms() -> u64 {
    5000
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: default_queue_capacity(),
            inbound_capacity: default_queue_capacity(),
            response_send_timeout_ms: default_five_seconds_ms(),
        }
    }
}

/// Node agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Identity announced on the Command stream
    #[serde(default)]
    pub node_id: String,

    /// Server stream endpoint
    #[serde(default = "default_server_addr")]
    pub server_addr: String,

    /// Name expected on the server certificate
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Directory holding persisted port forwards and task records
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Concurrent tunnels this node will relay
    #[serde(default = "default_node_max_tunnels")]
    pub max_tunnels: usize,

    /// Telemetry interval
    #[serde(default = "default_resource_interval")]
    pub resource_interval_secs: u64,

    /// Outbound response queue, recreated on every reconnect
    #[serde(default = "default_queue_capacity")]
    pub response_queue_capacity: usize,

    /// Upper bound on waiting for response queue space
    #[serde(default = "default_five_seconds_ms")]
    pub submit_timeout_ms: u64,

    /// Bound on registering and opening the Command stream (TLS included)
    #[serde(default = "default_ten")]
    pub connect_timeout_secs: u64,

    /// Interfaces with this prefix are decoys and removed on decommission
    #[serde(default = "default_decoy_prefix")]
    pub decoy_interface_prefix: String,

    #[serde(default)]
    pub scan: ScanSettings,

    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

fn default_server_addr() -> String {
    "127.0.0.1:7443".to_string()
}

fn default_server_name() -> String {
    "decoynet-server".to_string()
}

fn default_state_dir() -> PathBuf {
    default_config_dir().join("state")
}

fn default_node_max_tunnels() -> usize {
    1024
}

fn default_resource_interval() -> u64 {
    60
}

fn default_decoy_prefix() -> String {
    "hy-".to_string()
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            server_addr: default_server_addr(),
            server_name: default_server_name(),
            state_dir: default_state_dir(),
            max_tunnels: default_node_max_tunnels(),
            resource_interval_secs: default_resource_interval(),
            response_queue_capacity: default_queue_capacity(),
            submit_timeout_ms: default_five_seconds_ms(),
            connect_timeout_secs: default_ten(),
            decoy_interface_prefix: default_decoy_prefix(),
            scan: ScanSettings::default(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl NodeSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// NetScan worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// TCP ports tried per host; a refusal also proves liveness
    #[serde(default = "default_probe_ports")]
    pub probe_ports: Vec<u16>,
}

fn default_workers() -> usize {
    200
}

fn default_probe_timeout() -> u64 {
    800
}

fn default_probe_ports() -> Vec<u16> {
    vec![22, 80, 443, 445, 3389]
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            probe_timeout_ms: default_probe_timeout(),
            probe_ports: default_probe_ports(),
        }
    }
}

/// Reconnect backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_floor")]
    pub floor_secs: u64,

    #[serde(default = "default_ceiling")]
    pub ceiling_secs: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
}

fn default_floor() -> u64 {
    1
}

fn default_ceiling() -> u64 {
    60
}

fn default_multiplier() -> u32 {
    2
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            floor_secs: default_floor(),
            ceiling_secs: default_ceiling(),
            multiplier: default_multiplier(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.server.listen_addr, "0.0.0.0:7443");
        assert_eq!(settings.server.session.outbound_capacity, 10);
        assert_eq!(settings.server.session.response_send_timeout_ms, 5000);
        assert!(settings.tls.is_none());
    }

    #[test]
    fn test_node_settings_default() {
        let node = NodeSettings::default();
        assert!(node.node_id.is_empty());
        assert_eq!(node.scan.workers, 200);
        assert_eq!(node.reconnect.floor_secs, 1);
        assert_eq!(node.reconnect.ceiling_secs, 60);
        assert_eq!(node.reconnect.multiplier, 2);
        assert_eq!(node.decoy_interface_prefix, "hy-");
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{"node":{"node_id":"edge-3","server_addr":"10.1.1.1:7443"}}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.node.node_id, "edge-3");
        assert_eq!(settings.node.server_addr, "10.1.1.1:7443");
        assert_eq!(settings.node.max_tunnels, 1024);
        assert_eq!(settings.server.max_tunnels, 4096);
    }

    #[test]
    fn test_tls_section() {
        let json = r#"{"tls":{"ca_cert":"/etc/d/ca.pem","cert":"/etc/d/c.pem","key":"/etc/d/k.pem"}}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        let tls = settings.tls.unwrap();
        assert_eq!(tls.key, PathBuf::from("/etc/d/k.pem"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = Settings::default();
        settings.node.node_id = "edge-9".to_string();
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.node.node_id, "edge-9");
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.node.server_addr, "127.0.0.1:7443");
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(Settings::load_from(&path), Err(SettingsError::ParseError(_))));
    }

    #[test]
    fn test_durations() {
        let server = ServerSettings::default();
        assert_eq!(server.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(server.dial_timeout(), Duration::from_secs(10));
        assert_eq!(NodeSettings::default().connect_timeout(), Duration::from_secs(10));
    }
}
