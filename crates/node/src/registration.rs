//! Registration payload sent before each Command stream attempt

use decoynet_core::{InterfaceInfo, RegisterRequest, SystemInfo};

use crate::handlers::flush::InterfaceSource;

/// Build the registration for `node_id` from the host's current state.
///
/// The primary address is the first interface that is not loopback.
pub fn build_registration(node_id: &str, interfaces: &dyn InterfaceSource) -> RegisterRequest {
    let network_list = interfaces.interfaces();
    let primary = network_list.iter().find(|iface| !is_loopback(iface));

    let (ip, mac) = match primary {
        Some(iface) => (
            iface.address.clone(),
            interfaces.mac_address(&iface.name).unwrap_or_default(),
        ),
        None => (String::new(), String::new()),
    };

    RegisterRequest {
        ip,
        mac,
        node_uid: node_id.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        commit: option_env!("DECOYNET_COMMIT").unwrap_or("unknown").to_string(),
        system_info: SystemInfo {
            hostname: hostname(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        },
        network_list,
    }
}

fn is_loopback(iface: &InterfaceInfo) -> bool {
    iface.name == "lo"
        || iface
            .address
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Two;

    impl InterfaceSource for Two {
        fn interfaces(&self) -> Vec<InterfaceInfo> {
            vec![
                InterfaceInfo {
                    name: "lo".to_string(),
                    address: "127.0.0.1".to_string(),
                    network: "127.0.0.0".to_string(),
                    mask: "255.0.0.0".to_string(),
                },
                InterfaceInfo {
                    name: "eth0".to_string(),
                    address: "192.168.7.20".to_string(),
                    network: "192.168.7.0".to_string(),
                    mask: "255.255.255.0".to_string(),
                },
            ]
        }

        fn mac_address(&self, name: &str) -> Option<String> {
            (name == "eth0").then(|| "02:42:ac:11:00:02".to_string())
        }
    }

    struct Loopback;

    impl InterfaceSource for Loopback {
        fn interfaces(&self) -> Vec<InterfaceInfo> {
            vec![InterfaceInfo {
                name: "lo".to_string(),
                address: "127.0.0.1".to_string(),
                network: "127.0.0.0".to_string(),
                mask: "255.0.0.0".to_string(),
            }]
        }
    }

    #[test]
    fn test_primary_interface_skips_loopback() {
        let reg = build_registration("node-7", &Two);
        assert_eq!(reg.node_uid, "node-7");
        assert_eq!(reg.ip, "192.168.7.20");
        assert_eq!(reg.mac, "02:42:ac:11:00:02");
        assert_eq!(reg.network_list.len(), 2);
        assert_eq!(reg.system_info.os, std::env::consts::OS);
        assert!(!reg.version.is_empty());
    }

    #[test]
    fn test_loopback_only_host() {
        let reg = build_registration("node-8", &Loopback);
        assert!(reg.ip.is_empty());
        assert!(reg.mac.is_empty());
        assert_eq!(reg.network_list.len(), 1);
    }
}
