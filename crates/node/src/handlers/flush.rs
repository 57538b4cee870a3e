//! NetworkFlush: filtered local interface inventory

use decoynet_core::{InterfaceInfo, NetworkFlushRequest, NetworkFlushResponse};
use pnet::datalink;
use pnet::ipnetwork::IpNetwork;

const SEPARATORS: [char; 2] = ['-', '_'];

/// Source of the host's interface list
pub trait InterfaceSource: Send + Sync + 'static {
    fn interfaces(&self) -> Vec<InterfaceInfo>;

    fn mac_address(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Interfaces as reported by the operating system (IPv4 addresses only)
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn interfaces(&self) -> Vec<InterfaceInfo> {
        datalink::interfaces()
            .into_iter()
            .flat_map(|iface| {
                let name = iface.name.clone();
                iface.ips.into_iter().filter_map(move |ip| match ip {
                    IpNetwork::V4(v4) => Some(InterfaceInfo {
                        name: name.clone(),
                        address: v4.ip().to_string(),
                        network: v4.network().to_string(),
                        mask: v4.mask().to_string(),
                    }),
                    IpNetwork::V6(_) => None,
                })
            })
            .collect()
    }

    fn mac_address(&self, name: &str) -> Option<String> {
        datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == name)
            .and_then(|iface| iface.mac)
            .map(|mac| mac.to_string())
    }
}

/// Whether `name` is excluded by `filter`.
///
/// A filter ending in a separator (`-` or `_`) matches as a prefix, one
/// starting with a separator matches as a suffix, anything else matches
/// as a substring. Empty filters match nothing.
pub fn is_filtered(name: &str, filter: &str) -> bool {
    if filter.is_empty() {
        false
    } else if filter.ends_with(SEPARATORS) {
        name.starts_with(filter)
    } else if filter.starts_with(SEPARATORS) {
        name.ends_with(filter)
    } else {
        name.contains(filter)
    }
}

pub fn run(request: &NetworkFlushRequest, source: &dyn InterfaceSource) -> NetworkFlushResponse {
    let interfaces = source
        .interfaces()
        .into_iter()
        .filter(|iface| !request.filter_names.iter().any(|f| is_filtered(&iface.name, f)))
        .collect();
    NetworkFlushResponse { interfaces }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<&'static str>);

    impl InterfaceSource for Fixed {
        fn interfaces(&self) -> Vec<InterfaceInfo> {
            self.0
                .iter()
                .map(|name| InterfaceInfo {
                    name: name.to_string(),
                    address: "192.168.0.2".to_string(),
                    network: "192.168.0.0".to_string(),
                    mask: "255.255.255.0".to_string(),
                })
                .collect()
        }
    }

    fn flush(names: Vec<&'static str>, filters: &[&str]) -> Vec<String> {
        let request = NetworkFlushRequest {
            filter_names: filters.iter().map(|s| s.to_string()).collect(),
        };
        run(&request, &Fixed(names))
            .interfaces
            .into_iter()
            .map(|i| i.name)
            .collect()
    }

    #[test]
    fn test_prefix_filter() {
        assert_eq!(flush(vec!["eth0", "hy-0", "br-1"], &["hy-"]), vec!["eth0", "br-1"]);
    }

    #[test]
    fn test_suffix_filter() {
        assert_eq!(
            flush(vec!["eth0", "veth_int", "lo", "br_int"], &["_int"]),
            vec!["eth0", "lo"]
        );
    }

    #[test]
    fn test_substring_filter() {
        assert_eq!(flush(vec!["eth0", "docker0", "lo"], &["dock"]), vec!["eth0", "lo"]);
    }

    #[test]
    fn test_multiple_filters() {
        assert_eq!(
            flush(vec!["eth0", "hy-0", "docker0", "br-1"], &["hy-", "docker", "lo"]),
            vec!["eth0", "br-1"]
        );
    }

    #[test]
    fn test_no_filters_keeps_all() {
        assert_eq!(flush(vec!["eth0", "hy-0"], &[]), vec!["eth0", "hy-0"]);
    }

    #[test]
    fn test_is_filtered_rules() {
        assert!(is_filtered("hy-12", "hy-"));
        assert!(!is_filtered("xhy-12", "hy-"));
        assert!(is_filtered("br_ext", "_ext"));
        assert!(!is_filtered("br_ext0", "_ext"));
        assert!(is_filtered("virbr0", "br"));
        assert!(!is_filtered("eth0", ""));
    }

    #[test]
    fn test_system_interfaces_are_ipv4() {
        for iface in SystemInterfaces.interfaces() {
            assert!(iface.address.parse::<std::net::Ipv4Addr>().is_ok());
        }
    }
}
