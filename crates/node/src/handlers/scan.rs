//! NetScan: liveness sweep over an address range
//!
//! Targets come from `ip_range` when set, otherwise from `network`. Both
//! accept a comma-separated list of:
//!
//! - a single address (`10.0.0.7`)
//! - a CIDR block (`10.0.0.0/24`, host addresses only)
//! - an IPv4 span (`10.0.0.10-10.0.0.20` or `10.0.0.10-20`)

use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use decoynet_core::{NetScanRequest, NetScanResponse};
use decoynet_settings::ScanSettings;
use futures::StreamExt;
use ipnet::IpNet;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::{NodeError, Result};

/// Largest number of addresses one scan may cover
pub const MAX_SCAN_TARGETS: usize = 65_536;

/// Decides whether a host is alive
#[async_trait]
pub trait HostProber: Send + Sync + 'static {
    async fn probe(&self, ip: IpAddr) -> bool;

    /// Hardware address of a live host, if it can be learned
    async fn resolve_mac(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// TCP connect probe. A refused connection proves the host is up just as
/// well as an accepted one; only a timeout or unreachable route counts as
/// down.
pub struct TcpProber {
    ports: Vec<u16>,
    timeout: Duration,
}

impl TcpProber {
    pub fn new(ports: Vec<u16>, timeout: Duration) -> Self {
        Self { ports, timeout }
    }
}

impl From<&ScanSettings> for TcpProber {
    fn from(settings: &ScanSettings) -> Self {
        Self::new(settings.probe_ports.clone(), Duration::from_millis(settings.probe_timeout_ms))
    }
}

#[async_trait]
impl HostProber for TcpProber {
    async fn probe(&self, ip: IpAddr) -> bool {
        for &port in &self.ports {
            let addr = SocketAddr::new(ip, port);
            match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => return true,
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => return true,
                _ => {}
            }
        }
        false
    }

    async fn resolve_mac(&self, ip: IpAddr) -> Option<String> {
        let table = tokio::fs::read_to_string("/proc/net/arp").await.ok()?;
        arp_lookup(&table, ip)
    }
}

/// Find `ip` in the kernel ARP table text
fn arp_lookup(table: &str, ip: IpAddr) -> Option<String> {
    let ip = ip.to_string();
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [addr, _hw_type, _flags, mac, ..] if *addr == ip && *mac != "00:00:00:00:00:00" => {
                Some(mac.to_string())
            }
            _ => None,
        }
    })
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Concurrent probes per scan
    pub workers: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self { workers: 200 }
    }
}

impl From<&ScanSettings> for ScanConfig {
    fn from(settings: &ScanSettings) -> Self {
        Self {
            workers: settings.workers.max(1),
        }
    }
}

fn invalid(part: &str, reason: impl std::fmt::Display) -> NodeError {
    NodeError::InvalidRange(format!("{}: {}", part, reason))
}

fn expand(part: &str, out: &mut Vec<IpAddr>) -> Result<()> {
    let room = MAX_SCAN_TARGETS + 1 - out.len().min(MAX_SCAN_TARGETS + 1);

    if part.contains('/') {
        let net: IpNet = part.parse().map_err(|e| invalid(part, e))?;
        out.extend(net.hosts().take(room));
    } else if let Some((start, end)) = part.split_once('-') {
        let start: Ipv4Addr = start.trim().parse().map_err(|e| invalid(part, e))?;
        let end = end.trim();
        let end: Ipv4Addr = match end.parse() {
            Ok(ip) => ip,
            Err(_) => {
                let last: u8 = end.parse().map_err(|e| invalid(part, e))?;
                let [a, b, c, _] = start.octets();
                Ipv4Addr::new(a, b, c, last)
            }
        };
        let (start, end) = (u32::from(start), u32::from(end));
        if end < start {
            return Err(invalid(part, "range end precedes start"));
        }
        out.extend((start..=end).take(room).map(|n| IpAddr::V4(Ipv4Addr::from(n))));
    } else {
        out.push(part.parse().map_err(|e| invalid(part, e))?);
    }

    if out.len() > MAX_SCAN_TARGETS {
        return Err(NodeError::InvalidRange(format!(
            "more than {} addresses",
            MAX_SCAN_TARGETS
        )));
    }
    Ok(())
}

/// Expand the request into a de-duplicated target list with the exclusion
/// list removed
pub fn parse_targets(request: &NetScanRequest) -> Result<Vec<IpAddr>> {
    let spec = match request.ip_range.trim() {
        "" => request.network.trim(),
        range => range,
    };
    if spec.is_empty() {
        return Err(NodeError::InvalidRange("no network or range given".to_string()));
    }

    let mut raw = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        expand(part, &mut raw)?;
    }

    let excluded: HashSet<IpAddr> = request
        .filter_ip_list
        .iter()
        .filter_map(|s| match s.trim().parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                debug!("Ignoring unparsable exclusion {:?}", s);
                None
            }
        })
        .collect();

    let mut seen = HashSet::new();
    raw.retain(|ip| !excluded.contains(ip) && seen.insert(*ip));
    Ok(raw)
}

/// Run one scan, handing each emission to `emit`. Returns the number of
/// live hosts found.
///
/// Found hosts are emitted as soon as they answer, in no particular order.
/// Exactly one terminal message follows, after every probe has finished;
/// a range that fails to parse produces only that terminal message, with
/// the error set.
pub async fn run<F, Fut>(request: &NetScanRequest, prober: &dyn HostProber, config: &ScanConfig, emit: F) -> usize
where
    F: Fn(NetScanResponse) -> Fut,
    Fut: Future<Output = ()>,
{
    let net_id = request.net_id;
    let targets = match parse_targets(request) {
        Ok(targets) => targets,
        Err(e) => {
            warn!("NetScan {} not started: {}", net_id, e);
            emit(NetScanResponse::failed(net_id, e.to_string())).await;
            return 0;
        }
    };

    let total = targets.len();
    info!("NetScan {} probing {} addresses", net_id, total);

    let completed = AtomicUsize::new(0);
    let found = AtomicUsize::new(0);
    futures::stream::iter(targets)
        .for_each_concurrent(config.workers.max(1), |ip| {
            let emit = &emit;
            let completed = &completed;
            let found = &found;
            async move {
                let alive = prober.probe(ip).await;
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                if alive {
                    found.fetch_add(1, Ordering::SeqCst);
                    let mac = prober.resolve_mac(ip).await;
                    let progress = done as f32 / total as f32 * 100.0;
                    debug!("NetScan {} found {} ({:.1}%)", net_id, ip, progress);
                    emit(NetScanResponse::found(net_id, ip.to_string(), mac, progress)).await;
                }
            }
        })
        .await;

    let found = found.load(Ordering::SeqCst);
    info!("NetScan {} finished: {} of {} hosts alive", net_id, found, total);
    emit(NetScanResponse::finished(net_id)).await;
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Hosts whose last octet is even are alive
    struct EvenHosts;

    #[async_trait]
    impl HostProber for EvenHosts {
        async fn probe(&self, ip: IpAddr) -> bool {
            match ip {
                IpAddr::V4(v4) => v4.octets()[3] % 2 == 0,
                IpAddr::V6(_) => false,
            }
        }

        async fn resolve_mac(&self, _ip: IpAddr) -> Option<String> {
            Some("02:00:00:00:00:01".to_string())
        }
    }

    struct NobodyHome;

    #[async_trait]
    impl HostProber for NobodyHome {
        async fn probe(&self, _ip: IpAddr) -> bool {
            false
        }
    }

    fn request(network: &str, range: &str, filter: &[&str]) -> NetScanRequest {
        NetScanRequest {
            network: network.to_string(),
            ip_range: range.to_string(),
            filter_ip_list: filter.iter().map(|s| s.to_string()).collect(),
            net_id: 7,
        }
    }

    async fn collect(request: &NetScanRequest, prober: &dyn HostProber) -> Vec<NetScanResponse> {
        let out = Mutex::new(Vec::new());
        run(request, prober, &ScanConfig { workers: 8 }, |r| {
            out.lock().push(r);
            async {}
        })
        .await;
        out.into_inner()
    }

    #[test]
    fn test_parse_cidr_hosts() {
        let targets = parse_targets(&request("192.168.1.0/30", "", &[])).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].to_string(), "192.168.1.1");
    }

    #[test]
    fn test_parse_ranges() {
        let targets = parse_targets(&request("", "10.0.0.1-3, 10.0.0.10-10.0.0.11,10.0.0.20", &[])).unwrap();
        let ips: Vec<String> = targets.iter().map(|ip| ip.to_string()).collect();
        assert_eq!(
            ips,
            vec!["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.10", "10.0.0.11", "10.0.0.20"]
        );
    }

    #[test]
    fn test_range_takes_precedence_over_network() {
        let targets = parse_targets(&request("10.0.0.0/8", "10.1.1.1", &[])).unwrap();
        assert_eq!(targets.len(), 1);
    }

    #[test]
    fn test_filter_and_dedupe() {
        let targets = parse_targets(&request("", "10.0.0.1-4,10.0.0.2", &["10.0.0.3", "junk"])).unwrap();
        let ips: Vec<String> = targets.iter().map(|ip| ip.to_string()).collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2", "10.0.0.4"]);
    }

    #[test]
    fn test_arp_lookup() {
        let table = "IP address       HW type     Flags       HW address            Mask     Device\n\
                     10.0.0.1         0x1         0x2         52:54:00:12:35:02     *        eth0\n\
                     10.0.0.9         0x1         0x0         00:00:00:00:00:00     *        eth0\n";
        assert_eq!(
            arp_lookup(table, "10.0.0.1".parse().unwrap()).as_deref(),
            Some("52:54:00:12:35:02")
        );
        assert_eq!(arp_lookup(table, "10.0.0.9".parse().unwrap()), None);
        assert_eq!(arp_lookup(table, "10.0.0.2".parse().unwrap()), None);
    }

    #[tokio::test]
    async fn test_scan_emits_found_then_terminal() {
        // .1 to .10, .4 excluded: alive are .2 .6 .8 .10
        let req = request("", "10.0.0.1-10", &["10.0.0.4"]);
        let out = collect(&req, &EvenHosts).await;

        let (found, terminal): (Vec<_>, Vec<_>) = out.iter().partition(|r| !r.is_terminal());
        assert_eq!(found.len(), 4);
        assert_eq!(terminal.len(), 1);
        assert!(out.last().unwrap().is_terminal());
        assert_eq!(terminal[0].progress, 100.0);
        assert!(terminal[0].error.is_none());

        let mut ips: Vec<&str> = found.iter().map(|r| r.ip.as_deref().unwrap()).collect();
        ips.sort();
        assert_eq!(ips, vec!["10.0.0.10", "10.0.0.2", "10.0.0.6", "10.0.0.8"]);
        assert!(found.iter().all(|r| r.net_id == 7 && r.mac.is_some() && r.progress <= 100.0));
    }

    #[tokio::test]
    async fn test_scan_with_no_live_hosts() {
        let out = collect(&request("10.9.0.0/29", "", &[]), &NobodyHome).await;
        assert_eq!(out.len(), 1);
        assert!(out[0].is_terminal());
        assert_eq!(out[0].progress, 100.0);
    }

    #[tokio::test]
    async fn test_probe_refused_counts_as_alive() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let prober = TcpProber::new(vec![port], Duration::from_millis(500));
        assert!(prober.probe("127.0.0.1".parse().unwrap()).await);
    }

    // ==================== NEGATIVE TESTS ====================

    #[test]
    fn test_parse_errors() {
        assert!(parse_targets(&request("", "", &[])).is_err());
        assert!(parse_targets(&request("not-a-net/24", "", &[])).is_err());
        assert!(parse_targets(&request("", "10.0.0.9-3", &[])).is_err());
        assert!(parse_targets(&request("", "10.0.0.1-300", &[])).is_err());
        assert!(parse_targets(&request("10.0.0.0/8", "", &[])).is_err());
    }

    #[tokio::test]
    async fn test_bad_range_emits_single_error_terminal() {
        let out = collect(&request("", "banana", &[]), &EvenHosts).await;
        assert_eq!(out.len(), 1);
        assert!(out[0].is_terminal());
        assert_eq!(out[0].progress, 100.0);
        assert!(out[0].error.as_deref().unwrap().contains("banana"));
    }

    proptest::proptest! {
        #[test]
        fn test_found_never_exceeds_unfiltered_targets(last in 1u8..=60, excluded in proptest::collection::vec(1u8..=60, 0..10)) {
            let filter: Vec<String> = excluded.iter().map(|o| format!("10.0.0.{}", o)).collect();
            let filter_refs: Vec<&str> = filter.iter().map(String::as_str).collect();
            let req = request("", &format!("10.0.0.1-{}", last), &filter_refs);
            let k = last as usize;
            let f = excluded.iter().filter(|o| **o <= last).collect::<HashSet<_>>().len();

            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let out = rt.block_on(collect(&req, &EvenHosts));
            let found = out.iter().filter(|r| !r.is_terminal()).count();
            proptest::prop_assert!(found <= k - f);
            proptest::prop_assert_eq!(out.iter().filter(|r| r.is_terminal()).count(), 1);
            proptest::prop_assert!(out.last().unwrap().is_terminal());
        }
    }
}
