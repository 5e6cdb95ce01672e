//! TCP connect probes over the fixed port set

use super::gate::Gate;
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Ports that carry a web UI worth fingerprinting, with their scheme
pub const HTTP_PORTS: [(u16, &str); 5] = [
    (80, "http"),
    (8000, "http"),
    (8080, "http"),
    (443, "https"),
    (8443, "https"),
];

/// Result of sweeping one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostScanResult {
    pub ip: Ipv4Addr,
    pub open_ports: BTreeSet<u16>,
    pub http_title: Option<String>,
}

/// Open iff the TCP handshake completes within `connect_timeout`.
pub async fn probe_port(ip: Ipv4Addr, port: u16, connect_timeout: Duration) -> bool {
    let addr = SocketAddr::from((ip, port));
    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::trace!("{}:{} closed ({})", ip, port, e);
            false
        }
        Err(_) => {
            tracing::trace!("{}:{} timed out", ip, port);
            false
        }
    }
}

/// Probe all `ports` of one host in parallel, each under the port gate.
pub async fn scan_host_ports(
    ip: Ipv4Addr,
    ports: &[u16],
    connect_timeout: Duration,
    port_gate: &Gate,
) -> BTreeSet<u16> {
    let probes = ports.iter().map(|&port| async move {
        match port_gate.run(probe_port(ip, port, connect_timeout)).await {
            Ok(true) => Some(port),
            _ => None,
        }
    });

    futures::future::join_all(probes)
        .await
        .into_iter()
        .flatten()
        .collect()
}

/// Web ports among `open_ports`, in probing order
pub fn http_targets(open_ports: &BTreeSet<u16>) -> Vec<(u16, &'static str)> {
    HTTP_PORTS
        .iter()
        .copied()
        .filter(|(port, _)| open_ports.contains(port))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_port_open_and_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();

        // Grab a free port and release it so nothing listens there
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let timeout = Duration::from_millis(500);
        assert!(probe_port(Ipv4Addr::LOCALHOST, open, timeout).await);
        assert!(!probe_port(Ipv4Addr::LOCALHOST, closed, timeout).await);
    }

    #[tokio::test]
    async fn test_scan_host_ports_collects_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let gate = Gate::new("port-probe", 2);

        let found = scan_host_ports(
            Ipv4Addr::LOCALHOST,
            &[open],
            Duration::from_millis(500),
            &gate,
        )
        .await;
        assert_eq!(found, BTreeSet::from([open]));
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn test_http_targets_order() {
        let open = BTreeSet::from([443, 554, 80, 8443]);
        assert_eq!(
            http_targets(&open),
            vec![(80, "http"), (443, "https"), (8443, "https")]
        );
    }
}
