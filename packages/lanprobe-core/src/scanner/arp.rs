//! ARP table reading using system commands

use super::gate::Gate;
use super::hidden_command;
use super::oui::normalize_mac;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;

/// Port touched by the warmup connects; any closed port still triggers ARP
const WARMUP_PORT: u16 = 80;

/// Read the system ARP table as `(ip, MAC)` pairs. MACs are `AA:BB:CC:DD:EE:FF`.
pub async fn read_arp_table() -> Vec<(Ipv4Addr, String)> {
    let result = tokio::task::spawn_blocking(|| {
        #[cfg(target_os = "windows")]
        {
            hidden_command("arp")
                .args(["-a"])
                .output()
                .map(|o| parse_windows_arp(&String::from_utf8_lossy(&o.stdout)))
        }

        #[cfg(not(target_os = "windows"))]
        {
            hidden_command("arp")
                .args(["-a", "-n"])
                .output()
                .map(|o| parse_unix_arp(&String::from_utf8_lossy(&o.stdout)))
        }
    })
    .await;

    match result {
        Ok(Ok(entries)) => {
            tracing::debug!("ARP table has {} complete entries", entries.len());
            entries
        }
        Ok(Err(e)) => {
            tracing::warn!("Failed to run arp: {}", e);
            Vec::new()
        }
        Err(e) => {
            tracing::warn!("ARP reader task failed: {}", e);
            Vec::new()
        }
    }
}

fn is_unicast(ip: Ipv4Addr) -> bool {
    !(ip.is_multicast() || ip.is_broadcast() || ip.is_unspecified())
}

fn usable_mac(raw: &str) -> Option<String> {
    let mac = normalize_mac(raw)?;
    (mac != "00:00:00:00:00:00" && mac != "FF:FF:FF:FF:FF:FF").then_some(mac)
}

fn collect(pairs: impl Iterator<Item = (Ipv4Addr, String)>) -> Vec<(Ipv4Addr, String)> {
    let by_ip: BTreeMap<Ipv4Addr, String> = pairs.filter(|(ip, _)| is_unicast(*ip)).collect();
    by_ip.into_iter().collect()
}

/// `? (192.168.1.64) at a4:14:37:0:11:22 on en0 ifscope [ethernet]` (macOS/BSD, Linux `arp -an`).
/// Falls back to the Linux `arp -n` column layout.
pub fn parse_unix_arp(output: &str) -> Vec<(Ipv4Addr, String)> {
    collect(output.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() || line.contains("incomplete") {
            return None;
        }

        if let (Some(open), Some(close)) = (line.find('('), line.find(')')) {
            let ip: Ipv4Addr = line.get(open + 1..close)?.parse().ok()?;
            let at = line.find(" at ")?;
            let mac = line[at + 4..].split_whitespace().next()?;
            return Some((ip, usable_mac(mac)?));
        }

        // Address HWtype HWaddress Flags Mask Iface
        let parts: Vec<&str> = line.split_whitespace().collect();
        let ip: Ipv4Addr = parts.first()?.parse().ok()?;
        let mac = parts.get(2)?;
        Some((ip, usable_mac(mac)?))
    }))
}

/// `  192.168.1.64          a4-14-37-00-11-22     dynamic`
pub fn parse_windows_arp(output: &str) -> Vec<(Ipv4Addr, String)> {
    collect(output.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with("Interface") || line.contains("Internet Address") {
            return None;
        }
        let mut parts = line.split_whitespace();
        let ip: Ipv4Addr = parts.next()?.parse().ok()?;
        let mac = parts.next()?;
        if !mac.contains('-') || mac.len() != 17 {
            return None;
        }
        Some((ip, usable_mac(mac)?))
    }))
}

/// Fire-and-forget TCP connects so the kernel resolves neighbours before the
/// ARP table is read. Results are ignored.
pub async fn warmup(hosts: &[Ipv4Addr], gate: &Gate, timeout: Duration) {
    let attempts = hosts.iter().map(|&ip| async move {
        let _permit = gate.acquire().await.ok()?;
        let addr = SocketAddr::from((ip, WARMUP_PORT));
        let _ = tokio::time::timeout(timeout, TcpStream::connect(addr)).await;
        Some(())
    });
    join_all(attempts).await;
    tracing::debug!("ARP warmup touched {} hosts", hosts.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bsd_format() {
        let output = "? (192.168.1.1) at 0:11:32:aa:bb:cc on en0 ifscope [ethernet]\n\
                      ? (192.168.1.64) at a4:14:37:00:11:22 on en0 ifscope [ethernet]\n\
                      ? (192.168.1.70) at (incomplete) on en0 ifscope [ethernet]\n\
                      ? (192.168.1.255) at ff:ff:ff:ff:ff:ff on en0 ifscope [ethernet]\n\
                      ? (224.0.0.251) at 1:0:5e:0:0:fb on en0 ifscope permanent [ethernet]\n";
        let entries = parse_unix_arp(output);
        assert_eq!(
            entries,
            vec![
                (Ipv4Addr::new(192, 168, 1, 1), "00:11:32:AA:BB:CC".to_string()),
                (Ipv4Addr::new(192, 168, 1, 64), "A4:14:37:00:11:22".to_string()),
            ]
        );
    }

    #[test]
    fn test_keeps_dot_255_hosts_in_wide_subnets() {
        // 10.0.1.255 is an ordinary host inside 10.0.0.0/16
        let output = "? (10.0.1.255) at a4:14:37:00:11:22 on eth0 [ether]\n\
                      ? (10.0.255.255) at ff:ff:ff:ff:ff:ff on eth0 [ether]\n";
        assert_eq!(
            parse_unix_arp(output),
            vec![(Ipv4Addr::new(10, 0, 1, 255), "A4:14:37:00:11:22".to_string())]
        );
    }

    #[test]
    fn test_parse_linux_columns() {
        let output = "Address                  HWtype  HWaddress           Flags Mask            Iface\n\
                      10.0.0.1                 ether   3c:84:6a:01:02:03   C                     eth0\n\
                      10.0.0.9                         (incomplete)                              eth0\n";
        assert_eq!(
            parse_unix_arp(output),
            vec![(Ipv4Addr::new(10, 0, 0, 1), "3C:84:6A:01:02:03".to_string())]
        );
    }

    #[test]
    fn test_parse_windows_format() {
        let output = "\r\nInterface: 192.168.1.10 --- 0x7\r\n  Internet Address      Physical Address      Type\r\n  \
                      192.168.1.1           00-11-32-aa-bb-cc     dynamic\r\n  \
                      192.168.1.255         ff-ff-ff-ff-ff-ff     static\r\n  \
                      239.255.255.250       01-00-5e-7f-ff-fa     static\r\n";
        assert_eq!(
            parse_windows_arp(output),
            vec![(Ipv4Addr::new(192, 168, 1, 1), "00:11:32:AA:BB:CC".to_string())]
        );
    }

    #[tokio::test]
    async fn test_warmup_respects_timeout() {
        let gate = Gate::new("arp-warmup", 4);
        let hosts = [Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(127, 0, 0, 2)];
        let started = std::time::Instant::now();
        warmup(&hosts, &gate, Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(gate.in_flight(), 0);
    }
}
