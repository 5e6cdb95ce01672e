//! Active subnet detection and scan scope resolution

use super::{hidden_command, ScanError};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Scopes larger than this are refused
pub const MAX_SCOPE_HOSTS: u64 = 65_536;

/// The interface the engine scans from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub interface: String,
    pub subnet: Ipv4Network,
    pub gateway_ip: Option<Ipv4Addr>,
    pub local_ip: Option<Ipv4Addr>,
}

impl NetworkInfo {
    pub fn describe(&self) -> String {
        format!("{}/{} ({})", self.subnet.network(), self.subnet.prefix(), self.interface)
    }
}

/// Inclusive IPv4 range, written `start-end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for IpRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| format!("expected START-END, got {:?}", s))?;
        let start = start
            .trim()
            .parse()
            .map_err(|_| format!("invalid start address {:?}", start.trim()))?;
        let end = end
            .trim()
            .parse()
            .map_err(|_| format!("invalid end address {:?}", end.trim()))?;
        Ok(IpRange { start, end })
    }
}

/// What the user asked to scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanScope {
    pub cidr: Option<String>,
    pub ip_range: Option<IpRange>,
    pub only_local_subnet: bool,
}

impl ScanScope {
    pub fn local() -> Self {
        Self {
            cidr: None,
            ip_range: None,
            only_local_subnet: true,
        }
    }
}

/// Ordered host list plus a human-readable description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedScope {
    pub description: String,
    pub hosts: Vec<Ipv4Addr>,
}

/// Resolve a scope against the active subnet.
pub fn resolve_scope(active: Ipv4Network, scope: &ScanScope) -> ResolvedScope {
    if let Some(range) = scope.ip_range {
        let contained = active.contains(range.start) && active.contains(range.end);
        if !scope.only_local_subnet || contained {
            return ResolvedScope {
                description: format!("{} - {}", range.start, range.end),
                hosts: range_hosts(range.start, range.end),
            };
        }
        tracing::warn!(
            "Range {} is outside the local subnet {}; ignoring it",
            range,
            active
        );
    }

    let requested = scope
        .cidr
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty());

    if let Some(raw) = requested {
        match raw.parse::<Ipv4Network>() {
            Ok(net) => {
                let inside = active.contains(net.network()) && active.contains(net.broadcast());
                if !scope.only_local_subnet || inside {
                    return ResolvedScope {
                        description: format!("{}/{}", net.network(), net.prefix()),
                        hosts: subnet_hosts(net),
                    };
                }
                tracing::warn!(
                    "CIDR {} is outside the local subnet {}; scanning the local subnet instead",
                    raw,
                    active
                );
            }
            Err(e) => {
                tracing::warn!("Invalid CIDR {:?} ({}); scanning the local subnet instead", raw, e);
            }
        }
    }

    ResolvedScope {
        description: format!("{}/{} (local subnet)", active.network(), active.prefix()),
        hosts: subnet_hosts(active),
    }
}

/// Usable host addresses of a network, without network and broadcast.
pub fn subnet_hosts(net: Ipv4Network) -> Vec<Ipv4Addr> {
    if net.prefix() >= 31 {
        return Vec::new();
    }
    let first = u32::from(net.network()) + 1;
    let last = u32::from(net.broadcast()) - 1;
    range_hosts(Ipv4Addr::from(first), Ipv4Addr::from(last))
}

/// Inclusive range enumeration; empty when reversed or oversized.
pub fn range_hosts(start: Ipv4Addr, end: Ipv4Addr) -> Vec<Ipv4Addr> {
    let (start, end) = (u32::from(start), u32::from(end));
    if end < start {
        return Vec::new();
    }
    let count = u64::from(end - start) + 1;
    if count > MAX_SCOPE_HOSTS {
        tracing::warn!(
            "Refusing to scan {} addresses (limit {})",
            count,
            MAX_SCOPE_HOSTS
        );
        return Vec::new();
    }
    (start..=end).map(Ipv4Addr::from).collect()
}

/// Detect the active IPv4 network (default-route interface).
pub async fn detect_active_network() -> Result<NetworkInfo, ScanError> {
    #[cfg(target_os = "windows")]
    {
        get_windows_network_info()
    }

    #[cfg(target_os = "linux")]
    {
        get_linux_network_info()
    }

    #[cfg(target_os = "macos")]
    {
        get_macos_network_info()
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        Err(ScanError::NetworkNotAvailable("Unsupported platform".to_string()))
    }
}

fn command_output(program: &str, args: &[&str]) -> Result<String, ScanError> {
    let output = hidden_command(program)
        .args(args)
        .output()
        .map_err(|e| ScanError::NetworkNotAvailable(format!("Failed to run {}: {}", program, e)))?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(target_os = "linux")]
fn get_linux_network_info() -> Result<NetworkInfo, ScanError> {
    let route = command_output("ip", &["route", "show", "default"])?;
    let (gateway_ip, interface) = parse_linux_default_route(&route);

    if let Some(interface) = interface {
        let addr = command_output("ip", &["-4", "addr", "show", &interface])?;
        if let Some((local_ip, subnet)) = first_inet_cidr(&addr) {
            return Ok(NetworkInfo {
                interface,
                subnet,
                gateway_ip,
                local_ip: Some(local_ip),
            });
        }
    }

    // No default route: first up, non-loopback interface
    let all = command_output("ip", &["-o", "-4", "addr", "show", "up"])?;
    for line in all.lines() {
        let iface = line.split_whitespace().nth(1).unwrap_or_default();
        if iface == "lo" {
            continue;
        }
        if let Some((local_ip, subnet)) = first_inet_cidr(line) {
            return Ok(NetworkInfo {
                interface: iface.to_string(),
                subnet,
                gateway_ip: None,
                local_ip: Some(local_ip),
            });
        }
    }

    Err(ScanError::NetworkNotAvailable(
        "no IPv4 interface is up".to_string(),
    ))
}

#[cfg(target_os = "macos")]
fn get_macos_network_info() -> Result<NetworkInfo, ScanError> {
    let route = command_output("route", &["-n", "get", "default"])?;

    let gateway_ip = route
        .lines()
        .find(|line| line.contains("gateway:"))
        .and_then(|line| line.split(':').nth(1))
        .and_then(|s| s.trim().parse().ok());

    let interface = route
        .lines()
        .find(|line| line.contains("interface:"))
        .and_then(|line| line.split(':').nth(1))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "en0".to_string());

    let ifconfig = command_output("ifconfig", &[&interface])?;
    match parse_ifconfig_inet(&ifconfig) {
        Some((local_ip, subnet)) => Ok(NetworkInfo {
            interface,
            subnet,
            gateway_ip,
            local_ip: Some(local_ip),
        }),
        None => Err(ScanError::NetworkNotAvailable(format!(
            "{} has no IPv4 address",
            interface
        ))),
    }
}

#[cfg(target_os = "windows")]
fn get_windows_network_info() -> Result<NetworkInfo, ScanError> {
    let output = command_output("ipconfig", &[])?;
    parse_ipconfig(&output).ok_or_else(|| {
        ScanError::NetworkNotAvailable("no physical adapter with an IPv4 address".to_string())
    })
}

/// `default via 192.168.1.1 dev eth0 proto dhcp ...`
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_linux_default_route(route: &str) -> (Option<Ipv4Addr>, Option<String>) {
    let gateway_ip = route
        .split_whitespace()
        .skip_while(|&s| s != "via")
        .nth(1)
        .and_then(|s| s.parse().ok());

    let interface = route
        .split_whitespace()
        .skip_while(|&s| s != "dev")
        .nth(1)
        .map(|s| s.to_string());

    (gateway_ip, interface)
}

/// First `inet a.b.c.d/nn` that is not loopback
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn first_inet_cidr(text: &str) -> Option<(Ipv4Addr, Ipv4Network)> {
    let mut tokens = text.split_whitespace();
    while let Some(token) = tokens.next() {
        if token != "inet" {
            continue;
        }
        let Some(cidr) = tokens.next() else { break };
        if let Ok(net) = cidr.parse::<Ipv4Network>() {
            if net.ip().is_loopback() {
                continue;
            }
            let subnet = Ipv4Network::new(net.network(), net.prefix()).ok()?;
            return Some((net.ip(), subnet));
        }
    }
    None
}

/// `inet 192.168.1.20 netmask 0xffffff00 broadcast ...`
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_ifconfig_inet(text: &str) -> Option<(Ipv4Addr, Ipv4Network)> {
    for line in text.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with("inet ") {
            continue;
        }
        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        let (Some(ip), Some(mask)) = (parts.get(1), parts.get(3)) else {
            continue;
        };
        let Ok(ip) = ip.parse::<Ipv4Addr>() else { continue };
        if ip.is_loopback() {
            continue;
        }
        if let Ok(mask) = u32::from_str_radix(mask.trim_start_matches("0x"), 16) {
            let network = Ipv4Addr::from(u32::from(ip) & mask);
            if let Ok(subnet) = Ipv4Network::new(network, mask.count_ones() as u8) {
                return Some((ip, subnet));
            }
        }
    }
    None
}

/// Pick the first physical adapter from `ipconfig` output.
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn parse_ipconfig(output: &str) -> Option<NetworkInfo> {
    const VIRTUAL_PATTERNS: [&str; 8] = [
        "vEthernet",
        "WSL",
        "Hyper-V",
        "VirtualBox",
        "VMware",
        "Docker",
        "Loopback",
        "Tailscale",
    ];

    #[derive(Default)]
    struct Adapter {
        name: String,
        ip: Option<Ipv4Addr>,
        mask: Option<Ipv4Addr>,
        gateway: Option<Ipv4Addr>,
        is_virtual: bool,
    }

    fn value(line: &str) -> Option<Ipv4Addr> {
        line.split(':')
            .nth(1)
            .map(|v| v.trim().trim_start_matches(". ").trim_end_matches("(Preferred)"))
            .and_then(|v| v.trim().parse().ok())
    }

    let mut adapters: Vec<Adapter> = Vec::new();
    let mut current = Adapter::default();

    for line in output.lines() {
        let trimmed = line.trim();

        if line.starts_with("Ethernet adapter") || line.starts_with("Wireless LAN adapter") {
            if current.ip.is_some() {
                adapters.push(std::mem::take(&mut current));
            }
            let name = line.trim_end_matches(':').to_string();
            current = Adapter {
                is_virtual: VIRTUAL_PATTERNS.iter().any(|p| name.contains(p)),
                name,
                ..Adapter::default()
            };
        } else if trimmed.starts_with("IPv4 Address") || trimmed.starts_with("IP Address") {
            current.ip = value(trimmed).filter(|ip| !ip.is_loopback() && !ip.is_link_local());
        } else if trimmed.starts_with("Subnet Mask") {
            current.mask = value(trimmed);
        } else if trimmed.starts_with("Default Gateway") {
            current.gateway = value(trimmed);
        }
    }
    if current.ip.is_some() {
        adapters.push(current);
    }

    let best = adapters
        .iter()
        .find(|a| !a.is_virtual && a.ip.is_some() && a.gateway.is_some())
        .or_else(|| adapters.iter().find(|a| !a.is_virtual && a.ip.is_some()))?;

    let (ip, mask) = (best.ip?, best.mask?);
    let network = Ipv4Addr::from(u32::from(ip) & u32::from(mask));
    let subnet = Ipv4Network::new(network, u32::from(mask).count_ones() as u8).ok()?;

    Some(NetworkInfo {
        interface: best.name.clone(),
        subnet,
        gateway_ip: best.gateway,
        local_ip: Some(ip),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn test_subnet_hosts_excludes_network_and_broadcast() {
        let hosts = subnet_hosts(net("192.168.1.0/24"));
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(hosts[253], Ipv4Addr::new(192, 168, 1, 254));
    }

    #[test]
    fn test_degenerate_scopes_are_empty() {
        assert!(subnet_hosts(net("10.0.0.0/31")).is_empty());
        assert!(subnet_hosts(net("10.0.0.7/32")).is_empty());
        assert!(range_hosts(Ipv4Addr::new(10, 0, 0, 9), Ipv4Addr::new(10, 0, 0, 1)).is_empty());
    }

    #[test]
    fn test_oversized_scope_refused() {
        assert!(subnet_hosts(net("10.0.0.0/8")).is_empty());
        assert_eq!(subnet_hosts(net("10.1.0.0/16")).len(), 65_534);
    }

    #[test]
    fn test_range_is_inclusive() {
        let scope = ScanScope {
            cidr: None,
            ip_range: Some("192.168.1.10-192.168.1.12".parse().unwrap()),
            only_local_subnet: true,
        };
        let resolved = resolve_scope(net("192.168.1.0/24"), &scope);
        assert_eq!(
            resolved.hosts,
            vec![
                Ipv4Addr::new(192, 168, 1, 10),
                Ipv4Addr::new(192, 168, 1, 11),
                Ipv4Addr::new(192, 168, 1, 12),
            ]
        );
    }

    #[test]
    fn test_restricted_outside_cidr_falls_back_to_active() {
        let active = net("192.168.1.0/24");
        let scope = ScanScope {
            cidr: Some("10.0.0.0/24".to_string()),
            ip_range: None,
            only_local_subnet: true,
        };
        let resolved = resolve_scope(active, &scope);
        assert_eq!(resolved.hosts, subnet_hosts(active));
        assert!(resolved.description.contains("local subnet"));
    }

    #[test]
    fn test_unrestricted_cidr_used_as_given() {
        let scope = ScanScope {
            cidr: Some("10.0.0.0/30".to_string()),
            ip_range: None,
            only_local_subnet: false,
        };
        let resolved = resolve_scope(net("192.168.1.0/24"), &scope);
        assert_eq!(resolved.description, "10.0.0.0/30");
        assert_eq!(
            resolved.hosts,
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
        );
    }

    #[test]
    fn test_restricted_range_outside_uses_cidr_path() {
        let active = net("192.168.1.0/24");
        let scope = ScanScope {
            cidr: Some("192.168.1.0/30".to_string()),
            ip_range: Some("10.0.0.1-10.0.0.5".parse().unwrap()),
            only_local_subnet: true,
        };
        let resolved = resolve_scope(active, &scope);
        assert_eq!(resolved.description, "192.168.1.0/30");
        assert_eq!(resolved.hosts.len(), 2);
    }

    #[test]
    fn test_invalid_cidr_falls_back() {
        let active = net("192.168.1.0/24");
        let scope = ScanScope {
            cidr: Some("not-a-cidr".to_string()),
            ip_range: None,
            only_local_subnet: false,
        };
        assert_eq!(resolve_scope(active, &scope).hosts.len(), 254);
    }

    #[test]
    fn test_ip_range_parse() {
        let range: IpRange = "10.0.0.1 - 10.0.0.9".parse().unwrap();
        assert_eq!(range.start, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(range.end, Ipv4Addr::new(10, 0, 0, 9));
        assert!("10.0.0.1".parse::<IpRange>().is_err());
        assert!("10.0.0.1-bogus".parse::<IpRange>().is_err());
    }

    #[test]
    fn test_parse_linux_route_and_addr() {
        let (gw, iface) =
            parse_linux_default_route("default via 192.168.1.1 dev wlan0 proto dhcp metric 600");
        assert_eq!(gw, Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(iface.as_deref(), Some("wlan0"));

        let addr = "3: wlan0: <BROADCAST,MULTICAST,UP>\n    inet 192.168.1.42/24 brd 192.168.1.255 scope global wlan0";
        let (ip, subnet) = first_inet_cidr(addr).unwrap();
        assert_eq!(ip, Ipv4Addr::new(192, 168, 1, 42));
        assert_eq!(subnet, net("192.168.1.0/24"));

        assert!(first_inet_cidr("1: lo    inet 127.0.0.1/8 scope host lo").is_none());
    }

    #[test]
    fn test_parse_ifconfig() {
        let text = "en0: flags=8863<UP>\n\tinet 10.1.2.3 netmask 0xffff0000 broadcast 10.1.255.255";
        let (ip, subnet) = parse_ifconfig_inet(text).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(subnet, net("10.1.0.0/16"));
    }

    #[test]
    fn test_parse_ipconfig_skips_virtual_adapters() {
        let output = "\
Ethernet adapter vEthernet (WSL):

   IPv4 Address. . . . . . . . . . . : 172.20.0.1
   Subnet Mask . . . . . . . . . . . : 255.255.240.0
   Default Gateway . . . . . . . . . :

Wireless LAN adapter Wi-Fi:

   IPv4 Address. . . . . . . . . . . : 192.168.0.23
   Subnet Mask . . . . . . . . . . . : 255.255.255.0
   Default Gateway . . . . . . . . . : 192.168.0.1
";
        let info = parse_ipconfig(output).unwrap();
        assert_eq!(info.interface, "Wireless LAN adapter Wi-Fi");
        assert_eq!(info.subnet, net("192.168.0.0/24"));
        assert_eq!(info.gateway_ip, Some(Ipv4Addr::new(192, 168, 0, 1)));
    }
}
