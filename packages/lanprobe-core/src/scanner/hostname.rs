//! Reverse hostname resolution through the OS resolver tools

use super::gate::Gate;
use super::hidden_command;
use futures::future::join_all;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::time::timeout;

/// Resolve hostnames for `ips`, at most `gate.limit()` lookups at a time.
/// Addresses without an answer inside `per_host` are left out.
pub async fn resolve_all(ips: &[Ipv4Addr], gate: &Gate, per_host: Duration) -> Vec<(Ipv4Addr, String)> {
    let lookups = ips.iter().map(|&ip| async move {
        let hostname = gate
            .run(async { timeout(per_host, resolve_hostname(ip)).await.ok().flatten() })
            .await
            .ok()
            .flatten();
        hostname.map(|h| (ip, h))
    });

    let resolved: Vec<_> = join_all(lookups).await.into_iter().flatten().collect();
    tracing::debug!("Resolved {}/{} hostnames", resolved.len(), ips.len());
    resolved
}

/// One reverse lookup via getent, host or avahi-resolve (Windows: Resolve-DnsName, nbtstat).
pub async fn resolve_hostname(ip: Ipv4Addr) -> Option<String> {
    let ip = ip.to_string();
    tokio::task::spawn_blocking(move || lookup_blocking(&ip))
        .await
        .ok()
        .flatten()
        .map(|h| h.trim_end_matches('.').to_string())
        .filter(|h| !h.is_empty())
}

#[cfg(not(target_os = "windows"))]
fn lookup_blocking(ip: &str) -> Option<String> {
    let run = |program: &str, args: &[&str]| -> Option<String> {
        let output = hidden_command(program).args(args).output().ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
    };

    if let Some(name) = run("getent", &["hosts", ip]).and_then(|out| parse_getent(&out)) {
        return Some(name);
    }

    if let Some(name) = run("host", &[ip]).and_then(|out| parse_host_pointer(&out)) {
        return Some(name);
    }

    #[cfg(target_os = "linux")]
    if let Some(name) = run("avahi-resolve", &["-a", ip]).and_then(|out| parse_getent(&out)) {
        return Some(name);
    }

    None
}

#[cfg(target_os = "windows")]
fn lookup_blocking(ip: &str) -> Option<String> {
    let script = format!(
        "try {{ (Resolve-DnsName -Name '{}' -Type PTR -ErrorAction Stop).NameHost }} catch {{ }}",
        ip
    );
    if let Ok(output) = hidden_command("powershell")
        .args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command", &script])
        .output()
    {
        let out = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() && !out.is_empty() && !out.contains("error") && !out.contains(ip) {
            return out.lines().next().map(str::to_string);
        }
    }

    let output = hidden_command("nbtstat").args(["-A", ip]).output().ok()?;
    parse_nbtstat(&String::from_utf8_lossy(&output.stdout))
}

/// `192.168.1.64    cam-frontdoor.lan` (getent, avahi-resolve)
fn parse_getent(out: &str) -> Option<String> {
    out.lines()
        .next()?
        .split_whitespace()
        .nth(1)
        .map(str::to_string)
}

/// `64.1.168.192.in-addr.arpa domain name pointer cam-frontdoor.lan.`
fn parse_host_pointer(out: &str) -> Option<String> {
    let name = out.split("pointer").nth(1)?.lines().next()?.trim();
    (!name.is_empty()).then(|| name.trim_end_matches('.').to_string())
}

/// First unique `<00>` name in an `nbtstat -A` table
#[cfg_attr(not(any(target_os = "windows", test)), allow(dead_code))]
fn parse_nbtstat(out: &str) -> Option<String> {
    out.lines()
        .map(str::trim)
        .find(|l| l.contains("<00>") && l.contains("UNIQUE"))
        .and_then(|l| l.split_whitespace().next())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_getent() {
        assert_eq!(
            parse_getent("192.168.1.64    cam-frontdoor.lan\n").as_deref(),
            Some("cam-frontdoor.lan")
        );
        assert_eq!(parse_getent(""), None);
    }

    #[test]
    fn test_parse_host_pointer() {
        assert_eq!(
            parse_host_pointer("64.1.168.192.in-addr.arpa domain name pointer cam-frontdoor.lan.\n")
                .as_deref(),
            Some("cam-frontdoor.lan")
        );
        assert_eq!(parse_host_pointer("Host 64.1.168.192.in-addr.arpa. not found: 3(NXDOMAIN)"), None);
    }

    #[test]
    fn test_parse_nbtstat() {
        let out = "    NetBIOS Remote Machine Name Table\n\n       Name               Type         Status\n    ---------------------------------------------\n    DVR-OFFICE     <00>  UNIQUE      Registered\n    WORKGROUP      <00>  GROUP       Registered\n";
        assert_eq!(parse_nbtstat(out).as_deref(), Some("DVR-OFFICE"));
    }
}
