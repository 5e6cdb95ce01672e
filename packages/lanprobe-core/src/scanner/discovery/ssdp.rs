//! SSDP (UPnP) discovery via M-SEARCH on 239.255.255.250:1900

use super::{multicast_exchange, DiscoveryEvent, EventSink};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const SSDP_GROUP: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900);

const SEARCH_TARGETS: [&str; 3] = [
    "ssdp:all",
    "upnp:rootdevice",
    "urn:schemas-upnp-org:device:MediaServer:1",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SsdpResponse {
    pub ip: Ipv4Addr,
    pub server: Option<String>,
    pub location: Option<String>,
    pub st: Option<String>,
    pub usn: Option<String>,
}

pub fn m_search(search_target: &str, mx: u64) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {}\r\n\
         ST: {}\r\n\r\n",
        SSDP_GROUP, mx, search_target
    )
}

/// Case-insensitive header lookup on an HTTP-over-UDP message
fn extract_header(message: &str, name: &str) -> Option<String> {
    message.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if !key.trim().eq_ignore_ascii_case(name) {
            return None;
        }
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Parse a search response or NOTIFY from `ip`. M-SEARCH echoes are ignored.
pub fn parse_response(ip: Ipv4Addr, message: &str) -> Option<SsdpResponse> {
    let first_line = message.lines().next()?.trim();
    let is_reply = first_line.starts_with("HTTP/") || first_line.starts_with("NOTIFY");
    if !is_reply {
        return None;
    }

    Some(SsdpResponse {
        ip,
        server: extract_header(message, "SERVER"),
        location: extract_header(message, "LOCATION"),
        // NOTIFY carries NT instead of ST
        st: extract_header(message, "ST").or_else(|| extract_header(message, "NT")),
        usn: extract_header(message, "USN"),
    })
}

/// Run one SSDP sweep, pushing every response into `sink`.
pub async fn discover(window: Duration, cancel: CancellationToken, sink: EventSink) -> usize {
    let mx = window.as_secs().clamp(1, 5);
    let payloads: Vec<String> = SEARCH_TARGETS.iter().map(|st| m_search(st, mx)).collect();
    let mut found = 0;

    let result = multicast_exchange(
        SocketAddr::V4(SSDP_GROUP),
        &payloads,
        window,
        &cancel,
        |ip, message| {
            if let Some(response) = parse_response(ip, message) {
                tracing::trace!("[SSDP] {} st={:?}", ip, response.st);
                found += 1;
                let _ = sink.send(DiscoveryEvent::Ssdp(response));
            }
        },
    )
    .await;

    match result {
        Ok(_) => tracing::info!("[SSDP] Discovery finished: {} responses", found),
        Err(e) => tracing::warn!("[SSDP] Discovery failed: {}", e),
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_response() {
        let ip = Ipv4Addr::new(192, 168, 1, 64);
        let msg = "HTTP/1.1 200 OK\r\n\
                   CACHE-CONTROL: max-age=1800\r\n\
                   Location: http://192.168.1.64:49152/rootDesc.xml\r\n\
                   server: Linux/3.0, UPnP/1.0, Hikvision-Webs/1.0\r\n\
                   ST: upnp:rootdevice\r\n\
                   USN: uuid:abc::upnp:rootdevice\r\n\r\n";
        let r = parse_response(ip, msg).unwrap();
        assert_eq!(r.ip, ip);
        assert_eq!(r.location.as_deref(), Some("http://192.168.1.64:49152/rootDesc.xml"));
        assert_eq!(r.server.as_deref(), Some("Linux/3.0, UPnP/1.0, Hikvision-Webs/1.0"));
        assert_eq!(r.st.as_deref(), Some("upnp:rootdevice"));
        assert_eq!(r.usn.as_deref(), Some("uuid:abc::upnp:rootdevice"));
    }

    #[test]
    fn test_notify_uses_nt() {
        let msg = "NOTIFY * HTTP/1.1\r\nNT: urn:schemas-upnp-org:device:MediaServer:1\r\nNTS: ssdp:alive\r\n\r\n";
        let r = parse_response(Ipv4Addr::new(10, 0, 0, 3), msg).unwrap();
        assert_eq!(r.st.as_deref(), Some("urn:schemas-upnp-org:device:MediaServer:1"));
        assert_eq!(r.server, None);
    }

    #[test]
    fn test_ignores_search_requests() {
        let ip = Ipv4Addr::new(10, 0, 0, 3);
        assert!(parse_response(ip, &m_search("ssdp:all", 2)).is_none());
        assert!(parse_response(ip, "").is_none());
    }

    #[test]
    fn test_m_search_format() {
        let msg = m_search("upnp:rootdevice", 3);
        assert!(msg.starts_with("M-SEARCH * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\n"));
        assert!(msg.contains("MX: 3\r\n"));
        assert!(msg.ends_with("ST: upnp:rootdevice\r\n\r\n"));
    }
}
