//! Passive-ish service discovery channels.
//!
//! Each channel runs on its own timer and pushes [`DiscoveryEvent`]s into a
//! sink as responses arrive. Channels know nothing about each other or about
//! the host table; the engine merges whatever they report.

pub mod bonjour;
pub mod onvif;
pub mod ssdp;

pub use bonjour::BonjourRecord;
pub use onvif::OnvifMatch;
pub use ssdp::SsdpResponse;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Evidence produced by a discovery channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Onvif(OnvifMatch),
    Ssdp(SsdpResponse),
    Bonjour(BonjourRecord),
}

impl DiscoveryEvent {
    pub fn ip(&self) -> Ipv4Addr {
        match self {
            DiscoveryEvent::Onvif(m) => m.ip,
            DiscoveryEvent::Ssdp(r) => r.ip,
            DiscoveryEvent::Bonjour(r) => r.ip,
        }
    }
}

pub type EventSink = mpsc::UnboundedSender<DiscoveryEvent>;

/// Send `payloads` to a multicast group and hand every reply to `on_reply`
/// until `window` elapses or `cancel` fires.
pub(crate) async fn multicast_exchange<F>(
    group: SocketAddr,
    payloads: &[String],
    window: Duration,
    cancel: &CancellationToken,
    mut on_reply: F,
) -> std::io::Result<usize>
where
    F: FnMut(Ipv4Addr, &str),
{
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;
    socket.set_multicast_ttl_v4(2)?;

    for payload in payloads {
        socket.send_to(payload.as_bytes(), group).await?;
    }

    let mut buffer = vec![0u8; 8192];
    let mut replies = 0;
    let start = Instant::now();

    loop {
        let Some(remaining) = window.checked_sub(start.elapsed()).filter(|d| !d.is_zero()) else {
            break;
        };

        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            r = tokio::time::timeout(remaining, socket.recv_from(&mut buffer)) => r,
        };

        match received {
            Ok(Ok((size, SocketAddr::V4(addr)))) => {
                replies += 1;
                let text = String::from_utf8_lossy(&buffer[..size]);
                on_reply(*addr.ip(), &text);
            }
            Ok(Ok((_, addr))) => {
                tracing::trace!("Ignoring non-IPv4 reply from {}", addr);
            }
            Ok(Err(e)) => {
                tracing::debug!("Error receiving from {}: {}", group, e);
            }
            Err(_) => break,
        }
    }

    Ok(replies)
}

/// IPv4 host of a URL like `http://10.0.0.5:80/onvif/device_service`
pub(crate) fn url_ipv4(raw: &str) -> Option<Ipv4Addr> {
    let parsed = url::Url::parse(raw).ok()?;
    match parsed.host()? {
        url::Host::Ipv4(ip) => Some(ip),
        url::Host::Domain(d) => d.parse().ok(),
        url::Host::Ipv6(_) => None,
    }
}

pub(crate) fn as_ipv4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}
