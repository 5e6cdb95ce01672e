//! Bonjour / mDNS service browsing

use super::{DiscoveryEvent, EventSink};
use crate::scanner::BonjourService;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Service types that cameras, NVRs and the usual LAN neighbours announce
pub const SERVICE_TYPES: [&str; 12] = [
    "_http._tcp.local.",
    "_rtsp._tcp.local.",
    "_onvif._tcp.local.",
    "_axis-video._tcp.local.",
    "_airplay._tcp.local.",
    "_googlecast._tcp.local.",
    "_hap._tcp.local.",
    "_device-info._tcp.local.",
    "_ipp._tcp.local.",
    "_smb._tcp.local.",
    "_raop._tcp.local.",
    "_workstation._tcp.local.",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BonjourRecord {
    pub ip: Ipv4Addr,
    pub service: BonjourService,
}

/// Instance label of a resolved service (`Front Door._rtsp._tcp.local.` -> `Front Door`)
pub fn instance_name(fullname: &str, service_type: &str) -> String {
    let name = fullname
        .strip_suffix(service_type)
        .unwrap_or(fullname)
        .trim_end_matches('.');
    if name.is_empty() {
        fullname.trim_end_matches('.').to_string()
    } else {
        name.to_string()
    }
}

/// Records for every IPv4 address of a resolved service
fn records_for(info: &ServiceInfo, service_type: &str) -> Vec<BonjourRecord> {
    let mut txt: Vec<String> = info
        .get_properties()
        .iter()
        .map(|p| {
            let value = p.val_str();
            if value.is_empty() {
                p.key().to_string()
            } else {
                format!("{}={}", p.key(), value)
            }
        })
        .collect();
    txt.sort();

    let service = BonjourService {
        name: instance_name(info.get_fullname(), service_type),
        service_type: service_type.trim_end_matches('.').to_string(),
        port: info.get_port(),
        txt,
    };

    info.get_addresses()
        .iter()
        .filter_map(|addr| addr.to_string().parse::<Ipv4Addr>().ok())
        .map(|ip| BonjourRecord {
            ip,
            service: service.clone(),
        })
        .collect()
}

/// Browse [`SERVICE_TYPES`] for `window`, pushing resolved services into `sink`.
pub async fn discover(window: Duration, cancel: CancellationToken, sink: EventSink) -> usize {
    let daemon = match ServiceDaemon::new() {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!("[Bonjour] Failed to create mDNS daemon: {}", e);
            return 0;
        }
    };

    let deadline = Instant::now() + window;
    let mut browsers = JoinSet::new();

    for service_type in SERVICE_TYPES {
        let receiver = match daemon.browse(service_type) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("[Bonjour] Cannot browse {}: {}", service_type, e);
                continue;
            }
        };
        let sink = sink.clone();
        let cancel = cancel.clone();

        browsers.spawn(async move {
            let mut found = 0usize;
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = tokio::time::timeout_at(deadline, receiver.recv_async()) => r,
                };
                match event {
                    Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                        for record in records_for(&info, service_type) {
                            tracing::trace!("[Bonjour] {} {}", record.ip, record.service.name);
                            found += 1;
                            let _ = sink.send(DiscoveryEvent::Bonjour(record));
                        }
                    }
                    Ok(Ok(_)) => continue,
                    Ok(Err(_)) | Err(_) => break,
                }
            }
            found
        });
    }

    let mut found = 0;
    while let Some(result) = browsers.join_next().await {
        found += result.unwrap_or(0);
    }

    for service_type in SERVICE_TYPES {
        let _ = daemon.stop_browse(service_type);
    }
    let _ = daemon.shutdown();

    tracing::info!("[Bonjour] Browse finished: {} service records", found);
    found
}
