//! ONVIF WS-Discovery (multicast Probe on 239.255.255.250:3702)

use super::{multicast_exchange, DiscoveryEvent, EventSink};
use crate::scanner::xml;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const WS_DISCOVERY_GROUP: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 3702);

/// One ProbeMatch answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnvifMatch {
    pub ip: Ipv4Addr,
    pub xaddrs: Vec<String>,
    pub types: Vec<String>,
    pub scopes: Vec<String>,
}

/// WS-Discovery Probe for NetworkVideoTransmitter devices
pub fn probe_message(message_id: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing">
  <s:Header>
    <a:Action s:mustUnderstand="1">http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe</a:Action>
    <a:MessageID>uuid:{}</a:MessageID>
    <a:ReplyTo>
      <a:Address>http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address>
    </a:ReplyTo>
    <a:To s:mustUnderstand="1">urn:schemas-xmlsoap-org:ws:2005:04:discovery</a:To>
  </s:Header>
  <s:Body>
    <Probe xmlns="http://schemas.xmlsoap.org/ws/2005/04/discovery">
      <d:Types xmlns:d="http://schemas.xmlsoap.org/ws/2005/04/discovery" xmlns:dn="http://www.onvif.org/ver10/network/wsdl">dn:NetworkVideoTransmitter</d:Types>
    </Probe>
  </s:Body>
</s:Envelope>"#,
        message_id
    )
}

fn split_list(values: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for token in values.iter().flat_map(|v| v.split_whitespace()) {
        if !out.iter().any(|o| o == token) {
            out.push(token.to_string());
        }
    }
    out
}

/// Parse a ProbeMatches reply received from `ip`.
pub fn parse_probe_matches(ip: Ipv4Addr, reply: &str) -> Option<OnvifMatch> {
    if !xml::has_element(reply, "ProbeMatch") {
        return None;
    }
    Some(OnvifMatch {
        ip,
        xaddrs: split_list(xml::element_texts(reply, "XAddrs")),
        types: split_list(xml::element_texts(reply, "Types")),
        scopes: split_list(xml::element_texts(reply, "Scopes")),
    })
}

/// Run one WS-Discovery sweep, pushing matches into `sink` as they arrive.
pub async fn discover(window: Duration, cancel: CancellationToken, sink: EventSink) -> usize {
    let message = probe_message(&uuid::Uuid::new_v4().to_string());
    let mut found = 0;

    let result = multicast_exchange(
        SocketAddr::V4(WS_DISCOVERY_GROUP),
        &[message],
        window,
        &cancel,
        |ip, reply| {
            if let Some(m) = parse_probe_matches(ip, reply) {
                tracing::debug!("[ONVIF] {} answered with {} XAddrs", ip, m.xaddrs.len());
                found += 1;
                let _ = sink.send(DiscoveryEvent::Onvif(m));
            }
        },
    )
    .await;

    match result {
        Ok(_) => tracing::info!("[ONVIF] WS-Discovery finished: {} responses", found),
        Err(e) => tracing::warn!("[ONVIF] WS-Discovery failed: {}", e),
    }
    found
}

const SYSTEM_DATE_AND_TIME: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope">
  <s:Body>
    <GetSystemDateAndTime xmlns="http://www.onvif.org/ver10/device/wsdl"/>
  </s:Body>
</s:Envelope>"#;

/// Unauthenticated unicast probe of `/onvif/device_service`.
///
/// Catches devices that sit on another multicast segment or ignore Probe.
/// Any SOAP answer (including an auth fault) proves an ONVIF endpoint.
pub async fn unicast_probe(client: &reqwest::Client, ip: Ipv4Addr, port: u16) -> Option<OnvifMatch> {
    let url = format!("http://{}:{}/onvif/device_service", ip, port);
    let response = client
        .post(&url)
        .header("Content-Type", "application/soap+xml; charset=utf-8")
        .body(SYSTEM_DATE_AND_TIME)
        .send()
        .await
        .ok()?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let is_onvif = xml::has_element(&body, "GetSystemDateAndTimeResponse")
        || (xml::has_element(&body, "Fault") && body.contains("onvif"))
        || (status == reqwest::StatusCode::UNAUTHORIZED && body.contains("onvif"));

    if !is_onvif {
        tracing::trace!("[ONVIF] {} is not an ONVIF endpoint (HTTP {})", url, status);
        return None;
    }

    tracing::debug!("[ONVIF] unicast probe hit {}", url);
    Some(OnvifMatch {
        ip,
        xaddrs: vec![url],
        types: Vec::new(),
        scopes: Vec::new(),
    })
}
