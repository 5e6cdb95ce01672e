//! Records published by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

/// Coarse confidence bucket derived from a 0-100 score
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl ConfidenceLevel {
    /// low < 40, medium 40-69, high >= 70
    pub fn from_score(score: u8) -> Self {
        match score {
            70..=u8::MAX => ConfidenceLevel::High,
            40..=69 => ConfidenceLevel::Medium,
            _ => ConfidenceLevel::Low,
        }
    }
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfidenceLevel::Low => write!(f, "low"),
            ConfidenceLevel::Medium => write!(f, "medium"),
            ConfidenceLevel::High => write!(f, "high"),
        }
    }
}

/// How likely a host is to be a camera/media device, and why
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfidence {
    pub score: u8,
    pub level: ConfidenceLevel,
    pub reasons: Vec<String>,
}

/// How strongly the OUI vendor is corroborated by other evidence
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorConfidence {
    pub score: u8,
    pub level: ConfidenceLevel,
    pub reasons: Vec<String>,
}

/// Which channel first produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    ScopeSeed,
    PortScan,
    Arp,
    Onvif,
    Ssdp,
    Bonjour,
    Http,
    Hostname,
    Manual,
}

/// One-shot sweeps run once; continuous sweeps loop until stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    #[default]
    OneShot,
    Continuous,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub source: DiscoverySource,
    pub mode: ScanMode,
    pub observed_at: DateTime<Utc>,
}

impl Provenance {
    pub fn now(source: DiscoverySource, mode: ScanMode) -> Self {
        Self {
            source,
            mode,
            observed_at: Utc::now(),
        }
    }
}

/// A resolved Bonjour/mDNS service instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BonjourService {
    pub name: String,
    pub service_type: String,
    pub port: u16,
    pub txt: Vec<String>,
}

/// One candidate IP in scan scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostEntry {
    pub ip: Ipv4Addr,
    pub is_alive: bool,
    pub open_ports: BTreeSet<u16>,
    pub hostname: Option<String>,
    pub mac_address: Option<String>,
    pub vendor: Option<String>,
    pub vendor_confidence_score: u8,
    pub vendor_confidence_reasons: Vec<String>,
    pub host_confidence: HostConfidence,
    pub ssdp_server: Option<String>,
    pub ssdp_location: Option<String>,
    pub ssdp_st: Option<String>,
    pub ssdp_usn: Option<String>,
    pub bonjour_services: Vec<BonjourService>,
    pub http_status: Option<u16>,
    pub http_server: Option<String>,
    pub http_auth: Option<String>,
    pub http_title: Option<String>,
    pub provenance: Provenance,
}

impl HostEntry {
    pub fn new(ip: Ipv4Addr, provenance: Provenance) -> Self {
        Self {
            ip,
            is_alive: false,
            open_ports: BTreeSet::new(),
            hostname: None,
            mac_address: None,
            vendor: None,
            vendor_confidence_score: 0,
            vendor_confidence_reasons: Vec::new(),
            host_confidence: HostConfidence::default(),
            ssdp_server: None,
            ssdp_location: None,
            ssdp_st: None,
            ssdp_usn: None,
            bonjour_services: Vec::new(),
            http_status: None,
            http_server: None,
            http_auth: None,
            http_title: None,
            provenance,
        }
    }

    /// Alive and either exposing a scanned port or scoring medium or better
    pub fn is_interesting(&self) -> bool {
        self.is_alive
            && (!self.open_ports.is_empty() || self.host_confidence.level >= ConfidenceLevel::Medium)
    }
}

/// Outcome of a single RTSP DESCRIBE attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtspProbeResult {
    pub uri: String,
    pub success: bool,
    pub status_code: Option<u16>,
    pub server: Option<String>,
    pub codec_hints: Vec<String>,
}

/// Username/password pair stored for a device
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// A host that exposed at least one scanned port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub ip: Ipv4Addr,
    pub open_ports: BTreeSet<u16>,
    pub mac_address: Option<String>,
    pub vendor: Option<String>,
    pub hostname: Option<String>,
    pub http_title: Option<String>,
    pub vendor_confidence_score: u8,
    pub vendor_confidence_reasons: Vec<String>,
    pub host_confidence: HostConfidence,
    pub discovered_via_onvif: bool,
    pub onvif_xaddrs: Vec<String>,
    pub onvif_types: Vec<String>,
    pub onvif_scopes: Vec<String>,
    pub onvif_rtsp_uri: Option<String>,
    pub onvif_requires_auth: bool,
    pub onvif_last_error: Option<String>,
    pub onvif_fetch_in_progress: bool,
    pub username: Option<String>,
    #[serde(skip_serializing, default)]
    pub password: Option<String>,
    pub rtsp_probe_in_progress: bool,
    pub rtsp_probe_results: Vec<RtspProbeResult>,
    pub best_rtsp_uri: Option<String>,
    pub last_rtsp_probe_summary: Option<String>,
}

impl Device {
    pub fn new(ip: Ipv4Addr) -> Self {
        Self {
            ip,
            open_ports: BTreeSet::new(),
            mac_address: None,
            vendor: None,
            hostname: None,
            http_title: None,
            vendor_confidence_score: 0,
            vendor_confidence_reasons: Vec::new(),
            host_confidence: HostConfidence::default(),
            discovered_via_onvif: false,
            onvif_xaddrs: Vec::new(),
            onvif_types: Vec::new(),
            onvif_scopes: Vec::new(),
            onvif_rtsp_uri: None,
            onvif_requires_auth: false,
            onvif_last_error: None,
            onvif_fetch_in_progress: false,
            username: None,
            password: None,
            rtsp_probe_in_progress: false,
            rtsp_probe_results: Vec::new(),
            best_rtsp_uri: None,
            last_rtsp_probe_summary: None,
        }
    }

    /// Stored credentials, if a username was set
    pub fn credentials(&self) -> Option<Credentials> {
        let username = self.username.clone().filter(|u| !u.is_empty())?;
        Some(Credentials {
            username,
            password: self.password.clone().unwrap_or_default(),
        })
    }

    pub fn rtsp_verified(&self) -> bool {
        self.rtsp_probe_results.iter().any(|r| r.success)
    }
}

/// Snapshot of one scan run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub scope_description: String,
    pub mode: ScanMode,
    pub total_hosts: usize,
    pub alive_hosts: usize,
    pub interesting_hosts: usize,
    pub safe_mode: bool,
}

/// Port-scan progress of the current run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgress {
    pub scanned_hosts: usize,
    pub total_hosts: usize,
}

impl ScanProgress {
    pub fn percent(&self) -> u8 {
        if self.total_hosts == 0 {
            return 0;
        }
        ((self.scanned_hosts.min(self.total_hosts) * 100) / self.total_hosts) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_thresholds() {
        for score in 0..=100u8 {
            let level = ConfidenceLevel::from_score(score);
            match score {
                0..=39 => assert_eq!(level, ConfidenceLevel::Low, "score {}", score),
                40..=69 => assert_eq!(level, ConfidenceLevel::Medium, "score {}", score),
                _ => assert_eq!(level, ConfidenceLevel::High, "score {}", score),
            }
        }
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials {
            username: "admin".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_password_not_serialized() {
        let mut device = Device::new(Ipv4Addr::new(10, 0, 0, 5));
        device.username = Some("admin".to_string());
        device.password = Some("secret".to_string());
        let json = serde_json::to_string(&device).unwrap();
        assert!(json.contains("\"username\":\"admin\""));
        assert!(!json.contains("secret"));
    }

    #[test]
    fn test_progress_percent() {
        let p = ScanProgress {
            scanned_hosts: 127,
            total_hosts: 254,
        };
        assert_eq!(p.percent(), 50);
        assert_eq!(ScanProgress::default().percent(), 0);
    }
}
