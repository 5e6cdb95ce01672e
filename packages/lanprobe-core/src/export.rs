//! Export snapshots (CSV/JSON) and per-scan audit logs

use crate::scanner::rtsp::strip_credentials;
use crate::scanner::{ConfidenceLevel, Device, HostEntry, ScanSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fixed CSV column order
pub const CSV_HEADER: [&str; 22] = [
    "ip",
    "status",
    "ports",
    "hostname",
    "mac",
    "vendor",
    "vendorConfidenceScore",
    "vendorConfidenceReasons",
    "hostConfidenceScore",
    "hostConfidenceLevel",
    "hostConfidenceReasons",
    "ssdpServer",
    "ssdpLocation",
    "ssdpST",
    "ssdpUSN",
    "bonjourServices",
    "httpStatus",
    "httpServer",
    "httpAuth",
    "httpTitle",
    "onvif",
    "rtspURI",
];

/// Separator for list-valued CSV cells
const LIST_SEPARATOR: &str = "; ";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV output is not valid UTF-8")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// One exported host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRecord {
    pub ip: Ipv4Addr,
    pub status: String,
    pub ports: Vec<u16>,
    pub hostname: Option<String>,
    pub mac: Option<String>,
    pub vendor: Option<String>,
    pub vendor_confidence_score: u8,
    pub vendor_confidence_reasons: Vec<String>,
    pub host_confidence_score: u8,
    pub host_confidence_level: ConfidenceLevel,
    pub host_confidence_reasons: Vec<String>,
    pub ssdp_server: Option<String>,
    pub ssdp_location: Option<String>,
    #[serde(rename = "ssdpST")]
    pub ssdp_st: Option<String>,
    #[serde(rename = "ssdpUSN")]
    pub ssdp_usn: Option<String>,
    pub bonjour_services: Vec<String>,
    pub http_status: Option<u16>,
    pub http_server: Option<String>,
    pub http_auth: Option<String>,
    pub http_title: Option<String>,
    pub onvif: bool,
    #[serde(rename = "rtspURI")]
    pub rtsp_uri: Option<String>,
}

impl ExportRecord {
    /// Flatten a host and its device record (if any). Device fields fill gaps
    /// in the host record; stream URIs are exported without credentials.
    pub fn new(host: &HostEntry, device: Option<&Device>) -> Self {
        let rtsp_uri = device
            .and_then(|d| d.best_rtsp_uri.as_deref().or(d.onvif_rtsp_uri.as_deref()))
            .map(strip_credentials);

        let mut ports: Vec<u16> = host.open_ports.iter().copied().collect();
        if let Some(d) = device {
            ports.extend(d.open_ports.iter().copied().filter(|p| !host.open_ports.contains(p)));
            ports.sort_unstable();
        }

        Self {
            ip: host.ip,
            status: if host.is_alive { "alive" } else { "down" }.to_string(),
            ports,
            hostname: host
                .hostname
                .clone()
                .or_else(|| device.and_then(|d| d.hostname.clone())),
            mac: host
                .mac_address
                .clone()
                .or_else(|| device.and_then(|d| d.mac_address.clone())),
            vendor: host
                .vendor
                .clone()
                .or_else(|| device.and_then(|d| d.vendor.clone())),
            vendor_confidence_score: host.vendor_confidence_score,
            vendor_confidence_reasons: host.vendor_confidence_reasons.clone(),
            host_confidence_score: host.host_confidence.score,
            host_confidence_level: host.host_confidence.level,
            host_confidence_reasons: host.host_confidence.reasons.clone(),
            ssdp_server: host.ssdp_server.clone(),
            ssdp_location: host.ssdp_location.clone(),
            ssdp_st: host.ssdp_st.clone(),
            ssdp_usn: host.ssdp_usn.clone(),
            bonjour_services: host
                .bonjour_services
                .iter()
                .map(|s| format!("{} ({}:{})", s.name, s.service_type, s.port))
                .collect(),
            http_status: host.http_status,
            http_server: host.http_server.clone(),
            http_auth: host.http_auth.clone(),
            http_title: host
                .http_title
                .clone()
                .or_else(|| device.and_then(|d| d.http_title.clone())),
            onvif: device.is_some_and(|d| d.discovered_via_onvif),
            rtsp_uri,
        }
    }

    fn csv_row(&self) -> Vec<String> {
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        vec![
            self.ip.to_string(),
            self.status.clone(),
            self.ports
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(LIST_SEPARATOR),
            opt(&self.hostname),
            opt(&self.mac),
            opt(&self.vendor),
            self.vendor_confidence_score.to_string(),
            self.vendor_confidence_reasons.join(LIST_SEPARATOR),
            self.host_confidence_score.to_string(),
            self.host_confidence_level.to_string(),
            self.host_confidence_reasons.join(LIST_SEPARATOR),
            opt(&self.ssdp_server),
            opt(&self.ssdp_location),
            opt(&self.ssdp_st),
            opt(&self.ssdp_usn),
            self.bonjour_services.join(LIST_SEPARATOR),
            self.http_status.map(|s| s.to_string()).unwrap_or_default(),
            opt(&self.http_server),
            opt(&self.http_auth),
            opt(&self.http_title),
            self.onvif.to_string(),
            opt(&self.rtsp_uri),
        ]
    }
}

/// Point-in-time export of the host table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSnapshot {
    pub timestamp: DateTime<Utc>,
    pub records: Vec<ExportRecord>,
}

impl ExportSnapshot {
    /// One record per host, in address order. Devices without a host entry
    /// are not exported.
    pub fn new(hosts: &[HostEntry], devices: &[Device]) -> Self {
        let devices: BTreeMap<Ipv4Addr, &Device> = devices.iter().map(|d| (d.ip, d)).collect();
        let mut records: Vec<ExportRecord> = hosts
            .iter()
            .map(|h| ExportRecord::new(h, devices.get(&h.ip).copied()))
            .collect();
        records.sort_by_key(|r| r.ip);
        Self {
            timestamp: Utc::now(),
            records,
        }
    }

    /// Drop hosts that never answered
    pub fn alive_only(mut self) -> Self {
        self.records.retain(|r| r.status == "alive");
        self
    }

    pub fn to_csv(&self) -> Result<String, ExportError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(CSV_HEADER)?;
        for record in &self.records {
            writer.write_record(record.csv_row())?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| ExportError::Csv(e.into_error().into()))?;
        Ok(String::from_utf8(bytes)?)
    }

    pub fn to_json(&self) -> Result<String, ExportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), ExportError> {
        write_file(path, &self.to_csv()?)
    }

    pub fn write_json(&self, path: &Path) -> Result<(), ExportError> {
        write_file(path, &self.to_json()?)
    }
}

/// Bluetooth LE sighting supplied by an external scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BleEvidence {
    pub identifier: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub manufacturer: Option<String>,
    pub service_uuids: Vec<String>,
    pub observed_at: DateTime<Utc>,
}

/// Durable record of one scan for later review
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLog {
    pub generated_at: DateTime<Utc>,
    pub agent_version: String,
    pub summary: Option<ScanSummary>,
    pub hosts: Vec<HostEntry>,
    pub devices: Vec<Device>,
    pub ble_evidence: Vec<BleEvidence>,
    pub log_lines: Vec<String>,
}

impl AuditLog {
    pub fn new(
        summary: Option<ScanSummary>,
        hosts: Vec<HostEntry>,
        devices: Vec<Device>,
        log_lines: Vec<String>,
    ) -> Self {
        Self {
            generated_at: Utc::now(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            summary,
            hosts,
            devices,
            ble_evidence: Vec::new(),
            log_lines,
        }
    }

    pub fn with_ble_evidence(mut self, evidence: Vec<BleEvidence>) -> Self {
        self.ble_evidence = evidence;
        self
    }

    pub fn to_json(&self) -> Result<String, ExportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write as pretty JSON, creating parent directories as needed
    pub fn write(&self, path: &Path) -> Result<(), ExportError> {
        write_file(path, &self.to_json()?)
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), ExportError> {
    let io_err = |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    fs::write(path, contents).map_err(io_err)?;
    tracing::info!("Wrote {}", path.display());
    Ok(())
}
