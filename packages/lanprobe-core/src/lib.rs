//! LanProbe Core Library
//!
//! This crate provides the discovery engine behind LanProbe agents:
//! - Subnet sweeps (TCP connect probes on a fixed camera/media port set)
//! - ARP table reading and MAC OUI vendor lookup (hot-reloadable OUI file)
//! - Service discovery (ONVIF WS-Discovery, SSDP, Bonjour/mDNS)
//! - HTTP fingerprinting, ONVIF stream URI resolution and RTSP probing
//! - Evidence merging and explainable confidence scoring
//! - CSV/JSON export and audit logs
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lanprobe_core::{config, scanner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = config::load_engine_config();
//!     let oui = Arc::new(scanner::OuiStore::new(config.oui_path.clone()));
//!     let engine = scanner::ScanEngine::builder(config, oui).build()?;
//!
//!     engine.run_scan(scanner::ScanOptions::default()).await?;
//!     for device in engine.devices().await {
//!         println!("{} {:?}", device.ip, device.host_confidence.level);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod export;
pub mod scanner;

// Re-export commonly used types
pub use config::{ConfigSource, EngineConfig, GateLimits};
pub use export::{AuditLog, BleEvidence, ExportRecord, ExportSnapshot};
pub use scanner::{
    ConfidenceLevel, Device, EngineEvent, HostConfidence, HostEntry, NetworkInfo, OuiStore,
    ScanEngine, ScanError, ScanMode, ScanOptions, ScanProgress, ScanScope, ScanSummary,
};
