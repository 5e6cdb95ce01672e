//! Engine configuration.
//!
//! Values are resolved with priority:
//! 1. Environment variables (`LANPROBE_OUI_PATH`, `LANPROBE_SAFE_MODE`)
//! 2. Config file (`~/.config/lanprobe/config.toml`)
//! 3. Built-in defaults

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the OUI database path
const ENV_OUI_PATH: &str = "LANPROBE_OUI_PATH";

/// Environment variable overriding the Safe Mode default ("0"/"false" disables)
const ENV_SAFE_MODE: &str = "LANPROBE_SAFE_MODE";

/// Ports probed on every candidate host
pub const SCAN_PORTS: [u16; 9] = [80, 443, 554, 8000, 8080, 8443, 1935, 3702, 8554];

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    scan: Option<ScanSection>,
    limits: Option<LimitsSection>,
    oui: Option<OuiSection>,
}

#[derive(Debug, Deserialize, Default)]
struct ScanSection {
    connect_timeout_ms: Option<u64>,
    http_timeout_ms: Option<u64>,
    discovery_timeout_ms: Option<u64>,
    arp_warmup_timeout_ms: Option<u64>,
    rtsp_timeout_ms: Option<u64>,
    soap_timeout_ms: Option<u64>,
    hostname_timeout_ms: Option<u64>,
    continuous_pause_secs: Option<u64>,
    safe_mode: Option<bool>,
    onvif_unicast_probe: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct LimitsSection {
    host: Option<usize>,
    port_probe: Option<usize>,
    http: Option<usize>,
    onvif_soap: Option<usize>,
    onvif_rtsp: Option<usize>,
    rtsp_probe: Option<usize>,
    hostname: Option<usize>,
    arp_warmup: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct OuiSection {
    path: Option<PathBuf>,
    watch: Option<bool>,
}

/// Concurrency limits for each bounded gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateLimits {
    pub host: usize,
    pub port_probe: usize,
    pub http: usize,
    pub onvif_soap: usize,
    pub onvif_rtsp: usize,
    pub rtsp_probe: usize,
    pub hostname: usize,
    pub arp_warmup: usize,
}

impl Default for GateLimits {
    fn default() -> Self {
        Self {
            host: 64,
            port_probe: 128,
            http: 8,
            onvif_soap: 8,
            onvif_rtsp: 4,
            rtsp_probe: 4,
            hostname: 16,
            arp_warmup: 64,
        }
    }
}

impl GateLimits {
    /// Every gate set to the same limit. Handy for tests.
    pub fn uniform(limit: usize) -> Self {
        Self {
            host: limit,
            port_probe: limit,
            http: limit,
            onvif_soap: limit,
            onvif_rtsp: limit,
            rtsp_probe: limit,
            hostname: limit,
            arp_warmup: limit,
        }
    }
}

/// Runtime engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ports: Vec<u16>,
    pub connect_timeout: Duration,
    pub http_timeout: Duration,
    pub discovery_timeout: Duration,
    pub arp_warmup_timeout: Duration,
    pub rtsp_timeout: Duration,
    pub soap_timeout: Duration,
    pub hostname_timeout: Duration,
    /// Pause between passes in continuous mode
    pub continuous_pause: Duration,
    pub limits: GateLimits,
    /// Initial Safe Mode state; toggled at runtime on the engine
    pub safe_mode: bool,
    /// Unicast GetSystemDateAndTime probe for HTTP hosts multicast missed
    pub onvif_unicast_probe: bool,
    pub oui_path: Option<PathBuf>,
    pub watch_oui: bool,
    /// Source of the configuration (for logging)
    pub source: ConfigSource,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ports: SCAN_PORTS.to_vec(),
            connect_timeout: Duration::from_millis(1500),
            http_timeout: Duration::from_millis(2500),
            discovery_timeout: Duration::from_secs(3),
            arp_warmup_timeout: Duration::from_millis(200),
            rtsp_timeout: Duration::from_secs(3),
            soap_timeout: Duration::from_secs(4),
            hostname_timeout: Duration::from_secs(2),
            continuous_pause: Duration::from_secs(5),
            limits: GateLimits::default(),
            safe_mode: true,
            onvif_unicast_probe: false,
            oui_path: default_oui_path(),
            watch_oui: true,
            source: ConfigSource::Default,
        }
    }
}

/// Where the configuration came from
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    /// Using default hardcoded values
    Default,
    /// At least one value came from an environment variable
    Environment,
    /// Loaded from config file
    ConfigFile,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::ConfigFile => write!(f, "config file"),
        }
    }
}

/// Default OUI database location (`~/SODS/oui/oui_combined.txt`)
pub fn default_oui_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join("SODS").join("oui").join("oui_combined.txt"))
}

/// Get the path to the configuration file
pub fn get_config_file_path() -> Option<PathBuf> {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|p| p.join("lanprobe").join("config.toml"))
}

fn load_config_file(path: &Path) -> Option<ConfigFile> {
    if !path.exists() {
        return None;
    }

    match fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::debug!("Loaded config from {:?}", path);
                Some(config)
            }
            Err(e) => {
                tracing::warn!("Failed to parse config file {:?}: {}", path, e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("Failed to read config file {:?}: {}", path, e);
            None
        }
    }
}

/// Load engine configuration with priority:
/// 1. Environment variables
/// 2. Config file (~/.config/lanprobe/config.toml)
/// 3. Default values
pub fn load_engine_config() -> EngineConfig {
    let file = get_config_file_path().and_then(|p| load_config_file(&p));
    let env_oui = std::env::var(ENV_OUI_PATH).ok();
    let env_safe = std::env::var(ENV_SAFE_MODE).ok();
    resolve_config(file, env_oui.as_deref(), env_safe.as_deref())
}

fn resolve_config(
    file: Option<ConfigFile>,
    env_oui: Option<&str>,
    env_safe: Option<&str>,
) -> EngineConfig {
    let mut config = EngineConfig::default();

    if let Some(file) = file {
        apply_file(&mut config, file);
        config.source = ConfigSource::ConfigFile;
    }

    if let Some(path) = env_oui.map(str::trim).filter(|p| !p.is_empty()) {
        tracing::info!("Using OUI path from environment variable: {}", path);
        config.oui_path = Some(PathBuf::from(path));
        config.source = ConfigSource::Environment;
    }

    if let Some(raw) = env_safe {
        match parse_bool(raw) {
            Some(value) => {
                config.safe_mode = value;
                config.source = ConfigSource::Environment;
            }
            None => tracing::warn!("Ignoring {}={:?}: expected true/false", ENV_SAFE_MODE, raw),
        }
    }

    config
}

fn apply_file(config: &mut EngineConfig, file: ConfigFile) {
    let ms = Duration::from_millis;

    if let Some(scan) = file.scan {
        if let Some(v) = scan.connect_timeout_ms {
            config.connect_timeout = ms(v);
        }
        if let Some(v) = scan.http_timeout_ms {
            config.http_timeout = ms(v);
        }
        if let Some(v) = scan.discovery_timeout_ms {
            config.discovery_timeout = ms(v);
        }
        if let Some(v) = scan.arp_warmup_timeout_ms {
            config.arp_warmup_timeout = ms(v);
        }
        if let Some(v) = scan.rtsp_timeout_ms {
            config.rtsp_timeout = ms(v);
        }
        if let Some(v) = scan.soap_timeout_ms {
            config.soap_timeout = ms(v);
        }
        if let Some(v) = scan.hostname_timeout_ms {
            config.hostname_timeout = ms(v);
        }
        if let Some(v) = scan.continuous_pause_secs {
            config.continuous_pause = Duration::from_secs(v);
        }
        if let Some(v) = scan.safe_mode {
            config.safe_mode = v;
        }
        if let Some(v) = scan.onvif_unicast_probe {
            config.onvif_unicast_probe = v;
        }
    }

    if let Some(limits) = file.limits {
        let l = &mut config.limits;
        // A zero limit would deadlock the gate
        let pick = |v: Option<usize>, current: usize| v.filter(|n| *n > 0).unwrap_or(current);
        l.host = pick(limits.host, l.host);
        l.port_probe = pick(limits.port_probe, l.port_probe);
        l.http = pick(limits.http, l.http);
        l.onvif_soap = pick(limits.onvif_soap, l.onvif_soap);
        l.onvif_rtsp = pick(limits.onvif_rtsp, l.onvif_rtsp);
        l.rtsp_probe = pick(limits.rtsp_probe, l.rtsp_probe);
        l.hostname = pick(limits.hostname, l.hostname);
        l.arp_warmup = pick(limits.arp_warmup, l.arp_warmup);
    }

    if let Some(oui) = file.oui {
        if let Some(path) = oui.path {
            config.oui_path = Some(path);
        }
        if let Some(watch) = oui.watch {
            config.watch_oui = watch;
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Generate example configuration file content
pub fn generate_example_config() -> String {
    r#"# LanProbe Configuration
# Place this file at ~/.config/lanprobe/config.toml

[scan]
# TCP connect timeout per port
# connect_timeout_ms = 1500
# HTTP fingerprint timeout
# http_timeout_ms = 2500
# ONVIF / SSDP / Bonjour listen window
# discovery_timeout_ms = 3000
# Pause between passes in continuous mode
# continuous_pause_secs = 5
# Safe Mode blocks RTSP probing and ONVIF credentialed fetches
# safe_mode = true
# Unicast ONVIF probe for HTTP hosts that did not answer WS-Discovery
# onvif_unicast_probe = false

[limits]
# host = 64
# port_probe = 128
# http = 8
# onvif_soap = 8
# onvif_rtsp = 4
# rtsp_probe = 4
# hostname = 16
# arp_warmup = 64

[oui]
# path = "/home/me/SODS/oui/oui_combined.txt"
# watch = true
"#
    .to_string()
}
