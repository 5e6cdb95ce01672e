//! LanProbe CLI - headless LAN discovery with explainable device scoring
//!
//! This binary wraps the lanprobe-core engine:
//! - One-shot scans with CSV/JSON export and audit logs
//! - Continuous watch mode (for systemd integration)
//! - ARP table and OUI vendor lookups
//! - Configuration inspection

mod watch;

use anyhow::{Context, Result};
use lanprobe_core::config;
use lanprobe_core::scanner::{self, arp, IpRange, ScanEngine, ScanOptions, ScanScope};
use clap::{Parser, Subcommand, ValueEnum};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "lanprobe")]
#[command(author = "LanProbe Team")]
#[command(version)]
#[command(about = "LAN discovery and device confidence scoring")]
#[command(long_about = "
LanProbe sweeps the local subnet, correlates port scans, ARP/OUI, ONVIF,
SSDP, Bonjour and HTTP evidence, and scores how likely each host is to be
a camera or media device.

Quick start:
  1. Scan the local subnet:  lanprobe scan
  2. Export the results:     lanprobe scan --csv hosts.csv --audit audit.json
  3. Keep watching:          lanprobe watch

Active probing (RTSP, credentialed ONVIF) stays off unless --unsafe is given.
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

/// Scope and channel flags shared by `scan` and `watch`
#[derive(clap::Args, Clone)]
pub struct ScanArgs {
    /// Scan this CIDR instead of the active subnet
    #[arg(long, conflicts_with = "range")]
    pub cidr: Option<String>,

    /// Scan an inclusive address range, e.g. 192.168.1.10-192.168.1.50
    #[arg(long)]
    pub range: Option<IpRange>,

    /// Allow --cidr/--range outside the active subnet
    #[arg(long)]
    pub any_subnet: bool,

    /// Skip ONVIF WS-Discovery
    #[arg(long)]
    pub no_onvif: bool,

    /// Skip SSDP and Bonjour discovery
    #[arg(long)]
    pub no_service_discovery: bool,

    /// Touch every host first so the ARP cache is populated
    #[arg(long)]
    pub arp_warmup: bool,

    /// Disable Safe Mode (allows ONVIF SOAP fetches and RTSP probes)
    #[arg(long = "unsafe")]
    pub unsafe_mode: bool,
}

impl ScanArgs {
    fn options(&self, mode: scanner::ScanMode) -> ScanOptions {
        ScanOptions {
            enable_onvif: !self.no_onvif,
            enable_service_discovery: !self.no_service_discovery,
            enable_arp_warmup: self.arp_warmup,
            scope: ScanScope {
                cidr: self.cidr.clone(),
                ip_range: self.range,
                only_local_subnet: !self.any_subnet,
            },
            mode,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one scan and print the scored hosts
    Scan {
        #[command(flatten)]
        args: ScanArgs,

        /// Probe RTSP on interesting devices after the scan (needs --unsafe)
        #[arg(long, requires = "unsafe_mode")]
        probe_rtsp: bool,

        /// Username for ONVIF/RTSP probes
        #[arg(long, requires = "probe_rtsp")]
        user: Option<String>,

        /// Password for ONVIF/RTSP probes
        #[arg(long, requires = "user")]
        pass: Option<String>,

        /// Write the export snapshot as CSV
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Write the audit log as JSON
        #[arg(long)]
        audit: Option<PathBuf>,

        /// Include hosts that never answered
        #[arg(long)]
        all: bool,
    },

    /// Scan continuously until interrupted
    Watch {
        #[command(flatten)]
        args: ScanArgs,

        /// Write an audit log here when stopping
        #[arg(long)]
        audit: Option<PathBuf>,
    },

    /// Show the system ARP table with OUI vendors
    Arp,

    /// Look up the vendor for a MAC address
    Oui {
        /// MAC address or prefix (any separator)
        mac: String,
    },

    /// Show configuration paths and settings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("lanprobe={},lanprobe_core={}", log_level, log_level).into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Scan {
            args,
            probe_rtsp,
            user,
            pass,
            csv,
            audit,
            all,
        } => {
            let credentials = user.as_deref().map(|u| (u, pass.as_deref().unwrap_or("")));
            cmd_scan(&cli, args, *probe_rtsp, credentials, csv.as_ref(), audit.as_ref(), *all).await
        }
        Commands::Watch { args, audit } => watch::run_watch(&cli, args, audit.as_ref()).await,
        Commands::Arp => cmd_arp(&cli).await,
        Commands::Oui { mac } => cmd_oui(&cli, mac),
        Commands::Config => cmd_config(&cli),
    }
}

/// Engine with the layered configuration and the configured OUI store
pub fn build_engine(args: &ScanArgs) -> Result<ScanEngine> {
    let config = config::load_engine_config();
    let oui = Arc::new(scanner::OuiStore::new(config.oui_path.clone()));
    if let Err(e) = oui.load() {
        tracing::warn!("OUI file not loaded, using bundled registry only: {}", e);
    }
    let watch_oui = config.watch_oui;

    let engine = ScanEngine::builder(config, oui)
        .build()
        .context("Failed to create scan engine")?;
    if args.unsafe_mode {
        engine.set_safe_mode(false);
    }
    if watch_oui {
        match engine.watch_oui() {
            // Detached; ends with the process
            Ok(_handle) => {}
            Err(e) => tracing::warn!("OUI file watch not started: {}", e),
        }
    }
    Ok(engine)
}

async fn cmd_scan(
    cli: &Cli,
    args: &ScanArgs,
    probe_rtsp: bool,
    credentials: Option<(&str, &str)>,
    csv: Option<&PathBuf>,
    audit: Option<&PathBuf>,
    all: bool,
) -> Result<()> {
    let engine = build_engine(args)?;

    if let OutputFormat::Text = cli.format {
        println!("Scanning network...");
    }

    let summary = engine
        .run_scan(args.options(scanner::ScanMode::OneShot))
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;

    if probe_rtsp {
        probe_devices(cli, &engine, credentials).await;
    }

    let snapshot = engine.export_snapshot().await;
    let snapshot = if all { snapshot } else { snapshot.alive_only() };

    match cli.format {
        OutputFormat::Text => {
            println!();
            println!(
                "{}: {} hosts, {} alive, {} interesting",
                summary.scope_description,
                summary.total_hosts,
                summary.alive_hosts,
                summary.interesting_hosts
            );
            println!();
            for record in &snapshot.records {
                let ports = record
                    .ports
                    .iter()
                    .map(u16::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                let name = record.hostname.as_deref().unwrap_or("-");
                let vendor = record.vendor.as_deref().unwrap_or("");

                println!(
                    "  {:15} {:>3} {:6}  {:20} {} {}",
                    record.ip,
                    record.host_confidence_score,
                    record.host_confidence_level.to_string(),
                    ports,
                    name,
                    vendor
                );
                if cli.verbose {
                    for reason in &record.host_confidence_reasons {
                        println!("      {}", reason);
                    }
                }
                if let Some(uri) = &record.rtsp_uri {
                    println!("      stream: {}", uri);
                }
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "summary": summary,
                    "hosts": snapshot.records,
                    "timestamp": snapshot.timestamp,
                })
            );
        }
    }

    if let Some(path) = csv {
        snapshot
            .write_csv(path)
            .with_context(|| format!("Failed to export CSV to {}", path.display()))?;
    }
    if let Some(path) = audit {
        engine
            .audit_log()
            .await
            .write(path)
            .with_context(|| format!("Failed to write audit log to {}", path.display()))?;
    }

    Ok(())
}

/// Manual follow-up probes for every device that looks like it streams
async fn probe_devices(cli: &Cli, engine: &ScanEngine, credentials: Option<(&str, &str)>) {
    let candidates: Vec<Ipv4Addr> = engine
        .devices()
        .await
        .into_iter()
        .filter(|d| d.discovered_via_onvif || d.open_ports.contains(&554) || d.open_ports.contains(&8554))
        .map(|d| d.ip)
        .collect();

    for ip in candidates {
        if let Some((user, pass)) = credentials {
            if let Err(e) = engine.update_credentials(ip, user, pass).await {
                tracing::warn!("Credentials not stored for {}: {}", ip, e);
            }
        }
        if let Err(e) = engine.fetch_onvif_rtsp(ip, scanner::FetchReason::Manual).await {
            tracing::warn!("ONVIF fetch for {} not run: {}", ip, e.user_message());
        }
        match engine.probe_rtsp(ip).await {
            Ok(scanner::ProbeStatus::Completed(summary)) => {
                if let OutputFormat::Text = cli.format {
                    println!("  RTSP {}: {}", ip, summary);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("RTSP probe of {} not run: {}", ip, e.user_message()),
        }
    }
}

async fn cmd_arp(cli: &Cli) -> Result<()> {
    let config = config::load_engine_config();
    let oui = scanner::OuiStore::new(config.oui_path);
    if let Err(e) = oui.load() {
        tracing::debug!("OUI file not loaded: {}", e);
    }
    let entries = arp::read_arp_table().await;

    match cli.format {
        OutputFormat::Text => {
            if entries.is_empty() {
                println!("ARP table is empty or unavailable.");
            }
            for (ip, mac) in &entries {
                let vendor = oui.lookup(mac).unwrap_or_default();
                println!("  {:15} {}  {}", ip, mac, vendor);
            }
        }
        OutputFormat::Json => {
            let rows: Vec<_> = entries
                .iter()
                .map(|(ip, mac)| {
                    serde_json::json!({
                        "ip": ip,
                        "mac": mac,
                        "vendor": oui.lookup(mac),
                    })
                })
                .collect();
            println!("{}", serde_json::json!({ "entries": rows }));
        }
    }

    Ok(())
}

fn cmd_oui(cli: &Cli, mac: &str) -> Result<()> {
    let config = config::load_engine_config();
    let oui = scanner::OuiStore::new(config.oui_path);
    if let Err(e) = oui.load() {
        tracing::debug!("OUI file not loaded: {}", e);
    }
    let vendor = oui.lookup(mac);

    match cli.format {
        OutputFormat::Text => match &vendor {
            Some(v) => println!("{}: {}", mac, v),
            None => println!("{}: no OUI match", mac),
        },
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "mac": mac, "vendor": vendor }));
        }
    }

    Ok(())
}

fn cmd_config(cli: &Cli) -> Result<()> {
    let engine_config = config::load_engine_config();
    let config_path = config::get_config_file_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(no config directory)".to_string());
    let oui_path = engine_config
        .oui_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(bundled registry only)".to_string());

    match cli.format {
        OutputFormat::Text => {
            println!("Configuration");
            println!("=============");
            println!();
            println!("Config file:   {}", config_path);
            println!("Loaded from:   {}", engine_config.source);
            println!("Safe Mode:     {}", engine_config.safe_mode);
            println!("OUI file:      {} (watch: {})", oui_path, engine_config.watch_oui);
            println!("Ports:         {:?}", engine_config.ports);
            println!();
            println!("Environment variables:");
            println!("  LANPROBE_OUI_PATH  - Override the OUI database file");
            println!("  LANPROBE_SAFE_MODE - Override Safe Mode (true/false)");
            println!();
            println!("Example config.toml:");
            println!();
            println!("{}", config::generate_example_config());
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "config_file": config_path,
                    "source": engine_config.source.to_string(),
                    "safe_mode": engine_config.safe_mode,
                    "oui_path": engine_config.oui_path,
                    "watch_oui": engine_config.watch_oui,
                    "ports": engine_config.ports,
                    "onvif_unicast_probe": engine_config.onvif_unicast_probe,
                })
            );
        }
    }

    Ok(())
}
