//! Scan orchestration.
//!
//! One [`ScanEngine`] owns the host table and runs the pipeline:
//! resolve scope -> seed table -> (optional) ARP warmup -> ARP refresh ->
//! ONVIF/SSDP/Bonjour alongside the port sweep -> ARP refresh, optional ONVIF
//! unicast probe, hostname resolution and HTTP fingerprinting.
//!
//! Every mutation goes through [`ScanEngine::ingest`], which holds the table
//! lock only for the merge itself.

use super::arp;
use super::discovery::{bonjour, onvif, ssdp, DiscoveryEvent};
use super::gate::Gates;
use super::hostname;
use super::http::HttpFingerprinter;
use super::onvif_rtsp::{OnvifRtspOutcome, OnvifRtspRequest, OnvifRtspResolver};
use super::oui::{OuiError, OuiStore};
use super::ports::{self, HostScanResult};
use super::rtsp::{self, RtspTarget};
use super::subnet::{self, NetworkInfo, ScanScope};
use super::table::{Evidence, HostTable};
use super::{Device, HostEntry, RtspProbeResult, ScanError, ScanMode, ScanProgress, ScanSummary};
use crate::config::EngineConfig;
use crate::export::{AuditLog, ExportSnapshot};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Status lines kept for the audit log
const LOG_CAPACITY: usize = 2_000;
const EVENT_CAPACITY: usize = 1_024;

/// Web ports tried by the ONVIF unicast probe
const ONVIF_UNICAST_PORTS: [u16; 3] = [80, 8000, 8080];

/// What a scan run should do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOptions {
    pub enable_onvif: bool,
    pub enable_service_discovery: bool,
    pub enable_arp_warmup: bool,
    pub scope: ScanScope,
    pub mode: ScanMode,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            enable_onvif: true,
            enable_service_discovery: true,
            enable_arp_warmup: false,
            scope: ScanScope::local(),
            mode: ScanMode::OneShot,
        }
    }
}

/// Broadcast to every [`ScanEngine::subscribe`] receiver
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum EngineEvent {
    #[serde(rename_all = "camelCase")]
    ScanStarted {
        scope: String,
        total_hosts: usize,
        mode: ScanMode,
    },
    ScanFinished(ScanSummary),
    ScanAborted {
        reason: String,
    },
    HostUpdated(Ipv4Addr),
    Status(String),
}

/// Why an ONVIF RTSP fetch was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchReason {
    Manual,
    Discovery,
}

impl fmt::Display for FetchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchReason::Manual => write!(f, "manual"),
            FetchReason::Discovery => write!(f, "discovery"),
        }
    }
}

/// Result of an on-demand active probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStatus {
    /// Finished; carries the status line
    Completed(String),
    /// Another probe of the same kind is running for this device
    AlreadyInProgress,
    /// Nothing to do (e.g. no ONVIF XAddrs)
    Skipped(String),
}

/// Active probes the engine delegates to. Swapped for a test double in tests.
#[async_trait]
pub trait StreamProber: Send + Sync {
    async fn probe_rtsp(&self, target: RtspTarget) -> Vec<RtspProbeResult>;
    async fn fetch_onvif_rtsp(&self, request: OnvifRtspRequest) -> OnvifRtspOutcome;
}

/// Real RTSP and ONVIF SOAP probing, bounded by the engine's gates
pub struct NetworkStreamProber {
    client: reqwest::Client,
    gates: Gates,
    rtsp_timeout: Duration,
}

impl NetworkStreamProber {
    pub fn new(config: &EngineConfig, gates: Gates) -> Result<Self, ScanError> {
        let client = HttpFingerprinter::new(config.soap_timeout)?.client().clone();
        Ok(Self {
            client,
            gates,
            rtsp_timeout: config.rtsp_timeout,
        })
    }
}

#[async_trait]
impl StreamProber for NetworkStreamProber {
    async fn probe_rtsp(&self, target: RtspTarget) -> Vec<RtspProbeResult> {
        match self
            .gates
            .rtsp_probe
            .run(rtsp::probe_target(&target, self.rtsp_timeout))
            .await
        {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!("[RTSP] {} not probed: {}", target.ip, e);
                Vec::new()
            }
        }
    }

    async fn fetch_onvif_rtsp(&self, request: OnvifRtspRequest) -> OnvifRtspOutcome {
        let resolver = OnvifRtspResolver::new(&self.client, &self.gates.onvif_soap);
        match self.gates.onvif_rtsp.run(resolver.resolve(&request)).await {
            Ok(result) => result.into(),
            Err(e) => OnvifRtspOutcome::Failed(e.to_string()),
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    oui: Arc<OuiStore>,
    gates: Gates,
    prober: Arc<dyn StreamProber>,
    http: HttpFingerprinter,
    network_override: Option<NetworkInfo>,
    table: RwLock<HostTable>,
    safe_mode: AtomicBool,
    scanning: AtomicBool,
    cancel: Mutex<CancellationToken>,
    scanned: AtomicUsize,
    total: AtomicUsize,
    scope_description: Mutex<Option<String>>,
    last_summary: Mutex<Option<ScanSummary>>,
    events: broadcast::Sender<EngineEvent>,
    log: Mutex<VecDeque<String>>,
    /// Automatic ONVIF fetches started by discovery; joined before the pass ends
    followups: Mutex<JoinSet<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Clears the scanning flag however the scan ends
struct ScanGuard(Arc<EngineInner>);

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.0.scanning.store(false, Ordering::SeqCst);
    }
}

pub struct ScanEngineBuilder {
    config: EngineConfig,
    oui: Arc<OuiStore>,
    prober: Option<Arc<dyn StreamProber>>,
    network: Option<NetworkInfo>,
}

impl ScanEngineBuilder {
    /// Replace the RTSP/ONVIF prober
    pub fn with_prober(mut self, prober: Arc<dyn StreamProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    /// Scan from a fixed network instead of detecting the default route
    pub fn with_network(mut self, network: NetworkInfo) -> Self {
        self.network = Some(network);
        self
    }

    pub fn build(self) -> Result<ScanEngine, ScanError> {
        let gates = Gates::new(&self.config.limits);
        let http = HttpFingerprinter::new(self.config.http_timeout)?;
        let prober: Arc<dyn StreamProber> = match self.prober {
            Some(p) => p,
            None => Arc::new(NetworkStreamProber::new(&self.config, gates.clone())?),
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(ScanEngine {
            inner: Arc::new(EngineInner {
                safe_mode: AtomicBool::new(self.config.safe_mode),
                config: self.config,
                oui: self.oui,
                gates,
                prober,
                http,
                network_override: self.network,
                table: RwLock::new(HostTable::default()),
                scanning: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
                scanned: AtomicUsize::new(0),
                total: AtomicUsize::new(0),
                scope_description: Mutex::new(None),
                last_summary: Mutex::new(None),
                events,
                log: Mutex::new(VecDeque::new()),
                followups: Mutex::new(JoinSet::new()),
            }),
        })
    }
}

/// Handle to the discovery engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ScanEngine {
    inner: Arc<EngineInner>,
}

impl ScanEngine {
    pub fn builder(config: EngineConfig, oui: Arc<OuiStore>) -> ScanEngineBuilder {
        ScanEngineBuilder {
            config,
            oui,
            prober: None,
            network: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn oui(&self) -> &Arc<OuiStore> {
        &self.inner.oui
    }

    // ---- scan control ----

    fn begin_scan(&self) -> Result<(ScanGuard, CancellationToken), ScanError> {
        if self.inner.scanning.swap(true, Ordering::SeqCst) {
            return Err(ScanError::AlreadyScanning);
        }
        let token = CancellationToken::new();
        *lock(&self.inner.cancel) = token.clone();
        Ok((ScanGuard(self.inner.clone()), token))
    }

    /// Start a scan in the background. The handle yields the final summary.
    pub fn start_scan(
        &self,
        options: ScanOptions,
    ) -> Result<JoinHandle<Result<ScanSummary, ScanError>>, ScanError> {
        let (guard, cancel) = self.begin_scan()?;
        let engine = self.clone();
        Ok(tokio::spawn(async move {
            let _guard = guard;
            engine.scan_loop(options, cancel).await
        }))
    }

    /// Run a scan to completion (or until [`stop_scan`](Self::stop_scan)).
    pub async fn run_scan(&self, options: ScanOptions) -> Result<ScanSummary, ScanError> {
        let (_guard, cancel) = self.begin_scan()?;
        self.scan_loop(options, cancel).await
    }

    /// Cancel the running scan, if any. Returns whether one was running.
    pub fn stop_scan(&self) -> bool {
        if !self.is_scanning() {
            return false;
        }
        lock(&self.inner.cancel).cancel();
        self.status("Stop requested");
        true
    }

    async fn scan_loop(
        &self,
        options: ScanOptions,
        cancel: CancellationToken,
    ) -> Result<ScanSummary, ScanError> {
        let mut pass: u64 = 0;
        loop {
            pass += 1;
            let outcome = self.run_pass(&options, &cancel).await;
            if options.mode == ScanMode::OneShot
                || cancel.is_cancelled()
                || !keep_watching(&outcome)
            {
                return outcome;
            }

            let pause = self.inner.config.continuous_pause;
            match &outcome {
                Ok(_) => self.status(format!(
                    "Pass {} complete; next pass in {}s",
                    pass,
                    pause.as_secs()
                )),
                Err(e) => self.status(format!(
                    "Pass {} failed: {}; retrying in {}s",
                    pass,
                    e,
                    pause.as_secs()
                )),
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.join_followups().await;
                    return outcome;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Wait for automatic fetches started by discovery. They watch the scan's
    /// token, so after a stop this returns as soon as they have backed out.
    async fn join_followups(&self) {
        let mut tasks = std::mem::take(&mut *lock(&self.inner.followups));
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("Automatic ONVIF fetch failed: {}", e);
            }
        }
    }

    async fn active_network(&self) -> Result<NetworkInfo, ScanError> {
        match &self.inner.network_override {
            Some(network) => Ok(network.clone()),
            None => subnet::detect_active_network().await,
        }
    }

    async fn run_pass(
        &self,
        options: &ScanOptions,
        cancel: &CancellationToken,
    ) -> Result<ScanSummary, ScanError> {
        let inner = &self.inner;

        let network = match self.active_network().await {
            Ok(n) => n,
            Err(e) => {
                self.abort(e.to_string());
                return Err(e);
            }
        };
        tracing::info!(
            "Network: {} on {} (gateway: {:?})",
            network.subnet,
            network.interface,
            network.gateway_ip
        );

        let scope = subnet::resolve_scope(network.subnet, &options.scope);
        if scope.hosts.is_empty() {
            let err = ScanError::EmptyScope(scope.description);
            self.abort(err.to_string());
            return Err(err);
        }

        let safe_mode = self.safe_mode_enabled();
        let mut summary = ScanSummary {
            started_at: Utc::now(),
            finished_at: None,
            scope_description: scope.description.clone(),
            mode: options.mode,
            total_hosts: scope.hosts.len(),
            alive_hosts: 0,
            interesting_hosts: 0,
            safe_mode,
        };

        self.join_followups().await;
        inner.table.write().await.seed(&scope.hosts, options.mode);
        inner.total.store(scope.hosts.len(), Ordering::Relaxed);
        inner.scanned.store(0, Ordering::Relaxed);
        *lock(&inner.scope_description) = Some(scope.description.clone());
        *lock(&inner.last_summary) = Some(summary.clone());

        self.emit(EngineEvent::ScanStarted {
            scope: scope.description.clone(),
            total_hosts: scope.hosts.len(),
            mode: options.mode,
        });
        self.status(format!(
            "Scanning {} ({} hosts, Safe Mode {})",
            scope.description,
            scope.hosts.len(),
            if safe_mode { "on" } else { "off" }
        ));

        if options.enable_arp_warmup {
            arp::warmup(&scope.hosts, &inner.gates.arp_warmup, inner.config.arp_warmup_timeout).await;
        }
        self.refresh_arp().await;

        // Discovery channels fan in to a single merger
        let (tx, mut rx) = mpsc::unbounded_channel();
        let window = inner.config.discovery_timeout;
        let mut channels = JoinSet::new();
        if options.enable_onvif {
            channels.spawn(onvif::discover(window, cancel.child_token(), tx.clone()));
        }
        if options.enable_service_discovery {
            channels.spawn(ssdp::discover(window, cancel.child_token(), tx.clone()));
            channels.spawn(bonjour::discover(window, cancel.child_token(), tx.clone()));
        }
        drop(tx);

        let merger = {
            let engine = self.clone();
            tokio::spawn(async move {
                let mut merged = 0usize;
                while let Some(event) = rx.recv().await {
                    engine.ingest_discovery(event).await;
                    merged += 1;
                }
                merged
            })
        };

        self.port_scan(&scope.hosts, cancel).await;

        while let Some(joined) = channels.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("Discovery channel failed: {}", e);
            }
        }
        let merged = merger.await.unwrap_or(0);
        tracing::debug!("Merged {} discovery events", merged);

        if cancel.is_cancelled() {
            self.join_followups().await;
            return Ok(self.finish_aborted(summary, "Scan stopped").await);
        }

        self.refresh_arp().await;
        if options.enable_onvif && inner.config.onvif_unicast_probe {
            self.onvif_unicast_sweep(cancel).await;
        }
        self.resolve_hostnames(cancel).await;
        self.http_sweep(cancel).await;
        self.join_followups().await;

        if cancel.is_cancelled() {
            return Ok(self.finish_aborted(summary, "Scan stopped").await);
        }

        let (total, alive, interesting) = inner.table.read().await.counts();
        summary.finished_at = Some(Utc::now());
        summary.total_hosts = total;
        summary.alive_hosts = alive;
        summary.interesting_hosts = interesting;
        *lock(&inner.last_summary) = Some(summary.clone());

        self.status(format!(
            "Scan complete: {} hosts, {} alive, {} interesting",
            total, alive, interesting
        ));
        self.emit(EngineEvent::ScanFinished(summary.clone()));
        Ok(summary)
    }

    fn abort(&self, reason: String) {
        tracing::warn!("Scan aborted: {}", reason);
        self.status(format!("Scan aborted: {}", reason));
        self.emit(EngineEvent::ScanAborted { reason });
    }

    async fn finish_aborted(&self, mut summary: ScanSummary, reason: &str) -> ScanSummary {
        let (total, alive, interesting) = self.inner.table.read().await.counts();
        summary.finished_at = Some(Utc::now());
        summary.total_hosts = total;
        summary.alive_hosts = alive;
        summary.interesting_hosts = interesting;
        *lock(&self.inner.last_summary) = Some(summary.clone());
        self.abort(reason.to_string());
        summary
    }

    async fn port_scan(&self, hosts: &[Ipv4Addr], cancel: &CancellationToken) {
        let mut tasks = JoinSet::new();
        for &ip in hosts {
            let engine = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let inner = &engine.inner;
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    permit = inner.gates.host.acquire() => permit.ok()?,
                };
                let open_ports = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    open = ports::scan_host_ports(
                        ip,
                        &inner.config.ports,
                        inner.config.connect_timeout,
                        &inner.gates.port_probe,
                    ) => open,
                };
                let http_title = if open_ports.is_empty() {
                    None
                } else {
                    inner.http.fetch_title(ip, &open_ports).await
                };
                Some(HostScanResult {
                    ip,
                    open_ports,
                    http_title,
                })
            });
        }

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    break;
                }
                next = tasks.join_next() => next,
            };
            let Some(joined) = next else { break };
            self.inner.scanned.fetch_add(1, Ordering::Relaxed);

            if let Ok(Some(result)) = joined {
                if !result.open_ports.is_empty() {
                    tracing::debug!("{} open ports {:?}", result.ip, result.open_ports);
                    self.ingest(Evidence::PortScan(result)).await;
                }
            }
        }
    }

    async fn onvif_unicast_sweep(&self, cancel: &CancellationToken) {
        let candidates: Vec<(Ipv4Addr, u16)> = self
            .inner
            .table
            .read()
            .await
            .devices()
            .filter(|d| !d.discovered_via_onvif)
            .filter_map(|d| {
                ONVIF_UNICAST_PORTS
                    .iter()
                    .find(|&&p| d.open_ports.contains(&p))
                    .map(|&p| (d.ip, p))
            })
            .collect();
        if candidates.is_empty() {
            return;
        }

        let inner = &self.inner;
        let client = inner.http.client();
        let probes = candidates.iter().map(|&(ip, port)| async move {
            inner
                .gates
                .http
                .run(onvif::unicast_probe(client, ip, port))
                .await
                .ok()
                .flatten()
        });
        let found = tokio::select! {
            _ = cancel.cancelled() => return,
            found = join_all(probes) => found,
        };

        let found: Vec<_> = found.into_iter().flatten().collect();
        self.status(format!(
            "ONVIF unicast probe: {}/{} hosts answered",
            found.len(),
            candidates.len()
        ));
        for m in found {
            self.ingest_discovery(DiscoveryEvent::Onvif(m)).await;
        }
    }

    async fn resolve_hostnames(&self, cancel: &CancellationToken) {
        let alive = self.inner.table.read().await.alive_ips();
        if alive.is_empty() {
            return;
        }
        let resolved = tokio::select! {
            _ = cancel.cancelled() => return,
            resolved = hostname::resolve_all(
                &alive,
                &self.inner.gates.hostname,
                self.inner.config.hostname_timeout,
            ) => resolved,
        };
        for (ip, hostname) in resolved {
            self.ingest(Evidence::Hostname { ip, hostname }).await;
        }
    }

    async fn http_sweep(&self, cancel: &CancellationToken) {
        let targets: Vec<(Ipv4Addr, BTreeSet<u16>)> = self
            .inner
            .table
            .read()
            .await
            .devices()
            .filter(|d| !ports::http_targets(&d.open_ports).is_empty())
            .map(|d| (d.ip, d.open_ports.clone()))
            .collect();
        if targets.is_empty() {
            return;
        }

        let inner = &self.inner;
        let sweeps = targets
            .iter()
            .map(|(ip, open)| inner.http.sweep(*ip, open, &inner.gates.http));
        let results = tokio::select! {
            _ = cancel.cancelled() => return,
            results = join_all(sweeps) => results,
        };

        let mut fingerprints = 0;
        for fingerprint in results.into_iter().flatten() {
            fingerprints += 1;
            self.ingest(Evidence::Http(fingerprint)).await;
        }
        tracing::info!("HTTP fingerprints: {} from {} devices", fingerprints, targets.len());
    }

    // ---- merging ----

    /// Merge one piece of evidence into the table and publish the update.
    pub async fn ingest(&self, evidence: Evidence) -> Option<Ipv4Addr> {
        self.prepare_oui().await;
        let updated = self
            .inner
            .table
            .write()
            .await
            .apply(evidence, &self.inner.oui);
        if let Some(ip) = updated {
            self.emit(EngineEvent::HostUpdated(ip));
        }
        updated
    }

    /// Merge a discovery event, then apply the follow-up policy: an ONVIF
    /// device with XAddrs and no RTSP URI gets an automatic fetch unless
    /// Safe Mode is on.
    pub async fn ingest_discovery(&self, event: DiscoveryEvent) {
        let onvif_ip = match &event {
            DiscoveryEvent::Onvif(m) if !m.xaddrs.is_empty() => Some(m.ip),
            _ => None,
        };
        self.ingest(Evidence::Discovery(event)).await;

        let Some(ip) = onvif_ip else { return };
        let needs_uri = self
            .inner
            .table
            .read()
            .await
            .device(ip)
            .is_some_and(|d| d.onvif_rtsp_uri.is_none() && !d.onvif_fetch_in_progress);
        if !needs_uri {
            return;
        }
        if self.safe_mode_enabled() {
            self.status(format!("ONVIF RTSP fetch for {} skipped: Safe Mode", ip));
            return;
        }

        let engine = self.clone();
        let cancel = lock(&self.inner.cancel).clone();
        lock(&self.inner.followups).spawn(async move {
            if let Err(e) = engine
                .run_onvif_fetch(ip, FetchReason::Discovery, Some(&cancel))
                .await
            {
                tracing::debug!("Automatic ONVIF fetch for {} not run: {}", ip, e);
            }
        });
    }

    /// Load the OUI file before any table lock is taken, so vendor lookups
    /// under the lock never touch the disk.
    async fn prepare_oui(&self) {
        if self.inner.oui.is_loaded() {
            return;
        }
        let oui = self.inner.oui.clone();
        match tokio::task::spawn_blocking(move || oui.ensure_loaded()).await {
            Ok(entries) => tracing::debug!("OUI store ready with {} file entries", entries),
            Err(e) => tracing::warn!("OUI load task failed: {}", e),
        }
    }

    /// Re-read the system ARP table and annotate known hosts.
    pub async fn refresh_arp(&self) -> usize {
        let entries = arp::read_arp_table().await;
        self.prepare_oui().await;
        let updated: Vec<Ipv4Addr> = {
            let mut table = self.inner.table.write().await;
            entries
                .into_iter()
                .filter_map(|(ip, mac)| table.apply(Evidence::Arp { ip, mac }, &self.inner.oui))
                .collect()
        };
        for &ip in &updated {
            self.emit(EngineEvent::HostUpdated(ip));
        }
        tracing::debug!("ARP refresh annotated {} hosts", updated.len());
        updated.len()
    }

    // ---- active probes ----

    /// Probe RTSP candidates on a device. Manual only; refused under Safe Mode.
    pub async fn probe_rtsp(&self, ip: Ipv4Addr) -> Result<ProbeStatus, ScanError> {
        if self.safe_mode_enabled() {
            self.status(format!("RTSP probe of {} blocked by Safe Mode", ip));
            return Err(ScanError::SafeModeBlocked("RTSP probe"));
        }

        let Some(target) = self.inner.table.write().await.begin_rtsp_probe(ip)? else {
            tracing::debug!("RTSP probe of {} already running", ip);
            return Ok(ProbeStatus::AlreadyInProgress);
        };
        self.emit(EngineEvent::HostUpdated(ip));
        self.status(format!("Probing RTSP on {}", ip));

        let results = self.inner.prober.probe_rtsp(target).await;
        let summary = self.inner.table.write().await.finish_rtsp_probe(ip, results);

        self.emit(EngineEvent::HostUpdated(ip));
        self.status(format!("RTSP {}: {}", ip, summary));
        Ok(ProbeStatus::Completed(summary))
    }

    /// Resolve a device's RTSP URI over ONVIF SOAP. Refused under Safe Mode.
    pub async fn fetch_onvif_rtsp(
        &self,
        ip: Ipv4Addr,
        reason: FetchReason,
    ) -> Result<ProbeStatus, ScanError> {
        self.run_onvif_fetch(ip, reason, None).await
    }

    /// With a token, a cancelled fetch releases the device without storing
    /// anything it may have learned.
    async fn run_onvif_fetch(
        &self,
        ip: Ipv4Addr,
        reason: FetchReason,
        cancel: Option<&CancellationToken>,
    ) -> Result<ProbeStatus, ScanError> {
        if self.safe_mode_enabled() {
            self.status(format!("ONVIF RTSP fetch for {} ({}) blocked by Safe Mode", ip, reason));
            return Err(ScanError::SafeModeBlocked("ONVIF RTSP fetch"));
        }

        let request = {
            let mut table = self.inner.table.write().await;
            let device = table.device(ip).ok_or(ScanError::UnknownDevice(ip))?;
            if device.onvif_xaddrs.is_empty() {
                return Ok(ProbeStatus::Skipped(format!("{} has no ONVIF XAddrs", ip)));
            }
            match table.begin_onvif_fetch(ip)? {
                Some(request) => request,
                None => return Ok(ProbeStatus::AlreadyInProgress),
            }
        };
        self.emit(EngineEvent::HostUpdated(ip));
        self.status(format!("Fetching ONVIF RTSP URI for {} ({})", ip, reason));

        let fetch = self.inner.prober.fetch_onvif_rtsp(request);
        let outcome = match cancel {
            Some(cancel) => tokio::select! {
                _ = cancel.cancelled() => None,
                outcome = fetch => Some(outcome).filter(|_| !cancel.is_cancelled()),
            },
            None => Some(fetch.await),
        };
        let Some(outcome) = outcome else {
            self.inner.table.write().await.cancel_onvif_fetch(ip);
            self.emit(EngineEvent::HostUpdated(ip));
            let message = format!("ONVIF RTSP fetch for {} cancelled", ip);
            self.status(message.clone());
            return Ok(ProbeStatus::Skipped(message));
        };
        let message = match &outcome {
            OnvifRtspOutcome::Resolved(uri) => format!("ONVIF RTSP URI for {}: {}", ip, rtsp::strip_credentials(uri)),
            OnvifRtspOutcome::AuthRequired => format!("ONVIF on {} requires authentication", ip),
            OnvifRtspOutcome::Failed(e) => format!("ONVIF RTSP fetch for {} failed: {}", ip, e),
        };
        self.inner.table.write().await.finish_onvif_fetch(ip, outcome);

        self.emit(EngineEvent::HostUpdated(ip));
        self.status(message.clone());
        Ok(ProbeStatus::Completed(message))
    }

    pub async fn update_credentials(
        &self,
        ip: Ipv4Addr,
        username: &str,
        password: &str,
    ) -> Result<(), ScanError> {
        self.inner
            .table
            .write()
            .await
            .set_credentials(ip, username, password)?;
        self.status(format!("Credentials updated for {}", ip));
        Ok(())
    }

    pub fn set_safe_mode(&self, enabled: bool) {
        let previous = self.inner.safe_mode.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            self.status(format!("Safe Mode {}", if enabled { "enabled" } else { "disabled" }));
        }
    }

    pub fn safe_mode_enabled(&self) -> bool {
        self.inner.safe_mode.load(Ordering::SeqCst)
    }

    // ---- OUI ----

    /// Reload the OUI file and re-resolve vendors. Returns the prefix count.
    pub async fn reload_oui(&self) -> Result<usize, OuiError> {
        let entries = self.inner.oui.reload()?;
        let changed = self
            .inner
            .table
            .write()
            .await
            .refresh_vendors(&self.inner.oui);
        self.status(format!(
            "OUI database reloaded: {} prefixes, {} vendors changed",
            entries, changed
        ));
        Ok(entries)
    }

    /// Reload vendors whenever the OUI file changes. Abort the handle to stop.
    pub fn watch_oui(&self) -> Result<JoinHandle<()>, OuiError> {
        let mut watcher = self.inner.oui.watch()?;
        let engine = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(result) = watcher.changed().await {
                match result {
                    Ok(entries) => {
                        let changed = engine
                            .inner
                            .table
                            .write()
                            .await
                            .refresh_vendors(&engine.inner.oui);
                        engine.status(format!(
                            "OUI file changed: {} prefixes, {} vendors changed",
                            entries, changed
                        ));
                    }
                    Err(e) => tracing::warn!("OUI reload failed: {}", e),
                }
            }
        }))
    }

    // ---- observable state ----

    pub async fn devices(&self) -> Vec<Device> {
        self.inner.table.read().await.devices().cloned().collect()
    }

    pub async fn device(&self, ip: Ipv4Addr) -> Option<Device> {
        self.inner.table.read().await.device(ip).cloned()
    }

    pub async fn all_hosts(&self) -> Vec<HostEntry> {
        self.inner.table.read().await.hosts().cloned().collect()
    }

    pub async fn host(&self, ip: Ipv4Addr) -> Option<HostEntry> {
        self.inner.table.read().await.host(ip).cloned()
    }

    pub fn progress(&self) -> ScanProgress {
        ScanProgress {
            scanned_hosts: self.inner.scanned.load(Ordering::Relaxed),
            total_hosts: self.inner.total.load(Ordering::Relaxed),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::SeqCst)
    }

    pub fn subnet_description(&self) -> Option<String> {
        lock(&self.inner.scope_description).clone()
    }

    pub fn last_summary(&self) -> Option<ScanSummary> {
        lock(&self.inner.last_summary).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Status lines of this engine, oldest first
    pub fn log_lines(&self) -> Vec<String> {
        lock(&self.inner.log).iter().cloned().collect()
    }

    /// Current table as an export snapshot
    pub async fn export_snapshot(&self) -> ExportSnapshot {
        let table = self.inner.table.read().await;
        let hosts: Vec<HostEntry> = table.hosts().cloned().collect();
        let devices: Vec<Device> = table.devices().cloned().collect();
        ExportSnapshot::new(&hosts, &devices)
    }

    /// Audit record of the last scan: summary, evidence and status lines
    pub async fn audit_log(&self) -> AuditLog {
        let (hosts, devices) = {
            let table = self.inner.table.read().await;
            (
                table.hosts().cloned().collect(),
                table.devices().cloned().collect(),
            )
        };
        AuditLog::new(self.last_summary(), hosts, devices, self.log_lines())
    }

    fn status(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("[Scan] {}", message);
        {
            let mut log = lock(&self.inner.log);
            if log.len() >= LOG_CAPACITY {
                log.pop_front();
            }
            log.push_back(format!("{} {}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"), message));
        }
        self.emit(EngineEvent::Status(message));
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }
}

/// Whether a continuous scan goes on after this pass. A scope that resolves
/// to nothing will not fix itself; anything else is retried after the pause.
fn keep_watching(outcome: &Result<ScanSummary, ScanError>) -> bool {
    !matches!(outcome, Err(ScanError::EmptyScope(_)))
}
