//! Continuous scanning until interrupted
//!
//! Runs the engine in continuous mode, prints host updates as they are merged
//! and stops cleanly on SIGTERM/SIGINT (Ctrl+C elsewhere).

use crate::{build_engine, Cli, OutputFormat, ScanArgs};
use anyhow::Result;
use lanprobe_core::scanner::{EngineEvent, ScanMode};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;

/// Run continuous scans, printing lifecycle events until a shutdown signal arrives
pub async fn run_watch(cli: &Cli, args: &ScanArgs, audit: Option<&PathBuf>) -> Result<()> {
    let engine = build_engine(args)?;
    let mut events = engine.subscribe();
    let mut reported: HashSet<Ipv4Addr> = HashSet::new();

    tracing::info!(
        "Starting watch: pause {}s between passes, Safe Mode {}",
        engine.config().continuous_pause.as_secs(),
        if engine.safe_mode_enabled() { "on" } else { "off" }
    );

    let mut scan = engine
        .start_scan(args.options(ScanMode::Continuous))
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;

    let outcome = loop {
        tokio::select! {
            result = &mut scan => break result,
            _ = shutdown_signal() => {
                tracing::info!("Shutdown requested, stopping scan");
                engine.stop_scan();
            }
            event = events.recv() => match event {
                Ok(event) => print_event(cli, &engine, event, &mut reported).await,
                Err(RecvError::Lagged(missed)) => tracing::debug!("Skipped {} engine events", missed),
                Err(RecvError::Closed) => {}
            },
        }
    };

    match outcome {
        Ok(Ok(summary)) => tracing::info!(
            "Watch stopped: {} alive, {} interesting",
            summary.alive_hosts,
            summary.interesting_hosts
        ),
        Ok(Err(e)) => tracing::error!("Scan failed: {}", e.user_message()),
        Err(e) => tracing::error!("Scan task failed: {}", e),
    }

    if let Some(path) = audit {
        engine.audit_log().await.write(path)?;
    }
    Ok(())
}

/// Text mode reports each interesting host once per pass
async fn print_event(
    cli: &Cli,
    engine: &lanprobe_core::ScanEngine,
    event: EngineEvent,
    reported: &mut HashSet<Ipv4Addr>,
) {
    match cli.format {
        OutputFormat::Json => {
            if let EngineEvent::HostUpdated(ip) = &event {
                if let Some(host) = engine.host(*ip).await {
                    println!("{}", serde_json::json!({ "event": "hostUpdated", "data": host }));
                }
                return;
            }
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", line);
            }
        }
        OutputFormat::Text => match event {
            EngineEvent::ScanStarted { scope, total_hosts, .. } => {
                reported.clear();
                println!("Scanning {} ({} hosts)", scope, total_hosts);
            }
            EngineEvent::ScanFinished(summary) => {
                println!(
                    "Pass finished: {} alive, {} interesting",
                    summary.alive_hosts, summary.interesting_hosts
                );
            }
            EngineEvent::ScanAborted { reason } => println!("Scan aborted: {}", reason),
            EngineEvent::HostUpdated(ip) => {
                if let Some(host) = engine.host(ip).await {
                    if host.is_interesting() && reported.insert(ip) {
                        println!(
                            "  {:15} {:>3} {}",
                            host.ip,
                            host.host_confidence.score,
                            host.vendor.as_deref().unwrap_or("")
                        );
                    }
                }
            }
            EngineEvent::Status(_) => {}
        },
    }
}

/// Resolves on SIGTERM or SIGINT (Ctrl+C on other platforms)
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler not installed: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
