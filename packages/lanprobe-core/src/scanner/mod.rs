//! Network discovery module.
//!
//! Provides LAN discovery and device classification using:
//! - TCP connect sweeps over a fixed port set
//! - ARP table reading with OUI vendor lookup
//! - ONVIF WS-Discovery, SSDP and Bonjour/mDNS
//! - HTTP fingerprinting, ONVIF stream URI resolution and RTSP probing
//! - Explainable vendor/host confidence scoring

pub mod arp;
pub mod discovery;
mod engine;
mod error;
pub mod gate;
pub mod hostname;
pub mod http;
mod model;
pub mod onvif_rtsp;
pub mod oui;
pub mod ports;
pub mod rtsp;
pub mod scoring;
pub mod subnet;
pub mod table;
mod xml;

pub use engine::{
    EngineEvent, FetchReason, NetworkStreamProber, ProbeStatus, ScanEngine, ScanEngineBuilder,
    ScanOptions, StreamProber,
};
pub use error::ScanError;
pub use model::*;
pub use oui::{OuiError, OuiStore};
pub use subnet::{IpRange, NetworkInfo, ScanScope};

use std::process::Command;

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Create a Command that hides the console window on Windows.
pub(crate) fn hidden_command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}
