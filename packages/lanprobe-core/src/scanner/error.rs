use std::net::Ipv4Addr;
use thiserror::Error;

/// Errors surfaced by scan control operations.
///
/// Per-target network failures never show up here; they are recorded as
/// missing evidence or as a device's last error instead.
#[derive(Debug, Error)]
pub enum ScanError {
    /// No active IPv4 interface could be determined
    #[error("Network not available: {0}")]
    NetworkNotAvailable(String),

    /// Scope resolution produced no hosts
    #[error("Empty scan scope: {0}")]
    EmptyScope(String),

    /// A scan is already running on this engine
    #[error("A scan is already in progress")]
    AlreadyScanning,

    /// Active probing refused because Safe Mode is on
    #[error("{0} blocked by Safe Mode")]
    SafeModeBlocked(&'static str),

    /// No device record exists for the address
    #[error("Unknown device: {0}")]
    UnknownDevice(Ipv4Addr),

    /// A bounded gate was closed while waiting for a permit
    #[error("Gate '{0}' is closed")]
    GateClosed(&'static str),

    /// General scan error
    #[error("Scan failed: {0}")]
    General(String),
}

impl ScanError {
    /// Get user-friendly description and instructions
    pub fn user_message(&self) -> String {
        match self {
            ScanError::NetworkNotAvailable(msg) => {
                format!("Network is not available: {}\n\nPlease check your network connection and try again.", msg)
            }
            ScanError::EmptyScope(msg) => {
                format!("Nothing to scan: {}\n\nCheck the CIDR or IP range you entered.", msg)
            }
            ScanError::AlreadyScanning => {
                "A scan is already running. Stop it before starting another one.".to_string()
            }
            ScanError::SafeModeBlocked(op) => {
                format!("{} is disabled while Safe Mode is on.\n\nTurn Safe Mode off to allow active probing.", op)
            }
            ScanError::UnknownDevice(ip) => format!("No device with address {} was found in the last scan.", ip),
            ScanError::GateClosed(_) | ScanError::General(_) => self.to_string(),
        }
    }
}
