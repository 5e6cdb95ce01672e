//! Bounded async gates.
//!
//! Every channel that touches the network goes through a named [`Gate`], a
//! counting semaphore whose permits are released when dropped. Dropping the
//! permit happens on success, on error and when the holding task is aborted.

use super::ScanError;
use crate::config::GateLimits;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct Gate {
    name: &'static str,
    limit: usize,
    semaphore: Arc<Semaphore>,
}

/// Scoped permit; the slot is returned on drop
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl Gate {
    pub fn new(name: &'static str, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            name,
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of permits currently held
    pub fn in_flight(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<GatePermit, ScanError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map(|permit| GatePermit { _permit: permit })
            .map_err(|_| ScanError::GateClosed(self.name))
    }

    /// Run `fut` while holding a permit.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, ScanError>
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await?;
        Ok(fut.await)
    }
}

/// One gate per channel
#[derive(Debug, Clone)]
pub struct Gates {
    pub host: Gate,
    pub port_probe: Gate,
    pub http: Gate,
    pub onvif_soap: Gate,
    pub onvif_rtsp: Gate,
    pub rtsp_probe: Gate,
    pub hostname: Gate,
    pub arp_warmup: Gate,
}

impl Gates {
    pub fn new(limits: &GateLimits) -> Self {
        Self {
            host: Gate::new("host", limits.host),
            port_probe: Gate::new("port-probe", limits.port_probe),
            http: Gate::new("http", limits.http),
            onvif_soap: Gate::new("onvif-soap", limits.onvif_soap),
            onvif_rtsp: Gate::new("onvif-rtsp", limits.onvif_rtsp),
            rtsp_probe: Gate::new("rtsp-probe", limits.rtsp_probe),
            hostname: Gate::new("hostname", limits.hostname),
            arp_warmup: Gate::new("arp-warmup", limits.arp_warmup),
        }
    }
}
