//! MAC OUI (Organizationally Unique Identifier) vendor lookup
//!
//! Vendors come from a user-maintained OUI file first (default
//! `~/SODS/oui/oui_combined.txt`), then from the bundled IEEE registry.
//! The store loads lazily, can be reloaded on demand, and can watch the
//! file's directory so edits are picked up while the engine runs.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum OuiError {
    #[error("Failed to read OUI file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No OUI file path configured")]
    NoPath,

    #[error("Failed to watch OUI file: {0}")]
    Watch(#[from] notify::Error),
}

type OuiTable = HashMap<String, String>;

/// Injectable, reloadable OUI vendor store
#[derive(Debug)]
pub struct OuiStore {
    path: Option<PathBuf>,
    use_bundled: bool,
    /// `None` until the first load attempt
    table: RwLock<Option<Arc<OuiTable>>>,
}

impl OuiStore {
    /// Store backed by `path` with the bundled registry as fallback.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            use_bundled: true,
            table: RwLock::new(None),
        }
    }

    /// Store that only knows the entries of its file.
    pub fn file_only(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            use_bundled: false,
            table: RwLock::new(None),
        }
    }

    /// In-memory store, mostly for tests and embedding.
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let table: OuiTable = entries
            .into_iter()
            .filter_map(|(k, v)| Some((normalize_key(k.as_ref())?, v.into())))
            .collect();
        Self {
            path: None,
            use_bundled: false,
            table: RwLock::new(Some(Arc::new(table))),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load the file unless already loaded. Returns the entry count.
    pub fn load(&self) -> Result<usize, OuiError> {
        if let Some(table) = self.snapshot() {
            return Ok(table.len());
        }
        self.reload()
    }

    /// Re-read the file and swap the table in.
    pub fn reload(&self) -> Result<usize, OuiError> {
        let path = self.path.as_ref().ok_or(OuiError::NoPath)?;
        let content = fs::read_to_string(path).map_err(|source| OuiError::Io {
            path: path.clone(),
            source,
        })?;
        let table = parse_oui_file(&content);
        let count = table.len();
        *self.table.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(table));
        tracing::info!("Loaded {} OUI entries from {:?}", count, path);
        Ok(count)
    }

    /// Whether a table (possibly empty after a failed load) is in place
    pub fn is_loaded(&self) -> bool {
        self.snapshot().is_some()
    }

    /// Load the file if nothing is loaded yet, remembering a failed load as
    /// an empty table. Returns the file entry count.
    pub fn ensure_loaded(&self) -> usize {
        self.loaded_table().len()
    }

    /// Entries loaded from the file (bundled registry not counted)
    pub fn len(&self) -> usize {
        self.snapshot().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lookup the vendor/manufacturer name for a MAC address.
    pub fn lookup(&self, mac: &str) -> Option<String> {
        let normalized = normalize_mac(mac)?;
        let key = normalize_key(&normalized)?;

        if let Some(vendor) = self.loaded_table().get(&key) {
            tracing::debug!("OUI lookup for {}: {} (file)", mac, vendor);
            return Some(vendor.clone());
        }

        if !self.use_bundled {
            return None;
        }

        match oui_data::lookup(&normalized) {
            Some(record) => {
                let vendor_name = record.organization().to_string();
                tracing::debug!("OUI lookup for {}: {} (bundled registry)", mac, vendor_name);
                Some(vendor_name)
            }
            None => {
                tracing::debug!("OUI lookup for {}: not found", mac);
                None
            }
        }
    }

    /// Watch the OUI file's directory for changes.
    pub fn watch(self: &Arc<Self>) -> Result<OuiWatcher, OuiError> {
        let file = self.path.clone().ok_or(OuiError::NoPath)?;
        let dir = file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => tracing::warn!("OUI watcher error: {}", e),
            })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        tracing::info!("Watching {:?} for OUI changes", dir);
        Ok(OuiWatcher {
            _watcher: watcher,
            events: rx,
            store: Arc::clone(self),
            file,
        })
    }

    fn snapshot(&self) -> Option<Arc<OuiTable>> {
        self.table.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn loaded_table(&self) -> Arc<OuiTable> {
        if let Some(table) = self.snapshot() {
            return table;
        }
        match self.reload() {
            Ok(_) => {}
            Err(OuiError::NoPath) => {}
            Err(e) => tracing::debug!("OUI file unavailable: {}", e),
        }
        // Remember failed loads as an empty table so lookups don't retry
        let mut guard = self.table.write().unwrap_or_else(|e| e.into_inner());
        guard.get_or_insert_with(|| Arc::new(OuiTable::new())).clone()
    }
}

/// Live watch on the OUI file; dropping it stops watching
pub struct OuiWatcher {
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<Event>,
    store: Arc<OuiStore>,
    file: PathBuf,
}

impl OuiWatcher {
    /// Wait for the next change to the OUI file and reload it.
    ///
    /// Returns `None` once the watcher has shut down.
    pub async fn changed(&mut self) -> Option<Result<usize, OuiError>> {
        while let Some(event) = self.events.recv().await {
            if matches!(event.kind, EventKind::Access(_)) {
                continue;
            }
            let touches_file = event.paths.is_empty()
                || event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == self.file.file_name());
            if !touches_file || !self.file.exists() {
                continue;
            }
            return Some(self.store.reload());
        }
        None
    }
}

/// Parse an OUI file into `AABBCC -> vendor`.
///
/// Accepts `AA-BB-CC<TAB>Vendor`, `AABBCC Vendor`, `AA:BB:CC<TAB>Short<TAB>Long`
/// (the last tab field wins) and the IEEE `(hex)` / `(base 16)` lines.
pub fn parse_oui_file(content: &str) -> OuiTable {
    let mut table = OuiTable::new();

    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((key, vendor)) = parse_ieee_line(line) {
            table.insert(key, vendor);
            continue;
        }

        let Some((key_token, blob)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let Some(key) = normalize_key(key_token) else {
            continue;
        };
        let blob = blob.trim();
        let vendor = match blob.rsplit_once('\t') {
            Some((_, last)) => last.trim(),
            None => blob,
        };
        if !vendor.is_empty() {
            table.insert(key, vendor.to_string());
        }
    }

    table
}

/// `00-1A-2B   (hex)\t\tVendor` or `001A2B     (base 16)\t\tVendor`
fn parse_ieee_line(line: &str) -> Option<(String, String)> {
    let (key_token, rest) = line.split_once(char::is_whitespace)?;
    let rest = rest.trim_start();
    let lower = rest.to_ascii_lowercase();

    let vendor = if lower.starts_with("(hex)") {
        if key_token.len() != 8 {
            return None;
        }
        &rest["(hex)".len()..]
    } else if lower.starts_with("(base 16)") {
        if key_token.len() != 6 {
            return None;
        }
        &rest["(base 16)".len()..]
    } else {
        return None;
    };

    let vendor = vendor.trim();
    if vendor.is_empty() {
        return None;
    }
    Some((normalize_key(key_token)?, vendor.to_string()))
}

/// First six hex digits of a token, uppercased
fn normalize_key(token: &str) -> Option<String> {
    let hex: String = token
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if hex.len() < 6 {
        return None;
    }
    Some(hex[..6].to_string())
}

/// Normalize a MAC address to the format XX:XX:XX:XX:XX:XX
///
/// Handles unpadded octets (`0:1a:2b:3:4:5`, as printed by BSD `arp`),
/// dashes, Cisco dotted notation and bare hex.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let mac = mac.trim();
    let octets: Vec<String> = if mac.contains(':') || mac.contains('-') {
        let parts: Vec<&str> = mac.split([':', '-']).collect();
        if parts.len() != 6 {
            return None;
        }
        parts
            .iter()
            .map(|p| {
                if p.is_empty() || p.len() > 2 || !p.chars().all(|c| c.is_ascii_hexdigit()) {
                    None
                } else {
                    Some(format!("{:0>2}", p.to_ascii_uppercase()))
                }
            })
            .collect::<Option<Vec<_>>>()?
    } else {
        let cleaned: String = mac.replace('.', "").to_ascii_uppercase();
        if cleaned.len() != 12 || !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        (0..6).map(|i| cleaned[i * 2..i * 2 + 2].to_string()).collect()
    };

    Some(octets.join(":"))
}
