//! Device registry: enumeration, attributes, and presence tracking.
//!
//! The registry polls a [`DeviceTransport`] (the ADB-equivalent backend)
//! on a cadence, diffs the result against its table, and broadcasts
//! [`DeviceChange`] notifications. Departed devices stay in the table as
//! disconnected so user-set aliases and roles survive reconnects.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Stable device identifier (serial number or emulator id).
pub type DeviceId = String;

/// Display resolution in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Hardware and runtime attributes of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub brand: String,
    pub model: String,
    pub os: String,
    pub os_version: String,
    pub resolution: Resolution,
    pub density: u32,
    pub cpu_abi: String,
    pub sdk_level: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    /// User-settable display alias.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// User-settable role tag (e.g. "smoke", "nightly").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub connected: bool,
}

impl DeviceInfo {
    /// Minimal info for a connected device; attributes default to an
    /// unremarkable emulator profile.
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            brand: "generic".to_string(),
            model: model.into(),
            os: "android".to_string(),
            os_version: "14".to_string(),
            resolution: Resolution::new(1080, 2400),
            density: 420,
            cpu_abi: "arm64-v8a".to_string(),
            sdk_level: 34,
            battery_percent: None,
            memory_mb: None,
            alias: None,
            role: None,
            connected: true,
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Resolution::new(width, height);
        self
    }
}

/// Errors from the underlying device transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Device transport unavailable: {0}")]
    Unavailable(String),

    #[error("Device scan failed: {0}")]
    ScanFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The device enumeration backend (consumed, not implemented here beyond
/// the in-memory transport used for tests and demos).
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Returns every currently-connected device with fresh attributes.
    async fn scan(&self) -> Result<Vec<DeviceInfo>, TransportError>;
}

/// A presence or attribute change observed by the poller.
#[derive(Debug, Clone)]
pub enum DeviceChange {
    Arrived(DeviceInfo),
    Departed(DeviceId),
    Updated(DeviceInfo),
}

struct RegistryState {
    devices: HashMap<DeviceId, DeviceInfo>,
}

/// Polling device registry.
#[derive(Clone)]
pub struct DeviceRegistry {
    state: Arc<RwLock<RegistryState>>,
    changes: broadcast::Sender<DeviceChange>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            state: Arc::new(RwLock::new(RegistryState {
                devices: HashMap::new(),
            })),
            changes,
        }
    }

    /// All known devices, connected or not.
    pub fn list(&self) -> Vec<DeviceInfo> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut devices: Vec<_> = state.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn get(&self, id: &str) -> Option<DeviceInfo> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.devices.get(id).cloned()
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.get(id).map(|d| d.connected).unwrap_or(false)
    }

    /// Sets the user-visible alias for a device. Persists across
    /// disconnects while the process lives.
    pub fn set_alias(&self, id: &str, alias: Option<String>) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match state.devices.get_mut(id) {
            Some(device) => {
                device.alias = alias;
                true
            }
            None => false,
        }
    }

    /// Sets the role tag for a device.
    pub fn set_role(&self, id: &str, role: Option<String>) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match state.devices.get_mut(id) {
            Some(device) => {
                device.role = role;
                true
            }
            None => false,
        }
    }

    /// Subscribes to presence/attribute changes.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceChange> {
        self.changes.subscribe()
    }

    /// Change notifications as a stream.
    pub fn change_stream(&self) -> BroadcastStream<DeviceChange> {
        BroadcastStream::new(self.subscribe())
    }

    /// Applies one scan result, returning the diff against the table.
    /// Exposed for tests; the poller calls this on every tick.
    pub fn apply_scan(&self, scanned: Vec<DeviceInfo>) -> Vec<DeviceChange> {
        let mut changes = Vec::new();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

        for mut info in scanned {
            info.connected = true;
            match state.devices.get_mut(&info.id) {
                Some(existing) => {
                    // preserve user-set fields
                    info.alias = existing.alias.clone();
                    info.role = existing.role.clone();
                    if !existing.connected {
                        *existing = info.clone();
                        changes.push(DeviceChange::Arrived(info));
                    } else if *existing != info {
                        *existing = info.clone();
                        changes.push(DeviceChange::Updated(info));
                    }
                }
                None => {
                    state.devices.insert(info.id.clone(), info.clone());
                    changes.push(DeviceChange::Arrived(info));
                }
            }
        }

        for change in &changes {
            let _ = self.changes.send(change.clone());
        }
        changes
    }

    /// Spawns the polling task. Runs until `shutdown` is cancelled.
    pub fn spawn_poller(
        &self,
        transport: Arc<dyn DeviceTransport>,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => {
                        debug!("device poller stopped");
                        return;
                    }
                }
                match transport.scan().await {
                    Ok(devices) => {
                        let changes = registry.poll_once(devices);
                        for change in &changes {
                            match change {
                                DeviceChange::Arrived(d) => {
                                    info!(device = d.id.as_str(), "device connected");
                                }
                                DeviceChange::Departed(id) => {
                                    info!(device = id.as_str(), "device disconnected");
                                }
                                DeviceChange::Updated(_) => {}
                            }
                        }
                    }
                    Err(e) => warn!("device scan failed: {e}"),
                }
            }
        })
    }

    /// Full poll cycle: applies the scan and marks missing devices as
    /// departed.
    pub fn poll_once(&self, scanned: Vec<DeviceInfo>) -> Vec<DeviceChange> {
        let scanned_ids: Vec<DeviceId> = scanned.iter().map(|d| d.id.clone()).collect();
        let mut changes = self.apply_scan(scanned);

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        for (id, device) in state.devices.iter_mut() {
            if device.connected && !scanned_ids.iter().any(|s| s == id) {
                device.connected = false;
                let change = DeviceChange::Departed(id.clone());
                let _ = self.changes.send(change.clone());
                changes.push(change);
            }
        }
        changes
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory transport for tests and the demo composition. Devices are
/// attached/detached programmatically.
#[derive(Default)]
pub struct StaticTransport {
    devices: std::sync::Mutex<Vec<DeviceInfo>>,
}

impl StaticTransport {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices: std::sync::Mutex::new(devices),
        }
    }

    pub fn attach(&self, device: DeviceInfo) {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(device);
    }

    pub fn detach(&self, id: &str) {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|d| d.id != id);
    }
}

#[async_trait]
impl DeviceTransport for StaticTransport {
    async fn scan(&self) -> Result<Vec<DeviceInfo>, TransportError> {
        Ok(self
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}
