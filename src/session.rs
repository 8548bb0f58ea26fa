//! Device session lifecycle management.
//!
//! A session is an active driver connection to one device; there is at
//! most one per device. Sessions are created lazily, recycled between
//! runs, and destroyed on device disappearance, long idle, or failed
//! health checks.
//!
//! Creation is serialised per device with a per-device mutex. Scenario
//! execution does not take that mutex: exclusivity during a run comes
//! from the orchestrator's coarser device lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, EventPayload, Room};
use crate::config::SessionConfig;
use crate::device::{DeviceChange, DeviceId, DeviceInfo, DeviceRegistry};
use crate::driver::mock::MockDriver;
use crate::driver::{DeviceDriver, DriverError};

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors from session management.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Driver refused session: {0}")]
    DriverRefused(String),

    #[error("Session creation timed out for device {0}")]
    CreateTimeout(String),

    #[error("Session pool exhausted (limit {0})")]
    PoolExhausted(usize),
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Creating,
    Active,
    Idle,
    Unhealthy,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Creating => "creating",
            SessionState::Active => "active",
            SessionState::Idle => "idle",
            SessionState::Unhealthy => "unhealthy",
            SessionState::Closed => "closed",
        }
    }
}

/// Metadata of one device session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSession {
    pub device_id: DeviceId,
    pub driver_port: u16,
    pub stream_port: u16,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// A usable session: metadata plus the driver connection.
#[derive(Clone)]
pub struct SessionHandle {
    pub session: DeviceSession,
    pub driver: Arc<dyn DeviceDriver>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session", &self.session)
            .field("driver", &"<dyn DeviceDriver>")
            .finish()
    }
}

/// Opens driver connections for sessions (consumed capability).
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn open(
        &self,
        device: &DeviceInfo,
        driver_port: u16,
        stream_port: u16,
    ) -> Result<Arc<dyn DeviceDriver>, DriverError>;

    /// Tears down backend resources for a device. Default: nothing.
    async fn close(&self, _device_id: &str) {}
}

/// Backend that serves scripted [`MockDriver`]s, for tests and the demo
/// composition.
#[derive(Default)]
pub struct MockBackend {
    drivers: std::sync::Mutex<HashMap<DeviceId, Arc<MockDriver>>>,
    refuse: std::sync::Mutex<HashMap<DeviceId, String>>,
    opens: std::sync::Mutex<HashMap<DeviceId, usize>>,
    open_delay: std::sync::Mutex<Option<Duration>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent opens for a device fail with `DriverRefused`.
    pub fn refuse(&self, device_id: &str, reason: &str) {
        self.refuse
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device_id.to_string(), reason.to_string());
    }

    /// The mock driver serving a device, once opened.
    pub fn driver(&self, device_id: &str) -> Option<Arc<MockDriver>> {
        self.drivers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .cloned()
    }

    /// How many times a session was opened for a device.
    pub fn open_count(&self, device_id: &str) -> usize {
        self.opens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .copied()
            .unwrap_or(0)
    }

    /// Applies an artificial delay to every open, for timeout tests.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }
}

#[async_trait]
impl SessionBackend for MockBackend {
    async fn open(
        &self,
        device: &DeviceInfo,
        _driver_port: u16,
        _stream_port: u16,
    ) -> Result<Arc<dyn DeviceDriver>, DriverError> {
        let delay = *self.open_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = self
            .refuse
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&device.id)
        {
            return Err(DriverError::Refused(reason.clone()));
        }
        *self
            .opens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(device.id.clone())
            .or_default() += 1;
        let driver = self
            .drivers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(device.id.clone())
            .or_insert_with(|| Arc::new(MockDriver::new(device.clone())))
            .clone();
        Ok(driver)
    }
}

struct Slot {
    session: DeviceSession,
    driver: Arc<dyn DeviceDriver>,
}

struct Inner {
    config: SessionConfig,
    registry: DeviceRegistry,
    backend: Arc<dyn SessionBackend>,
    bus: EventBus,
    sessions: Mutex<HashMap<DeviceId, Slot>>,
    create_guards: Mutex<HashMap<DeviceId, Arc<Mutex<()>>>>,
    next_driver_port: AtomicU16,
    next_stream_port: AtomicU16,
}

/// Bounded pool of device sessions, one per device.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        registry: DeviceRegistry,
        backend: Arc<dyn SessionBackend>,
        bus: EventBus,
    ) -> Self {
        let next_driver_port = AtomicU16::new(config.driver_port_base);
        let next_stream_port = AtomicU16::new(config.stream_port_base);
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                backend,
                bus,
                sessions: Mutex::new(HashMap::new()),
                create_guards: Mutex::new(HashMap::new()),
                next_driver_port,
                next_stream_port,
            }),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    /// Returns the active session for a device, creating one if needed.
    ///
    /// Creation is serialised per device; concurrent callers share the
    /// created session.
    pub async fn ensure(&self, device_id: &str) -> SessionResult<SessionHandle> {
        let device = self
            .inner
            .registry
            .get(device_id)
            .filter(|d| d.connected)
            .ok_or_else(|| SessionError::DeviceUnavailable(device_id.to_string()))?;

        let guard = {
            let mut guards = self.inner.create_guards.lock().await;
            Arc::clone(
                guards
                    .entry(device_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _creating = guard.lock().await;

        // a racing caller may have created it while we waited
        {
            let mut sessions = self.inner.sessions.lock().await;
            if let Some(slot) = sessions.get_mut(device_id) {
                if matches!(slot.session.state, SessionState::Active | SessionState::Idle) {
                    slot.session.state = SessionState::Active;
                    slot.session.last_used_at = Utc::now();
                    return Ok(SessionHandle {
                        session: slot.session.clone(),
                        driver: Arc::clone(&slot.driver),
                    });
                }
                sessions.remove(device_id);
            }
            if sessions.len() >= self.inner.config.max_sessions {
                return Err(SessionError::PoolExhausted(self.inner.config.max_sessions));
            }
        }

        let driver_port = self.inner.next_driver_port.fetch_add(1, Ordering::Relaxed);
        let stream_port = self.inner.next_stream_port.fetch_add(1, Ordering::Relaxed);
        let create_timeout = Duration::from_secs(self.inner.config.create_timeout_secs);

        debug!(device = device_id, driver_port, "creating session");
        let opened = tokio::time::timeout(
            create_timeout,
            self.inner.backend.open(&device, driver_port, stream_port),
        )
        .await;
        let driver = match opened {
            Ok(Ok(driver)) => driver,
            Ok(Err(e)) => return Err(SessionError::DriverRefused(e.to_string())),
            Err(_) => return Err(SessionError::CreateTimeout(device_id.to_string())),
        };

        let now = Utc::now();
        let session = DeviceSession {
            device_id: device_id.to_string(),
            driver_port,
            stream_port,
            state: SessionState::Active,
            created_at: now,
            last_used_at: now,
        };
        self.inner.sessions.lock().await.insert(
            device_id.to_string(),
            Slot {
                session: session.clone(),
                driver: Arc::clone(&driver),
            },
        );
        self.publish_health(device_id, SessionState::Active, None);
        info!(device = device_id, "session created");
        Ok(SessionHandle { session, driver })
    }

    /// Destroys the session for a device. Idempotent.
    pub async fn destroy(&self, device_id: &str) {
        let removed = self.inner.sessions.lock().await.remove(device_id);
        if removed.is_some() {
            self.inner.backend.close(device_id).await;
            self.publish_health(device_id, SessionState::Closed, None);
            info!(device = device_id, "session destroyed");
        }
    }

    /// Cheap health probe. On failure the session transitions to
    /// `Unhealthy` and is destroyed; returns whether the session is
    /// healthy afterwards.
    pub async fn check(&self, device_id: &str) -> bool {
        let driver = {
            let sessions = self.inner.sessions.lock().await;
            match sessions.get(device_id) {
                Some(slot) => Arc::clone(&slot.driver),
                None => return false,
            }
        };

        let probe = tokio::time::timeout(Duration::from_secs(5), driver.device_info()).await;
        match probe {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!(device = device_id, "health check failed: {e}");
                self.retire(device_id, e.to_string()).await;
                false
            }
            Err(_) => {
                warn!(device = device_id, "health check timed out");
                self.retire(device_id, "health probe timeout".to_string()).await;
                false
            }
        }
    }

    /// Marks a session idle so the reaper can collect it later.
    pub async fn release(&self, device_id: &str) {
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(slot) = sessions.get_mut(device_id) {
            slot.session.state = SessionState::Idle;
            slot.session.last_used_at = Utc::now();
        }
    }

    pub async fn get(&self, device_id: &str) -> Option<DeviceSession> {
        self.inner
            .sessions
            .lock()
            .await
            .get(device_id)
            .map(|slot| slot.session.clone())
    }

    pub async fn list(&self) -> Vec<DeviceSession> {
        let mut sessions: Vec<_> = self
            .inner
            .sessions
            .lock()
            .await
            .values()
            .map(|slot| slot.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        sessions
    }

    async fn retire(&self, device_id: &str, detail: String) {
        {
            let mut sessions = self.inner.sessions.lock().await;
            if let Some(slot) = sessions.get_mut(device_id) {
                slot.session.state = SessionState::Unhealthy;
            }
        }
        self.publish_health(device_id, SessionState::Unhealthy, Some(detail));
        self.destroy(device_id).await;
    }

    fn publish_health(&self, device_id: &str, state: SessionState, detail: Option<String>) {
        self.inner.bus.publish(
            Room::Device(device_id.to_string()),
            EventPayload::SessionHealth {
                device_id: device_id.to_string(),
                state: state.as_str().to_string(),
                detail,
            },
        );
    }

    /// Spawns the idle reaper task.
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let interval = Duration::from_secs(manager.inner.config.reap_interval_secs);
            let idle_after =
                chrono::Duration::seconds(manager.inner.config.idle_timeout_secs as i64);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => return,
                }
                let cutoff = Utc::now() - idle_after;
                let expired: Vec<DeviceId> = {
                    let sessions = manager.inner.sessions.lock().await;
                    sessions
                        .values()
                        .filter(|slot| {
                            slot.session.state == SessionState::Idle
                                && slot.session.last_used_at < cutoff
                        })
                        .map(|slot| slot.session.device_id.clone())
                        .collect()
                };
                for device_id in expired {
                    debug!(device = device_id.as_str(), "reaping idle session");
                    manager.destroy(&device_id).await;
                }
            }
        })
    }

    /// Spawns the registry watcher that retires sessions when their
    /// device disappears.
    pub fn spawn_watcher(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        let mut changes = self.inner.registry.subscribe();
        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    change = changes.recv() => match change {
                        Ok(change) => change,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("session watcher lagged {n} device changes");
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    },
                    _ = shutdown.cancelled() => return,
                };
                if let DeviceChange::Departed(device_id) = change {
                    if manager.get(&device_id).await.is_some() {
                        manager
                            .retire(&device_id, "device disconnected".to_string())
                            .await;
                    }
                }
            }
        })
    }
}
