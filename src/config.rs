//! Configuration loading and schema definitions.
//!
//! All tunables live in a single TOML file split into per-component
//! sections. Every field has a default, so an empty file (or no file at
//! all) yields a working configuration.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── OrchestratorConfig  - queue, locking, split policy, completed ring
//! ├── SessionConfig       - session pool bounds, timeouts, port ranges
//! ├── RegistryConfig      - device poll cadence
//! ├── BusConfig           - per-subscriber queue depth
//! ├── ExecutorConfig      - step timeouts, intervals, screenshot caps
//! └── ScheduleConfig      - cron tick cadence, history ring
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Root configuration structure for devicelab.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Queue and scheduling settings.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Device session pool settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Device registry settings.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Event bus settings.
    #[serde(default)]
    pub bus: BusConfig,

    /// Per-execution settings.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Cron schedule settings.
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// Queue and device-locking scheduler settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Maximum number of executions running at once.
    ///
    /// Submissions beyond this are queued even when their devices are
    /// free.
    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,

    /// Number of completed tests retained for late-joining clients.
    #[serde(default = "default_completed_ring")]
    pub completed_ring: usize,

    /// When a request's devices are only partially free, split it into an
    /// immediate execution on the free devices and a queued remainder.
    ///
    /// When disabled the whole request queues until every device is free.
    #[serde(default)]
    pub split_on_partial: bool,

    /// Coarse per-(device × scenario × repeat) duration estimate in
    /// seconds, used only for queue wait-time hints.
    #[serde(default = "default_estimated_scenario_secs")]
    pub estimated_scenario_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: default_max_concurrent_executions(),
            completed_ring: default_completed_ring(),
            split_on_partial: false,
            estimated_scenario_secs: default_estimated_scenario_secs(),
        }
    }
}

fn default_max_concurrent_executions() -> usize {
    8
}

fn default_completed_ring() -> usize {
    20
}

fn default_estimated_scenario_secs() -> u64 {
    60
}

/// Device session pool settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Upper bound on live sessions. The effective bound is the smaller
    /// of this and the connected device count (one session per device).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Timeout for driver session creation in seconds.
    #[serde(default = "default_create_timeout")]
    pub create_timeout_secs: u64,

    /// Sessions idle longer than this are destroyed by the reaper.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Cadence of the idle sweep in seconds.
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// First port handed out for driver endpoints. Ports are unique
    /// process-wide and allocated upward from here.
    #[serde(default = "default_driver_port_base")]
    pub driver_port_base: u16,

    /// First port handed out for stream proxy endpoints.
    #[serde(default = "default_stream_port_base")]
    pub stream_port_base: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            create_timeout_secs: default_create_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            reap_interval_secs: default_reap_interval(),
            driver_port_base: default_driver_port_base(),
            stream_port_base: default_stream_port_base(),
        }
    }
}

fn default_max_sessions() -> usize {
    32
}

fn default_create_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_reap_interval() -> u64 {
    30
}

fn default_driver_port_base() -> u16 {
    6790
}

fn default_stream_port_base() -> u16 {
    7790
}

/// Device registry settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// Device transport poll cadence in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

/// Event bus settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    /// Bounded queue depth per subscriber. On overflow the oldest
    /// non-terminal event is dropped; terminal events are never dropped.
    #[serde(default = "default_subscriber_queue_depth")]
    pub subscriber_queue_depth: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_depth: default_subscriber_queue_depth(),
        }
    }
}

fn default_subscriber_queue_depth() -> usize {
    256
}

/// Per-execution settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
    /// Default per-action driver call timeout in seconds. A node's own
    /// `timeout` parameter overrides this.
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,

    /// Default pause between scenarios on the same device, in
    /// milliseconds. A request's `scenario_interval` overrides this.
    #[serde(default)]
    pub scenario_interval_ms: u64,

    /// Upper bound on interpreted steps per scenario run. Runs exceeding
    /// it fail rather than spin on a malformed cyclic graph.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Failure screenshots retained per device result; older ones are
    /// discarded beyond this.
    #[serde(default = "default_screenshots_per_device")]
    pub screenshots_per_device: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            action_timeout_secs: default_action_timeout(),
            scenario_interval_ms: 0,
            max_steps: default_max_steps(),
            screenshots_per_device: default_screenshots_per_device(),
        }
    }
}

fn default_action_timeout() -> u64 {
    30
}

fn default_max_steps() -> usize {
    10_000
}

fn default_screenshots_per_device() -> usize {
    10
}

/// Cron schedule settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    /// Cadence of the due-schedule sweep in seconds.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,

    /// Runs retained per schedule in its history ring.
    #[serde(default = "default_history_ring")]
    pub history_ring: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            history_ring: default_history_ring(),
        }
    }
}

fn default_tick_secs() -> u64 {
    15
}

fn default_history_ring() -> usize {
    50
}

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Load configuration from a string.
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = load_config_str("").unwrap();
        assert_eq!(config.orchestrator.max_concurrent_executions, 8);
        assert_eq!(config.session.create_timeout_secs, 30);
        assert_eq!(config.executor.action_timeout_secs, 30);
        assert!(!config.orchestrator.split_on_partial);
    }

    #[test]
    fn partial_section_overrides() {
        let config = load_config_str(
            r#"
            [orchestrator]
            split_on_partial = true
            completed_ring = 5

            [executor]
            action_timeout_secs = 10
            "#,
        )
        .unwrap();
        assert!(config.orchestrator.split_on_partial);
        assert_eq!(config.orchestrator.completed_ring, 5);
        assert_eq!(config.executor.action_timeout_secs, 10);
        assert_eq!(config.bus.subscriber_queue_depth, 256);
    }
}
