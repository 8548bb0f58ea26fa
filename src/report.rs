//! Report tree and aggregation rules.
//!
//! A finished execution produces a [`TestReport`]:
//!
//! ```text
//! TestReport
//! └── ScenarioResult (per scenario × repeat)
//!     └── DeviceResult (per device)
//!         └── StepResult (per interpreted node, one per retry attempt)
//! ```
//!
//! Status aggregation is mechanical: a scenario passes iff it passed on
//! every device, fails iff it failed everywhere, and is `partial` on any
//! mix. The report as a whole is `completed` only when every scenario
//! passed, and `stopped` when the run was cancelled.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::DeviceInfo;
use crate::interpreter::FailureKind;

/// Outcome of a single interpreted node (or one retry attempt of it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
    Stopped,
}

/// Telemetry for one interpreted node.
///
/// Timing is split into the time spent waiting (retry intervals, `Wait`
/// nodes) and the time spent inside the driver call. Failures carry the
/// classified [`FailureKind`] plus the raw driver message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub node_id: String,
    pub label: String,
    /// Node variant name (`action`, `condition`, `loop`, ...).
    pub node_kind: String,
    pub status: StepStatus,
    /// Retry attempt index, 0 for the first try.
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub wait_ms: u64,
    pub action_ms: u64,
    pub total_ms: u64,
    /// Match confidence for image/OCR steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_confidence: Option<f64>,
    /// Best-effort failure screenshot. Stripped from bus telemetry and
    /// subject to the retained-screenshot cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<Vec<u8>>,
}

impl StepResult {
    /// Copy of this step without the screenshot payload, for telemetry.
    pub fn without_screenshot(&self) -> StepResult {
        StepResult {
            screenshot: None,
            ..self.clone()
        }
    }
}

/// Terminal status of one scenario on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRunStatus {
    Passed,
    Failed,
    Skipped,
    Stopped,
}

impl DeviceRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceRunStatus::Passed => "passed",
            DeviceRunStatus::Failed => "failed",
            DeviceRunStatus::Skipped => "skipped",
            DeviceRunStatus::Stopped => "stopped",
        }
    }
}

/// Small per-device performance summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerfSummary {
    pub steps: usize,
    pub failed_steps: usize,
    pub avg_step_ms: u64,
    pub max_step_ms: u64,
}

impl PerfSummary {
    pub fn from_steps(steps: &[StepResult]) -> Self {
        let failed_steps = steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .count();
        let max_step_ms = steps.iter().map(|s| s.total_ms).max().unwrap_or(0);
        let avg_step_ms = if steps.is_empty() {
            0
        } else {
            steps.iter().map(|s| s.total_ms).sum::<u64>() / steps.len() as u64
        };
        Self {
            steps: steps.len(),
            failed_steps,
            avg_step_ms,
            max_step_ms,
        }
    }
}

/// One scenario run on one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceResult {
    pub device_id: String,
    pub scenario_id: String,
    pub repeat_index: u32,
    pub status: DeviceRunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub steps: Vec<StepResult>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Device attributes captured when the run started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<DeviceInfo>,
    pub perf: PerfSummary,
}

/// Aggregated status of one scenario across its devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Passed,
    Failed,
    Partial,
    Skipped,
    Stopped,
}

impl ScenarioStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioStatus::Passed => "passed",
            ScenarioStatus::Failed => "failed",
            ScenarioStatus::Partial => "partial",
            ScenarioStatus::Skipped => "skipped",
            ScenarioStatus::Stopped => "stopped",
        }
    }

    /// Derives the scenario status from its device results: `passed` iff
    /// all passed, `failed` iff all failed, `skipped` iff all skipped,
    /// `stopped` if any run was stopped, otherwise `partial`.
    pub fn from_devices(devices: &[DeviceResult]) -> Self {
        if devices.is_empty() {
            return ScenarioStatus::Skipped;
        }
        if devices.iter().any(|d| d.status == DeviceRunStatus::Stopped) {
            return ScenarioStatus::Stopped;
        }
        if devices.iter().all(|d| d.status == DeviceRunStatus::Passed) {
            ScenarioStatus::Passed
        } else if devices.iter().all(|d| d.status == DeviceRunStatus::Failed) {
            ScenarioStatus::Failed
        } else if devices.iter().all(|d| d.status == DeviceRunStatus::Skipped) {
            ScenarioStatus::Skipped
        } else {
            ScenarioStatus::Partial
        }
    }
}

/// Results for one scenario across all devices and repeats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub scenario_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: ScenarioStatus,
    pub devices: Vec<DeviceResult>,
}

/// Terminal status of the whole execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Completed,
    Partial,
    Failed,
    Stopped,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Completed => "completed",
            ReportStatus::Partial => "partial",
            ReportStatus::Failed => "failed",
            ReportStatus::Stopped => "stopped",
        }
    }
}

/// Summary statistics across all device runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportStats {
    pub total_runs: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub stopped: usize,
    /// Failure category histogram over all failed steps.
    pub failure_histogram: HashMap<FailureKind, usize>,
    /// Scenarios with mixed pass/fail outcomes across devices or repeats.
    pub flaky_scenarios: Vec<String>,
}

/// Consolidated report for one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub report_id: String,
    pub execution_id: String,
    pub queue_id: String,
    pub requester: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    pub status: ReportStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub scenarios: Vec<ScenarioResult>,
    pub stats: ReportStats,
}

impl TestReport {
    /// Derives the overall status: `completed` iff every scenario passed,
    /// `failed` iff all failed or were skipped with failures, `stopped`
    /// when cancelled, otherwise `partial`.
    pub fn derive_status(scenarios: &[ScenarioResult], cancelled: bool) -> ReportStatus {
        if cancelled {
            return ReportStatus::Stopped;
        }
        if scenarios.is_empty() {
            return ReportStatus::Completed;
        }
        if scenarios.iter().any(|s| s.status == ScenarioStatus::Stopped) {
            return ReportStatus::Stopped;
        }
        if scenarios.iter().all(|s| s.status == ScenarioStatus::Passed) {
            ReportStatus::Completed
        } else if scenarios.iter().all(|s| s.status == ScenarioStatus::Failed) {
            ReportStatus::Failed
        } else {
            ReportStatus::Partial
        }
    }

    /// Computes summary statistics over the scenario tree.
    pub fn compute_stats(scenarios: &[ScenarioResult]) -> ReportStats {
        let mut stats = ReportStats::default();
        let mut outcomes_by_scenario: HashMap<&str, (usize, usize)> = HashMap::new();

        for scenario in scenarios {
            for device in &scenario.devices {
                stats.total_runs += 1;
                match device.status {
                    DeviceRunStatus::Passed => stats.passed += 1,
                    DeviceRunStatus::Failed => stats.failed += 1,
                    DeviceRunStatus::Skipped => stats.skipped += 1,
                    DeviceRunStatus::Stopped => stats.stopped += 1,
                }
                let entry = outcomes_by_scenario
                    .entry(scenario.scenario_id.as_str())
                    .or_default();
                match device.status {
                    DeviceRunStatus::Passed => entry.0 += 1,
                    DeviceRunStatus::Failed => entry.1 += 1,
                    _ => {}
                }
                for step in &device.steps {
                    if let Some(kind) = step.failure {
                        *stats.failure_histogram.entry(kind).or_default() += 1;
                    }
                }
            }
        }

        stats.flaky_scenarios = outcomes_by_scenario
            .into_iter()
            .filter(|(_, (passes, fails))| *passes > 0 && *fails > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        stats.flaky_scenarios.sort();
        stats
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_result(device_id: &str, status: DeviceRunStatus) -> DeviceResult {
        DeviceResult {
            device_id: device_id.to_string(),
            scenario_id: "s1".to_string(),
            repeat_index: 0,
            status,
            skip_reason: None,
            steps: Vec::new(),
            started_at: Utc::now(),
            duration_ms: 100,
            environment: None,
            perf: PerfSummary::default(),
        }
    }

    fn scenario_result(status_per_device: &[DeviceRunStatus]) -> ScenarioResult {
        let devices: Vec<_> = status_per_device
            .iter()
            .enumerate()
            .map(|(i, s)| device_result(&format!("d{i}"), *s))
            .collect();
        ScenarioResult {
            scenario_id: "s1".to_string(),
            name: None,
            status: ScenarioStatus::from_devices(&devices),
            devices,
        }
    }

    #[test]
    fn scenario_status_all_passed() {
        let s = scenario_result(&[DeviceRunStatus::Passed, DeviceRunStatus::Passed]);
        assert_eq!(s.status, ScenarioStatus::Passed);
    }

    #[test]
    fn scenario_status_mixed_is_partial() {
        let s = scenario_result(&[DeviceRunStatus::Passed, DeviceRunStatus::Failed]);
        assert_eq!(s.status, ScenarioStatus::Partial);
    }

    #[test]
    fn scenario_status_all_skipped() {
        let s = scenario_result(&[DeviceRunStatus::Skipped, DeviceRunStatus::Skipped]);
        assert_eq!(s.status, ScenarioStatus::Skipped);
    }

    #[test]
    fn scenario_status_stopped_wins() {
        let s = scenario_result(&[DeviceRunStatus::Passed, DeviceRunStatus::Stopped]);
        assert_eq!(s.status, ScenarioStatus::Stopped);
    }

    #[test]
    fn report_status_rules() {
        let passed = scenario_result(&[DeviceRunStatus::Passed]);
        let failed = scenario_result(&[DeviceRunStatus::Failed]);

        assert_eq!(
            TestReport::derive_status(std::slice::from_ref(&passed), false),
            ReportStatus::Completed
        );
        assert_eq!(
            TestReport::derive_status(std::slice::from_ref(&failed), false),
            ReportStatus::Failed
        );
        assert_eq!(
            TestReport::derive_status(&[passed.clone(), failed], false),
            ReportStatus::Partial
        );
        assert_eq!(
            TestReport::derive_status(&[passed], true),
            ReportStatus::Stopped
        );
    }

    #[test]
    fn flaky_scenarios_require_mixed_outcomes() {
        let mixed = scenario_result(&[DeviceRunStatus::Passed, DeviceRunStatus::Failed]);
        let stats = TestReport::compute_stats(std::slice::from_ref(&mixed));
        assert_eq!(stats.flaky_scenarios, vec!["s1".to_string()]);
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.failed, 1);

        let steady = scenario_result(&[DeviceRunStatus::Passed, DeviceRunStatus::Passed]);
        let stats = TestReport::compute_stats(&[steady]);
        assert!(stats.flaky_scenarios.is_empty());
    }
}
