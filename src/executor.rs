//! Test execution engine.
//!
//! Given an admitted request and its already-locked devices, the executor
//! fans out one worker per device. Each worker runs the Cartesian product
//! `(scenario × repeat)` for its device sequentially, in the order given,
//! pausing `scenario_interval` between items; different devices run fully
//! in parallel. Results aggregate into a [`TestReport`].
//!
//! Two signals steer a running execution:
//!
//! - **cancel**: cooperative stop. The current step finishes as
//!   `stopped`; work items that never started are recorded as `stopped`
//!   with no steps.
//! - **force-complete**: not-yet-started items are recorded as `skipped`
//!   with reason `forceCompleted` and the report finalises with whatever
//!   was gathered.
//!
//! `test.complete` is published strictly after every worker has emitted
//! its `device.scenario.complete` events.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{EventBus, EventPayload, Room};
use crate::config::ExecutorConfig;
use crate::device::DeviceId;
use crate::interpreter::{
    FailureKind, InterpreterConfig, ScenarioInterpreter, StepCallback,
};
use crate::report::{
    DeviceResult, DeviceRunStatus, PerfSummary, ReportStats, ScenarioResult, ScenarioStatus,
    StepResult, StepStatus, TestReport,
};
use crate::scenario::{ScenarioGraph, ScenarioId};
use crate::session::{SessionError, SessionManager};
use crate::store::{ScenarioRepo, TemplateRepo};

/// One submitted test request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRequest {
    pub device_ids: Vec<DeviceId>,
    pub scenario_ids: Vec<ScenarioId>,
    #[serde(default = "default_repeat_count")]
    pub repeat_count: u32,
    /// Pause between scenarios on one device, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_interval: Option<u64>,
}

fn default_repeat_count() -> u32 {
    1
}

impl TestRequest {
    pub fn new(
        device_ids: impl IntoIterator<Item = impl Into<String>>,
        scenario_ids: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            device_ids: device_ids.into_iter().map(Into::into).collect(),
            scenario_ids: scenario_ids.into_iter().map(Into::into).collect(),
            repeat_count: 1,
            scenario_interval: None,
        }
    }

    pub fn with_repeat_count(mut self, repeat_count: u32) -> Self {
        self.repeat_count = repeat_count;
        self
    }

    /// Work items in this request: devices × scenarios × repeats.
    pub fn total_items(&self) -> usize {
        self.device_ids.len() * self.scenario_ids.len() * self.repeat_count.max(1) as usize
    }
}

/// Identity of one admitted execution.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub execution_id: String,
    pub queue_id: String,
    pub requester: String,
    pub test_name: Option<String>,
    pub request: TestRequest,
}

/// Per-device coarse state, read by the orchestrator to gate
/// force-complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    /// Worker not yet executing scenario steps (waiting on a session or
    /// between items).
    Pending,
    /// Interpreter actively running a scenario.
    Running,
    /// Worker drained its items.
    Finished,
}

/// Shared per-device progress table for one execution.
pub struct ExecutionProgress {
    devices: std::sync::Mutex<HashMap<DeviceId, WorkState>>,
}

impl ExecutionProgress {
    pub fn new(device_ids: &[DeviceId]) -> Self {
        Self {
            devices: std::sync::Mutex::new(
                device_ids
                    .iter()
                    .map(|id| (id.clone(), WorkState::Pending))
                    .collect(),
            ),
        }
    }

    fn set(&self, device_id: &str, state: WorkState) {
        if let Some(slot) = self
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(device_id)
        {
            *slot = state;
        }
    }

    pub fn snapshot(&self) -> HashMap<DeviceId, WorkState> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Force-complete is allowed only when waiters remain and nothing is
    /// actively running.
    pub fn can_force_complete(&self) -> bool {
        let devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        let any_pending = devices.values().any(|s| *s == WorkState::Pending);
        let none_running = devices.values().all(|s| *s != WorkState::Running);
        any_pending && none_running
    }
}

/// Control signals for one execution, held by the orchestrator.
#[derive(Clone)]
pub struct ExecutionSignals {
    pub cancel: CancellationToken,
    pub force: CancellationToken,
    pub progress: Arc<ExecutionProgress>,
}

impl ExecutionSignals {
    pub fn new(device_ids: &[DeviceId]) -> Self {
        Self {
            cancel: CancellationToken::new(),
            force: CancellationToken::new(),
            progress: Arc::new(ExecutionProgress::new(device_ids)),
        }
    }
}

/// Runs admitted requests against locked devices.
pub struct TestExecutor {
    sessions: SessionManager,
    scenarios: Arc<dyn ScenarioRepo>,
    templates: Arc<dyn TemplateRepo>,
    bus: EventBus,
    config: ExecutorConfig,
}

impl TestExecutor {
    pub fn new(
        sessions: SessionManager,
        scenarios: Arc<dyn ScenarioRepo>,
        templates: Arc<dyn TemplateRepo>,
        bus: EventBus,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            sessions,
            scenarios,
            templates,
            bus,
            config,
        }
    }

    /// Runs the plan to completion and returns the consolidated report.
    /// The caller holds the device locks for the whole call.
    pub async fn run(&self, plan: &ExecutionPlan, signals: &ExecutionSignals) -> TestReport {
        let started_at = Utc::now();
        let started = Instant::now();
        let total = plan.request.total_items();
        // increment and publish under one lock so progress is monotonic
        // on the wire
        let completed: std::sync::Mutex<usize> = std::sync::Mutex::new(0);

        self.publish_test_start(plan);

        let results: Mutex<Vec<DeviceResult>> = Mutex::new(Vec::new());
        let scenario_names: Mutex<HashMap<ScenarioId, String>> = Mutex::new(HashMap::new());
        let scenario_started: Mutex<HashSet<ScenarioId>> = Mutex::new(HashSet::new());
        let runs_per_scenario =
            plan.request.device_ids.len() * plan.request.repeat_count.max(1) as usize;
        let scenario_remaining: Mutex<HashMap<ScenarioId, usize>> = Mutex::new(
            plan.request
                .scenario_ids
                .iter()
                .map(|id| (id.clone(), runs_per_scenario))
                .collect(),
        );

        tokio_scoped::scope(|scope| {
            for device_id in &plan.request.device_ids {
                let results = &results;
                let scenario_names = &scenario_names;
                let scenario_started = &scenario_started;
                let scenario_remaining = &scenario_remaining;
                let completed = &completed;

                scope.spawn(async move {
                    self.run_device(
                        plan,
                        signals,
                        device_id,
                        results,
                        scenario_names,
                        scenario_started,
                        scenario_remaining,
                        completed,
                        total,
                    )
                    .await;
                });
            }
        });

        let results = results.into_inner();
        let names = scenario_names.into_inner();

        let scenarios: Vec<ScenarioResult> = plan
            .request
            .scenario_ids
            .iter()
            .map(|scenario_id| {
                let devices: Vec<DeviceResult> = results
                    .iter()
                    .filter(|r| &r.scenario_id == scenario_id)
                    .cloned()
                    .collect();
                ScenarioResult {
                    scenario_id: scenario_id.clone(),
                    name: names.get(scenario_id).cloned(),
                    status: ScenarioStatus::from_devices(&devices),
                    devices,
                }
            })
            .collect();

        let cancelled = signals.cancel.is_cancelled();
        let status = TestReport::derive_status(&scenarios, cancelled);
        let stats = TestReport::compute_stats(&scenarios);
        let report = TestReport {
            report_id: Uuid::new_v4().to_string(),
            execution_id: plan.execution_id.clone(),
            queue_id: plan.queue_id.clone(),
            requester: plan.requester.clone(),
            test_name: plan.test_name.clone(),
            status,
            started_at,
            finished_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            scenarios,
            stats: stats.clone(),
        };

        self.publish_test_complete(plan, &report, &stats);
        info!(
            execution = plan.execution_id.as_str(),
            status = report.status.as_str(),
            "execution finished"
        );
        report
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_device(
        &self,
        plan: &ExecutionPlan,
        signals: &ExecutionSignals,
        device_id: &str,
        results: &Mutex<Vec<DeviceResult>>,
        scenario_names: &Mutex<HashMap<ScenarioId, String>>,
        scenario_started: &Mutex<HashSet<ScenarioId>>,
        scenario_remaining: &Mutex<HashMap<ScenarioId, usize>>,
        completed: &std::sync::Mutex<usize>,
        total: usize,
    ) {
        let interval = plan
            .request
            .scenario_interval
            .unwrap_or(self.config.scenario_interval_ms);
        let repeats = plan.request.repeat_count.max(1);
        let mut device_dead: Option<String> = None;
        let mut first_item = true;

        for scenario_id in &plan.request.scenario_ids {
            for repeat in 0..repeats {
                if !first_item
                    && interval > 0
                    && device_dead.is_none()
                    && !signals.cancel.is_cancelled()
                    && !signals.force.is_cancelled()
                {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(interval)) => {}
                        _ = signals.cancel.cancelled() => {}
                        _ = signals.force.cancelled() => {}
                    }
                }
                first_item = false;

                let result = if signals.cancel.is_cancelled() {
                    unrun_result(device_id, scenario_id, repeat, DeviceRunStatus::Stopped, None)
                } else if signals.force.is_cancelled() {
                    unrun_result(
                        device_id,
                        scenario_id,
                        repeat,
                        DeviceRunStatus::Skipped,
                        Some("forceCompleted".to_string()),
                    )
                } else if let Some(reason) = &device_dead {
                    unrun_result(
                        device_id,
                        scenario_id,
                        repeat,
                        DeviceRunStatus::Skipped,
                        Some(reason.clone()),
                    )
                } else {
                    self.run_item(
                        plan,
                        signals,
                        device_id,
                        scenario_id,
                        repeat,
                        &mut device_dead,
                        scenario_names,
                        scenario_started,
                    )
                    .await
                };

                results.lock().await.push(result);

                let finished_scenario = {
                    let mut remaining = scenario_remaining.lock().await;
                    match remaining.get_mut(scenario_id) {
                        Some(count) => {
                            *count = count.saturating_sub(1);
                            *count == 0
                        }
                        None => false,
                    }
                };
                if finished_scenario {
                    let status = {
                        let results = results.lock().await;
                        let devices: Vec<DeviceResult> = results
                            .iter()
                            .filter(|r| &r.scenario_id == scenario_id)
                            .cloned()
                            .collect();
                        ScenarioStatus::from_devices(&devices)
                    };
                    self.bus.publish(
                        Room::Execution(plan.execution_id.clone()),
                        EventPayload::TestScenarioComplete {
                            execution_id: plan.execution_id.clone(),
                            scenario_id: scenario_id.clone(),
                            status: status.as_str().to_string(),
                        },
                    );
                }

                {
                    let mut done = completed.lock().unwrap_or_else(|e| e.into_inner());
                    *done += 1;
                    self.bus.publish(
                        Room::Execution(plan.execution_id.clone()),
                        EventPayload::TestProgress {
                            execution_id: plan.execution_id.clone(),
                            completed: *done,
                            total,
                            percent: *done as f64 * 100.0 / total.max(1) as f64,
                        },
                    );
                }
            }
        }

        signals.progress.set(device_id, WorkState::Finished);
        self.sessions.release(device_id).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_item(
        &self,
        plan: &ExecutionPlan,
        signals: &ExecutionSignals,
        device_id: &str,
        scenario_id: &str,
        repeat: u32,
        device_dead: &mut Option<String>,
        scenario_names: &Mutex<HashMap<ScenarioId, String>>,
        scenario_started: &Mutex<HashSet<ScenarioId>>,
    ) -> DeviceResult {
        if scenario_started.lock().await.insert(scenario_id.to_string()) {
            self.bus.publish(
                Room::Execution(plan.execution_id.clone()),
                EventPayload::TestScenarioStart {
                    execution_id: plan.execution_id.clone(),
                    scenario_id: scenario_id.to_string(),
                },
            );
        }
        self.publish_device_scenario_start(plan, device_id, scenario_id, repeat);

        let started_at = Utc::now();
        let started = Instant::now();

        let handle = tokio::select! {
            result = self.sessions.ensure(device_id) => result,
            _ = signals.force.cancelled() => {
                let result = unrun_result(
                    device_id, scenario_id, repeat,
                    DeviceRunStatus::Skipped, Some("forceCompleted".to_string()),
                );
                self.publish_device_scenario_complete(plan, &result, started.elapsed());
                return result;
            }
            _ = signals.cancel.cancelled() => {
                let result = unrun_result(
                    device_id, scenario_id, repeat, DeviceRunStatus::Stopped, None,
                );
                self.publish_device_scenario_complete(plan, &result, started.elapsed());
                return result;
            }
        };

        let result = match handle {
            Err(error) => {
                if matches!(error, SessionError::DeviceUnavailable(_)) {
                    *device_dead = Some(error.to_string());
                }
                warn!(
                    device = device_id,
                    scenario = scenario_id,
                    "session unavailable: {error}"
                );
                unrun_result(
                    device_id,
                    scenario_id,
                    repeat,
                    DeviceRunStatus::Skipped,
                    Some(error.to_string()),
                )
            }
            Ok(handle) => match self.scenarios.get(scenario_id).await {
                Err(error) => unrun_result(
                    device_id,
                    scenario_id,
                    repeat,
                    DeviceRunStatus::Skipped,
                    Some(format!("scenario unavailable: {error}")),
                ),
                Ok(scenario) => {
                    scenario_names
                        .lock()
                        .await
                        .entry(scenario_id.to_string())
                        .or_insert_with(|| scenario.name.clone());

                    match ScenarioGraph::compile(&scenario) {
                        Err(error) => {
                            let step = StepResult {
                                node_id: String::new(),
                                label: scenario.name.clone(),
                                node_kind: "graph".to_string(),
                                status: StepStatus::Failed,
                                attempt: 0,
                                failure: Some(FailureKind::AssertionFailed),
                                error: Some(error.to_string()),
                                wait_ms: 0,
                                action_ms: 0,
                                total_ms: 0,
                                match_confidence: None,
                                screenshot: None,
                            };
                            DeviceResult {
                                device_id: device_id.to_string(),
                                scenario_id: scenario_id.to_string(),
                                repeat_index: repeat,
                                status: DeviceRunStatus::Failed,
                                skip_reason: None,
                                perf: PerfSummary::from_steps(std::slice::from_ref(&step)),
                                steps: vec![step],
                                started_at,
                                duration_ms: started.elapsed().as_millis() as u64,
                                environment: self.sessions.registry().get(device_id),
                            }
                        }
                        Ok(graph) => {
                            signals.progress.set(device_id, WorkState::Running);

                            let bus = self.bus.clone();
                            let execution_id = plan.execution_id.clone();
                            let device = device_id.to_string();
                            let scenario_key = scenario_id.to_string();
                            let callback: StepCallback = Arc::new(move |step: &StepResult| {
                                bus.publish(
                                    Room::Execution(execution_id.clone()),
                                    EventPayload::DeviceNode {
                                        execution_id: execution_id.clone(),
                                        device_id: device.clone(),
                                        scenario_id: scenario_key.clone(),
                                        repeat,
                                        step: step.without_screenshot(),
                                    },
                                );
                            });

                            let interpreter_config = InterpreterConfig {
                                default_action_timeout: Duration::from_secs(
                                    self.config.action_timeout_secs,
                                ),
                                max_steps: self.config.max_steps,
                                capture_failure_screenshots: self.config.screenshots_per_device
                                    > 0,
                            };
                            let run = ScenarioInterpreter::new(
                                handle.driver.as_ref(),
                                self.templates.as_ref(),
                                interpreter_config,
                            )
                            .with_cancellation_token(signals.cancel.clone())
                            .with_step_callback(callback)
                            .run(&graph)
                            .await;

                            signals.progress.set(device_id, WorkState::Pending);

                            let mut steps = run.steps;
                            cap_screenshots(&mut steps, self.config.screenshots_per_device);
                            DeviceResult {
                                device_id: device_id.to_string(),
                                scenario_id: scenario_id.to_string(),
                                repeat_index: repeat,
                                status: run.status,
                                skip_reason: None,
                                perf: PerfSummary::from_steps(&steps),
                                steps,
                                started_at,
                                duration_ms: started.elapsed().as_millis() as u64,
                                environment: self.sessions.registry().get(device_id),
                            }
                        }
                    }
                }
            },
        };

        self.publish_device_scenario_complete(plan, &result, started.elapsed());
        result
    }

    fn publish_test_start(&self, plan: &ExecutionPlan) {
        let payload = EventPayload::TestStart {
            execution_id: plan.execution_id.clone(),
            queue_id: plan.queue_id.clone(),
            requester: plan.requester.clone(),
            test_name: plan.test_name.clone(),
            device_ids: plan.request.device_ids.clone(),
            scenario_ids: plan.request.scenario_ids.clone(),
        };
        self.bus.publish(Room::Global, payload.clone());
        self.bus
            .publish(Room::Execution(plan.execution_id.clone()), payload);
    }

    fn publish_test_complete(&self, plan: &ExecutionPlan, report: &TestReport, stats: &ReportStats) {
        let payload = EventPayload::TestComplete {
            execution_id: plan.execution_id.clone(),
            status: report.status.as_str().to_string(),
            passed: stats.passed,
            failed: stats.failed,
            skipped: stats.skipped,
            stopped: stats.stopped,
            duration_ms: report.duration_ms,
            report_id: Some(report.report_id.clone()),
        };
        self.bus
            .publish(Room::Execution(plan.execution_id.clone()), payload.clone());
        self.bus.publish(Room::Global, payload);
    }

    fn publish_device_scenario_start(
        &self,
        plan: &ExecutionPlan,
        device_id: &str,
        scenario_id: &str,
        repeat: u32,
    ) {
        let payload = EventPayload::DeviceScenarioStart {
            execution_id: plan.execution_id.clone(),
            device_id: device_id.to_string(),
            scenario_id: scenario_id.to_string(),
            repeat,
        };
        self.bus
            .publish(Room::Execution(plan.execution_id.clone()), payload.clone());
        self.bus
            .publish(Room::Device(device_id.to_string()), payload);
    }

    fn publish_device_scenario_complete(
        &self,
        plan: &ExecutionPlan,
        result: &DeviceResult,
        elapsed: Duration,
    ) {
        let payload = EventPayload::DeviceScenarioComplete {
            execution_id: plan.execution_id.clone(),
            device_id: result.device_id.clone(),
            scenario_id: result.scenario_id.clone(),
            repeat: result.repeat_index,
            status: result.status.as_str().to_string(),
            duration_ms: elapsed.as_millis() as u64,
        };
        self.bus
            .publish(Room::Execution(plan.execution_id.clone()), payload.clone());
        self.bus
            .publish(Room::Device(result.device_id.clone()), payload);
    }
}

fn unrun_result(
    device_id: &str,
    scenario_id: &str,
    repeat: u32,
    status: DeviceRunStatus,
    skip_reason: Option<String>,
) -> DeviceResult {
    DeviceResult {
        device_id: device_id.to_string(),
        scenario_id: scenario_id.to_string(),
        repeat_index: repeat,
        status,
        skip_reason,
        steps: Vec::new(),
        started_at: Utc::now(),
        duration_ms: 0,
        environment: None,
        perf: PerfSummary::default(),
    }
}

/// Keeps only the most recent `cap` screenshots in a step list.
fn cap_screenshots(steps: &mut [StepResult], cap: usize) {
    let with_screenshots: Vec<usize> = steps
        .iter()
        .enumerate()
        .filter(|(_, s)| s.screenshot.is_some())
        .map(|(i, _)| i)
        .collect();
    if with_screenshots.len() > cap {
        for index in &with_screenshots[..with_screenshots.len() - cap] {
            steps[*index].screenshot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Event;
    use crate::device::{DeviceInfo, DeviceRegistry};
    use crate::driver::DriverError;
    use crate::scenario::test_graphs;
    use crate::scenario::{ActionParams, Node, NodeKind, Scenario};
    use crate::session::MockBackend;
    use crate::store::{MemoryScenarios, MemoryTemplates};

    struct Fixture {
        executor: TestExecutor,
        backend: Arc<MockBackend>,
        registry: DeviceRegistry,
        bus: EventBus,
        sessions: SessionManager,
    }

    async fn fixture(devices: &[&str], scenarios: Vec<Scenario>) -> Fixture {
        let registry = DeviceRegistry::new();
        registry.poll_once(devices.iter().map(|d| DeviceInfo::new(*d, "pixel")).collect());
        let backend = Arc::new(MockBackend::new());
        let bus = EventBus::spawn(1024, CancellationToken::new());
        let backend_dyn: Arc<dyn crate::session::SessionBackend> = backend.clone();
        let sessions = SessionManager::new(
            crate::config::SessionConfig {
                create_timeout_secs: 30,
                ..Default::default()
            },
            registry.clone(),
            backend_dyn,
            bus.clone(),
        );
        let scenario_repo = Arc::new(MemoryScenarios::with(scenarios).await);
        let executor = TestExecutor::new(
            sessions.clone(),
            scenario_repo,
            Arc::new(MemoryTemplates::new()),
            bus.clone(),
            ExecutorConfig {
                action_timeout_secs: 2,
                ..Default::default()
            },
        );
        Fixture {
            executor,
            backend,
            registry,
            bus,
            sessions,
        }
    }

    fn plan(devices: &[&str], scenarios: &[&str]) -> ExecutionPlan {
        ExecutionPlan {
            execution_id: "e1".to_string(),
            queue_id: "q1".to_string(),
            requester: "alice".to_string(),
            test_name: Some("smoke".to_string()),
            request: TestRequest::new(devices.to_vec(), scenarios.to_vec()),
        }
    }

    async fn drain(sub: &mut crate::bus::Subscription) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = sub.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn two_free_devices_run_in_parallel_and_complete() {
        let fx = fixture(&["A", "B"], vec![test_graphs::linear()]).await;
        let mut sub = fx
            .bus
            .subscribe([Room::Execution("e1".into())])
            .await
            .unwrap();

        let plan = plan(&["A", "B"], &["linear"]);
        let signals = ExecutionSignals::new(&plan.request.device_ids);
        let report = fx.executor.run(&plan, &signals).await;

        assert_eq!(report.status, crate::report::ReportStatus::Completed);
        assert_eq!(report.scenarios.len(), 1);
        assert_eq!(report.scenarios[0].devices.len(), 2);
        assert_eq!(report.stats.passed, 2);

        // both device sessions were created
        assert_eq!(fx.backend.open_count("A"), 1);
        assert_eq!(fx.backend.open_count("B"), 1);

        // settle the dispatcher then inspect ordering
        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = drain(&mut sub).await;
        let kinds: Vec<&str> = events.iter().map(|e| e.payload.kind()).collect();
        assert_eq!(*kinds.last().unwrap(), "test.complete");
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == "device.scenario.complete")
                .count(),
            2
        );

        // progress is monotonic and ends at total
        let progress: Vec<usize> = events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::TestProgress { completed, .. } => Some(*completed),
                _ => None,
            })
            .collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*progress.last().unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refused_session_skips_the_scenario() {
        let fx = fixture(&["A"], vec![test_graphs::linear()]).await;
        fx.backend.refuse("A", "adb offline");

        let plan = plan(&["A"], &["linear"]);
        let signals = ExecutionSignals::new(&plan.request.device_ids);
        let report = fx.executor.run(&plan, &signals).await;

        let device = &report.scenarios[0].devices[0];
        assert_eq!(device.status, DeviceRunStatus::Skipped);
        assert!(device.skip_reason.as_deref().unwrap().contains("refused"));
        assert_eq!(report.scenarios[0].status, ScenarioStatus::Skipped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disconnected_device_skips_all_its_scenarios() {
        let second = Scenario::new("other", "Other")
            .with_node(Node::new("start", NodeKind::Start))
            .with_node(Node::new("end", NodeKind::End))
            .with_edge("start", "end", None);
        let fx = fixture(&["A"], vec![test_graphs::linear(), second]).await;
        fx.registry.poll_once(vec![]); // A departs before the run

        let plan = plan(&["A"], &["linear", "other"]);
        let signals = ExecutionSignals::new(&plan.request.device_ids);
        let report = fx.executor.run(&plan, &signals).await;

        for scenario in &report.scenarios {
            assert_eq!(scenario.devices[0].status, DeviceRunStatus::Skipped);
        }
        // terminal failure: the session was attempted once, not per scenario
        assert_eq!(fx.backend.open_count("A"), 0);
        assert_eq!(report.stats.skipped, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancellation_stops_current_and_remaining_work() {
        let wait = Scenario::new("slow", "Slow")
            .with_node(Node::new("start", NodeKind::Start))
            .with_node(Node::new(
                "w1",
                NodeKind::Action {
                    params: ActionParams::Wait { duration: 10_000 },
                    max_retries: 0,
                    retry_interval: 5,
                    timeout: None,
                },
            ))
            .with_node(Node::new("end", NodeKind::End))
            .with_edge("start", "w1", None)
            .with_edge("w1", "end", None);
        let fx = fixture(&["A"], vec![wait]).await;

        let plan = plan(&["A"], &["slow"]);
        let signals = ExecutionSignals::new(&plan.request.device_ids);
        let cancel = signals.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let report = fx.executor.run(&plan, &signals).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.status, crate::report::ReportStatus::Stopped);
        let device = &report.scenarios[0].devices[0];
        assert_eq!(device.status, DeviceRunStatus::Stopped);
        assert_eq!(
            device.steps.last().unwrap().status,
            StepStatus::Stopped
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn force_complete_skips_waiting_devices() {
        let fx = fixture(&["A", "B"], vec![test_graphs::linear()]).await;
        // A has a session already; B blocks in session creation.
        fx.sessions.ensure("A").await.unwrap();
        fx.backend.set_open_delay(Duration::from_secs(30));

        let plan = plan(&["A", "B"], &["linear"]);
        let signals = ExecutionSignals::new(&plan.request.device_ids);

        let force = signals.force.clone();
        let progress = Arc::clone(&signals.progress);
        tokio::spawn(async move {
            // wait until A finished and B is the lone waiter
            for _ in 0..200 {
                let snapshot = progress.snapshot();
                if snapshot.get("A") == Some(&WorkState::Finished)
                    && snapshot.get("B") == Some(&WorkState::Pending)
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            assert!(progress.can_force_complete());
            force.cancel();
        });

        let report = fx.executor.run(&plan, &signals).await;

        let scenario = &report.scenarios[0];
        let by_device: HashMap<&str, DeviceRunStatus> = scenario
            .devices
            .iter()
            .map(|d| (d.device_id.as_str(), d.status))
            .collect();
        assert_eq!(by_device["A"], DeviceRunStatus::Passed);
        assert_eq!(by_device["B"], DeviceRunStatus::Skipped);
        let b = scenario
            .devices
            .iter()
            .find(|d| d.device_id == "B")
            .unwrap();
        assert_eq!(b.skip_reason.as_deref(), Some("forceCompleted"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn repeats_run_sequentially_and_flag_flaky_scenarios() {
        let fx = fixture(&["A"], vec![test_graphs::linear()]).await;
        // pre-open the session so the tap script lands on the run driver
        fx.sessions.ensure("A").await.unwrap();
        let driver = fx.backend.driver("A").unwrap();
        // first repeat passes, second fails
        driver.script_action("tap", Ok(()));
        driver.script_action("tap", Err(DriverError::AppCrash("boom".into())));

        let plan = ExecutionPlan {
            request: TestRequest::new(["A"], ["linear"]).with_repeat_count(2),
            ..plan(&["A"], &["linear"])
        };
        let signals = ExecutionSignals::new(&plan.request.device_ids);
        let report = fx.executor.run(&plan, &signals).await;

        assert_eq!(report.status, crate::report::ReportStatus::Partial);
        assert_eq!(report.scenarios[0].devices.len(), 2);
        assert_eq!(report.scenarios[0].status, ScenarioStatus::Partial);
        assert_eq!(report.stats.flaky_scenarios, vec!["linear".to_string()]);
        assert_eq!(
            *report.stats.failure_histogram.get(&FailureKind::AppCrash).unwrap(),
            1
        );
    }

    #[test]
    fn screenshot_cap_keeps_most_recent() {
        let mut steps: Vec<StepResult> = (0..5)
            .map(|i| StepResult {
                node_id: format!("n{i}"),
                label: String::new(),
                node_kind: "action".into(),
                status: StepStatus::Failed,
                attempt: 0,
                failure: None,
                error: None,
                wait_ms: 0,
                action_ms: 0,
                total_ms: 0,
                match_confidence: None,
                screenshot: Some(vec![i as u8]),
            })
            .collect();
        cap_screenshots(&mut steps, 2);
        let kept: Vec<&str> = steps
            .iter()
            .filter(|s| s.screenshot.is_some())
            .map(|s| s.node_id.as_str())
            .collect();
        assert_eq!(kept, vec!["n3", "n4"]);
    }
}
