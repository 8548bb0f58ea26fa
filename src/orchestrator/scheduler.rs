//! The scheduler task: admission, device locking, fairness, splitting,
//! cancellation, and the completed ring.
//!
//! All scheduler state lives on this task. Commands arrive on an inbound
//! channel; executions run on their own tasks and report back with an
//! `ExecutionFinished` command, which releases their locks and wakes the
//! queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{EventBus, EventPayload, QueueEntryBrief, Room};
use crate::config::OrchestratorConfig;
use crate::device::{DeviceId, DeviceRegistry};
use crate::executor::{ExecutionPlan, ExecutionSignals, TestExecutor, TestRequest};
use crate::report::{ReportStatus, TestReport};
use crate::store::{MetricsSink, ReportRepo, ScenarioRepo};

use super::{
    BlockedDevice, CancelResponse, Command, CompletedSummary, DeviceAvailability,
    DeviceStatusEntry, Orchestrator, OrchestratorError, OrchestratorResult, QueueState,
    QueueStatusResponse, QueuedTest, RunningSummary, SplitInfo, SubmitOptions, SubmitResponse,
    SubmitStatus, WaitingInfo,
};

/// Everything the scheduler task needs.
pub struct SchedulerDeps {
    pub config: OrchestratorConfig,
    pub registry: DeviceRegistry,
    pub scenarios: Arc<dyn ScenarioRepo>,
    pub executor: Arc<TestExecutor>,
    pub reports: Arc<dyn ReportRepo>,
    pub metrics: Arc<dyn MetricsSink>,
    pub bus: EventBus,
}

impl Orchestrator {
    /// Spawns the scheduler task and returns its command handle.
    pub fn spawn(deps: SchedulerDeps, shutdown: CancellationToken) -> Orchestrator {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler {
            config: deps.config,
            registry: deps.registry,
            scenarios: deps.scenarios,
            executor: deps.executor,
            reports: deps.reports,
            metrics: deps.metrics,
            bus: deps.bus,
            tx: tx.clone(),
            queue: Vec::new(),
            locks: HashMap::new(),
            running: HashMap::new(),
            completed: VecDeque::new(),
            revision: 0,
        };
        tokio::spawn(scheduler.run(rx, shutdown));
        Orchestrator { tx }
    }
}

struct LockInfo {
    queue_id: String,
    execution_id: String,
    requester: String,
    test_name: Option<String>,
}

struct RunningExecution {
    queued: QueuedTest,
    signals: ExecutionSignals,
    started: Instant,
    total_items: usize,
}

struct Scheduler {
    config: OrchestratorConfig,
    registry: DeviceRegistry,
    scenarios: Arc<dyn ScenarioRepo>,
    executor: Arc<TestExecutor>,
    reports: Arc<dyn ReportRepo>,
    metrics: Arc<dyn MetricsSink>,
    bus: EventBus,
    /// Self-sender, used by execution tasks to report completion.
    tx: mpsc::UnboundedSender<Command>,
    /// Stable priority queue: higher priority first, FIFO within.
    queue: Vec<QueuedTest>,
    /// Device lock table, keyed by device id.
    locks: HashMap<DeviceId, LockInfo>,
    /// Running executions, keyed by execution id.
    running: HashMap<String, RunningExecution>,
    /// Last N completed tests for late-joining clients.
    completed: VecDeque<CompletedSummary>,
    revision: u64,
}

impl Scheduler {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, shutdown: CancellationToken) {
        info!("orchestrator scheduler started");
        loop {
            let command = tokio::select! {
                command = rx.recv() => match command {
                    Some(c) => c,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };

            match command {
                Command::Submit {
                    request,
                    requester,
                    options,
                    reply,
                } => {
                    let result = self.handle_submit(request, requester, options).await;
                    let _ = reply.send(result);
                }
                Command::Cancel {
                    queue_id,
                    caller,
                    reply,
                } => {
                    let result = self.handle_cancel(&queue_id, &caller);
                    let _ = reply.send(result);
                }
                Command::ForceComplete {
                    execution_id,
                    caller,
                    reply,
                } => {
                    let result = self.handle_force_complete(&execution_id, &caller);
                    let _ = reply.send(result);
                }
                Command::QueueStatus { viewer, reply } => {
                    let status = self.queue_status_snapshot();
                    if let Some(viewer) = viewer {
                        self.bus.publish(
                            Room::User(viewer.clone()),
                            EventPayload::QueueStatusResponse {
                                viewer,
                                status: serde_json::to_value(&status)
                                    .unwrap_or(serde_json::Value::Null),
                            },
                        );
                    }
                    let _ = reply.send(status);
                }
                Command::DeviceStatuses { user, reply } => {
                    let _ = reply.send(self.device_statuses(&user));
                }
                Command::ExecutionFinished {
                    queue_id,
                    execution_id,
                    report,
                } => {
                    self.handle_finished(&queue_id, &execution_id, *report).await;
                }
            }
        }
        info!("orchestrator scheduler stopped");
    }

    // ---- admission ----

    async fn handle_submit(
        &mut self,
        request: TestRequest,
        requester: String,
        options: SubmitOptions,
    ) -> OrchestratorResult<SubmitResponse> {
        self.validate(&request).await?;

        let locked: Vec<DeviceId> = request
            .device_ids
            .iter()
            .filter(|d| self.locks.contains_key(*d))
            .cloned()
            .collect();
        let available: Vec<DeviceId> = request
            .device_ids
            .iter()
            .filter(|d| !self.locks.contains_key(*d))
            .cloned()
            .collect();

        let capacity_free = self.running.len() < self.config.max_concurrent_executions;

        let response = if locked.is_empty() && capacity_free {
            let queued = self.new_queued(request, &requester, &options);
            let queue_id = queued.queue_id.clone();
            let execution_id = self.start_execution(queued)?;
            SubmitResponse {
                status: SubmitStatus::Started,
                queue_id,
                execution_id: Some(execution_id),
                position: None,
                estimated_wait_secs: None,
                split_execution: None,
            }
        } else if available.is_empty()
            || locked.is_empty()
            || !self.config.split_on_partial
            || !capacity_free
        {
            // fully blocked, at capacity, or splitting disabled
            let queued = self.new_queued(request, &requester, &options);
            let queue_id = queued.queue_id.clone();
            self.enqueue(queued);
            let (position, estimate) = self.queued_position(&queue_id);
            SubmitResponse {
                status: SubmitStatus::Queued,
                queue_id,
                execution_id: None,
                position,
                estimated_wait_secs: estimate,
                split_execution: None,
            }
        } else {
            // partial availability with splitting enabled: run what we
            // can now, queue the remainder with the same requester,
            // priority, and scenario list
            let mut immediate_request = request.clone();
            immediate_request.device_ids = available.clone();
            let mut queued_request = request;
            queued_request.device_ids = locked.clone();

            let immediate = self.new_queued(immediate_request, &requester, &options);
            let immediate_queue_id = immediate.queue_id.clone();
            let execution_id = self.start_execution(immediate)?;

            let mut remainder = self.new_queued(queued_request, &requester, &options);
            remainder.split_from = Some(immediate_queue_id.clone());
            let queued_queue_id = remainder.queue_id.clone();
            self.enqueue(remainder);
            let (position, estimate) = self.queued_position(&queued_queue_id);

            SubmitResponse {
                status: SubmitStatus::Partial,
                queue_id: immediate_queue_id.clone(),
                execution_id: Some(execution_id.clone()),
                position: None,
                estimated_wait_secs: estimate,
                split_execution: Some(SplitInfo {
                    immediate_queue_id,
                    immediate_execution_id: execution_id,
                    immediate_devices: available,
                    queued_queue_id,
                    queued_devices: locked,
                    queued_position: position.unwrap_or(1),
                }),
            }
        };

        self.broadcast_queue();
        Ok(response)
    }

    /// Validates a request in full before any admission: never partially
    /// admit.
    async fn validate(&self, request: &TestRequest) -> OrchestratorResult<()> {
        if request.device_ids.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "no devices requested".to_string(),
            ));
        }
        if request.scenario_ids.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "no scenarios requested".to_string(),
            ));
        }
        let unique: HashSet<&DeviceId> = request.device_ids.iter().collect();
        if unique.len() != request.device_ids.len() {
            return Err(OrchestratorError::InvalidRequest(
                "duplicate device ids in request".to_string(),
            ));
        }
        for device_id in &request.device_ids {
            match self.registry.get(device_id) {
                Some(device) if device.connected => {}
                Some(_) => {
                    return Err(OrchestratorError::InvalidRequest(format!(
                        "device {device_id} is disconnected"
                    )));
                }
                None => {
                    return Err(OrchestratorError::InvalidRequest(format!(
                        "unknown device {device_id}"
                    )));
                }
            }
        }
        for scenario_id in &request.scenario_ids {
            if !self.scenarios.exists(scenario_id).await {
                return Err(OrchestratorError::InvalidRequest(format!(
                    "unknown scenario {scenario_id}"
                )));
            }
        }
        Ok(())
    }

    fn new_queued(
        &self,
        request: TestRequest,
        requester: &str,
        options: &SubmitOptions,
    ) -> QueuedTest {
        QueuedTest {
            queue_id: Uuid::new_v4().to_string(),
            request,
            requester: requester.to_string(),
            priority: options.priority.min(2),
            test_name: options.test_name.clone(),
            kind: options.kind,
            submitted_at: Utc::now(),
            state: QueueState::Queued,
            started_at: None,
            completed_at: None,
            waiting_info: None,
            execution_id: None,
            split_from: None,
        }
    }

    fn enqueue(&mut self, queued: QueuedTest) {
        self.queue.push(queued);
        // stable sort: FIFO within equal (priority, submitted_at)
        self.queue
            .sort_by_key(|q| (std::cmp::Reverse(q.priority), q.submitted_at));
        self.refresh_waiting_info();
    }

    /// Locks the devices and hands the item to the executor. The item
    /// must have a fully free device set.
    fn start_execution(&mut self, mut queued: QueuedTest) -> OrchestratorResult<String> {
        let execution_id = Uuid::new_v4().to_string();

        if let Some(conflict) = queued
            .request
            .device_ids
            .iter()
            .find(|d| self.locks.contains_key(*d))
        {
            // double-lock would break the one-tenant-per-device
            // invariant; abort this execution
            error!(
                queue_id = queued.queue_id.as_str(),
                device = conflict.as_str(),
                "device already locked at admission; aborting execution"
            );
            queued.state = QueueState::Failed;
            queued.completed_at = Some(Utc::now());
            self.push_completed(&queued, None);
            return Err(OrchestratorError::InvalidRequest(format!(
                "device {conflict} already locked"
            )));
        }

        for device_id in &queued.request.device_ids {
            self.locks.insert(
                device_id.clone(),
                LockInfo {
                    queue_id: queued.queue_id.clone(),
                    execution_id: execution_id.clone(),
                    requester: queued.requester.clone(),
                    test_name: queued.test_name.clone(),
                },
            );
        }

        queued.state = QueueState::Running;
        queued.started_at = Some(Utc::now());
        queued.execution_id = Some(execution_id.clone());
        queued.waiting_info = None;

        let signals = ExecutionSignals::new(&queued.request.device_ids);
        let plan = ExecutionPlan {
            execution_id: execution_id.clone(),
            queue_id: queued.queue_id.clone(),
            requester: queued.requester.clone(),
            test_name: queued.test_name.clone(),
            request: queued.request.clone(),
        };
        let total_items = queued.request.total_items();

        self.running.insert(
            execution_id.clone(),
            RunningExecution {
                queued,
                signals: signals.clone(),
                started: Instant::now(),
                total_items,
            },
        );

        let executor = Arc::clone(&self.executor);
        let tx = self.tx.clone();
        let task_execution_id = execution_id.clone();
        tokio::spawn(async move {
            let report = executor.run(&plan, &signals).await;
            let _ = tx.send(Command::ExecutionFinished {
                queue_id: plan.queue_id.clone(),
                execution_id: task_execution_id,
                report: Box::new(report),
            });
        });

        info!(execution = execution_id.as_str(), "execution started");
        Ok(execution_id)
    }

    // ---- completion ----

    async fn handle_finished(&mut self, queue_id: &str, execution_id: &str, report: TestReport) {
        let Some(mut running) = self.running.remove(execution_id) else {
            // lost completion: force-release any locks attributed to it
            error!(
                execution = execution_id,
                "completion for unknown execution; force-releasing its locks"
            );
            self.locks.retain(|_, lock| lock.execution_id != execution_id);
            self.wake_queue();
            self.broadcast_queue();
            return;
        };

        self.locks.retain(|_, lock| lock.execution_id != execution_id);

        running.queued.state = match report.status {
            ReportStatus::Stopped => QueueState::Cancelled,
            ReportStatus::Failed => QueueState::Failed,
            _ => QueueState::Completed,
        };
        running.queued.completed_at = Some(Utc::now());

        let report_id = match self.reports.put(report.clone()).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(execution = execution_id, "failed to store report: {e}");
                None
            }
        };
        self.metrics.record_execution(&report).await;

        let mut summary = completed_summary(&running.queued, Some(&report));
        summary.report_id = report_id;
        self.completed.push_back(summary);
        while self.completed.len() > self.config.completed_ring {
            self.completed.pop_front();
        }

        debug!(
            queue_id,
            execution = execution_id,
            state = running.queued.state.as_str(),
            "execution finalised, locks released"
        );

        self.wake_queue();
        self.broadcast_queue();
    }

    /// Head-of-line scan: admit every queued item whose device set is
    /// fully free, in queue order. Not strict FIFO across the whole
    /// queue; blocked items do not hold back disjoint ones.
    fn wake_queue(&mut self) {
        let mut index = 0;
        while index < self.queue.len() {
            if self.running.len() >= self.config.max_concurrent_executions {
                break;
            }
            let admissible = self.queue[index]
                .request
                .device_ids
                .iter()
                .all(|d| !self.locks.contains_key(d));
            if admissible {
                let item = self.queue.remove(index);
                if self.start_execution(item).is_err() {
                    // invariant violation already logged; keep scanning
                }
            } else {
                index += 1;
            }
        }
        self.refresh_waiting_info();
    }

    // ---- cancellation & force-complete ----

    fn handle_cancel(&mut self, queue_id: &str, caller: &str) -> OrchestratorResult<CancelResponse> {
        if let Some(index) = self.queue.iter().position(|q| q.queue_id == queue_id) {
            if self.queue[index].requester != caller {
                return Err(OrchestratorError::Forbidden(
                    "only the requester may cancel".to_string(),
                ));
            }
            let mut item = self.queue.remove(index);
            item.state = QueueState::Cancelled;
            item.completed_at = Some(Utc::now());
            self.push_completed(&item, None);
            self.refresh_waiting_info();
            self.broadcast_queue();
            info!(queue_id, "queued test cancelled");
            return Ok(CancelResponse {
                ok: true,
                message: "queued test cancelled".to_string(),
            });
        }

        if let Some(running) = self
            .running
            .values()
            .find(|r| r.queued.queue_id == queue_id)
        {
            if running.queued.requester != caller {
                return Err(OrchestratorError::Forbidden(
                    "only the requester may cancel".to_string(),
                ));
            }
            running.signals.cancel.cancel();
            info!(queue_id, "cancellation requested for running execution");
            return Ok(CancelResponse {
                ok: true,
                message: "cancellation requested; locks release when workers drain".to_string(),
            });
        }

        if self.completed.iter().any(|c| c.queue_id == queue_id) {
            // cancelling a terminal test is a no-op success
            return Ok(CancelResponse {
                ok: true,
                message: "test already finished".to_string(),
            });
        }

        Err(OrchestratorError::NotFound(queue_id.to_string()))
    }

    fn handle_force_complete(
        &mut self,
        execution_id: &str,
        caller: &str,
    ) -> OrchestratorResult<()> {
        let running = self
            .running
            .get(execution_id)
            .ok_or_else(|| OrchestratorError::NotFound(execution_id.to_string()))?;
        if running.queued.requester != caller {
            return Err(OrchestratorError::Forbidden(
                "only the requester may force-complete".to_string(),
            ));
        }
        if !running.signals.progress.can_force_complete() {
            return Err(OrchestratorError::PreconditionFailed(
                "force-complete requires waiting devices and no running ones".to_string(),
            ));
        }
        running.signals.force.cancel();
        info!(execution = execution_id, "force-complete requested");
        Ok(())
    }

    // ---- views ----

    fn queue_status_snapshot(&mut self) -> QueueStatusResponse {
        self.refresh_waiting_info();
        let mut running: Vec<RunningSummary> = self
            .running
            .values()
            .map(|r| RunningSummary {
                queue_id: r.queued.queue_id.clone(),
                execution_id: r.queued.execution_id.clone().unwrap_or_default(),
                requester: r.queued.requester.clone(),
                test_name: r.queued.test_name.clone(),
                device_ids: r.queued.request.device_ids.clone(),
                started_at: r.queued.started_at.unwrap_or_else(Utc::now),
            })
            .collect();
        running.sort_by(|a, b| a.started_at.cmp(&b.started_at));

        QueueStatusResponse {
            revision: self.revision,
            queued: self.queue.clone(),
            running,
            recent: self.completed.iter().rev().cloned().collect(),
        }
    }

    fn device_statuses(&self, user: &str) -> Vec<DeviceStatusEntry> {
        let reserved: HashSet<&DeviceId> = self
            .queue
            .iter()
            .flat_map(|q| q.request.device_ids.iter())
            .collect();

        self.registry
            .list()
            .into_iter()
            .map(|device| {
                if let Some(lock) = self.locks.get(&device.id) {
                    let status = if lock.requester == user {
                        DeviceAvailability::BusyMine
                    } else {
                        DeviceAvailability::BusyOther
                    };
                    DeviceStatusEntry {
                        device_id: device.id,
                        status,
                        connected: device.connected,
                        locked_by: Some(lock.requester.clone()),
                        test_name: lock.test_name.clone(),
                        execution_id: Some(lock.execution_id.clone()),
                    }
                } else {
                    let status = if reserved.contains(&device.id) {
                        DeviceAvailability::Reserved
                    } else {
                        DeviceAvailability::Available
                    };
                    DeviceStatusEntry {
                        device_id: device.id,
                        status,
                        connected: device.connected,
                        locked_by: None,
                        test_name: None,
                        execution_id: None,
                    }
                }
            })
            .collect()
    }

    // ---- bookkeeping ----

    /// Recomputes positions and blocking causes for every queued item.
    fn refresh_waiting_info(&mut self) {
        let estimates: HashMap<&str, u64> = self
            .running
            .values()
            .map(|r| {
                (
                    r.queued.execution_id.as_deref().unwrap_or_default(),
                    self.estimated_remaining_secs(r),
                )
            })
            .collect();

        for (index, item) in self.queue.iter_mut().enumerate() {
            let blocked: Vec<BlockedDevice> = item
                .request
                .device_ids
                .iter()
                .filter_map(|d| {
                    self.locks.get(d).map(|lock| BlockedDevice {
                        device_id: d.clone(),
                        used_by: lock.requester.clone(),
                        test_name: lock.test_name.clone(),
                        estimated_remaining_secs: estimates
                            .get(lock.execution_id.as_str())
                            .copied()
                            .unwrap_or(0),
                    })
                })
                .collect();

            let estimated_wait_secs = blocked
                .iter()
                .map(|b| b.estimated_remaining_secs)
                .max()
                .unwrap_or(0);
            item.state = if blocked.is_empty() {
                QueueState::Queued
            } else {
                QueueState::WaitingDevices
            };
            item.waiting_info = Some(WaitingInfo {
                blocked_by_devices: blocked,
                queue_position: index + 1,
                estimated_wait_secs,
            });
        }
    }

    /// Coarse completion estimate for one running execution.
    fn estimated_remaining_secs(&self, running: &RunningExecution) -> u64 {
        let budget = running.total_items as u64 * self.config.estimated_scenario_secs;
        budget.saturating_sub(running.started.elapsed().as_secs())
    }

    fn queued_position(&mut self, queue_id: &str) -> (Option<usize>, Option<u64>) {
        self.refresh_waiting_info();
        self.queue
            .iter()
            .find(|q| q.queue_id == queue_id)
            .and_then(|q| q.waiting_info.as_ref())
            .map(|info| (Some(info.queue_position), Some(info.estimated_wait_secs)))
            .unwrap_or((None, None))
    }

    fn push_completed(&mut self, item: &QueuedTest, report: Option<&TestReport>) {
        self.completed.push_back(completed_summary(item, report));
        while self.completed.len() > self.config.completed_ring {
            self.completed.pop_front();
        }
    }

    /// Broadcasts `queue.updated` with a fresh monotonic revision.
    fn broadcast_queue(&mut self) {
        self.refresh_waiting_info();
        self.revision += 1;
        let mut entries: Vec<QueueEntryBrief> = self
            .queue
            .iter()
            .map(|q| QueueEntryBrief {
                queue_id: q.queue_id.clone(),
                requester: q.requester.clone(),
                test_name: q.test_name.clone(),
                state: q.state.as_str().to_string(),
                priority: q.priority,
                position: q.waiting_info.as_ref().map(|w| w.queue_position),
            })
            .collect();
        entries.extend(self.running.values().map(|r| QueueEntryBrief {
            queue_id: r.queued.queue_id.clone(),
            requester: r.queued.requester.clone(),
            test_name: r.queued.test_name.clone(),
            state: r.queued.state.as_str().to_string(),
            priority: r.queued.priority,
            position: None,
        }));
        self.bus.publish(
            Room::Global,
            EventPayload::QueueUpdated {
                revision: self.revision,
                entries,
            },
        );
    }
}

fn completed_summary(item: &QueuedTest, report: Option<&TestReport>) -> CompletedSummary {
    let (success, success_count, total_count, duration_ms, report_id) = match report {
        Some(report) => (
            report.status == ReportStatus::Completed,
            report.stats.passed,
            report.stats.total_runs,
            report.duration_ms,
            Some(report.report_id.clone()),
        ),
        None => (false, 0, 0, 0, None),
    };
    CompletedSummary {
        queue_id: item.queue_id.clone(),
        execution_id: item.execution_id.clone(),
        requester: item.requester.clone(),
        test_name: item.test_name.clone(),
        state: item.state,
        success,
        success_count,
        total_count,
        duration_ms,
        completed_at: item.completed_at.unwrap_or_else(Utc::now),
        report_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::bus::Subscription;
    use crate::config::{ExecutorConfig, SessionConfig};
    use crate::device::DeviceInfo;
    use crate::scenario::{ActionParams, Node, NodeKind, Scenario};
    use crate::session::{MockBackend, SessionManager};
    use crate::store::{MemoryMetrics, MemoryReports, MemoryScenarios, MemoryTemplates};

    fn quick_scenario(id: &str) -> Scenario {
        Scenario::new(id, id)
            .with_node(Node::new("start", NodeKind::Start))
            .with_node(Node::new("end", NodeKind::End))
            .with_edge("start", "end", None)
    }

    fn wait_scenario(id: &str, duration_ms: u64) -> Scenario {
        Scenario::new(id, id)
            .with_node(Node::new("start", NodeKind::Start))
            .with_node(Node::new(
                "w1",
                NodeKind::Action {
                    params: ActionParams::Wait {
                        duration: duration_ms,
                    },
                    max_retries: 0,
                    retry_interval: 5,
                    timeout: None,
                },
            ))
            .with_node(Node::new("end", NodeKind::End))
            .with_edge("start", "w1", None)
            .with_edge("w1", "end", None)
    }

    struct Fx {
        orchestrator: Orchestrator,
        bus: EventBus,
        registry: DeviceRegistry,
        backend: Arc<MockBackend>,
        sessions: SessionManager,
        reports: Arc<MemoryReports>,
        metrics: Arc<MemoryMetrics>,
        shutdown: CancellationToken,
    }

    async fn fixture(split_on_partial: bool) -> Fx {
        let shutdown = CancellationToken::new();
        let registry = DeviceRegistry::new();
        registry.poll_once(vec![
            DeviceInfo::new("A", "pixel"),
            DeviceInfo::new("B", "galaxy"),
            DeviceInfo::new("C", "oneplus"),
        ]);
        let bus = EventBus::spawn(4096, shutdown.clone());
        let backend = Arc::new(MockBackend::new());
        let backend_dyn: Arc<dyn crate::session::SessionBackend> = backend.clone();
        let sessions = SessionManager::new(
            SessionConfig {
                create_timeout_secs: 30,
                ..Default::default()
            },
            registry.clone(),
            backend_dyn,
            bus.clone(),
        );
        let scenarios = Arc::new(
            MemoryScenarios::with(vec![
                quick_scenario("s1"),
                quick_scenario("s2"),
                quick_scenario("s3"),
                wait_scenario("slow", 400),
                wait_scenario("crawl", 30_000),
            ])
            .await,
        );
        let executor = Arc::new(TestExecutor::new(
            sessions.clone(),
            scenarios.clone(),
            Arc::new(MemoryTemplates::new()),
            bus.clone(),
            ExecutorConfig {
                action_timeout_secs: 2,
                ..Default::default()
            },
        ));
        let reports = Arc::new(MemoryReports::new());
        let metrics = Arc::new(MemoryMetrics::new());
        let orchestrator = Orchestrator::spawn(
            SchedulerDeps {
                config: OrchestratorConfig {
                    split_on_partial,
                    ..Default::default()
                },
                registry: registry.clone(),
                scenarios,
                executor,
                reports: reports.clone(),
                metrics: metrics.clone(),
                bus: bus.clone(),
            },
            shutdown.clone(),
        );
        Fx {
            orchestrator,
            bus,
            registry,
            backend,
            sessions,
            reports,
            metrics,
            shutdown,
        }
    }

    fn request(devices: &[&str], scenarios: &[&str]) -> TestRequest {
        TestRequest::new(devices.to_vec(), scenarios.to_vec())
    }

    async fn wait_until<F, Fut>(mut probe: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if probe().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    async fn wait_idle(fx: &Fx) -> bool {
        let orchestrator = fx.orchestrator.clone();
        wait_until(|| {
            let orchestrator = orchestrator.clone();
            async move {
                let status = orchestrator.queue_status(None).await.unwrap();
                status.running.is_empty() && status.queued.is_empty()
            }
        })
        .await
    }

    async fn next_terminal(sub: &mut Subscription) -> Option<EventPayload> {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
                .await
                .ok()??;
            if event.payload.kind() == "test.complete" {
                return Some(event.payload);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn free_devices_start_immediately_and_complete() {
        let fx = fixture(false).await;
        let mut sub = fx.bus.subscribe([Room::Global]).await.unwrap();

        let response = fx
            .orchestrator
            .submit(request(&["A", "B"], &["s1"]), "alice", SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(response.status, SubmitStatus::Started);
        assert!(response.execution_id.is_some());

        match next_terminal(&mut sub).await.unwrap() {
            EventPayload::TestComplete { status, .. } => assert_eq!(status, "completed"),
            _ => unreachable!(),
        }
        assert!(wait_idle(&fx).await);

        // report stored, metrics recorded, ring populated
        let recent = fx.orchestrator.queue_status(None).await.unwrap().recent;
        assert_eq!(recent.len(), 1);
        assert!(recent[0].success);
        assert_eq!(recent[0].success_count, 2);
        assert_eq!(recent[0].total_count, 2);
        assert!(fx.reports.list_recent(10).await.unwrap().len() == 1);
        assert_eq!(fx.metrics.recorded().await.len(), 1);

        fx.shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn contention_queues_fifo_within_priority() {
        let fx = fixture(false).await;

        let first = fx
            .orchestrator
            .submit(request(&["A"], &["slow"]), "u1", SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(first.status, SubmitStatus::Started);

        let second = fx
            .orchestrator
            .submit(request(&["A"], &["s2"]), "u2", SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(second.status, SubmitStatus::Queued);
        assert_eq!(second.position, Some(1));

        // disjoint device set runs immediately despite the queue
        let third = fx
            .orchestrator
            .submit(request(&["B"], &["s3"]), "u3", SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(third.status, SubmitStatus::Started);

        // the queued item names its blocker
        let status = fx.orchestrator.queue_status(None).await.unwrap();
        let queued = &status.queued[0];
        assert_eq!(queued.state, QueueState::WaitingDevices);
        let info = queued.waiting_info.as_ref().unwrap();
        assert_eq!(info.queue_position, 1);
        assert_eq!(info.blocked_by_devices.len(), 1);
        assert_eq!(info.blocked_by_devices[0].device_id, "A");
        assert_eq!(info.blocked_by_devices[0].used_by, "u1");

        // when u1 finishes, u2 is admitted
        let orchestrator = fx.orchestrator.clone();
        let admitted = wait_until(|| {
            let orchestrator = orchestrator.clone();
            let queue_id = second.queue_id.clone();
            async move {
                let status = orchestrator.queue_status(None).await.unwrap();
                status.queued.iter().all(|q| q.queue_id != queue_id)
            }
        })
        .await;
        assert!(admitted);
        assert!(wait_idle(&fx).await);

        fx.shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disjoint_lower_priority_overtakes_blocked_head() {
        let fx = fixture(false).await;

        // occupy A and B
        let blocker = fx
            .orchestrator
            .submit(request(&["A", "B"], &["slow"]), "u1", SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(blocker.status, SubmitStatus::Started);

        // high-priority head, blocked on A
        let head = fx
            .orchestrator
            .submit(
                request(&["A"], &["s1"]),
                "u2",
                SubmitOptions::default().with_priority(2),
            )
            .await
            .unwrap();
        assert_eq!(head.status, SubmitStatus::Queued);

        // later, lower priority, disjoint devices: admitted immediately
        let disjoint = fx
            .orchestrator
            .submit(
                request(&["C"], &["s1"]),
                "u3",
                SubmitOptions::default().with_priority(0),
            )
            .await
            .unwrap();
        assert_eq!(disjoint.status, SubmitStatus::Started);

        // a later equal-priority item on A must sit behind the head
        let later = fx
            .orchestrator
            .submit(
                request(&["A"], &["s2"]),
                "u4",
                SubmitOptions::default().with_priority(2),
            )
            .await
            .unwrap();
        assert_eq!(later.status, SubmitStatus::Queued);
        let status = fx.orchestrator.queue_status(None).await.unwrap();
        let ids: Vec<&str> = status.queued.iter().map(|q| q.queue_id.as_str()).collect();
        let head_pos = ids.iter().position(|id| *id == head.queue_id).unwrap();
        let later_pos = ids.iter().position(|id| *id == later.queue_id).unwrap();
        assert!(head_pos < later_pos);

        // positions form a contiguous 1..N sequence
        let positions: Vec<usize> = status
            .queued
            .iter()
            .filter_map(|q| q.waiting_info.as_ref().map(|w| w.queue_position))
            .collect();
        assert_eq!(positions, (1..=status.queued.len()).collect::<Vec<_>>());

        assert!(wait_idle(&fx).await);
        fx.shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn partial_availability_splits_when_enabled() {
        let fx = fixture(true).await;

        let blocker = fx
            .orchestrator
            .submit(request(&["C"], &["slow"]), "u1", SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(blocker.status, SubmitStatus::Started);

        let response = fx
            .orchestrator
            .submit(
                request(&["A", "B", "C"], &["s1"]),
                "u2",
                SubmitOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(response.status, SubmitStatus::Partial);
        let split = response.split_execution.unwrap();
        assert_eq!(split.immediate_devices, vec!["A", "B"]);
        assert_eq!(split.queued_devices, vec!["C"]);
        assert_eq!(split.queued_position, 1);

        // queued half keeps the requester and runs once C frees up
        let status = fx.orchestrator.queue_status(None).await.unwrap();
        let remainder = status
            .queued
            .iter()
            .find(|q| q.queue_id == split.queued_queue_id)
            .unwrap();
        assert_eq!(remainder.requester, "u2");
        assert_eq!(remainder.split_from.as_deref(), Some(split.immediate_queue_id.as_str()));

        assert!(wait_idle(&fx).await);
        // both halves (plus the blocker) produced reports
        assert_eq!(fx.reports.list_recent(10).await.unwrap().len(), 3);

        fx.shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_running_stops_and_frees_the_device() {
        let fx = fixture(false).await;
        let mut sub = fx.bus.subscribe([Room::Global]).await.unwrap();

        let response = fx
            .orchestrator
            .submit(request(&["A"], &["crawl"]), "alice", SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(response.status, SubmitStatus::Started);

        // someone else may not cancel it
        let forbidden = fx.orchestrator.cancel(&response.queue_id, "mallory").await;
        assert!(matches!(forbidden, Err(OrchestratorError::Forbidden(_))));

        let cancelled = fx
            .orchestrator
            .cancel(&response.queue_id, "alice")
            .await
            .unwrap();
        assert!(cancelled.ok);

        match next_terminal(&mut sub).await.unwrap() {
            EventPayload::TestComplete { status, .. } => assert_eq!(status, "stopped"),
            _ => unreachable!(),
        }

        // device A returns to available within bounded delay
        let orchestrator = fx.orchestrator.clone();
        let freed = wait_until(|| {
            let orchestrator = orchestrator.clone();
            async move {
                let statuses = orchestrator.device_statuses("alice").await.unwrap();
                statuses
                    .iter()
                    .find(|d| d.device_id == "A")
                    .map(|d| d.status == DeviceAvailability::Available)
                    .unwrap_or(false)
            }
        })
        .await;
        assert!(freed);

        // the ring records the cancellation
        let recent = fx.orchestrator.queue_status(None).await.unwrap().recent;
        assert_eq!(recent[0].state, QueueState::Cancelled);
        assert!(!recent[0].success);

        // cancelling again is a no-op success
        let again = fx
            .orchestrator
            .cancel(&response.queue_id, "alice")
            .await
            .unwrap();
        assert!(again.ok);

        fx.shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_queued_removes_it_and_keeps_positions_contiguous() {
        let fx = fixture(false).await;

        fx.orchestrator
            .submit(request(&["A"], &["slow"]), "u1", SubmitOptions::default())
            .await
            .unwrap();
        let q1 = fx
            .orchestrator
            .submit(request(&["A"], &["s1"]), "u2", SubmitOptions::default())
            .await
            .unwrap();
        let q2 = fx
            .orchestrator
            .submit(request(&["A"], &["s2"]), "u3", SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(q1.position, Some(1));
        assert_eq!(q2.position, Some(2));

        fx.orchestrator.cancel(&q1.queue_id, "u2").await.unwrap();

        let status = fx.orchestrator.queue_status(None).await.unwrap();
        assert_eq!(status.queued.len(), 1);
        assert_eq!(
            status.queued[0].waiting_info.as_ref().unwrap().queue_position,
            1
        );

        assert!(wait_idle(&fx).await);
        fx.shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn force_complete_requires_waiting_only_devices() {
        let fx = fixture(false).await;

        // B's session will hang; give A a ready session so it finishes
        fx.sessions.ensure("A").await.unwrap();
        fx.backend.set_open_delay(Duration::from_secs(60));

        let mut device_events = fx
            .bus
            .subscribe([Room::Device("A".to_string())])
            .await
            .unwrap();

        let response = fx
            .orchestrator
            .submit(request(&["A", "B"], &["s1"]), "alice", SubmitOptions::default())
            .await
            .unwrap();
        let execution_id = response.execution_id.unwrap();

        // wait for A to finish its scenario, so only B remains pending
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), device_events.recv())
                .await
                .unwrap()
                .unwrap();
            if event.payload.kind() == "device.scenario.complete" {
                break;
            }
        }

        let orchestrator = fx.orchestrator.clone();
        let exec = execution_id.clone();
        let ready = wait_until(|| {
            let orchestrator = orchestrator.clone();
            let exec = exec.clone();
            async move { orchestrator.force_complete(&exec, "alice").await.is_ok() }
        })
        .await;
        assert!(ready);

        assert!(wait_idle(&fx).await);
        let report = &fx.reports.list_recent(1).await.unwrap()[0];
        let statuses: HashMap<&str, &str> = report.scenarios[0]
            .devices
            .iter()
            .map(|d| (d.device_id.as_str(), d.status.as_str()))
            .collect();
        assert_eq!(statuses["A"], "passed");
        assert_eq!(statuses["B"], "skipped");
        let b = report.scenarios[0]
            .devices
            .iter()
            .find(|d| d.device_id == "B")
            .unwrap();
        assert_eq!(b.skip_reason.as_deref(), Some("forceCompleted"));

        fx.shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn force_complete_rejected_while_devices_run() {
        let fx = fixture(false).await;

        let response = fx
            .orchestrator
            .submit(request(&["A"], &["crawl"]), "alice", SubmitOptions::default())
            .await
            .unwrap();
        let execution_id = response.execution_id.unwrap();

        // wait for the interpreter to actually be running
        tokio::time::sleep(Duration::from_millis(200)).await;
        let result = fx.orchestrator.force_complete(&execution_id, "alice").await;
        assert!(matches!(
            result,
            Err(OrchestratorError::PreconditionFailed(_))
        ));

        fx.orchestrator.cancel(&response.queue_id, "alice").await.unwrap();
        assert!(wait_idle(&fx).await);
        fx.shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn validation_rejects_unknown_devices_and_scenarios() {
        let fx = fixture(false).await;

        let bad_device = fx
            .orchestrator
            .submit(request(&["ghost"], &["s1"]), "alice", SubmitOptions::default())
            .await;
        assert!(matches!(
            bad_device,
            Err(OrchestratorError::InvalidRequest(_))
        ));

        let bad_scenario = fx
            .orchestrator
            .submit(request(&["A"], &["ghost"]), "alice", SubmitOptions::default())
            .await;
        assert!(matches!(
            bad_scenario,
            Err(OrchestratorError::InvalidRequest(_))
        ));

        // disconnected devices fail validation too
        fx.registry
            .poll_once(vec![DeviceInfo::new("A", "pixel"), DeviceInfo::new("B", "galaxy")]);
        let disconnected = fx
            .orchestrator
            .submit(request(&["C"], &["s1"]), "alice", SubmitOptions::default())
            .await;
        assert!(matches!(
            disconnected,
            Err(OrchestratorError::InvalidRequest(_))
        ));

        // nothing was admitted
        let status = fx.orchestrator.queue_status(None).await.unwrap();
        assert!(status.queued.is_empty() && status.running.is_empty());

        fx.shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn identical_submissions_are_independent() {
        let fx = fixture(false).await;

        fx.orchestrator
            .submit(request(&["A"], &["slow"]), "u1", SubmitOptions::default())
            .await
            .unwrap();
        let first = fx
            .orchestrator
            .submit(request(&["A"], &["s1"]), "alice", SubmitOptions::default())
            .await
            .unwrap();
        let second = fx
            .orchestrator
            .submit(request(&["A"], &["s1"]), "alice", SubmitOptions::default())
            .await
            .unwrap();

        // no deduplication
        assert_ne!(first.queue_id, second.queue_id);

        fx.orchestrator.cancel(&first.queue_id, "alice").await.unwrap();
        let status = fx.orchestrator.queue_status(None).await.unwrap();
        assert!(status.queued.iter().any(|q| q.queue_id == second.queue_id));

        assert!(wait_idle(&fx).await);
        fx.shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queue_updated_revisions_are_monotonic() {
        let fx = fixture(false).await;
        let mut sub = fx.bus.subscribe([Room::Global]).await.unwrap();

        fx.orchestrator
            .submit(request(&["A"], &["s1"]), "u1", SubmitOptions::default())
            .await
            .unwrap();
        fx.orchestrator
            .submit(request(&["B"], &["s2"]), "u2", SubmitOptions::default())
            .await
            .unwrap();
        assert!(wait_idle(&fx).await);

        let mut revisions = Vec::new();
        while let Some(event) = sub.try_recv() {
            if let EventPayload::QueueUpdated { revision, .. } = event.payload {
                revisions.push(revision);
            }
        }
        assert!(revisions.len() >= 2);
        assert!(revisions.windows(2).all(|w| w[0] < w[1]));

        fx.shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn device_statuses_project_per_viewer() {
        let fx = fixture(false).await;

        fx.orchestrator
            .submit(request(&["A"], &["crawl"]), "alice", SubmitOptions::default())
            .await
            .unwrap();
        let queued = fx
            .orchestrator
            .submit(request(&["A", "B"], &["s1"]), "bob", SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(queued.status, SubmitStatus::Queued);

        let for_alice = fx.orchestrator.device_statuses("alice").await.unwrap();
        let by_id: HashMap<&str, DeviceAvailability> = for_alice
            .iter()
            .map(|d| (d.device_id.as_str(), d.status))
            .collect();
        assert_eq!(by_id["A"], DeviceAvailability::BusyMine);
        assert_eq!(by_id["B"], DeviceAvailability::Reserved);
        assert_eq!(by_id["C"], DeviceAvailability::Available);

        let for_bob = fx.orchestrator.device_statuses("bob").await.unwrap();
        let a = for_bob.iter().find(|d| d.device_id == "A").unwrap();
        assert_eq!(a.status, DeviceAvailability::BusyOther);
        assert_eq!(a.locked_by.as_deref(), Some("alice"));

        // cleanup
        let status = fx.orchestrator.queue_status(None).await.unwrap();
        for running in &status.running {
            fx.orchestrator
                .cancel(&running.queue_id, "alice")
                .await
                .unwrap();
        }
        fx.orchestrator.cancel(&queued.queue_id, "bob").await.unwrap();
        assert!(wait_idle(&fx).await);
        fx.shutdown.cancel();
    }
}
