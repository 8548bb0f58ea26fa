//! The test orchestrator: multi-user queue, device-locking scheduler,
//! and execution lifecycle.
//!
//! A single scheduler task owns the queue, the device-lock table, and the
//! running set; every mutation arrives as a [`Command`] on its inbound
//! channel, so "at most one tenant per device" is a property of the data
//! the task owns rather than a synchronisation obligation. The
//! [`Orchestrator`] handle is a thin, cloneable command sender.
//!
//! # Scheduling rules
//!
//! - The queue is a stable priority queue keyed by
//!   `(-priority, submitted_at)`: higher priority first, FIFO within a
//!   priority.
//! - On every wake-up the scheduler scans from the head and admits every
//!   item whose full device set is free (work-conserving: a later or
//!   lower-priority item may overtake a blocked head only with a disjoint
//!   device set).
//! - Admission locks all requested devices atomically; locks release when
//!   the execution finalises.

pub mod scheduler;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::device::DeviceId;
use crate::executor::TestRequest;

pub use scheduler::SchedulerDeps;

/// Result type for orchestrator commands.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors surfaced to command callers.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Validation failed; nothing was admitted or queued.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller is not the requester of the target item.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// The scheduler task is gone.
    #[error("Orchestrator unavailable")]
    Unavailable,
}

/// Whether a queued item came from a direct submission or a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Test,
    Suite,
}

/// Lifecycle state of a queued test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Queued,
    WaitingDevices,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Queued => "queued",
            QueueState::WaitingDevices => "waiting_devices",
            QueueState::Running => "running",
            QueueState::Completed => "completed",
            QueueState::Cancelled => "cancelled",
            QueueState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueState::Completed | QueueState::Cancelled | QueueState::Failed
        )
    }
}

/// One device blocking a queued item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedDevice {
    pub device_id: DeviceId,
    pub used_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    pub estimated_remaining_secs: u64,
}

/// Why a queued item is waiting, and for roughly how long.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingInfo {
    pub blocked_by_devices: Vec<BlockedDevice>,
    /// 1-based position in the priority queue.
    pub queue_position: usize,
    /// Coarse hint: max estimated remaining across blockers.
    pub estimated_wait_secs: u64,
}

/// One submitted request, queued or running.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTest {
    pub queue_id: String,
    pub request: TestRequest,
    pub requester: String,
    pub priority: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    pub kind: QueueKind,
    pub submitted_at: DateTime<Utc>,
    pub state: QueueState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_info: Option<WaitingInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    /// For the queued half of a split request: the immediate half's
    /// queue id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split_from: Option<String>,
}

/// Options accompanying a submission.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    /// 0 (lowest) to 2 (highest).
    pub priority: u8,
    pub test_name: Option<String>,
    pub kind: QueueKind,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            priority: 1,
            test_name: None,
            kind: QueueKind::Test,
        }
    }
}

impl SubmitOptions {
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_test_name(mut self, name: impl Into<String>) -> Self {
        self.test_name = Some(name.into());
        self
    }

    pub fn suite(mut self) -> Self {
        self.kind = QueueKind::Suite;
        self
    }
}

/// How a submission was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitStatus {
    Started,
    Queued,
    Partial,
}

/// Detail of a split admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitInfo {
    pub immediate_queue_id: String,
    pub immediate_execution_id: String,
    pub immediate_devices: Vec<DeviceId>,
    pub queued_queue_id: String,
    pub queued_devices: Vec<DeviceId>,
    pub queued_position: usize,
}

/// Reply to `submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub status: SubmitStatus,
    pub queue_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split_execution: Option<SplitInfo>,
}

/// Reply to `cancel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub ok: bool,
    pub message: String,
}

/// One running execution in queue-status views.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningSummary {
    pub queue_id: String,
    pub execution_id: String,
    pub requester: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    pub device_ids: Vec<DeviceId>,
    pub started_at: DateTime<Utc>,
}

/// One recently-completed execution, retained in the completed ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedSummary {
    pub queue_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub requester: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    pub state: QueueState,
    pub success: bool,
    pub success_count: usize,
    pub total_count: usize,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_id: Option<String>,
}

/// Snapshot of the queue for clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusResponse {
    pub revision: u64,
    pub queued: Vec<QueuedTest>,
    pub running: Vec<RunningSummary>,
    pub recent: Vec<CompletedSummary>,
}

/// Per-device availability projected for one viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAvailability {
    Available,
    BusyMine,
    BusyOther,
    /// Unlocked, but claimed by a queued request.
    Reserved,
}

/// One row of the device status projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatusEntry {
    pub device_id: DeviceId,
    pub status: DeviceAvailability,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

pub(crate) enum Command {
    Submit {
        request: TestRequest,
        requester: String,
        options: SubmitOptions,
        reply: oneshot::Sender<OrchestratorResult<SubmitResponse>>,
    },
    Cancel {
        queue_id: String,
        caller: String,
        reply: oneshot::Sender<OrchestratorResult<CancelResponse>>,
    },
    ForceComplete {
        execution_id: String,
        caller: String,
        reply: oneshot::Sender<OrchestratorResult<()>>,
    },
    QueueStatus {
        viewer: Option<String>,
        reply: oneshot::Sender<QueueStatusResponse>,
    },
    DeviceStatuses {
        user: String,
        reply: oneshot::Sender<Vec<DeviceStatusEntry>>,
    },
    ExecutionFinished {
        queue_id: String,
        execution_id: String,
        report: Box<crate::report::TestReport>,
    },
}

/// Cloneable handle to the scheduler task.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) tx: mpsc::UnboundedSender<Command>,
}

impl Orchestrator {
    /// Submits a request. Replies with how it was admitted.
    pub async fn submit(
        &self,
        request: TestRequest,
        requester: impl Into<String>,
        options: SubmitOptions,
    ) -> OrchestratorResult<SubmitResponse> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Submit {
                request,
                requester: requester.into(),
                options,
                reply,
            })
            .map_err(|_| OrchestratorError::Unavailable)?;
        rx.await.map_err(|_| OrchestratorError::Unavailable)?
    }

    /// Cancels a queued or running test. Only the requester may cancel;
    /// callers are identified by user name, which survives reconnects.
    pub async fn cancel(
        &self,
        queue_id: impl Into<String>,
        caller: impl Into<String>,
    ) -> OrchestratorResult<CancelResponse> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Cancel {
                queue_id: queue_id.into(),
                caller: caller.into(),
                reply,
            })
            .map_err(|_| OrchestratorError::Unavailable)?;
        rx.await.map_err(|_| OrchestratorError::Unavailable)?
    }

    /// Finalises an execution whose remaining devices are all still
    /// waiting (none running); they are recorded as skipped.
    pub async fn force_complete(
        &self,
        execution_id: impl Into<String>,
        caller: impl Into<String>,
    ) -> OrchestratorResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::ForceComplete {
                execution_id: execution_id.into(),
                caller: caller.into(),
                reply,
            })
            .map_err(|_| OrchestratorError::Unavailable)?;
        rx.await.map_err(|_| OrchestratorError::Unavailable)?
    }

    /// Queue snapshot. When `viewer` is given the response is also
    /// published to their user room as `queue.status.response`.
    pub async fn queue_status(
        &self,
        viewer: Option<String>,
    ) -> OrchestratorResult<QueueStatusResponse> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::QueueStatus { viewer, reply })
            .map_err(|_| OrchestratorError::Unavailable)?;
        rx.await.map_err(|_| OrchestratorError::Unavailable)
    }

    /// Per-device availability as seen by `user`.
    pub async fn device_statuses(
        &self,
        user: impl Into<String>,
    ) -> OrchestratorResult<Vec<DeviceStatusEntry>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::DeviceStatuses {
                user: user.into(),
                reply,
            })
            .map_err(|_| OrchestratorError::Unavailable)?;
        rx.await.map_err(|_| OrchestratorError::Unavailable)
    }
}
