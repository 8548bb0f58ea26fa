//! Cron-triggered suite submission.
//!
//! Saved schedules pair a cron expression with a canonical test request.
//! A ticker task sweeps for due schedules and submits each as a
//! `Suite`-typed queued test; `run_now` is the same call path without the
//! clock. `next_run_at` is computed deterministically from the cron
//! expression in the host's local time zone, and each schedule keeps a
//! bounded history ring of past fires.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ScheduleConfig;
use crate::executor::TestRequest;
use crate::orchestrator::{Orchestrator, SubmitOptions, SubmitResponse};
use crate::store::{ScheduleRepo, StoreError};

/// Result type for schedule operations.
pub type ScheduleResult<T> = Result<T, ScheduleError>;

/// Errors from schedule management.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {detail}")]
    InvalidCron { expression: String, detail: String },

    #[error("Schedule not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Submit failed: {0}")]
    Submit(#[from] crate::orchestrator::OrchestratorError),
}

/// One past fire of a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRun {
    pub fired_at: DateTime<Utc>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A saved schedule (`schedules.json` entry).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    pub name: String,
    /// Cron expression with seconds field: `sec min hour dom month dow`.
    pub cron: String,
    pub request: TestRequest,
    pub requester: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: VecDeque<ScheduleRun>,
}

fn default_enabled() -> bool {
    true
}

fn default_priority() -> u8 {
    1
}

/// Next fire time strictly after `after`, in the host time zone.
pub fn next_fire(expression: &str, after: DateTime<Utc>) -> ScheduleResult<DateTime<Utc>> {
    let cron = cron::Schedule::from_str(expression).map_err(|e| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        detail: e.to_string(),
    })?;
    cron.after(&after.with_timezone(&Local))
        .next()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| ScheduleError::InvalidCron {
            expression: expression.to_string(),
            detail: "expression never fires".to_string(),
        })
}

/// Holds saved schedules and submits them when due.
pub struct ScheduleManager {
    config: ScheduleConfig,
    orchestrator: Orchestrator,
    repo: Arc<dyn ScheduleRepo>,
    schedules: Mutex<HashMap<String, Schedule>>,
}

impl ScheduleManager {
    /// Loads saved schedules from the repo; enabled schedules missing a
    /// `next_run_at` get one computed from now.
    pub async fn load(
        config: ScheduleConfig,
        orchestrator: Orchestrator,
        repo: Arc<dyn ScheduleRepo>,
    ) -> ScheduleResult<Arc<Self>> {
        let mut schedules = HashMap::new();
        for mut schedule in repo.load_all().await? {
            if schedule.enabled && schedule.next_run_at.is_none() {
                schedule.next_run_at = next_fire(&schedule.cron, Utc::now()).ok();
            }
            schedules.insert(schedule.id.clone(), schedule);
        }
        Ok(Arc::new(Self {
            config,
            orchestrator,
            repo,
            schedules: Mutex::new(schedules),
        }))
    }

    /// Creates and persists a schedule. Fails on an invalid cron
    /// expression.
    pub async fn create(
        &self,
        name: impl Into<String>,
        cron: impl Into<String>,
        request: TestRequest,
        requester: impl Into<String>,
        priority: u8,
    ) -> ScheduleResult<Schedule> {
        let cron = cron.into();
        let next_run_at = Some(next_fire(&cron, Utc::now())?);
        let schedule = Schedule {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            cron,
            request,
            requester: requester.into(),
            enabled: true,
            priority,
            last_run_at: None,
            next_run_at,
            history: VecDeque::new(),
        };
        let mut schedules = self.schedules.lock().await;
        schedules.insert(schedule.id.clone(), schedule.clone());
        self.persist(&schedules).await?;
        info!(schedule = schedule.name.as_str(), "schedule created");
        Ok(schedule)
    }

    pub async fn remove(&self, id: &str) -> ScheduleResult<()> {
        let mut schedules = self.schedules.lock().await;
        schedules
            .remove(id)
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))?;
        self.persist(&schedules).await
    }

    /// Enables or disables a schedule; enabling recomputes the next fire.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> ScheduleResult<()> {
        let mut schedules = self.schedules.lock().await;
        let schedule = schedules
            .get_mut(id)
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))?;
        schedule.enabled = enabled;
        schedule.next_run_at = if enabled {
            Some(next_fire(&schedule.cron, Utc::now())?)
        } else {
            None
        };
        self.persist(&schedules).await
    }

    pub async fn list(&self) -> Vec<Schedule> {
        let mut schedules: Vec<_> = self.schedules.lock().await.values().cloned().collect();
        schedules.sort_by(|a, b| a.name.cmp(&b.name));
        schedules
    }

    pub async fn get(&self, id: &str) -> Option<Schedule> {
        self.schedules.lock().await.get(id).cloned()
    }

    /// Submits a schedule immediately, equivalent to a cron fire.
    pub async fn run_now(&self, id: &str) -> ScheduleResult<SubmitResponse> {
        let schedule = self
            .get(id)
            .await
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))?;
        let response = self.fire(&schedule).await;
        let mut schedules = self.schedules.lock().await;
        if let Some(stored) = schedules.get_mut(id) {
            record_fire(stored, &response, self.config.history_ring);
            stored.last_run_at = Some(Utc::now());
        }
        self.persist(&schedules).await?;
        response.map_err(Into::into)
    }

    /// Fires every due schedule. Returns how many fired.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<Schedule> = {
            let schedules = self.schedules.lock().await;
            schedules
                .values()
                .filter(|s| s.enabled && s.next_run_at.map(|t| t <= now).unwrap_or(false))
                .cloned()
                .collect()
        };

        let mut fired = 0;
        for schedule in due {
            let response = self.fire(&schedule).await;
            if let Err(e) = &response {
                warn!(
                    schedule = schedule.name.as_str(),
                    "scheduled submit failed: {e}"
                );
            }
            let mut schedules = self.schedules.lock().await;
            if let Some(stored) = schedules.get_mut(&schedule.id) {
                record_fire(stored, &response, self.config.history_ring);
                stored.last_run_at = Some(now);
                stored.next_run_at = next_fire(&stored.cron, now).ok();
            }
            fired += 1;
        }

        if fired > 0 {
            let schedules = self.schedules.lock().await;
            if let Err(e) = self.persist(&schedules).await {
                warn!("failed to persist schedules: {e}");
            }
        }
        fired
    }

    async fn fire(
        &self,
        schedule: &Schedule,
    ) -> Result<SubmitResponse, crate::orchestrator::OrchestratorError> {
        self.orchestrator
            .submit(
                schedule.request.clone(),
                schedule.requester.clone(),
                SubmitOptions::default()
                    .with_priority(schedule.priority)
                    .with_test_name(schedule.name.clone())
                    .suite(),
            )
            .await
    }

    async fn persist(&self, schedules: &HashMap<String, Schedule>) -> ScheduleResult<()> {
        let mut all: Vec<Schedule> = schedules.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        self.repo.save_all(&all).await?;
        Ok(())
    }

    /// Spawns the due-schedule ticker.
    pub fn spawn_ticker(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(manager.config.tick_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => return,
                }
                manager.fire_due(Utc::now()).await;
            }
        })
    }
}

fn record_fire(
    schedule: &mut Schedule,
    response: &Result<SubmitResponse, crate::orchestrator::OrchestratorError>,
    ring: usize,
) {
    let run = match response {
        Ok(response) => ScheduleRun {
            fired_at: Utc::now(),
            ok: true,
            queue_id: Some(response.queue_id.clone()),
            detail: None,
        },
        Err(e) => ScheduleRun {
            fired_at: Utc::now(),
            ok: false,
            queue_id: None,
            detail: Some(e.to_string()),
        },
    };
    schedule.history.push_back(run);
    while schedule.history.len() > ring {
        schedule.history.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::{ExecutorConfig, OrchestratorConfig, SessionConfig};
    use crate::device::{DeviceInfo, DeviceRegistry};
    use crate::executor::TestExecutor;
    use crate::orchestrator::SchedulerDeps;
    use crate::scenario::{Node, NodeKind, Scenario};
    use crate::session::{MockBackend, SessionManager};
    use crate::store::{
        JsonScheduleRepo, MemoryMetrics, MemoryReports, MemoryScenarios, MemoryTemplates,
    };

    fn quick_scenario(id: &str) -> Scenario {
        Scenario::new(id, id)
            .with_node(Node::new("start", NodeKind::Start))
            .with_node(Node::new("end", NodeKind::End))
            .with_edge("start", "end", None)
    }

    async fn orchestrator_fixture(shutdown: CancellationToken) -> Orchestrator {
        let registry = DeviceRegistry::new();
        registry.poll_once(vec![DeviceInfo::new("A", "pixel")]);
        let bus = EventBus::spawn(256, shutdown.clone());
        let sessions = SessionManager::new(
            SessionConfig::default(),
            registry.clone(),
            Arc::new(MockBackend::new()),
            bus.clone(),
        );
        let scenarios = Arc::new(MemoryScenarios::with(vec![quick_scenario("s1")]).await);
        let executor = Arc::new(TestExecutor::new(
            sessions,
            scenarios.clone(),
            Arc::new(MemoryTemplates::new()),
            bus.clone(),
            ExecutorConfig::default(),
        ));
        Orchestrator::spawn(
            SchedulerDeps {
                config: OrchestratorConfig::default(),
                registry,
                scenarios,
                executor,
                reports: Arc::new(MemoryReports::new()),
                metrics: Arc::new(MemoryMetrics::new()),
                bus,
            },
            shutdown,
        )
    }

    #[test]
    fn next_fire_advances_monotonically() {
        let now = Utc::now();
        let first = next_fire("0 */5 * * * *", now).unwrap();
        let second = next_fire("0 */5 * * * *", first).unwrap();

        assert!(first > now);
        assert!(second > first);
        assert!(first - now <= chrono::Duration::minutes(5));
        assert_eq!(second - first, chrono::Duration::minutes(5));
    }

    #[test]
    fn invalid_cron_is_rejected() {
        assert!(matches!(
            next_fire("not a cron", Utc::now()),
            Err(ScheduleError::InvalidCron { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedules.json");
        let shutdown = CancellationToken::new();
        let orchestrator = orchestrator_fixture(shutdown.clone()).await;

        let repo = Arc::new(JsonScheduleRepo::new(&path));
        let manager = ScheduleManager::load(
            ScheduleConfig::default(),
            orchestrator.clone(),
            repo.clone(),
        )
        .await
        .unwrap();

        let schedule = manager
            .create(
                "nightly smoke",
                "0 0 3 * * *",
                TestRequest::new(["A"], ["s1"]),
                "alice",
                1,
            )
            .await
            .unwrap();
        assert!(schedule.next_run_at.is_some());

        // a fresh manager sees the persisted schedule
        let reloaded = ScheduleManager::load(
            ScheduleConfig::default(),
            orchestrator,
            repo,
        )
        .await
        .unwrap();
        let listed = reloaded.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "nightly smoke");

        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_cron_fails_create() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = CancellationToken::new();
        let orchestrator = orchestrator_fixture(shutdown.clone()).await;
        let manager = ScheduleManager::load(
            ScheduleConfig::default(),
            orchestrator,
            Arc::new(JsonScheduleRepo::new(dir.path().join("schedules.json"))),
        )
        .await
        .unwrap();

        let result = manager
            .create(
                "broken",
                "whenever",
                TestRequest::new(["A"], ["s1"]),
                "alice",
                1,
            )
            .await;
        assert!(matches!(result, Err(ScheduleError::InvalidCron { .. })));
        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_now_submits_as_suite_and_records_history() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = CancellationToken::new();
        let orchestrator = orchestrator_fixture(shutdown.clone()).await;
        let manager = ScheduleManager::load(
            ScheduleConfig::default(),
            orchestrator.clone(),
            Arc::new(JsonScheduleRepo::new(dir.path().join("schedules.json"))),
        )
        .await
        .unwrap();

        let schedule = manager
            .create(
                "smoke",
                "0 0 3 * * *",
                TestRequest::new(["A"], ["s1"]),
                "alice",
                2,
            )
            .await
            .unwrap();

        let response = manager.run_now(&schedule.id).await.unwrap();
        assert!(!response.queue_id.is_empty());

        let stored = manager.get(&schedule.id).await.unwrap();
        assert_eq!(stored.history.len(), 1);
        assert!(stored.history[0].ok);
        assert!(stored.last_run_at.is_some());

        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fire_due_fires_once_and_advances() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = CancellationToken::new();
        let orchestrator = orchestrator_fixture(shutdown.clone()).await;
        let manager = ScheduleManager::load(
            ScheduleConfig::default(),
            orchestrator,
            Arc::new(JsonScheduleRepo::new(dir.path().join("schedules.json"))),
        )
        .await
        .unwrap();

        let schedule = manager
            .create(
                "due",
                "0 */5 * * * *",
                TestRequest::new(["A"], ["s1"]),
                "alice",
                1,
            )
            .await
            .unwrap();
        let due_at = schedule.next_run_at.unwrap();

        // not yet due
        assert_eq!(manager.fire_due(due_at - chrono::Duration::seconds(1)).await, 0);

        // due: fires and advances next_run_at past the fire time
        assert_eq!(manager.fire_due(due_at).await, 1);
        let stored = manager.get(&schedule.id).await.unwrap();
        assert_eq!(stored.history.len(), 1);
        assert!(stored.next_run_at.unwrap() > due_at);

        // the same instant does not fire twice
        assert_eq!(manager.fire_due(due_at).await, 0);

        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn history_ring_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = CancellationToken::new();
        let orchestrator = orchestrator_fixture(shutdown.clone()).await;
        let manager = ScheduleManager::load(
            ScheduleConfig {
                history_ring: 3,
                ..Default::default()
            },
            orchestrator,
            Arc::new(JsonScheduleRepo::new(dir.path().join("schedules.json"))),
        )
        .await
        .unwrap();

        let schedule = manager
            .create(
                "busy",
                "0 0 3 * * *",
                TestRequest::new(["A"], ["s1"]),
                "alice",
                1,
            )
            .await
            .unwrap();

        for _ in 0..5 {
            let _ = manager.run_now(&schedule.id).await;
        }
        let stored = manager.get(&schedule.id).await.unwrap();
        assert_eq!(stored.history.len(), 3);

        shutdown.cancel();
    }
}
