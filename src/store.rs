//! Repository ports and their in-memory implementations.
//!
//! The orchestrator consumes narrow CRUD interfaces and makes no
//! assumptions about the backing store. The in-memory implementations
//! here back tests and the demo composition; production hosts plug in
//! their own (document store, SQL, object storage).

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::report::TestReport;
use crate::scenario::Scenario;
use crate::schedule::Schedule;

/// Result type for repository operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from a backing store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Other(String),
}

/// A named bundle of scenarios.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioPackage {
    pub id: String,
    pub name: String,
    pub scenario_ids: Vec<String>,
}

/// A scenario category tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
}

/// A stored image template for match steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageTemplate {
    pub id: String,
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Scenario graph storage.
#[async_trait]
pub trait ScenarioRepo: Send + Sync {
    async fn get(&self, id: &str) -> StoreResult<Scenario>;
    async fn list(&self) -> StoreResult<Vec<Scenario>>;
    async fn put(&self, scenario: Scenario) -> StoreResult<()>;
    async fn delete(&self, id: &str) -> StoreResult<()>;

    async fn exists(&self, id: &str) -> bool {
        self.get(id).await.is_ok()
    }
}

/// Scenario package storage.
#[async_trait]
pub trait PackageRepo: Send + Sync {
    async fn get(&self, id: &str) -> StoreResult<ScenarioPackage>;
    async fn list(&self) -> StoreResult<Vec<ScenarioPackage>>;
    async fn put(&self, package: ScenarioPackage) -> StoreResult<()>;
    async fn delete(&self, id: &str) -> StoreResult<()>;
}

/// Category storage.
#[async_trait]
pub trait CategoryRepo: Send + Sync {
    async fn list(&self) -> StoreResult<Vec<Category>>;
    async fn put(&self, category: Category) -> StoreResult<()>;
    async fn delete(&self, id: &str) -> StoreResult<()>;
}

/// Image template storage.
#[async_trait]
pub trait TemplateRepo: Send + Sync {
    async fn get(&self, id: &str) -> StoreResult<ImageTemplate>;
    async fn put(&self, template: ImageTemplate) -> StoreResult<()>;
    async fn delete(&self, id: &str) -> StoreResult<()>;
}

/// Finished report storage.
#[async_trait]
pub trait ReportRepo: Send + Sync {
    /// Stores a report and returns its id.
    async fn put(&self, report: TestReport) -> StoreResult<String>;
    async fn get(&self, report_id: &str) -> StoreResult<TestReport>;
    async fn list_recent(&self, limit: usize) -> StoreResult<Vec<TestReport>>;
}

/// Saved schedule storage (`schedules.json`-shaped).
#[async_trait]
pub trait ScheduleRepo: Send + Sync {
    async fn load_all(&self) -> StoreResult<Vec<Schedule>>;
    async fn save_all(&self, schedules: &[Schedule]) -> StoreResult<()>;
}

/// Execution counters sink (consumed; hosts wire their metrics system).
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record_execution(&self, report: &TestReport);
}

/// In-memory scenario storage.
#[derive(Default)]
pub struct MemoryScenarios {
    scenarios: RwLock<HashMap<String, Scenario>>,
}

impl MemoryScenarios {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with(scenarios: impl IntoIterator<Item = Scenario>) -> Self {
        let repo = Self::new();
        for scenario in scenarios {
            repo.put(scenario).await.ok();
        }
        repo
    }
}

#[async_trait]
impl ScenarioRepo for MemoryScenarios {
    async fn get(&self, id: &str) -> StoreResult<Scenario> {
        self.scenarios
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self) -> StoreResult<Vec<Scenario>> {
        let mut scenarios: Vec<_> = self.scenarios.read().await.values().cloned().collect();
        scenarios.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(scenarios)
    }

    async fn put(&self, scenario: Scenario) -> StoreResult<()> {
        self.scenarios
            .write()
            .await
            .insert(scenario.id.clone(), scenario);
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        self.scenarios
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// In-memory package storage.
#[derive(Default)]
pub struct MemoryPackages {
    packages: RwLock<HashMap<String, ScenarioPackage>>,
}

#[async_trait]
impl PackageRepo for MemoryPackages {
    async fn get(&self, id: &str) -> StoreResult<ScenarioPackage> {
        self.packages
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self) -> StoreResult<Vec<ScenarioPackage>> {
        Ok(self.packages.read().await.values().cloned().collect())
    }

    async fn put(&self, package: ScenarioPackage) -> StoreResult<()> {
        self.packages
            .write()
            .await
            .insert(package.id.clone(), package);
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        self.packages
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// In-memory category storage.
#[derive(Default)]
pub struct MemoryCategories {
    categories: RwLock<HashMap<String, Category>>,
}

#[async_trait]
impl CategoryRepo for MemoryCategories {
    async fn list(&self) -> StoreResult<Vec<Category>> {
        Ok(self.categories.read().await.values().cloned().collect())
    }

    async fn put(&self, category: Category) -> StoreResult<()> {
        self.categories
            .write()
            .await
            .insert(category.id.clone(), category);
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        self.categories
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// In-memory template storage.
#[derive(Default)]
pub struct MemoryTemplates {
    templates: RwLock<HashMap<String, ImageTemplate>>,
}

impl MemoryTemplates {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TemplateRepo for MemoryTemplates {
    async fn get(&self, id: &str) -> StoreResult<ImageTemplate> {
        self.templates
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn put(&self, template: ImageTemplate) -> StoreResult<()> {
        self.templates
            .write()
            .await
            .insert(template.id.clone(), template);
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        self.templates
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// In-memory report storage.
#[derive(Default)]
pub struct MemoryReports {
    reports: RwLock<Vec<TestReport>>,
}

impl MemoryReports {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReportRepo for MemoryReports {
    async fn put(&self, report: TestReport) -> StoreResult<String> {
        let id = report.report_id.clone();
        self.reports.write().await.push(report);
        Ok(id)
    }

    async fn get(&self, report_id: &str) -> StoreResult<TestReport> {
        self.reports
            .read()
            .await
            .iter()
            .find(|r| r.report_id == report_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(report_id.to_string()))
    }

    async fn list_recent(&self, limit: usize) -> StoreResult<Vec<TestReport>> {
        let reports = self.reports.read().await;
        Ok(reports.iter().rev().take(limit).cloned().collect())
    }
}

/// File-backed schedule storage: one JSON document holding every saved
/// schedule, rewritten atomically on save.
pub struct JsonScheduleRepo {
    path: PathBuf,
}

impl JsonScheduleRepo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ScheduleRepo for JsonScheduleRepo {
    async fn load_all(&self) -> StoreResult<Vec<Schedule>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_all(&self, schedules: &[Schedule]) -> StoreResult<()> {
        let content = serde_json::to_string_pretty(schedules)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// In-memory metrics recorder.
#[derive(Default)]
pub struct MemoryMetrics {
    executions: RwLock<Vec<(String, String)>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded `(execution_id, status)` pairs.
    pub async fn recorded(&self) -> Vec<(String, String)> {
        self.executions.read().await.clone()
    }
}

#[async_trait]
impl MetricsSink for MemoryMetrics {
    async fn record_execution(&self, report: &TestReport) {
        self.executions.write().await.push((
            report.execution_id.clone(),
            report.status.as_str().to_string(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scenario_repo_crud() {
        let repo = MemoryScenarios::new();
        repo.put(Scenario::new("s1", "First")).await.unwrap();

        assert!(repo.exists("s1").await);
        assert!(!repo.exists("s2").await);
        assert_eq!(repo.get("s1").await.unwrap().name, "First");
        assert!(matches!(
            repo.get("missing").await,
            Err(StoreError::NotFound(_))
        ));

        repo.delete("s1").await.unwrap();
        assert!(!repo.exists("s1").await);
    }

    #[tokio::test]
    async fn package_and_category_crud() {
        let packages = MemoryPackages::default();
        packages
            .put(ScenarioPackage {
                id: "p1".into(),
                name: "Smoke".into(),
                scenario_ids: vec!["s1".into(), "s2".into()],
            })
            .await
            .unwrap();
        assert_eq!(packages.get("p1").await.unwrap().scenario_ids.len(), 2);

        let categories = MemoryCategories::default();
        categories
            .put(Category {
                id: "c1".into(),
                name: "Login".into(),
            })
            .await
            .unwrap();
        assert_eq!(categories.list().await.unwrap().len(), 1);
        categories.delete("c1").await.unwrap();
        assert!(categories.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn report_repo_lists_most_recent_first() {
        use crate::report::{ReportStats, ReportStatus};
        use chrono::Utc;

        let repo = MemoryReports::new();
        for i in 0..3 {
            let now = Utc::now();
            repo.put(TestReport {
                report_id: format!("r{i}"),
                execution_id: format!("e{i}"),
                queue_id: format!("q{i}"),
                requester: "u".into(),
                test_name: None,
                status: ReportStatus::Completed,
                started_at: now,
                finished_at: now,
                duration_ms: 0,
                scenarios: Vec::new(),
                stats: ReportStats::default(),
            })
            .await
            .unwrap();
        }

        let recent = repo.list_recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].report_id, "r2");
        assert_eq!(recent[1].report_id, "r1");
    }
}
