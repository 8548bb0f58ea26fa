//! devicelab CLI - scenario tooling and a mock-backed composition.
//!
//! The orchestrator itself is transport-agnostic; hosts embed the library
//! and wire their own inbound API. This binary covers the operational
//! odds and ends: validating and migrating stored scenario files, running
//! a scenario against the scripted mock driver, and a `serve` mode that
//! assembles the full composition against mock devices.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use devicelab::bus::{EventBus, EventPayload, Room};
use devicelab::config::{Config, load_config};
use devicelab::device::{DeviceInfo, DeviceRegistry, Resolution};
use devicelab::driver::mock::MockDriver;
use devicelab::executor::{TestExecutor, TestRequest};
use devicelab::interpreter::{InterpreterConfig, ScenarioInterpreter};
use devicelab::orchestrator::{Orchestrator, SchedulerDeps, SubmitOptions};
use devicelab::report::StepStatus;
use devicelab::scenario::{Scenario, ScenarioGraph, migrate::migrate_to_percent};
use devicelab::session::{MockBackend, SessionManager};
use devicelab::store::{
    MemoryMetrics, MemoryReports, MemoryScenarios, MemoryTemplates, ReportRepo, ScenarioRepo,
};

#[derive(Parser)]
#[command(name = "devicelab")]
#[command(about = "Mobile test orchestrator tooling", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "devicelab.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a stored scenario file
    Validate {
        /// Scenario JSON file
        file: PathBuf,
    },

    /// Convert absolute coordinates in a scenario to percent form
    Migrate {
        /// Scenario JSON file
        file: PathBuf,

        /// Width of the device the scenario was authored on
        #[arg(long)]
        source_width: u32,

        /// Height of the device the scenario was authored on
        #[arg(long)]
        source_height: u32,

        /// Output path (defaults to rewriting the input file)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run a scenario against the scripted mock driver
    Run {
        /// Scenario JSON file
        file: PathBuf,

        /// Mock device width
        #[arg(long, default_value_t = 1080)]
        width: u32,

        /// Mock device height
        #[arg(long, default_value_t = 2400)]
        height: u32,
    },

    /// Assemble the full orchestrator against mock devices and run the
    /// given scenarios once on each
    Serve {
        /// Scenario JSON files
        files: Vec<PathBuf>,

        /// Number of mock devices
        #[arg(short, long, default_value_t = 2)]
        devices: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("devicelab={level}").into()),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        Config::default()
    };

    match cli.command {
        Commands::Validate { file } => validate(&file),
        Commands::Migrate {
            file,
            source_width,
            source_height,
            output,
        } => migrate(&file, source_width, source_height, output.as_deref()),
        Commands::Run {
            file,
            width,
            height,
        } => run(&config, &file, width, height).await,
        Commands::Serve { files, devices } => serve(&config, &files, devices).await,
    }
}

fn read_scenario(path: &Path) -> Result<Scenario> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read scenario file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse scenario file: {}", path.display()))
}

fn validate(file: &Path) -> Result<()> {
    let scenario = read_scenario(file)?;
    match ScenarioGraph::compile(&scenario) {
        Ok(graph) => {
            println!(
                "{}: scenario '{}' ok ({} nodes, {} edges)",
                file.display(),
                scenario.name,
                graph.node_count(),
                scenario.edges.len()
            );
            Ok(())
        }
        Err(e) => bail!("{}: {e}", file.display()),
    }
}

fn migrate(file: &Path, source_width: u32, source_height: u32, output: Option<&Path>) -> Result<()> {
    let mut scenario = read_scenario(file)?;
    let migrated = migrate_to_percent(&mut scenario, Resolution::new(source_width, source_height));
    let target = output.unwrap_or(file);
    std::fs::write(target, serde_json::to_string_pretty(&scenario)?)
        .with_context(|| format!("Failed to write {}", target.display()))?;
    println!(
        "{}: migrated {migrated} node(s) -> {}",
        file.display(),
        target.display()
    );
    Ok(())
}

async fn run(config: &Config, file: &Path, width: u32, height: u32) -> Result<()> {
    let scenario = read_scenario(file)?;
    let graph = ScenarioGraph::compile(&scenario)?;

    let device = DeviceInfo::new("mock-device", "mock").with_resolution(width, height);
    let driver = MockDriver::new(device);
    let templates = MemoryTemplates::new();
    let interpreter_config = InterpreterConfig {
        default_action_timeout: std::time::Duration::from_secs(config.executor.action_timeout_secs),
        max_steps: config.executor.max_steps,
        capture_failure_screenshots: false,
    };

    let result = ScenarioInterpreter::new(&driver, &templates, interpreter_config)
        .run(&graph)
        .await;

    println!("scenario '{}': {:?}", scenario.name, result.status);
    for step in &result.steps {
        let marker = match step.status {
            StepStatus::Passed => "ok  ",
            StepStatus::Failed => "FAIL",
            StepStatus::Skipped => "skip",
            StepStatus::Stopped => "stop",
        };
        let error = step.error.as_deref().unwrap_or("");
        println!(
            "  [{marker}] {:<20} {:<10} {:>5}ms {}",
            step.node_id, step.node_kind, step.total_ms, error
        );
    }
    if result.status != devicelab::report::DeviceRunStatus::Passed {
        std::process::exit(1);
    }
    Ok(())
}

async fn serve(config: &Config, files: &[PathBuf], device_count: usize) -> Result<()> {
    if files.is_empty() {
        bail!("serve needs at least one scenario file");
    }

    let shutdown = CancellationToken::new();
    let registry = DeviceRegistry::new();
    let devices: Vec<DeviceInfo> = (0..device_count.max(1))
        .map(|i| DeviceInfo::new(format!("mock-{i}"), "mock"))
        .collect();
    let device_ids: Vec<String> = devices.iter().map(|d| d.id.clone()).collect();
    registry.poll_once(devices);

    let bus = EventBus::spawn(config.bus.subscriber_queue_depth, shutdown.clone());
    let sessions = SessionManager::new(
        config.session.clone(),
        registry.clone(),
        Arc::new(MockBackend::new()),
        bus.clone(),
    );

    let scenario_repo = Arc::new(MemoryScenarios::new());
    let mut scenario_ids = Vec::new();
    for file in files {
        let scenario = read_scenario(file)?;
        ScenarioGraph::compile(&scenario)?;
        scenario_ids.push(scenario.id.clone());
        scenario_repo
            .put(scenario)
            .await
            .ok();
    }

    let executor = Arc::new(TestExecutor::new(
        sessions.clone(),
        scenario_repo.clone(),
        Arc::new(MemoryTemplates::new()),
        bus.clone(),
        config.executor.clone(),
    ));
    let reports = Arc::new(MemoryReports::new());
    let orchestrator = Orchestrator::spawn(
        SchedulerDeps {
            config: config.orchestrator.clone(),
            registry,
            scenarios: scenario_repo,
            executor,
            reports: reports.clone(),
            metrics: Arc::new(MemoryMetrics::new()),
            bus: bus.clone(),
        },
        shutdown.clone(),
    );

    let mut events = bus
        .subscribe([Room::Global])
        .await
        .context("event bus unavailable")?;

    let response = orchestrator
        .submit(
            TestRequest::new(device_ids, scenario_ids),
            "local",
            SubmitOptions::default().with_test_name("serve run"),
        )
        .await?;
    println!("submitted: {:?} (queue {})", response.status, response.queue_id);

    loop {
        let Some(event) = events.recv().await else {
            bail!("event bus closed before completion");
        };
        match event.payload {
            EventPayload::TestComplete {
                status,
                passed,
                failed,
                skipped,
                duration_ms,
                ..
            } => {
                println!(
                    "complete: {status} (passed {passed}, failed {failed}, skipped {skipped}) in {duration_ms}ms"
                );
                break;
            }
            EventPayload::QueueUpdated { revision, entries } => {
                tracing::debug!(revision, entries = entries.len(), "queue updated");
            }
            _ => {}
        }
    }

    // the report lands in the repo when the scheduler finalises, which
    // can trail the completion event slightly
    let mut recent = reports.list_recent(1).await?;
    for _ in 0..50 {
        if !recent.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        recent = reports.list_recent(1).await?;
    }
    let Some(report) = recent.first() else {
        bail!("report was not stored");
    };
    for scenario in &report.scenarios {
        println!("  scenario {}: {:?}", scenario.scenario_id, scenario.status);
        for device in &scenario.devices {
            println!(
                "    {}: {} ({} steps, {}ms)",
                device.device_id,
                device.status.as_str(),
                device.steps.len(),
                device.duration_ms
            );
        }
    }

    shutdown.cancel();
    Ok(())
}
