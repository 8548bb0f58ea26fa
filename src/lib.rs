//! # devicelab
//!
//! A multi-user test orchestrator for mobile device farms: many users
//! concurrently submit test requests, each targeting a set of devices and
//! a sequence of scenario graphs. The orchestrator queues requests,
//! locks devices so each has at most one tenant, runs scenarios on the
//! selected devices in parallel, streams progress over a typed event
//! bus, and produces a consolidated report per execution.
//!
//! ## Architecture
//!
//! ```text
//!  submit ──► Orchestrator ── locks devices ──► TestExecutor
//!                │ queue, fairness,                │ one worker per device
//!                │ cancel, force-complete          ▼
//!                │                        ScenarioInterpreter
//!                │                                 │ graph VM
//!                ▼                                 ▼
//!            EventBus ◄── progress/steps ─── DeviceDriver (capability)
//! ```
//!
//! The crate is organised around a few seams:
//!
//! ### Orchestrator ([`orchestrator`])
//!
//! A single scheduler task owns the queue, the device-lock table, and the
//! running set; commands arrive on an inbound channel. Admission locks
//! all requested devices atomically, queued items carry their blocking
//! causes, and a work-conserving head-of-line scan admits any item whose
//! device set is free.
//!
//! ### Execution ([`executor`], [`interpreter`])
//!
//! The executor fans out one worker per locked device; each worker runs
//! `(scenario × repeat)` sequentially through the interpreter, a
//! tree-walking VM over typed scenario nodes with conditions, loops,
//! retries, percent-coordinate remapping, and cooperative cancellation.
//!
//! ### Devices and sessions ([`device`], [`session`], [`driver`])
//!
//! The registry polls a [`DeviceTransport`] and tracks attributes and
//! presence. The session manager keeps at most one driver session per
//! device, health-checks them, and retires them on disconnect or idle.
//! All device automation flows through the [`DeviceDriver`] capability;
//! a scripted mock ships in [`driver::mock`].
//!
//! ### Ports ([`store`], [`bus`])
//!
//! Persistence is consumed through narrow repository traits with
//! in-memory implementations for tests and demos. All outward telemetry
//! flows through the room-scoped [`EventBus`].
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use devicelab::bus::EventBus;
//! use devicelab::config::Config;
//! use devicelab::device::{DeviceInfo, DeviceRegistry};
//! use devicelab::executor::{TestExecutor, TestRequest};
//! use devicelab::orchestrator::{Orchestrator, SchedulerDeps, SubmitOptions};
//! use devicelab::session::{MockBackend, SessionManager};
//! use devicelab::store::{MemoryMetrics, MemoryReports, MemoryScenarios, MemoryTemplates};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let shutdown = CancellationToken::new();
//!
//!     let registry = DeviceRegistry::new();
//!     registry.poll_once(vec![DeviceInfo::new("emulator-5554", "pixel")]);
//!
//!     let bus = EventBus::spawn(config.bus.subscriber_queue_depth, shutdown.clone());
//!     let sessions = SessionManager::new(
//!         config.session.clone(),
//!         registry.clone(),
//!         Arc::new(MockBackend::new()),
//!         bus.clone(),
//!     );
//!     let scenarios = Arc::new(MemoryScenarios::new());
//!     let executor = Arc::new(TestExecutor::new(
//!         sessions.clone(),
//!         scenarios.clone(),
//!         Arc::new(MemoryTemplates::new()),
//!         bus.clone(),
//!         config.executor.clone(),
//!     ));
//!     let orchestrator = Orchestrator::spawn(
//!         SchedulerDeps {
//!             config: config.orchestrator.clone(),
//!             registry,
//!             scenarios,
//!             executor,
//!             reports: Arc::new(MemoryReports::new()),
//!             metrics: Arc::new(MemoryMetrics::new()),
//!             bus,
//!         },
//!         shutdown.clone(),
//!     );
//!
//!     let response = orchestrator
//!         .submit(
//!             TestRequest::new(["emulator-5554"], ["login"]),
//!             "alice",
//!             SubmitOptions::default(),
//!         )
//!         .await?;
//!     println!("admitted: {:?}", response.status);
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod device;
pub mod driver;
pub mod executor;
pub mod interpreter;
pub mod orchestrator;
pub mod report;
pub mod scenario;
pub mod schedule;
pub mod session;
pub mod store;

// Re-export commonly used types for convenience.

pub use bus::{EventBus, EventPayload, Room};
pub use config::{Config, load_config};
pub use device::{DeviceInfo, DeviceRegistry, DeviceTransport};
pub use driver::{DeviceDriver, DriverError};
pub use executor::{TestExecutor, TestRequest};
pub use interpreter::{FailureKind, ScenarioInterpreter};
pub use orchestrator::{Orchestrator, SubmitOptions, SubmitResponse};
pub use report::TestReport;
pub use scenario::{Scenario, ScenarioGraph};
pub use schedule::ScheduleManager;
pub use session::SessionManager;
