//! Scenario interpreter: a tree-walking VM over the compiled node graph.
//!
//! One interpreter executes one scenario against one device session.
//! Starting from `Start` it repeatedly resolves the next node via the
//! appropriate out-edge, dispatches on the node variant, and emits a
//! [`StepResult`] per node (one per retry attempt for actions).
//!
//! # Branch selection
//!
//! - `Start`/`Action`: the single unlabeled out-edge.
//! - `Condition`: evaluate against the driver, take `yes` or `no`.
//! - `Loop`: follow the `loop` back-edge while the per-node counter is
//!   below `loop_count` (or until the break condition holds), then `exit`.
//!
//! # Cancellation
//!
//! The cancellation token is checked before every node dispatch and
//! between retry attempts; in-flight driver calls are abandoned when the
//! token fires mid-call. A cancelled run ends with a `stopped` step and
//! no further nodes execute.
//!
//! # Determinism
//!
//! Given the same graph and the same driver responses, the step sequence
//! and statuses are identical; only timings differ. Percent coordinates
//! make the branch trace resolution-independent.

pub mod classify;
pub mod coords;

pub use classify::{FailureKind, classify, classify_message};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::device::Resolution;
use crate::driver::{DeviceDriver, DriverError, Roi};
use crate::report::{DeviceRunStatus, StepResult, StepStatus};
use crate::scenario::{ActionParams, ConditionParams, EdgeLabel, Node, NodeKind, ScenarioGraph};
use crate::store::TemplateRepo;

/// Interpreter tunables, derived from [`crate::config::ExecutorConfig`].
#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    /// Per-driver-call timeout unless the node overrides it.
    pub default_action_timeout: Duration,
    /// Step budget per run; exceeding it fails the scenario.
    pub max_steps: usize,
    /// Capture a best-effort screenshot on step failure.
    pub capture_failure_screenshots: bool,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            default_action_timeout: Duration::from_secs(30),
            max_steps: 10_000,
            capture_failure_screenshots: true,
        }
    }
}

/// Called with every emitted step, in order.
pub type StepCallback = Arc<dyn Fn(&StepResult) + Send + Sync>;

/// Outcome of one scenario run on one device.
#[derive(Debug)]
pub struct ScenarioRun {
    /// `Passed`, `Failed` or `Stopped` (never `Skipped`).
    pub status: DeviceRunStatus,
    pub steps: Vec<StepResult>,
    /// Node ids in visit order.
    pub branch_trace: Vec<String>,
}

enum ActionError {
    Driver(DriverError),
    /// Node misconfiguration; never retried.
    Config(String),
    Stopped,
}

enum ActionOutcome {
    Success,
    Failure,
    Stopped,
}

/// Executes one scenario graph against a device driver.
pub struct ScenarioInterpreter<'a> {
    driver: &'a dyn DeviceDriver,
    templates: &'a dyn TemplateRepo,
    config: InterpreterConfig,
    cancel: CancellationToken,
    on_step: Option<StepCallback>,
    resolution: Option<Resolution>,
}

impl<'a> ScenarioInterpreter<'a> {
    pub fn new(
        driver: &'a dyn DeviceDriver,
        templates: &'a dyn TemplateRepo,
        config: InterpreterConfig,
    ) -> Self {
        Self {
            driver,
            templates,
            config,
            cancel: CancellationToken::new(),
            on_step: None,
            resolution: None,
        }
    }

    /// Sets the cooperative cancellation token.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Sets a callback invoked for every emitted step.
    pub fn with_step_callback(mut self, callback: StepCallback) -> Self {
        self.on_step = Some(callback);
        self
    }

    /// Runs the graph to completion, cancellation, or failure.
    pub async fn run(mut self, graph: &ScenarioGraph) -> ScenarioRun {
        let mut steps: Vec<StepResult> = Vec::new();
        let mut trace: Vec<String> = Vec::new();
        let mut loop_counters: HashMap<usize, u32> = HashMap::new();
        let mut current = graph.start();
        let mut remaining = self.config.max_steps;

        let status = loop {
            let node = graph.node(current).clone();

            if self.cancel.is_cancelled() {
                self.emit(&mut steps, stopped_step(&node, 0));
                break DeviceRunStatus::Stopped;
            }
            if remaining == 0 {
                self.emit(
                    &mut steps,
                    config_failure_step(&node, "step budget exceeded, graph does not terminate"),
                );
                break DeviceRunStatus::Failed;
            }
            remaining -= 1;
            trace.push(node.id.clone());

            match &node.kind {
                NodeKind::Start => {
                    self.emit(&mut steps, marker_step(&node));
                    match graph.follow(current, None) {
                        Some(next) => current = next,
                        None => {
                            self.emit(
                                &mut steps,
                                config_failure_step(&node, "start node has no out-edge"),
                            );
                            break DeviceRunStatus::Failed;
                        }
                    }
                }

                NodeKind::End => {
                    self.emit(&mut steps, marker_step(&node));
                    break DeviceRunStatus::Passed;
                }

                NodeKind::Action {
                    params,
                    max_retries,
                    retry_interval,
                    timeout,
                } => {
                    let outcome = self
                        .run_action(&node, params, *max_retries, *retry_interval, *timeout, &mut steps)
                        .await;
                    match outcome {
                        ActionOutcome::Success => match graph.follow(current, None) {
                            Some(next) => current = next,
                            None => {
                                self.emit(
                                    &mut steps,
                                    config_failure_step(&node, "action node has no out-edge"),
                                );
                                break DeviceRunStatus::Failed;
                            }
                        },
                        ActionOutcome::Failure => break DeviceRunStatus::Failed,
                        ActionOutcome::Stopped => break DeviceRunStatus::Stopped,
                    }
                }

                NodeKind::Condition { condition } => {
                    let started = Instant::now();
                    match self.eval_condition(condition).await {
                        Ok((value, confidence)) => {
                            let mut step = marker_step(&node);
                            step.action_ms = elapsed_ms(started);
                            step.total_ms = step.action_ms;
                            step.match_confidence = confidence;
                            self.emit(&mut steps, step);

                            let label = if value { EdgeLabel::Yes } else { EdgeLabel::No };
                            match graph.follow(current, Some(label)) {
                                Some(next) => current = next,
                                None => {
                                    self.emit(
                                        &mut steps,
                                        config_failure_step(
                                            &node,
                                            "condition node is missing a branch edge",
                                        ),
                                    );
                                    break DeviceRunStatus::Failed;
                                }
                            }
                        }
                        Err(ActionError::Stopped) => {
                            self.emit(&mut steps, stopped_step(&node, 0));
                            break DeviceRunStatus::Stopped;
                        }
                        Err(ActionError::Config(message)) => {
                            self.emit(&mut steps, config_failure_step(&node, &message));
                            break DeviceRunStatus::Failed;
                        }
                        Err(ActionError::Driver(error)) => {
                            let kind = classify(&error);
                            let screenshot = self.failure_screenshot().await;
                            let mut step = failed_step(&node, 0, kind, error.to_string());
                            step.action_ms = elapsed_ms(started);
                            step.total_ms = step.action_ms;
                            step.screenshot = screenshot;
                            self.emit(&mut steps, step);
                            break DeviceRunStatus::Failed;
                        }
                    }
                }

                NodeKind::Loop {
                    loop_count,
                    break_condition,
                } => {
                    let decision = if let Some(limit) = loop_count {
                        let counter = loop_counters.entry(current).or_insert(0);
                        if *counter < *limit {
                            *counter += 1;
                            Ok(EdgeLabel::Loop)
                        } else {
                            Ok(EdgeLabel::Exit)
                        }
                    } else if let Some(condition) = break_condition {
                        match self.eval_condition(condition).await {
                            Ok((true, _)) => Ok(EdgeLabel::Exit),
                            Ok((false, _)) => Ok(EdgeLabel::Loop),
                            Err(e) => Err(e),
                        }
                    } else {
                        Err(ActionError::Config(
                            "loop node has neither a count nor a break condition".to_string(),
                        ))
                    };

                    match decision {
                        Ok(label) => {
                            self.emit(&mut steps, marker_step(&node));
                            match graph.follow(current, Some(label)) {
                                Some(next) => current = next,
                                None => {
                                    self.emit(
                                        &mut steps,
                                        config_failure_step(
                                            &node,
                                            "loop node is missing its branch edge",
                                        ),
                                    );
                                    break DeviceRunStatus::Failed;
                                }
                            }
                        }
                        Err(ActionError::Stopped) => {
                            self.emit(&mut steps, stopped_step(&node, 0));
                            break DeviceRunStatus::Stopped;
                        }
                        Err(ActionError::Config(message)) => {
                            self.emit(&mut steps, config_failure_step(&node, &message));
                            break DeviceRunStatus::Failed;
                        }
                        Err(ActionError::Driver(error)) => {
                            let kind = classify(&error);
                            self.emit(
                                &mut steps,
                                failed_step(&node, 0, kind, error.to_string()),
                            );
                            break DeviceRunStatus::Failed;
                        }
                    }
                }
            }
        };

        debug!(status = ?status, steps = steps.len(), "scenario run finished");
        ScenarioRun {
            status,
            steps,
            branch_trace: trace,
        }
    }

    fn emit(&self, steps: &mut Vec<StepResult>, step: StepResult) {
        if let Some(callback) = &self.on_step {
            callback(&step);
        }
        steps.push(step);
    }

    /// Device resolution, queried once per scenario and cached.
    async fn resolution(&mut self) -> Result<Resolution, ActionError> {
        if let Some(resolution) = self.resolution {
            return Ok(resolution);
        }
        let (width, height) = self
            .with_timeout(self.config.default_action_timeout, self.driver.window_size())
            .await?;
        let resolution = Resolution::new(width, height);
        self.resolution = Some(resolution);
        Ok(resolution)
    }

    async fn run_action(
        &mut self,
        node: &Node,
        params: &ActionParams,
        max_retries: u32,
        retry_interval: u64,
        timeout_override: Option<u64>,
        steps: &mut Vec<StepResult>,
    ) -> ActionOutcome {
        // Wait nodes sleep outside the action timeout and account the
        // sleep as wait time.
        if let ActionParams::Wait { duration } = params {
            let started = Instant::now();
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(*duration)) => {
                    let mut step = marker_step(node);
                    step.wait_ms = elapsed_ms(started);
                    step.total_ms = step.wait_ms;
                    self.emit(steps, step);
                    return ActionOutcome::Success;
                }
                _ = self.cancel.cancelled() => {
                    let mut step = stopped_step(node, 0);
                    step.wait_ms = elapsed_ms(started);
                    step.total_ms = step.wait_ms;
                    self.emit(steps, step);
                    return ActionOutcome::Stopped;
                }
            }
        }

        let timeout = timeout_override
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_action_timeout);
        let mut wait_ms = 0u64;

        for attempt in 0..=max_retries {
            if self.cancel.is_cancelled() {
                self.emit(steps, stopped_step(node, attempt));
                return ActionOutcome::Stopped;
            }

            let started = Instant::now();
            let result = self.execute_action(params, timeout).await;
            let action_ms = elapsed_ms(started);

            match result {
                Ok(confidence) => {
                    let mut step = marker_step(node);
                    step.attempt = attempt;
                    step.wait_ms = wait_ms;
                    step.action_ms = action_ms;
                    step.total_ms = wait_ms + action_ms;
                    step.match_confidence = confidence;
                    self.emit(steps, step);
                    return ActionOutcome::Success;
                }
                Err(ActionError::Stopped) => {
                    self.emit(steps, stopped_step(node, attempt));
                    return ActionOutcome::Stopped;
                }
                Err(ActionError::Config(message)) => {
                    self.emit(steps, config_failure_step(node, &message));
                    return ActionOutcome::Failure;
                }
                Err(ActionError::Driver(error)) => {
                    let kind = classify(&error);
                    let confidence = match &error {
                        DriverError::ImageNotMatched { confidence } => Some(*confidence),
                        _ => None,
                    };
                    let mut step = failed_step(node, attempt, kind, error.to_string());
                    step.wait_ms = wait_ms;
                    step.action_ms = action_ms;
                    step.total_ms = wait_ms + action_ms;
                    step.match_confidence = confidence;
                    step.screenshot = self.failure_screenshot().await;
                    self.emit(steps, step);

                    if attempt == max_retries {
                        return ActionOutcome::Failure;
                    }
                    let slept = Instant::now();
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(retry_interval)) => {
                            wait_ms = elapsed_ms(slept);
                        }
                        _ = self.cancel.cancelled() => {
                            self.emit(steps, stopped_step(node, attempt + 1));
                            return ActionOutcome::Stopped;
                        }
                    }
                }
            }
        }
        // loop always returns on the final attempt
        ActionOutcome::Failure
    }

    /// Performs one attempt of an action. Returns an optional match
    /// confidence for image steps.
    async fn execute_action(
        &mut self,
        params: &ActionParams,
        timeout: Duration,
    ) -> Result<Option<f64>, ActionError> {
        match params {
            ActionParams::Tap {
                x,
                y,
                x_percent,
                y_percent,
            } => {
                let resolution = self.resolution().await?;
                let (px, py) = coords::resolve_point((*x, *y), (*x_percent, *y_percent), resolution)
                    .ok_or_else(|| {
                        ActionError::Config("tap node has no usable coordinates".to_string())
                    })?;
                self.with_timeout(timeout, self.driver.tap(px, py)).await?;
                Ok(None)
            }

            ActionParams::LongPress {
                x,
                y,
                x_percent,
                y_percent,
                duration,
            } => {
                let resolution = self.resolution().await?;
                let (px, py) = coords::resolve_point((*x, *y), (*x_percent, *y_percent), resolution)
                    .ok_or_else(|| {
                        ActionError::Config("longPress node has no usable coordinates".to_string())
                    })?;
                self.with_timeout(timeout, self.driver.long_press(px, py, *duration))
                    .await?;
                Ok(None)
            }

            ActionParams::Swipe {
                start_x,
                start_y,
                end_x,
                end_y,
                start_x_percent,
                start_y_percent,
                end_x_percent,
                end_y_percent,
                duration,
                direction,
                distance,
                speed: _,
            } => {
                let resolution = self.resolution().await?;
                let (start, end) = coords::resolve_swipe(
                    (*start_x, *start_y),
                    (*end_x, *end_y),
                    (*start_x_percent, *start_y_percent),
                    (*end_x_percent, *end_y_percent),
                    *direction,
                    *distance,
                    resolution,
                )
                .ok_or_else(|| {
                    ActionError::Config("swipe node has no usable endpoints".to_string())
                })?;
                self.with_timeout(timeout, self.driver.swipe(start, end, *duration))
                    .await?;
                Ok(None)
            }

            ActionParams::Click { selector, strategy } => {
                self.with_timeout(timeout, self.driver.click(selector, *strategy))
                    .await?;
                Ok(None)
            }

            ActionParams::InputText {
                selector,
                strategy,
                text,
            } => {
                self.with_timeout(timeout, self.driver.input_text(selector, *strategy, text))
                    .await?;
                Ok(None)
            }

            ActionParams::PressKey { key } => {
                self.with_timeout(timeout, self.driver.press_key(key)).await?;
                Ok(None)
            }

            ActionParams::LaunchApp {
                app_package,
                app_activity,
            } => {
                self.with_timeout(
                    timeout,
                    self.driver.launch_app(app_package, app_activity.as_deref()),
                )
                .await?;
                Ok(None)
            }

            ActionParams::TerminateApp { app_package } => {
                self.with_timeout(timeout, self.driver.terminate_app(app_package))
                    .await?;
                Ok(None)
            }

            ActionParams::ClearData { app_package } => {
                self.with_timeout(timeout, self.driver.clear_data(app_package))
                    .await?;
                Ok(None)
            }

            ActionParams::ClearCache { app_package } => {
                self.with_timeout(timeout, self.driver.clear_cache(app_package))
                    .await?;
                Ok(None)
            }

            ActionParams::Wait { .. } => unreachable!("wait handled in run_action"),

            ActionParams::ImageMatch {
                template_id,
                confidence,
                roi_enabled,
                roi_x,
                roi_y,
                roi_width,
                roi_height,
            } => {
                let template = self.templates.get(template_id).await.map_err(|e| {
                    ActionError::Config(format!("unresolvable template {template_id}: {e}"))
                })?;
                let roi = build_roi(*roi_enabled, *roi_x, *roi_y, *roi_width, *roi_height)?;
                let matched = self
                    .with_timeout(timeout, self.driver.match_image(&template.bytes, roi))
                    .await?;
                if matched.confidence >= *confidence {
                    Ok(Some(matched.confidence))
                } else {
                    Err(ActionError::Driver(DriverError::ImageNotMatched {
                        confidence: matched.confidence,
                    }))
                }
            }
        }
    }

    /// Evaluates a condition to a boolean. Absence results (element or
    /// text not found, template below threshold) are `false`, not
    /// failures; only infrastructure errors fail the step.
    async fn eval_condition(
        &mut self,
        condition: &ConditionParams,
    ) -> Result<(bool, Option<f64>), ActionError> {
        let timeout = self.config.default_action_timeout;
        match condition {
            ConditionParams::ElementExists { selector, .. } => {
                let dump = self.with_timeout(timeout, self.driver.ui_dump()).await?;
                Ok((dump.contains(selector.as_str()), None))
            }

            ConditionParams::ImageMatches {
                template_id,
                confidence,
                roi_enabled,
                roi_x,
                roi_y,
                roi_width,
                roi_height,
            } => {
                let template = self.templates.get(template_id).await.map_err(|e| {
                    ActionError::Config(format!("unresolvable template {template_id}: {e}"))
                })?;
                let roi = build_roi(*roi_enabled, *roi_x, *roi_y, *roi_width, *roi_height)?;
                match self
                    .with_timeout(timeout, self.driver.match_image(&template.bytes, roi))
                    .await
                {
                    Ok(matched) => Ok((matched.confidence >= *confidence, Some(matched.confidence))),
                    Err(ActionError::Driver(DriverError::ImageNotMatched { confidence })) => {
                        Ok((false, Some(confidence)))
                    }
                    Err(e) => Err(e),
                }
            }

            ConditionParams::TextPresent {
                text,
                roi_enabled,
                roi_x,
                roi_y,
                roi_width,
                roi_height,
            } => {
                let roi = build_roi(*roi_enabled, *roi_x, *roi_y, *roi_width, *roi_height)?;
                match self.with_timeout(timeout, self.driver.ocr(roi)).await {
                    Ok(boxes) => Ok((boxes.iter().any(|b| b.text.contains(text.as_str())), None)),
                    Err(ActionError::Driver(DriverError::TextNotFound(_))) => Ok((false, None)),
                    Err(e) => Err(e),
                }
            }

            ConditionParams::AppRunning { app_package } => {
                match self
                    .with_timeout(timeout, self.driver.app_running(app_package))
                    .await
                {
                    Ok(running) => Ok((running, None)),
                    Err(ActionError::Driver(DriverError::AppNotRunning(_))) => Ok((false, None)),
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn with_timeout<T>(
        &self,
        timeout: Duration,
        call: impl Future<Output = Result<T, DriverError>>,
    ) -> Result<T, ActionError> {
        tokio::select! {
            result = tokio::time::timeout(timeout, call) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(error)) => Err(ActionError::Driver(error)),
                Err(_) => Err(ActionError::Driver(DriverError::Timeout(format!(
                    "driver call exceeded {}ms",
                    timeout.as_millis()
                )))),
            },
            _ = self.cancel.cancelled() => Err(ActionError::Stopped),
        }
    }

    async fn failure_screenshot(&self) -> Option<Vec<u8>> {
        if !self.config.capture_failure_screenshots {
            return None;
        }
        tokio::time::timeout(Duration::from_secs(5), self.driver.screenshot())
            .await
            .ok()
            .and_then(|r| r.ok())
    }
}

fn build_roi(
    enabled: bool,
    x: Option<u32>,
    y: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
) -> Result<Option<Roi>, ActionError> {
    if !enabled {
        return Ok(None);
    }
    match (x, y, width, height) {
        (Some(x), Some(y), Some(width), Some(height)) => Ok(Some(Roi {
            x,
            y,
            width,
            height,
        })),
        _ => Err(ActionError::Config(
            "roiEnabled is set but the roi rectangle is incomplete".to_string(),
        )),
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

fn base_step(node: &Node) -> StepResult {
    StepResult {
        node_id: node.id.clone(),
        label: node.label.clone(),
        node_kind: node.kind.name().to_string(),
        status: StepStatus::Passed,
        attempt: 0,
        failure: None,
        error: None,
        wait_ms: 0,
        action_ms: 0,
        total_ms: 0,
        match_confidence: None,
        screenshot: None,
    }
}

fn marker_step(node: &Node) -> StepResult {
    base_step(node)
}

fn stopped_step(node: &Node, attempt: u32) -> StepResult {
    StepResult {
        status: StepStatus::Stopped,
        attempt,
        ..base_step(node)
    }
}

fn failed_step(node: &Node, attempt: u32, kind: FailureKind, error: String) -> StepResult {
    StepResult {
        status: StepStatus::Failed,
        attempt,
        failure: Some(kind),
        error: Some(error),
        ..base_step(node)
    }
}

fn config_failure_step(node: &Node, message: &str) -> StepResult {
    StepResult {
        status: StepStatus::Failed,
        failure: Some(FailureKind::AssertionFailed),
        error: Some(message.to_string()),
        ..base_step(node)
    }
}
