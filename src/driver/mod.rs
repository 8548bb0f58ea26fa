//! Device automation capability.
//!
//! [`DeviceDriver`] is the narrow surface through which scenarios touch a
//! device: UI actions, screenshots, UI-tree dumps, template matching, and
//! OCR. The orchestrator consumes this capability; real backends
//! (uiautomator bridges, WebDriver endpoints) live outside this crate.
//! Every call returns a typed [`DriverError`] that the interpreter
//! classifies into a failure category.

pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::device::DeviceInfo;

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors surfaced by a device automation backend.
///
/// Variants mirror the observable failure modes of mobile automation;
/// anything a backend cannot express lands in [`Other`](Self::Other) and
/// is classified by message pattern instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("Driver call timed out: {0}")]
    Timeout(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Image not matched (confidence {confidence:.2})")]
    ImageNotMatched { confidence: f64 },

    #[error("Text not found: {0}")]
    TextNotFound(String),

    #[error("App crashed: {0}")]
    AppCrash(String),

    #[error("App not running: {0}")]
    AppNotRunning(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Driver refused: {0}")]
    Refused(String),

    #[error("Driver error: {0}")]
    Other(String),
}

/// How an element selector is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectorStrategy {
    #[default]
    Id,
    Xpath,
    AccessibilityId,
    Text,
}

/// Region of interest bounding an image or OCR search, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Outcome of a template match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ImageMatch {
    /// Best match confidence in [0, 1].
    pub confidence: f64,
    /// Centre of the best match, when one was located.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<(u32, u32)>,
}

/// One recognized text region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBox {
    pub text: String,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub confidence: f64,
}

/// Automation primitives for one device session.
///
/// Calls may block for seconds; callers run them on per-device worker
/// tasks under a per-call timeout and propagate cancellation.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    async fn tap(&self, x: u32, y: u32) -> DriverResult<()>;

    async fn long_press(&self, x: u32, y: u32, duration_ms: u64) -> DriverResult<()>;

    async fn swipe(
        &self,
        start: (u32, u32),
        end: (u32, u32),
        duration_ms: u64,
    ) -> DriverResult<()>;

    async fn input_text(
        &self,
        selector: &str,
        strategy: SelectorStrategy,
        text: &str,
    ) -> DriverResult<()>;

    async fn click(&self, selector: &str, strategy: SelectorStrategy) -> DriverResult<()>;

    async fn press_key(&self, name: &str) -> DriverResult<()>;

    async fn launch_app(&self, package: &str, activity: Option<&str>) -> DriverResult<()>;

    async fn terminate_app(&self, package: &str) -> DriverResult<()>;

    async fn clear_data(&self, package: &str) -> DriverResult<()>;

    async fn clear_cache(&self, package: &str) -> DriverResult<()>;

    /// Whether the app's process is currently alive on the device.
    async fn app_running(&self, package: &str) -> DriverResult<bool>;

    async fn screenshot(&self) -> DriverResult<Vec<u8>>;

    async fn ui_dump(&self) -> DriverResult<String>;

    /// Matches a template against the screen, bounded to `roi` when given.
    /// Returns the best confidence found; the caller compares it to its
    /// threshold.
    async fn match_image(&self, template: &[u8], roi: Option<Roi>) -> DriverResult<ImageMatch>;

    async fn ocr(&self, region: Option<Roi>) -> DriverResult<Vec<TextBox>>;

    async fn window_size(&self) -> DriverResult<(u32, u32)>;

    async fn device_info(&self) -> DriverResult<DeviceInfo>;
}
