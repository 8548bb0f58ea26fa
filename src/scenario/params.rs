//! Action and condition parameter variants.
//!
//! Stored scenarios use camelCase keys; the tagged enums here replace the
//! free-form parameter bags of stored graphs with typed payloads per
//! variant. Coordinates come in two flavours: absolute pixels (deprecated)
//! and percent of the device resolution in [0, 1] (values outside that
//! range are passed through to the driver unclamped).

use serde::{Deserialize, Serialize};

use crate::driver::SelectorStrategy;

fn default_long_press_ms() -> u64 {
    800
}

fn default_swipe_ms() -> u64 {
    300
}

fn default_confidence() -> f64 {
    0.8
}

pub(crate) fn default_retry_interval() -> u64 {
    1_000
}

/// Swipe direction shorthand used instead of explicit end coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwipeDirection {
    Up,
    Down,
    Left,
    Right,
}

/// Parameters of an `Action` node, tagged by the `action` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ActionParams {
    /// Coordinate tap. Percent coordinates win when both forms are set.
    #[serde(rename_all = "camelCase")]
    Tap {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        x: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        y: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        x_percent: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        y_percent: Option<f64>,
    },

    #[serde(rename_all = "camelCase")]
    LongPress {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        x: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        y: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        x_percent: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        y_percent: Option<f64>,
        #[serde(default = "default_long_press_ms")]
        duration: u64,
    },

    #[serde(rename_all = "camelCase")]
    Swipe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_x: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_y: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_x: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_y: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_x_percent: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_y_percent: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_x_percent: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_y_percent: Option<f64>,
        #[serde(default = "default_swipe_ms")]
        duration: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        direction: Option<SwipeDirection>,
        /// Swipe length in pixels when `direction` shorthand is used.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        distance: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<u32>,
    },

    /// Click an element resolved by selector.
    #[serde(rename_all = "camelCase")]
    Click {
        selector: String,
        #[serde(default)]
        strategy: SelectorStrategy,
    },

    #[serde(rename_all = "camelCase")]
    InputText {
        selector: String,
        #[serde(default)]
        strategy: SelectorStrategy,
        text: String,
    },

    #[serde(rename_all = "camelCase")]
    PressKey { key: String },

    #[serde(rename_all = "camelCase")]
    LaunchApp {
        app_package: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_activity: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    TerminateApp { app_package: String },

    #[serde(rename_all = "camelCase")]
    ClearData { app_package: String },

    #[serde(rename_all = "camelCase")]
    ClearCache { app_package: String },

    /// Sleep for `duration` milliseconds; cancellable.
    Wait { duration: u64 },

    /// Assert a stored template is visible on screen.
    #[serde(rename_all = "camelCase")]
    ImageMatch {
        template_id: String,
        #[serde(default = "default_confidence")]
        confidence: f64,
        #[serde(default)]
        roi_enabled: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        roi_x: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        roi_y: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        roi_width: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        roi_height: Option<u32>,
    },
}

impl ActionParams {
    /// Variant name for telemetry.
    pub fn name(&self) -> &'static str {
        match self {
            ActionParams::Tap { .. } => "tap",
            ActionParams::LongPress { .. } => "longPress",
            ActionParams::Swipe { .. } => "swipe",
            ActionParams::Click { .. } => "click",
            ActionParams::InputText { .. } => "inputText",
            ActionParams::PressKey { .. } => "pressKey",
            ActionParams::LaunchApp { .. } => "launchApp",
            ActionParams::TerminateApp { .. } => "terminateApp",
            ActionParams::ClearData { .. } => "clearData",
            ActionParams::ClearCache { .. } => "clearCache",
            ActionParams::Wait { .. } => "wait",
            ActionParams::ImageMatch { .. } => "imageMatch",
        }
    }
}

/// Parameters of a `Condition` node (and of `Loop` break conditions),
/// tagged by the `condition` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "camelCase")]
pub enum ConditionParams {
    #[serde(rename_all = "camelCase")]
    ElementExists {
        selector: String,
        #[serde(default)]
        strategy: SelectorStrategy,
    },

    #[serde(rename_all = "camelCase")]
    ImageMatches {
        template_id: String,
        #[serde(default = "default_confidence")]
        confidence: f64,
        #[serde(default)]
        roi_enabled: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        roi_x: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        roi_y: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        roi_width: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        roi_height: Option<u32>,
    },

    /// True when OCR finds the text on screen (optionally ROI-bounded).
    #[serde(rename_all = "camelCase")]
    TextPresent {
        text: String,
        #[serde(default)]
        roi_enabled: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        roi_x: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        roi_y: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        roi_width: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        roi_height: Option<u32>,
    },

    /// True while the app's process is alive on the device.
    #[serde(rename_all = "camelCase")]
    AppRunning { app_package: String },
}
