//! Scripted in-memory driver for tests and the demo composition.
//!
//! Every operation succeeds by default. Tests script failures (or
//! specific match/OCR payloads) per operation; scripted results are
//! consumed in FIFO order, after which the operation reverts to its
//! default. All calls are recorded so tests can assert on the exact
//! action sequence a scenario produced.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    DeviceDriver, DriverError, DriverResult, ImageMatch, Roi, SelectorStrategy, TextBox,
};
use crate::device::DeviceInfo;

/// A recorded driver call.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Tap { x: u32, y: u32 },
    LongPress { x: u32, y: u32, duration_ms: u64 },
    Swipe { start: (u32, u32), end: (u32, u32), duration_ms: u64 },
    InputText { selector: String, text: String },
    Click { selector: String },
    PressKey { name: String },
    LaunchApp { package: String },
    TerminateApp { package: String },
    ClearData { package: String },
    ClearCache { package: String },
    AppRunning { package: String },
    Screenshot,
    UiDump,
    MatchImage { roi: Option<Roi> },
    Ocr { region: Option<Roi> },
    WindowSize,
    DeviceInfo,
}

#[derive(Default)]
struct Scripts {
    actions: HashMap<&'static str, VecDeque<DriverResult<()>>>,
    matches: VecDeque<DriverResult<ImageMatch>>,
    ocr: VecDeque<DriverResult<Vec<TextBox>>>,
    ui_dumps: VecDeque<DriverResult<String>>,
    screenshots: VecDeque<DriverResult<Vec<u8>>>,
    device_infos: VecDeque<DriverResult<DeviceInfo>>,
    app_running: VecDeque<DriverResult<bool>>,
}

/// Deterministic scripted [`DeviceDriver`].
pub struct MockDriver {
    device: DeviceInfo,
    scripts: Mutex<Scripts>,
    calls: Mutex<Vec<MockCall>>,
    /// Artificial latency applied to every call, for timeout tests.
    delay: Mutex<Option<Duration>>,
}

impl MockDriver {
    pub fn new(device: DeviceInfo) -> Self {
        Self {
            device,
            scripts: Mutex::new(Scripts::default()),
            calls: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
        }
    }

    /// Queues a result for the named action operation (`"tap"`, `"click"`,
    /// `"swipe"`, `"input_text"`, `"press_key"`, `"launch_app"`, ...).
    pub fn script_action(&self, op: &'static str, result: DriverResult<()>) {
        self.lock_scripts()
            .actions
            .entry(op)
            .or_default()
            .push_back(result);
    }

    /// Queues `count` copies of the same failure for an operation.
    pub fn script_failures(&self, op: &'static str, error: DriverError, count: usize) {
        for _ in 0..count {
            self.script_action(op, Err(error.clone()));
        }
    }

    pub fn script_match(&self, result: DriverResult<ImageMatch>) {
        self.lock_scripts().matches.push_back(result);
    }

    pub fn script_ocr(&self, result: DriverResult<Vec<TextBox>>) {
        self.lock_scripts().ocr.push_back(result);
    }

    pub fn script_ui_dump(&self, result: DriverResult<String>) {
        self.lock_scripts().ui_dumps.push_back(result);
    }

    pub fn script_screenshot(&self, result: DriverResult<Vec<u8>>) {
        self.lock_scripts().screenshots.push_back(result);
    }

    pub fn script_device_info(&self, result: DriverResult<DeviceInfo>) {
        self.lock_scripts().device_infos.push_back(result);
    }

    pub fn script_app_running(&self, result: DriverResult<bool>) {
        self.lock_scripts().app_running.push_back(result);
    }

    /// Applies an artificial delay to every subsequent call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }

    /// Snapshot of all calls made so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn lock_scripts(&self) -> std::sync::MutexGuard<'_, Scripts> {
        self.scripts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: MockCall) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn action(&self, op: &'static str, call: MockCall) -> DriverResult<()> {
        self.record(call);
        self.pause().await;
        let scripted = self
            .lock_scripts()
            .actions
            .get_mut(op)
            .and_then(|q| q.pop_front());
        scripted.unwrap_or(Ok(()))
    }
}

#[async_trait]
impl DeviceDriver for MockDriver {
    async fn tap(&self, x: u32, y: u32) -> DriverResult<()> {
        self.action("tap", MockCall::Tap { x, y }).await
    }

    async fn long_press(&self, x: u32, y: u32, duration_ms: u64) -> DriverResult<()> {
        self.action("long_press", MockCall::LongPress { x, y, duration_ms })
            .await
    }

    async fn swipe(
        &self,
        start: (u32, u32),
        end: (u32, u32),
        duration_ms: u64,
    ) -> DriverResult<()> {
        self.action(
            "swipe",
            MockCall::Swipe {
                start,
                end,
                duration_ms,
            },
        )
        .await
    }

    async fn input_text(
        &self,
        selector: &str,
        _strategy: SelectorStrategy,
        text: &str,
    ) -> DriverResult<()> {
        self.action(
            "input_text",
            MockCall::InputText {
                selector: selector.to_string(),
                text: text.to_string(),
            },
        )
        .await
    }

    async fn click(&self, selector: &str, _strategy: SelectorStrategy) -> DriverResult<()> {
        self.action(
            "click",
            MockCall::Click {
                selector: selector.to_string(),
            },
        )
        .await
    }

    async fn press_key(&self, name: &str) -> DriverResult<()> {
        self.action(
            "press_key",
            MockCall::PressKey {
                name: name.to_string(),
            },
        )
        .await
    }

    async fn launch_app(&self, package: &str, _activity: Option<&str>) -> DriverResult<()> {
        self.action(
            "launch_app",
            MockCall::LaunchApp {
                package: package.to_string(),
            },
        )
        .await
    }

    async fn terminate_app(&self, package: &str) -> DriverResult<()> {
        self.action(
            "terminate_app",
            MockCall::TerminateApp {
                package: package.to_string(),
            },
        )
        .await
    }

    async fn clear_data(&self, package: &str) -> DriverResult<()> {
        self.action(
            "clear_data",
            MockCall::ClearData {
                package: package.to_string(),
            },
        )
        .await
    }

    async fn clear_cache(&self, package: &str) -> DriverResult<()> {
        self.action(
            "clear_cache",
            MockCall::ClearCache {
                package: package.to_string(),
            },
        )
        .await
    }

    async fn app_running(&self, package: &str) -> DriverResult<bool> {
        self.record(MockCall::AppRunning {
            package: package.to_string(),
        });
        self.pause().await;
        self.lock_scripts()
            .app_running
            .pop_front()
            .unwrap_or(Ok(true))
    }

    async fn screenshot(&self) -> DriverResult<Vec<u8>> {
        self.record(MockCall::Screenshot);
        self.pause().await;
        self.lock_scripts()
            .screenshots
            .pop_front()
            .unwrap_or_else(|| Ok(vec![0x89, 0x50, 0x4e, 0x47]))
    }

    async fn ui_dump(&self) -> DriverResult<String> {
        self.record(MockCall::UiDump);
        self.pause().await;
        self.lock_scripts()
            .ui_dumps
            .pop_front()
            .unwrap_or_else(|| Ok("<hierarchy/>".to_string()))
    }

    async fn match_image(&self, _template: &[u8], roi: Option<Roi>) -> DriverResult<ImageMatch> {
        self.record(MockCall::MatchImage { roi });
        self.pause().await;
        self.lock_scripts().matches.pop_front().unwrap_or(Ok(ImageMatch {
            confidence: 1.0,
            location: Some((0, 0)),
        }))
    }

    async fn ocr(&self, region: Option<Roi>) -> DriverResult<Vec<TextBox>> {
        self.record(MockCall::Ocr { region });
        self.pause().await;
        self.lock_scripts().ocr.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn window_size(&self) -> DriverResult<(u32, u32)> {
        self.record(MockCall::WindowSize);
        self.pause().await;
        Ok((
            self.device.resolution.width,
            self.device.resolution.height,
        ))
    }

    async fn device_info(&self) -> DriverResult<DeviceInfo> {
        self.record(MockCall::DeviceInfo);
        self.pause().await;
        self.lock_scripts()
            .device_infos
            .pop_front()
            .unwrap_or_else(|| Ok(self.device.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_succeed_and_calls_are_recorded() {
        let driver = MockDriver::new(DeviceInfo::new("d1", "pixel"));
        driver.tap(10, 20).await.unwrap();
        driver.press_key("back").await.unwrap();

        assert_eq!(
            driver.calls(),
            vec![
                MockCall::Tap { x: 10, y: 20 },
                MockCall::PressKey {
                    name: "back".to_string()
                }
            ]
        );
    }

    #[tokio::test]
    async fn scripted_results_are_consumed_in_order() {
        let driver = MockDriver::new(DeviceInfo::new("d1", "pixel"));
        driver.script_action("tap", Err(DriverError::Connection("reset".into())));
        driver.script_action("tap", Ok(()));

        assert!(driver.tap(0, 0).await.is_err());
        assert!(driver.tap(0, 0).await.is_ok());
        // queue exhausted, back to default
        assert!(driver.tap(0, 0).await.is_ok());
    }

    #[tokio::test]
    async fn window_size_reflects_device_resolution() {
        let driver = MockDriver::new(DeviceInfo::new("d1", "pixel").with_resolution(720, 1280));
        assert_eq!(driver.window_size().await.unwrap(), (720, 1280));
    }
}
