//! Scripted in-memory device for tests and dry runs.
//!
//! Serves a current uiautomator dump, switches to the next queued screen on
//! every tap, records each shell command and can be told to fail dumps or
//! specific commands.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Mutex, MutexGuard};

use image::{ImageBuffer, Rgb, RgbImage};

use super::bridge::{DUMP_PATH, DeviceBridge, DeviceError, DeviceResult, ShellOutput};

/// A device whose screens are scripted XML dumps
#[derive(Debug)]
pub struct ScriptedDevice {
    state: Mutex<ScriptState>,
}

#[derive(Debug, Default)]
struct ScriptState {
    current: String,
    /// Screens shown after each subsequent tap
    transitions: VecDeque<String>,
    /// Remaining dumps that fail
    failing_dumps: u32,
    external_json: Option<String>,
    /// Command prefixes that fail, with the stderr they report
    failing_commands: Vec<(String, String)>,
    commands: Vec<String>,
    dumps: u32,
    size: (u32, u32),
}

impl ScriptedDevice {
    /// Create a device showing the given uiautomator XML
    pub fn new(xml: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(ScriptState {
                current: xml.into(),
                size: (1080, 2400),
                ..Default::default()
            }),
        }
    }

    /// Set the reported screen size (also the screenshot size)
    pub fn with_size(self, width: u32, height: u32) -> Self {
        self.lock().size = (width, height);
        self
    }

    /// Replace the current screen
    pub fn set_screen(&self, xml: impl Into<String>) {
        self.lock().current = xml.into();
    }

    /// Queue a screen that becomes current after the next tap
    pub fn push_transition(&self, xml: impl Into<String>) {
        self.lock().transitions.push_back(xml.into());
    }

    /// Make the next `n` uiautomator dumps fail
    pub fn fail_next_dumps(&self, n: u32) {
        self.lock().failing_dumps = n;
    }

    /// Serve this JSON from the secondary hierarchy path
    pub fn set_external_hierarchy(&self, json: impl Into<String>) {
        self.lock().external_json = Some(json.into());
    }

    /// Fail every command starting with `prefix`, reporting `stderr`
    pub fn fail_command(&self, prefix: impl Into<String>, stderr: impl Into<String>) {
        self.lock()
            .failing_commands
            .push((prefix.into(), stderr.into()));
    }

    /// Every shell command received so far
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Coordinates of every `input tap`
    pub fn taps(&self) -> Vec<(i32, i32)> {
        self.lock()
            .commands
            .iter()
            .filter_map(|c| {
                let mut parts = c.strip_prefix("input tap ")?.split_whitespace();
                Some((parts.next()?.parse().ok()?, parts.next()?.parse().ok()?))
            })
            .collect()
    }

    /// Number of uiautomator dumps attempted
    pub fn dump_count(&self) -> u32 {
        self.lock().dumps
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DeviceBridge for ScriptedDevice {
    fn shell(&self, command: &str) -> DeviceResult<ShellOutput> {
        let mut state = self.lock();
        state.commands.push(command.to_string());

        if let Some((_, stderr)) = state
            .failing_commands
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
        {
            return Ok(ShellOutput {
                stdout: String::new(),
                stderr: stderr.clone(),
                exit_code: 1,
            });
        }

        if command.starts_with("uiautomator dump") {
            state.dumps += 1;
            if state.failing_dumps > 0 {
                state.failing_dumps -= 1;
                return Ok(ShellOutput {
                    stdout: String::new(),
                    stderr: "ERROR: could not get idle state.".to_string(),
                    exit_code: 1,
                });
            }
            return Ok(ShellOutput::ok(format!(
                "UI hierchary dumped to: {}",
                DUMP_PATH
            )));
        }

        if command == format!("cat {}", DUMP_PATH) {
            return Ok(ShellOutput::ok(state.current.clone()));
        }

        if command.starts_with("input tap") {
            if let Some(next) = state.transitions.pop_front() {
                state.current = next;
            }
            return Ok(ShellOutput::ok(""));
        }

        match command {
            "wm size" => Ok(ShellOutput::ok(format!(
                "Physical size: {}x{}",
                state.size.0, state.size.1
            ))),
            "wm density" => Ok(ShellOutput::ok("Physical density: 420")),
            _ => Ok(ShellOutput::ok("")),
        }
    }

    fn screenshot(&self) -> DeviceResult<Vec<u8>> {
        let (width, height) = self.lock().size;
        let img: RgbImage = ImageBuffer::from_pixel(width, height, Rgb([24, 24, 32]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .map_err(|e| DeviceError::InvalidOutput(format!("failed to encode PNG: {}", e)))?;
        Ok(bytes)
    }

    fn external_hierarchy(&self) -> DeviceResult<String> {
        self.lock()
            .external_json
            .clone()
            .ok_or(DeviceError::Unsupported("external hierarchy"))
    }
}
