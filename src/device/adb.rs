//! `adb`-backed device bridge.
//!
//! Every invocation runs as a child process; output is collected on a reader
//! thread and the child is killed once the configured deadline passes.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use super::bridge::{DeviceBridge, DeviceError, DeviceResult, ShellOutput};
use crate::config::{self, DeviceSettings};

const PNG_SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const SCREENSHOT_TMP: &str = "/sdcard/ratt_screen.png";

/// Device bridge talking to a real device or emulator through `adb`
#[derive(Debug, Clone)]
pub struct AdbBridge {
    settings: DeviceSettings,
}

impl Default for AdbBridge {
    fn default() -> Self {
        Self::new(config::get().device.clone())
    }
}

impl AdbBridge {
    pub fn new(settings: DeviceSettings) -> Self {
        Self { settings }
    }

    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.settings.serial = Some(serial.into());
        self
    }

    fn adb_command(&self) -> Command {
        let mut cmd = Command::new(&self.settings.adb_path);
        if let Some(serial) = &self.settings.serial {
            cmd.args(["-s", serial]);
        }
        cmd
    }

    /// Run `adb <args>` and return raw stdout bytes
    fn run_adb(&self, args: &[&str], timeout: Duration) -> DeviceResult<RawOutput> {
        let mut cmd = self.adb_command();
        cmd.args(args);
        let label = format!("adb {}", args.join(" "));
        run_with_timeout(cmd, &label, timeout)
    }

    /// Devices reported by `adb devices` in the `device` state
    pub fn list_devices(&self) -> DeviceResult<Vec<String>> {
        let mut cmd = Command::new(&self.settings.adb_path);
        cmd.arg("devices");
        let out = run_with_timeout(cmd, "adb devices", self.settings.command_timeout)?;
        Ok(parse_device_list(&String::from_utf8_lossy(&out.stdout)))
    }
}

/// Serials in the `device` state from `adb devices` output
fn parse_device_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(serial), Some("device")) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

impl DeviceBridge for AdbBridge {
    fn shell(&self, command: &str) -> DeviceResult<ShellOutput> {
        debug!(command, "adb shell");
        let out = self.run_adb(&["shell", command], self.settings.command_timeout)?;
        Ok(out.into_shell_output())
    }

    fn screenshot(&self) -> DeviceResult<Vec<u8>> {
        let timeout = self.settings.command_timeout;
        let direct = self.run_adb(&["exec-out", "screencap", "-p"], timeout)?;
        if direct.stdout.starts_with(PNG_SIGNATURE) {
            return Ok(direct.stdout);
        }

        warn!("exec-out screencap returned non-PNG data, using file fallback");
        self.shell(&format!("screencap -p {}", SCREENSHOT_TMP))?
            .check("screencap")?;
        let pulled = self.run_adb(&["exec-out", "cat", SCREENSHOT_TMP], timeout)?;
        let _ = self.shell(&format!("rm -f {}", SCREENSHOT_TMP));
        if pulled.stdout.starts_with(PNG_SIGNATURE) {
            Ok(pulled.stdout)
        } else {
            Err(DeviceError::InvalidOutput(
                "screenshot is not a PNG image".to_string(),
            ))
        }
    }

    fn external_hierarchy(&self) -> DeviceResult<String> {
        let mut cmd = Command::new(&self.settings.maestro_path);
        if let Some(serial) = &self.settings.serial {
            cmd.args(["--device", serial]);
        }
        cmd.arg("hierarchy").env("MAESTRO_OUTPUT_NO_COLOR", "true");
        let out = run_with_timeout(cmd, "maestro hierarchy", self.settings.maestro_timeout)?;
        let stdout = String::from_utf8_lossy(&out.stdout);

        match (stdout.find('{'), stdout.rfind('}')) {
            (Some(start), Some(end)) if end > start => Ok(stdout[start..=end].to_string()),
            _ => Err(DeviceError::InvalidOutput(format!(
                "no JSON object in maestro output (exit {})",
                out.exit_code
            ))),
        }
    }
}

// ============================================================================
// Process helpers
// ============================================================================

struct RawOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: i32,
}

impl RawOutput {
    fn into_shell_output(self) -> ShellOutput {
        ShellOutput {
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            exit_code: self.exit_code,
        }
    }
}

/// Run a command, killing it when `timeout` elapses
fn run_with_timeout(mut cmd: Command, label: &str, timeout: Duration) -> DeviceResult<RawOutput> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| DeviceError::Spawn {
            command: label.to_string(),
            source,
        })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let err_reader = thread::spawn(move || {
            let mut err = Vec::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_end(&mut err);
            }
            err
        });
        let mut out = Vec::new();
        if let Some(mut pipe) = stdout {
            let _ = pipe.read_to_end(&mut out);
        }
        let err = err_reader.join().unwrap_or_default();
        let _ = tx.send((out, err));
    });

    match rx.recv_timeout(timeout) {
        Ok((stdout, stderr)) => {
            let status = wait_child(&mut child, label)?;
            Ok(RawOutput {
                stdout,
                stderr,
                exit_code: status,
            })
        }
        Err(_) => {
            warn!(command = label, ?timeout, "command timed out, killing");
            let _ = child.kill();
            let _ = child.wait();
            Err(DeviceError::Timeout {
                command: label.to_string(),
                after: timeout,
            })
        }
    }
}

fn wait_child(child: &mut Child, label: &str) -> DeviceResult<i32> {
    let status = child.wait().map_err(|source| DeviceError::Spawn {
        command: label.to_string(),
        source,
    })?;
    Ok(status.code().unwrap_or(-1))
}
