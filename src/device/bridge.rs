//! Device bridge abstraction.
//!
//! Every device operation the engine needs is expressed as a shell command
//! issued through [`DeviceBridge::shell`]; the default method bodies build the
//! `input`/`am`/`pm`/`wm` command lines, so an implementation only has to run
//! commands and deliver binary screenshots.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors raised by a device bridge
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("'{command}' exited with code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("invalid output: {0}")]
    InvalidOutput(String),

    #[error("unsupported by this bridge: {0}")]
    Unsupported(&'static str),
}

/// Raw result of a shell command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ShellOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit code into `DeviceError::CommandFailed`
    pub fn check(self, command: &str) -> DeviceResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(DeviceError::CommandFailed {
                command: command.to_string(),
                code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Android key codes used by the step vocabulary
pub mod keycode {
    pub const HOME: u32 = 3;
    pub const BACK: u32 = 4;
    pub const VOLUME_UP: u32 = 24;
    pub const VOLUME_DOWN: u32 = 25;
    pub const POWER: u32 = 26;
    pub const TAB: u32 = 61;
    pub const ENTER: u32 = 66;
    pub const DEL: u32 = 67;
    pub const MENU: u32 = 82;
    pub const SEARCH: u32 = 84;
    pub const ESCAPE: u32 = 111;
}

/// Remote path of the uiautomator dump
pub const DUMP_PATH: &str = "/data/local/tmp/uidump.xml";

const FALLBACK_SCREEN_SIZE: (i32, i32) = (1080, 2400);

static OVERRIDE_SIZE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Override size:\s*(\d+)x(\d+)").expect("valid regex"));
static PHYSICAL_SIZE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Physical size:\s*(\d+)x(\d+)").expect("valid regex"));
static ANY_SIZE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)x(\d+)").expect("valid regex"));
static DENSITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:Override|Physical) density:\s*(\d+)").expect("valid regex"));

/// Trait for controlled devices.
///
/// Implementations:
/// - `AdbBridge` drives a real device or emulator through `adb`
/// - `ScriptedDevice` serves scripted UI dumps for tests
pub trait DeviceBridge: Send + Sync {
    /// Run a shell command on the device
    fn shell(&self, command: &str) -> DeviceResult<ShellOutput>;

    /// Capture the screen as PNG bytes
    fn screenshot(&self) -> DeviceResult<Vec<u8>>;

    /// Secondary hierarchy path (external CLI, JSON output)
    fn external_hierarchy(&self) -> DeviceResult<String> {
        Err(DeviceError::Unsupported("external hierarchy"))
    }

    fn tap(&self, x: i32, y: i32) -> DeviceResult<()> {
        self.run_checked(&format!("input tap {} {}", x, y))
    }

    fn swipe(&self, x1: i32, y1: i32, x2: i32, y2: i32, duration_ms: u64) -> DeviceResult<()> {
        self.run_checked(&format!(
            "input swipe {} {} {} {} {}",
            x1, y1, x2, y2, duration_ms
        ))
    }

    fn input_text(&self, text: &str) -> DeviceResult<()> {
        self.run_checked(&format!("input text {}", escape_input_text(text)))
    }

    fn keyevent(&self, codes: &[u32]) -> DeviceResult<()> {
        if codes.is_empty() {
            return Ok(());
        }
        let joined: Vec<String> = codes.iter().map(|c| c.to_string()).collect();
        self.run_checked(&format!("input keyevent {}", joined.join(" ")))
    }

    /// Dump the UI tree as uiautomator XML
    fn dump_ui_tree(&self) -> DeviceResult<String> {
        let _ = self.shell(&format!("rm -f {}", DUMP_PATH));
        let dump_cmd = format!("uiautomator dump {}", DUMP_PATH);
        self.shell(&dump_cmd)?.check(&dump_cmd)?;
        let cat_cmd = format!("cat {}", DUMP_PATH);
        Ok(self.shell(&cat_cmd)?.check(&cat_cmd)?.stdout)
    }

    /// Kill a stuck uiautomator helper so the next dump can start cleanly
    fn kill_dump_helper(&self) -> DeviceResult<()> {
        let _ = self.shell("pkill -9 uiautomator");
        let _ = self.shell("am force-stop com.github.uiautomator");
        let _ = self.shell("am force-stop com.github.uiautomator.test");
        Ok(())
    }

    fn force_stop(&self, app_id: &str) -> DeviceResult<()> {
        self.run_checked(&format!("am force-stop {}", app_id))
    }

    fn clear_data(&self, app_id: &str) -> DeviceResult<()> {
        self.run_checked(&format!("pm clear {}", app_id))
    }

    fn launch(&self, app_id: &str) -> DeviceResult<()> {
        self.run_checked(&format!(
            "monkey -p {} -c android.intent.category.LAUNCHER 1",
            app_id
        ))
    }

    fn open_link(&self, link: &str) -> DeviceResult<()> {
        self.run_checked(&format!(
            "am start -a android.intent.action.VIEW -d {}",
            link
        ))
    }

    /// Screen size in pixels, preferring an override resolution
    fn screen_size(&self) -> DeviceResult<(i32, i32)> {
        let out = self.shell("wm size")?;
        Ok(parse_screen_size(&out.stdout))
    }

    fn screen_density(&self) -> DeviceResult<Option<u32>> {
        let out = self.shell("wm density")?;
        Ok(DENSITY
            .captures(&out.stdout)
            .and_then(|c| c[1].parse().ok()))
    }

    #[doc(hidden)]
    fn run_checked(&self, command: &str) -> DeviceResult<()> {
        self.shell(command)?.check(command).map(|_| ())
    }
}

/// Parse `wm size` output: override, then physical, then any `WxH`
pub fn parse_screen_size(output: &str) -> (i32, i32) {
    [&*OVERRIDE_SIZE, &*PHYSICAL_SIZE, &*ANY_SIZE]
        .iter()
        .find_map(|re| {
            let caps = re.captures(output)?;
            Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
        })
        .unwrap_or(FALLBACK_SCREEN_SIZE)
}

/// Escape text for `input text`: spaces become `%s`, shell metacharacters are backslashed
pub fn escape_input_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        match ch {
            ' ' => escaped.push_str("%s"),
            '\\' | '\'' | '"' | '(' | ')' | '&' | '<' | '>' | ';' | '|' | '*' | '~' | '$'
            | '`' | '!' | '?' | '#' => {
                escaped.push('\\');
                escaped.push(ch);
            }
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_screen_size_prefers_override() {
        let out = "Physical size: 1080x2400\nOverride size: 720x1600\n";
        assert_eq!(parse_screen_size(out), (720, 1600));
    }

    #[test]
    fn test_parse_screen_size_physical_and_fallback() {
        assert_eq!(parse_screen_size("Physical size: 1440x3120"), (1440, 3120));
        assert_eq!(parse_screen_size("800x600"), (800, 600));
        assert_eq!(parse_screen_size("error: no devices"), (1080, 2400));
    }

    #[test]
    fn test_escape_input_text() {
        assert_eq!(escape_input_text("hello world"), "hello%sworld");
        assert_eq!(escape_input_text("a&b"), "a\\&b");
        assert_eq!(escape_input_text("it's"), "it\\'s");
        assert_eq!(escape_input_text("user@mail.com"), "user@mail.com");
    }

    #[test]
    fn test_shell_output_check() {
        let ok = ShellOutput::ok("done");
        assert!(ok.check("true").is_ok());

        let failed = ShellOutput {
            stdout: String::new(),
            stderr: "boom\n".into(),
            exit_code: 1,
        };
        match failed.check("false") {
            Err(DeviceError::CommandFailed { code, stderr, .. }) => {
                assert_eq!(code, 1);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
