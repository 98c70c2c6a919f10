//! Device bridge: shell-level access to the controlled device.

pub mod adb;
pub mod bridge;
pub mod scripted;

pub use adb::AdbBridge;
pub use bridge::{
    DUMP_PATH, DeviceBridge, DeviceError, DeviceResult, ShellOutput, escape_input_text, keycode,
    parse_screen_size,
};
pub use scripted::ScriptedDevice;
