//! Built-in step handlers, one function per operation kind.

mod app;
mod assert;
mod gesture;
mod tap;

use tracing::debug;

use super::Engine;
use super::registry::HandlerRegistry;
use crate::error::{EngineError, EngineResult};
use crate::flow::{FlowError, OpKind, Operation};
use crate::healer::is_crash_text;

pub use tap::{PERMISSION_ALLOW_IDS, PERMISSION_ALLOW_TEXTS};

pub(crate) fn register_defaults(registry: &mut HandlerRegistry) {
    registry.register(OpKind::LaunchApp, app::launch_app);
    registry.register(OpKind::StopApp, app::stop_app);
    registry.register(OpKind::ClearState, app::clear_state);
    registry.register(OpKind::OpenLink, app::open_link);
    registry.register(OpKind::InputText, app::input_text);
    registry.register(OpKind::EraseText, app::erase_text);
    registry.register(OpKind::PressKey, app::press_key);
    registry.register(OpKind::Back, app::back);
    registry.register(OpKind::HideKeyboard, app::hide_keyboard);
    registry.register(OpKind::VolumeUp, app::volume_up);
    registry.register(OpKind::VolumeDown, app::volume_down);
    registry.register(OpKind::Wait, app::wait);
    registry.register(OpKind::TakeScreenshot, app::take_screenshot);
    registry.register(OpKind::Skipped, app::skipped);

    registry.register(OpKind::TapOn, tap::tap_on);
    registry.register(OpKind::DoubleTapOn, tap::double_tap_on);
    registry.register(OpKind::LongPressOn, tap::long_press_on);

    registry.register(OpKind::AssertVisible, assert::assert_visible);
    registry.register(OpKind::AssertNotVisible, assert::assert_not_visible);
    registry.register(OpKind::ExtendedWaitUntil, assert::extended_wait_until);
    registry.register(OpKind::ScrollUntilVisible, assert::scroll_until_visible);
    registry.register(OpKind::WaitForAnimationToEnd, assert::wait_for_animation_to_end);

    registry.register(OpKind::Scroll, gesture::scroll);
    registry.register(OpKind::Swipe, gesture::swipe);
}

/// Error for an operation routed to the wrong handler
fn mismatch(expected: OpKind, op: &Operation) -> EngineError {
    EngineError::Flow(FlowError::InvalidParams {
        op: expected.name().to_string(),
        message: format!("handler received a {} step", op.kind()),
    })
}

/// Errors that end a handler without retry or fallback: non-retryable
/// errors and device output that reports an app crash.
fn is_terminal(e: &EngineError) -> bool {
    !e.is_retryable() || is_crash_text(&e.to_string())
}

/// Run `f` up to `attempts` times with `backoff` between failures.
/// Terminal errors are returned immediately.
fn retry<T>(
    engine: &Engine,
    attempts: u32,
    backoff: std::time::Duration,
    label: &str,
    mut f: impl FnMut() -> EngineResult<T>,
) -> EngineResult<T> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match f() {
            Ok(value) => {
                if attempt > 1 {
                    debug!(label, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt < attempts && !is_terminal(&e) => {
                debug!(label, attempt, attempts, error = %e, "attempt failed, retrying");
                engine.pause(backoff);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
