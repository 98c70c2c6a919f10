//! App lifecycle, text entry, keys and plain waits.

use tracing::info;

use super::mismatch;
use crate::device::keycode;
use crate::engine::context::RunContext;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::flow::{FlowError, OpKind, Operation};

fn require_app_id<'a>(kind: OpKind, app_id: &'a Option<String>) -> EngineResult<&'a str> {
    app_id.as_deref().ok_or_else(|| {
        EngineError::Flow(FlowError::InvalidParams {
            op: kind.name().to_string(),
            message: "no appId given and none in the flow header".to_string(),
        })
    })
}

pub(super) fn launch_app(engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    let Operation::LaunchApp { app_id, clear_state } = op else {
        return Err(mismatch(OpKind::LaunchApp, op));
    };
    let app_id = require_app_id(OpKind::LaunchApp, app_id)?;
    let device = engine.device();

    device.force_stop(app_id)?;
    if *clear_state {
        device.clear_data(app_id)?;
    }
    device.launch(app_id)?;
    run.mark_interaction();
    run.cache.invalidate();
    info!(app_id, clear_state, "app launched");
    engine.pause(engine.policy().launch_settle);

    if *clear_state {
        Ok(format!("Launch {} (cleared state)", app_id))
    } else {
        Ok(format!("Launch {}", app_id))
    }
}

pub(super) fn stop_app(engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    let Operation::StopApp(app_id) = op else {
        return Err(mismatch(OpKind::StopApp, op));
    };
    let app_id = require_app_id(OpKind::StopApp, app_id)?;
    engine.device().force_stop(app_id)?;
    run.mark_interaction();
    Ok(format!("Stop {}", app_id))
}

pub(super) fn clear_state(engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    let Operation::ClearState(app_id) = op else {
        return Err(mismatch(OpKind::ClearState, op));
    };
    let app_id = require_app_id(OpKind::ClearState, app_id)?;
    engine.device().clear_data(app_id)?;
    run.mark_interaction();
    Ok(format!("Clear State {}", app_id))
}

pub(super) fn open_link(engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    let Operation::OpenLink(link) = op else {
        return Err(mismatch(OpKind::OpenLink, op));
    };
    engine.device().open_link(link)?;
    run.mark_interaction();
    Ok(format!("Open Link: {}", link))
}

pub(super) fn input_text(engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    let Operation::InputText(text) = op else {
        return Err(mismatch(OpKind::InputText, op));
    };
    engine.device().input_text(text)?;
    run.mark_interaction();
    Ok(format!("Input: {}", text))
}

pub(super) fn erase_text(engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    let Operation::EraseText(count) = op else {
        return Err(mismatch(OpKind::EraseText, op));
    };
    let codes = vec![keycode::DEL; *count as usize];
    engine.device().keyevent(&codes)?;
    run.mark_interaction();
    Ok(format!("Erase {} chars", count))
}

pub(super) fn press_key(engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    let Operation::PressKey { name, code } = op else {
        return Err(mismatch(OpKind::PressKey, op));
    };
    engine.device().keyevent(&[*code])?;
    run.mark_interaction();
    Ok(format!("Key: {}", name))
}

fn key(engine: &Engine, run: &mut RunContext, code: u32, message: &str) -> EngineResult<String> {
    engine.device().keyevent(&[code])?;
    run.mark_interaction();
    Ok(message.to_string())
}

pub(super) fn back(engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    match op {
        Operation::Back => key(engine, run, keycode::BACK, "Pressed Back"),
        _ => Err(mismatch(OpKind::Back, op)),
    }
}

pub(super) fn hide_keyboard(engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    match op {
        Operation::HideKeyboard => key(engine, run, keycode::ESCAPE, "Hide Keyboard"),
        _ => Err(mismatch(OpKind::HideKeyboard, op)),
    }
}

pub(super) fn volume_up(engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    match op {
        Operation::VolumeUp => key(engine, run, keycode::VOLUME_UP, "Volume Up"),
        _ => Err(mismatch(OpKind::VolumeUp, op)),
    }
}

pub(super) fn volume_down(engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    match op {
        Operation::VolumeDown => key(engine, run, keycode::VOLUME_DOWN, "Volume Down"),
        _ => Err(mismatch(OpKind::VolumeDown, op)),
    }
}

pub(super) fn wait(engine: &Engine, _run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    let Operation::Wait(duration) = op else {
        return Err(mismatch(OpKind::Wait, op));
    };
    engine.pause(*duration);
    Ok(format!("Wait {}ms", duration.as_millis()))
}

pub(super) fn take_screenshot(engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    let Operation::TakeScreenshot(name) = op else {
        return Err(mismatch(OpKind::TakeScreenshot, op));
    };
    let png = engine.device().screenshot()?;
    match &run.session {
        Some(session) => {
            let path = session.save_screenshot(name, &png)?;
            Ok(format!("Screenshot saved: {}", path.display()))
        }
        None => Ok(format!("Screenshot '{}' captured ({} bytes)", name, png.len())),
    }
}

pub(super) fn skipped(_engine: &Engine, _run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    let Operation::Skipped(name) = op else {
        return Err(mismatch(OpKind::Skipped, op));
    };
    info!(command = %name, "command not supported, skipping");
    Ok(format!("Skipped {}", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WaitPolicy;
    use crate::device::ScriptedDevice;
    use crate::llm::NoLlm;
    use crate::memory::{MemoryStore, RunMode};
    use crate::session::Session;
    use std::sync::Arc;

    fn setup() -> (Arc<ScriptedDevice>, Engine, RunContext) {
        let device = Arc::new(ScriptedDevice::new("<hierarchy/>"));
        let engine = Engine::new(
            device.clone(),
            Arc::new(MemoryStore::in_memory()),
            Arc::new(NoLlm),
            WaitPolicy::instant(),
        );
        (device, engine, RunContext::new("r1", "t", RunMode::Learn))
    }

    #[test]
    fn test_launch_with_clear_state() {
        let (device, engine, mut run) = setup();
        let op = Operation::LaunchApp {
            app_id: Some("com.example".into()),
            clear_state: true,
        };
        launch_app(&engine, &mut run, &op).unwrap();
        assert_eq!(
            device.commands(),
            vec![
                "am force-stop com.example",
                "pm clear com.example",
                "monkey -p com.example -c android.intent.category.LAUNCHER 1",
            ]
        );
    }

    #[test]
    fn test_launch_requires_app_id() {
        let (_, engine, mut run) = setup();
        let op = Operation::LaunchApp {
            app_id: None,
            clear_state: false,
        };
        let err = launch_app(&engine, &mut run, &op).unwrap_err();
        assert!(matches!(err, EngineError::Flow(FlowError::InvalidParams { .. })));
    }

    #[test]
    fn test_erase_and_keys() {
        let (device, engine, mut run) = setup();
        erase_text(&engine, &mut run, &Operation::EraseText(3)).unwrap();
        hide_keyboard(&engine, &mut run, &Operation::HideKeyboard).unwrap();
        assert_eq!(
            device.commands(),
            vec!["input keyevent 67 67 67", "input keyevent 111"]
        );
    }

    #[test]
    fn test_input_text_is_escaped() {
        let (device, engine, mut run) = setup();
        input_text(&engine, &mut run, &Operation::InputText("hi there".into())).unwrap();
        assert_eq!(device.commands(), vec!["input text hi%sthere"]);
    }

    #[test]
    fn test_mismatched_operation() {
        let (_, engine, mut run) = setup();
        assert!(back(&engine, &mut run, &Operation::HideKeyboard).is_err());
    }

    #[test]
    fn test_take_screenshot_into_session() {
        let (_, engine, run) = setup();
        let tmp = tempfile::tempdir().unwrap();
        let mut run = run.with_session(Session::in_dir(tmp.path().join("run")));
        let message = take_screenshot(&engine, &mut run, &Operation::TakeScreenshot("home".into())).unwrap();
        assert!(message.contains("home.png"));
    }
}
