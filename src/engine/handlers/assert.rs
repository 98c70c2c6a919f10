//! Visibility assertions and waits on screen state.

use std::time::Instant;

use tracing::{debug, info};

use super::gesture;
use super::{mismatch, retry};
use crate::engine::context::RunContext;
use crate::engine::wait::wait_for_element;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::flow::{Locator, OpKind, Operation};
use crate::hierarchy::AcquireOptions;
use crate::resolver;

pub(super) fn assert_visible(engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    let Operation::AssertVisible(locator) = op else {
        return Err(mismatch(OpKind::AssertVisible, op));
    };
    let policy = engine.policy();
    let label = format!("assertVisible {}", locator);
    retry(engine, policy.assert_attempts, policy.assert_backoff, &label, || {
        wait_for_element(engine, run, locator, policy.default_timeout)
    })?;
    Ok(format!("Assert Visible: '{}'", locator))
}

pub(super) fn assert_not_visible(engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    let Operation::AssertNotVisible(locator) = op else {
        return Err(mismatch(OpKind::AssertNotVisible, op));
    };
    if is_present(engine, run, locator, AcquireOptions::default())? {
        engine.capture_artifact(run, "failure_visible");
        return Err(EngineError::AssertionViolation(format!(
            "Element should NOT be visible: {}",
            locator
        )));
    }
    Ok(format!("Assert Not Visible: '{}'", locator))
}

pub(super) fn extended_wait_until(engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    let Operation::ExtendedWaitUntil {
        visible,
        not_visible,
        timeout,
    } = op
    else {
        return Err(mismatch(OpKind::ExtendedWaitUntil, op));
    };

    if let Some(locator) = visible {
        wait_for_element(engine, run, locator, *timeout)?;
        return Ok(format!("Extended Wait: '{}' visible", locator));
    }

    if let Some(locator) = not_visible {
        let started = Instant::now();
        loop {
            if !is_present(engine, run, locator, AcquireOptions::fresh())? {
                return Ok(format!("Extended Wait: '{}' not visible", locator));
            }
            if started.elapsed() >= *timeout {
                engine.capture_artifact(run, "failure_visible");
                return Err(EngineError::AssertionViolation(format!(
                    "Element still visible after {:.1}s: {}",
                    timeout.as_secs_f64(),
                    locator
                )));
            }
            engine.pause(engine.policy().poll_interval);
        }
    }

    engine.pause(*timeout);
    Ok(format!("Extended Wait: {}ms", timeout.as_millis()))
}

pub(super) fn scroll_until_visible(engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    let Operation::ScrollUntilVisible { locator, direction } = op else {
        return Err(mismatch(OpKind::ScrollUntilVisible, op));
    };
    let policy = engine.policy();
    let started = Instant::now();

    for scrolls in 0..=policy.max_scrolls {
        if is_present(engine, run, locator, AcquireOptions::fresh())? {
            info!(%locator, scrolls, "element scrolled into view");
            return Ok(format!("Scroll Until Visible: '{}' after {} scrolls", locator, scrolls));
        }
        if scrolls == policy.max_scrolls {
            break;
        }
        gesture::scroll_screen(engine, *direction)?;
        run.mark_interaction();
        engine.pause(policy.scroll_settle);
    }

    Err(EngineError::NotFound {
        query: locator.query.clone(),
        index: locator.index,
        waited: started.elapsed(),
        analysis: format!(
            "not found after scrolling {} {} times",
            direction, policy.max_scrolls
        ),
    })
}

pub(super) fn wait_for_animation_to_end(
    engine: &Engine,
    run: &mut RunContext,
    op: &Operation,
) -> EngineResult<String> {
    if !matches!(op, Operation::WaitForAnimationToEnd) {
        return Err(mismatch(OpKind::WaitForAnimationToEnd, op));
    }
    let policy = engine.policy();
    let started = Instant::now();
    let mut previous: Option<String> = None;

    while started.elapsed() < policy.animation_cap {
        let hash = match engine.acquire(run, AcquireOptions::fresh()) {
            Ok(snapshot) => snapshot.screen_hash,
            Err(e) if e.is_retryable() => {
                debug!(error = %e, "hierarchy unavailable while waiting for animation");
                engine.pause(policy.poll_interval);
                continue;
            }
            Err(e) => return Err(e),
        };
        if previous.as_deref() == Some(hash.as_str()) {
            return Ok(format!("Animation settled after {}ms", started.elapsed().as_millis()));
        }
        previous = Some(hash);
        engine.pause(policy.poll_interval);
    }
    Ok(format!(
        "Animation wait capped at {}ms",
        policy.animation_cap.as_millis()
    ))
}

/// Whether `locator` currently resolves to a node with visible area
fn is_present(engine: &Engine, run: &mut RunContext, locator: &Locator, opts: AcquireOptions) -> EngineResult<bool> {
    let snapshot = engine.acquire(run, opts)?;
    let present = resolver::resolve_str(&snapshot.tree, &locator.query, locator.index)
        .is_some_and(|n| n.has_area());
    Ok(present)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WaitPolicy;
    use crate::device::ScriptedDevice;
    use crate::flow::Direction;
    use crate::llm::NoLlm;
    use crate::memory::{MemoryStore, RunMode};
    use std::sync::Arc;
    use std::time::Duration;

    const HOME: &str = r#"<hierarchy>
<node text="Welcome" class="android.widget.TextView" bounds="[0,100][1080,200]"/>
<node text="Spinner" class="android.widget.ProgressBar" bounds="[0,0][0,0]"/>
</hierarchy>"#;

    fn setup(xml: &str) -> (Arc<ScriptedDevice>, Engine, RunContext) {
        let device = Arc::new(ScriptedDevice::new(xml));
        let engine = Engine::new(
            device.clone(),
            Arc::new(MemoryStore::in_memory()),
            Arc::new(NoLlm),
            WaitPolicy::instant(),
        );
        (device, engine, RunContext::new("r1", "t", RunMode::Learn))
    }

    #[test]
    fn test_assert_visible() {
        let (_, engine, mut run) = setup(HOME);
        let op = Operation::AssertVisible(Locator::new("Welcome"));
        assert!(assert_visible(&engine, &mut run, &op).is_ok());

        let missing = Operation::AssertVisible(Locator::new("Goodbye"));
        let err = assert_visible(&engine, &mut run, &missing).unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[test]
    fn test_assert_not_visible_ignores_zero_area() {
        let (_, engine, mut run) = setup(HOME);
        let hidden = Operation::AssertNotVisible(Locator::new("Spinner"));
        assert!(assert_not_visible(&engine, &mut run, &hidden).is_ok());

        let shown = Operation::AssertNotVisible(Locator::new("Welcome"));
        let err = assert_not_visible(&engine, &mut run, &shown).unwrap_err();
        assert!(matches!(err, EngineError::AssertionViolation(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_extended_wait_not_visible_times_out() {
        let (_, engine, mut run) = setup(HOME);
        let op = Operation::ExtendedWaitUntil {
            visible: None,
            not_visible: Some(Locator::new("Welcome")),
            timeout: Duration::from_millis(20),
        };
        let err = extended_wait_until(&engine, &mut run, &op).unwrap_err();
        assert!(err.to_string().contains("still visible"));
    }

    #[test]
    fn test_scroll_until_visible_gives_up() {
        let (device, engine, mut run) = setup(HOME);
        let op = Operation::ScrollUntilVisible {
            locator: Locator::new("Footer"),
            direction: Direction::Down,
        };
        let err = scroll_until_visible(&engine, &mut run, &op).unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
        let swipes = device
            .commands()
            .iter()
            .filter(|c| c.starts_with("input swipe"))
            .count();
        assert_eq!(swipes, engine.policy().max_scrolls as usize);
    }

    #[test]
    fn test_animation_settles_on_stable_screen() {
        let (_, engine, mut run) = setup(HOME);
        let message = wait_for_animation_to_end(&engine, &mut run, &Operation::WaitForAnimationToEnd).unwrap();
        assert!(message.starts_with("Animation settled"));
    }
}
