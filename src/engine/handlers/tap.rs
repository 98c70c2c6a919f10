//! Tap, double tap and long press.
//!
//! Element taps go through the two-phase wait inside a bounded retry. When
//! that is exhausted the handler falls through, in order, to skipping an
//! optional tap, the permission-dialog buttons and AI vision.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::{is_terminal, mismatch, retry};
use crate::engine::context::RunContext;
use crate::engine::wait::{Resolved, wait_for_element};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::flow::{Locator, OpKind, Operation, PointSpec, TapParams, Target};
use crate::healing::locate_on_screen;
use crate::hierarchy::AcquireOptions;
use crate::resolver;

/// Allow buttons of the platform permission dialogs, most specific first
pub const PERMISSION_ALLOW_IDS: [&str; 5] = [
    "com.android.permissioncontroller:id/permission_allow_button",
    "com.android.permissioncontroller:id/permission_allow_foreground_only_button",
    "com.android.packageinstaller:id/permission_allow_button",
    "com.android.permissioncontroller:id/permission_allow_one_time_button",
    "android:id/button1",
];

/// Allow button labels across platform versions
pub const PERMISSION_ALLOW_TEXTS: [&str; 3] = ["Allow", "While using the app", "Only this time"];

const DOUBLE_TAP_GAP: Duration = Duration::from_millis(100);
const LONG_PRESS_MS: u64 = 1000;

pub(super) fn tap_on(engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    let Operation::TapOn(TapParams { target, optional }) = op else {
        return Err(mismatch(OpKind::TapOn, op));
    };
    let locator = match target {
        Target::Point(point) => {
            let (x, y) = point_pixels(engine, *point)?;
            engine.device().tap(x, y)?;
            run.mark_interaction();
            return Ok(format!("Tap Point: {}", point));
        }
        Target::Element(locator) => locator,
    };

    let policy = engine.policy();
    let requested = if *optional {
        policy.short_timeout
    } else {
        policy.default_timeout
    };
    let label = format!("tap {}", locator);
    let attempt = retry(engine, policy.tap_attempts, policy.tap_backoff, &label, || {
        let found = wait_for_element(engine, run, locator, requested)?;
        ensure_enabled(&found, locator)?;
        let (x, y) = found.center();
        engine.device().tap(x, y)?;
        run.mark_interaction();
        Ok(format!("Tap '{}' at ({}, {})", locator, x, y))
    });

    let err = match attempt {
        Ok(message) => return Ok(message),
        Err(e) if is_terminal(&e) => return Err(e),
        Err(e) => e,
    };

    if *optional {
        info!(%locator, "optional element not found, skipping");
        return Ok(format!("Skip optional tap: '{}'", locator));
    }

    if locator.query.to_lowercase().contains("allow") {
        if let Some(message) = tap_permission_button(engine, run)? {
            return Ok(message);
        }
    }

    if let Some(message) = tap_via_vision(engine, run, &locator.query)? {
        return Ok(message);
    }

    Err(err)
}

pub(super) fn double_tap_on(engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    let Operation::DoubleTapOn(params) = op else {
        return Err(mismatch(OpKind::DoubleTapOn, op));
    };
    let (x, y) = target_center(engine, run, &params.target)?;
    engine.device().tap(x, y)?;
    engine.pause(DOUBLE_TAP_GAP);
    engine.device().tap(x, y)?;
    run.mark_interaction();
    Ok(format!("Double Tap at ({}, {})", x, y))
}

pub(super) fn long_press_on(engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    let Operation::LongPressOn(params) = op else {
        return Err(mismatch(OpKind::LongPressOn, op));
    };
    let (x, y) = target_center(engine, run, &params.target)?;
    engine.device().swipe(x, y, x, y, LONG_PRESS_MS)?;
    run.mark_interaction();
    Ok(format!("Long Press at ({}, {})", x, y))
}

fn point_pixels(engine: &Engine, point: PointSpec) -> EngineResult<(i32, i32)> {
    match point {
        PointSpec::Pixels { x, y } => Ok((x, y)),
        PointSpec::Percent { .. } => Ok(point.to_pixels(engine.device().screen_size()?)),
    }
}

/// Center of a point or element target, using the short wait for elements
fn target_center(engine: &Engine, run: &mut RunContext, target: &Target) -> EngineResult<(i32, i32)> {
    match target {
        Target::Point(point) => point_pixels(engine, *point),
        Target::Element(locator) => {
            let found = wait_for_element(engine, run, locator, engine.policy().short_timeout)?;
            ensure_enabled(&found, locator)?;
            Ok(found.center())
        }
    }
}

fn ensure_enabled(found: &Resolved, locator: &Locator) -> EngineResult<()> {
    if found.is_enabled() {
        Ok(())
    } else {
        Err(EngineError::Disabled(locator.to_string()))
    }
}

/// Tap the first visible allow button of a runtime permission dialog
fn tap_permission_button(engine: &Engine, run: &mut RunContext) -> EngineResult<Option<String>> {
    let snapshot = match engine.acquire(run, AcquireOptions::fresh()) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            debug!(error = %e, "no hierarchy for permission fallback");
            return Ok(None);
        }
    };

    let candidates = PERMISSION_ALLOW_IDS.iter().chain(PERMISSION_ALLOW_TEXTS.iter());
    for query in candidates {
        let Some(bounds) = resolver::resolve_str(&snapshot.tree, query, None).and_then(|n| n.area_bounds())
        else {
            continue;
        };
        let (x, y) = bounds.center();
        engine.device().tap(x, y)?;
        run.mark_interaction();
        info!(button = query, "tapped permission dialog button");
        return Ok(Some(format!("Tap permission button '{}' at ({}, {})", query, x, y)));
    }
    Ok(None)
}

/// Ask the vision model for the element's position on a screenshot
fn tap_via_vision(engine: &Engine, run: &mut RunContext, query: &str) -> EngineResult<Option<String>> {
    let llm = engine.llm();
    if !llm.is_configured() {
        return Ok(None);
    }
    let png = match engine.device().screenshot() {
        Ok(png) => png,
        Err(e) => {
            warn!(error = %e, "screenshot for vision fallback failed");
            return Ok(None);
        }
    };
    engine.capture_artifact(run, "vision_check");

    let Some((x, y)) = locate_on_screen(llm, &png, query) else {
        debug!(query, "vision model did not locate the element");
        return Ok(None);
    };
    engine.device().tap(x, y)?;
    run.mark_interaction();
    info!(query, x, y, "tapped element located by AI vision");
    Ok(Some(format!("Tap '{}' at ({}, {}) (via AI Vision)", query, x, y)))
}
