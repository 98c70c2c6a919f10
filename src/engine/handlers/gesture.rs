//! Scroll and swipe gestures.
//!
//! A swipe moves the finger in the named direction. A scroll names the
//! direction the content travels, so its finger path is the opposite one.

use std::time::Duration;

use tracing::debug;

use super::mismatch;
use crate::engine::context::RunContext;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::flow::{Direction, Locator, OpKind, Operation};
use crate::hierarchy::{AcquireOptions, Bounds};
use crate::resolver;

const SCROLL_MS: u64 = 1000;
/// Half-length of a full-screen scroll, as a fraction of the screen
const SCROLL_REACH: f64 = 0.3;
/// Half-length of a full-screen swipe
const SWIPE_REACH: f64 = 0.2;
/// Half-length of a gesture inside an element, as a fraction of the element
const ELEMENT_REACH: f64 = 0.3;

type Path = (i32, i32, i32, i32);

pub(super) fn scroll(engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    let Operation::Scroll { direction, element } = op else {
        return Err(mismatch(OpKind::Scroll, op));
    };
    let finger = opposite(*direction);

    let within = match element {
        Some(locator) => {
            let found = find_bounds(engine, run, locator)?;
            if found.is_none() {
                debug!(%locator, "scroll container not found, scrolling the screen");
            }
            found
        }
        None => None,
    };

    match within {
        Some(bounds) => {
            let (x1, y1, x2, y2) = element_path(finger, bounds);
            engine.device().swipe(x1, y1, x2, y2, SCROLL_MS)?;
        }
        None => scroll_screen(engine, *direction)?,
    }
    run.mark_interaction();
    Ok(format!("Scroll {}", direction))
}

pub(super) fn swipe(engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
    let Operation::Swipe {
        direction,
        duration_ms,
        element,
    } = op
    else {
        return Err(mismatch(OpKind::Swipe, op));
    };

    let (x1, y1, x2, y2) = match element {
        Some(locator) => {
            let bounds = find_bounds(engine, run, locator)?.ok_or_else(|| EngineError::NotFound {
                query: locator.query.clone(),
                index: locator.index,
                waited: Duration::ZERO,
                analysis: "Swipe failed: element not found".to_string(),
            })?;
            element_path(*direction, bounds)
        }
        None => {
            let size = engine.device().screen_size()?;
            screen_path(*direction, size, SWIPE_REACH)
        }
    };
    engine.device().swipe(x1, y1, x2, y2, *duration_ms)?;
    run.mark_interaction();
    Ok(format!("Swipe {}", direction))
}

/// Full-screen scroll moving the content in `direction`
pub(super) fn scroll_screen(engine: &Engine, direction: Direction) -> EngineResult<()> {
    let size = engine.device().screen_size()?;
    let (x1, y1, x2, y2) = screen_path(opposite(direction), size, SCROLL_REACH);
    engine.device().swipe(x1, y1, x2, y2, SCROLL_MS)?;
    Ok(())
}

fn find_bounds(engine: &Engine, run: &mut RunContext, locator: &Locator) -> EngineResult<Option<Bounds>> {
    let snapshot = engine.acquire(run, AcquireOptions::default())?;
    Ok(resolver::resolve_str(&snapshot.tree, &locator.query, locator.index).and_then(|n| n.area_bounds()))
}

fn opposite(direction: Direction) -> Direction {
    match direction {
        Direction::Up => Direction::Down,
        Direction::Down => Direction::Up,
        Direction::Left => Direction::Right,
        Direction::Right => Direction::Left,
    }
}

fn screen_path(finger: Direction, (width, height): (i32, i32), reach: f64) -> Path {
    finger_path(
        finger,
        (width / 2, height / 2),
        (scale(width, reach), scale(height, reach)),
    )
}

fn element_path(finger: Direction, bounds: Bounds) -> Path {
    finger_path(
        finger,
        bounds.center(),
        (
            scale(bounds.width, ELEMENT_REACH),
            scale(bounds.height, ELEMENT_REACH),
        ),
    )
}

fn finger_path(finger: Direction, (cx, cy): (i32, i32), (rx, ry): (i32, i32)) -> Path {
    match finger {
        Direction::Up => (cx, cy + ry, cx, cy - ry),
        Direction::Down => (cx, cy - ry, cx, cy + ry),
        Direction::Left => (cx + rx, cy, cx - rx, cy),
        Direction::Right => (cx - rx, cy, cx + rx, cy),
    }
}

fn scale(length: i32, fraction: f64) -> i32 {
    (f64::from(length) * fraction).round() as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WaitPolicy;
    use crate::device::ScriptedDevice;
    use crate::llm::NoLlm;
    use crate::memory::{MemoryStore, RunMode};
    use std::sync::Arc;

    const LIST: &str = r#"<hierarchy>
<node resource-id="com.app:id/carousel" class="androidx.recyclerview.widget.RecyclerView" scrollable="true" bounds="[0,1000][1080,1400]"/>
</hierarchy>"#;

    fn setup() -> (Arc<ScriptedDevice>, Engine, RunContext) {
        let device = Arc::new(ScriptedDevice::new(LIST));
        let engine = Engine::new(
            device.clone(),
            Arc::new(MemoryStore::in_memory()),
            Arc::new(NoLlm),
            WaitPolicy::instant(),
        );
        (device, engine, RunContext::new("r1", "t", RunMode::Learn))
    }

    fn last_swipe(device: &ScriptedDevice) -> String {
        device
            .commands()
            .into_iter()
            .rev()
            .find(|c| c.starts_with("input swipe"))
            .unwrap()
    }

    #[test]
    fn test_scroll_down_moves_finger_up() {
        let (device, engine, mut run) = setup();
        let op = Operation::Scroll {
            direction: Direction::Down,
            element: None,
        };
        scroll(&engine, &mut run, &op).unwrap();
        assert_eq!(last_swipe(&device), "input swipe 540 1920 540 480 1000");
    }

    #[test]
    fn test_swipe_left_on_screen_and_element() {
        let (device, engine, mut run) = setup();
        let global = Operation::Swipe {
            direction: Direction::Left,
            duration_ms: 500,
            element: None,
        };
        swipe(&engine, &mut run, &global).unwrap();
        assert_eq!(last_swipe(&device), "input swipe 756 1200 324 1200 500");

        let within = Operation::Swipe {
            direction: Direction::Left,
            duration_ms: 300,
            element: Some(Locator::new("carousel")),
        };
        swipe(&engine, &mut run, &within).unwrap();
        assert_eq!(last_swipe(&device), "input swipe 864 1200 216 1200 300");
    }

    #[test]
    fn test_swipe_on_missing_element_fails() {
        let (_, engine, mut run) = setup();
        let op = Operation::Swipe {
            direction: Direction::Up,
            duration_ms: 500,
            element: Some(Locator::new("gallery")),
        };
        let err = swipe(&engine, &mut run, &op).unwrap_err();
        assert!(err.to_string().contains("Swipe failed"));
    }
}
