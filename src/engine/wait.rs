//! Two-phase bounded locator wait.
//!
//! Each phase lasts `max(requested, min_phase)`. Within a phase every poll
//! tries, in order: memory recall for the current screen, the resolver, the
//! geometric successor of the remembered element (from the second poll on)
//! and the semantic resolver (late in phase one, and throughout phase two).
//! An exhausted wait produces a not-found error carrying a diagnosis.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::Engine;
use super::context::RunContext;
use crate::error::{EngineError, EngineResult};
use crate::flow::Locator;
use crate::healing::{HybridResolver, diagnose_not_found, fuzzy_successor};
use crate::hierarchy::{AcquireOptions, Bounds, UiNode};
use crate::resolver::{self, Query};

const PHASES: u32 = 2;

/// How an element was located
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    /// Resolver match on the live tree
    Live,
    /// Bounds recalled from memory for this screen
    Recalled,
    /// Geometric successor of the remembered element
    Fuzzy,
    /// LLM-ranked candidate
    Semantic,
}

impl ResolutionSource {
    pub fn is_heal(self) -> bool {
        matches!(self, ResolutionSource::Fuzzy | ResolutionSource::Semantic)
    }
}

/// A located element
#[derive(Debug, Clone)]
pub struct Resolved {
    pub bounds: Bounds,
    /// The live node, unless the bounds were recalled from memory
    pub node: Option<UiNode>,
    pub source: ResolutionSource,
}

impl Resolved {
    pub fn center(&self) -> (i32, i32) {
        self.bounds.center()
    }

    /// Recalled elements are assumed enabled
    pub fn is_enabled(&self) -> bool {
        self.node.as_ref().is_none_or(|n| n.enabled)
    }
}

/// Wait for `locator` to appear, healing where possible.
pub fn wait_for_element(
    engine: &Engine,
    run: &mut RunContext,
    locator: &Locator,
    requested: Duration,
) -> EngineResult<Resolved> {
    let policy = engine.policy();
    let phase = policy.phase_for(locator.timeout.unwrap_or(requested));
    let query = locator.query.as_str();
    let index = locator.index;

    if index.is_none() {
        let recalled = run
            .cache
            .current_screen_hash()
            .and_then(|hash| engine.memory().recall_bounds(hash, query));
        if let Some(bounds) = recalled {
            debug!(query, "recalled from memory before polling");
            return Ok(settle(engine, run, query, None, bounds, ResolutionSource::Recalled));
        }
    }

    let parsed = Query::parse(query);
    let mut polls = 0u32;

    for attempt in 1..=PHASES {
        let started = Instant::now();
        let mut first = true;
        debug!(%locator, attempt, ?phase, "waiting for element");

        while started.elapsed() < phase {
            let smart = first && attempt == 1;
            let opts = if smart {
                AcquireOptions::smart()
            } else {
                AcquireOptions::fresh()
            };
            let snapshot = match engine.acquire(run, opts) {
                Ok(snapshot) => snapshot,
                Err(e) if e.is_retryable() => {
                    debug!(error = %e, "hierarchy unavailable, polling again");
                    first = false;
                    engine.pause(policy.poll_interval);
                    continue;
                }
                Err(e) => return Err(e),
            };
            polls += 1;
            let hash = snapshot.screen_hash.as_str();

            if index.is_none() {
                if let Some(bounds) = engine.memory().recall_bounds(hash, query) {
                    debug!(query, screen = %short(hash), "recalled from memory");
                    return Ok(settle(engine, run, query, None, bounds, ResolutionSource::Recalled));
                }
            }

            if let Some(node) = resolver::resolve(&snapshot.tree, &parsed, index) {
                match node.area_bounds() {
                    Some(bounds) => {
                        debug!(%locator, elapsed = ?started.elapsed(), "element found");
                        if index.is_none() {
                            remember(engine, run, hash, query, Some(node), true);
                        }
                        return Ok(settle(engine, run, query, Some(node), bounds, ResolutionSource::Live));
                    }
                    None => debug!(%locator, "element matched but has no visible area"),
                }
            }

            if smart {
                first = false;
                continue;
            }
            first = false;

            if index.is_none() {
                if let Some(healed) = heal(engine, run, &snapshot.tree, hash, query, polls, attempt, started, phase) {
                    return Ok(healed);
                }
            }

            engine.pause(policy.poll_interval);
        }

        if attempt < PHASES {
            info!(%locator, ?phase, "element not found in first phase, retrying");
            engine.pause(policy.phase_pause);
        }
    }

    Err(exhausted(engine, run, locator, phase * PHASES))
}

/// Fuzzy successor, then semantic resolution
#[allow(clippy::too_many_arguments)]
fn heal(
    engine: &Engine,
    run: &mut RunContext,
    tree: &UiNode,
    hash: &str,
    query: &str,
    polls: u32,
    attempt: u32,
    started: Instant,
    phase: Duration,
) -> Option<Resolved> {
    if polls >= 2 {
        let successor = engine
            .memory()
            .find_element_anywhere(query)
            .and_then(|remembered| fuzzy_successor(tree, &remembered));
        if let Some(node) = successor {
            if let Some(bounds) = node.area_bounds() {
                info!(query, successor = %node.label(), "self-healed via geometric successor");
                return Some(healed(engine, run, hash, query, node, bounds, ResolutionSource::Fuzzy));
            }
        }
    }

    let llm = engine.llm();
    let late = attempt > 1 || started.elapsed() >= phase.mul_f64(engine.policy().semantic_after);
    if llm.is_configured() && late {
        if let Some(node) = HybridResolver::new(llm).resolve(query, tree) {
            if let Some(bounds) = node.area_bounds() {
                info!(query, matched = %node.label(), "self-healed via semantic resolver");
                return Some(healed(engine, run, hash, query, node, bounds, ResolutionSource::Semantic));
            }
        }
    }
    None
}

fn healed(
    engine: &Engine,
    run: &mut RunContext,
    hash: &str,
    query: &str,
    node: &UiNode,
    bounds: Bounds,
    source: ResolutionSource,
) -> Resolved {
    if let Err(e) = engine.memory().increment_healed() {
        warn!(error = %e, "failed to bump healed counter");
    }
    remember(engine, run, hash, query, Some(node), true);
    settle(engine, run, query, Some(node), bounds, source)
}

/// Save step memory and build the result
fn settle(
    engine: &Engine,
    run: &RunContext,
    query: &str,
    node: Option<&UiNode>,
    bounds: Bounds,
    source: ResolutionSource,
) -> Resolved {
    if let Some(step) = run.step_index {
        if let Err(e) = engine.memory().save_step_memory(&run.test_name, step, bounds) {
            warn!(query, error = %e, "failed to save step memory");
        }
    }
    Resolved {
        bounds,
        node: node.cloned(),
        source,
    }
}

fn remember(engine: &Engine, run: &RunContext, hash: &str, query: &str, node: Option<&UiNode>, success: bool) {
    if let Err(e) = engine
        .memory()
        .remember_interaction(hash, query, node, &run.run_id, success)
    {
        warn!(query, error = %e, "failed to record interaction");
    }
}

fn exhausted(engine: &Engine, run: &mut RunContext, locator: &Locator, waited: Duration) -> EngineError {
    let snapshot = engine.acquire(run, AcquireOptions::fresh()).ok();
    let hash = snapshot
        .as_ref()
        .map(|s| s.screen_hash.clone())
        .unwrap_or_else(|| "unknown".to_string());
    let empty = UiNode::empty();
    let tree = snapshot.as_ref().map(|s| s.tree.as_ref()).unwrap_or(&empty);

    let analysis = diagnose_not_found(engine.memory(), tree, &locator.query, &hash);
    if locator.index.is_none() {
        remember(engine, run, &hash, &locator.query, None, false);
    }
    warn!(%locator, %analysis, "element not found");
    engine.capture_artifact(run, "failure_timeout");

    EngineError::NotFound {
        query: locator.query.clone(),
        index: locator.index,
        waited,
        analysis,
    }
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(8)]
}
