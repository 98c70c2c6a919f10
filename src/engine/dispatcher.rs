//! Step dispatch: handler lookup, failure analysis and one healed retry.
//!
//! ```text
//! PENDING -> DISPATCHED -> SUCCESS
//!                       -> FAILED -> analyzed -> DISPATCHED (fix applied) -> ...
//! ```
//!
//! A step is dispatched at most [`MAX_DISPATCH_ATTEMPTS`] times. Crashes and
//! non-retryable errors end the step after the first analysis.

use std::time::Instant;

use tracing::{debug, info, warn};

use super::Engine;
use super::context::RunContext;
use crate::error::{EngineError, EngineResult};
use crate::flow::{FlowError, OpKind, Operation, PointSpec, Step, TapParams, Target};
use crate::healer::{AiAdvisor, FailureAnalyzer, FailureContext, HistoryEntry, LocatorFix, is_crash_text};
use crate::hierarchy::AcquireOptions;
use crate::memory::{ActionStatus, FailureReason, RunMode};

/// Dispatch attempts per step, including the healed retry
pub const MAX_DISPATCH_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Completed,
    Failed,
    /// Optional tap that found nothing, or an unsupported command
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result of one step
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub index: usize,
    /// The step as written in the flow
    pub step: String,
    pub kind: OpKind,
    pub status: StepStatus,
    /// Handler result line, or the error for failed steps
    pub message: String,
    /// Whether any heal happened while the step ran
    pub healed: bool,
    pub duration_ms: u64,
}

/// Dispatch one step, retrying once after failure analysis.
///
/// `history` holds the steps already executed in this run and is shown to the
/// failure advisor.
pub fn dispatch_step(
    engine: &Engine,
    run: &mut RunContext,
    step: &Step,
    index: usize,
    history: &[HistoryEntry],
) -> EngineResult<StepOutcome> {
    let started = Instant::now();
    let healed_before = engine.memory().healed_count();
    run.step_index = Some(index);

    let mut op = step.op.clone();
    let mut attempt = 1;

    loop {
        let fast = match run.mode {
            RunMode::Fast => fast_tap(engine, run, &op, index),
            RunMode::Learn => None,
        };
        let current = fast.as_ref().unwrap_or(&op);
        let kind = current.kind();
        let handler = engine.registry().get(kind).ok_or_else(|| {
            EngineError::Flow(FlowError::InvalidParams {
                op: kind.name().to_string(),
                message: "no handler registered".to_string(),
            })
        })?;

        debug!(index, attempt, %kind, step = %step.raw, "dispatching step");
        let action_started = Instant::now();
        let err = match handler.execute(engine, run, current) {
            Ok(message) => {
                record_action(engine, run, step, ActionStatus::Success, action_started);
                let status = if kind == OpKind::Skipped || message.starts_with("Skip optional") {
                    StepStatus::Skipped
                } else {
                    StepStatus::Completed
                };
                return Ok(StepOutcome {
                    index,
                    step: step.raw.clone(),
                    kind: step.op.kind(),
                    status,
                    message,
                    healed: engine.memory().healed_count() > healed_before,
                    duration_ms: elapsed_ms(started),
                });
            }
            Err(err) => err,
        };

        let action_id = record_action(engine, run, step, ActionStatus::Fail, action_started);
        let error_text = err.to_string();
        warn!(index, attempt, error = %error_text, "step failed");

        if run.mode == RunMode::Fast {
            info!(index, "step failed in FAST mode, continuing run in LEARN mode");
            run.mode = RunMode::Learn;
        }

        let crashed = matches!(err, EngineError::Crash(_)) || is_crash_text(&error_text);
        let snapshot = if crashed {
            None
        } else {
            engine.acquire(run, AcquireOptions::fresh()).ok()
        };
        let screen_hash = snapshot.as_ref().map(|s| s.screen_hash.as_str()).unwrap_or_default();
        let tree = snapshot.as_ref().map(|s| s.tree.as_ref());

        let analysis = FailureAnalyzer::new(engine.memory()).analyze(&FailureContext {
            run_id: &run.run_id,
            action_id: &action_id,
            query: op.locator().map(|l| l.query.as_str()),
            error: &error_text,
            screen_hash,
            tree,
        });

        if crashed {
            let source = match err {
                EngineError::Crash(_) => err,
                other => EngineError::Crash(other.to_string()),
            };
            return Err(EngineError::StepExecution {
                step: step.raw.clone(),
                reason: FailureReason::AppCrash,
                source: Box::new(source),
            });
        }

        if attempt >= MAX_DISPATCH_ATTEMPTS || !err.is_retryable() {
            return Err(EngineError::StepExecution {
                step: step.raw.clone(),
                reason: analysis.reason,
                source: Box::new(err),
            });
        }

        let fix = analysis.suggested_fix.or_else(|| {
            AiAdvisor::new(engine.llm())
                .diagnose(&step.raw, &error_text, tree, history)
                .and_then(|diagnosis| {
                    info!(
                        failure_type = %diagnosis.failure_type,
                        root_cause = %diagnosis.root_cause,
                        confidence = diagnosis.confidence,
                        "advisor diagnosis"
                    );
                    diagnosis.suggested_fix
                })
        });
        apply_fix(&mut op, fix.as_ref(), index);

        run.cache.invalidate();
        attempt += 1;
    }
}

/// FAST mode: replace an element tap with a tap on the remembered point
fn fast_tap(engine: &Engine, run: &RunContext, op: &Operation, index: usize) -> Option<Operation> {
    let Operation::TapOn(TapParams {
        target: Target::Element(_),
        optional,
    }) = op
    else {
        return None;
    };
    let memory = engine.memory().get_step_memory(&run.test_name, index)?;
    let (x, y) = memory.bounds.center();
    debug!(index, x, y, "FAST mode: tapping remembered point");
    Some(Operation::TapOn(TapParams {
        target: Target::Point(PointSpec::Pixels { x, y }),
        optional: *optional,
    }))
}

fn apply_fix(op: &mut Operation, fix: Option<&LocatorFix>, index: usize) {
    match fix {
        Some(fix) if op.apply_fix(fix) => {
            info!(index, fix = ?fix, "locator fix applied, retrying step");
        }
        Some(fix) => debug!(index, fix = ?fix, "fix does not apply to this step"),
        None => debug!(index, "no fix proposed, retrying step as written"),
    }
}

fn record_action(
    engine: &Engine,
    run: &RunContext,
    step: &Step,
    status: ActionStatus,
    started: Instant,
) -> String {
    engine
        .memory()
        .record_action(
            &run.run_id,
            step.op.kind().name(),
            &step.raw,
            status,
            elapsed_ms(started),
            None,
        )
        .unwrap_or_else(|e| {
            warn!(error = %e, "failed to record action");
            String::new()
        })
}

pub(crate) fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WaitPolicy;
    use crate::device::ScriptedDevice;
    use crate::flow::parse_flow;
    use crate::hierarchy::Bounds;
    use crate::llm::NoLlm;
    use crate::memory::MemoryStore;
    use std::sync::Arc;

    const SCREEN: &str = r#"<hierarchy>
<node text="Continue" class="android.widget.Button" clickable="true" bounds="[100,1000][500,1100]"/>
</hierarchy>"#;

    fn setup() -> (Arc<ScriptedDevice>, Engine) {
        let device = Arc::new(ScriptedDevice::new(SCREEN));
        let engine = Engine::new(
            device.clone(),
            Arc::new(MemoryStore::in_memory()),
            Arc::new(NoLlm),
            WaitPolicy::instant(),
        );
        (device, engine)
    }

    fn step(yaml: &str) -> Step {
        parse_flow(yaml).unwrap().steps.remove(0)
    }

    #[test]
    fn test_successful_step_records_action() {
        let (_, engine) = setup();
        let run_id = engine.memory().start_run("t", RunMode::Learn).unwrap();
        let mut run = RunContext::new(run_id.clone(), "t", RunMode::Learn);

        let outcome = dispatch_step(&engine, &mut run, &step("- tapOn: Continue"), 0, &[]).unwrap();
        assert_eq!(outcome.status, StepStatus::Completed);
        assert_eq!(outcome.kind, OpKind::TapOn);
        let actions = engine.memory().read(|doc| doc.actions.clone());
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].status, ActionStatus::Success);
        assert_eq!(actions[0].intent, r#"{"tapOn":"Continue"}"#);
    }

    #[test]
    fn test_fast_mode_taps_remembered_point() {
        let (device, engine) = setup();
        engine
            .memory()
            .save_step_memory("t", 0, Bounds::new(0, 0, 200, 100))
            .unwrap();
        let mut run = RunContext::new("r1", "t", RunMode::Fast);

        dispatch_step(&engine, &mut run, &step("- tapOn: Continue"), 0, &[]).unwrap();
        assert_eq!(device.taps(), vec![(100, 50)]);
        assert_eq!(device.dump_count(), 0);
    }

    #[test]
    fn test_failed_step_is_retried_once() {
        let (_, engine) = setup();
        let mut run = RunContext::new("r1", "t", RunMode::Fast);

        let err = dispatch_step(&engine, &mut run, &step("- assertVisible: Missing"), 3, &[]).unwrap_err();
        match err {
            EngineError::StepExecution { reason, source, .. } => {
                assert_eq!(reason, FailureReason::ElementMissing);
                assert!(matches!(*source, EngineError::NotFound { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        let (fails, failures) = engine.memory().read(|doc| {
            (
                doc.actions.iter().filter(|a| a.status == ActionStatus::Fail).count(),
                doc.failures.len(),
            )
        });
        assert_eq!(fails, MAX_DISPATCH_ATTEMPTS as usize);
        assert_eq!(failures, MAX_DISPATCH_ATTEMPTS as usize);
        assert_eq!(run.mode, RunMode::Learn);
    }

    #[test]
    fn test_assertion_violation_is_not_retried() {
        let (_, engine) = setup();
        let mut run = RunContext::new("r1", "t", RunMode::Learn);
        let err = dispatch_step(&engine, &mut run, &step("- assertNotVisible: Continue"), 0, &[]).unwrap_err();
        assert!(matches!(err.root(), EngineError::AssertionViolation(_)));
        assert_eq!(engine.memory().read(|doc| doc.actions.len()), 1);
    }

    #[test]
    fn test_skipped_command() {
        let (_, engine) = setup();
        let mut run = RunContext::new("r1", "t", RunMode::Learn);
        let outcome = dispatch_step(&engine, &mut run, &step("- runFlow: other.yaml"), 0, &[]).unwrap();
        assert_eq!(outcome.status, StepStatus::Skipped);
    }
}
