//! Run lifecycle: mode selection, sequential dispatch, progress events.

use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, warn};

use super::context::{CancelToken, RunContext};
use super::dispatcher::{StepOutcome, StepStatus, dispatch_step, elapsed_ms};
use super::Engine;
use crate::error::{EngineError, EngineResult};
use crate::flow::{Flow, Operation, Step, parse_flow};
use crate::healer::HistoryEntry;
use crate::memory::{MemoryStore, RunMode, RunStatus};
use crate::session::Session;

/// FAST when the latest completed run of the test passed, LEARN otherwise
pub fn select_mode(memory: &MemoryStore, test_name: &str) -> RunMode {
    match memory.last_completed_run(test_name) {
        Some(run) if run.status == RunStatus::Pass => RunMode::Fast,
        _ => RunMode::Learn,
    }
}

/// Progress of a run, emitted as it happens
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    Started {
        run_id: String,
        test_name: String,
        mode: RunMode,
        steps: usize,
    },
    StepRunning {
        index: usize,
        step: String,
    },
    StepCompleted(StepOutcome),
    StepFailed {
        index: usize,
        step: String,
        error: String,
    },
    Finished {
        run_id: String,
        status: RunStatus,
        confidence: f64,
        duration_ms: u64,
    },
}

impl fmt::Display for FlowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowEvent::Started {
                run_id,
                test_name,
                mode,
                steps,
            } => write!(f, "[{}] {} started in {} mode ({} steps)", run_id, test_name, mode, steps),
            FlowEvent::StepRunning { index, step } => write!(f, "  {:>3} running   {}", index + 1, step),
            FlowEvent::StepCompleted(outcome) => {
                write!(f, "  {:>3} {:<9} {}", outcome.index + 1, outcome.status, outcome.message)?;
                if outcome.healed {
                    write!(f, " (healed)")?;
                }
                Ok(())
            }
            FlowEvent::StepFailed { index, error, .. } => write!(f, "  {:>3} failed    {}", index + 1, error),
            FlowEvent::Finished {
                run_id,
                status,
                confidence,
                duration_ms,
            } => write!(
                f,
                "[{}] {} in {:.1}s, confidence {:.2}",
                run_id,
                status,
                *duration_ms as f64 / 1000.0,
                confidence
            ),
        }
    }
}

/// Result of one flow run
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run_id: String,
    pub test_name: String,
    pub mode: RunMode,
    pub status: RunStatus,
    /// First unrecovered error; remaining steps were not run
    pub error: Option<String>,
    pub steps: Vec<StepOutcome>,
    pub confidence: f64,
    /// Steps during which a heal happened
    pub healed: usize,
    pub duration_ms: u64,
}

impl RunOutcome {
    pub fn passed(&self) -> bool {
        self.status == RunStatus::Pass
    }
}

/// Result of one file of a folder run
#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub outcome: Option<RunOutcome>,
    /// Read, parse or store error that kept the flow from running
    pub error: Option<String>,
}

impl FileOutcome {
    pub fn passed(&self) -> bool {
        self.outcome.as_ref().is_some_and(RunOutcome::passed)
    }
}

impl Engine {
    /// Run a flow to completion or its first unrecovered failure.
    ///
    /// A failing step ends the run with status FAIL and is reported in the
    /// outcome; `Err` is reserved for errors of the memory store itself.
    pub fn run_flow(
        &self,
        flow: &Flow,
        test_name: &str,
        cancel: &CancelToken,
        mut on_event: impl FnMut(&FlowEvent),
    ) -> EngineResult<RunOutcome> {
        let mode = select_mode(self.memory(), test_name);
        let run_id = self.memory().start_run(test_name, mode)?;
        let session = Session::for_run(self.artifact_root(), &run_id);
        let mut run = RunContext::new(run_id.clone(), test_name, mode).with_session(session);
        let started = Instant::now();

        on_event(&FlowEvent::Started {
            run_id: run_id.clone(),
            test_name: test_name.to_string(),
            mode,
            steps: flow.steps.len(),
        });

        let mut history: Vec<HistoryEntry> = Vec::with_capacity(flow.steps.len());
        let mut steps = Vec::with_capacity(flow.steps.len());
        let mut error = None;

        for (index, step) in flow.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                let cancelled = EngineError::Cancelled(index);
                warn!(run_id = %run_id, index, "run cancelled");
                error = Some(cancelled.to_string());
                break;
            }

            let step = with_app_id(step, flow.app_id.as_deref());
            on_event(&FlowEvent::StepRunning {
                index,
                step: step.raw.clone(),
            });

            let step_started = Instant::now();
            match dispatch_step(self, &mut run, &step, index, &history) {
                Ok(outcome) => {
                    history.push(HistoryEntry {
                        step: step.raw.clone(),
                        result: Some(outcome.message.clone()),
                        error: None,
                        status: "success".to_string(),
                    });
                    on_event(&FlowEvent::StepCompleted(outcome.clone()));
                    steps.push(outcome);
                }
                Err(e) => {
                    let message = e.to_string();
                    history.push(HistoryEntry {
                        step: step.raw.clone(),
                        result: None,
                        error: Some(message.clone()),
                        status: "failed".to_string(),
                    });
                    on_event(&FlowEvent::StepFailed {
                        index,
                        step: step.raw.clone(),
                        error: message.clone(),
                    });
                    steps.push(StepOutcome {
                        index,
                        step: step.raw.clone(),
                        kind: step.op.kind(),
                        status: StepStatus::Failed,
                        message: message.clone(),
                        healed: false,
                        duration_ms: elapsed_ms(step_started),
                    });
                    error = Some(message);
                    break;
                }
            }
        }

        let status = if error.is_none() {
            RunStatus::Pass
        } else {
            RunStatus::Fail
        };
        let duration_ms = elapsed_ms(started);
        let confidence = self.memory().end_run(&run_id, status, duration_ms)?;
        info!(run_id = %run_id, test_name, %status, confidence, "run finished");

        on_event(&FlowEvent::Finished {
            run_id: run_id.clone(),
            status,
            confidence,
            duration_ms,
        });

        Ok(RunOutcome {
            run_id,
            test_name: test_name.to_string(),
            mode,
            status,
            error,
            healed: steps.iter().filter(|s| s.healed).count(),
            steps,
            confidence,
            duration_ms,
        })
    }

    /// Run every `.yaml`/`.yml` flow in `dir`, in file name order, continuing
    /// after failures.
    pub fn run_folder(
        &self,
        dir: &Path,
        cancel: &CancelToken,
        mut on_event: impl FnMut(&Path, &FlowEvent),
    ) -> EngineResult<Vec<FileOutcome>> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_flow_file(p))
            .collect();
        files.sort();
        info!(dir = %dir.display(), files = files.len(), "running flow folder");

        let mut outcomes = Vec::with_capacity(files.len());
        for path in files {
            if cancel.is_cancelled() {
                break;
            }
            let result = fs::read_to_string(&path)
                .map_err(EngineError::from)
                .and_then(|source| parse_flow(&source).map_err(EngineError::from))
                .and_then(|flow| {
                    let stem = path.file_stem().and_then(|s| s.to_str());
                    let test_name = flow.test_name(stem);
                    self.run_flow(&flow, &test_name, cancel, |event| on_event(&path, event))
                });
            let file = match result {
                Ok(outcome) => FileOutcome {
                    path,
                    outcome: Some(outcome),
                    error: None,
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "flow could not be run");
                    FileOutcome {
                        path,
                        outcome: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(file);
        }
        Ok(outcomes)
    }
}

fn is_flow_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
}

/// Fill in the flow's app id for app steps that name none
fn with_app_id<'s>(step: &'s Step, app_id: Option<&str>) -> Cow<'s, Step> {
    let Some(app_id) = app_id else {
        return Cow::Borrowed(step);
    };
    let op = match &step.op {
        Operation::LaunchApp {
            app_id: None,
            clear_state,
        } => Operation::LaunchApp {
            app_id: Some(app_id.to_string()),
            clear_state: *clear_state,
        },
        Operation::StopApp(None) => Operation::StopApp(Some(app_id.to_string())),
        Operation::ClearState(None) => Operation::ClearState(Some(app_id.to_string())),
        _ => return Cow::Borrowed(step),
    };
    Cow::Owned(Step {
        op,
        raw: step.raw.clone(),
    })
}
