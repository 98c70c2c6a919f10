//! Run reports and improvement suggestions derived from memory.

use serde::Serialize;

use super::types::{ActionStatus, FailureReason, MemoryDocument, RunStatus};

/// Elements below this success rate are flagged as flaky
pub const FLAKY_THRESHOLD: f64 = 0.9;

/// Runs slower than this are flagged
pub const SLOW_RUN_MS: u64 = 60_000;

/// How many recent runs the slow-run check looks at
pub const RECENT_RUNS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub test_name: String,
    pub run_id: String,
    pub status: RunStatus,
    pub total_steps: usize,
    pub passed_steps: usize,
    pub failed_steps: usize,
    pub duration_seconds: f64,
    pub confidence_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureDetail {
    pub failed_step: String,
    pub reason: String,
    pub details: Option<String>,
    pub auto_fixed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionStep {
    pub step_number: usize,
    pub action: String,
    pub status: ActionStatus,
    pub time_ms: u64,
}

/// Actionable summary of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub summary: RunSummary,
    pub failure_details: Vec<FailureDetail>,
    pub execution_steps: Vec<ExecutionStep>,
    pub recommendation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuggestionKind {
    FlakyElement,
    SlowTest,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    #[serde(rename = "type")]
    pub kind: SuggestionKind,
    /// Screen for flaky elements, test name for slow runs
    pub subject: String,
    pub element: Option<String>,
    pub metric: String,
    pub suggestion: String,
}

/// Build the report for `run_id`, or `None` when the run is unknown
pub fn build_report(doc: &MemoryDocument, run_id: &str) -> Option<RunReport> {
    let run = doc.run(run_id)?;
    let actions: Vec<_> = doc.actions.iter().filter(|a| a.run_id == run_id).collect();
    let failures: Vec<_> = doc.failures.iter().filter(|f| f.run_id == run_id).collect();
    let failed: Vec<_> = actions
        .iter()
        .filter(|a| a.status == ActionStatus::Fail)
        .collect();

    let failure_details = failed
        .iter()
        .map(|action| {
            let matching = failures.iter().find(|f| f.action_id == action.action_id);
            FailureDetail {
                failed_step: action.intent.clone(),
                reason: matching
                    .map(|f| f.reason.describe().to_string())
                    .unwrap_or_else(|| "Unknown error".to_string()),
                details: matching.map(|f| {
                    if f.notes.is_empty() {
                        "No additional details".to_string()
                    } else {
                        f.notes.clone()
                    }
                }),
                auto_fixed: matching.is_some_and(|f| f.healed),
            }
        })
        .collect();

    let execution_steps = actions
        .iter()
        .enumerate()
        .map(|(i, a)| ExecutionStep {
            step_number: i + 1,
            action: a.intent.clone(),
            status: a.status,
            time_ms: a.execution_time_ms,
        })
        .collect();

    let recommendation = if run.status == RunStatus::Pass {
        "All test steps passed successfully. No action needed.".to_string()
    } else if failed.is_empty() {
        "Test failed but no specific step failure detected. Check application logs for crashes or timeouts.".to_string()
    } else {
        let auto_fixed = failures.iter().filter(|f| f.healed).count();
        if auto_fixed > 0 {
            format!(
                "Test failed after {} automatic fix attempt(s). The issue requires manual investigation. Check the failure details above.",
                auto_fixed
            )
        } else {
            failures
                .first()
                .map(|f| recommendation_for(f.reason).to_string())
                .unwrap_or_else(|| {
                    "Review the execution steps to identify where the test diverged from expected behavior.".to_string()
                })
        }
    };

    Some(RunReport {
        summary: RunSummary {
            test_name: run.test_name.clone(),
            run_id: run.run_id.clone(),
            status: run.status,
            total_steps: actions.len(),
            passed_steps: actions.len() - failed.len(),
            failed_steps: failed.len(),
            duration_seconds: (run.execution_time_ms as f64 / 10.0).round() / 100.0,
            confidence_score: run.confidence_score,
        },
        failure_details,
        execution_steps,
        recommendation,
    })
}

fn recommendation_for(reason: FailureReason) -> &'static str {
    match reason {
        FailureReason::ElementMissing => {
            "Verify the element exists on the screen. Check if the app UI has changed or if the element loads slowly."
        }
        FailureReason::TextChanged => {
            "Update the test to use the new element text, or use a more stable locator such as the resource id."
        }
        FailureReason::ElementMoved => {
            "The UI layout has changed. Prefer text or id based locators over coordinates."
        }
        FailureReason::AppCrash => {
            "Check application logs for crash details. This is likely a bug in the app."
        }
        FailureReason::Unknown => {
            "Review the test logs and screenshots to identify the root cause."
        }
    }
}

/// Flaky elements and slow recent runs
pub fn suggestions(doc: &MemoryDocument) -> Vec<Suggestion> {
    let flaky = doc
        .elements
        .iter()
        .flat_map(|(screen, elements)| elements.values().map(move |el| (screen, el)))
        .filter(|(_, el)| el.success_rate < FLAKY_THRESHOLD)
        .map(|(screen, el)| Suggestion {
            kind: SuggestionKind::FlakyElement,
            subject: screen.clone(),
            element: Some(if el.text.is_empty() {
                el.resource_id.clone()
            } else {
                el.text.clone()
            }),
            metric: format!("{:.1}% Success Rate", el.success_rate * 100.0),
            suggestion: format!(
                "Replace locator '{}' with a more stable one.",
                serde_json::to_value(el.preferred_locator)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default()
            ),
        });

    let skip = doc.runs.len().saturating_sub(RECENT_RUNS);
    let slow = doc.runs[skip..]
        .iter()
        .filter(|run| run.execution_time_ms > SLOW_RUN_MS)
        .map(|run| Suggestion {
            kind: SuggestionKind::SlowTest,
            subject: run.test_name.clone(),
            element: None,
            metric: format!("{}s", run.execution_time_ms as f64 / 1000.0),
            suggestion: "Test takes more than a minute. Consider breaking it into smaller flows."
                .to_string(),
        });

    flaky.chain(slow).collect()
}
