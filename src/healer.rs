//! Failure analysis run after every failed dispatch.
//!
//! The rules-based analyzer classifies the error, compares the remembered
//! element with the live tree and may propose a locator replacement. When no
//! rule heals and an LLM is configured, [`AiAdvisor`] gets a second look.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use similar::TextDiff;
use tracing::{debug, info, warn};

use crate::hierarchy::UiNode;
use crate::llm::LlmService;
use crate::memory::{ElementRecord, FailureReason, MemoryStore};

/// Text similarity above which a label is considered renamed
pub const TEXT_DRIFT_RATIO: f32 = 0.8;

/// Characters of serialized hierarchy sent to the advisor
pub const HIERARCHY_SNIPPET_CHARS: usize = 10_000;

/// History entries sent to the advisor
pub const HISTORY_WINDOW: usize = 5;

const CRASH_MARKERS: &[&str] = &["FATAL EXCEPTION", "ANR in", "Process: ", "SIGSEGV", "AndroidRuntime"];

/// Whether error text carries an Android crash marker. Only these markers
/// short-circuit retries and healing.
pub fn is_crash_text(message: &str) -> bool {
    CRASH_MARKERS.iter().any(|m| message.contains(m))
}

/// Looser check used only to label a failure: any mention of a crash, except
/// in not-found and disabled errors, which echo the locator text.
fn mentions_crash(lowered: &str) -> bool {
    lowered.contains("crash") && !lowered.contains("not found") && !lowered.contains("is disabled")
}

/// A replacement locator proposed by the analyzer or the advisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum LocatorFix {
    Text(String),
    ResourceId(String),
}

impl LocatorFix {
    pub fn value(&self) -> &str {
        match self {
            LocatorFix::Text(v) | LocatorFix::ResourceId(v) => v,
        }
    }
}

/// Outcome of [`FailureAnalyzer::analyze`]
#[derive(Debug, Clone, PartialEq)]
pub struct FailureAnalysis {
    pub reason: FailureReason,
    pub healed: bool,
    pub notes: String,
    pub suggested_fix: Option<LocatorFix>,
}

/// What the analyzer knows about a failed dispatch
#[derive(Debug, Clone, Copy)]
pub struct FailureContext<'a> {
    pub run_id: &'a str,
    pub action_id: &'a str,
    /// Primary locator of the failed step, if it has one
    pub query: Option<&'a str>,
    pub error: &'a str,
    pub screen_hash: &'a str,
    /// Tree captured after the failure
    pub tree: Option<&'a UiNode>,
}

// ============================================================================
// Rules-based analyzer
// ============================================================================

pub struct FailureAnalyzer<'m> {
    memory: &'m MemoryStore,
}

impl<'m> FailureAnalyzer<'m> {
    pub fn new(memory: &'m MemoryStore) -> Self {
        Self { memory }
    }

    /// Classify a failure, record it and bump the healed counter when a fix
    /// is proposed.
    pub fn analyze(&self, ctx: &FailureContext<'_>) -> FailureAnalysis {
        let lowered = ctx.error.to_lowercase();
        let mut analysis = FailureAnalysis {
            reason: FailureReason::Unknown,
            healed: false,
            notes: format!("Failure: {}", ctx.error),
            suggested_fix: None,
        };

        if is_crash_text(ctx.error) || mentions_crash(&lowered) {
            analysis.reason = FailureReason::AppCrash;
            analysis.notes =
                "The application appears to have crashed or encountered a hard exception.".to_string();
        } else if lowered.contains("not found") || lowered.contains("timeout") || lowered.contains("timed out") {
            let expected = ctx.query.and_then(|q| {
                self.memory
                    .get_element_memory(ctx.screen_hash, q)
                    .or_else(|| self.memory.find_element_anywhere(q))
            });
            match (expected, ctx.tree) {
                (Some(expected), Some(tree)) => match drift(&expected, tree) {
                    Some(healed) => {
                        info!(reason = %healed.reason, fix = ?healed.suggested_fix, "failure healed by rules");
                        analysis = healed;
                        if let Err(e) = self.memory.increment_healed() {
                            warn!(error = %e, "failed to bump healed counter");
                        }
                    }
                    None => analysis.reason = FailureReason::ElementMissing,
                },
                _ => analysis.reason = FailureReason::ElementMissing,
            }
        }

        if let Err(e) = self.memory.record_failure(
            ctx.run_id,
            ctx.action_id,
            analysis.reason,
            analysis.healed,
            &analysis.notes,
        ) {
            warn!(error = %e, "failed to record failure");
        }
        analysis
    }
}

/// Compare the remembered element with the live tree
fn drift(expected: &ElementRecord, tree: &UiNode) -> Option<FailureAnalysis> {
    if !expected.text.is_empty() {
        let best = tree
            .iter()
            .filter(|n| !n.text.is_empty())
            .map(|n| (n, TextDiff::from_chars(expected.text.as_str(), n.text.as_str()).ratio()))
            .fold(None::<(&UiNode, f32)>, |best, cand| match best {
                Some(b) if b.1 >= cand.1 => Some(b),
                _ => Some(cand),
            });
        if let Some((node, ratio)) = best {
            if ratio > TEXT_DRIFT_RATIO {
                return Some(FailureAnalysis {
                    reason: FailureReason::TextChanged,
                    healed: true,
                    notes: format!(
                        "Label drift detected: '{}' -> '{}' (Ratio: {:.2})",
                        expected.text, node.text, ratio
                    ),
                    suggested_fix: Some(LocatorFix::Text(node.text.clone())),
                });
            }
        }
    }

    if !expected.resource_id.is_empty() && tree.iter().any(|n| n.resource_id == expected.resource_id) {
        return Some(FailureAnalysis {
            reason: FailureReason::ElementMoved,
            healed: true,
            notes: "Element found via Resource ID but text or position may have changed.".to_string(),
            suggested_fix: Some(LocatorFix::ResourceId(expected.resource_id.clone())),
        });
    }
    None
}

// ============================================================================
// LLM advisor
// ============================================================================

const ADVISOR_PROMPT: &str = r#"You are an expert mobile QA automation engineer.
Analyze a test failure and determine the root cause.

You get:
1. The FAILED STEP (what was attempted).
2. The ERROR MESSAGE (what went wrong).
3. The HIERARCHY (current screen state).
4. The HISTORY (previous steps executed).

Classify the failure into one of:
- LOCATOR_CHANGED: the element exists but attributes changed (e.g. text drift).
- ELEMENT_MISSING: the element is gone from the screen.
- SCREEN_MISMATCH: the app is on a different screen.
- APP_CRASH: the app crashed (popup visible or process died).
- LOADING_ISSUE: infinite spinner or network timeout.
- POPUP_BLOCKING: a modal or dialog blocks the target.

OUTPUT FORMAT (strict JSON):
{
    "failure_type": "LOCATOR_CHANGED",
    "root_cause": "The button text changed from 'Save' to 'Submit'.",
    "confidence": 0.95,
    "suggested_fix": {"action": "replace_locator", "locator_type": "text", "value": "Submit"}
}
If no fix is possible, set suggested_fix to null."#;

/// Advisor verdict
#[derive(Debug, Clone, PartialEq)]
pub struct AiDiagnosis {
    pub failure_type: String,
    pub root_cause: String,
    pub confidence: f64,
    pub suggested_fix: Option<LocatorFix>,
}

/// One executed step, as shown to the advisor
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: String,
}

pub struct AiAdvisor<'l> {
    llm: &'l dyn LlmService,
}

impl<'l> AiAdvisor<'l> {
    pub fn new(llm: &'l dyn LlmService) -> Self {
        Self { llm }
    }

    pub fn diagnose(
        &self,
        step: &str,
        error: &str,
        tree: Option<&UiNode>,
        history: &[HistoryEntry],
    ) -> Option<AiDiagnosis> {
        if !self.llm.is_configured() {
            return None;
        }
        let hierarchy = tree
            .and_then(|t| serde_json::to_string(t).ok())
            .unwrap_or_default();
        let recent = &history[history.len().saturating_sub(HISTORY_WINDOW)..];
        let user = format!(
            "FAILED STEP:\n{}\n\nERROR MESSAGE:\n{}\n\nPREVIOUS {} STEPS:\n{}\n\nCURRENT HIERARCHY (Snippet):\n{}",
            step,
            error,
            HISTORY_WINDOW,
            serde_json::to_string(recent).unwrap_or_default(),
            snippet(&hierarchy, HIERARCHY_SNIPPET_CHARS),
        );
        let reply = self.llm.ask_json(ADVISOR_PROMPT, &user, None)?;
        let diagnosis = parse_diagnosis(&reply);
        debug!(?diagnosis, "advisor replied");
        diagnosis
    }
}

fn snippet(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn parse_diagnosis(reply: &Value) -> Option<AiDiagnosis> {
    let failure_type = reply["failure_type"].as_str()?.to_string();
    let suggested_fix = match &reply["suggested_fix"] {
        Value::Object(fix) if fix.get("action").and_then(Value::as_str) == Some("replace_locator") => {
            let value = fix.get("value").and_then(Value::as_str).map(str::to_string);
            let kind = fix.get("locator_type").and_then(Value::as_str).unwrap_or("text");
            match value {
                Some(v) if !v.is_empty() && kind == "text" => Some(LocatorFix::Text(v)),
                Some(v) if !v.is_empty() && kind.contains("id") => Some(LocatorFix::ResourceId(v)),
                _ => None,
            }
        }
        _ => None,
    };
    Some(AiDiagnosis {
        failure_type,
        root_cause: reply["root_cause"].as_str().unwrap_or_default().to_string(),
        confidence: reply["confidence"].as_f64().unwrap_or(0.0),
        suggested_fix,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::Bounds;
    use crate::llm::LlmResult;
    use pretty_assertions::assert_eq;

    fn node(text: &str, rid: &str) -> UiNode {
        UiNode {
            text: text.into(),
            resource_id: rid.into(),
            class_name: "android.widget.Button".into(),
            clickable: true,
            bounds: Some(Bounds::new(0, 0, 100, 40)),
            ..UiNode::default()
        }
    }

    fn tree(children: Vec<UiNode>) -> UiNode {
        UiNode {
            children,
            ..UiNode::default()
        }
    }

    fn ctx<'a>(query: &'a str, error: &'a str, tree: &'a UiNode) -> FailureContext<'a> {
        FailureContext {
            run_id: "r1",
            action_id: "a1",
            query: Some(query),
            error,
            screen_hash: "s1",
            tree: Some(tree),
        }
    }

    #[test]
    fn test_crash_markers() {
        assert!(is_crash_text("FATAL EXCEPTION: main"));
        assert!(is_crash_text("ANR in com.example"));
        assert!(!is_crash_text("app CRASHED"));
        assert!(!is_crash_text("Element not found: Login"));
        assert!(!is_crash_text("Element not found: Crash reports (index: none) after 20s."));
    }

    #[test]
    fn test_text_drift_heals_with_text_fix() {
        let memory = MemoryStore::in_memory();
        memory
            .remember_interaction("s1", "Continue", Some(&node("Continue", "")), "r0", true)
            .unwrap();
        let live = tree(vec![node("Continue >", "")]);

        let analysis = FailureAnalyzer::new(&memory).analyze(&ctx("Continue", "Element not found: Continue", &live));
        assert_eq!(analysis.reason, FailureReason::TextChanged);
        assert!(analysis.healed);
        assert_eq!(analysis.suggested_fix, Some(LocatorFix::Text("Continue >".into())));
        assert_eq!(memory.healed_count(), 1);
        assert_eq!(memory.snapshot().failures.len(), 1);
    }

    #[test]
    fn test_same_resource_id_is_element_moved() {
        let memory = MemoryStore::in_memory();
        memory
            .remember_interaction("s1", "Pay", Some(&node("Pay", "com.shop:id/pay")), "r0", true)
            .unwrap();
        let live = tree(vec![node("Checkout now", "com.shop:id/pay")]);

        let analysis = FailureAnalyzer::new(&memory).analyze(&ctx("Pay", "timeout waiting for Pay", &live));
        assert_eq!(analysis.reason, FailureReason::ElementMoved);
        assert_eq!(
            analysis.suggested_fix,
            Some(LocatorFix::ResourceId("com.shop:id/pay".into()))
        );
    }

    #[test]
    fn test_unknown_element_is_missing_and_crash_short_circuits() {
        let memory = MemoryStore::in_memory();
        let live = tree(vec![node("Other", "")]);
        let analyzer = FailureAnalyzer::new(&memory);

        let missing = analyzer.analyze(&ctx("Ghost", "Element not found: Ghost", &live));
        assert_eq!(missing.reason, FailureReason::ElementMissing);
        assert!(!missing.healed);

        let crash = analyzer.analyze(&ctx("Ghost", "FATAL EXCEPTION: main", &live));
        assert_eq!(crash.reason, FailureReason::AppCrash);

        let other = analyzer.analyze(&ctx("Ghost", "device offline", &live));
        assert_eq!(other.reason, FailureReason::Unknown);
        assert_eq!(memory.snapshot().failures.len(), 3);
        assert_eq!(memory.healed_count(), 0);
    }

    #[test]
    fn test_crash_wording_only_labels_non_lookup_errors() {
        let memory = MemoryStore::in_memory();
        let live = tree(vec![node("Other", "")]);
        let analyzer = FailureAnalyzer::new(&memory);

        let lookup = analyzer.analyze(&ctx(
            "Crash reports",
            "Element not found: Crash reports (index: none) after 20s.",
            &live,
        ));
        assert_eq!(lookup.reason, FailureReason::ElementMissing);

        let disabled = analyzer.analyze(&ctx("Crash log", "Element is disabled: Crash log", &live));
        assert_ne!(disabled.reason, FailureReason::AppCrash);

        let device = analyzer.analyze(&ctx("Save", "Device error: process crashed", &live));
        assert_eq!(device.reason, FailureReason::AppCrash);
    }

    struct Canned(&'static str);

    impl LlmService for Canned {
        fn is_configured(&self) -> bool {
            true
        }

        fn complete(&self, _: &str, user: &str, _: Option<&[u8]>) -> LlmResult<String> {
            assert!(user.contains("FAILED STEP:\ntapOn: Save"));
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn test_advisor_parses_replace_locator() {
        let llm = Canned(
            r#"```json
{"failure_type": "LOCATOR_CHANGED", "root_cause": "renamed", "confidence": 0.9,
 "suggested_fix": {"action": "replace_locator", "locator_type": "resource_id", "value": "com.app:id/save"}}
```"#,
        );
        let history: Vec<HistoryEntry> = (0..8)
            .map(|i| HistoryEntry {
                step: format!("step {}", i),
                result: Some("ok".into()),
                error: None,
                status: "completed".into(),
            })
            .collect();
        let diagnosis = AiAdvisor::new(&llm)
            .diagnose("tapOn: Save", "Element not found: Save", None, &history)
            .unwrap();
        assert_eq!(diagnosis.failure_type, "LOCATOR_CHANGED");
        assert_eq!(
            diagnosis.suggested_fix,
            Some(LocatorFix::ResourceId("com.app:id/save".into()))
        );
    }

    #[test]
    fn test_snippet_respects_char_boundaries() {
        assert_eq!(snippet("héllo", 2), "hé");
        assert_eq!(snippet("abc", 10), "abc");
    }
}
