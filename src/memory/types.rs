//! Records persisted by the memory store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hierarchy::Bounds;

/// Execution mode of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunMode {
    /// Full resolution, outcomes recorded
    Learn,
    /// Trust step memory for taps
    Fast,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Learn => write!(f, "LEARN"),
            RunMode::Fast => write!(f, "FAST"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Pass,
    Fail,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "RUNNING"),
            RunStatus::Pass => write!(f, "PASS"),
            RunStatus::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub test_name: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_time_ms: u64,
    #[serde(default)]
    pub confidence_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenRecord {
    pub screen_id: String,
    pub visit_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_seen_run: String,
}

/// Locator kind that identifies an element most reliably
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferredLocator {
    Text,
    ResourceId,
    ContentDesc,
    Coordinate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementRecord {
    pub element_id: String,
    pub screen_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub resource_id: String,
    #[serde(default)]
    pub content_desc: String,
    #[serde(default)]
    pub class_name: String,
    #[serde(default)]
    pub bounds: Option<Bounds>,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub fail_count: u64,
    #[serde(default = "default_rate")]
    pub success_rate: f64,
    pub preferred_locator: PreferredLocator,
    #[serde(default)]
    pub last_success_run: Option<String>,
}

fn default_rate() -> f64 {
    1.0
}

impl ElementRecord {
    /// Whether this element answers to `query` by exact text or resource id
    pub fn matches(&self, query: &str) -> bool {
        (!self.text.is_empty() && self.text == query)
            || (!self.resource_id.is_empty() && self.resource_id == query)
    }

    /// Apply one interaction outcome and recompute the success rate
    pub fn record_outcome(&mut self, success: bool, run_id: &str) {
        if success {
            self.success_count += 1;
            self.last_success_run = Some(run_id.to_string());
        } else {
            self.fail_count += 1;
        }
        let total = self.success_count + self.fail_count;
        self.success_rate = if total > 0 {
            self.success_count as f64 / total as f64
        } else {
            1.0
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionStatus {
    Success,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action_id: String,
    pub run_id: String,
    pub action_type: String,
    pub intent: String,
    #[serde(default)]
    pub element_id: Option<String>,
    pub status: ActionStatus,
    #[serde(default)]
    pub execution_time_ms: u64,
}

/// Failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    #[serde(rename = "TEXT_CHANGED", alias = "LOCATOR_CHANGED")]
    TextChanged,
    #[serde(rename = "ELEMENT_MOVED")]
    ElementMoved,
    #[serde(rename = "ELEMENT_MISSING")]
    ElementMissing,
    #[serde(rename = "APP_CRASH")]
    AppCrash,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::TextChanged => "TEXT_CHANGED",
            FailureReason::ElementMoved => "ELEMENT_MOVED",
            FailureReason::ElementMissing => "ELEMENT_MISSING",
            FailureReason::AppCrash => "APP_CRASH",
            FailureReason::Unknown => "UNKNOWN",
        }
    }

    /// Plain-language explanation for reports
    pub fn describe(&self) -> &'static str {
        match self {
            FailureReason::ElementMissing => "Could not find the element on screen",
            FailureReason::TextChanged => "Element text has changed from expected value",
            FailureReason::ElementMoved => "Element position has changed",
            FailureReason::AppCrash => "Application crashed or became unresponsive",
            FailureReason::Unknown => "Unexpected error occurred",
        }
    }

    pub fn parse(raw: &str) -> FailureReason {
        match raw.trim().to_ascii_uppercase().as_str() {
            "TEXT_CHANGED" | "LOCATOR_CHANGED" => FailureReason::TextChanged,
            "ELEMENT_MOVED" => FailureReason::ElementMoved,
            "ELEMENT_MISSING" => FailureReason::ElementMissing,
            "APP_CRASH" => FailureReason::AppCrash,
            _ => FailureReason::Unknown,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub failure_id: String,
    pub run_id: String,
    pub action_id: String,
    pub reason: FailureReason,
    #[serde(default)]
    pub healed: bool,
    #[serde(default)]
    pub auto_fix_applied: bool,
    #[serde(default)]
    pub notes: String,
}

/// Where a step last interacted successfully
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMemory {
    pub bounds: Bounds,
    pub last_updated: DateTime<Utc>,
}

/// The whole persisted document. Missing sections load as empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryDocument {
    pub screens: BTreeMap<String, ScreenRecord>,
    /// screen_id -> element_id -> element
    pub elements: BTreeMap<String, BTreeMap<String, ElementRecord>>,
    pub runs: Vec<RunRecord>,
    pub actions: Vec<ActionRecord>,
    pub failures: Vec<FailureRecord>,
    /// `test_name|step_index` -> step memory
    pub step_memory: BTreeMap<String, StepMemory>,
    pub healed_count: u64,
}

impl MemoryDocument {
    pub fn total_visits(&self) -> u64 {
        self.screens.values().map(|s| s.visit_count).sum()
    }

    pub fn run(&self, run_id: &str) -> Option<&RunRecord> {
        self.runs.iter().find(|r| r.run_id == run_id)
    }
}
