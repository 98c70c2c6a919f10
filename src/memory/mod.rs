//! Learning memory: screens, elements, runs, actions, failures and step recall.

pub mod report;
pub mod store;
pub mod types;

pub use report::{RunReport, Suggestion, SuggestionKind, build_report, suggestions};
pub use store::{MemoryError, MemoryResult, MemoryStore, calculate_confidence, element_id};
pub use types::{
    ActionRecord, ActionStatus, ElementRecord, FailureReason, FailureRecord, MemoryDocument,
    PreferredLocator, RunMode, RunRecord, RunStatus, ScreenRecord, StepMemory,
};
