//! Engine error taxonomy.

use std::time::Duration;

use thiserror::Error;

use crate::device::DeviceError;
use crate::flow::FlowError;
use crate::memory::{FailureReason, MemoryError};

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised while acquiring the UI, resolving elements and dispatching steps
#[derive(Debug, Error)]
pub enum EngineError {
    /// Resolver and wait loop exhausted; recoverable through healing
    #[error("Element not found: {query} (index: {}) after {}s. Analysis: {analysis}", fmt_index(.index), .waited.as_secs_f64())]
    NotFound {
        query: String,
        index: Option<usize>,
        waited: Duration,
        analysis: String,
    },

    /// Neither the primary dump nor the secondary hierarchy path produced a tree
    #[error("Hierarchy acquisition failed: {0}")]
    Acquisition(String),

    /// Element resolved but not interactable; never auto-healed
    #[error("Element is disabled: {0}")]
    Disabled(String),

    /// Element unexpectedly present or absent
    #[error("{0}")]
    AssertionViolation(String),

    /// Error text matched crash heuristics
    #[error("Application crash detected: {0}")]
    Crash(String),

    /// Step failed after every retry and heal
    #[error("Step '{step}' failed ({reason:?}): {source}")]
    StepExecution {
        step: String,
        reason: FailureReason,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Run cancelled before step {0}")]
    Cancelled(usize),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether bounded retry policies may run the operation again
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            EngineError::Disabled(_)
                | EngineError::Crash(_)
                | EngineError::AssertionViolation(_)
                | EngineError::Cancelled(_)
        )
    }

    /// The innermost error, looking through `StepExecution` wrappers
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::StepExecution { source, .. } => source.root(),
            other => other,
        }
    }
}

fn fmt_index(index: &Option<usize>) -> String {
    index.map(|i| i.to_string()).unwrap_or_else(|| "None".to_string())
}
