//! Declarative flows: YAML parsing into typed step operations.

pub mod parse;
pub mod step;

use thiserror::Error;

pub use parse::{Flow, Step, parse_flow};
pub use step::{
    Direction, Locator, OpKind, Operation, PointSpec, SKIPPED_COMMANDS, TapParams, Target,
    key_code,
};

/// Errors raised while parsing or validating a flow
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("flow has no steps")]
    Empty,

    #[error("flow body must be a list of steps")]
    NotAList,

    #[error("step {index}: unknown command '{name}'")]
    UnknownCommand { index: usize, name: String },

    #[error("{op}: {message}")]
    InvalidParams { op: String, message: String },
}
