//! Operation kind to handler mapping.

use std::collections::HashMap;
use std::sync::Arc;

use super::context::RunContext;
use super::{Engine, handlers};
use crate::error::EngineResult;
use crate::flow::{OpKind, Operation};

/// Executes one kind of operation and returns a human-readable result line
pub trait StepHandler: Send + Sync {
    fn execute(&self, engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String>;
}

impl<F> StepHandler for F
where
    F: Fn(&Engine, &mut RunContext, &Operation) -> EngineResult<String> + Send + Sync,
{
    fn execute(&self, engine: &Engine, run: &mut RunContext, op: &Operation) -> EngineResult<String> {
        self(engine, run, op)
    }
}

/// Handlers keyed by operation kind
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<OpKind, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a handler for every built-in operation kind
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        handlers::register_defaults(&mut registry);
        registry
    }

    /// Add or replace the handler for `kind`
    pub fn register(&mut self, kind: OpKind, handler: impl StepHandler + 'static) {
        self.handlers.insert(kind, Arc::new(handler));
    }

    pub fn get(&self, kind: OpKind) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: OpKind) -> bool {
        self.handlers.contains_key(&kind)
    }
}
