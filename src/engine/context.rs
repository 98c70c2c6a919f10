//! Per-run execution state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::hierarchy::HierarchyCache;
use crate::memory::RunMode;
use crate::session::Session;

/// State scoped to one run: identity, mode, hierarchy cache and artifacts.
///
/// Nothing here is process-global, so independent runs never share a cache
/// or an interaction clock.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: String,
    pub test_name: String,
    pub mode: RunMode,
    /// Index of the step being dispatched, for step memory
    pub step_index: Option<usize>,
    pub cache: HierarchyCache,
    pub session: Option<Session>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, test_name: impl Into<String>, mode: RunMode) -> Self {
        Self {
            run_id: run_id.into(),
            test_name: test_name.into(),
            mode,
            step_index: None,
            cache: HierarchyCache::new(),
            session: None,
        }
    }

    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    /// Record that the UI may have changed
    pub fn mark_interaction(&mut self) {
        self.cache.mark_interaction();
    }
}

/// Cooperative cancellation, checked between steps
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_mark_interaction_invalidates_smart_hits() {
        let mut ctx = RunContext::new("r1", "login", RunMode::Learn);
        assert!(ctx.cache.last_interaction_at().is_none());
        ctx.mark_interaction();
        assert!(ctx.cache.last_interaction_at().is_some());
    }
}
