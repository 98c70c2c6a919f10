//! Interaction-aware hierarchy cache.
//!
//! A cached tree is only ever served while it is newer than the last
//! UI-changing interaction. The TTL path additionally bounds its age.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use super::node::UiNode;

/// A tree captured at a known instant
#[derive(Debug, Clone)]
pub struct CachedTree {
    pub tree: Arc<UiNode>,
    pub captured_at: Instant,
    pub screen_hash: String,
}

/// Per-run hierarchy cache plus the interaction clock
#[derive(Debug, Default)]
pub struct HierarchyCache {
    entry: Option<CachedTree>,
    last_interaction_at: Option<Instant>,
}

impl HierarchyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a UI-changing action; every earlier capture becomes stale
    pub fn mark_interaction(&mut self) {
        self.mark_interaction_at(Instant::now());
    }

    pub fn mark_interaction_at(&mut self, at: Instant) {
        self.last_interaction_at = Some(match self.last_interaction_at {
            Some(prev) if prev > at => prev,
            _ => at,
        });
    }

    pub fn last_interaction_at(&self) -> Option<Instant> {
        self.last_interaction_at
    }

    /// Store a capture. `captured_at` should be taken before the dump started.
    pub fn store(&mut self, tree: Arc<UiNode>, screen_hash: String, captured_at: Instant) {
        self.entry = Some(CachedTree {
            tree,
            captured_at,
            screen_hash,
        });
    }

    fn fresh_entry(&self) -> Option<&CachedTree> {
        let entry = self.entry.as_ref()?;
        match self.last_interaction_at {
            Some(interaction) if entry.captured_at <= interaction => None,
            _ => Some(entry),
        }
    }

    /// Smart-cache lookup: any capture newer than the last interaction
    pub fn smart_hit(&self) -> Option<&CachedTree> {
        let hit = self.fresh_entry();
        if hit.is_some() {
            debug!("hierarchy smart-cache hit");
        }
        hit
    }

    /// TTL lookup: a fresh capture younger than `ttl`
    pub fn ttl_hit(&self, ttl: Duration) -> Option<&CachedTree> {
        self.fresh_entry()
            .filter(|entry| entry.captured_at.elapsed() < ttl)
    }

    /// Hash of the cached screen, only while it is still fresh
    pub fn current_screen_hash(&self) -> Option<&str> {
        self.fresh_entry().map(|e| e.screen_hash.as_str())
    }

    /// Drop the cached tree
    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Arc<UiNode> {
        Arc::new(UiNode::empty())
    }

    #[test]
    fn test_smart_hit_requires_capture_after_interaction() {
        let mut cache = HierarchyCache::new();
        let t0 = Instant::now();
        cache.store(tree(), "h1".into(), t0);
        assert!(cache.smart_hit().is_some());

        cache.mark_interaction_at(t0 + Duration::from_millis(1));
        assert!(cache.smart_hit().is_none());
        assert!(cache.current_screen_hash().is_none());

        cache.store(tree(), "h2".into(), t0 + Duration::from_millis(2));
        assert_eq!(cache.current_screen_hash(), Some("h2"));
    }

    #[test]
    fn test_ttl_hit_respects_age() {
        let mut cache = HierarchyCache::new();
        cache.store(tree(), "h".into(), Instant::now());
        assert!(cache.ttl_hit(Duration::from_secs(3)).is_some());
        assert!(cache.ttl_hit(Duration::ZERO).is_none());
    }

    #[test]
    fn test_interaction_clock_is_monotonic() {
        let mut cache = HierarchyCache::new();
        let t0 = Instant::now();
        cache.mark_interaction_at(t0 + Duration::from_secs(1));
        cache.mark_interaction_at(t0);
        assert_eq!(cache.last_interaction_at(), Some(t0 + Duration::from_secs(1)));
    }
}
