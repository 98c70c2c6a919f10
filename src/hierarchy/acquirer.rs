//! Hierarchy acquisition with a circuit breaker over the primary dump path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::cache::HierarchyCache;
use super::node::{UiNode, screen_hash};
use crate::device::DeviceBridge;
use crate::error::{EngineError, EngineResult};
use crate::memory::MemoryStore;

/// Consecutive primary failures that disable the primary path
pub const BREAKER_THRESHOLD: u32 = 3;

/// Cache behaviour for one acquisition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Skip both cache checks
    pub force_refresh: bool,
    /// Serve any capture newer than the last interaction, regardless of age
    pub smart_cache: bool,
}

impl AcquireOptions {
    pub fn fresh() -> Self {
        Self {
            force_refresh: true,
            smart_cache: false,
        }
    }

    pub fn smart() -> Self {
        Self {
            force_refresh: false,
            smart_cache: true,
        }
    }
}

/// A tree together with its structural hash
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    pub tree: Arc<UiNode>,
    pub screen_hash: String,
}

/// Obtains normalized UI trees from the device
pub struct HierarchyAcquirer {
    device: Arc<dyn DeviceBridge>,
    memory: Arc<MemoryStore>,
    primary_failures: AtomicU32,
    cache_ttl: Duration,
    retry_pause: Duration,
}

impl HierarchyAcquirer {
    pub fn new(
        device: Arc<dyn DeviceBridge>,
        memory: Arc<MemoryStore>,
        cache_ttl: Duration,
        retry_pause: Duration,
    ) -> Self {
        Self {
            device,
            memory,
            primary_failures: AtomicU32::new(0),
            cache_ttl,
            retry_pause,
        }
    }

    /// Whether the breaker has disabled the primary path
    pub fn primary_disabled(&self) -> bool {
        self.primary_failures.load(Ordering::SeqCst) >= BREAKER_THRESHOLD
    }

    pub fn primary_failures(&self) -> u32 {
        self.primary_failures.load(Ordering::SeqCst)
    }

    /// Acquire a tree, honouring `cache` according to `opts`.
    ///
    /// Every fresh capture is reported to memory and stored in the cache.
    pub fn acquire(
        &self,
        cache: &mut HierarchyCache,
        run_id: &str,
        opts: AcquireOptions,
    ) -> EngineResult<TreeSnapshot> {
        if !opts.force_refresh {
            let smart = opts.smart_cache.then(|| cache.smart_hit()).flatten();
            let hit = smart.or_else(|| cache.ttl_hit(self.cache_ttl));
            if let Some(entry) = hit {
                return Ok(TreeSnapshot {
                    tree: Arc::clone(&entry.tree),
                    screen_hash: entry.screen_hash.clone(),
                });
            }
        }

        let started = Instant::now();
        let tree = self.capture()?;
        let hash = screen_hash(&tree);

        if let Err(e) = self.memory.learn_screen(&hash, run_id, &tree) {
            warn!(error = %e, "failed to record screen visit");
        }

        let tree = Arc::new(tree);
        cache.store(Arc::clone(&tree), hash.clone(), started);
        debug!(screen = %short(&hash), elapsed = ?started.elapsed(), "hierarchy acquired");
        Ok(TreeSnapshot {
            tree,
            screen_hash: hash,
        })
    }

    fn capture(&self) -> EngineResult<UiNode> {
        if !self.primary_disabled() {
            match self.primary() {
                Ok(tree) => {
                    self.primary_failures.store(0, Ordering::SeqCst);
                    return Ok(tree);
                }
                Err(reason) => {
                    let failures = self.primary_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if failures >= BREAKER_THRESHOLD {
                        warn!(failures, "primary hierarchy dump unstable, disabling it for this session");
                    } else {
                        info!(failures, %reason, "primary hierarchy dump failed, using secondary path");
                    }
                }
            }
        }
        self.secondary()
    }

    /// uiautomator dump, retried once after killing a stuck helper
    fn primary(&self) -> Result<UiNode, String> {
        let first = self.dump_and_parse();
        if first.is_ok() {
            return first;
        }
        debug!(error = ?first.err(), "dump failed, killing helper and retrying");
        let _ = self.device.kill_dump_helper();
        if !self.retry_pause.is_zero() {
            thread::sleep(self.retry_pause);
        }
        self.dump_and_parse()
    }

    fn dump_and_parse(&self) -> Result<UiNode, String> {
        let xml = self.device.dump_ui_tree().map_err(|e| e.to_string())?;
        UiNode::from_uiautomator_xml(&xml)
    }

    fn secondary(&self) -> EngineResult<UiNode> {
        let json = self
            .device
            .external_hierarchy()
            .map_err(|e| EngineError::Acquisition(format!("secondary hierarchy path failed: {}", e)))?;
        UiNode::from_external_json(&json).map_err(|e| {
            EngineError::Acquisition(format!("secondary hierarchy is not parseable: {}", e))
        })
    }
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(8)]
}
