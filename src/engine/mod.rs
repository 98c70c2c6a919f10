//! Resilient execution engine.
//!
//! - [`wait`]: two-phase bounded locator wait with the healing chain
//! - [`handlers`]: one handler per operation kind
//! - [`registry`]: operation kind to handler mapping
//! - [`dispatcher`]: per-step retry, failure analysis and fix application
//! - [`orchestrator`]: run lifecycle, progress events and outcomes

pub mod context;
pub mod dispatcher;
pub mod handlers;
pub mod orchestrator;
pub mod registry;
pub mod wait;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::warn;

pub use context::{CancelToken, RunContext};
pub use dispatcher::{MAX_DISPATCH_ATTEMPTS, StepOutcome, StepStatus, dispatch_step};
pub use orchestrator::{FileOutcome, FlowEvent, RunOutcome, select_mode};
pub use registry::{HandlerRegistry, StepHandler};
pub use wait::{Resolved, ResolutionSource, wait_for_element};

use crate::config::{self, WaitPolicy};
use crate::device::{AdbBridge, DeviceBridge};
use crate::error::EngineResult;
use crate::hierarchy::{AcquireOptions, HierarchyAcquirer, TreeSnapshot};
use crate::llm::{self, LlmService};
use crate::memory::MemoryStore;

/// Shared services of the engine: device, memory, LLM, acquisition and handlers
pub struct Engine {
    device: Arc<dyn DeviceBridge>,
    memory: Arc<MemoryStore>,
    llm: Arc<dyn LlmService>,
    acquirer: HierarchyAcquirer,
    policy: WaitPolicy,
    registry: HandlerRegistry,
    artifact_root: PathBuf,
}

impl Engine {
    pub fn new(
        device: Arc<dyn DeviceBridge>,
        memory: Arc<MemoryStore>,
        llm: Arc<dyn LlmService>,
        policy: WaitPolicy,
    ) -> Self {
        let acquirer = HierarchyAcquirer::new(
            Arc::clone(&device),
            Arc::clone(&memory),
            policy.cache_ttl,
            policy.dump_retry_pause,
        );
        Self {
            device,
            memory,
            llm,
            acquirer,
            policy,
            registry: HandlerRegistry::with_defaults(),
            artifact_root: config::artifact_dir(),
        }
    }

    /// Engine over `adb`, the configured memory document and LLM
    pub fn from_config() -> EngineResult<Self> {
        let memory = MemoryStore::open(config::memory_path())?;
        Ok(Self::new(
            Arc::new(AdbBridge::default()),
            Arc::new(memory),
            llm::from_config(),
            config::get().wait.clone(),
        ))
    }

    /// Directory under which per-run artifact sessions are created
    pub fn with_artifact_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifact_root = root.into();
        self
    }

    pub fn device(&self) -> &dyn DeviceBridge {
        self.device.as_ref()
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn llm(&self) -> &dyn LlmService {
        self.llm.as_ref()
    }

    pub fn policy(&self) -> &WaitPolicy {
        &self.policy
    }

    pub fn artifact_root(&self) -> &Path {
        &self.artifact_root
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Handler registry, for adding or replacing operation handlers
    pub fn registry_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.registry
    }

    /// Acquire the current tree through the run's cache
    pub fn acquire(&self, run: &mut RunContext, opts: AcquireOptions) -> EngineResult<TreeSnapshot> {
        self.acquirer.acquire(&mut run.cache, &run.run_id, opts)
    }

    /// Screenshot into the run's artifact session. Failures are logged only.
    pub fn capture_artifact(&self, run: &RunContext, name: &str) -> Option<PathBuf> {
        let session = run.session.as_ref()?;
        let png = self
            .device
            .screenshot()
            .map_err(|e| warn!(name, error = %e, "artifact screenshot failed"))
            .ok()?;
        session
            .save_screenshot(name, &png)
            .map_err(|e| warn!(name, error = %e, "failed to store artifact"))
            .ok()
    }

    pub(crate) fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}
