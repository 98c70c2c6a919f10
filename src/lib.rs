//! ratt - resilient mobile UI automation.
//!
//! This crate provides:
//! - A device bridge over `adb`, plus a scripted in-memory device for tests
//! - UI hierarchy acquisition with a circuit breaker and an interaction-aware cache
//! - A scoring element resolver over literal and `regexp:` locators
//! - A healing chain: memory recall, geometric successor, semantic and vision fallbacks
//! - A persistent memory of screens, elements, runs and per-step coordinates
//! - A step dispatcher and flow orchestrator for Maestro-style YAML flows
//!
//! # Example
//!
//! ```rust,no_run
//! use ratt::{CancelToken, Engine, parse_flow};
//!
//! let engine = Engine::from_config().unwrap();
//! let flow = parse_flow(&std::fs::read_to_string("login.yaml").unwrap()).unwrap();
//! let outcome = engine
//!     .run_flow(&flow, &flow.test_name(Some("login")), &CancelToken::new(), |event| println!("{}", event))
//!     .unwrap();
//! assert!(outcome.passed());
//! ```

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod flow;
pub mod healer;
pub mod healing;
pub mod hierarchy;
pub mod llm;
pub mod memory;
pub mod resolver;
pub mod session;

// Re-export the engine surface
pub use engine::{
    CancelToken, Engine, FileOutcome, FlowEvent, HandlerRegistry, RunContext, RunOutcome, StepHandler,
    StepOutcome, StepStatus,
};
pub use error::{EngineError, EngineResult};

// Re-export device bridges
pub use device::{AdbBridge, DeviceBridge, DeviceError, ScriptedDevice};

// Re-export flows
pub use flow::{Flow, FlowError, OpKind, Operation, Step, parse_flow};

// Re-export hierarchy and resolution
pub use hierarchy::{Bounds, UiNode};
pub use resolver::{Query, resolve};

// Re-export memory
pub use memory::{MemoryStore, RunMode, RunStatus};

// Re-export LLM services
pub use llm::{ChatClient, LlmService, NoLlm};

pub use session::Session;
