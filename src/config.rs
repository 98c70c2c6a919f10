//! Configuration management with environment variable support.
//!
//! This module provides centralized configuration for ratt, supporting:
//! - Environment variables for all configurable values
//! - Defaults tuned for a locally attached Android device
//! - A `WaitPolicy` that gathers every engine timing knob in one place
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `RATT_ADB_PATH` | adb executable | `adb` |
//! | `RATT_DEVICE_SERIAL` | Device serial (falls back to `ANDROID_SERIAL`) | unset |
//! | `RATT_ADB_TIMEOUT` | Timeout for a single adb call (seconds) | `30` |
//! | `RATT_MAESTRO_PATH` | maestro executable (secondary hierarchy path) | `maestro` |
//! | `RATT_MAESTRO_TIMEOUT` | Timeout for `maestro hierarchy` (seconds) | `30` |
//! | `RATT_MEMORY_PATH` | Memory store document | `./intelligent_memory.json` |
//! | `RATT_ARTIFACT_DIR` | Base directory for run artifacts | `/tmp/ratt` |
//! | `RATT_LLM_ENDPOINT` | Chat completions endpoint | `https://api.openai.com/v1/chat/completions` |
//! | `RATT_LLM_MODEL` | Model name | `gpt-4o` |
//! | `RATT_OPENAI_KEY` | LLM key (then `OPENAI_API_KEY`, then `GOOGLE_API_KEY`) | unset |
//! | `RATT_LLM_TIMEOUT` | Total LLM request timeout (seconds) | `60` |
//! | `RATT_LLM_CONNECT_TIMEOUT` | LLM connection timeout (seconds) | `10` |
//! | `RATT_LLM_MAX_TOKENS` | Maximum tokens in LLM replies | `300` |
//! | `RATT_MIN_PHASE_SECS` | Minimum duration of one locator wait phase | `10` |
//! | `RATT_POLL_INTERVAL_MS` | Sleep between hierarchy polls | `300` |
//! | `RATT_CACHE_TTL_MS` | Hierarchy cache time-to-live | `3000` |
//!
//! # Example
//!
//! ```bash
//! export RATT_DEVICE_SERIAL=emulator-5554
//! export RATT_MEMORY_PATH=/var/lib/ratt/memory.json
//! ratt run flows/login.yaml
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Default Values
// ============================================================================

/// Default adb executable
pub const DEFAULT_ADB_PATH: &str = "adb";

/// Default timeout for one adb invocation (seconds)
pub const DEFAULT_ADB_TIMEOUT: u64 = 30;

/// Default maestro executable
pub const DEFAULT_MAESTRO_PATH: &str = "maestro";

/// Default timeout for `maestro hierarchy` (seconds)
pub const DEFAULT_MAESTRO_TIMEOUT: u64 = 30;

/// Default memory document path
pub const DEFAULT_MEMORY_PATH: &str = "./intelligent_memory.json";

/// Default artifact base directory
pub const DEFAULT_ARTIFACT_DIR: &str = "/tmp/ratt";

/// Default LLM endpoint
pub const DEFAULT_LLM_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

/// Default LLM model
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o";

/// Default total LLM request timeout (seconds)
pub const DEFAULT_LLM_TIMEOUT: u64 = 60;

/// Default LLM connection timeout (seconds)
pub const DEFAULT_LLM_CONNECT_TIMEOUT: u64 = 10;

/// Default max tokens for LLM replies
pub const DEFAULT_LLM_MAX_TOKENS: u32 = 300;

/// Default minimum duration of one locator wait phase (seconds)
pub const DEFAULT_MIN_PHASE_SECS: u64 = 10;

/// Default sleep between hierarchy polls (milliseconds)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 300;

/// Default hierarchy cache TTL (milliseconds)
pub const DEFAULT_CACHE_TTL_MS: u64 = 3000;

// ============================================================================
// Environment Variable Names
// ============================================================================

pub const ENV_ADB_PATH: &str = "RATT_ADB_PATH";
pub const ENV_DEVICE_SERIAL: &str = "RATT_DEVICE_SERIAL";
pub const ENV_ANDROID_SERIAL: &str = "ANDROID_SERIAL";
pub const ENV_ADB_TIMEOUT: &str = "RATT_ADB_TIMEOUT";
pub const ENV_MAESTRO_PATH: &str = "RATT_MAESTRO_PATH";
pub const ENV_MAESTRO_TIMEOUT: &str = "RATT_MAESTRO_TIMEOUT";
pub const ENV_MEMORY_PATH: &str = "RATT_MEMORY_PATH";
pub const ENV_ARTIFACT_DIR: &str = "RATT_ARTIFACT_DIR";
pub const ENV_LLM_ENDPOINT: &str = "RATT_LLM_ENDPOINT";
pub const ENV_LLM_MODEL: &str = "RATT_LLM_MODEL";
pub const ENV_LLM_TIMEOUT: &str = "RATT_LLM_TIMEOUT";
pub const ENV_LLM_CONNECT_TIMEOUT: &str = "RATT_LLM_CONNECT_TIMEOUT";
pub const ENV_LLM_MAX_TOKENS: &str = "RATT_LLM_MAX_TOKENS";
pub const ENV_MIN_PHASE_SECS: &str = "RATT_MIN_PHASE_SECS";
pub const ENV_POLL_INTERVAL_MS: &str = "RATT_POLL_INTERVAL_MS";
pub const ENV_CACHE_TTL_MS: &str = "RATT_CACHE_TTL_MS";

/// LLM key variables, in priority order
pub const ENV_LLM_KEYS: [&str; 3] = ["RATT_OPENAI_KEY", "OPENAI_API_KEY", "GOOGLE_API_KEY"];

// ============================================================================
// Configuration Getters (with caching)
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration (initialized from environment on first access)
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Centralized configuration for ratt
#[derive(Debug, Clone)]
pub struct Config {
    pub device: DeviceSettings,
    pub memory: MemorySettings,
    pub artifacts: ArtifactSettings,
    pub llm: LlmSettings,
    pub wait: WaitPolicy,
}

/// Device bridge settings
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub adb_path: String,
    pub serial: Option<String>,
    /// Timeout for a single adb call
    pub command_timeout: Duration,
    pub maestro_path: String,
    pub maestro_timeout: Duration,
}

/// Memory store settings
#[derive(Debug, Clone)]
pub struct MemorySettings {
    pub path: PathBuf,
}

/// Artifact (screenshot) settings
#[derive(Debug, Clone)]
pub struct ArtifactSettings {
    pub base_dir: PathBuf,
}

/// LLM settings
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: u64,
    pub connect_timeout: u64,
    pub max_tokens: u32,
}

/// Timing knobs of the step engine.
///
/// The defaults reproduce the production pacing: 10 s wait phases polled every
/// 300 ms, five tap attempts one second apart, three assertion attempts half a
/// second apart.
#[derive(Debug, Clone)]
pub struct WaitPolicy {
    /// Lower bound for a single wait phase
    pub min_phase: Duration,
    /// Sleep between hierarchy polls
    pub poll_interval: Duration,
    /// Pause between the two wait phases
    pub phase_pause: Duration,
    /// Fraction of phase one after which the semantic resolver may run
    pub semantic_after: f64,
    /// Hierarchy cache TTL
    pub cache_ttl: Duration,
    pub tap_attempts: u32,
    pub tap_backoff: Duration,
    pub assert_attempts: u32,
    pub assert_backoff: Duration,
    /// Default requested timeout for locator waits
    pub default_timeout: Duration,
    /// Requested timeout for optional taps and double/long presses
    pub short_timeout: Duration,
    pub launch_settle: Duration,
    pub scroll_settle: Duration,
    pub max_scrolls: u32,
    /// Upper bound for `waitForAnimationToEnd`
    pub animation_cap: Duration,
    /// Pause before re-dumping after a failed primary dump
    pub dump_retry_pause: Duration,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            device: DeviceSettings::from_env(),
            memory: MemorySettings::from_env(),
            artifacts: ArtifactSettings::from_env(),
            llm: LlmSettings::from_env(),
            wait: WaitPolicy::from_env(),
        }
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self {
            device: DeviceSettings::defaults(),
            memory: MemorySettings::defaults(),
            artifacts: ArtifactSettings::defaults(),
            llm: LlmSettings::defaults(),
            wait: WaitPolicy::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl DeviceSettings {
    pub fn from_env() -> Self {
        Self {
            adb_path: env::var(ENV_ADB_PATH).unwrap_or_else(|_| DEFAULT_ADB_PATH.to_string()),
            serial: env::var(ENV_DEVICE_SERIAL)
                .or_else(|_| env::var(ENV_ANDROID_SERIAL))
                .ok()
                .filter(|s| !s.is_empty()),
            command_timeout: Duration::from_secs(env_parse(ENV_ADB_TIMEOUT, DEFAULT_ADB_TIMEOUT)),
            maestro_path: env::var(ENV_MAESTRO_PATH)
                .unwrap_or_else(|_| DEFAULT_MAESTRO_PATH.to_string()),
            maestro_timeout: Duration::from_secs(env_parse(
                ENV_MAESTRO_TIMEOUT,
                DEFAULT_MAESTRO_TIMEOUT,
            )),
        }
    }

    pub fn defaults() -> Self {
        Self {
            adb_path: DEFAULT_ADB_PATH.to_string(),
            serial: None,
            command_timeout: Duration::from_secs(DEFAULT_ADB_TIMEOUT),
            maestro_path: DEFAULT_MAESTRO_PATH.to_string(),
            maestro_timeout: Duration::from_secs(DEFAULT_MAESTRO_TIMEOUT),
        }
    }
}

impl MemorySettings {
    pub fn from_env() -> Self {
        Self {
            path: env::var(ENV_MEMORY_PATH)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_MEMORY_PATH)),
        }
    }

    pub fn defaults() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_MEMORY_PATH),
        }
    }
}

impl ArtifactSettings {
    pub fn from_env() -> Self {
        Self {
            base_dir: env::var(ENV_ARTIFACT_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_ARTIFACT_DIR)),
        }
    }

    pub fn defaults() -> Self {
        Self {
            base_dir: PathBuf::from(DEFAULT_ARTIFACT_DIR),
        }
    }
}

impl LlmSettings {
    pub fn from_env() -> Self {
        Self {
            endpoint: env::var(ENV_LLM_ENDPOINT)
                .unwrap_or_else(|_| DEFAULT_LLM_ENDPOINT.to_string()),
            model: env::var(ENV_LLM_MODEL).unwrap_or_else(|_| DEFAULT_LLM_MODEL.to_string()),
            api_key: ENV_LLM_KEYS
                .iter()
                .find_map(|name| env::var(name).ok().filter(|v| !v.is_empty())),
            timeout: env_parse(ENV_LLM_TIMEOUT, DEFAULT_LLM_TIMEOUT),
            connect_timeout: env_parse(ENV_LLM_CONNECT_TIMEOUT, DEFAULT_LLM_CONNECT_TIMEOUT),
            max_tokens: env_parse(ENV_LLM_MAX_TOKENS, DEFAULT_LLM_MAX_TOKENS),
        }
    }

    pub fn defaults() -> Self {
        Self {
            endpoint: DEFAULT_LLM_ENDPOINT.to_string(),
            model: DEFAULT_LLM_MODEL.to_string(),
            api_key: None,
            timeout: DEFAULT_LLM_TIMEOUT,
            connect_timeout: DEFAULT_LLM_CONNECT_TIMEOUT,
            max_tokens: DEFAULT_LLM_MAX_TOKENS,
        }
    }
}

impl WaitPolicy {
    pub fn from_env() -> Self {
        Self {
            min_phase: Duration::from_secs(env_parse(ENV_MIN_PHASE_SECS, DEFAULT_MIN_PHASE_SECS)),
            poll_interval: Duration::from_millis(env_parse(
                ENV_POLL_INTERVAL_MS,
                DEFAULT_POLL_INTERVAL_MS,
            )),
            cache_ttl: Duration::from_millis(env_parse(ENV_CACHE_TTL_MS, DEFAULT_CACHE_TTL_MS)),
            ..Self::default()
        }
    }

    /// A policy with every pause shrunk to a few milliseconds, for tests and dry runs.
    pub fn instant() -> Self {
        let tick = Duration::from_millis(5);
        Self {
            min_phase: Duration::from_millis(40),
            poll_interval: tick,
            phase_pause: tick,
            semantic_after: 0.5,
            cache_ttl: Duration::from_millis(DEFAULT_CACHE_TTL_MS),
            tap_attempts: 5,
            tap_backoff: tick,
            assert_attempts: 3,
            assert_backoff: tick,
            default_timeout: Duration::from_millis(10),
            short_timeout: Duration::from_millis(5),
            launch_settle: tick,
            scroll_settle: tick,
            max_scrolls: 15,
            animation_cap: Duration::from_millis(50),
            dump_retry_pause: Duration::ZERO,
        }
    }

    /// Duration of one wait phase for a requested timeout
    pub fn phase_for(&self, requested: Duration) -> Duration {
        requested.max(self.min_phase)
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            min_phase: Duration::from_secs(DEFAULT_MIN_PHASE_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            phase_pause: Duration::from_millis(500),
            semantic_after: 0.5,
            cache_ttl: Duration::from_millis(DEFAULT_CACHE_TTL_MS),
            tap_attempts: 5,
            tap_backoff: Duration::from_secs(1),
            assert_attempts: 3,
            assert_backoff: Duration::from_millis(500),
            default_timeout: Duration::from_secs(10),
            short_timeout: Duration::from_secs(5),
            launch_settle: Duration::from_millis(1500),
            scroll_settle: Duration::from_secs(1),
            max_scrolls: 15,
            animation_cap: Duration::from_secs(10),
            dump_retry_pause: Duration::from_millis(500),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Get the memory document path (convenience function)
pub fn memory_path() -> PathBuf {
    get().memory.path.clone()
}

/// Get the artifact base directory (convenience function)
pub fn artifact_dir() -> PathBuf {
    get().artifacts.base_dir.clone()
}
