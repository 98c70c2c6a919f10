//! LLM client used by the semantic resolver, vision fallback and failure advisor.
//!
//! Requests go through the `curl` executable with explicit connect and total
//! timeouts. Two wire formats are supported:
//! - OpenAI-compatible chat completions (default)
//! - Gemini `generateContent`, selected when the key starts with `AIza`
//!
//! Callers never depend on the LLM being available: [`LlmService::ask_json`]
//! turns every failure into `None`.
//!
//! # Configuration
//!
//! - `RATT_LLM_ENDPOINT`: chat completions endpoint
//! - `RATT_LLM_MODEL`: model name
//! - `RATT_OPENAI_KEY` / `OPENAI_API_KEY` / `GOOGLE_API_KEY`: credential
//! - `RATT_LLM_TIMEOUT`: total request timeout (seconds)
//! - `RATT_LLM_CONNECT_TIMEOUT`: connection timeout (seconds)

use std::io::{Cursor, Write};
use std::process::{Command, Stdio};

use base64::Engine;
use image::GenericImageView;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config;

/// Longest image side sent for vision requests
pub const MAX_VISION_DIM: u32 = 1280;

const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const GEMINI_DEFAULT_MODEL: &str = "gemini-1.5-flash";

/// Result type for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("no LLM credential configured")]
    NotConfigured,

    #[error("LLM transport failed: {0}")]
    Transport(String),

    #[error("invalid LLM response: {0}")]
    InvalidResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A JSON-answering language model
pub trait LlmService: Send + Sync {
    fn is_configured(&self) -> bool;

    /// Raw text reply for a system prompt, user content and optional PNG
    fn complete(&self, system: &str, user: &str, image_png: Option<&[u8]>) -> LlmResult<String>;

    /// Reply reduced to a JSON object, or `None` on any failure
    fn ask_json(&self, system: &str, user: &str, image_png: Option<&[u8]>) -> Option<Value> {
        if !self.is_configured() {
            return None;
        }
        match self.complete(system, user, image_png) {
            Ok(text) => {
                let parsed = extract_json_object(&text);
                if parsed.is_none() {
                    warn!(reply = %truncate(&text, 200), "LLM reply is not a JSON object");
                }
                parsed
            }
            Err(e) => {
                warn!(error = %e, "LLM request failed");
                None
            }
        }
    }
}

/// Service used when no credential is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLlm;

impl LlmService for NoLlm {
    fn is_configured(&self) -> bool {
        false
    }

    fn complete(&self, _: &str, _: &str, _: Option<&[u8]>) -> LlmResult<String> {
        Err(LlmError::NotConfigured)
    }
}

/// Wire format of the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Gemini,
}

/// Configuration for the chat client
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    /// Connection timeout (seconds)
    pub connect_timeout: u64,
    /// Total request timeout (seconds)
    pub timeout: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        let cfg = &config::get().llm;
        Self {
            endpoint: cfg.endpoint.clone(),
            model: cfg.model.clone(),
            api_key: cfg.api_key.clone(),
            max_tokens: cfg.max_tokens,
            connect_timeout: cfg.connect_timeout,
            timeout: cfg.timeout,
        }
    }
}

impl LlmConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn provider(&self) -> Provider {
        match &self.api_key {
            Some(key) if key.starts_with("AIza") => Provider::Gemini,
            _ => Provider::OpenAi,
        }
    }
}

/// curl-backed chat client
#[derive(Debug, Clone)]
pub struct ChatClient {
    config: LlmConfig,
}

impl ChatClient {
    pub fn new(config: LlmConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> Self {
        Self::new(LlmConfig::default())
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    fn request(&self, system: &str, user: &str, image_png: Option<&[u8]>) -> (String, Value) {
        let image_b64 = image_png.map(|png| base64::engine::general_purpose::STANDARD.encode(png));
        match self.config.provider() {
            Provider::OpenAi => {
                let user_content = match &image_b64 {
                    Some(b64) => json!([
                        {"type": "text", "text": user},
                        {"type": "image_url", "image_url": {"url": format!("data:image/png;base64,{}", b64)}}
                    ]),
                    None => Value::String(user.to_string()),
                };
                let body = json!({
                    "model": self.config.model,
                    "messages": [
                        {"role": "system", "content": system},
                        {"role": "user", "content": user_content}
                    ],
                    "temperature": 0.2,
                    "max_tokens": self.config.max_tokens
                });
                (self.config.endpoint.clone(), body)
            }
            Provider::Gemini => {
                let mut parts = vec![json!({"text": user})];
                if let Some(b64) = &image_b64 {
                    parts.push(json!({"inline_data": {"mime_type": "image/png", "data": b64}}));
                }
                let model = if self.config.model.starts_with("gemini") {
                    self.config.model.as_str()
                } else {
                    GEMINI_DEFAULT_MODEL
                };
                let url = format!(
                    "{}/{}:generateContent?key={}",
                    GEMINI_BASE,
                    model,
                    self.config.api_key.as_deref().unwrap_or_default()
                );
                let body = json!({
                    "systemInstruction": {"parts": [{"text": system}]},
                    "contents": [{"role": "user", "parts": parts}],
                    "generationConfig": {
                        "temperature": 0.2,
                        "maxOutputTokens": self.config.max_tokens
                    }
                });
                (url, body)
            }
        }
    }
}

impl LlmService for ChatClient {
    fn is_configured(&self) -> bool {
        self.config.api_key.is_some()
    }

    fn complete(&self, system: &str, user: &str, image_png: Option<&[u8]>) -> LlmResult<String> {
        let key = self.config.api_key.as_deref().ok_or(LlmError::NotConfigured)?;
        let provider = self.config.provider();
        let (url, body) = self.request(system, user, image_png);
        let payload =
            serde_json::to_vec(&body).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let mut cmd = Command::new("curl");
        cmd.args([
            "-sS",
            "-X",
            "POST",
            &url,
            "-H",
            "Content-Type: application/json",
            "--data-binary",
            "@-",
            "--connect-timeout",
            &self.config.connect_timeout.to_string(),
            "--max-time",
            &self.config.timeout.to_string(),
            "-w",
            "\n%{http_code}",
        ]);
        if provider == Provider::OpenAi {
            cmd.args(["-H", &format!("Authorization: Bearer {}", key)]);
        }

        debug!(model = %self.config.model, ?provider, bytes = payload.len(), "LLM request");
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload)?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(LlmError::Transport(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (body, status) = stdout
            .rsplit_once('\n')
            .ok_or_else(|| LlmError::InvalidResponse("missing status line".to_string()))?;
        let status: u16 = status.trim().parse().unwrap_or(0);
        if !(200..300).contains(&status) {
            return Err(LlmError::Transport(format!(
                "HTTP {}: {}",
                status,
                truncate(body, 200)
            )));
        }

        let response: Value =
            serde_json::from_str(body).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let content = match provider {
            Provider::OpenAi => response["choices"][0]["message"]["content"].as_str(),
            Provider::Gemini => response["candidates"][0]["content"]["parts"][0]["text"].as_str(),
        };
        content
            .map(str::to_string)
            .ok_or_else(|| LlmError::InvalidResponse("reply has no content".to_string()))
    }
}

/// Build the configured service: a chat client when a key exists, otherwise `NoLlm`
pub fn from_config() -> std::sync::Arc<dyn LlmService> {
    let client = ChatClient::from_env();
    if client.is_configured() {
        std::sync::Arc::new(client)
    } else {
        std::sync::Arc::new(NoLlm)
    }
}

// ============================================================================
// Reply and image helpers
// ============================================================================

/// Reduce a model reply to a JSON object: strip Markdown fences, then fall back
/// to the outermost `{..}`.
pub fn extract_json_object(reply: &str) -> Option<Value> {
    let trimmed = reply.trim();
    let unfenced = if let Some((_, rest)) = trimmed.split_once("```json") {
        rest.split("```").next().unwrap_or(rest).trim()
    } else if let Some((_, rest)) = trimmed.split_once("```") {
        rest.split("```").next().unwrap_or(rest).trim()
    } else {
        trimmed
    };

    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(unfenced) {
        return Some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Downscale a PNG so its longest side is at most `max_dim`.
///
/// Returns the (possibly re-encoded) PNG and the factor that maps coordinates
/// in the returned image back to the original.
pub fn downscale_png(png: &[u8], max_dim: u32) -> LlmResult<(Vec<u8>, f64)> {
    let img = image::load_from_memory(png)
        .map_err(|e| LlmError::InvalidResponse(format!("screenshot is not an image: {}", e)))?;
    let (width, height) = img.dimensions();
    let longest = width.max(height);
    if longest <= max_dim {
        return Ok((png.to_vec(), 1.0));
    }

    let scale = f64::from(max_dim) / f64::from(longest);
    let new_w = ((f64::from(width) * scale).round() as u32).max(1);
    let new_h = ((f64::from(height) * scale).round() as u32).max(1);
    let resized = img.resize_exact(new_w, new_h, image::imageops::FilterType::Triangle);

    let mut bytes = Vec::new();
    resized
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|e| LlmError::InvalidResponse(format!("failed to encode PNG: {}", e)))?;
    Ok((bytes, f64::from(longest) / f64::from(max_dim)))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
