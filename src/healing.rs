//! Healing strategies used when plain resolution fails.
//!
//! - Fuzzy geometric successor: nearest plausible node around remembered bounds
//! - Semantic resolver: exact pass over a candidate list, then LLM re-ranking
//! - Vision locator: screenshot plus LLM, answering raw coordinates
//! - Not-found diagnosis comparing the live tree with memory

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::hierarchy::UiNode;
use crate::llm::{LlmService, MAX_VISION_DIM, downscale_png};
use crate::memory::{ElementRecord, MemoryStore};
use crate::resolver;

/// Maximum center drift accepted for a geometric successor (pixels)
pub const MAX_DRIFT_PX: f64 = 200.0;

/// Minimum LLM confidence for a semantic match
pub const SEMANTIC_MIN_CONFIDENCE: f64 = 0.6;

// ============================================================================
// Fuzzy successor
// ============================================================================

/// Find the node nearest to the remembered element's center, within
/// [`MAX_DRIFT_PX`], that either shares its class or is clickable.
pub fn fuzzy_successor<'a>(root: &'a UiNode, remembered: &ElementRecord) -> Option<&'a UiNode> {
    let target = remembered.bounds?;
    let (best, distance) = root
        .iter()
        .filter_map(|node| {
            let bounds = node.area_bounds()?;
            let distance = target.center_distance(&bounds);
            let plausible = node.clickable
                || (!remembered.class_name.is_empty() && node.class_name == remembered.class_name);
            (distance < MAX_DRIFT_PX && plausible).then_some((node, distance))
        })
        .fold(None::<(&UiNode, f64)>, |best, cand| match best {
            Some(b) if b.1 <= cand.1 => Some(b),
            _ => Some(cand),
        })?;
    debug!(successor = %best.label(), distance, "geometric successor found");
    Some(best)
}

// ============================================================================
// Semantic resolver
// ============================================================================

const SEMANTIC_PROMPT: &str = r#"You are a UI element resolver. Match the user's target to the best element on a mobile screen.
You get a 'Target' and a list of 'Candidates' taken from the UI hierarchy.

Judge candidates by:
1. Text similarity ("Save" matches "Save Changes")
2. Functional similarity ("Back" matches an arrow icon or "Cancel")
3. Context (a "Login" target is likely a button near the username field)

Return the candidate id of the best match and a confidence between 0 and 1.
If nothing matches, return index -1.

OUTPUT FORMAT (JSON):
{"best_match_index": 2, "confidence": 0.95, "reasoning": "Target 'Save' matches the 'Save Changes' button."}"#;

/// Simplified view of a node sent to the LLM
#[derive(Debug, Clone, Serialize)]
pub struct SemanticCandidate {
    pub id: usize,
    pub text: String,
    /// Trailing segment of the resource id
    pub res: String,
    pub desc: String,
}

/// Exact-then-semantic resolver over the labelled nodes of a tree
pub struct HybridResolver<'l> {
    llm: &'l dyn LlmService,
}

impl<'l> HybridResolver<'l> {
    pub fn new(llm: &'l dyn LlmService) -> Self {
        Self { llm }
    }

    /// Labelled nodes with positive area, in traversal order
    pub fn candidates(root: &UiNode) -> Vec<&UiNode> {
        root.iter()
            .filter(|n| {
                n.has_area()
                    && !(n.text.trim().is_empty()
                        && n.resource_id.trim().is_empty()
                        && n.content_description.trim().is_empty())
            })
            .collect()
    }

    /// Simple pass: exact text, resource-id containment, exact description
    pub fn exact<'a>(query: &str, candidates: &[&'a UiNode]) -> Option<&'a UiNode> {
        let q = query.to_lowercase();
        candidates.iter().copied().find(|n| {
            (!n.text.is_empty() && n.text.to_lowercase() == q)
                || (!n.resource_id.is_empty() && n.resource_id.to_lowercase().contains(&q))
                || (!n.content_description.is_empty() && n.content_description.to_lowercase() == q)
        })
    }

    /// Exact pass, then LLM re-ranking
    pub fn resolve<'a>(&self, query: &str, root: &'a UiNode) -> Option<&'a UiNode> {
        let candidates = Self::candidates(root);
        if candidates.is_empty() {
            return None;
        }
        if let Some(hit) = Self::exact(query, &candidates) {
            debug!(query, matched = %hit.label(), "hybrid exact match");
            return Some(hit);
        }
        self.semantic(query, &candidates)
    }

    fn semantic<'a>(&self, query: &str, candidates: &[&'a UiNode]) -> Option<&'a UiNode> {
        if !self.llm.is_configured() {
            return None;
        }
        let simplified: Vec<SemanticCandidate> = candidates
            .iter()
            .enumerate()
            .map(|(id, n)| SemanticCandidate {
                id,
                text: n.text.trim().to_string(),
                res: n
                    .resource_id
                    .rsplit('/')
                    .next()
                    .unwrap_or_default()
                    .to_string(),
                desc: n.content_description.trim().to_string(),
            })
            .collect();
        let user = format!(
            "Target: {}\nCandidates: {}",
            query,
            serde_json::to_string(&simplified).unwrap_or_default()
        );

        let reply = self.llm.ask_json(SEMANTIC_PROMPT, &user, None)?;
        let (index, confidence) = parse_semantic_reply(&reply)?;
        if index < 0 || confidence <= SEMANTIC_MIN_CONFIDENCE {
            debug!(query, index, confidence, "semantic match rejected");
            return None;
        }
        let hit = candidates.get(usize::try_from(index).ok()?).copied()?;
        info!(query, matched = %hit.label(), confidence, "semantic match");
        Some(hit)
    }
}

fn parse_semantic_reply(reply: &Value) -> Option<(i64, f64)> {
    let index = match &reply["best_match_index"] {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    let confidence = match &reply["confidence"] {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => 0.0,
    };
    Some((index, confidence))
}

// ============================================================================
// Vision fallback
// ============================================================================

const VISION_PROMPT: &str = "You locate UI elements on mobile screenshots. Answer with strict JSON only.";

/// Ask the LLM where `query` is on the screenshot. Coordinates are returned in
/// the original screenshot's pixel space.
pub fn locate_on_screen(llm: &dyn LlmService, screenshot_png: &[u8], query: &str) -> Option<(i32, i32)> {
    if !llm.is_configured() {
        return None;
    }
    let (image, factor) = downscale_png(screenshot_png, MAX_VISION_DIM)
        .map_err(|e| debug!(error = %e, "vision screenshot unusable"))
        .ok()?;
    let user = format!(
        "Find the UI element '{}' on this screenshot. Reply with JSON {{\"found\": true, \"x\": <center x>, \"y\": <center y>}} in image pixels, or {{\"found\": false}} when it is not visible.",
        query
    );
    let reply = llm.ask_json(VISION_PROMPT, &user, Some(&image))?;
    if reply["found"].as_bool() != Some(true) {
        debug!(query, "vision could not find element");
        return None;
    }
    let x = reply["x"].as_f64()?;
    let y = reply["y"].as_f64()?;
    let point = ((x * factor).round() as i32, (y * factor).round() as i32);
    info!(query, x = point.0, y = point.1, "vision located element");
    Some(point)
}

// ============================================================================
// Diagnosis
// ============================================================================

/// Explain why `query` could not be found on `screen_hash`
pub fn diagnose_not_found(
    memory: &MemoryStore,
    root: &UiNode,
    query: &str,
    screen_hash: &str,
) -> String {
    let Some(remembered) = memory.get_element_memory(screen_hash, query) else {
        return "Element never seen before on this screen. Is the locator correct?".to_string();
    };
    let was = remembered
        .bounds
        .map(|b| b.to_string())
        .unwrap_or_else(|| "unknown bounds".to_string());
    match resolver::resolve_str(root, query, None) {
        Some(now) => format!(
            "Element '{}' moved! It used to be at {}, but now it's at {}.",
            query,
            was,
            now.bounds
                .map(|b| b.to_string())
                .unwrap_or_else(|| "unknown bounds".to_string())
        ),
        None => format!(
            "Element '{}' has disappeared from screen '{}'. The UI structure may have changed significantly.",
            query,
            &screen_hash[..screen_hash.len().min(12)]
        ),
    }
}
