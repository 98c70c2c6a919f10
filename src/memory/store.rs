//! Durable memory store.
//!
//! The whole document lives behind one mutex. Every mutation runs
//! read-modify-write under the lock and rewrites the document atomically
//! (temp file in the same directory, then rename) before the lock is released.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::types::{
    ActionRecord, ActionStatus, ElementRecord, FailureReason, FailureRecord, MemoryDocument,
    PreferredLocator, RunMode, RunRecord, RunStatus, ScreenRecord, StepMemory,
};
use crate::hierarchy::{Bounds, UiNode};

/// Result type for memory operations
pub type MemoryResult<T> = Result<T, MemoryError>;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("memory document is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to persist memory document: {0}")]
    Persist(String),

    #[error("run not found: {0}")]
    RunNotFound(String),
}

/// Persistent record of screens, elements, runs, actions and failures
#[derive(Debug)]
pub struct MemoryStore {
    path: Option<PathBuf>,
    doc: Mutex<MemoryDocument>,
}

impl MemoryStore {
    /// Load the document at `path`. A missing file starts empty; a corrupt one
    /// is moved aside to `<path>.corrupt` and replaced by an empty document.
    pub fn open(path: impl Into<PathBuf>) -> MemoryResult<Self> {
        let path = path.into();
        let doc = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            match serde_json::from_str::<MemoryDocument>(&raw) {
                Ok(doc) => doc,
                Err(e) => {
                    let aside = path.with_extension("corrupt");
                    warn!(path = %path.display(), error = %e, "corrupt memory document, moving aside");
                    fs::rename(&path, &aside)?;
                    MemoryDocument::default()
                }
            }
        } else {
            MemoryDocument::default()
        };
        debug!(
            path = %path.display(),
            screens = doc.screens.len(),
            runs = doc.runs.len(),
            "memory loaded"
        );
        Ok(Self {
            path: Some(path),
            doc: Mutex::new(doc),
        })
    }

    /// A store that never touches disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            doc: Mutex::new(MemoryDocument::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryDocument> {
        self.doc.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against the current document
    pub fn read<R>(&self, f: impl FnOnce(&MemoryDocument) -> R) -> R {
        f(&self.lock())
    }

    /// Clone of the whole document
    pub fn snapshot(&self) -> MemoryDocument {
        self.lock().clone()
    }

    /// Apply `f` and persist. A file-backed store applies `f` to a copy and
    /// swaps it in only after the write succeeds, so a failed write leaves
    /// memory and disk in agreement.
    fn mutate<R>(&self, f: impl FnOnce(&mut MemoryDocument) -> R) -> MemoryResult<R> {
        let mut doc = self.lock();
        let Some(path) = &self.path else {
            return Ok(f(&mut doc));
        };
        let mut next = doc.clone();
        let result = f(&mut next);
        persist(path, &next)?;
        *doc = next;
        Ok(result)
    }

    // ========================================================================
    // Runs
    // ========================================================================

    pub fn start_run(&self, test_name: &str, mode: RunMode) -> MemoryResult<String> {
        let run_id = short_digest(&format!("{}|{}", test_name, unique_stamp()), 12);
        let record = RunRecord {
            run_id: run_id.clone(),
            test_name: test_name.to_string(),
            mode,
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            execution_time_ms: 0,
            confidence_score: 0.0,
        };
        self.mutate(|doc| doc.runs.push(record))?;
        info!(run_id = %run_id, test_name, %mode, "run started");
        Ok(run_id)
    }

    /// Complete a run and compute its confidence score
    pub fn end_run(
        &self,
        run_id: &str,
        status: RunStatus,
        execution_time_ms: u64,
    ) -> MemoryResult<f64> {
        let score = self.mutate(|doc| {
            let score = calculate_confidence(doc, run_id);
            let run = doc.runs.iter_mut().find(|r| r.run_id == run_id)?;
            run.status = status;
            run.completed_at = Some(Utc::now());
            run.execution_time_ms = execution_time_ms;
            run.confidence_score = score;
            Some(score)
        })?;
        let score = score.ok_or_else(|| MemoryError::RunNotFound(run_id.to_string()))?;
        info!(run_id, %status, execution_time_ms, confidence = score, "run finished");
        Ok(score)
    }

    /// Delete a run with its actions and failures. Screens and elements stay.
    pub fn delete_run(&self, run_id: &str) -> MemoryResult<bool> {
        self.mutate(|doc| {
            let before = doc.runs.len();
            doc.runs.retain(|r| r.run_id != run_id);
            doc.actions.retain(|a| a.run_id != run_id);
            doc.failures.retain(|f| f.run_id != run_id);
            doc.runs.len() != before
        })
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.lock().runs.clone()
    }

    pub fn run(&self, run_id: &str) -> Option<RunRecord> {
        self.lock().run(run_id).cloned()
    }

    /// Most recent completed run of a test
    pub fn last_completed_run(&self, test_name: &str) -> Option<RunRecord> {
        self.lock()
            .runs
            .iter()
            .rev()
            .find(|r| r.test_name == test_name && r.status != RunStatus::Running)
            .cloned()
    }

    // ========================================================================
    // Screens and elements
    // ========================================================================

    /// Register a visit to a screen and learn every identifiable node on it
    pub fn learn_screen(&self, screen_hash: &str, run_id: &str, tree: &UiNode) -> MemoryResult<()> {
        self.mutate(|doc| {
            let now = Utc::now();
            let screen = doc
                .screens
                .entry(screen_hash.to_string())
                .or_insert_with(|| ScreenRecord {
                    screen_id: screen_hash.to_string(),
                    visit_count: 0,
                    first_seen: now,
                    last_seen: now,
                    last_seen_run: run_id.to_string(),
                });
            screen.visit_count += 1;
            screen.last_seen = now;
            screen.last_seen_run = run_id.to_string();

            let elements = doc.elements.entry(screen_hash.to_string()).or_default();
            for node in tree.iter().filter(|n| n.is_identifiable()) {
                let id = element_id(screen_hash, node);
                elements
                    .entry(id.clone())
                    .or_insert_with(|| new_element(id, screen_hash, node));
            }
        })
    }

    pub fn screen(&self, screen_hash: &str) -> Option<ScreenRecord> {
        self.lock().screens.get(screen_hash).cloned()
    }

    /// Exact text-or-resource-id lookup within one screen
    pub fn get_element_memory(&self, screen_id: &str, query: &str) -> Option<ElementRecord> {
        self.lock()
            .elements
            .get(screen_id)?
            .values()
            .find(|el| el.matches(query))
            .cloned()
    }

    /// Best remembered element for `query` on any screen: the one with known
    /// bounds and the most successes.
    pub fn find_element_anywhere(&self, query: &str) -> Option<ElementRecord> {
        self.lock()
            .elements
            .values()
            .flat_map(|screen| screen.values())
            .filter(|el| el.matches(query) && el.bounds.is_some())
            .max_by_key(|el| el.success_count)
            .cloned()
    }

    /// Bounds of the element last interacted with for `query` on this screen.
    /// Stricter than a plain bounds lookup: an element with stored bounds but
    /// no recorded success is never recalled.
    pub fn recall_bounds(&self, screen_id: &str, query: &str) -> Option<Bounds> {
        self.lock()
            .elements
            .get(screen_id)?
            .values()
            .filter(|el| el.success_count > 0 && el.matches(query))
            .filter_map(|el| el.bounds.filter(Bounds::has_area).map(|b| (el.success_count, b)))
            .max_by_key(|(count, _)| *count)
            .map(|(_, b)| b)
    }

    /// Record an interaction outcome for `(screen, query)`. An unknown element
    /// is created from `node`; without a node nothing is recorded.
    pub fn remember_interaction(
        &self,
        screen_id: &str,
        query: &str,
        node: Option<&UiNode>,
        run_id: &str,
        success: bool,
    ) -> MemoryResult<()> {
        self.mutate(|doc| {
            let elements = doc.elements.entry(screen_id.to_string()).or_default();
            let existing = elements
                .values()
                .find(|el| el.matches(query))
                .map(|el| el.element_id.clone());
            let key = match (existing, node) {
                (Some(key), _) => key,
                (None, Some(node)) => {
                    let key = element_id(screen_id, node);
                    elements
                        .entry(key.clone())
                        .or_insert_with(|| new_element(key.clone(), screen_id, node));
                    key
                }
                (None, None) => return,
            };
            if let Some(el) = elements.get_mut(&key) {
                el.record_outcome(success, run_id);
                if success {
                    if let Some(bounds) = node.and_then(UiNode::area_bounds) {
                        el.bounds = Some(bounds);
                    }
                }
            }
        })
    }

    // ========================================================================
    // Actions, failures, healing
    // ========================================================================

    pub fn record_action(
        &self,
        run_id: &str,
        action_type: &str,
        intent: &str,
        status: ActionStatus,
        execution_time_ms: u64,
        element_id: Option<String>,
    ) -> MemoryResult<String> {
        self.mutate(|doc| {
            let action_id = short_digest(
                &format!("{}|{}|{}|{}", run_id, intent, unique_stamp(), doc.actions.len()),
                12,
            );
            doc.actions.push(ActionRecord {
                action_id: action_id.clone(),
                run_id: run_id.to_string(),
                action_type: action_type.to_string(),
                intent: intent.to_string(),
                element_id,
                status,
                execution_time_ms,
            });
            action_id
        })
    }

    pub fn record_failure(
        &self,
        run_id: &str,
        action_id: &str,
        reason: FailureReason,
        healed: bool,
        notes: &str,
    ) -> MemoryResult<String> {
        self.mutate(|doc| {
            let failure_id = short_digest(
                &format!("{}|{}|{}|{}", run_id, action_id, unique_stamp(), doc.failures.len()),
                12,
            );
            doc.failures.push(FailureRecord {
                failure_id: failure_id.clone(),
                run_id: run_id.to_string(),
                action_id: action_id.to_string(),
                reason,
                healed,
                auto_fix_applied: healed,
                notes: notes.to_string(),
            });
            failure_id
        })
    }

    pub fn increment_healed(&self) -> MemoryResult<u64> {
        self.mutate(|doc| {
            doc.healed_count += 1;
            doc.healed_count
        })
    }

    pub fn healed_count(&self) -> u64 {
        self.lock().healed_count
    }

    // ========================================================================
    // Step memory
    // ========================================================================

    pub fn save_step_memory(
        &self,
        test_name: &str,
        step_index: usize,
        bounds: Bounds,
    ) -> MemoryResult<()> {
        self.mutate(|doc| {
            doc.step_memory.insert(
                step_key(test_name, step_index),
                StepMemory {
                    bounds,
                    last_updated: Utc::now(),
                },
            );
        })
    }

    pub fn get_step_memory(&self, test_name: &str, step_index: usize) -> Option<StepMemory> {
        self.lock()
            .step_memory
            .get(&step_key(test_name, step_index))
            .cloned()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// `0.6 * action success ratio + 0.4 * min(1, total visits / 100)`, two decimals;
/// 0.0 for a run without actions.
pub fn calculate_confidence(doc: &MemoryDocument, run_id: &str) -> f64 {
    let (total, succeeded) = doc
        .actions
        .iter()
        .filter(|a| a.run_id == run_id)
        .fold((0u64, 0u64), |(total, ok), a| {
            (total + 1, ok + u64::from(a.status == ActionStatus::Success))
        });
    if total == 0 {
        return 0.0;
    }
    let consistency = succeeded as f64 / total as f64;
    let stability = (doc.total_visits() as f64 / 100.0).min(1.0);
    let score = 0.6 * consistency + 0.4 * stability;
    (score * 100.0).round() / 100.0
}

/// Stable element identity within a screen
pub fn element_id(screen_id: &str, node: &UiNode) -> String {
    short_digest(
        &format!(
            "{}|{}|{}|{}",
            screen_id, node.text, node.resource_id, node.class_name
        ),
        16,
    )
}

fn new_element(element_id: String, screen_id: &str, node: &UiNode) -> ElementRecord {
    ElementRecord {
        element_id,
        screen_id: screen_id.to_string(),
        text: node.text.clone(),
        resource_id: node.resource_id.clone(),
        content_desc: node.content_description.clone(),
        class_name: node.class_name.clone(),
        bounds: node.bounds,
        success_count: 0,
        fail_count: 0,
        success_rate: 1.0,
        preferred_locator: if node.resource_id.is_empty() {
            PreferredLocator::Text
        } else {
            PreferredLocator::ResourceId
        },
        last_success_run: None,
    }
}

fn step_key(test_name: &str, step_index: usize) -> String {
    format!("{}|{}", test_name, step_index)
}

fn short_digest(input: &str, len: usize) -> String {
    let hex = format!("{:x}", Sha256::digest(input.as_bytes()));
    hex[..len.min(hex.len())].to_string()
}

fn unique_stamp() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

fn persist(path: &Path, doc: &MemoryDocument) -> MemoryResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;
    let mut tmp = NamedTempFile::new_in(&dir)?;
    serde_json::to_writer_pretty(&mut tmp, doc)?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|e| MemoryError::Persist(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn screen_xml() -> UiNode {
        UiNode::from_uiautomator_xml(
            r#"<hierarchy><node class="android.widget.FrameLayout" bounds="[0,0][1080,2400]"><node text="Save" class="android.widget.Button" clickable="true" bounds="[10,10][110,60]"/><node resource-id="com.app:id/name" class="android.widget.EditText" bounds="[10,100][500,160]"/><node class="android.view.View" bounds="[0,0][5,5]"/></node></hierarchy>"#,
        )
        .unwrap()
    }

    #[test]
    fn test_learn_screen_is_idempotent() {
        let store = MemoryStore::in_memory();
        let tree = screen_xml();
        store.learn_screen("s1", "r1", &tree).unwrap();
        store.learn_screen("s1", "r1", &tree).unwrap();

        let doc = store.snapshot();
        assert_eq!(doc.screens["s1"].visit_count, 2);
        assert_eq!(doc.elements["s1"].len(), 2);
    }

    #[test]
    fn test_element_id_is_pure() {
        let tree = screen_xml();
        let save = &tree.children[0].children[0];
        assert_eq!(element_id("s1", save), element_id("s1", save));
        assert_ne!(element_id("s1", save), element_id("s2", save));
    }

    #[test]
    fn test_remember_interaction_creates_and_updates() {
        let store = MemoryStore::in_memory();
        let tree = screen_xml();
        let save = &tree.children[0].children[0];

        store
            .remember_interaction("s1", "Save", Some(save), "r1", true)
            .unwrap();
        store
            .remember_interaction("s1", "Save", None, "r1", false)
            .unwrap();

        let el = store.get_element_memory("s1", "Save").unwrap();
        assert_eq!((el.success_count, el.fail_count), (1, 1));
        assert!((el.success_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_recall_bounds_requires_a_success() {
        let store = MemoryStore::in_memory();
        let save = UiNode {
            text: "Save".into(),
            class_name: "android.widget.Button".into(),
            bounds: Some(Bounds::new(0, 0, 100, 40)),
            ..UiNode::default()
        };
        store.learn_screen("s1", "r1", &save).unwrap();
        assert!(store.recall_bounds("s1", "Save").is_none());

        store.remember_interaction("s1", "Save", Some(&save), "r1", true).unwrap();
        assert_eq!(store.recall_bounds("s1", "Save"), Some(Bounds::new(0, 0, 100, 40)));
    }

    #[test]
    fn test_remember_failure_without_node_is_skipped() {
        let store = MemoryStore::in_memory();
        store
            .remember_interaction("s1", "Ghost", None, "r1", false)
            .unwrap();
        assert!(store.get_element_memory("s1", "Ghost").is_none());
    }

    #[test]
    fn test_confidence_formula() {
        let store = MemoryStore::in_memory();
        let run_id = store.start_run("login", RunMode::Learn).unwrap();
        store.mutate(|doc| {
            doc.screens.insert(
                "s".into(),
                ScreenRecord {
                    screen_id: "s".into(),
                    visit_count: 50,
                    first_seen: Utc::now(),
                    last_seen: Utc::now(),
                    last_seen_run: run_id.clone(),
                },
            );
        })
        .unwrap();
        for i in 0..10 {
            let status = if i < 8 { ActionStatus::Success } else { ActionStatus::Fail };
            store
                .record_action(&run_id, "tapOn", &format!("step {}", i), status, 5, None)
                .unwrap();
        }
        let score = store.end_run(&run_id, RunStatus::Pass, 1000).unwrap();
        assert!((score - 0.68).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_zero_without_actions() {
        let store = MemoryStore::in_memory();
        let run_id = store.start_run("empty", RunMode::Learn).unwrap();
        assert_eq!(store.end_run(&run_id, RunStatus::Pass, 0).unwrap(), 0.0);
    }

    #[test]
    fn test_delete_run_cascades_only_to_its_records() {
        let store = MemoryStore::in_memory();
        let tree = screen_xml();
        let keep = store.start_run("a", RunMode::Learn).unwrap();
        let gone = store.start_run("b", RunMode::Learn).unwrap();
        store.learn_screen("s1", &gone, &tree).unwrap();
        store
            .record_action(&keep, "tapOn", "keep", ActionStatus::Success, 1, None)
            .unwrap();
        let action = store
            .record_action(&gone, "tapOn", "gone", ActionStatus::Fail, 1, None)
            .unwrap();
        store
            .record_failure(&gone, &action, FailureReason::ElementMissing, false, "")
            .unwrap();

        assert!(store.delete_run(&gone).unwrap());
        let doc = store.snapshot();
        assert_eq!(doc.runs.len(), 1);
        assert_eq!(doc.actions.len(), 1);
        assert!(doc.failures.is_empty());
        assert_eq!(doc.elements["s1"].len(), 2);
        assert!(!store.delete_run(&gone).unwrap());
    }

    #[test]
    fn test_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        {
            let store = MemoryStore::open(&path).unwrap();
            store
                .save_step_memory("login", 2, Bounds::new(0, 0, 100, 50))
                .unwrap();
            store.increment_healed().unwrap();
        }
        let store = MemoryStore::open(&path).unwrap();
        assert_eq!(store.healed_count(), 1);
        assert_eq!(
            store.get_step_memory("login", 2).unwrap().bounds,
            Bounds::new(0, 0, 100, 50)
        );
        assert!(store.get_step_memory("login", 3).is_none());
    }

    #[test]
    fn test_failed_persist_leaves_document_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        let store = MemoryStore::open(&path).unwrap();
        store.increment_healed().unwrap();

        // A directory in place of the document makes every write fail.
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        assert!(store.start_run("login", RunMode::Learn).is_err());
        assert!(store.increment_healed().is_err());
        assert!(store.runs().is_empty());
        assert_eq!(store.healed_count(), 1);
    }

    #[test]
    fn test_corrupt_document_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        fs::write(&path, "{ not json").unwrap();
        let store = MemoryStore::open(&path).unwrap();
        assert!(store.runs().is_empty());
        assert!(dir.path().join("memory.corrupt").exists());
    }

    #[test]
    fn test_last_completed_run_skips_running() {
        let store = MemoryStore::in_memory();
        let first = store.start_run("t", RunMode::Learn).unwrap();
        store.end_run(&first, RunStatus::Pass, 10).unwrap();
        store.start_run("t", RunMode::Fast).unwrap();
        let last = store.last_completed_run("t").unwrap();
        assert_eq!(last.run_id, first);
        assert!(store.last_completed_run("other").is_none());
    }
}
