//! End-to-end tests of the engine against a scripted device

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use ratt::config::WaitPolicy;
use ratt::engine::{ResolutionSource, RunContext, dispatch_step, wait_for_element};
use ratt::flow::Locator;
use ratt::hierarchy::AcquireOptions;
use ratt::llm::LlmResult;
use ratt::memory::{ActionStatus, FailureReason};
use ratt::resolver::Query;
use ratt::{
    Bounds, CancelToken, Engine, EngineError, EngineResult, FlowEvent, LlmService, MemoryStore, NoLlm, OpKind,
    Operation, RunMode, RunStatus, ScriptedDevice, Session, StepStatus, UiNode, parse_flow, resolve,
};

const HOME: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <node index="0" text="" class="android.widget.FrameLayout" package="com.example" clickable="false" enabled="true" bounds="[0,0][1080,2400]">
    <node index="0" text="Welcome" class="android.widget.TextView" package="com.example" clickable="false" enabled="true" bounds="[40,200][1040,300]" />
    <node index="1" text="Start" resource-id="com.example:id/start" class="android.widget.Button" package="com.example" clickable="true" enabled="true" bounds="[340,1100][740,1220]" />
  </node>
</hierarchy>"#;

const NEXT: &str = r#"<hierarchy rotation="0">
  <node text="" class="android.widget.FrameLayout" bounds="[0,0][1080,2400]">
    <node text="Next screen" class="android.widget.TextView" bounds="[40,200][1040,300]" />
  </node>
</hierarchy>"#;

struct Harness {
    device: Arc<ScriptedDevice>,
    engine: Engine,
    _artifacts: TempDir,
}

fn harness(xml: &str) -> Harness {
    harness_with_memory(xml, MemoryStore::in_memory())
}

fn harness_with_memory(xml: &str, memory: MemoryStore) -> Harness {
    let artifacts = TempDir::new().unwrap();
    let device = Arc::new(ScriptedDevice::new(xml));
    let engine = Engine::new(device.clone(), Arc::new(memory), Arc::new(NoLlm), WaitPolicy::instant())
        .with_artifact_root(artifacts.path());
    Harness {
        device,
        engine,
        _artifacts: artifacts,
    }
}

// ============================================================================
// Resolution
// ============================================================================

#[test]
fn test_button_preferred_over_label() {
    let xml = r#"<hierarchy>
      <node text="Save" class="android.widget.TextView" bounds="[0,0][100,50]"/>
      <node text="Save" class="android.widget.Button" clickable="true" bounds="[0,100][100,150]"/>
    </hierarchy>"#;
    let tree = UiNode::from_uiautomator_xml(xml).unwrap();
    let node = resolve(&tree, &Query::parse("Save"), None).unwrap();
    assert_eq!(node.class_name, "android.widget.Button");
}

#[test]
fn test_index_selects_nth_match() {
    let xml = r#"<hierarchy>
      <node text="Item" class="android.widget.TextView" bounds="[0,0][100,50]"/>
      <node text="Item" class="android.widget.TextView" bounds="[0,100][100,150]"/>
    </hierarchy>"#;
    let tree = UiNode::from_uiautomator_xml(xml).unwrap();
    let second = resolve(&tree, &Query::parse("Item"), Some(1)).unwrap();
    assert_eq!(second.bounds.unwrap().top, 100);
    assert!(resolve(&tree, &Query::parse("Item"), Some(2)).is_none());
}

// ============================================================================
// Waiting and healing
// ============================================================================

#[test]
fn test_wait_runs_two_phases_of_at_least_min_phase() {
    let h = harness(HOME);
    let mut run = RunContext::new("r1", "wait", RunMode::Learn);
    let started = Instant::now();

    let err = wait_for_element(&h.engine, &mut run, &Locator::new("Missing"), Duration::from_millis(5)).unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
    let min_phase = h.engine.policy().min_phase;
    assert!(started.elapsed() >= min_phase * 2);
}

#[test]
fn test_unlabelled_successor_heals_renamed_button() {
    let xml = r#"<hierarchy>
      <node text="" class="android.widget.FrameLayout" bounds="[0,0][1080,2400]">
        <node text="" class="android.view.View" clickable="true" bounds="[105,102][205,142]"/>
      </node>
    </hierarchy>"#;
    let h = harness(xml);
    let old = UiNode {
        text: "Submit".to_string(),
        class_name: "android.widget.Button".to_string(),
        clickable: true,
        bounds: Some(Bounds::new(100, 100, 200, 140)),
        ..UiNode::default()
    };
    h.engine
        .memory()
        .remember_interaction("old-screen", "Submit", Some(&old), "r0", true)
        .unwrap();

    let flow = parse_flow("- tapOn: Submit").unwrap();
    let outcome = h.engine.run_flow(&flow, "heal", &CancelToken::new(), |_| {}).unwrap();

    assert!(outcome.passed(), "{:?}", outcome.error);
    assert_eq!(h.device.taps(), vec![(155, 122)]);
    assert_eq!(h.engine.memory().healed_count(), 1);
    assert!(outcome.steps[0].healed);
    assert_eq!(outcome.healed, 1);
}

#[test]
fn test_renamed_label_healed_by_failure_analysis() {
    let xml = r#"<hierarchy>
      <node text="" class="android.widget.FrameLayout" bounds="[0,0][1080,2400]">
        <node text="Log-in" class="android.widget.TextView" bounds="[100,1800][400,1880]"/>
      </node>
    </hierarchy>"#;
    let h = harness(xml);
    let old = UiNode {
        text: "Log in".to_string(),
        class_name: "android.widget.TextView".to_string(),
        bounds: Some(Bounds::new(100, 100, 300, 160)),
        ..UiNode::default()
    };
    h.engine
        .memory()
        .remember_interaction("old-screen", "Log in", Some(&old), "r0", true)
        .unwrap();

    let flow = parse_flow("- assertVisible: Log in").unwrap();
    let outcome = h.engine.run_flow(&flow, "drift", &CancelToken::new(), |_| {}).unwrap();

    assert!(outcome.passed(), "{:?}", outcome.error);
    assert!(outcome.steps[0].healed);
    let failures = h.engine.memory().read(|doc| doc.failures.clone());
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].reason, FailureReason::TextChanged);
    assert!(failures[0].healed);
}

/// Answers every semantic ranking request with candidate 0 at a fixed confidence
struct RankingLlm {
    confidence: f64,
    calls: AtomicUsize,
}

impl RankingLlm {
    fn new(confidence: f64) -> Self {
        Self {
            confidence,
            calls: AtomicUsize::new(0),
        }
    }
}

impl LlmService for RankingLlm {
    fn is_configured(&self) -> bool {
        true
    }

    fn complete(&self, _system: &str, user: &str, image_png: Option<&[u8]>) -> LlmResult<String> {
        assert!(image_png.is_none());
        assert!(user.contains("Target: Continue to checkout"));
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!(r#"{{"best_match_index": 0, "confidence": {}}}"#, self.confidence))
    }
}

const CHECKOUT: &str = r#"<hierarchy>
  <node text="" class="android.widget.FrameLayout" bounds="[0,0][1080,2400]">
    <node text="Proceed" class="android.widget.Button" clickable="true" bounds="[100,2000][980,2120]"/>
  </node>
</hierarchy>"#;

fn ranking_engine(llm: Arc<RankingLlm>) -> (Arc<ScriptedDevice>, Engine) {
    let device = Arc::new(ScriptedDevice::new(CHECKOUT));
    let engine = Engine::new(
        device.clone(),
        Arc::new(MemoryStore::in_memory()),
        llm,
        WaitPolicy::instant(),
    );
    (device, engine)
}

#[test]
fn test_semantic_heal_accepts_confidence_above_threshold() {
    let llm = Arc::new(RankingLlm::new(0.61));
    let (_, engine) = ranking_engine(llm.clone());
    let mut run = RunContext::new("r1", "semantic", RunMode::Learn);

    let found = wait_for_element(&engine, &mut run, &Locator::new("Continue to checkout"), Duration::from_millis(5))
        .unwrap();
    assert_eq!(found.source, ResolutionSource::Semantic);
    assert_eq!(found.center(), (540, 2060));
    assert_eq!(found.node.unwrap().text, "Proceed");
    assert_eq!(engine.memory().healed_count(), 1);
    assert!(llm.calls.load(Ordering::SeqCst) >= 1);
}

#[test]
fn test_semantic_heal_rejects_confidence_at_threshold() {
    let llm = Arc::new(RankingLlm::new(0.6));
    let (_, engine) = ranking_engine(llm.clone());
    let mut run = RunContext::new("r1", "semantic", RunMode::Learn);

    let err = wait_for_element(&engine, &mut run, &Locator::new("Continue to checkout"), Duration::from_millis(5))
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
    assert_eq!(engine.memory().healed_count(), 0);
    assert!(llm.calls.load(Ordering::SeqCst) >= 1);
}

#[test]
fn test_assert_visible_waits_three_times() {
    let artifacts = TempDir::new().unwrap();
    let h = harness(HOME);
    let session = Session::for_run(artifacts.path(), "r1");
    let mut run = RunContext::new("r1", "assert", RunMode::Learn).with_session(session.clone());
    let step = parse_flow("- assertVisible: Missing").unwrap().steps.remove(0);

    let err = dispatch_step(&h.engine, &mut run, &step, 0, &[]).unwrap_err();
    assert!(matches!(err, EngineError::StepExecution { .. }));

    // Two dispatches, each with three exhausted waits.
    let timeouts = session
        .list_captures()
        .unwrap()
        .iter()
        .filter(|p| p.file_name().is_some_and(|n| n.to_string_lossy().starts_with("failure_timeout")))
        .count();
    assert_eq!(timeouts, 6);
}

// ============================================================================
// Handler registry
// ============================================================================

#[test]
fn test_registered_handler_replaces_builtin() {
    let mut h = harness(HOME);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    h.engine.registry_mut().register(
        OpKind::Back,
        move |_: &Engine, _: &mut RunContext, op: &Operation| -> EngineResult<String> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("custom {}", op.kind()))
        },
    );

    let flow = parse_flow("- back\n- back").unwrap();
    let outcome = h.engine.run_flow(&flow, "custom", &CancelToken::new(), |_| {}).unwrap();

    assert!(outcome.passed());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(outcome.steps[0].message, "custom back");
    assert!(!h.device.commands().iter().any(|c| c == "input keyevent 4"));
}

// ============================================================================
// Hierarchy cache
// ============================================================================

#[test]
fn test_smart_cache_never_serves_tree_older_than_interaction() {
    let h = harness(HOME);
    let mut run = RunContext::new("r1", "cache", RunMode::Learn);

    h.engine.acquire(&mut run, AcquireOptions::smart()).unwrap();
    h.engine.acquire(&mut run, AcquireOptions::smart()).unwrap();
    assert_eq!(h.device.dump_count(), 1);

    run.mark_interaction();
    h.device.set_screen(NEXT);
    let snapshot = h.engine.acquire(&mut run, AcquireOptions::smart()).unwrap();
    assert_eq!(h.device.dump_count(), 2);
    assert!(snapshot.tree.iter().any(|n| n.text == "Next screen"));
}

// ============================================================================
// Memory
// ============================================================================

#[test]
fn test_confidence_score() {
    let memory = MemoryStore::in_memory();
    let run_id = memory.start_run("score", RunMode::Learn).unwrap();
    for i in 0..10 {
        let status = if i < 8 {
            ActionStatus::Success
        } else {
            ActionStatus::Fail
        };
        memory
            .record_action(&run_id, "tapOn", "{}", status, 1, None)
            .unwrap();
    }
    for _ in 0..50 {
        memory.learn_screen("screen-a", &run_id, &UiNode::default()).unwrap();
    }

    let score = memory.end_run(&run_id, RunStatus::Pass, 10).unwrap();
    assert!((score - 0.68).abs() < 1e-9, "score was {}", score);
}

#[test]
fn test_memory_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("memory.json");
    let h = harness_with_memory(HOME, MemoryStore::open(&path).unwrap());

    let flow = parse_flow("- tapOn: Start").unwrap();
    let outcome = h.engine.run_flow(&flow, "persist", &CancelToken::new(), |_| {}).unwrap();
    assert!(outcome.passed());

    let reopened = MemoryStore::open(&path).unwrap();
    let run = reopened.run(&outcome.run_id).unwrap();
    assert_eq!(run.status, RunStatus::Pass);
    assert!(reopened.get_step_memory("persist", 0).is_some());
}

// ============================================================================
// Flow runs
// ============================================================================

#[test]
fn test_second_run_uses_fast_mode_and_step_memory() {
    let h = harness(HOME);
    let flow = parse_flow("- tapOn: Start").unwrap();

    let first = h.engine.run_flow(&flow, "login", &CancelToken::new(), |_| {}).unwrap();
    assert_eq!(first.mode, RunMode::Learn);
    assert!(first.passed());
    let dumps_after_learn = h.device.dump_count();

    let second = h.engine.run_flow(&flow, "login", &CancelToken::new(), |_| {}).unwrap();
    assert_eq!(second.mode, RunMode::Fast);
    assert!(second.passed());
    assert_eq!(h.device.dump_count(), dumps_after_learn);
    assert_eq!(h.device.taps(), vec![(540, 1160), (540, 1160)]);
}

#[test]
fn test_crash_ends_step_without_retry() {
    let h = harness(HOME);
    h.device
        .fail_command("input tap", "FATAL EXCEPTION: main\nProcess: com.example, PID: 4242");

    let flow = parse_flow("- tapOn: Start\n- back").unwrap();
    let outcome = h.engine.run_flow(&flow, "crash", &CancelToken::new(), |_| {}).unwrap();

    assert_eq!(outcome.status, RunStatus::Fail);
    assert_eq!(outcome.steps.len(), 1);
    assert_eq!(outcome.steps[0].status, StepStatus::Failed);
    assert!(outcome.error.unwrap().contains("Application crash detected"));
    assert_eq!(h.device.taps().len(), 1);

    let failures = h.engine.memory().read(|doc| doc.failures.clone());
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].reason, FailureReason::AppCrash);
}

#[test]
fn test_crash_word_in_locator_is_not_a_crash() {
    let h = harness(HOME);
    let flow = parse_flow("- tapOn: Crash reports").unwrap();
    let outcome = h.engine.run_flow(&flow, "crash-label", &CancelToken::new(), |_| {}).unwrap();

    assert_eq!(outcome.status, RunStatus::Fail);
    let error = outcome.error.unwrap();
    assert!(error.contains("Crash reports"));
    assert!(!error.contains("Application crash detected"), "{}", error);
    assert!(h.device.taps().is_empty());

    let reasons: Vec<FailureReason> = h
        .engine
        .memory()
        .read(|doc| doc.failures.iter().map(|f| f.reason).collect());
    assert_eq!(reasons, vec![FailureReason::ElementMissing, FailureReason::ElementMissing]);
}

#[test]
fn test_cancel_between_steps() {
    let h = harness(HOME);
    let flow = parse_flow("- back\n- back\n- back").unwrap();
    let cancel = CancelToken::new();
    let token = cancel.clone();

    let outcome = h
        .engine
        .run_flow(&flow, "cancel", &cancel, |event| {
            if let FlowEvent::StepCompleted(_) = event {
                token.cancel();
            }
        })
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Fail);
    assert_eq!(outcome.steps.len(), 1);
    assert!(outcome.error.unwrap().contains("cancelled"));
    let backs = h
        .device
        .commands()
        .iter()
        .filter(|c| c.as_str() == "input keyevent 4")
        .count();
    assert_eq!(backs, 1);
}
