//! End-to-end orchestrator tests against a stub assistant script.
//!
//! The stub dispatches on the prompt: planning prompts (starting with
//! `Task:`) return a canned plan envelope, summary prompts (starting with
//! `Original request:`) return a canned summary, and worker prompts are
//! matched by marker substrings planted in the plan's worker prompts.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::core::assistant::AssistantInvoker;
use crate::core::chat::{Urgency, WorkRequest};
use crate::core::config::{RuntimeConfig, SupervisionSettings, Tier};
use crate::core::orchestrator::{Orchestrator, OrchestratorSinks, OrchestratorSummary};
use crate::core::registry::AgentRegistry;
use crate::core::status::StatusUpdate;
use crate::core::usage::InvocationRecord;

const CHAT_ID: i64 = 7;
const SUMMARY_OK: &str =
    r#"echo '{"type":"result","result":"SUMMARY_OK","total_cost_usd":0.01}'"#;
const SUMMARY_FAILS: &str = "exit 1";

struct Harness {
    _dir: tempfile::TempDir,
    orchestrator: Orchestrator,
    registry: Arc<AgentRegistry>,
    statuses: Arc<Mutex<Vec<StatusUpdate>>>,
    records: Arc<Mutex<Vec<InvocationRecord>>>,
}

impl Harness {
    fn sinks(&self) -> OrchestratorSinks {
        let statuses = self.statuses.clone();
        let records = self.records.clone();
        OrchestratorSinks {
            status: Arc::new(move |update| statuses.lock().unwrap().push(update)),
            invocation: Arc::new(move |record| records.lock().unwrap().push(record)),
            raw: None,
        }
    }

    async fn execute(&self, cancel: CancellationToken) -> OrchestratorSummary {
        self.orchestrator
            .execute(CHAT_ID, &request(), cancel, self.sinks())
            .await
    }

    fn important_statuses(&self) -> Vec<String> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.important)
            .map(|s| s.message.clone())
            .collect()
    }
}

fn request() -> WorkRequest {
    WorkRequest {
        task: "fix it".to_string(),
        context: String::new(),
        urgency: Urgency::Normal,
    }
}

fn fast_supervision() -> SupervisionSettings {
    SupervisionSettings {
        worker_timeout: Duration::from_secs(5),
        heartbeat_interval: Duration::from_secs(30),
        stall_check_interval: Duration::from_millis(100),
        stall_warning: Duration::from_secs(30),
        stall_kill: Duration::from_secs(60),
        orchestration_timeout: Duration::from_secs(30),
        retry_backoff: Duration::from_millis(50),
        summary_timeout: Duration::from_secs(3),
    }
}

/// Build a harness around a stub assistant. `planner_result` is the text
/// the planning call "replies" with; `worker_cases` is a shell `case`
/// snippet matched against worker prompts before the generic fallback.
fn harness(
    planner_result: &str,
    worker_cases: &str,
    summary_line: &str,
    supervision: SupervisionSettings,
) -> Harness {
    use std::os::unix::fs::PermissionsExt;
    let dir = tempfile::tempdir().unwrap();

    let envelope = json!({
        "type": "result",
        "result": planner_result,
        "total_cost_usd": 0.05
    });
    std::fs::write(dir.path().join("plan.json"), envelope.to_string()).unwrap();

    let script = format!(
        "#!/bin/sh\n\
         DIR='{dir}'\n\
         prompt=\"$2\"\n\
         case \"$prompt\" in\n\
           \"Task:\"*) cat \"$DIR/plan.json\"; exit 0 ;;\n\
           \"Original request:\"*) {summary}; exit 0 ;;\n\
         esac\n\
         {cases}\n\
         echo '{{\"type\":\"result\",\"result\":\"generic done\",\"total_cost_usd\":0.1}}'\n",
        dir = dir.path().display(),
        summary = summary_line,
        cases = worker_cases,
    );
    let bin = dir.path().join("assistant.sh");
    std::fs::write(&bin, script).unwrap();
    std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = RuntimeConfig::from_env();
    config.assistant_bin = bin.to_string_lossy().to_string();
    config.data_dir = dir.path().to_path_buf();
    config.working_dir = dir.path().to_path_buf();
    let config = Arc::new(config);

    let registry = Arc::new(AgentRegistry::new());
    let invoker = Arc::new(AssistantInvoker::new(config.assistant_bin.clone()));
    let orchestrator =
        Orchestrator::new(invoker, registry.clone(), config).with_supervision(supervision);

    Harness {
        _dir: dir,
        orchestrator,
        registry,
        statuses: Arc::new(Mutex::new(Vec::new())),
        records: Arc::new(Mutex::new(Vec::new())),
    }
}

fn simple_plan(worker_prompts: &[(&str, &str)], sequential: bool) -> String {
    let workers: Vec<serde_json::Value> = worker_prompts
        .iter()
        .map(|(id, prompt)| json!({"id": id, "description": id, "prompt": prompt, "dependsOn": []}))
        .collect();
    json!({"type": "plan", "summary": "test plan", "workers": workers, "sequential": sequential})
        .to_string()
}

// --- happy path ---

#[tokio::test]
async fn sequential_plan_runs_workers_in_order() {
    let plan = simple_plan(&[("w1", "WORKER_ONE"), ("w2", "WORKER_TWO")], true);
    let h = harness(&plan, "", SUMMARY_OK, fast_supervision());

    let summary = h.execute(CancellationToken::new()).await;

    assert!(summary.overall_success);
    assert_eq!(summary.summary, "SUMMARY_OK");
    assert_eq!(summary.worker_results.len(), 2);
    assert_eq!(summary.worker_results[0].task_id, "w1");
    assert_eq!(summary.worker_results[1].task_id, "w2");
    assert!(summary.worker_results.iter().all(|r| r.success));

    // planning + 2 workers + summary, emitted in that order
    let tiers: Vec<Tier> = h.records.lock().unwrap().iter().map(|r| r.tier).collect();
    assert_eq!(
        tiers,
        vec![Tier::Orchestrator, Tier::Worker, Tier::Worker, Tier::Orchestrator]
    );

    // planning 0.05 + workers 0.1 each + summary 0.01
    assert!((summary.total_cost_usd - 0.26).abs() < 1e-9);

    // plan breakdown was announced as an important update
    assert!(
        h.statuses
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.important && s.message.contains("1. w1"))
    );

    // registry entry is released
    assert!(h.registry.active_orchestrator(CHAT_ID).is_none());
}

#[tokio::test]
async fn oversized_plan_is_capped_at_ten_workers() {
    let prompts: Vec<(String, String)> = (1..=12)
        .map(|i| (format!("w{}", i), format!("WORKER_{}", i)))
        .collect();
    let refs: Vec<(&str, &str)> = prompts
        .iter()
        .map(|(id, p)| (id.as_str(), p.as_str()))
        .collect();
    let plan = simple_plan(&refs, true);
    let h = harness(&plan, "", SUMMARY_OK, fast_supervision());

    let summary = h.execute(CancellationToken::new()).await;

    assert!(summary.overall_success);
    assert_eq!(summary.worker_results.len(), 10);
    let ids: Vec<&str> = summary
        .worker_results
        .iter()
        .map(|r| r.task_id.as_str())
        .collect();
    assert_eq!(ids, vec!["w1", "w2", "w3", "w4", "w5", "w6", "w7", "w8", "w9", "w10"]);
}

// --- failure handling ---

#[tokio::test]
async fn sequential_failure_skips_remaining_workers() {
    let plan = simple_plan(
        &[("w1", "WORKER_OK"), ("w2", "WORKER_BAD"), ("w3", "WORKER_OK")],
        true,
    );
    let cases = r#"case "$prompt" in
  *WORKER_BAD*) echo '{"type":"result","result":"boom","is_error":true,"total_cost_usd":0.02}'; exit 0 ;;
esac"#;
    let h = harness(&plan, cases, SUMMARY_FAILS, fast_supervision());

    let summary = h.execute(CancellationToken::new()).await;

    assert!(!summary.overall_success);
    assert_eq!(summary.worker_results.len(), 2);
    assert!(summary.worker_results[0].success);
    assert!(!summary.worker_results[1].success);
    // the synthesized summary carries the fail-fast notice
    assert!(summary.summary.contains("skipped"));
    assert!(
        h.important_statuses()
            .iter()
            .any(|m| m.contains("skipping 1 remaining"))
    );
}

#[tokio::test]
async fn worker_timeout_reports_timed_out_and_fails_fast() {
    let plan = simple_plan(&[("w1", "WORKER_SLOW"), ("w2", "WORKER_OK")], true);
    let cases = r#"case "$prompt" in
  *WORKER_SLOW*) sleep 10; echo '{"type":"result","result":"too late"}'; exit 0 ;;
esac"#;
    let mut supervision = fast_supervision();
    supervision.worker_timeout = Duration::from_millis(300);
    let h = harness(&plan, cases, SUMMARY_FAILS, supervision);

    let summary = h.execute(CancellationToken::new()).await;

    // timed out, retried once (timeout text is transient), timed out again
    assert_eq!(summary.worker_results.len(), 1);
    assert_eq!(summary.worker_results[0].result, "timed out");
    assert_eq!(summary.worker_results[0].task_id, "w1-retry");
    assert!(!summary.overall_success);
    assert!(summary.summary.contains("skipped"));
}

#[tokio::test]
async fn plan_parse_failure_produces_failed_summary() {
    let h = harness("Sorry, cannot plan.", "", SUMMARY_OK, fast_supervision());

    let summary = h.execute(CancellationToken::new()).await;

    assert!(!summary.overall_success);
    assert!(summary.worker_results.is_empty());
    assert!(summary.summary.starts_with("Planning failed"));
    assert!(h.registry.active_orchestrator(CHAT_ID).is_none());
}

#[tokio::test]
async fn second_orchestration_for_same_chat_is_rejected() {
    let plan = simple_plan(&[("w1", "WORKER_OK")], true);
    let h = harness(&plan, "", SUMMARY_OK, fast_supervision());

    // Simulate an in-flight orchestration for the chat.
    h.registry.register_orchestrator(CHAT_ID, "existing").unwrap();

    let summary = h.execute(CancellationToken::new()).await;
    assert!(!summary.overall_success);
    assert!(summary.summary.contains("Could not start orchestration"));
}

// --- parallel scheduling ---

#[tokio::test]
async fn parallel_rounds_respect_dependencies() {
    let plan = json!({
        "type": "plan",
        "summary": "diamond",
        "workers": [
            {"id": "a", "description": "A", "prompt": "WORKER_A", "dependsOn": []},
            {"id": "b", "description": "B", "prompt": "WORKER_B", "dependsOn": ["a"]},
            {"id": "c", "description": "C", "prompt": "WORKER_C", "dependsOn": ["a"]},
            {"id": "d", "description": "D", "prompt": "WORKER_D", "dependsOn": ["b", "c"]}
        ],
        "sequential": false
    })
    .to_string();
    let h = harness(&plan, "", SUMMARY_OK, fast_supervision());

    let summary = h.execute(CancellationToken::new()).await;

    assert!(summary.overall_success);
    assert_eq!(summary.worker_results.len(), 4);
    let position = |id: &str| {
        summary
            .worker_results
            .iter()
            .position(|r| r.task_id == id)
            .unwrap_or_else(|| panic!("no result for {}", id))
    };
    // a strictly before its dependents; d strictly last
    assert!(position("a") < position("b"));
    assert!(position("a") < position("c"));
    assert_eq!(position("d"), 3);
}

#[tokio::test]
async fn unsatisfiable_dependency_aborts_with_deadlock() {
    let plan = json!({
        "type": "plan",
        "summary": "broken",
        "workers": [
            {"id": "a", "description": "A", "prompt": "WORKER_A", "dependsOn": []},
            {"id": "b", "description": "B", "prompt": "WORKER_B", "dependsOn": ["ghost"]}
        ],
        "sequential": false
    })
    .to_string();
    let h = harness(&plan, "", SUMMARY_FAILS, fast_supervision());

    let summary = h.execute(CancellationToken::new()).await;

    assert!(!summary.overall_success);
    assert_eq!(summary.worker_results.len(), 1);
    assert_eq!(summary.worker_results[0].task_id, "a");
    assert!(summary.summary.contains("deadlock"));
    assert!(
        h.important_statuses()
            .iter()
            .any(|m| m.contains("deadlock"))
    );
}

#[tokio::test]
async fn failed_dependency_skips_transitive_dependents() {
    let plan = json!({
        "type": "plan",
        "summary": "chain",
        "workers": [
            {"id": "a", "description": "A", "prompt": "WORKER_BAD", "dependsOn": []},
            {"id": "b", "description": "B", "prompt": "WORKER_B", "dependsOn": ["a"]},
            {"id": "c", "description": "C", "prompt": "WORKER_C", "dependsOn": ["b"]},
            {"id": "x", "description": "X", "prompt": "WORKER_X", "dependsOn": []}
        ],
        "sequential": false
    })
    .to_string();
    let cases = r#"case "$prompt" in
  *WORKER_BAD*) echo '{"type":"result","result":"boom","is_error":true}'; exit 0 ;;
esac"#;
    let h = harness(&plan, cases, SUMMARY_FAILS, fast_supervision());

    let summary = h.execute(CancellationToken::new()).await;

    assert!(!summary.overall_success);
    // a (failed) and x (independent) ran; b and c were skipped
    let ids: Vec<&str> = summary
        .worker_results
        .iter()
        .map(|r| r.task_id.as_str())
        .collect();
    assert!(ids.contains(&"a"));
    assert!(ids.contains(&"x"));
    assert!(!ids.contains(&"b"));
    assert!(!ids.contains(&"c"));
    assert!(summary.summary.contains("skipped"));
}

// --- retries ---

#[tokio::test]
async fn transient_error_is_retried_once_and_replaced() {
    let plan = simple_plan(&[("w1", "WORKER_RL")], true);
    let cases = r#"case "$prompt" in
  *WORKER_RL*)
    if [ -f "$DIR/rl_done" ]; then
      echo '{"type":"result","result":"recovered","total_cost_usd":0.2}'
    else
      touch "$DIR/rl_done"
      echo '{"type":"result","result":"Error: 429 rate limit","total_cost_usd":0.02}'
    fi
    exit 0 ;;
esac"#;
    let h = harness(&plan, cases, SUMMARY_OK, fast_supervision());

    let summary = h.execute(CancellationToken::new()).await;

    assert!(summary.overall_success);
    assert_eq!(summary.worker_results.len(), 1);
    assert_eq!(summary.worker_results[0].task_id, "w1-retry");
    assert_eq!(summary.worker_results[0].result, "recovered");

    // both attempts hit the assistant: planning + 2 worker calls + summary
    assert_eq!(h.records.lock().unwrap().len(), 4);

    // both attempts' costs count: 0.05 + 0.02 + 0.2 + 0.01
    assert!((summary.total_cost_usd - 0.28).abs() < 1e-9);
}

// --- cancellation ---

#[tokio::test]
async fn cancelling_the_run_returns_a_summary_promptly() {
    let plan = simple_plan(&[("w1", "WORKER_SLEEP")], true);
    let cases = r#"case "$prompt" in
  *WORKER_SLEEP*) sleep 10; echo '{"type":"result","result":"too late"}'; exit 0 ;;
esac"#;
    let h = harness(&plan, cases, SUMMARY_FAILS, fast_supervision());

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let summary = h.execute(cancel).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!summary.overall_success);
    assert_eq!(summary.worker_results.len(), 1);
    assert_eq!(summary.worker_results[0].result, "killed by user");
    assert!(summary.summary.contains("0 of 1 workers succeeded"));
}

#[tokio::test]
async fn killing_one_worker_leaves_siblings_alone() {
    let plan = json!({
        "type": "plan",
        "summary": "fanout",
        "workers": [
            {"id": "w1", "description": "one", "prompt": "WORKER_OK1", "dependsOn": []},
            {"id": "w2", "description": "two", "prompt": "WORKER_SLOW", "dependsOn": []},
            {"id": "w3", "description": "three", "prompt": "WORKER_OK2", "dependsOn": []}
        ],
        "sequential": false
    })
    .to_string();
    let cases = r#"case "$prompt" in
  *WORKER_SLOW*) sleep 10; echo '{"type":"result","result":"too late"}'; exit 0 ;;
esac"#;
    let h = harness(&plan, cases, SUMMARY_OK, fast_supervision());

    // Kill worker #2 through the registry handle once it is running.
    let registry = h.registry.clone();
    tokio::spawn(async move {
        for _ in 0..100 {
            if let Some(orch) = registry.active_orchestrator(CHAT_ID)
                && registry.cancel_worker(orch.id, 2)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    let summary = h.execute(CancellationToken::new()).await;

    assert!(!summary.overall_success);
    assert_eq!(summary.worker_results.len(), 3);
    let by_id = |id: &str| {
        summary
            .worker_results
            .iter()
            .find(|r| r.task_id == id)
            .unwrap_or_else(|| panic!("no result for {}", id))
    };
    assert!(by_id("w1").success);
    assert!(by_id("w3").success);
    assert!(!by_id("w2").success);
    assert_eq!(by_id("w2").result, "killed by user");
}

// --- restart derivation ---

#[tokio::test]
async fn restart_mention_with_service_token_sets_needs_restart() {
    let plan = simple_plan(&[("w1", "WORKER_RESTART")], true);
    let cases = r#"case "$prompt" in
  *WORKER_RESTART*) echo '{"type":"result","result":"Done. You should restart the gateway now.","total_cost_usd":0.1}'; exit 0 ;;
esac"#;
    let h = harness(&plan, cases, SUMMARY_OK, fast_supervision());

    let summary = h.execute(CancellationToken::new()).await;
    assert!(summary.overall_success);
    assert!(summary.needs_restart);
}

#[tokio::test]
async fn plain_success_does_not_need_restart() {
    let plan = simple_plan(&[("w1", "WORKER_OK")], true);
    let h = harness(&plan, "", SUMMARY_OK, fast_supervision());

    let summary = h.execute(CancellationToken::new()).await;
    assert!(summary.overall_success);
    assert!(!summary.needs_restart);
}
