//! Orchestrator: plan, execute, summarize.
//!
//! Phase 1 plans a Work Request into worker tasks via a tools-disabled
//! assistant call. Phase 2 executes the tasks, serially in list order or in
//! dependency-gated parallel rounds, with per-worker supervision and
//! fail-fast. Phase 3 condenses the results into a chat-ready summary,
//! falling back to a deterministic one when the summary call fails.
//!
//! Cancellation stacks three channels: the caller's token aborts the whole
//! run, the orchestration timeout is a child of it, and each worker gets a
//! child of that, so killing one worker never touches its siblings.

mod types;
mod worker;

#[cfg(test)]
mod tests;

pub use types::{
    MAX_RESULT_CHARS, MAX_WORKERS, OrchestratorSummary, Plan, TRANSIENT_PATTERNS, WorkerResult,
    WorkerTask, is_transient_error, truncate_result,
};

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::assistant::{AssistantInvoker, InvokeError, InvokeRequest, InvokeSinks, parse};
use crate::core::chat::{Urgency, WorkRequest};
use crate::core::config::{RuntimeConfig, SupervisionSettings, Tier};
use crate::core::registry::{AgentPhase, AgentRegistry};
use crate::core::status::{InvocationSink, RawPayloadSink, StatusSink, StatusUpdate};
use crate::core::usage::InvocationRecord;

use worker::WorkerEnv;

const PLANNING_SYSTEM_PROMPT: &str = "\
You are the planning layer of an orchestration runtime. Break the request \
below into 1 to 10 worker tasks and reply with ONLY this JSON object, no \
other text:
{\"type\":\"plan\",\"summary\":\"<one-line plan summary>\",\
\"workers\":[{\"id\":\"w1\",\"description\":\"<short human label>\",\
\"prompt\":\"<self-contained instruction for one worker>\",\"dependsOn\":[]}],\
\"sequential\":true}
Rules: worker ids are unique; dependsOn may only reference earlier workers; \
use sequential:true when tasks build on each other and false when they are \
independent; every prompt must make sense on its own.";

const SUMMARY_SYSTEM_PROMPT: &str = "\
You summarize finished orchestration runs for a chat message. Plain text \
only, no markdown, no personality. In a few sentences: what succeeded, what \
failed, and anything the user still needs to do.";

/// Effect channels supplied by the caller. Each sink is invoked
/// synchronously and must not block.
#[derive(Clone)]
pub struct OrchestratorSinks {
    pub status: StatusSink,
    pub invocation: InvocationSink,
    pub raw: Option<RawPayloadSink>,
}

pub struct Orchestrator {
    invoker: Arc<AssistantInvoker>,
    registry: Arc<AgentRegistry>,
    config: Arc<RuntimeConfig>,
    supervision: SupervisionSettings,
}

impl Orchestrator {
    pub fn new(
        invoker: Arc<AssistantInvoker>,
        registry: Arc<AgentRegistry>,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        Self {
            invoker,
            registry,
            config,
            supervision: SupervisionSettings::default(),
        }
    }

    pub fn with_supervision(mut self, supervision: SupervisionSettings) -> Self {
        self.supervision = supervision;
        self
    }

    /// Run a full orchestration. Always returns a summary; cancellation and
    /// failures are folded into it rather than raised.
    pub async fn execute(
        &self,
        chat_id: i64,
        request: &WorkRequest,
        cancel: CancellationToken,
        sinks: OrchestratorSinks,
    ) -> OrchestratorSummary {
        let orchestrator_id = match self.registry.register_orchestrator(chat_id, &request.task) {
            Ok(id) => id,
            Err(e) => {
                return OrchestratorSummary::failed(format!("Could not start orchestration: {}", e));
            }
        };
        let run_id = uuid::Uuid::new_v4();
        info!("Orchestration {} started for chat {}", run_id, chat_id);

        let cost_total: Arc<Mutex<f64>> = Arc::new(Mutex::new(0.0));
        let current_cost = {
            let cost_total = cost_total.clone();
            move || *cost_total.lock().unwrap_or_else(|e| e.into_inner())
        };
        let add_cost = |cost: Option<f64>| {
            if let Some(cost) = cost {
                *cost_total.lock().unwrap_or_else(|e| e.into_inner()) += cost;
            }
        };

        // --- Phase 1: planning ---

        (sinks.status)(StatusUpdate::transient("Planning the work..."));
        let plan = match self.plan(chat_id, request, &cancel, &sinks, &add_cost).await {
            Ok(plan) => plan,
            Err(message) => {
                let cost = current_cost();
                self.registry.complete(orchestrator_id, false, Some(cost));
                let mut summary = OrchestratorSummary::failed(message);
                summary.total_cost_usd = cost;
                return summary;
            }
        };

        (sinks.status)(StatusUpdate::plan_breakdown(plan_breakdown_message(&plan)));
        self.registry
            .update_phase(orchestrator_id, AgentPhase::Executing);
        self.registry.update_description(
            orchestrator_id,
            &format!("{} ({} workers)", request.task, plan.workers.len()),
        );

        // --- Phase 2: execution ---

        let orch_cancel = cancel.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let timeout_guard = {
            let flag = timed_out.clone();
            let token = orch_cancel.clone();
            let limit = self.supervision.orchestration_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                flag.store(true, Ordering::SeqCst);
                token.cancel();
            })
        };

        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<usize>();
        self.registry.set_retry_handle(orchestrator_id, retry_tx);

        let env = WorkerEnv {
            invoker: self.invoker.clone(),
            config: self.config.clone(),
            supervision: self.supervision.clone(),
            registry: self.registry.clone(),
            status: sinks.status.clone(),
            invocation: sinks.invocation.clone(),
            raw: sinks.raw.clone(),
            chat_id,
            orchestrator_id,
            cost_total: cost_total.clone(),
        };

        let mut results: Vec<WorkerResult> = Vec::new();
        let mut notices: Vec<String> = Vec::new();
        let mut deadlocked = false;

        if plan.sequential {
            self.run_sequential(
                &env,
                &plan,
                request,
                &orch_cancel,
                &sinks,
                &mut retry_rx,
                &mut results,
                &mut notices,
            )
            .await;
        } else {
            self.run_parallel(
                &env,
                &plan,
                request,
                &orch_cancel,
                &sinks,
                &mut retry_rx,
                &mut results,
                &mut notices,
                &mut deadlocked,
            )
            .await;
        }

        timeout_guard.abort();
        if timed_out.load(Ordering::SeqCst) {
            notices.push("orchestration timeout reached; in-flight workers were cancelled".to_string());
            (sinks.status)(StatusUpdate::important(
                "Orchestration timed out; stopping remaining work",
            ));
        }

        // --- Phase 3: summary ---

        self.registry
            .update_phase(orchestrator_id, AgentPhase::Summarizing);
        // The summary runs under the caller's token, not the orchestration
        // timeout: a timed-out run still gets summarized.
        let (summary_text, structured_restart) = self
            .summarize(chat_id, request, &results, &notices, current_cost(), &cancel, &sinks, &add_cost)
            .await;

        let needs_restart = structured_restart
            || derive_needs_restart(&self.config.service_tokens, &plan.summary, &request.task, &results);

        let overall_success = !results.is_empty()
            && results.len() == plan.workers.len()
            && results.iter().all(|r| r.success)
            && !deadlocked;

        let total_cost_usd = current_cost();
        self.registry
            .complete(orchestrator_id, overall_success, Some(total_cost_usd));
        info!(
            "Orchestration {} finished: success={} cost=${:.4}",
            run_id, overall_success, total_cost_usd
        );

        OrchestratorSummary {
            overall_success,
            summary: summary_text,
            worker_results: results,
            total_cost_usd,
            needs_restart,
        }
    }

    async fn plan(
        &self,
        chat_id: i64,
        request: &WorkRequest,
        cancel: &CancellationToken,
        sinks: &OrchestratorSinks,
        add_cost: &dyn Fn(Option<f64>),
    ) -> Result<Plan, String> {
        let urgency = match request.urgency {
            Urgency::Quick => "quick",
            Urgency::Normal => "normal",
        };
        let planning_request = InvokeRequest {
            prompt: format!(
                "Task: {}\nContext: {}\nUrgency: {}\nWorking directory: {}",
                request.task,
                request.context,
                urgency,
                self.config.working_dir.display()
            ),
            max_turns: 1,
            system_prompt: Some(PLANNING_SYSTEM_PROMPT.to_string()),
            model: self.config.planning.model.clone(),
            // Planning is pure text generation.
            allowed_tools: Some(String::new()),
            session_id: None,
            cwd: Some(self.config.working_dir.clone()),
            timeout: self.config.planning.timeout,
        };

        let outcome = match self
            .invoker
            .invoke(&planning_request, cancel, &InvokeSinks::default())
            .await
        {
            Ok(outcome) => outcome,
            Err(InvokeError::Cancelled) => {
                return Err("Cancelled before planning finished.".to_string());
            }
            Err(e) => return Err(format!("Planning failed: {}", e)),
        };
        add_cost(outcome.cost_usd);
        (sinks.invocation)(InvocationRecord::from_outcome(
            chat_id,
            Tier::Orchestrator,
            &outcome,
        ));
        if outcome.is_error {
            return Err(format!("Planning failed: {}", outcome.text));
        }

        let Some(mut plan) = Plan::parse(&outcome.text) else {
            return Err(format!(
                "Planning failed: could not parse the planner response: {}",
                truncate_result(outcome.text.trim(), 200)
            ));
        };
        let dropped = plan.cap();
        if dropped > 0 {
            warn!("Plan exceeded {} workers, dropped {}", MAX_WORKERS, dropped);
            (sinks.status)(StatusUpdate::transient(format!(
                "Plan was capped at {} workers ({} dropped)",
                MAX_WORKERS, dropped
            )));
        }
        plan.validate().map_err(|e| format!("Planning failed: {}", e))?;
        Ok(plan)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_sequential(
        &self,
        env: &WorkerEnv,
        plan: &Plan,
        request: &WorkRequest,
        orch_cancel: &CancellationToken,
        sinks: &OrchestratorSinks,
        retry_rx: &mut mpsc::UnboundedReceiver<usize>,
        results: &mut Vec<WorkerResult>,
        notices: &mut Vec<String>,
    ) {
        let total = plan.workers.len();
        for (index, task) in plan.workers.iter().enumerate() {
            if orch_cancel.is_cancelled() {
                notices.push(format!("{} worker(s) never started", total - index));
                break;
            }
            let context = sequential_context(plan, request, index, results);
            let prompt = format!("{}\n\n{}", context, task.prompt);
            let result = worker::run_with_retry(env, task, index + 1, prompt, orch_cancel).await;
            let failed = !result.success;
            (sinks.status)(StatusUpdate::worker_complete(
                worker_complete_message(index + 1, &result),
                progress_percent(index + 1, total),
            ));
            results.push(result);

            self.drain_retries(env, plan, request, retry_rx, results, orch_cancel)
                .await;

            if failed {
                let skipped = total - index - 1;
                if skipped > 0 {
                    (sinks.status)(StatusUpdate::important(format!(
                        "Worker #{} failed; skipping {} remaining worker(s)",
                        index + 1,
                        skipped
                    )));
                    notices.push(format!(
                        "fail-fast: {} worker(s) skipped after worker #{} failed",
                        skipped,
                        index + 1
                    ));
                }
                break;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_parallel(
        &self,
        env: &WorkerEnv,
        plan: &Plan,
        request: &WorkRequest,
        orch_cancel: &CancellationToken,
        sinks: &OrchestratorSinks,
        retry_rx: &mut mpsc::UnboundedReceiver<usize>,
        results: &mut Vec<WorkerResult>,
        notices: &mut Vec<String>,
        deadlocked: &mut bool,
    ) {
        let total = plan.workers.len();
        let mut remaining: Vec<usize> = (0..total).collect();
        let mut completed_ids: HashSet<String> = HashSet::new();
        let mut failed_ids: HashSet<String> = HashSet::new();

        loop {
            if orch_cancel.is_cancelled() {
                if !remaining.is_empty() {
                    notices.push(format!("{} worker(s) never started", remaining.len()));
                }
                break;
            }

            let ready: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&i| {
                    plan.workers[i]
                        .depends_on
                        .iter()
                        .all(|dep| completed_ids.contains(dep))
                })
                .collect();

            if ready.is_empty() {
                if !remaining.is_empty() {
                    *deadlocked = true;
                    notices.push(format!(
                        "dependency deadlock: {} worker(s) could never be scheduled",
                        remaining.len()
                    ));
                    (sinks.status)(StatusUpdate::important(
                        "Dependency deadlock in the plan; aborting remaining workers",
                    ));
                }
                break;
            }

            let mut join = JoinSet::new();
            for &index in &ready {
                let task = plan.workers[index].clone();
                let context = dependency_context(plan, request, &task, results);
                let prompt = format!("{}\n\n{}", context, task.prompt);
                let env = env.clone();
                let token = orch_cancel.clone();
                join.spawn(async move {
                    let result =
                        worker::run_with_retry(&env, &task, index + 1, prompt, &token).await;
                    (index, result)
                });
            }
            remaining.retain(|i| !ready.contains(i));

            while let Some(joined) = join.join_next().await {
                let Ok((index, result)) = joined else {
                    continue;
                };
                let base_id = plan.workers[index].id.clone();
                completed_ids.insert(base_id.clone());
                if !result.success {
                    failed_ids.insert(base_id);
                }
                (sinks.status)(StatusUpdate::worker_complete(
                    worker_complete_message(index + 1, &result),
                    progress_percent(results.len() + 1, total),
                ));
                results.push(result);
            }

            // Fail-fast: anything transitively depending on a failure is moot.
            if !failed_ids.is_empty() {
                let mut blocked = failed_ids.clone();
                loop {
                    let mut grew = false;
                    for &i in &remaining {
                        let w = &plan.workers[i];
                        if !blocked.contains(&w.id)
                            && w.depends_on.iter().any(|dep| blocked.contains(dep))
                        {
                            blocked.insert(w.id.clone());
                            grew = true;
                        }
                    }
                    if !grew {
                        break;
                    }
                }
                let skipped: Vec<usize> = remaining
                    .iter()
                    .copied()
                    .filter(|&i| blocked.contains(&plan.workers[i].id))
                    .collect();
                if !skipped.is_empty() {
                    remaining.retain(|i| !skipped.contains(i));
                    (sinks.status)(StatusUpdate::important(format!(
                        "Skipping {} worker(s) that depend on a failed worker",
                        skipped.len()
                    )));
                    notices.push(format!(
                        "fail-fast: {} dependent worker(s) skipped",
                        skipped.len()
                    ));
                }
            }

            self.drain_retries(env, plan, request, retry_rx, results, orch_cancel)
                .await;

            if remaining.is_empty() {
                break;
            }
        }
    }

    /// Service external `retry <n>` requests queued since the last check.
    /// The re-run replaces the worker's previous result in place.
    async fn drain_retries(
        &self,
        env: &WorkerEnv,
        plan: &Plan,
        request: &WorkRequest,
        retry_rx: &mut mpsc::UnboundedReceiver<usize>,
        results: &mut Vec<WorkerResult>,
        orch_cancel: &CancellationToken,
    ) {
        while let Ok(worker_number) = retry_rx.try_recv() {
            let Some(task) = plan.workers.get(worker_number - 1) else {
                warn!("Ignoring retry request for unknown worker #{}", worker_number);
                continue;
            };
            let retry_id = format!("{}-retry", task.id);
            let Some(position) = results
                .iter()
                .position(|r| r.task_id == task.id || r.task_id == retry_id)
            else {
                warn!(
                    "Ignoring retry request for worker #{} that has not run",
                    worker_number
                );
                continue;
            };

            let context = if plan.sequential {
                let prior = &results[..position.min(worker_number - 1)];
                sequential_context(plan, request, worker_number - 1, prior)
            } else {
                dependency_context(plan, request, task, results)
            };
            let prompt = format!("{}\n\n{}", context, task.prompt);
            let result =
                worker::run_external_retry(env, task, worker_number, prompt, orch_cancel).await;
            results[position] = result;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn summarize(
        &self,
        chat_id: i64,
        request: &WorkRequest,
        results: &[WorkerResult],
        notices: &[String],
        cost_so_far: f64,
        cancel: &CancellationToken,
        sinks: &OrchestratorSinks,
        add_cost: &dyn Fn(Option<f64>),
    ) -> (String, bool) {
        let mut input = format!("Original request: {}\n\nWorker results:\n", request.task);
        if results.is_empty() {
            input.push_str("(no workers ran)\n");
        }
        for result in results {
            input.push_str(&format!(
                "[{} — {}]\n{}\n\n",
                result.task_id,
                if result.success { "SUCCESS" } else { "FAILED" },
                truncate_result(&result.result, MAX_RESULT_CHARS)
            ));
        }
        for notice in notices {
            input.push_str(&format!("Notice: {}\n", notice));
        }
        input.push_str(&format!("\nTotal cost so far: ${:.4}\n", cost_so_far));

        let summary_request = InvokeRequest {
            prompt: input,
            max_turns: 1,
            system_prompt: Some(SUMMARY_SYSTEM_PROMPT.to_string()),
            model: self.config.summary.model.clone(),
            allowed_tools: Some(String::new()),
            session_id: None,
            cwd: Some(self.config.working_dir.clone()),
            timeout: Some(self.supervision.summary_timeout),
        };

        match self
            .invoker
            .invoke(&summary_request, cancel, &InvokeSinks::default())
            .await
        {
            Ok(outcome) => {
                add_cost(outcome.cost_usd);
                (sinks.invocation)(InvocationRecord::from_outcome(
                    chat_id,
                    Tier::Orchestrator,
                    &outcome,
                ));
                let structured_restart = outcome
                    .raw
                    .as_ref()
                    .and_then(|v| parse::field(v, "needs_restart"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let text = if outcome.text.trim().is_empty() || outcome.is_error {
                    synthesize_summary(results, notices)
                } else {
                    outcome.text
                };
                (text, structured_restart)
            }
            Err(e) => {
                warn!("Summary call failed ({}), synthesizing locally", e);
                (synthesize_summary(results, notices), false)
            }
        }
    }
}

/// Deterministic fallback when the summary call fails or returns nothing.
fn synthesize_summary(results: &[WorkerResult], notices: &[String]) -> String {
    let succeeded = results.iter().filter(|r| r.success).count();
    let mut summary = format!("{} of {} workers succeeded.", succeeded, results.len());
    for result in results {
        if result.success {
            summary.push_str(&format!("\n- {}: ok", result.task_id));
        } else {
            summary.push_str(&format!(
                "\n- {}: {}",
                result.task_id,
                truncate_result(&result.result, 200)
            ));
        }
    }
    for notice in notices {
        summary.push_str(&format!("\n{}", notice));
    }
    summary
}

fn plan_breakdown_message(plan: &Plan) -> String {
    let mut message = String::new();
    if !plan.summary.is_empty() {
        message.push_str(&format!("Plan: {}\n", plan.summary));
    }
    message.push_str(&format!(
        "Mode: {}\n",
        if plan.sequential { "sequential" } else { "parallel" }
    ));
    for (index, task) in plan.workers.iter().enumerate() {
        message.push_str(&format!("{}. {}\n", index + 1, worker_label(task)));
    }
    message.trim_end().to_string()
}

fn worker_label(task: &WorkerTask) -> &str {
    if task.description.is_empty() {
        &task.id
    } else {
        &task.description
    }
}

fn worker_complete_message(worker_number: usize, result: &WorkerResult) -> String {
    format!(
        "Worker #{} {}",
        worker_number,
        if result.success { "finished" } else { "failed" }
    )
}

fn progress_percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done * 100) / total).min(100) as u8
}

/// Plan overview shared by both context-block shapes: goal, summary, mode,
/// worker count and the numbered task list.
fn plan_overview(plan: &Plan, request: &WorkRequest) -> String {
    let mut overview = String::from("ORCHESTRATION CONTEXT\n");
    overview.push_str(&format!("Goal: {}\n", request.task));
    if !request.context.is_empty() {
        overview.push_str(&format!("Details: {}\n", request.context));
    }
    if !plan.summary.is_empty() {
        overview.push_str(&format!("Plan summary: {}\n", plan.summary));
    }
    overview.push_str(&format!(
        "Mode: {}\n",
        if plan.sequential { "sequential" } else { "parallel" }
    ));
    overview.push_str(&format!("Workers: {} total\n", plan.workers.len()));
    for (index, task) in plan.workers.iter().enumerate() {
        overview.push_str(&format!("  {}. {}\n", index + 1, worker_label(task)));
    }
    overview
}

/// Context for a sequential worker: the plan overview, its position, and
/// the results of all strictly-prior workers.
pub(crate) fn sequential_context(
    plan: &Plan,
    request: &WorkRequest,
    index: usize,
    prior: &[WorkerResult],
) -> String {
    let mut context = plan_overview(plan, request);
    context.push_str(&format!(
        "\nYou are worker #{} of {}.\n",
        index + 1,
        plan.workers.len()
    ));
    if !prior.is_empty() {
        context.push_str("\nResults from earlier workers:\n");
        for result in prior {
            context.push_str(&format!(
                "[{} — {}]\n{}\n\n",
                result.task_id,
                if result.success { "SUCCESS" } else { "FAILED" },
                truncate_result(&result.result, MAX_RESULT_CHARS)
            ));
        }
    }
    context
}

/// Context for a parallel worker: the plan overview, its position, and the
/// results of exactly its declared dependencies.
pub(crate) fn dependency_context(
    plan: &Plan,
    request: &WorkRequest,
    task: &WorkerTask,
    results: &[WorkerResult],
) -> String {
    let mut context = plan_overview(plan, request);
    if let Some(position) = plan.workers.iter().position(|w| w.id == task.id) {
        context.push_str(&format!(
            "\nYou are worker #{} of {}.\n",
            position + 1,
            plan.workers.len()
        ));
    }
    if !task.depends_on.is_empty() {
        context.push_str("\nResults from your dependencies:\n");
        for dep in &task.depends_on {
            let retry_id = format!("{}-retry", dep);
            if let Some(result) = results
                .iter()
                .find(|r| r.task_id == *dep || r.task_id == retry_id)
            {
                context.push_str(&format!(
                    "[{} — {}]\n{}\n\n",
                    dep,
                    if result.success { "SUCCESS" } else { "FAILED" },
                    truncate_result(&result.result, MAX_RESULT_CHARS)
                ));
            }
        }
    }
    context
}

/// A run needs a restart pass when the assistant said so outright, or when
/// the combined plan/task/result text mentions a restart of one of the
/// configured services.
fn derive_needs_restart(
    service_tokens: &[String],
    plan_summary: &str,
    task: &str,
    results: &[WorkerResult],
) -> bool {
    let mut haystack = format!("{} {} ", plan_summary, task);
    for result in results {
        haystack.push_str(&result.result);
        haystack.push(' ');
    }
    let haystack = haystack.to_lowercase();
    haystack.contains("restart") && service_tokens.iter().any(|token| haystack.contains(token))
}
