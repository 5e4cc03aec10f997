//! Worker execution: one task, one supervised assistant child process.
//!
//! Supervision per worker: a hard timeout, a heartbeat that refreshes the
//! registry and reports elapsed time, and a stall detector that first warns
//! and then kills when the child stops producing output. A transient
//! failure is retried exactly once after a short backoff, under a fresh
//! `<id>-retry` task id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::assistant::{AssistantInvoker, InvokeError, InvokeRequest, InvokeSinks};
use crate::core::config::{RuntimeConfig, SupervisionSettings, Tier};
use crate::core::registry::{AgentId, AgentPhase, AgentRegistry};
use crate::core::status::{InvocationSink, RawPayloadSink, StatusSink, StatusUpdate};
use crate::core::usage::InvocationRecord;

use super::types::{WorkerResult, WorkerTask, is_transient_error};

/// Everything a worker run needs, cloneable into spawned tasks.
#[derive(Clone)]
pub(super) struct WorkerEnv {
    pub invoker: Arc<AssistantInvoker>,
    pub config: Arc<RuntimeConfig>,
    pub supervision: SupervisionSettings,
    pub registry: Arc<AgentRegistry>,
    pub status: StatusSink,
    pub invocation: InvocationSink,
    pub raw: Option<RawPayloadSink>,
    pub chat_id: i64,
    pub orchestrator_id: AgentId,
    /// Shared cost accumulator; every attempt's cost lands here.
    pub cost_total: Arc<Mutex<f64>>,
}

impl WorkerEnv {
    pub fn add_cost(&self, cost: Option<f64>) {
        if let Some(cost) = cost {
            *self.cost_total.lock().unwrap_or_else(|e| e.into_inner()) += cost;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillReason {
    Stall,
}

/// Run a worker task, retrying once on a transient failure. The retry
/// replaces the first result; both attempts' costs are accumulated.
pub(super) async fn run_with_retry(
    env: &WorkerEnv,
    task: &WorkerTask,
    worker_number: usize,
    prompt: String,
    parent_cancel: &CancellationToken,
) -> WorkerResult {
    let agent_id = ensure_registered(env, task, worker_number);

    let first = run_supervised(env, task, worker_number, agent_id, prompt.clone(), parent_cancel)
        .await;

    // The transient check is on the result text alone: a structured error
    // subtype whose message mentions a rate limit is retried the same way a
    // hard failure is.
    let result = if is_transient_error(&first.result) && !parent_cancel.is_cancelled() {
        (env.status)(StatusUpdate::transient(format!(
            "Worker #{} hit a transient error, retrying once...",
            worker_number
        )));
        tokio::time::sleep(env.supervision.retry_backoff).await;

        let mut retry_task = task.clone();
        retry_task.id = format!("{}-retry", task.id);
        run_supervised(env, &retry_task, worker_number, agent_id, prompt, parent_cancel).await
    } else {
        first
    };

    env.registry.complete(agent_id, result.success, result.cost_usd);
    result
}

/// Re-run a worker on external request, under a fresh cancellation handle.
pub(super) async fn run_external_retry(
    env: &WorkerEnv,
    task: &WorkerTask,
    worker_number: usize,
    prompt: String,
    parent_cancel: &CancellationToken,
) -> WorkerResult {
    info!("Re-running worker #{} on external request", worker_number);
    let agent_id = ensure_registered(env, task, worker_number);
    let result =
        run_supervised(env, task, worker_number, agent_id, prompt, parent_cancel).await;
    env.registry.complete(agent_id, result.success, result.cost_usd);
    result
}

/// Look up the registry entry for this worker number, registering it on the
/// first attempt.
fn ensure_registered(env: &WorkerEnv, task: &WorkerTask, worker_number: usize) -> AgentId {
    if let Some(existing) = env
        .registry
        .worker_by_number(env.orchestrator_id, worker_number)
    {
        return existing.id;
    }
    match env.registry.register_worker(
        env.chat_id,
        env.orchestrator_id,
        worker_number,
        &task.description,
        &task.prompt,
    ) {
        Ok(id) => id,
        Err(e) => {
            // Registration is bookkeeping; execution proceeds regardless.
            warn!("Failed to register worker #{}: {}", worker_number, e);
            0
        }
    }
}

async fn run_supervised(
    env: &WorkerEnv,
    task: &WorkerTask,
    worker_number: usize,
    agent_id: AgentId,
    prompt: String,
    parent_cancel: &CancellationToken,
) -> WorkerResult {
    let worker_cancel = parent_cancel.child_token();
    env.registry.update_phase(agent_id, AgentPhase::Executing);
    env.registry.set_cancel_handle(agent_id, worker_cancel.clone());

    let started = Instant::now();
    let last_activity = Arc::new(Mutex::new(Instant::now()));
    let stall_warned = Arc::new(AtomicBool::new(false));
    let kill_reason: Arc<Mutex<Option<KillReason>>> = Arc::new(Mutex::new(None));

    let sinks = {
        let registry = env.registry.clone();
        let activity = last_activity.clone();
        let warned = stall_warned.clone();
        let output_registry = env.registry.clone();
        InvokeSinks {
            on_activity: Some(Arc::new(move || {
                *activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
                warned.store(false, Ordering::SeqCst);
                registry.touch_activity(agent_id);
            })),
            on_output: Some(Arc::new(move |chunk: &str| {
                output_registry.append_output(agent_id, chunk);
            })),
        }
    };

    let heartbeat = {
        let registry = env.registry.clone();
        let status = env.status.clone();
        let interval = env.supervision.heartbeat_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                registry.touch_activity(agent_id);
                let minutes = started.elapsed().as_secs() / 60;
                status(StatusUpdate::transient(format!(
                    "Worker #{} still running ({}m elapsed)",
                    worker_number, minutes
                )));
            }
        })
    };

    let stall_watch = {
        let status = env.status.clone();
        let activity = last_activity.clone();
        let warned = stall_warned.clone();
        let reason = kill_reason.clone();
        let cancel = worker_cancel.clone();
        let settings = env.supervision.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(settings.stall_check_interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                let idle = activity
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .elapsed();
                if idle >= settings.stall_kill {
                    *reason.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(KillReason::Stall);
                    status(StatusUpdate::important(format!(
                        "Worker #{} produced no output for {}s, killing it",
                        worker_number,
                        idle.as_secs()
                    )));
                    cancel.cancel();
                    break;
                }
                if idle >= settings.stall_warning && !warned.swap(true, Ordering::SeqCst) {
                    status(StatusUpdate::transient(format!(
                        "Worker #{} has been quiet for {}s",
                        worker_number,
                        idle.as_secs()
                    )));
                }
            }
        })
    };

    let request = InvokeRequest {
        prompt,
        max_turns: env.config.worker.max_turns,
        system_prompt: None,
        model: env.config.worker.model.clone(),
        allowed_tools: None,
        session_id: None,
        cwd: Some(env.config.working_dir.clone()),
        timeout: Some(env.supervision.worker_timeout),
    };

    let outcome = env.invoker.invoke(&request, &worker_cancel, &sinks).await;

    heartbeat.abort();
    stall_watch.abort();
    env.registry.remove_cancel_handle(agent_id);

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(outcome) => {
            env.add_cost(outcome.cost_usd);
            env.invocation.as_ref()(InvocationRecord::from_outcome(
                env.chat_id,
                Tier::Worker,
                &outcome,
            ));
            if let Some(raw_sink) = &env.raw
                && let Some(mut payload) = outcome.raw.clone()
            {
                if let Some(obj) = payload.as_object_mut() {
                    obj.insert("_tier".to_string(), serde_json::Value::from("worker"));
                }
                raw_sink(payload);
            }
            WorkerResult {
                task_id: task.id.clone(),
                success: !outcome.is_error,
                result: outcome.text,
                cost_usd: outcome.cost_usd,
                duration_ms: outcome.duration_ms,
            }
        }
        Err(InvokeError::Timeout(_)) => WorkerResult {
            task_id: task.id.clone(),
            success: false,
            result: "timed out".to_string(),
            cost_usd: None,
            duration_ms: elapsed_ms,
        },
        Err(InvokeError::Cancelled) => {
            let stalled = matches!(
                *kill_reason.lock().unwrap_or_else(|e| e.into_inner()),
                Some(KillReason::Stall)
            );
            WorkerResult {
                task_id: task.id.clone(),
                success: false,
                result: if stalled {
                    "timed out (no output from the worker)".to_string()
                } else {
                    "killed by user".to_string()
                },
                cost_usd: None,
                duration_ms: elapsed_ms,
            }
        }
        Err(e) => WorkerResult {
            task_id: task.id.clone(),
            success: false,
            result: format!("worker error: {}", e),
            cost_usd: None,
            duration_ms: elapsed_ms,
        },
    }
}
