//! One-shot run mode: the composition root of the runtime.
//!
//! Feeds a single message through the Chat Agent and, when it comes back as
//! a Work Request, through the Orchestrator. With `--json` the result is
//! printed as one machine-readable line on stdout; diagnostics stay on
//! stderr. Invocation records are batched in memory and persisted before
//! exit.

use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::assistant::AssistantInvoker;
use crate::core::chat::ChatAgent;
use crate::core::config::RuntimeConfig;
use crate::core::memory::MemoryStore;
use crate::core::orchestrator::{Orchestrator, OrchestratorSinks};
use crate::core::registry::AgentRegistry;
use crate::core::sessions::SessionStore;
use crate::core::status::{InvocationSink, StatusSink, StatusUpdate};
use crate::core::terminal;
use crate::core::usage::{InvocationLog, InvocationRecord};

pub(crate) struct RunArgs {
    pub prompt: String,
    pub chat_id: i64,
    pub json: bool,
}

pub(crate) fn parse_run_args(args: &[String], start: usize) -> RunArgs {
    RunArgs {
        prompt: super::flag_value(args, start, &["--prompt", "-p"]).unwrap_or_default(),
        chat_id: super::flag_value(args, start, &["--chat-id"])
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        json: super::has_flag(args, start, "--json"),
    }
}

pub(crate) async fn run_once(args: RunArgs) -> Result<()> {
    if args.prompt.trim().is_empty() {
        bail!("run requires a prompt: rumpbot run -p \"<message>\"");
    }

    let config = Arc::new(RuntimeConfig::from_env());
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let sessions = Arc::new(SessionStore::load(config.session_file()).await?);
    let memory = Arc::new(MemoryStore::open(config.memory_db()).await?);
    let invocation_log = InvocationLog::open(config.invocation_db()).await?;
    let registry = Arc::new(AgentRegistry::new());
    let invoker = Arc::new(AssistantInvoker::new(config.assistant_bin.clone()));

    let chat = ChatAgent::new(invoker.clone(), sessions, memory, config.clone());
    let orchestrator = Orchestrator::new(invoker, registry.clone(), config.clone());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    // Sinks must not block, so records are collected here and written in
    // one batch after the run.
    let pending: Arc<Mutex<Vec<InvocationRecord>>> = Arc::new(Mutex::new(Vec::new()));
    let invocation_sink: InvocationSink = {
        let pending = pending.clone();
        Arc::new(move |record| {
            pending.lock().unwrap_or_else(|e| e.into_inner()).push(record);
        })
    };

    let reply = chat
        .handle_message(args.chat_id, &args.prompt, &cancel, &invocation_sink)
        .await?;
    if !args.json {
        println!("{}", reply.chat_text);
    }

    let summary = match &reply.work_request {
        Some(work) => {
            let status: StatusSink = if args.json {
                Arc::new(|update: StatusUpdate| info!("[status] {}", update.message))
            } else {
                Arc::new(|update: StatusUpdate| {
                    if update.important {
                        terminal::print_warn(&update.message);
                    } else {
                        terminal::print_transient(&update.message);
                    }
                })
            };
            let sinks = OrchestratorSinks {
                status,
                invocation: invocation_sink.clone(),
                raw: None,
            };
            Some(
                orchestrator
                    .execute(args.chat_id, work, cancel.clone(), sinks)
                    .await,
            )
        }
        None => None,
    };

    if args.json {
        println!(
            "{}",
            json!({
                "chatText": reply.chat_text,
                "memoryNote": reply.memory_note,
                "workRequest": reply.work_request,
                "summary": summary,
            })
        );
    } else if let Some(summary) = &summary {
        if summary.overall_success {
            terminal::print_success(&summary.summary);
        } else {
            terminal::print_warn(&summary.summary);
        }
        terminal::print_transient(&format!("total cost ${:.4}", summary.total_cost_usd));
        if summary.needs_restart {
            terminal::print_warn("A service restart may be needed.");
        }
    }

    let records: Vec<InvocationRecord> = {
        let mut guard = pending.lock().unwrap_or_else(|e| e.into_inner());
        guard.drain(..).collect()
    };
    for record in &records {
        invocation_log.ingest(record).await?;
    }

    Ok(())
}
