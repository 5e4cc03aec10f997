//! Agent Registry: in-memory directory of running orchestrators and workers.
//!
//! The registry is the seam for out-of-band control: a chat surface command
//! like `kill 2` resolves the chat's active orchestrator here, finds worker
//! #2 and trips its cancellation handle without touching anything else.
//! Explicitly constructed and shared by `Arc` clone from the composition
//! root; there is no global singleton.
//!
//! **Concurrency model:** a `std::sync::Mutex<HashMap>`. Every operation is
//! a short synchronous critical section and nothing async runs under the
//! lock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

pub type AgentId = u64;

/// Bound on a worker's captured output: latest 64 KB of chunks.
const OUTPUT_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Orchestrator,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Planning,
    Executing,
    Summarizing,
    Complete,
}

/// Read-only snapshot returned by registry queries.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: AgentId,
    pub role: AgentRole,
    pub chat_id: i64,
    pub description: String,
    pub phase: AgentPhase,
    pub parent_id: Option<AgentId>,
    /// 1-based position within the parent plan, workers only.
    pub worker_number: Option<usize>,
    pub task_prompt: Option<String>,
    pub task_description: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub last_activity_at: String,
    pub success: Option<bool>,
    pub cost_usd: Option<f64>,
}

struct AgentEntry {
    info: AgentInfo,
    cancel: Option<CancellationToken>,
    /// Orchestrators only: channel for external `retry <n>` requests.
    retry_tx: Option<UnboundedSender<usize>>,
    output: VecDeque<String>,
    output_bytes: usize,
}

#[derive(Clone)]
pub struct AgentRegistry {
    entries: Arc<Mutex<HashMap<AgentId, AgentEntry>>>,
    next_id: Arc<AtomicU64>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<AgentId, AgentEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new orchestrator for a chat. Fails while another
    /// orchestrator for the same chat is still active.
    pub fn register_orchestrator(&self, chat_id: i64, description: &str) -> Result<AgentId> {
        let mut entries = self.lock();
        let active = entries.values().any(|e| {
            e.info.role == AgentRole::Orchestrator
                && e.info.chat_id == chat_id
                && e.info.phase != AgentPhase::Complete
        });
        if active {
            bail!("an orchestration is already running for chat {}", chat_id);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now().to_rfc3339();
        entries.insert(
            id,
            AgentEntry {
                info: AgentInfo {
                    id,
                    role: AgentRole::Orchestrator,
                    chat_id,
                    description: description.to_string(),
                    phase: AgentPhase::Planning,
                    parent_id: None,
                    worker_number: None,
                    task_prompt: None,
                    task_description: None,
                    started_at: now.clone(),
                    finished_at: None,
                    last_activity_at: now,
                    success: None,
                    cost_usd: None,
                },
                cancel: None,
                retry_tx: None,
                output: VecDeque::new(),
                output_bytes: 0,
            },
        );
        Ok(id)
    }

    /// Register a worker under an orchestrator. `worker_number` is 1-based
    /// and must be unique within the parent plan.
    pub fn register_worker(
        &self,
        chat_id: i64,
        parent_id: AgentId,
        worker_number: usize,
        description: &str,
        task_prompt: &str,
    ) -> Result<AgentId> {
        let mut entries = self.lock();
        match entries.get(&parent_id) {
            Some(parent) if parent.info.role == AgentRole::Orchestrator => {}
            Some(_) => bail!("parent agent {} is not an orchestrator", parent_id),
            None => bail!("parent orchestrator {} not found", parent_id),
        }
        let taken = entries.values().any(|e| {
            e.info.parent_id == Some(parent_id) && e.info.worker_number == Some(worker_number)
        });
        if taken {
            bail!(
                "worker #{} already registered under orchestrator {}",
                worker_number,
                parent_id
            );
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now().to_rfc3339();
        entries.insert(
            id,
            AgentEntry {
                info: AgentInfo {
                    id,
                    role: AgentRole::Worker,
                    chat_id,
                    description: description.to_string(),
                    phase: AgentPhase::Executing,
                    parent_id: Some(parent_id),
                    worker_number: Some(worker_number),
                    task_prompt: Some(task_prompt.to_string()),
                    task_description: Some(description.to_string()),
                    started_at: now.clone(),
                    finished_at: None,
                    last_activity_at: now,
                    success: None,
                    cost_usd: None,
                },
                cancel: None,
                retry_tx: None,
                output: VecDeque::new(),
                output_bytes: 0,
            },
        );
        Ok(id)
    }

    pub fn update_phase(&self, id: AgentId, phase: AgentPhase) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&id) {
            entry.info.phase = phase;
            entry.info.last_activity_at = Utc::now().to_rfc3339();
        }
    }

    pub fn update_description(&self, id: AgentId, description: &str) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&id) {
            entry.info.description = description.to_string();
        }
    }

    /// Refresh `last_activity_at`. Called from output callbacks and the
    /// heartbeat timer.
    pub fn touch_activity(&self, id: AgentId) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&id) {
            entry.info.last_activity_at = Utc::now().to_rfc3339();
        }
    }

    /// Mark an agent finished. Drops its cancel handle and control channel.
    pub fn complete(&self, id: AgentId, success: bool, cost_usd: Option<f64>) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&id) {
            entry.info.phase = AgentPhase::Complete;
            entry.info.finished_at = Some(Utc::now().to_rfc3339());
            entry.info.success = Some(success);
            entry.info.cost_usd = cost_usd;
            entry.cancel = None;
            entry.retry_tx = None;
        }
    }

    pub fn get(&self, id: AgentId) -> Option<AgentInfo> {
        self.lock().get(&id).map(|e| e.info.clone())
    }

    /// The chat's orchestrator that has not completed yet, if any.
    pub fn active_orchestrator(&self, chat_id: i64) -> Option<AgentInfo> {
        self.lock()
            .values()
            .find(|e| {
                e.info.role == AgentRole::Orchestrator
                    && e.info.chat_id == chat_id
                    && e.info.phase != AgentPhase::Complete
            })
            .map(|e| e.info.clone())
    }

    pub fn worker_by_number(&self, parent_id: AgentId, worker_number: usize) -> Option<AgentInfo> {
        self.lock()
            .values()
            .find(|e| {
                e.info.parent_id == Some(parent_id)
                    && e.info.worker_number == Some(worker_number)
            })
            .map(|e| e.info.clone())
    }

    pub fn workers_of(&self, parent_id: AgentId) -> Vec<AgentInfo> {
        let mut workers: Vec<AgentInfo> = self
            .lock()
            .values()
            .filter(|e| e.info.parent_id == Some(parent_id))
            .map(|e| e.info.clone())
            .collect();
        workers.sort_by_key(|w| w.worker_number);
        workers
    }

    pub fn set_cancel_handle(&self, id: AgentId, token: CancellationToken) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&id) {
            entry.cancel = Some(token);
        }
    }

    pub fn cancel_handle(&self, id: AgentId) -> Option<CancellationToken> {
        self.lock().get(&id).and_then(|e| e.cancel.clone())
    }

    pub fn remove_cancel_handle(&self, id: AgentId) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&id) {
            entry.cancel = None;
        }
    }

    /// Cancel exactly one worker of an orchestrator. Returns `false` when
    /// the worker or its handle is gone.
    pub fn cancel_worker(&self, parent_id: AgentId, worker_number: usize) -> bool {
        let entries = self.lock();
        let handle = entries.values().find_map(|e| {
            (e.info.parent_id == Some(parent_id)
                && e.info.worker_number == Some(worker_number))
            .then(|| e.cancel.clone())
            .flatten()
        });
        match handle {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel worker `n` of the chat's active orchestration, for chat
    /// surface `kill <n>` commands.
    pub fn kill_worker(&self, chat_id: i64, worker_number: usize) -> bool {
        match self.active_orchestrator(chat_id) {
            Some(orchestrator) => self.cancel_worker(orchestrator.id, worker_number),
            None => false,
        }
    }

    /// Attach the orchestrator's retry channel for external `retry <n>`.
    pub fn set_retry_handle(&self, id: AgentId, tx: UnboundedSender<usize>) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&id) {
            entry.retry_tx = Some(tx);
        }
    }

    /// Ask a running orchestrator to re-run worker `n`. Returns `false`
    /// when no orchestrator is active for the chat or it stopped listening.
    pub fn request_worker_retry(&self, chat_id: i64, worker_number: usize) -> bool {
        let entries = self.lock();
        let tx = entries.values().find_map(|e| {
            (e.info.role == AgentRole::Orchestrator
                && e.info.chat_id == chat_id
                && e.info.phase != AgentPhase::Complete)
                .then(|| e.retry_tx.clone())
                .flatten()
        });
        match tx {
            Some(tx) => tx.send(worker_number).is_ok(),
            None => false,
        }
    }

    /// Append an output chunk to a worker's bounded ring buffer. Oldest
    /// chunks fall off once the byte budget is exceeded.
    pub fn append_output(&self, id: AgentId, chunk: &str) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&id) {
            entry.output_bytes += chunk.len();
            entry.output.push_back(chunk.to_string());
            while entry.output_bytes > OUTPUT_BUFFER_BYTES {
                match entry.output.pop_front() {
                    Some(dropped) => entry.output_bytes -= dropped.len(),
                    None => break,
                }
            }
        }
    }

    pub fn output(&self, id: AgentId) -> Option<String> {
        self.lock()
            .get(&id)
            .map(|e| e.output.iter().cloned().collect::<Vec<_>>().concat())
    }
}
