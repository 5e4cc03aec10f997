//! Plan and result types for the orchestration engine.

use serde_json::Value;

use crate::core::assistant::parse;

/// Hard cap on workers per plan; longer planner output is truncated.
pub const MAX_WORKERS: usize = 10;
/// Worker results are clipped to this many characters wherever they are fed
/// back into prompts.
pub const MAX_RESULT_CHARS: usize = 8000;

/// Substrings (matched case-insensitively) marking a worker failure as
/// retryable.
pub const TRANSIENT_PATTERNS: &[&str] = &[
    "rate limit",
    "429",
    "timed out",
    "timeout",
    "econnreset",
    "econnrefused",
    "socket hang up",
    "network error",
    "overloaded",
    "503",
    "502",
];

pub fn is_transient_error(text: &str) -> bool {
    let text = text.to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| text.contains(p))
}

/// Clip `text` to `max_chars`, appending a truncation marker when clipped.
pub fn truncate_result(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let clipped: String = text.chars().take(max_chars).collect();
    format!("{}\n[... output truncated]", clipped)
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkerTask {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub prompt: String,
    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub summary: String,
    pub workers: Vec<WorkerTask>,
    #[serde(default)]
    pub sequential: bool,
}

impl Plan {
    /// Parse planner output using the invoker's JSON extraction fallbacks.
    pub fn parse(text: &str) -> Option<Plan> {
        let value: Value = parse::extract_json(text)?;
        serde_json::from_value(value).ok()
    }

    /// Enforce [`MAX_WORKERS`], keeping the first workers by source order.
    /// Returns how many were dropped.
    pub fn cap(&mut self) -> usize {
        if self.workers.len() > MAX_WORKERS {
            let dropped = self.workers.len() - MAX_WORKERS;
            self.workers.truncate(MAX_WORKERS);
            dropped
        } else {
            0
        }
    }

    /// Structural validation: non-empty unique ids and non-empty prompts.
    /// Broken `depends_on` references are a scheduling concern; they
    /// surface as a dependency deadlock during parallel execution.
    pub fn validate(&self) -> Result<(), String> {
        if self.workers.is_empty() {
            return Err("the plan contains no workers".to_string());
        }
        let mut seen: Vec<&str> = Vec::with_capacity(self.workers.len());
        for (index, worker) in self.workers.iter().enumerate() {
            if worker.id.trim().is_empty() {
                return Err(format!("worker #{} has an empty id", index + 1));
            }
            if worker.prompt.trim().is_empty() {
                return Err(format!("worker '{}' has an empty prompt", worker.id));
            }
            if seen.contains(&worker.id.as_str()) {
                return Err(format!("duplicate worker id '{}'", worker.id));
            }
            seen.push(&worker.id);
        }
        Ok(())
    }
}

/// Produced exactly once per worker execution attempt.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    pub task_id: String,
    pub success: bool,
    pub result: String,
    pub cost_usd: Option<f64>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorSummary {
    pub overall_success: bool,
    pub summary: String,
    pub worker_results: Vec<WorkerResult>,
    pub total_cost_usd: f64,
    pub needs_restart: bool,
}

impl OrchestratorSummary {
    /// Terminal summary for runs that never reached execution.
    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            overall_success: false,
            summary: summary.into(),
            worker_results: Vec::new(),
            total_cost_usd: 0.0,
            needs_restart: false,
        }
    }
}
