//! Runtime configuration assembled from environment variables.
//!
//! Every knob has a code default so a bare `rumpbot run` works against a
//! `claude` binary on PATH with data under `~/.rumpbot`. Environment
//! variables override individual fields; there is no config file.

use std::path::PathBuf;
use std::time::Duration;

/// Role classification of an assistant call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Chat,
    Orchestrator,
    Worker,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Chat => "chat",
            Tier::Orchestrator => "orchestrator",
            Tier::Worker => "worker",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "chat" => Some(Tier::Chat),
            "orchestrator" => Some(Tier::Orchestrator),
            "worker" => Some(Tier::Worker),
            _ => None,
        }
    }
}

/// Per-tier assistant call settings.
#[derive(Debug, Clone)]
pub struct TierSettings {
    pub model: Option<String>,
    pub max_turns: u32,
    /// `None` means unlimited.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub data_dir: PathBuf,
    /// Path or name of the external assistant CLI binary.
    pub assistant_bin: String,
    /// Working directory handed to assistant calls.
    pub working_dir: PathBuf,
    pub chat: TierSettings,
    pub planning: TierSettings,
    pub worker: TierSettings,
    pub summary: TierSettings,
    /// Service name tokens matched when deriving `needs_restart`.
    pub service_tokens: Vec<String>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("RUMPBOT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".rumpbot")
            });

        let working_dir = std::env::var("RUMPBOT_WORKDIR")
            .map(PathBuf::from)
            .or_else(|_| std::env::current_dir())
            .unwrap_or_else(|_| PathBuf::from("."));

        let service_tokens = std::env::var("RUMPBOT_SERVICE_TOKENS")
            .unwrap_or_else(|_| "rumpbot,gateway,daemon".to_string())
            .split(',')
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();

        Self {
            data_dir,
            assistant_bin: std::env::var("RUMPBOT_ASSISTANT_BIN")
                .unwrap_or_else(|_| "claude".to_string()),
            working_dir,
            chat: TierSettings {
                model: std::env::var("RUMPBOT_CHAT_MODEL").ok(),
                max_turns: env_u32("RUMPBOT_CHAT_MAX_TURNS", 30),
                timeout: env_timeout("RUMPBOT_CHAT_TIMEOUT_SECS", 600),
            },
            planning: TierSettings {
                model: std::env::var("RUMPBOT_ORCH_MODEL").ok(),
                max_turns: 1,
                timeout: env_timeout("RUMPBOT_ORCH_TIMEOUT_SECS", 120),
            },
            worker: TierSettings {
                model: std::env::var("RUMPBOT_WORKER_MODEL").ok(),
                max_turns: env_u32("RUMPBOT_WORKER_MAX_TURNS", 50),
                timeout: env_timeout("RUMPBOT_WORKER_TIMEOUT_SECS", 300),
            },
            summary: TierSettings {
                model: std::env::var("RUMPBOT_ORCH_MODEL").ok(),
                max_turns: 1,
                timeout: Some(Duration::from_secs(30)),
            },
            service_tokens,
        }
    }

    pub fn session_file(&self) -> PathBuf {
        self.data_dir.join("sessions.json")
    }

    pub fn memory_db(&self) -> PathBuf {
        self.data_dir.join("memory.db")
    }

    pub fn invocation_db(&self) -> PathBuf {
        self.data_dir.join("invocations.db")
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Reads a timeout in seconds; `0` means unlimited.
fn env_timeout(key: &str, default_secs: u64) -> Option<Duration> {
    let secs = std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default_secs);
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

/// Timer and limit knobs for worker supervision. Tests construct these with
/// short intervals; production uses `Default`.
#[derive(Debug, Clone)]
pub struct SupervisionSettings {
    pub worker_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub stall_check_interval: Duration,
    pub stall_warning: Duration,
    pub stall_kill: Duration,
    pub orchestration_timeout: Duration,
    pub retry_backoff: Duration,
    pub summary_timeout: Duration,
}

impl Default for SupervisionSettings {
    fn default() -> Self {
        Self {
            worker_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(60),
            stall_check_interval: Duration::from_secs(30),
            stall_warning: Duration::from_secs(120),
            stall_kill: Duration::from_secs(300),
            orchestration_timeout: Duration::from_secs(3600),
            retry_backoff: Duration::from_secs(3),
            summary_timeout: Duration::from_secs(30),
        }
    }
}
