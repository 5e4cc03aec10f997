//! Status updates and effect sinks.
//!
//! The orchestrator reports progress through independent callback channels
//! rather than one mega-callback: status updates for the chat surface,
//! invocation records for the logger, raw payloads for debugging capture.
//! Sinks are called synchronously and must not block.

use std::sync::Arc;

use crate::core::usage::InvocationRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Status,
    PlanBreakdown,
    WorkerComplete,
}

/// One progress message for the chat surface. `important` updates must be
/// delivered as new, notifying messages; the rest may be coalesced or
/// rendered as in-place edits by the caller.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusUpdate {
    #[serde(rename = "type")]
    pub kind: StatusKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    pub important: bool,
}

impl StatusUpdate {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StatusKind::Status,
            message: message.into(),
            progress: None,
            important: false,
        }
    }

    pub fn important(message: impl Into<String>) -> Self {
        Self {
            kind: StatusKind::Status,
            message: message.into(),
            progress: None,
            important: true,
        }
    }

    pub fn plan_breakdown(message: impl Into<String>) -> Self {
        Self {
            kind: StatusKind::PlanBreakdown,
            message: message.into(),
            progress: None,
            important: true,
        }
    }

    pub fn worker_complete(message: impl Into<String>, progress: u8) -> Self {
        Self {
            kind: StatusKind::WorkerComplete,
            message: message.into(),
            progress: Some(progress),
            important: false,
        }
    }
}

pub type StatusSink = Arc<dyn Fn(StatusUpdate) + Send + Sync>;
pub type InvocationSink = Arc<dyn Fn(InvocationRecord) + Send + Sync>;
pub type RawPayloadSink = Arc<dyn Fn(serde_json::Value) + Send + Sync>;
