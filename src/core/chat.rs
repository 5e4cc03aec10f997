//! Chat Agent: persona wrapper and intent layer over the Invoker.
//!
//! Every incoming message goes through one chat-tier assistant call. The
//! reply may carry an action block (a work request for the orchestrator)
//! and a memory block (a durable note); both are delimited by literal tags,
//! stripped from the text before it reaches the chat surface.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::assistant::{AssistantInvoker, InvokeRequest, InvokeSinks};
use crate::core::config::{RuntimeConfig, Tier};
use crate::core::memory::{MemoryStore, NoteSource};
use crate::core::sessions::SessionStore;
use crate::core::status::InvocationSink;
use crate::core::usage::InvocationRecord;

pub const ACTION_OPEN: &str = "<RUMPBOT_ACTION>";
pub const ACTION_CLOSE: &str = "</RUMPBOT_ACTION>";
pub const MEMORY_OPEN: &str = "<TIFFBOT_MEMORY>";
pub const MEMORY_CLOSE: &str = "</TIFFBOT_MEMORY>";

/// Shown when stripping the blocks leaves nothing to say.
const PLACEHOLDER_TEXT: &str = "Working on it...";

const CHAT_SYSTEM_PROMPT: &str = "\
You are Rumpbot, a concise engineering copilot living in a chat channel. \
Reply in plain conversational text.

When the user asks for actual work on the project (fix, build, refactor, \
investigate, deploy), do not attempt the work in this conversation. Instead \
include exactly one action block in your reply:
<RUMPBOT_ACTION>{\"type\":\"work_request\",\"task\":\"<what to do>\",\
\"context\":\"<details worth passing along>\",\"urgency\":\"normal\"}</RUMPBOT_ACTION>
Set urgency to \"quick\" only for trivially small requests.

When you learn a durable fact about the user or their project, include one \
memory block: <TIFFBOT_MEMORY>the fact</TIFFBOT_MEMORY>

Both blocks are stripped before your reply reaches the user, so keep the \
surrounding text self-contained.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Quick,
    Normal,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkRequest {
    pub task: String,
    pub context: String,
    pub urgency: Urgency,
}

#[derive(Debug, Clone)]
pub struct ChatReply {
    pub chat_text: String,
    pub work_request: Option<WorkRequest>,
    pub memory_note: Option<String>,
}

pub struct ChatAgent {
    invoker: Arc<AssistantInvoker>,
    sessions: Arc<SessionStore>,
    memory: Arc<MemoryStore>,
    config: Arc<RuntimeConfig>,
}

impl ChatAgent {
    pub fn new(
        invoker: Arc<AssistantInvoker>,
        sessions: Arc<SessionStore>,
        memory: Arc<MemoryStore>,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        Self {
            invoker,
            sessions,
            memory,
            config,
        }
    }

    /// Run one chat turn: memory prefix, chat-tier assistant call, block
    /// extraction. A memory block is stored as an `auto` note before
    /// returning.
    pub async fn handle_message(
        &self,
        chat_id: i64,
        text: &str,
        cancel: &CancellationToken,
        on_invocation: &InvocationSink,
    ) -> Result<ChatReply> {
        let mut prompt = String::new();
        if let Some(block) = self.memory.context_block(chat_id).await? {
            prompt.push_str(&block);
            prompt.push('\n');
        }
        prompt.push_str(text);

        let request = InvokeRequest {
            prompt,
            max_turns: self.config.chat.max_turns,
            system_prompt: Some(CHAT_SYSTEM_PROMPT.to_string()),
            model: self.config.chat.model.clone(),
            allowed_tools: None,
            session_id: self.sessions.get_session_id(chat_id, Tier::Chat).await,
            cwd: Some(self.config.working_dir.clone()),
            timeout: self.config.chat.timeout,
        };

        let outcome = self
            .invoker
            .invoke(&request, cancel, &InvokeSinks::default())
            .await
            .context("chat-tier assistant call failed")?;

        on_invocation(InvocationRecord::from_outcome(
            chat_id,
            Tier::Chat,
            &outcome,
        ));

        if let Some(session_id) = &outcome.session_id {
            self.sessions
                .set(chat_id, session_id, &self.config.working_dir, Tier::Chat)
                .await?;
        }

        let reply = parse_reply(&outcome.text);
        if let Some(note) = &reply.memory_note {
            info!("Storing memory note for chat {}", chat_id);
            self.memory.add_note(chat_id, note, NoteSource::Auto).await?;
        }
        Ok(reply)
    }
}

/// Split an assistant reply into chat text, work request and memory note.
pub(crate) fn parse_reply(raw: &str) -> ChatReply {
    let (action_payload, rest) = extract_block(raw, ACTION_OPEN, ACTION_CLOSE);
    let (memory_payload, rest) = extract_block(&rest, MEMORY_OPEN, MEMORY_CLOSE);

    let work_request = action_payload.as_deref().and_then(parse_action);
    let memory_note = memory_payload
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());

    let mut chat_text = rest.trim().to_string();
    if chat_text.is_empty() {
        chat_text = PLACEHOLDER_TEXT.to_string();
    }

    ChatReply {
        chat_text,
        work_request,
        memory_note,
    }
}

/// Cut one `open..close` block out of `text`. An unterminated block is left
/// in place and treated as absent.
fn extract_block(text: &str, open: &str, close: &str) -> (Option<String>, String) {
    let Some(start) = text.find(open) else {
        return (None, text.to_string());
    };
    let after = start + open.len();
    let Some(rel_end) = text[after..].find(close) else {
        return (None, text.to_string());
    };
    let payload = text[after..after + rel_end].to_string();
    let mut rest = String::with_capacity(text.len() - payload.len());
    rest.push_str(&text[..start]);
    rest.push_str(&text[after + rel_end + close.len()..]);
    (Some(payload), rest)
}

/// Parse the action JSON. Unknown fields are ignored; a missing `type` or
/// empty `task` invalidates the block. Malformed JSON is logged, not raised.
fn parse_action(payload: &str) -> Option<WorkRequest> {
    let value: Value = match serde_json::from_str(payload.trim()) {
        Ok(v) => v,
        Err(e) => {
            warn!("Ignoring malformed action block: {}", e);
            return None;
        }
    };
    if value.get("type").and_then(Value::as_str) != Some("work_request") {
        warn!("Ignoring action block without work_request type");
        return None;
    }
    let task = value
        .get("task")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())?
        .to_string();
    let context = value
        .get("context")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let urgency = match value.get("urgency").and_then(Value::as_str) {
        Some("quick") => Urgency::Quick,
        _ => Urgency::Normal,
    };
    Some(WorkRequest {
        task,
        context,
        urgency,
    })
}
