//! Read/maintenance commands over the durable stores: `usage`, `sessions`
//! and `memory`.

use anyhow::{Result, bail};

use super::flag_value;
use crate::core::config::{RuntimeConfig, Tier};
use crate::core::memory::{MemoryStore, NoteSource};
use crate::core::sessions::SessionStore;
use crate::core::terminal::{self, GuideSection};
use crate::core::usage::InvocationLog;

pub(crate) async fn usage_command(args: &[String], start: usize) -> Result<()> {
    let days: u32 = flag_value(args, start, &["--days"])
        .and_then(|v| v.parse().ok())
        .unwrap_or(14);
    let config = RuntimeConfig::from_env();
    let log = InvocationLog::open(config.invocation_db()).await?;

    let totals = log.totals().await?;
    GuideSection::new("Usage")
        .status("calls", &totals.calls.to_string())
        .status("errors", &totals.errors.to_string())
        .status("cost", &format!("${:.4}", totals.cost_usd))
        .status(
            "tokens",
            &format!("{} in / {} out", totals.input_tokens, totals.output_tokens),
        )
        .print();

    let daily = log.daily(days).await?;
    if daily.is_empty() {
        terminal::print_info("No invocations recorded yet.");
        return Ok(());
    }
    println!();
    for day in daily {
        println!(
            "  {}  {:>5} calls  ${:.4}",
            day.date, day.calls, day.cost_usd
        );
    }
    Ok(())
}

pub(crate) async fn sessions_command(args: &[String], start: usize) -> Result<()> {
    let config = RuntimeConfig::from_env();
    let store = SessionStore::load(config.session_file()).await?;

    match args.get(start).map(String::as_str) {
        Some("clear") => {
            let Some(chat_id) = flag_value(args, start, &["--chat-id"])
                .and_then(|v| v.parse::<i64>().ok())
            else {
                bail!("sessions clear requires --chat-id <n>");
            };
            let tier = flag_value(args, start, &["--tier"])
                .as_deref()
                .and_then(Tier::from_name);
            store.clear(chat_id, tier).await?;
            terminal::print_success(&format!(
                "Cleared session handle(s) for chat {}",
                chat_id
            ));
        }
        _ => {
            let sessions = store.all().await;
            if sessions.is_empty() {
                terminal::print_info("No stored sessions.");
                return Ok(());
            }
            for (chat_id, tier, data) in sessions {
                println!(
                    "  chat {:>6}  {:<12} {}  (last used {})",
                    chat_id,
                    tier.as_str(),
                    data.session_id,
                    data.last_used_at
                );
            }
        }
    }
    Ok(())
}

pub(crate) async fn memory_command(args: &[String], start: usize) -> Result<()> {
    let config = RuntimeConfig::from_env();
    let store = MemoryStore::open(config.memory_db()).await?;

    match args.get(start).map(String::as_str) {
        Some("add") => {
            let Some(chat_id) = flag_value(args, start, &["--chat-id"])
                .and_then(|v| v.parse::<i64>().ok())
            else {
                bail!("memory add requires --chat-id <n>");
            };
            let Some(text) = flag_value(args, start, &["--text"]) else {
                bail!("memory add requires --text <note>");
            };
            let id = store.add_note(chat_id, &text, NoteSource::Manual).await?;
            terminal::print_success(&format!("Stored note {}", id));
        }
        Some("delete") => {
            let Some(id) = flag_value(args, start, &["--id"]).and_then(|v| v.parse::<i64>().ok())
            else {
                bail!("memory delete requires --id <n>");
            };
            if store.delete_note(id).await? {
                terminal::print_success(&format!("Deleted note {}", id));
            } else {
                terminal::print_warn(&format!("No note with id {}", id));
            }
        }
        _ => {
            let Some(chat_id) = flag_value(args, start, &["--chat-id"])
                .and_then(|v| v.parse::<i64>().ok())
            else {
                bail!("memory list requires --chat-id <n>");
            };
            let notes = store.list_notes(chat_id).await?;
            if notes.is_empty() {
                terminal::print_info("No notes for this chat.");
                return Ok(());
            }
            for note in notes {
                println!(
                    "  #{:<4} [{}] {}",
                    note.id,
                    match note.source {
                        NoteSource::Auto => "auto",
                        NoteSource::Manual => "manual",
                    },
                    note.text
                );
            }
        }
    }
    Ok(())
}
