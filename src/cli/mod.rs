//! Command dispatch and argument parsing. Flags are parsed by hand; every
//! command degrades to the help screen on unknown input.

mod data;
mod doctor;
mod run;

use anyhow::Result;
use console::style;

use crate::core::terminal::{self, GuideSection};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Core")
        .command("run", "Send one chat message through the runtime")
        .print();

    GuideSection::new("Data")
        .command("usage", "Invocation totals and per-day cost rollup")
        .command("sessions", "List or clear stored session handles")
        .command("memory", "List, add or delete per-chat memory notes")
        .print();

    GuideSection::new("Diagnostics")
        .command("doctor", "Check the assistant binary and data stores")
        .print();

    println!(
        "\n {} {} <command> [flags]\n",
        style("Usage:").bold(),
        style("rumpbot").green()
    );
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("run") => run::run_once(run::parse_run_args(&args, 2)).await,
        Some("doctor") => doctor::run().await,
        Some("usage") => data::usage_command(&args, 2).await,
        Some("sessions") => data::sessions_command(&args, 2).await,
        Some("memory") => data::memory_command(&args, 2).await,
        _ => {
            print_help();
            Ok(())
        }
    }
}

/// Pull the value following `--flag` (or its short alias) out of `args`.
pub(crate) fn flag_value(args: &[String], start: usize, names: &[&str]) -> Option<String> {
    let mut i = start;
    while i < args.len() {
        if names.contains(&args[i].as_str()) && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
        i += 1;
    }
    None
}

pub(crate) fn has_flag(args: &[String], start: usize, name: &str) -> bool {
    args.iter().skip(start).any(|a| a == name)
}
