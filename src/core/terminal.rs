//! Styled terminal output helpers for the CLI.

use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✔", "ok");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ", "i");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠", "!");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("✖", "x");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

/// Dim one-liner for transient progress updates.
pub fn print_transient(msg: &str) {
    println!("  {}", style(msg).dim());
}

/// A titled block of command rows or status rows, in the shape:
///
/// ```text
/// ◇ Title
///   ▶ run            Send one message through the runtime
///   ▶ doctor         Check the assistant binary and data dir
/// ```
pub struct GuideSection {
    title: String,
    lines: Vec<GuideLine>,
}

enum GuideLine {
    Command(String, String),
    Status(String, String),
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn command(mut self, cmd: &str, desc: &str) -> Self {
        self.lines
            .push(GuideLine::Command(cmd.to_string(), desc.to_string()));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines
            .push(GuideLine::Status(label.to_string(), value.to_string()));
        self
    }

    pub fn print(&self) {
        println!();
        println!(" {} {}", style("◇").cyan(), style(&self.title).bold());
        for line in &self.lines {
            match line {
                GuideLine::Command(cmd, desc) => {
                    println!(
                        "   {} {:<16} {}",
                        style("▶").cyan(),
                        style(cmd).white(),
                        style(desc).dim()
                    );
                }
                GuideLine::Status(label, value) => {
                    println!("   {}: {}", style(label).bold().cyan(), value);
                }
            }
        }
    }
}

pub fn print_banner() {
    println!();
    println!("  {}", style("rumpbot").bold().magenta());
    println!(
        "  {}",
        style("chat-driven orchestration for your coding assistant").dim()
    );
}
