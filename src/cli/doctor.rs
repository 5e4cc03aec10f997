//! Environment diagnostics: assistant binary, data dir, stores.

use std::time::Duration;

use anyhow::Result;

use crate::core::config::RuntimeConfig;
use crate::core::memory::MemoryStore;
use crate::core::sessions::SessionStore;
use crate::core::terminal::GuideSection;
use crate::core::usage::InvocationLog;

pub(crate) async fn run() -> Result<()> {
    let config = RuntimeConfig::from_env();
    let mut section = GuideSection::new("Doctor");

    let assistant = match tokio::time::timeout(
        Duration::from_secs(5),
        tokio::process::Command::new(&config.assistant_bin)
            .arg("--version")
            .output(),
    )
    .await
    {
        Ok(Ok(out)) if out.status.success() => {
            format!("ok ({})", String::from_utf8_lossy(&out.stdout).trim())
        }
        Ok(Ok(out)) => format!("exits with {}", out.status),
        Ok(Err(e)) => format!("not runnable: {}", e),
        Err(_) => "timed out after 5s".to_string(),
    };
    section = section.status(
        &format!("assistant ({})", config.assistant_bin),
        &assistant,
    );

    let probe = config.data_dir.join(".doctor-probe");
    let data_dir = match tokio::fs::create_dir_all(&config.data_dir).await {
        Ok(()) => match tokio::fs::write(&probe, b"ok").await {
            Ok(()) => {
                let _ = tokio::fs::remove_file(&probe).await;
                "writable".to_string()
            }
            Err(e) => format!("not writable: {}", e),
        },
        Err(e) => format!("cannot create: {}", e),
    };
    section = section.status(
        &format!("data dir ({})", config.data_dir.display()),
        &data_dir,
    );

    let memory = match MemoryStore::open(config.memory_db()).await {
        Ok(_) => "ok".to_string(),
        Err(e) => format!("failed to open: {}", e),
    };
    section = section.status("memory store", &memory);

    let invocations = match InvocationLog::open(config.invocation_db()).await {
        Ok(log) => match log.totals().await {
            Ok(totals) => format!("ok ({} records)", totals.calls),
            Err(e) => format!("unreadable: {}", e),
        },
        Err(e) => format!("failed to open: {}", e),
    };
    section = section.status("invocation log", &invocations);

    let sessions = match SessionStore::load(config.session_file()).await {
        Ok(store) => format!("ok ({} handles)", store.all().await.len()),
        Err(e) => format!("failed to load: {}", e),
    };
    section = section.status("session store", &sessions);

    section.print();
    Ok(())
}
