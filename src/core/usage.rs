//! Invocation Logger: append-only sink for per-call cost/token records.
//!
//! The core only writes; the read side (totals, per-day rollups) exists for
//! the `usage` command and any external dashboard. Records land in a
//! dedicated sqlite database, one row per assistant call.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rusqlite::{Connection, params};
use tokio::sync::Mutex;

use crate::core::assistant::{InvokeOutcome, ModelTokens};
use crate::core::config::Tier;

#[derive(Debug, Clone, serde::Serialize)]
pub struct InvocationRecord {
    pub timestamp: String,
    pub chat_id: i64,
    pub tier: Tier,
    pub duration_ms: u64,
    pub duration_api_ms: Option<u64>,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<u32>,
    pub stop_reason: Option<String>,
    pub is_error: bool,
    pub model_usage: BTreeMap<String, ModelTokens>,
}

impl InvocationRecord {
    /// Stamp an invoker outcome into a record for the given chat and tier.
    pub fn from_outcome(chat_id: i64, tier: Tier, outcome: &InvokeOutcome) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            chat_id,
            tier,
            duration_ms: outcome.duration_ms,
            duration_api_ms: outcome.duration_api_ms,
            cost_usd: outcome.cost_usd,
            num_turns: outcome.num_turns,
            stop_reason: outcome.stop_reason.clone(),
            is_error: outcome.is_error,
            model_usage: outcome.model_usage.clone(),
        }
    }

    fn token_totals(&self) -> (u64, u64) {
        let input = self.model_usage.values().map(|t| t.input_tokens).sum();
        let output = self.model_usage.values().map(|t| t.output_tokens).sum();
        (input, output)
    }
}

#[derive(Debug, Clone, Default)]
pub struct UsageTotals {
    pub calls: u64,
    pub errors: u64,
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct DailyUsage {
    pub date: String,
    pub calls: u64,
    pub cost_usd: f64,
}

pub struct InvocationLog {
    db: Arc<Mutex<Connection>>,
}

impl InvocationLog {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let db = Connection::open(path.as_ref())?;
        Self::init(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        Self::init(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    fn init(db: &Connection) -> Result<()> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS invocations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                chat_id INTEGER NOT NULL,
                tier TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                duration_api_ms INTEGER,
                cost_usd REAL,
                num_turns INTEGER,
                stop_reason TEXT,
                is_error INTEGER NOT NULL DEFAULT 0,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                model_usage_json TEXT NOT NULL DEFAULT '{}'
            )",
            [],
        )?;
        Ok(())
    }

    pub async fn ingest(&self, record: &InvocationRecord) -> Result<()> {
        let (input_tokens, output_tokens) = record.token_totals();
        let model_usage_json = serde_json::to_string(&record.model_usage)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO invocations (
                timestamp, chat_id, tier, duration_ms, duration_api_ms,
                cost_usd, num_turns, stop_reason, is_error,
                input_tokens, output_tokens, model_usage_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.timestamp,
                record.chat_id,
                record.tier.as_str(),
                record.duration_ms as i64,
                record.duration_api_ms.map(|v| v as i64),
                record.cost_usd,
                record.num_turns.map(|v| v as i64),
                record.stop_reason,
                record.is_error as i64,
                input_tokens as i64,
                output_tokens as i64,
                model_usage_json,
            ],
        )?;
        Ok(())
    }

    pub async fn totals(&self) -> Result<UsageTotals> {
        let db = self.db.lock().await;
        let totals = db.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(is_error), 0),
                    COALESCE(SUM(cost_usd), 0.0),
                    COALESCE(SUM(input_tokens), 0),
                    COALESCE(SUM(output_tokens), 0)
             FROM invocations",
            [],
            |row| {
                Ok(UsageTotals {
                    calls: row.get::<_, i64>(0)? as u64,
                    errors: row.get::<_, i64>(1)? as u64,
                    cost_usd: row.get(2)?,
                    input_tokens: row.get::<_, i64>(3)? as u64,
                    output_tokens: row.get::<_, i64>(4)? as u64,
                })
            },
        )?;
        Ok(totals)
    }

    /// Per-day rollup, most recent first.
    pub async fn daily(&self, days: u32) -> Result<Vec<DailyUsage>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT substr(timestamp, 1, 10) AS day,
                    COUNT(*),
                    COALESCE(SUM(cost_usd), 0.0)
             FROM invocations
             GROUP BY day
             ORDER BY day DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![days as i64], |row| {
            Ok(DailyUsage {
                date: row.get(0)?,
                calls: row.get::<_, i64>(1)? as u64,
                cost_usd: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(chat_id: i64, tier: Tier, cost: f64, day: &str) -> InvocationRecord {
        InvocationRecord {
            timestamp: format!("{}T10:00:00+00:00", day),
            chat_id,
            tier,
            duration_ms: 1000,
            duration_api_ms: Some(800),
            cost_usd: Some(cost),
            num_turns: Some(2),
            stop_reason: None,
            is_error: false,
            model_usage: BTreeMap::from([(
                "claude-sonnet".to_string(),
                ModelTokens {
                    input_tokens: 100,
                    output_tokens: 40,
                    ..Default::default()
                },
            )]),
        }
    }

    #[tokio::test]
    async fn ingest_and_totals() {
        let log = InvocationLog::open_in_memory().unwrap();
        log.ingest(&record(1, Tier::Chat, 0.10, "2026-03-01"))
            .await
            .unwrap();
        log.ingest(&record(1, Tier::Worker, 0.25, "2026-03-01"))
            .await
            .unwrap();

        let totals = log.totals().await.unwrap();
        assert_eq!(totals.calls, 2);
        assert_eq!(totals.errors, 0);
        assert!((totals.cost_usd - 0.35).abs() < 1e-9);
        assert_eq!(totals.input_tokens, 200);
        assert_eq!(totals.output_tokens, 80);
    }

    #[tokio::test]
    async fn daily_rollup_groups_by_date() {
        let log = InvocationLog::open_in_memory().unwrap();
        log.ingest(&record(1, Tier::Chat, 0.10, "2026-03-01"))
            .await
            .unwrap();
        log.ingest(&record(1, Tier::Chat, 0.20, "2026-03-01"))
            .await
            .unwrap();
        log.ingest(&record(2, Tier::Worker, 0.50, "2026-03-02"))
            .await
            .unwrap();

        let daily = log.daily(30).await.unwrap();
        assert_eq!(daily.len(), 2);
        assert_eq!(daily[0].date, "2026-03-02");
        assert_eq!(daily[0].calls, 1);
        assert_eq!(daily[1].date, "2026-03-01");
        assert_eq!(daily[1].calls, 2);
        assert!((daily[1].cost_usd - 0.30).abs() < 1e-9);
    }
}
