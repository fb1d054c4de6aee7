use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::conversation::Turn;
use crate::trace::Span;

/// Flat row shape for persisted turns. Intent and result are stored as JSON
/// so schema churn in those structs never needs a sqlite migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRow {
    pub turn_id: String,
    pub session_id: String,
    pub created_at_ms: i64,
    pub command_text: String,
    pub action: String,
    pub success: bool,
    pub intent_json: String,
    pub result_json: String,
}

impl TurnRow {
    pub fn from_turn(turn: &Turn) -> Result<Self> {
        Ok(Self {
            turn_id: turn.turn_id.to_string(),
            session_id: turn.session_id.clone(),
            created_at_ms: turn.ts_ms,
            command_text: turn.command_text.clone(),
            action: turn.intent.action.as_str().to_string(),
            success: turn.result.success,
            intent_json: serde_json::to_string(&turn.intent).context("serialize intent failed")?,
            result_json: serde_json::to_string(&turn.result).context("serialize result failed")?,
        })
    }
}

fn conn(db_path: &Path) -> Result<Connection> {
    let c = Connection::open(db_path).context("open sqlite failed")?;
    c.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS turns (
          turn_id TEXT PRIMARY KEY,
          session_id TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          command_text TEXT NOT NULL,
          action TEXT NOT NULL,
          success INTEGER NOT NULL,
          intent_json TEXT NOT NULL,
          result_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_turns_session_created
          ON turns(session_id, created_at_ms DESC);
        "#,
    )
    .context("init sqlite schema failed")?;
    Ok(c)
}

pub fn append(db_path: &Path, row: &TurnRow) -> Result<()> {
    let data_dir = db_path.parent().unwrap_or_else(|| Path::new("."));
    let span = Span::start(
        data_dir,
        Some(row.turn_id.as_str()),
        "History",
        "HISTORY.append",
        Some(serde_json::json!({
            "session_id": row.session_id,
            "action": row.action,
            "success": row.success,
        })),
    );

    let c = match conn(db_path) {
        Ok(c) => c,
        Err(e) => {
            span.err("db", "E_HISTORY_CONN", &e.to_string(), None);
            return Err(e);
        }
    };
    let r = c.execute(
        r#"
        INSERT OR REPLACE INTO turns
        (turn_id, session_id, created_at_ms, command_text, action, success, intent_json, result_json)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            row.turn_id,
            row.session_id,
            row.created_at_ms,
            row.command_text,
            row.action,
            row.success,
            row.intent_json,
            row.result_json,
        ],
    );
    match r {
        Ok(_) => {
            span.ok(None);
            Ok(())
        }
        Err(e) => {
            span.err("db", "E_HISTORY_INSERT", &format!("{e}"), None);
            Err(anyhow::anyhow!(e).context("insert turn failed"))
        }
    }
}

/// Newest-first within one session.
pub fn list(db_path: &Path, session_id: &str, limit: i64) -> Result<Vec<TurnRow>> {
    let data_dir = db_path.parent().unwrap_or_else(|| Path::new("."));
    let span = Span::start(
        data_dir,
        None,
        "History",
        "HISTORY.list",
        Some(serde_json::json!({"session_id": session_id, "limit": limit})),
    );

    let c = match conn(db_path) {
        Ok(c) => c,
        Err(e) => {
            span.err("db", "E_HISTORY_CONN", &e.to_string(), None);
            return Err(e);
        }
    };
    let mut stmt = c
        .prepare(
            r#"
            SELECT turn_id, session_id, created_at_ms, command_text, action, success, intent_json, result_json
            FROM turns
            WHERE session_id = ?1
            ORDER BY created_at_ms DESC
            LIMIT ?2
            "#,
        )
        .context("prepare turn list failed")?;
    let rows = stmt
        .query_map(params![session_id, limit], |row| {
            Ok(TurnRow {
                turn_id: row.get(0)?,
                session_id: row.get(1)?,
                created_at_ms: row.get(2)?,
                command_text: row.get(3)?,
                action: row.get(4)?,
                success: row.get(5)?,
                intent_json: row.get(6)?,
                result_json: row.get(7)?,
            })
        })
        .context("query turn list failed")?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    span.ok(Some(serde_json::json!({"items": out.len()})));
    Ok(out)
}

pub fn clear(db_path: &Path) -> Result<()> {
    let data_dir = db_path.parent().unwrap_or_else(|| Path::new("."));
    let span = Span::start(data_dir, None, "History", "HISTORY.clear", None);
    let c = match conn(db_path) {
        Ok(c) => c,
        Err(e) => {
            span.err("db", "E_HISTORY_CONN", &e.to_string(), None);
            return Err(e);
        }
    };
    match c.execute("DELETE FROM turns", []) {
        Ok(_) => {
            span.ok(None);
            Ok(())
        }
        Err(e) => {
            span.err("db", "E_HISTORY_CLEAR", &format!("{e}"), None);
            Err(anyhow::anyhow!(e).context("clear turns failed"))
        }
    }
}
