// In engine/src/store/history_entries.rs
use crate::history::HistoryEntry;
use crate::pipeline::RunStatus;
use crate::Error;
use rusqlite::{params, Connection, OptionalExtension, Row};

const COLUMNS: &str =
    "id, timestamp, input_text, status, model, completed_stages_json, stage_results_json";

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
    })
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let status: String = row.get(3)?;
    let status = match status.as_str() {
        "idle" => RunStatus::Idle,
        "running" => RunStatus::Running,
        "completed" => RunStatus::Completed,
        "failed" => RunStatus::Failed,
        "cancelled" => RunStatus::Cancelled,
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown run status '{other}'").into(),
            ))
        }
    };
    Ok(HistoryEntry {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        input_text: row.get(2)?,
        status,
        model: row.get(4)?,
        completed_stages: json_column(row, 5)?,
        stage_results: json_column(row, 6)?,
    })
}

/// All entries, most recent first.
pub fn list(conn: &Connection) -> Result<Vec<HistoryEntry>, Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM history_entries ORDER BY id DESC"
    ))?;
    let rows = stmt.query_map([], from_row)?;
    let entries = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

pub fn get(conn: &Connection, id: i64) -> Result<Option<HistoryEntry>, Error> {
    let entry = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM history_entries WHERE id = ?1"),
            params![id],
            from_row,
        )
        .optional()?;
    Ok(entry)
}

/// Returns false when an entry with the same id already exists.
pub fn insert(conn: &Connection, entry: &HistoryEntry) -> Result<bool, Error> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO history_entries
            (id, timestamp, input_text, status, model, completed_stages_json, stage_results_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.id,
            entry.timestamp,
            entry.input_text,
            entry.status.as_str(),
            entry.model,
            serde_json::to_string(&entry.completed_stages)?,
            serde_json::to_string(&entry.stage_results)?,
        ],
    )?;
    Ok(inserted > 0)
}

pub fn delete(conn: &Connection, id: i64) -> Result<bool, Error> {
    let removed = conn.execute("DELETE FROM history_entries WHERE id = ?1", params![id])?;
    Ok(removed > 0)
}

pub fn clear(conn: &Connection) -> Result<usize, Error> {
    Ok(conn.execute("DELETE FROM history_entries", [])?)
}

/// Keep the newest `max_entries` rows and return the ids that were evicted.
pub fn truncate(conn: &Connection, max_entries: usize) -> Result<Vec<i64>, Error> {
    let mut stmt = conn.prepare(
        "SELECT id FROM history_entries ORDER BY id DESC LIMIT -1 OFFSET ?1",
    )?;
    let evicted = stmt
        .query_map(params![max_entries as i64], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for id in &evicted {
        conn.execute("DELETE FROM history_entries WHERE id = ?1", params![id])?;
    }
    Ok(evicted)
}
