// engine/src/history.rs
//!
//! History Store: bounded, immutable snapshots of terminated pipeline runs.
//!
//! Entries are kept most-recent-first. Every append re-applies the size bound,
//! evicting the oldest entries. Persistence follows the same `SyncMode` rules
//! as the model registry.

use crate::pipeline::{PipelineRun, RunStatus, Stage};
use crate::store;
use crate::sync::{PendingWrite, RemoteMirror, SyncMode, SyncWarning, Synced};
use crate::{DbPool, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_ENTRIES: usize = 50;

/// A stage result kept with the entry so a later resume can skip the stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetainedResult {
    pub stage: Stage,
    pub result: Value,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub input_text: String,
    pub status: RunStatus,
    pub model: Option<String>,
    /// Stages that reached `completed`, in pipeline order.
    pub completed_stages: Vec<Stage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stage_results: Vec<RetainedResult>,
}

impl HistoryEntry {
    /// Snapshot a terminated run under `id`.
    pub fn from_run(id: i64, run: &PipelineRun) -> Self {
        let completed_stages = run.completed_stages();
        let stage_results = completed_stages
            .iter()
            .filter_map(|stage| {
                let record = run.stage(*stage);
                Some(RetainedResult {
                    stage: *stage,
                    result: record.result.clone()?,
                    elapsed_ms: record.elapsed_ms.unwrap_or(0),
                })
            })
            .collect();

        Self {
            id,
            timestamp: run.ended_at.unwrap_or_else(Utc::now),
            input_text: run.input.clone(),
            status: run.status,
            model: run.last_model().map(str::to_string),
            completed_stages,
            stage_results,
        }
    }

    /// Timestamp as shown to users and matched by `search`.
    pub fn display_timestamp(&self) -> String {
        self.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()
    }

    pub fn retained_result(&self, stage: Stage) -> Option<&RetainedResult> {
        self.stage_results.iter().find(|kept| kept.stage == stage)
    }

    fn matches(&self, needle: &str) -> bool {
        self.input_text.to_lowercase().contains(needle)
            || self.display_timestamp().to_lowercase().contains(needle)
    }
}

fn ids_of(entries: &[HistoryEntry]) -> Vec<i64> {
    entries.iter().map(|entry| entry.id).collect()
}

/// Decode bytes produced by `HistoryStore::export_all`.
pub fn parse_export(bytes: &[u8]) -> Result<Vec<HistoryEntry>> {
    Ok(serde_json::from_slice(bytes)?)
}

pub struct HistoryStore {
    pool: DbPool,
    mirror: Option<Arc<RemoteMirror>>,
    mode: RwLock<SyncMode>,
    max_entries: usize,
    entries: RwLock<Vec<HistoryEntry>>,
    last_id: Mutex<i64>,
}

impl HistoryStore {
    pub fn open(
        pool: DbPool,
        mirror: Option<Arc<RemoteMirror>>,
        mode: SyncMode,
        max_entries: usize,
    ) -> Result<Self> {
        if max_entries == 0 {
            return Err(Error::Config("history max_entries must be positive".into()));
        }
        let history = Self {
            pool,
            mirror,
            mode: RwLock::new(mode),
            max_entries,
            entries: RwLock::new(Vec::new()),
            last_id: Mutex::new(0),
        };
        history.reload()?;
        Ok(history)
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn sync_mode(&self) -> SyncMode {
        *self.mode.read().expect("history mode poisoned")
    }

    pub fn set_sync_mode(&self, mode: SyncMode) -> Result<()> {
        if mode.writes_remote() && self.mirror.is_none() {
            return Err(Error::Config(format!(
                "sync mode '{}' needs backend storage",
                mode.as_str()
            )));
        }
        *self.mode.write().expect("history mode poisoned") = mode;
        self.reload()
    }

    /// Re-read entries from the store of record and re-apply the size bound
    /// there, so rows beyond `max_entries` do not outlive a lowered limit.
    pub fn reload(&self) -> Result<()> {
        let mode = self.sync_mode();
        let (entries, evicted) = match mode {
            SyncMode::BackendOnly => {
                let mut entries = self.require_mirror(mode)?.remote().list_history()?;
                entries.sort_by(|a, b| b.id.cmp(&a.id));
                let evicted: Vec<i64> = if entries.len() > self.max_entries {
                    entries.split_off(self.max_entries).iter().map(|e| e.id).collect()
                } else {
                    Vec::new()
                };
                (entries, evicted)
            }
            SyncMode::LocalOnly | SyncMode::Both => {
                let conn = self.pool.get()?;
                let evicted = store::history_entries::truncate(&conn, self.max_entries)?;
                (store::history_entries::list(&conn)?, evicted)
            }
        };

        let newest = entries.first().map(|entry| entry.id).unwrap_or(0);
        {
            let mut last_id = self.last_id.lock().expect("history id poisoned");
            *last_id = (*last_id).max(newest);
        }
        debug!(count = entries.len(), mode = mode.as_str(), "loaded history");
        *self.entries.write().expect("history cache poisoned") = entries;

        if !evicted.is_empty() {
            info!(count = evicted.len(), max = self.max_entries, "pruned history beyond size bound");
            for warning in self.evict(&evicted)? {
                warn!(operation = %warning.operation, message = %warning.message, "history prune not mirrored");
            }
        }
        Ok(())
    }

    /// Record a terminated run. Non-terminal runs are rejected.
    pub fn append(&self, run: &PipelineRun) -> Result<Synced<HistoryEntry>> {
        if !run.status.is_terminal() {
            return Err(Error::validation(format!(
                "only terminated runs can be recorded (run is {})",
                run.status.as_str()
            )));
        }
        let entry = HistoryEntry::from_run(self.next_id(), run);
        let mut warnings = Vec::new();

        warnings.extend(self.persist(PendingWrite::PutHistory(entry.clone()))?);

        let evicted = {
            let mut entries = self.entries.write().expect("history cache poisoned");
            entries.insert(0, entry.clone());
            if entries.len() > self.max_entries {
                entries.split_off(self.max_entries)
            } else {
                Vec::new()
            }
        };
        warnings.extend(self.evict(&ids_of(&evicted))?);

        info!(id = entry.id, status = entry.status.as_str(), "history entry recorded");
        Ok(Synced {
            value: entry,
            warnings,
        })
    }

    /// All entries, most recent first.
    pub fn list(&self) -> Vec<HistoryEntry> {
        self.entries.read().expect("history cache poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("history cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: i64) -> Option<HistoryEntry> {
        self.entries
            .read()
            .expect("history cache poisoned")
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
    }

    /// Case-insensitive substring search over input text and display timestamp.
    /// An empty query returns everything.
    pub fn search(&self, query: &str) -> Vec<HistoryEntry> {
        let needle = query.trim().to_lowercase();
        let entries = self.entries.read().expect("history cache poisoned");
        if needle.is_empty() {
            return entries.clone();
        }
        entries
            .iter()
            .filter(|entry| entry.matches(&needle))
            .cloned()
            .collect()
    }

    pub fn remove(&self, id: i64) -> Result<Synced<()>> {
        if self.get(id).is_none() {
            return Err(Error::not_found("history entry", id.to_string()));
        }
        let warning = self.persist(PendingWrite::DeleteHistory(id))?;
        self.entries
            .write()
            .expect("history cache poisoned")
            .retain(|entry| entry.id != id);
        Ok(Synced::with_warning((), warning))
    }

    /// Delete every entry. Returns how many were removed.
    pub fn clear_all(&self) -> Result<Synced<usize>> {
        let warning = self.persist(PendingWrite::ClearHistory)?;
        let removed = {
            let mut entries = self.entries.write().expect("history cache poisoned");
            let removed = entries.len();
            entries.clear();
            removed
        };
        info!(removed, "history cleared");
        Ok(Synced::with_warning(removed, warning))
    }

    /// Pretty JSON of the full collection, most recent first.
    pub fn export_all(&self) -> Result<Vec<u8>> {
        let entries = self.entries.read().expect("history cache poisoned");
        Ok(serde_json::to_vec_pretty(&*entries)?)
    }

    /// Merge an export into the store. Entries whose id already exists are
    /// skipped and the size bound is re-applied. Returns how many were added.
    pub fn import(&self, bytes: &[u8]) -> Result<Synced<usize>> {
        let incoming = parse_export(bytes)?;
        let mut warnings = Vec::new();
        let mut added = Vec::new();

        for entry in incoming {
            if self.get(entry.id).is_some() || added.iter().any(|e: &HistoryEntry| e.id == entry.id) {
                continue;
            }
            warnings.extend(self.persist(PendingWrite::PutHistory(entry.clone()))?);
            added.push(entry);
        }

        let newest = added.iter().map(|entry| entry.id).max().unwrap_or(0);
        {
            let mut last_id = self.last_id.lock().expect("history id poisoned");
            *last_id = (*last_id).max(newest);
        }

        let evicted = {
            let mut entries = self.entries.write().expect("history cache poisoned");
            entries.extend(added.iter().cloned());
            entries.sort_by(|a, b| b.id.cmp(&a.id));
            if entries.len() > self.max_entries {
                entries.split_off(self.max_entries)
            } else {
                Vec::new()
            }
        };
        warnings.extend(self.evict(&ids_of(&evicted))?);

        let kept = added
            .iter()
            .filter(|entry| !evicted.iter().any(|gone| gone.id == entry.id))
            .count();
        info!(imported = kept, "history imported");
        Ok(Synced {
            value: kept,
            warnings,
        })
    }

    /// Nanosecond timestamp, bumped past the last issued id when the clock
    /// did not move forward.
    fn next_id(&self) -> i64 {
        let now = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| Utc::now().timestamp_micros() * 1_000);
        let mut last_id = self.last_id.lock().expect("history id poisoned");
        let id = now.max(*last_id + 1);
        *last_id = id;
        id
    }

    fn require_mirror(&self, mode: SyncMode) -> Result<&RemoteMirror> {
        self.mirror.as_deref().ok_or_else(|| {
            Error::Config(format!(
                "sync mode '{}' needs backend storage",
                mode.as_str()
            ))
        })
    }

    /// Drop evicted entries from the store(s) of record. Eviction never fails
    /// the append that caused it; remote trouble comes back as warnings.
    fn evict(&self, ids: &[i64]) -> Result<Vec<SyncWarning>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = ids.len(), "evicting oldest history entries");

        let mut warnings = Vec::new();
        for &id in ids {
            match self.persist(PendingWrite::DeleteHistory(id)) {
                Ok(warning) => warnings.extend(warning),
                Err(Error::Transport(message)) | Err(Error::Backend { message, .. }) => {
                    warn!(id, %message, "could not evict history entry remotely");
                    warnings.push(SyncWarning {
                        operation: format!("delete history {id}"),
                        message,
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Ok(warnings)
    }

    fn persist(&self, write: PendingWrite) -> Result<Option<SyncWarning>> {
        let mode = self.sync_mode();
        if !mode.writes_local() {
            self.require_mirror(mode)?.write_through(&write)?;
            return Ok(None);
        }

        {
            let conn = self.pool.get()?;
            match &write {
                PendingWrite::PutHistory(entry) => {
                    store::history_entries::insert(&conn, entry)?;
                }
                PendingWrite::DeleteHistory(id) => {
                    store::history_entries::delete(&conn, *id)?;
                }
                PendingWrite::ClearHistory => {
                    store::history_entries::clear(&conn)?;
                }
                _ => {}
            }
        }

        if mode.writes_remote() {
            return Ok(self.require_mirror(mode)?.replicate(write));
        }
        Ok(None)
    }
}
