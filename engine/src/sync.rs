// engine/src/sync.rs
//!
//! Dual-storage sync for custom models and history.
//!
//! The local SQLite store is the commit point. In `both` mode each write is
//! mirrored to backend storage right after the local commit; a failed mirror
//! write is queued for `flush_pending` and reported as a `SyncWarning`, never
//! as an error. In `backend-only` mode the backend is the store of record and
//! its failures are returned to the caller.

use crate::api::{ApiError, RemoteModel, RemoteStorage};
use crate::history::HistoryEntry;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    #[default]
    LocalOnly,
    BackendOnly,
    Both,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::LocalOnly => "local-only",
            SyncMode::BackendOnly => "backend-only",
            SyncMode::Both => "both",
        }
    }

    pub fn writes_local(&self) -> bool {
        matches!(self, SyncMode::LocalOnly | SyncMode::Both)
    }

    pub fn writes_remote(&self) -> bool {
        matches!(self, SyncMode::BackendOnly | SyncMode::Both)
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local-only" | "local" => Ok(SyncMode::LocalOnly),
            "backend-only" | "backend" | "remote" => Ok(SyncMode::BackendOnly),
            "both" => Ok(SyncMode::Both),
            _ => Err(format!(
                "unknown sync mode '{s}' (local-only, both, backend-only)"
            )),
        }
    }
}

/// Non-fatal notice that a remote mirror write did not go through.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncWarning {
    pub operation: String,
    pub message: String,
}

/// A successful result plus any mirror warnings raised while producing it.
#[derive(Debug, Clone, PartialEq)]
pub struct Synced<T> {
    pub value: T,
    pub warnings: Vec<SyncWarning>,
}

impl<T> Synced<T> {
    pub fn with_warning(value: T, warning: Option<SyncWarning>) -> Self {
        Self {
            value,
            warnings: warning.into_iter().collect(),
        }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

/// A remote write waiting to be replayed.
#[derive(Debug, Clone)]
pub enum PendingWrite {
    PutModel(RemoteModel),
    DeleteModel(String),
    PutHistory(HistoryEntry),
    DeleteHistory(i64),
    ClearHistory,
}

impl PendingWrite {
    fn describe(&self) -> String {
        match self {
            PendingWrite::PutModel(model) => format!("put model {}", model.descriptor.id),
            PendingWrite::DeleteModel(id) => format!("delete model {id}"),
            PendingWrite::PutHistory(entry) => format!("put history {}", entry.id),
            PendingWrite::DeleteHistory(id) => format!("delete history {id}"),
            PendingWrite::ClearHistory => "clear history".to_string(),
        }
    }

    fn apply(&self, remote: &dyn RemoteStorage) -> Result<(), ApiError> {
        match self {
            PendingWrite::PutModel(model) => remote.put_model(model),
            PendingWrite::DeleteModel(id) => remote.delete_model(id),
            PendingWrite::PutHistory(entry) => remote.put_history(entry),
            PendingWrite::DeleteHistory(id) => remote.delete_history(*id),
            PendingWrite::ClearHistory => remote.clear_history(),
        }
    }
}

/// Best-effort replication target shared by the registry and history store.
pub struct RemoteMirror {
    remote: Arc<dyn RemoteStorage>,
    pending: Mutex<VecDeque<PendingWrite>>,
}

impl RemoteMirror {
    pub fn new(remote: Arc<dyn RemoteStorage>) -> Self {
        Self {
            remote,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn remote(&self) -> &dyn RemoteStorage {
        self.remote.as_ref()
    }

    /// Write straight through to the backend; failures are the caller's.
    pub fn write_through(&self, write: &PendingWrite) -> Result<(), ApiError> {
        write.apply(self.remote.as_ref())
    }

    /// Mirror a write that already committed locally. Writes queue up behind
    /// earlier failures so the backend sees them in order.
    pub fn replicate(&self, write: PendingWrite) -> Option<SyncWarning> {
        let mut pending = self.pending.lock().expect("sync queue poisoned");
        let operation = write.describe();

        if !pending.is_empty() {
            pending.push_back(write);
            return Some(SyncWarning {
                operation,
                message: "queued behind earlier unsynced writes".to_string(),
            });
        }

        match write.apply(self.remote.as_ref()) {
            Ok(()) => None,
            Err(err) => {
                warn!(%operation, error = %err, "remote mirror write failed; queued for retry");
                pending.push_back(write);
                Some(SyncWarning {
                    operation,
                    message: err.to_string(),
                })
            }
        }
    }

    /// Replay queued writes in order, stopping at the first failure.
    /// Returns how many writes went through.
    pub fn flush_pending(&self) -> Result<usize, ApiError> {
        let mut pending = self.pending.lock().expect("sync queue poisoned");
        let mut flushed = 0;
        while let Some(write) = pending.front() {
            write.apply(self.remote.as_ref())?;
            pending.pop_front();
            flushed += 1;
        }
        if flushed > 0 {
            info!(flushed, "replayed queued remote writes");
        }
        Ok(flushed)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("sync queue poisoned").len()
    }
}
