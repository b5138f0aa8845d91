// In engine/src/lib.rs

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

// The shared database pool type
pub type DbPool = Pool<SqliteConnectionManager>;

// Main error type for every engine operation
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
    #[error(transparent)]
    Pool(#[from] r2d2::Error),
    #[error(transparent)]
    Keyring(#[from] keyring::Error),
    #[error(transparent)]
    Migration(#[from] rusqlite_migration::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend error (HTTP {status}): {message}")]
    Backend { status: u16, message: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid transition to {stage}: {reason}")]
    InvalidTransition {
        stage: pipeline::Stage,
        reason: String,
    },
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },
    #[error("backend unavailable: {message}")]
    BackendUnavailable {
        message: String,
        /// Custom descriptors still usable from local storage.
        custom: Vec<registry::ModelDescriptor>,
    },
    #[error("progress channel stalled after {attempts} reconnect attempts")]
    ChannelStalled { attempts: u32 },
    #[error("{stage} failed: {message}")]
    StageFailure {
        stage: pipeline::Stage,
        message: String,
    },
    #[error("{stage} was cancelled")]
    Cancelled { stage: pipeline::Stage },
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<api::ApiError> for Error {
    fn from(err: api::ApiError) -> Self {
        match err {
            api::ApiError::Transport(message) => Error::Transport(message),
            api::ApiError::Backend { status, message } => Error::Backend { status, message },
            api::ApiError::Decode(message) => Error::Backend {
                status: 200,
                message: format!("malformed response: {message}"),
            },
        }
    }
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_ref())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod api;
pub mod api_keys;
pub mod config;
pub mod history;
pub mod keychain;
pub mod model_catalog;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod settings;
pub mod store;
pub mod sync;

pub use api::{HttpBackend, PipelineBackend, RemoteStorage};
pub use config::AppConfig;
pub use history::{HistoryEntry, HistoryStore};
pub use orchestrator::Orchestrator;
pub use pipeline::{PipelineRun, RunStatus, Stage, StageRecord, StageStatus};
pub use progress::{ProgressChannel, ProgressEvent, Subscription};
pub use registry::{ModelDescriptor, ModelRegistry, ProviderType};
pub use settings::Settings;
pub use sync::{SyncMode, SyncWarning, Synced};
