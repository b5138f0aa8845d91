// engine/src/api.rs
//!
//! API Client: request/response wrapper around the pipeline backend.
//!
//! - `PipelineBackend`: the four stage operations, the provider catalog and the
//!   best-effort cancel endpoint.
//! - `RemoteStorage`: backend-side storage for custom models and history,
//!   used by the sync layer.
//! - `HttpBackend`: the ureq implementation of both.
//!
//! Transport failures and non-2xx responses are surfaced uniformly as
//! `ApiError`; no call is retried here.

use crate::history::HistoryEntry;
use crate::model_catalog::ProviderCatalogEntry;
use crate::pipeline::Stage;
use crate::registry::ModelDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    #[error("failed to reach backend: {0}")]
    Transport(String),
    #[error("backend error (HTTP {status}): {message}")]
    Backend { status: u16, message: String },
    #[error("failed to decode backend response: {0}")]
    Decode(String),
}

/// Arguments shared by every stage call.
#[derive(Debug, Clone, PartialEq)]
pub struct StageRequest {
    pub session_id: String,
    /// Input text for the parser, or the previous stage's result.
    pub payload: Value,
    pub model: String,
    pub temperature: f64,
}

impl StageRequest {
    /// JSON body for the backend operation behind `stage`.
    pub fn body(&self, stage: Stage) -> Value {
        let field = match stage {
            Stage::Parser => "text",
            Stage::Reasoner => "parsed_data",
            Stage::Generator => "reasoning_result",
            Stage::Validator => "odrl_policy",
        };
        let mut body = serde_json::Map::new();
        body.insert(field.to_string(), self.payload.clone());
        body.insert("model".to_string(), Value::String(self.model.clone()));
        body.insert("temperature".to_string(), serde_json::json!(self.temperature));
        Value::Object(body)
    }
}

pub trait PipelineBackend: Send + Sync {
    /// Run the backend operation matching `stage` and return its opaque result.
    fn run_stage(&self, stage: Stage, request: &StageRequest) -> Result<Value, ApiError>;

    fn list_providers(&self) -> Result<Vec<ProviderCatalogEntry>, ApiError>;

    /// Ask the backend to stop work for a session. Best-effort only.
    fn cancel(&self, session_id: &str) -> Result<(), ApiError>;
}

/// Descriptor as sent to backend storage. Unlike the local copy it carries
/// the API key, since the backend needs it to reach the provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteModel {
    #[serde(flatten)]
    pub descriptor: ModelDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

pub trait RemoteStorage: Send + Sync {
    fn list_models(&self) -> Result<Vec<ModelDescriptor>, ApiError>;
    fn put_model(&self, model: &RemoteModel) -> Result<(), ApiError>;
    fn delete_model(&self, id: &str) -> Result<(), ApiError>;
    fn list_history(&self) -> Result<Vec<HistoryEntry>, ApiError>;
    fn put_history(&self, entry: &HistoryEntry) -> Result<(), ApiError>;
    fn delete_history(&self, id: i64) -> Result<(), ApiError>;
    fn clear_history(&self) -> Result<(), ApiError>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProvidersResponse {
    Wrapped { providers: Vec<ProviderCatalogEntry> },
    Bare(Vec<ProviderCatalogEntry>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ModelsResponse {
    Wrapped { models: Vec<ModelDescriptor> },
    Bare(Vec<ModelDescriptor>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryResponse {
    Wrapped { entries: Vec<HistoryEntry> },
    Bare(Vec<HistoryEntry>),
}

// ============================================================================
// HTTP backend
// ============================================================================

#[derive(Clone)]
pub struct HttpBackend {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeouts(base_url, Duration::from_secs(10), Duration::from_secs(300))
    }

    pub fn with_timeouts(
        base_url: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout_read(request_timeout)
            .build();
        Self {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path)
    }

    pub fn parse(&self, request: &StageRequest) -> Result<Value, ApiError> {
        self.call_stage("parse", Stage::Parser, request)
    }

    pub fn reason(&self, request: &StageRequest) -> Result<Value, ApiError> {
        self.call_stage("reason", Stage::Reasoner, request)
    }

    pub fn generate(&self, request: &StageRequest) -> Result<Value, ApiError> {
        self.call_stage("generate", Stage::Generator, request)
    }

    pub fn validate(&self, request: &StageRequest) -> Result<Value, ApiError> {
        self.call_stage("validate", Stage::Validator, request)
    }

    fn call_stage(
        &self,
        path: &str,
        stage: Stage,
        request: &StageRequest,
    ) -> Result<Value, ApiError> {
        debug!(%stage, model = %request.model, session = %request.session_id, "calling backend");
        let response = self
            .agent
            .post(&self.url(path))
            .set("Content-Type", "application/json")
            .set("X-Session-Id", &request.session_id)
            .send_json(request.body(stage));
        let body: Value = read_json(response)?;

        // Some failures come back as 200 with an error field.
        if let Some(message) = body.get("error").and_then(|v| v.as_str()) {
            return Err(ApiError::Backend {
                status: 200,
                message: message.to_string(),
            });
        }
        Ok(body)
    }

    fn send_empty(&self, response: Result<ureq::Response, ureq::Error>) -> Result<(), ApiError> {
        check_status(response).map(|_| ())
    }
}

impl PipelineBackend for HttpBackend {
    fn run_stage(&self, stage: Stage, request: &StageRequest) -> Result<Value, ApiError> {
        match stage {
            Stage::Parser => self.parse(request),
            Stage::Reasoner => self.reason(request),
            Stage::Generator => self.generate(request),
            Stage::Validator => self.validate(request),
        }
    }

    fn list_providers(&self) -> Result<Vec<ProviderCatalogEntry>, ApiError> {
        let response = self.agent.get(&self.url("providers")).call();
        let providers = match read_json::<ProvidersResponse>(response)? {
            ProvidersResponse::Wrapped { providers } => providers,
            ProvidersResponse::Bare(providers) => providers,
        };
        Ok(providers)
    }

    fn cancel(&self, session_id: &str) -> Result<(), ApiError> {
        let response = self
            .agent
            .post(&self.url(&format!("cancel/{session_id}")))
            .call();
        self.send_empty(response)
    }
}

impl RemoteStorage for HttpBackend {
    fn list_models(&self) -> Result<Vec<ModelDescriptor>, ApiError> {
        let response = self.agent.get(&self.url("custom-models")).call();
        let models = match read_json::<ModelsResponse>(response)? {
            ModelsResponse::Wrapped { models } => models,
            ModelsResponse::Bare(models) => models,
        };
        Ok(models)
    }

    fn put_model(&self, model: &RemoteModel) -> Result<(), ApiError> {
        let body = serde_json::to_value(model).map_err(|e| ApiError::Decode(e.to_string()))?;
        let response = self
            .agent
            .put(&self.url(&format!("custom-models/{}", model.descriptor.id)))
            .send_json(body);
        self.send_empty(response)
    }

    fn delete_model(&self, id: &str) -> Result<(), ApiError> {
        let response = self
            .agent
            .delete(&self.url(&format!("custom-models/{id}")))
            .call();
        self.send_empty(response)
    }

    fn list_history(&self) -> Result<Vec<HistoryEntry>, ApiError> {
        let response = self.agent.get(&self.url("history")).call();
        let entries = match read_json::<HistoryResponse>(response)? {
            HistoryResponse::Wrapped { entries } => entries,
            HistoryResponse::Bare(entries) => entries,
        };
        Ok(entries)
    }

    fn put_history(&self, entry: &HistoryEntry) -> Result<(), ApiError> {
        let body = serde_json::to_value(entry).map_err(|e| ApiError::Decode(e.to_string()))?;
        let response = self.agent.post(&self.url("history")).send_json(body);
        self.send_empty(response)
    }

    fn delete_history(&self, id: i64) -> Result<(), ApiError> {
        let response = self
            .agent
            .delete(&self.url(&format!("history/{id}")))
            .call();
        self.send_empty(response)
    }

    fn clear_history(&self) -> Result<(), ApiError> {
        let response = self.agent.delete(&self.url("history")).call();
        self.send_empty(response)
    }
}

pub(crate) fn check_status(
    response: Result<ureq::Response, ureq::Error>,
) -> Result<ureq::Response, ApiError> {
    match response {
        Ok(resp) => Ok(resp),
        Err(ureq::Error::Status(code, resp)) => {
            let body = resp.into_string().unwrap_or_default();
            Err(ApiError::Backend {
                status: code,
                message: extract_error_message(&body)
                    .unwrap_or_else(|| format!("HTTP {code} error")),
            })
        }
        Err(ureq::Error::Transport(err)) => Err(ApiError::Transport(err.to_string())),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(
    response: Result<ureq::Response, ureq::Error>,
) -> Result<T, ApiError> {
    let response = check_status(response)?;
    response
        .into_json::<T>()
        .map_err(|err| ApiError::Decode(err.to_string()))
}

/// Pull a human readable message out of an error body.
fn extract_error_message(body: &str) -> Option<String> {
    let json: Value = serde_json::from_str(body).ok()?;
    let candidates = [
        json.get("detail"),
        json.get("error").and_then(|e| e.get("message")),
        json.get("error"),
        json.get("message"),
    ];
    let message = candidates
        .into_iter()
        .flatten()
        .find_map(|value| match value {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Null | Value::Object(_) => None,
            other => Some(other.to_string()),
        });
    message
}
