// engine/src/registry.rs
//!
//! Model Registry: built-in catalog plus user-defined model descriptors.
//!
//! The catalog is fetched from the backend once and cached until
//! `refresh_catalog`. Custom descriptors are validated before anything is
//! written, persisted according to the active `SyncMode`, and never carry
//! their API key outside the keychain. Settings reference descriptors by id
//! only; `resolve` returning `None` is how callers notice a dangling id.

use crate::api::{PipelineBackend, RemoteModel};
use crate::api_keys;
use crate::model_catalog::{ProviderCatalog, ProviderCatalogEntry};
use crate::store;
use crate::sync::{PendingWrite, RemoteMirror, SyncMode, SyncWarning, Synced};
use crate::{DbPool, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderType {
    Ollama,
    Groq,
    OpenaiCompatible,
    GoogleGenai,
    BuiltIn,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Ollama => "ollama",
            ProviderType::Groq => "groq",
            ProviderType::OpenaiCompatible => "openai-compatible",
            ProviderType::GoogleGenai => "google-genai",
            ProviderType::BuiltIn => "built-in",
        }
    }

    /// Google GenAI is addressed through its SDK and must not carry a base URL;
    /// every other provider needs one.
    pub fn requires_base_url(&self) -> bool {
        !matches!(self, ProviderType::GoogleGenai)
    }
}

impl FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Ok(ProviderType::Ollama),
            "groq" => Ok(ProviderType::Groq),
            "openai-compatible" | "openai" => Ok(ProviderType::OpenaiCompatible),
            "google-genai" | "google" | "gemini" => Ok(ProviderType::GoogleGenai),
            "built-in" | "builtin" => Ok(ProviderType::BuiltIn),
            _ => Err(format!("unknown provider type '{s}'")),
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn generate_id() -> String {
    format!("custom-{}", Uuid::new_v4())
}

fn default_context_length() -> u32 {
    4096
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    #[serde(default)]
    pub id: String,
    pub label: String,
    pub provider_type: ProviderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub model_identifier: String,

    /// Accepted on input only. Never serialized, never stored outside the keychain.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub has_api_key: bool,

    #[serde(default = "default_context_length")]
    pub context_length: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_temperature: Option<f64>,
}

impl ModelDescriptor {
    /// Copy safe to hand back to callers: the key is dropped, its presence kept.
    pub fn redacted(mut self) -> Self {
        if self.api_key.take().is_some() {
            self.has_api_key = true;
        }
        self
    }

    /// Trim text fields and turn empty optionals into `None`.
    fn normalized(mut self) -> Self {
        self.id = self.id.trim().to_string();
        self.label = self.label.trim().to_string();
        self.model_identifier = self.model_identifier.trim().to_string();
        self.base_url = self
            .base_url
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());
        self.api_key = self
            .api_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        self
    }

    /// Field-level checks that need no other descriptor to decide.
    pub fn validate(&self) -> Result<()> {
        if self.label.trim().is_empty() {
            return Err(Error::validation("label must not be empty"));
        }
        if self.model_identifier.trim().is_empty() {
            return Err(Error::validation("modelIdentifier must not be empty"));
        }
        let has_base_url = self
            .base_url
            .as_deref()
            .map(|url| !url.trim().is_empty())
            .unwrap_or(false);
        match (self.provider_type.requires_base_url(), has_base_url) {
            (true, false) => {
                return Err(Error::validation(format!(
                    "baseUrl is required for {} models",
                    self.provider_type
                )))
            }
            (false, true) => {
                return Err(Error::validation(
                    "baseUrl must be empty for google-genai models",
                ))
            }
            _ => {}
        }
        if self.context_length == 0 {
            return Err(Error::validation("contextLength must be positive"));
        }
        if let Some(temperature) = self.default_temperature {
            if !temperature.is_finite() || !(0.0..=2.0).contains(&temperature) {
                return Err(Error::validation(
                    "defaultTemperature must be between 0.0 and 2.0",
                ));
            }
        }
        Ok(())
    }

    fn same_target(&self, other: &ModelDescriptor) -> bool {
        self.provider_type == other.provider_type
            && self.model_identifier == other.model_identifier
            && self.base_url == other.base_url
    }
}

/// Result of `list_available`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableModels {
    pub catalog: Vec<ProviderCatalogEntry>,
    pub custom: Vec<ModelDescriptor>,
}

pub struct ModelRegistry {
    pool: DbPool,
    backend: Arc<dyn PipelineBackend>,
    mirror: Option<Arc<RemoteMirror>>,
    mode: RwLock<SyncMode>,
    catalog: RwLock<Option<ProviderCatalog>>,
    custom: RwLock<Vec<ModelDescriptor>>,
}

impl ModelRegistry {
    /// Build a registry and load custom descriptors from the store of record
    /// for `mode`. `mirror` is required for `both` and `backend-only`.
    pub fn open(
        pool: DbPool,
        backend: Arc<dyn PipelineBackend>,
        mirror: Option<Arc<RemoteMirror>>,
        mode: SyncMode,
    ) -> Result<Self> {
        let registry = Self {
            pool,
            backend,
            mirror,
            mode: RwLock::new(mode),
            catalog: RwLock::new(None),
            custom: RwLock::new(Vec::new()),
        };
        registry.reload()?;
        Ok(registry)
    }

    pub fn sync_mode(&self) -> SyncMode {
        *self.mode.read().expect("registry mode poisoned")
    }

    /// Switch sync mode and reload custom descriptors from the new store of record.
    pub fn set_sync_mode(&self, mode: SyncMode) -> Result<()> {
        if mode.writes_remote() && self.mirror.is_none() {
            return Err(Error::Config(format!(
                "sync mode '{}' needs backend storage",
                mode.as_str()
            )));
        }
        *self.mode.write().expect("registry mode poisoned") = mode;
        self.reload()
    }

    /// Re-read custom descriptors from the store of record.
    pub fn reload(&self) -> Result<()> {
        let mode = self.sync_mode();
        let models = match mode {
            SyncMode::BackendOnly => {
                let mirror = self.require_mirror(mode)?;
                mirror
                    .remote()
                    .list_models()?
                    .into_iter()
                    .map(ModelDescriptor::redacted)
                    .collect()
            }
            SyncMode::LocalOnly | SyncMode::Both => {
                let conn = self.pool.get()?;
                store::custom_models::list(&conn)?
            }
        };
        debug!(count = models.len(), mode = mode.as_str(), "loaded custom models");
        *self.custom.write().expect("registry cache poisoned") = models;
        Ok(())
    }

    /// Built-in catalog plus custom descriptors. A failed catalog fetch is
    /// reported as `BackendUnavailable` carrying the custom descriptors.
    pub fn list_available(&self) -> Result<AvailableModels> {
        if let Some(catalog) = self.catalog.read().expect("registry catalog poisoned").as_ref() {
            return Ok(AvailableModels {
                catalog: catalog.entries().to_vec(),
                custom: self.list_custom(),
            });
        }
        self.refresh_catalog()?;
        self.list_available()
    }

    /// Fetch the catalog again. The previous snapshot is kept on failure.
    pub fn refresh_catalog(&self) -> Result<usize> {
        match self.backend.list_providers() {
            Ok(entries) => {
                let catalog = ProviderCatalog::from_entries(entries);
                let count = catalog.model_count();
                let shadowed: Vec<ModelDescriptor> = self
                    .list_custom()
                    .into_iter()
                    .filter(|model| catalog.contains(&model.id))
                    .collect();
                info!(models = count, "provider catalog refreshed");
                *self.catalog.write().expect("registry catalog poisoned") = Some(catalog);

                for model in shadowed {
                    let old_id = model.id.clone();
                    match self.rekey(model) {
                        Ok(new_id) => warn!(%old_id, %new_id, "custom model id taken by a built-in; renamed"),
                        Err(err) => warn!(%old_id, error = %err, "could not rename shadowed custom model"),
                    }
                }
                Ok(count)
            }
            Err(err) => {
                warn!(error = %err, "provider catalog unavailable");
                Err(Error::BackendUnavailable {
                    message: err.to_string(),
                    custom: self.list_custom(),
                })
            }
        }
    }

    pub fn catalog_loaded(&self) -> bool {
        self.catalog
            .read()
            .expect("registry catalog poisoned")
            .is_some()
    }

    pub fn list_custom(&self) -> Vec<ModelDescriptor> {
        self.custom.read().expect("registry cache poisoned").clone()
    }

    /// Look up `id` across built-in and custom descriptors.
    pub fn resolve(&self, id: &str) -> Option<ModelDescriptor> {
        if let Some(model) = self
            .catalog
            .read()
            .expect("registry catalog poisoned")
            .as_ref()
            .and_then(|catalog| catalog.get_model(id))
        {
            return Some(model.clone());
        }
        self.custom
            .read()
            .expect("registry cache poisoned")
            .iter()
            .find(|model| model.id == id)
            .cloned()
    }

    /// First model of the cached catalog, else the first custom descriptor.
    pub fn fallback_model(&self) -> Option<ModelDescriptor> {
        let from_catalog = self
            .catalog
            .read()
            .expect("registry catalog poisoned")
            .as_ref()
            .and_then(|catalog| catalog.first_model().cloned());
        from_catalog.or_else(|| self.list_custom().into_iter().next())
    }

    /// Validate and store a custom descriptor. An empty id gets a generated
    /// one. The returned descriptor never carries the API key.
    pub fn upsert(&self, descriptor: ModelDescriptor) -> Result<Synced<ModelDescriptor>> {
        let mut descriptor = descriptor.normalized();
        descriptor.validate()?;

        if descriptor.id.is_empty() {
            descriptor.id = generate_id();
        }

        // Without a catalog a built-in id cannot be ruled out. An offline
        // upsert still goes through; `refresh_catalog` renames it on load.
        if !self.catalog_loaded() {
            if let Err(err) = self.refresh_catalog() {
                debug!(error = %err, "saving custom model before the catalog is known");
            }
        }
        let is_builtin = self
            .catalog
            .read()
            .expect("registry catalog poisoned")
            .as_ref()
            .map(|catalog| catalog.contains(&descriptor.id))
            .unwrap_or(false);
        if is_builtin {
            return Err(Error::validation(format!(
                "id '{}' is already used by a built-in model",
                descriptor.id
            )));
        }

        let existing = {
            let custom = self.custom.read().expect("registry cache poisoned");
            if let Some(other) = custom
                .iter()
                .find(|other| other.id != descriptor.id && other.same_target(&descriptor))
            {
                return Err(Error::validation(format!(
                    "model '{}' already targets {} {}",
                    other.id, descriptor.provider_type, descriptor.model_identifier
                )));
            }
            custom.iter().find(|other| other.id == descriptor.id).cloned()
        };

        let api_key = descriptor.api_key.take();
        let had_key = existing.map(|model| model.has_api_key).unwrap_or(false);
        descriptor.has_api_key = api_key.is_some() || had_key;

        // The key lands in the keychain before any row claims it.
        let previous_key = if had_key {
            api_keys::load_api_key(&descriptor.id)?
        } else {
            None
        };
        if let Some(key) = &api_key {
            api_keys::store_api_key(&descriptor.id, key)?;
        }

        let written = self.persist(PendingWrite::PutModel(RemoteModel {
            descriptor: descriptor.clone(),
            api_key: api_key.clone().or_else(|| previous_key.clone()),
        }));
        let warning = match written {
            Ok(warning) => warning,
            Err(err) => {
                if api_key.is_some() {
                    let restored = match &previous_key {
                        Some(key) => api_keys::store_api_key(&descriptor.id, key),
                        None => api_keys::delete_api_key(&descriptor.id),
                    };
                    if let Err(restore_err) = restored {
                        warn!(id = %descriptor.id, error = %restore_err, "could not roll back API key");
                    }
                }
                return Err(err);
            }
        };

        {
            let mut custom = self.custom.write().expect("registry cache poisoned");
            match custom.iter_mut().find(|model| model.id == descriptor.id) {
                Some(slot) => *slot = descriptor.clone(),
                None => custom.push(descriptor.clone()),
            }
        }
        info!(id = %descriptor.id, provider = %descriptor.provider_type, "custom model saved");
        Ok(Synced::with_warning(descriptor, warning))
    }

    /// Delete a custom descriptor. Built-in and unknown ids are `NotFound`.
    pub fn remove(&self, id: &str) -> Result<Synced<()>> {
        let is_builtin = self
            .catalog
            .read()
            .expect("registry catalog poisoned")
            .as_ref()
            .map(|catalog| catalog.contains(id))
            .unwrap_or(false);
        if is_builtin {
            return Err(Error::not_found("custom model", id));
        }
        let known = self
            .custom
            .read()
            .expect("registry cache poisoned")
            .iter()
            .any(|model| model.id == id);
        if !known {
            return Err(Error::not_found("custom model", id));
        }

        let warning = self.persist(PendingWrite::DeleteModel(id.to_string()))?;
        api_keys::delete_api_key(id)?;

        self.custom
            .write()
            .expect("registry cache poisoned")
            .retain(|model| model.id != id);
        info!(%id, "custom model removed");
        Ok(Synced::with_warning((), warning))
    }

    /// Plaintext API key for a custom descriptor, for handing to the backend.
    pub fn api_key(&self, id: &str) -> Result<Option<String>> {
        api_keys::load_api_key(id)
    }

    /// Move a custom descriptor (and its key) to a fresh generated id.
    fn rekey(&self, model: ModelDescriptor) -> Result<String> {
        let old_id = model.id.clone();
        let api_key = if model.has_api_key {
            api_keys::load_api_key(&old_id)?
        } else {
            None
        };
        let mut renamed = model;
        renamed.id = generate_id();

        if let Some(key) = &api_key {
            api_keys::store_api_key(&renamed.id, key)?;
        }
        self.persist(PendingWrite::PutModel(RemoteModel {
            descriptor: renamed.clone(),
            api_key,
        }))?;
        self.persist(PendingWrite::DeleteModel(old_id.clone()))?;
        api_keys::delete_api_key(&old_id)?;

        let mut custom = self.custom.write().expect("registry cache poisoned");
        if let Some(slot) = custom.iter_mut().find(|slot| slot.id == old_id) {
            *slot = renamed.clone();
        }
        Ok(renamed.id)
    }

    fn require_mirror(&self, mode: SyncMode) -> Result<&RemoteMirror> {
        self.mirror.as_deref().ok_or_else(|| {
            Error::Config(format!(
                "sync mode '{}' needs backend storage",
                mode.as_str()
            ))
        })
    }

    /// Apply a write to the store(s) of record for the current mode.
    fn persist(&self, write: PendingWrite) -> Result<Option<SyncWarning>> {
        let mode = self.sync_mode();
        if !mode.writes_local() {
            self.require_mirror(mode)?.write_through(&write)?;
            return Ok(None);
        }

        {
            let conn = self.pool.get()?;
            match &write {
                PendingWrite::PutModel(model) => {
                    store::custom_models::upsert(&conn, &model.descriptor)?
                }
                PendingWrite::DeleteModel(id) => {
                    store::custom_models::delete(&conn, id)?;
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
