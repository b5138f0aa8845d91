// engine/src/model_catalog.rs
//!
//! Provider Catalog: the backend-supplied, read-only set of built-in models.
//!
//! The catalog is fetched through `PipelineBackend::list_providers` and indexed
//! here for lookups by model id. Nothing in this module mutates a catalog
//! after it has been built; refreshing means building a new one.

use crate::registry::ModelDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Provider grouping returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCatalogEntry {
    pub id: String,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Whether the backend currently reports this provider as reachable
    #[serde(default = "default_true")]
    pub available: bool,

    #[serde(default)]
    pub models: Vec<ModelDescriptor>,
}

fn default_true() -> bool {
    true
}

/// Indexed catalog snapshot.
#[derive(Debug, Clone, Default)]
pub struct ProviderCatalog {
    entries: Vec<ProviderCatalogEntry>,
    models_by_id: HashMap<String, ModelDescriptor>,
}

impl ProviderCatalog {
    pub fn from_entries(entries: Vec<ProviderCatalogEntry>) -> Self {
        let models_by_id = entries
            .iter()
            .flat_map(|entry| entry.models.iter())
            .map(|model| (model.id.clone(), model.clone().redacted()))
            .collect();

        Self {
            entries,
            models_by_id,
        }
    }

    pub fn entries(&self) -> &[ProviderCatalogEntry] {
        &self.entries
    }

    /// Get a built-in model by ID
    pub fn get_model(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.models_by_id.get(model_id)
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.models_by_id.contains_key(model_id)
    }

    /// Get all models for a specific provider
    pub fn get_models_by_provider(&self, provider_id: &str) -> Vec<&ModelDescriptor> {
        self.entries
            .iter()
            .filter(|entry| entry.id == provider_id)
            .flat_map(|entry| entry.models.iter())
            .collect()
    }

    /// First model of the first available provider, used as the last-resort
    /// fallback when no configured model resolves.
    pub fn first_model(&self) -> Option<&ModelDescriptor> {
        self.entries
            .iter()
            .filter(|entry| entry.available)
            .flat_map(|entry| entry.models.iter())
            .next()
            .and_then(|model| self.models_by_id.get(&model.id))
    }

    pub fn model_count(&self) -> usize {
        self.models_by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models_by_id.is_empty()
    }
}
