// engine/src/settings.rs
//!
//! Session settings. Model fields hold descriptor ids only and are resolved
//! through the registry at the point of use, falling back when an id no
//! longer resolves.

use crate::config::DefaultsConfig;
use crate::pipeline::Stage;
use crate::registry::{ModelDescriptor, ModelRegistry};
use crate::sync::SyncMode;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub temperature: f64,
    /// Model used for every stage unless advanced mode overrides it.
    pub default_model: Option<String>,
    pub advanced_mode: bool,
    /// Only populated while `advanced_mode` is on.
    pub per_stage_model: BTreeMap<Stage, String>,
    pub sync_mode: SyncMode,
    #[serde(skip)]
    defaults: DefaultsConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(DefaultsConfig::default())
    }
}

impl Settings {
    pub fn new(defaults: DefaultsConfig) -> Self {
        Self {
            temperature: defaults.temperature,
            default_model: defaults.model.clone(),
            advanced_mode: false,
            per_stage_model: BTreeMap::new(),
            sync_mode: defaults.sync_mode,
            defaults,
        }
    }

    /// Back to the configured defaults.
    pub fn reset(&mut self) {
        *self = Self::new(self.defaults.clone());
    }

    pub fn set_temperature(&mut self, temperature: f64) -> Result<()> {
        if !temperature.is_finite() || !(0.0..=2.0).contains(&temperature) {
            return Err(Error::validation("temperature must be between 0.0 and 2.0"));
        }
        self.temperature = temperature;
        Ok(())
    }

    /// Turning advanced mode off drops every per-stage override.
    pub fn set_advanced_mode(&mut self, enabled: bool) {
        self.advanced_mode = enabled;
        if !enabled {
            self.per_stage_model.clear();
        }
    }

    pub fn set_stage_model(&mut self, stage: Stage, model_id: impl Into<String>) -> Result<()> {
        if !self.advanced_mode {
            return Err(Error::validation(
                "per-stage models require advanced mode",
            ));
        }
        self.per_stage_model.insert(stage, model_id.into());
        Ok(())
    }

    pub fn clear_stage_model(&mut self, stage: Stage) {
        self.per_stage_model.remove(&stage);
    }

    /// Descriptor to use for `stage`: the per-stage override (advanced mode),
    /// then the default model, then the registry's fallback. Ids that no
    /// longer resolve are skipped.
    pub fn model_for(&self, stage: Stage, registry: &ModelRegistry) -> Option<ModelDescriptor> {
        let override_id = if self.advanced_mode {
            self.per_stage_model.get(&stage)
        } else {
            None
        };

        override_id
            .into_iter()
            .chain(self.default_model.iter())
            .find_map(|id| {
                let resolved = registry.resolve(id);
                if resolved.is_none() {
                    warn!(%stage, model = %id, "configured model no longer resolves; falling back");
                }
                resolved
            })
            .or_else(|| registry.fallback_model())
    }

    /// Temperature for a stage run on `model`. A per-stage model's own
    /// default temperature wins in advanced mode.
    pub fn temperature_for(&self, stage: Stage, model: &ModelDescriptor) -> f64 {
        let is_override = self.advanced_mode
            && self
                .per_stage_model
                .get(&stage)
                .map(|id| id == &model.id)
                .unwrap_or(false);
        match model.default_temperature {
            Some(temperature) if is_override => temperature,
            _ => self.temperature,
        }
    }

    /// Reset every model id that no longer resolves. Returns the names of the
    /// fields that changed. Built-in ids cannot be judged until the catalog
    /// has been fetched, so nothing changes before that.
    pub fn reconcile(&mut self, registry: &ModelRegistry) -> Vec<String> {
        if !registry.catalog_loaded() {
            return Vec::new();
        }
        let mut changed = Vec::new();

        if let Some(id) = &self.default_model {
            if registry.resolve(id).is_none() {
                changed.push("defaultModel".to_string());
                self.default_model = None;
            }
        }

        let dangling: Vec<Stage> = self
            .per_stage_model
            .iter()
            .filter(|(_, id)| registry.resolve(id).is_none())
            .map(|(stage, _)| *stage)
            .collect();
        for stage in dangling {
            self.per_stage_model.remove(&stage);
            changed.push(format!("perStageModel.{stage}"));
        }

        if !changed.is_empty() {
            info!(fields = ?changed, "settings reset dangling model references");
        }
        changed
    }
}
