//! Model catalog
//!
//! Static alias → backend mapping, built once from the configuration
//! document and never modified afterwards.

use std::collections::BTreeMap;
use voice_insight_common::config::ModelConfig;
use voice_insight_common::{BackendKind, ManagerError, Result};

/// Measured footprints of known models, in GB
const KNOWN_FOOTPRINTS: &[(&str, f64)] = &[
    ("mlx-community/whisper-large-v3-turbo", 1.5),
    ("mlx-community/whisper-large-v3-mlx", 3.0),
    ("mlx-community/whisper-large-v3-turbo-asr-fp16", 1.5),
    ("mlx-community/distil-whisper-large-v3", 1.2),
    ("mlx-community/Kokoro-82M-bf16", 0.5),
    ("Marvis-AI/marvis-tts-250m-v0.1", 1.0),
];

/// One catalog entry
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub alias: String,
    pub backend_kind: BackendKind,
    pub model_path: String,
    pub footprint_gb: f64,
}

/// Alias-keyed model catalog
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl ModelCatalog {
    /// Build a catalog from explicit entries
    pub fn new(entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.alias.clone(), entry))
                .collect(),
        }
    }

    /// Build a catalog from the `models` section of the configuration.
    /// Missing footprints are estimated from the model path.
    pub fn from_config(models: &BTreeMap<String, ModelConfig>) -> Self {
        Self::new(models.iter().map(|(alias, model)| CatalogEntry {
            alias: alias.clone(),
            backend_kind: model.kind,
            model_path: model.path.clone(),
            footprint_gb: model
                .params
                .memory_gb
                .unwrap_or_else(|| estimate_footprint_gb(&model.path, model.kind)),
        }))
    }

    /// Look up an alias
    pub fn get(&self, alias: &str) -> Result<&CatalogEntry> {
        self.entries
            .get(alias)
            .ok_or_else(|| ManagerError::not_found(alias))
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Estimated memory footprint for a model, in GB
pub fn estimate_footprint_gb(model_path: &str, kind: BackendKind) -> f64 {
    if let Some((_, gb)) = KNOWN_FOOTPRINTS.iter().find(|(path, _)| *path == model_path) {
        return *gb;
    }

    let path = model_path.to_lowercase();
    match kind {
        BackendKind::Stt => {
            if path.contains("turbo") {
                1.5
            } else if path.contains("large") {
                3.0
            } else if path.contains("medium") {
                1.5
            } else if path.contains("small") {
                0.5
            } else {
                2.0
            }
        }
        BackendKind::Tts => {
            if path.contains("250m") {
                1.0
            } else if path.contains("82m") {
                0.5
            } else {
                1.0
            }
        }
    }
}
