use std::path::Path;

use chrono::{SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::classify::QueryClassification;

/// Per-provider outcome recorded in `metadata.json`.
///
/// `variations_generated` counts images that were normalized and saved, so a
/// provider that produced four raw images of which one failed normalization
/// reports three. `success` is true only when no error of any kind occurred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderReport {
    pub variations_requested: u32,
    pub variations_generated: u32,
    pub errors: Vec<String>,
    pub success: bool,
}

impl ProviderReport {
    pub fn new(variations_requested: u32) -> Self {
        Self {
            variations_requested,
            variations_generated: 0,
            errors: Vec::new(),
            success: true,
        }
    }

    pub fn record_saved(&mut self) {
        self.variations_generated += 1;
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
        self.success = false;
    }
}

/// Session-level `metadata.json` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub timestamp: String,
    pub query: String,
    pub classification: QueryClassification,
    pub providers: IndexMap<String, ProviderReport>,
    pub total_images_generated: u32,
    pub session_folder: String,
}

impl SessionManifest {
    pub fn new(
        query: impl Into<String>,
        classification: QueryClassification,
        session_folder: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: now_utc_iso(),
            query: query.into(),
            classification,
            providers: IndexMap::new(),
            total_images_generated: 0,
            session_folder: session_folder.into(),
        }
    }

    pub fn record_provider(&mut self, name: impl Into<String>, report: ProviderReport) {
        self.total_images_generated += report.variations_generated;
        self.providers.insert(name.into(), report);
    }
}

pub fn write_manifest(path: &Path, manifest: &SessionManifest) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(manifest)?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
