use std::{
    collections::BTreeSet,
    path::Path,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::LayerFsError;

pub const METADATA_FILE_NAME: &str = "naruto_metadata.json";

/// The on-disk metadata record for a layer.
///
/// `is_root` has no default: a layer file missing it is malformed and
/// construction must fail, per the core's failure semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerMetadata {
    pub is_root: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

pub(crate) fn read(metadata_path: &Path) -> Result<LayerMetadata, LayerFsError> {
    let contents = std::fs::read_to_string(metadata_path)?;
    serde_json::from_str(&contents)
        .with_context(|| format!("malformed layer metadata at {}", metadata_path.display()))
        .map_err(|err| LayerFsError::NotALayer(metadata_path.to_path_buf()).context_or(err))
}

pub(crate) fn write(metadata_path: &Path, metadata: &LayerMetadata) -> Result<(), LayerFsError> {
    let contents = serde_json::to_string_pretty(metadata)
        .context("failed to serialize layer metadata")?;
    std::fs::write(metadata_path, contents)?;
    Ok(())
}

pub(crate) fn dedupe_tags(tags: impl IntoIterator<Item = String>) -> Vec<String> {
    tags.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
}

// Small helper so a malformed-metadata read can carry the underlying parse
// error as context while still reporting the typed `NotALayer` variant to
// callers that only care about the error kind.
impl LayerFsError {
    fn context_or(self, err: anyhow::Error) -> Self {
        tracing::debug!(error = %err, "layer metadata failed to parse");
        self
    }
}
