//! The on-disk description of a trained screening model.

use std::collections::BTreeSet;

use schemars::JsonSchema;

use super::{
    head::{HeadWeights, LinearHead},
    preprocess::Preprocessing,
};
use crate::{categories::Category, prelude::*};

/// Everything needed to load and run a trained model.
///
/// This is stored as JSON next to the ONNX backbone it refers to.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelManifest {
    /// Path to the ONNX backbone. Relative paths are resolved against the
    /// directory containing the manifest.
    pub backbone: PathBuf,

    /// Name of the backbone's image input. Defaults to the first input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_name: Option<String>,

    /// Name of the backbone output to use. Defaults to the first output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_name: Option<String>,

    /// How to turn images into tensors.
    #[serde(default)]
    pub preprocessing: Preprocessing,

    /// The category of each model output, in order.
    #[serde(default = "default_classes")]
    pub classes: Vec<Category>,

    /// Probability above which a category counts as detected.
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    /// A linear head applied to the backbone output. If absent, the
    /// backbone output is used as logits directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<HeadWeights>")]
    pub head: Option<LinearHead>,
}

fn default_classes() -> Vec<Category> {
    Category::ALL.to_vec()
}

/// The decision threshold used when none is configured.
pub fn default_threshold() -> f32 {
    0.5
}

impl ModelManifest {
    /// Read a manifest from disk, resolve the backbone path, and validate it.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read model manifest {:?}", path.display()))?;
        let mut manifest: Self = serde_json::from_str(&data).with_context(|| {
            format!("failed to parse model manifest {:?}", path.display())
        })?;
        if manifest.backbone.is_relative()
            && let Some(dir) = path.parent()
        {
            manifest.backbone = dir.join(&manifest.backbone);
        }
        manifest
            .validate()
            .with_context(|| format!("invalid model manifest {:?}", path.display()))?;
        Ok(manifest)
    }

    /// Write this manifest as pretty-printed JSON.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("failed to serialize manifest")?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("failed to write model manifest {:?}", path.display()))
    }

    /// Check that the manifest is internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.classes.is_empty() {
            return Err(anyhow!("model must have at least one class"));
        }
        let unique = self.classes.iter().collect::<BTreeSet<_>>();
        if unique.len() != self.classes.len() {
            return Err(anyhow!("model classes contain duplicates: {:?}", self.classes));
        }
        if !(self.threshold > 0.0 && self.threshold < 1.0) {
            return Err(anyhow!(
                "threshold must be between 0 and 1, got {}",
                self.threshold
            ));
        }
        if let Some(head) = &self.head
            && head.n_classes() != self.classes.len()
        {
            return Err(anyhow!(
                "head predicts {} classes, but {} are listed",
                head.n_classes(),
                self.classes.len()
            ));
        }
        self.preprocessing.validate()
    }
}
