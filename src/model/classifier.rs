//! Per-image page classification.

use std::sync::Arc;

use image::DynamicImage;
use ndarray::{Array2, ArrayView1, ArrayView4, Axis};

use super::{
    backbone::{Backbone, OnnxBackbone},
    head::LinearHead,
    manifest::ModelManifest,
    preprocess::{Preprocessing, load_image},
};
use crate::{
    async_utils::blocking::spawn_blocking_propagating_panics, categories::Category,
    prelude::*,
};

/// How many page images we send through the backbone at once.
pub const DEFAULT_BATCH_SIZE: usize = 8;

/// The classifier's verdict on a single page image.
#[derive(Clone, Debug, PartialEq)]
pub struct PagePrediction {
    /// The detected categories, in class order. Never empty.
    pub labels: Vec<Category>,
    /// The probability of each class, paired with its category.
    pub probabilities: Vec<(Category, f32)>,
}

impl PagePrediction {
    /// The predicted probability for `category`, if the model knows it.
    pub fn probability(&self, category: Category) -> Option<f32> {
        self.probabilities
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, p)| *p)
    }
}

/// A multi-label page classifier: a frozen backbone, an optional linear head,
/// and a decision threshold.
#[derive(Clone)]
pub struct PageClassifier {
    backbone: Arc<dyn Backbone>,
    head: Option<LinearHead>,
    classes: Vec<Category>,
    threshold: f32,
    preprocessing: Preprocessing,
    batch_size: usize,
}

impl PageClassifier {
    /// Assemble a classifier from its parts.
    pub fn new(
        backbone: Arc<dyn Backbone>,
        head: Option<LinearHead>,
        classes: Vec<Category>,
        threshold: f32,
        preprocessing: Preprocessing,
    ) -> Self {
        Self {
            backbone,
            head,
            classes,
            threshold,
            preprocessing,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Load a classifier from a model manifest, including its ONNX backbone.
    #[instrument(level = "debug", skip_all, fields(path = %manifest_path.display()))]
    pub async fn load(manifest_path: &Path) -> Result<Self> {
        let manifest = ModelManifest::load(manifest_path).await?;
        spawn_blocking_propagating_panics(move || Self::from_manifest(manifest)).await
    }

    /// Build a classifier from an already-loaded manifest.
    pub fn from_manifest(manifest: ModelManifest) -> Result<Self> {
        manifest.validate()?;
        let backbone = OnnxBackbone::load(
            &manifest.backbone,
            manifest.input_name.as_deref(),
            manifest.output_name.as_deref(),
        )?;
        Ok(Self::new(
            Arc::new(backbone),
            manifest.head,
            manifest.classes,
            manifest.threshold,
            manifest.preprocessing,
        ))
    }

    /// Use a different batch size for inference.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// The categories this model predicts, in output order.
    pub fn classes(&self) -> &[Category] {
        &self.classes
    }

    /// Compute class probabilities for a preprocessed NCHW batch.
    pub fn probabilities(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
        let output = self.backbone.forward(batch)?;
        if output.nrows() != batch.len_of(Axis(0)) {
            return Err(anyhow!(
                "model produced {} output rows for {} images",
                output.nrows(),
                batch.len_of(Axis(0))
            ));
        }
        let logits = match &self.head {
            Some(head) => head.logits(output.view())?,
            None => output,
        };
        if logits.ncols() != self.classes.len() {
            return Err(anyhow!(
                "model produced {} outputs per image, but has {} classes",
                logits.ncols(),
                self.classes.len()
            ));
        }
        Ok(logits.mapv(sigmoid))
    }

    /// Classify in-memory images.
    pub fn predict_images(&self, images: &[DynamicImage]) -> Result<Vec<PagePrediction>> {
        let batch = self.preprocessing.batch(images);
        let probs = self.probabilities(batch.view())?;
        Ok(probs
            .outer_iter()
            .map(|row| self.prediction_for(row))
            .collect())
    }

    /// Classify image files, returning one prediction per path, in order.
    pub fn predict_paths(&self, paths: &[PathBuf]) -> Result<Vec<PagePrediction>> {
        let mut predictions = Vec::with_capacity(paths.len());
        for chunk in paths.chunks(self.batch_size) {
            let images = chunk
                .iter()
                .map(|path| load_image(path))
                .collect::<Result<Vec<_>>>()?;
            predictions.extend(self.predict_images(&images)?);
        }
        Ok(predictions)
    }

    fn prediction_for(&self, probs: ArrayView1<'_, f32>) -> PagePrediction {
        PagePrediction {
            labels: decide_labels(&self.classes, probs, self.threshold),
            probabilities: self.classes.iter().copied().zip(probs.iter().copied()).collect(),
        }
    }
}

/// Pick the labels for one image: every class whose probability is strictly
/// above `threshold`, or the single most probable class if none is.
pub fn decide_labels(
    classes: &[Category],
    probs: ArrayView1<'_, f32>,
    threshold: f32,
) -> Vec<Category> {
    let detected = classes
        .iter()
        .zip(probs.iter())
        .filter(|(_, p)| **p > threshold)
        .map(|(c, _)| *c)
        .collect::<Vec<_>>();
    if !detected.is_empty() {
        return detected;
    }
    // Ties go to the earliest class.
    let mut best: Option<(Category, f32)> = None;
    for (&class, &p) in classes.iter().zip(probs.iter()) {
        if best.is_none_or(|(_, best_p)| p > best_p) {
            best = Some((class, p));
        }
    }
    best.map(|(c, _)| vec![c]).unwrap_or_default()
}

/// The logistic function.
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
