//! Loading and running page classification models.
//!
//! A model is a frozen ONNX backbone plus an optional linear head, described
//! by a JSON [`ModelManifest`]. Training produces the head; inference runs
//! both and applies a per-class decision threshold.

pub mod backbone;
pub mod classifier;
pub mod head;
pub mod manifest;
pub mod preprocess;

pub use self::{
    classifier::{PageClassifier, PagePrediction},
    manifest::ModelManifest,
};
