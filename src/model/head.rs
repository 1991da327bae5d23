//! The trainable linear classification head.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use schemars::JsonSchema;

use crate::prelude::*;

/// A linear layer mapping backbone features to one logit per class.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "HeadWeights", into = "HeadWeights")]
pub struct LinearHead {
    /// Weights, with shape `(classes, features)`.
    pub(crate) weights: Array2<f32>,
    /// Bias, with one entry per class.
    pub(crate) bias: Array1<f32>,
}

impl LinearHead {
    /// Create a head with all weights and biases set to zero.
    pub fn zeros(n_classes: usize, n_features: usize) -> Self {
        Self {
            weights: Array2::zeros((n_classes, n_features)),
            bias: Array1::zeros(n_classes),
        }
    }

    /// How many classes do we predict?
    pub fn n_classes(&self) -> usize {
        self.weights.nrows()
    }

    /// How many input features do we expect?
    pub fn n_features(&self) -> usize {
        self.weights.ncols()
    }

    /// Compute logits for a `(batch, features)` matrix.
    pub fn logits(&self, features: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        if features.ncols() != self.n_features() {
            return Err(anyhow!(
                "classification head expects {} features, but the backbone produced {}",
                self.n_features(),
                features.ncols()
            ));
        }
        Ok(features.dot(&self.weights.t()) + &self.bias.view().insert_axis(Axis(0)))
    }
}

/// On-disk form of [`LinearHead`].
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HeadWeights {
    /// One row of weights per class.
    pub weights: Vec<Vec<f32>>,
    /// One bias per class.
    pub bias: Vec<f32>,
}

impl TryFrom<HeadWeights> for LinearHead {
    type Error = anyhow::Error;

    fn try_from(value: HeadWeights) -> Result<Self> {
        let n_classes = value.weights.len();
        if value.bias.len() != n_classes {
            return Err(anyhow!(
                "head has {} weight rows but {} biases",
                n_classes,
                value.bias.len()
            ));
        }
        let n_features = value.weights.first().map(Vec::len).unwrap_or(0);
        if value.weights.iter().any(|row| row.len() != n_features) {
            return Err(anyhow!("head weight rows have different lengths"));
        }
        let flat = value.weights.into_iter().flatten().collect::<Vec<_>>();
        let weights = Array2::from_shape_vec((n_classes, n_features), flat)
            .context("invalid head weight shape")?;
        Ok(Self {
            weights,
            bias: Array1::from(value.bias),
        })
    }
}

impl From<LinearHead> for HeadWeights {
    fn from(value: LinearHead) -> Self {
        Self {
            weights: value.weights.outer_iter().map(|row| row.to_vec()).collect(),
            bias: value.bias.to_vec(),
        }
    }
}
