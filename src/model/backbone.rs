//! Pretrained networks that turn image tensors into feature vectors.

use std::{borrow::Cow, sync::Mutex};

use ndarray::{Array2, ArrayView4};
use ort::{
    logging::LogLevel,
    session::{Session, SessionInputs},
    value::TensorRef,
};

use crate::prelude::*;

/// A frozen network mapping an NCHW image batch to one row per image.
///
/// The rows are either features for a [`super::head::LinearHead`], or class
/// logits when the network was exported with its classifier attached.
pub trait Backbone: Send + Sync {
    /// Run a batch through the network.
    fn forward(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>>;
}

/// A [`Backbone`] backed by an ONNX Runtime session.
pub struct OnnxBackbone {
    /// `Session::run` needs `&mut self`, so we serialize access.
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    model_path: PathBuf,
}

impl OnnxBackbone {
    /// Load an ONNX model. If tensor names are not given, the model's first
    /// declared input and output are used.
    #[instrument(level = "debug", skip_all, fields(path = %model_path.display()))]
    pub fn load(
        model_path: &Path,
        input_name: Option<&str>,
        output_name: Option<&str>,
    ) -> Result<Self> {
        let session = Session::builder()
            .and_then(|builder| builder.with_log_level(LogLevel::Error))
            .and_then(|builder| builder.commit_from_file(model_path))
            .with_context(|| {
                format!("failed to load ONNX model {:?}", model_path.display())
            })?;

        let input_name = match input_name {
            Some(name) => name.to_owned(),
            None => session
                .inputs
                .first()
                .map(|input| input.name.clone())
                .ok_or_else(|| {
                    anyhow!("ONNX model {:?} has no inputs", model_path.display())
                })?,
        };
        let output_name = match output_name {
            Some(name) => name.to_owned(),
            None => session
                .outputs
                .first()
                .map(|output| output.name.clone())
                .ok_or_else(|| {
                    anyhow!("ONNX model {:?} has no outputs", model_path.display())
                })?,
        };
        debug!(%input_name, %output_name, "Loaded ONNX backbone");

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            model_path: model_path.to_owned(),
        })
    }
}

impl Backbone for OnnxBackbone {
    fn forward(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
        let input_shape = batch.shape().to_vec();
        let batch = batch.as_standard_layout();
        let tensor = TensorRef::from_array_view(batch.view()).with_context(|| {
            format!("failed to convert input tensor with shape {:?}", input_shape)
        })?;
        let inputs: SessionInputs<'_, '_, 0> = SessionInputs::ValueMap(vec![(
            Cow::Borrowed(self.input_name.as_str()),
            tensor.into(),
        )]);

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("ONNX session lock poisoned"))?;
        let outputs = session.run(inputs).with_context(|| {
            format!(
                "inference failed for {:?} with input shape {:?}",
                self.model_path.display(),
                input_shape
            )
        })?;
        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .with_context(|| {
                format!("failed to extract output {:?} as f32", self.output_name)
            })?;
        let shape = shape.iter().map(|&d| d as usize).collect::<Vec<_>>();
        flatten_per_sample(&shape, data)
    }
}

/// Reshape a `(N, ...)` tensor to `(N, D)`, for backbones that end in a
/// `(N, D, 1, 1)` pooling layer.
fn flatten_per_sample(shape: &[usize], data: &[f32]) -> Result<Array2<f32>> {
    let (&n, rest) = shape
        .split_first()
        .ok_or_else(|| anyhow!("backbone produced a scalar output"))?;
    let d = rest.iter().product::<usize>();
    Array2::from_shape_vec((n, d), data.to_vec())
        .with_context(|| format!("backbone output shape {:?} does not match its data", shape))
}
