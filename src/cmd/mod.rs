//! Command-line entry points.

use clap::Args;

use crate::{
    model::PageClassifier,
    prelude::*,
    rasterize::RasterizeOptions,
    screening::{ScreeningTool, prepare_scratch_dir},
};

pub mod classify;
pub mod schema;
pub mod screen;
pub mod screen_file;
pub mod train;

/// Common options for subcommands that process many inputs.
#[derive(Debug, Clone, Args)]
pub struct StreamOpts {
    /// Limit processing to the first N records.
    #[clap(long)]
    pub take_first: Option<usize>,

    /// Max number of papers to process at a time.
    #[clap(short = 'j', long = "jobs", default_value = "8")]
    pub job_count: usize,

    /// What portion of inputs should we allow to fail? Specified as a
    /// number between 0.0 and 1.0.
    #[clap(long, default_value = "0.01")]
    pub allowed_failure_rate: f32,
}

/// Which trained model to use.
#[derive(Debug, Clone, Args)]
pub struct ModelOpts {
    /// The model manifest (`.json`) written by `train`.
    #[clap(short = 'm', long = "model", env = "SCREENING_MODEL")]
    pub model_path: PathBuf,

    /// Number of page images to classify in one batch.
    #[clap(long, default_value = "8")]
    pub batch_size: usize,
}

impl ModelOpts {
    /// Load our model and wrap it in a [`ScreeningTool`].
    pub async fn screening_tool(
        &self,
        rasterize: RasterizeOptions,
        tmp_dir: Option<PathBuf>,
    ) -> Result<ScreeningTool> {
        // Check this before spending time loading the model.
        prepare_scratch_dir(tmp_dir.as_deref())?;
        let classifier = PageClassifier::load(&self.model_path)
            .await?
            .with_batch_size(self.batch_size);
        ScreeningTool::new(classifier, rasterize, tmp_dir)
    }
}
