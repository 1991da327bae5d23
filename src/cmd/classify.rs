//! The `classify` subcommand.

use clap::Args;

use super::ModelOpts;
use crate::{
    async_utils::io::find_files_with_extensions,
    prelude::*,
    rasterize::RasterizeOptions,
    screening::{IMAGE_EXTENSIONS, write_page_predictions},
};

/// Classify page images directly.
#[derive(Debug, Args)]
pub struct ClassifyOpts {
    /// Image files, or folders to search for images.
    #[clap(required = true, value_name = "IMAGE_OR_DIR")]
    pub inputs: Vec<PathBuf>,

    #[clap(flatten)]
    pub model: ModelOpts,

    /// Output CSV file. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// Run the `classify` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_classify(opts: &ClassifyOpts) -> Result<()> {
    let mut paths = vec![];
    for input in &opts.inputs {
        if input.is_dir() {
            paths.extend(find_files_with_extensions(input, IMAGE_EXTENSIONS)?);
        } else if input.is_file() {
            paths.push(input.clone());
        } else {
            return Err(anyhow!("no such image or folder: {:?}", input.display()));
        }
    }

    let tool = opts
        .model
        .screening_tool(RasterizeOptions::default(), None)
        .await?;
    let results = tool.classify_images(paths).await?;
    let rows = results
        .iter()
        .map(|(path, prediction)| (path.display().to_string(), prediction));
    write_page_predictions(opts.output_path.as_deref(), tool.classes(), rows).await
}
