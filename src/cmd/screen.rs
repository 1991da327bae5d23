//! The `screen` subcommand.

use clap::{
    Args,
    builder::{OsStringValueParser, TypedValueParser as _},
};

use super::{ModelOpts, StreamOpts};
use crate::{prelude::*, rasterize::RasterizeOptions, ui::Ui};

/// Screen a folder of PDFs.
#[derive(Debug, Args)]
pub struct ScreenOpts {
    /// Folder to search for PDFs, including subfolders. PDFs should be named
    /// after their DOI, with `/` written as `+`.
    #[clap(value_name = "PDF_FOLDER")]
    pub pdf_folder: PathBuf,

    #[clap(flatten)]
    pub model: ModelOpts,

    /// Output CSV file. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Folder for temporary page images. Created if missing.
    #[clap(long, value_parser = OsStringValueParser::new().map(PathBuf::from))]
    pub tmp_dir: Option<PathBuf>,

    #[clap(flatten)]
    pub stream: StreamOpts,

    #[clap(flatten)]
    pub rasterize: RasterizeOptions,
}

/// Run the `screen` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_screen(ui: &Ui, opts: &ScreenOpts) -> Result<()> {
    if !opts.pdf_folder.is_dir() {
        return Err(anyhow!(
            "PDF folder {:?} does not exist",
            opts.pdf_folder.display()
        ));
    }
    let tool = opts
        .model
        .screening_tool(opts.rasterize.clone(), opts.tmp_dir.clone())
        .await?;
    tool.screen_folder(
        ui,
        &opts.pdf_folder,
        opts.output_path.as_deref(),
        &opts.stream,
    )
    .await?;
    Ok(())
}
