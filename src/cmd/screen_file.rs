//! The `screen-file` subcommand.

use clap::{
    Args,
    builder::{OsStringValueParser, TypedValueParser as _},
};

use super::ModelOpts;
use crate::{
    async_utils::io::CsvOutput,
    prelude::*,
    rasterize::RasterizeOptions,
    screening::{ScreeningRow, write_page_predictions},
};

/// Screen a single PDF.
#[derive(Debug, Args)]
pub struct ScreenFileOpts {
    /// The PDF to screen.
    pub pdf: PathBuf,

    #[clap(flatten)]
    pub model: ModelOpts,

    /// Output one row per page, with class probabilities, instead of a
    /// single row of counts.
    #[clap(long)]
    pub pagewise: bool,

    /// Output CSV file. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Folder for temporary page images. Created if missing.
    #[clap(long, value_parser = OsStringValueParser::new().map(PathBuf::from))]
    pub tmp_dir: Option<PathBuf>,

    #[clap(flatten)]
    pub rasterize: RasterizeOptions,
}

/// Run the `screen-file` subcommand.
#[instrument(level = "debug", skip_all, fields(pdf = %opts.pdf.display()))]
pub async fn cmd_screen_file(opts: &ScreenFileOpts) -> Result<()> {
    let tool = opts
        .model
        .screening_tool(opts.rasterize.clone(), opts.tmp_dir.clone())
        .await?;
    let paper = tool.screen_file(&opts.pdf).await?;
    for warning in &paper.warnings {
        warn!(paper_id = %paper.row.paper_id, "{}", warning);
    }

    let output_path = opts.output_path.as_deref();
    if opts.pagewise {
        let rows = paper
            .pages
            .iter()
            .enumerate()
            .map(|(idx, page)| (format!("page {}", idx + 1), page));
        write_page_predictions(output_path, tool.classes(), rows).await
    } else {
        let mut output = CsvOutput::create(output_path, ScreeningRow::csv_headers()).await?;
        output.write_record(paper.row.to_record()).await?;
        output.finish().await
    }
}
