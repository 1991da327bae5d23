use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod categories;
mod cmd;
mod cpu_limit;
mod model;
mod paper_id;
mod prelude;
mod rasterize;
mod screening;
mod training;
mod ui;

/// Screen scientific PDFs for images of blots, micrographs, photos and more.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - SCREENING_MODEL (optional): Default value for `--model`.
  - RUST_LOG (optional): Log filter, such as `debug` or
    `screening_tool=trace`.

  These variables may be set in a standard `.env` file.

  Screening PDFs requires `pdfinfo` and `pdftocairo` from
  Poppler to be on the PATH.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Screen a folder of PDFs, writing one CSV row of page counts per paper.
    Screen(cmd::screen::ScreenOpts),
    /// Screen a single PDF.
    ScreenFile(cmd::screen_file::ScreenFileOpts),
    /// Classify individual page images.
    Classify(cmd::classify::ClassifyOpts),
    /// Train a page classifier from labeled images.
    Train(cmd::train::TrainOpts),
    /// Print schemas for input and output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Screen(opts) => opts.output_path.is_none(),
            Cmd::ScreenFile(opts) => opts.output_path.is_none(),
            Cmd::Classify(opts) => opts.output_path.is_none(),
            Cmd::Train(_) => false,
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    tracing_subscriber::registry().with(subscriber).init();

    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    match &opts.subcmd {
        Cmd::Screen(opts) => cmd::screen::cmd_screen(&ui, opts).await?,
        Cmd::ScreenFile(opts) => cmd::screen_file::cmd_screen_file(opts).await?,
        Cmd::Classify(opts) => cmd::classify::cmd_classify(opts).await?,
        Cmd::Train(opts) => cmd::train::cmd_train(&ui, opts).await?,
        Cmd::Schema(schema_opts) => cmd::schema::cmd_schema(schema_opts).await?,
    }
    Ok(())
}
