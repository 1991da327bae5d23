//! The `train` subcommand.

use clap::Args;

use crate::{
    prelude::*,
    training::{self, config::TrainConfig},
    ui::Ui,
};

/// Train a page classifier.
#[derive(Debug, Args)]
pub struct TrainOpts {
    /// Training config file (`.toml` or `.json`).
    #[clap(value_name = "CONFIG")]
    pub config_path: PathBuf,
}

/// Run the `train` subcommand.
#[instrument(level = "debug", skip_all, fields(config = %opts.config_path.display()))]
pub async fn cmd_train(ui: &Ui, opts: &TrainOpts) -> Result<()> {
    let config = TrainConfig::load(&opts.config_path).await?;
    debug!("Training config: {:?}", config);
    let export_path = training::train(ui, &config).await?;
    info!(model = %export_path.display(), "Training finished");
    Ok(())
}
