//! Training configuration files.

use schemars::JsonSchema;

use crate::{
    async_utils::io::read_json_or_toml,
    model::{manifest::default_threshold, preprocess::Preprocessing},
    prelude::*,
};

/// How to train a page classifier. Relative paths are resolved against the
/// current working directory.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TrainConfig {
    /// Directory containing the training images and the label file. The
    /// trained model is exported here.
    #[serde(default = "default_image_root")]
    pub image_root: PathBuf,

    /// CSV file listing images and their labels, relative to `image_root`.
    #[serde(default = "default_label_file")]
    pub label_file: PathBuf,

    /// The pretrained ONNX network used as a frozen feature extractor.
    pub backbone: PathBuf,

    /// ONNX input tensor name, if the backbone has several inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_name: Option<String>,

    /// ONNX output tensor name to use as features.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_name: Option<String>,

    /// Used to name the exported model and validation results.
    #[serde(default = "default_run_label")]
    pub run_label: String,

    /// Seed for shuffling and weight initialization.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Images per optimizer step.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Passes over the training data.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Peak learning rate of the one-cycle schedule.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,

    /// Decoupled weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,

    /// Separator between labels in the label file.
    #[serde(default = "default_label_delimiter")]
    pub label_delimiter: String,

    /// Decision threshold stored in the exported model.
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    /// Image preprocessing, which must match the backbone.
    #[serde(default)]
    pub preprocessing: Preprocessing,

    /// Held-out images to classify after training. Defaults to
    /// `<image_root>/valid`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_folder: Option<PathBuf>,

    /// Where to write validation results.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
}

fn default_image_root() -> PathBuf {
    PathBuf::from("./training_images")
}

fn default_label_file() -> PathBuf {
    PathBuf::from("labels.csv")
}

fn default_run_label() -> String {
    "test".to_owned()
}

fn default_seed() -> u64 {
    42
}

fn default_batch_size() -> usize {
    16
}

fn default_epochs() -> usize {
    4
}

fn default_learning_rate() -> f32 {
    2e-3
}

fn default_weight_decay() -> f32 {
    0.01
}

fn default_label_delimiter() -> String {
    "_".to_owned()
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("./results_csv")
}

impl TrainConfig {
    /// Load and validate a TOML or JSON config file.
    pub async fn load(path: &Path) -> Result<Self> {
        let config: Self = read_json_or_toml(path).await?;
        config
            .validate()
            .with_context(|| format!("invalid training config {:?}", path.display()))?;
        Ok(config)
    }

    /// Check for settings that would make training meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(anyhow!("batch_size must be positive"));
        }
        if self.epochs == 0 {
            return Err(anyhow!("epochs must be positive"));
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return Err(anyhow!("learning_rate must be positive"));
        }
        if self.weight_decay.is_nan() || self.weight_decay < 0.0 {
            return Err(anyhow!("weight_decay must not be negative"));
        }
        if self.label_delimiter.is_empty() {
            return Err(anyhow!("label_delimiter must not be empty"));
        }
        if !(self.threshold > 0.0 && self.threshold < 1.0) {
            return Err(anyhow!(
                "threshold must be between 0 and 1, got {}",
                self.threshold
            ));
        }
        if self.run_label.is_empty() || self.run_label.contains(['/', '\\']) {
            return Err(anyhow!("invalid run_label {:?}", self.run_label));
        }
        self.preprocessing.validate()
    }

    /// The label CSV.
    pub fn label_path(&self) -> PathBuf {
        self.image_root.join(&self.label_file)
    }

    /// The folder of held-out images classified after training.
    pub fn valid_folder(&self) -> PathBuf {
        self.valid_folder
            .clone()
            .unwrap_or_else(|| self.image_root.join("valid"))
    }

    /// Where the trained model manifest is written.
    pub fn export_path(&self) -> PathBuf {
        self.image_root
            .join(format!("image_screening_tool_{}.json", self.run_label))
    }

    /// Where validation predictions are written.
    pub fn results_path(&self) -> PathBuf {
        self.results_dir
            .join(format!("image_screening_tool_{}.csv", self.run_label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn toml_defaults_are_applied() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("config-test")?;
        let path = dir.path().join("train.toml");
        tokio::fs::write(&path, "backbone = \"resnet50.onnx\"\n").await?;
        let config = TrainConfig::load(&path).await?;
        assert_eq!(config.image_root, PathBuf::from("./training_images"));
        assert_eq!(config.run_label, "test");
        assert_eq!(config.seed, 42);
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.epochs, 4);
        assert_eq!(config.learning_rate, 2e-3);
        assert_eq!(config.label_delimiter, "_");
        assert_eq!(
            config.label_path(),
            PathBuf::from("./training_images/labels.csv")
        );
        assert_eq!(
            config.valid_folder(),
            PathBuf::from("./training_images/valid")
        );
        assert_eq!(
            config.export_path(),
            PathBuf::from("./training_images/image_screening_tool_test.json")
        );
        assert_eq!(
            config.results_path(),
            PathBuf::from("./results_csv/image_screening_tool_test.csv")
        );
        Ok(())
    }

    #[tokio::test]
    async fn json_configs_are_supported() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("config-test")?;
        let path = dir.path().join("train.json");
        tokio::fs::write(
            &path,
            r#"{"backbone": "b.onnx", "run_label": "v2", "epochs": 8,
                "valid_folder": "/data/valid"}"#,
        )
        .await?;
        let config = TrainConfig::load(&path).await?;
        assert_eq!(config.epochs, 8);
        assert_eq!(config.valid_folder(), PathBuf::from("/data/valid"));
        Ok(())
    }

    #[tokio::test]
    async fn bad_values_are_rejected() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("config-test")?;
        let path = dir.path().join("train.toml");
        for body in [
            "backbone = \"b.onnx\"\nbatch_size = 0\n",
            "backbone = \"b.onnx\"\nrun_label = \"a/b\"\n",
            "backbone = \"b.onnx\"\nthreshold = 1.5\n",
            "backbone = \"b.onnx\"\nepoch = 3\n",
            "run_label = \"no backbone\"\n",
        ] {
            tokio::fs::write(&path, body).await?;
            assert!(TrainConfig::load(&path).await.is_err(), "accepted {:?}", body);
        }
        Ok(())
    }
}
