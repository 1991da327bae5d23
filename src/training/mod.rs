//! Training a page classifier from labeled images.
//!
//! We keep a pretrained ONNX backbone frozen, extract features for every
//! image once, and fit a linear head on top. The result is exported as a
//! [`ModelManifest`], reloaded, and used to classify a held-out folder.

use std::sync::Arc;

use ndarray::{Array2, Axis, concatenate};
use rand::{SeedableRng as _, rngs::StdRng, seq::SliceRandom as _};

use crate::{
    async_utils::blocking::spawn_blocking_propagating_panics,
    categories::Category,
    model::{
        ModelManifest, PageClassifier,
        backbone::{Backbone, OnnxBackbone},
        head::LinearHead,
        preprocess::Preprocessing,
    },
    prelude::*,
    rasterize::RasterizeOptions,
    screening::{ScreeningTool, write_page_predictions},
    ui::{ProgressConfig, Ui},
};

pub mod config;
pub mod fit;
pub mod labels;

use self::{
    config::TrainConfig,
    fit::{Dataset, EpochStats, FitOptions, fit_head},
    labels::{LabeledImage, multi_hot, read_labels},
};

/// A trained head and how training went.
#[derive(Clone, Debug)]
pub struct TrainedHead {
    pub head: LinearHead,
    pub history: Vec<EpochStats>,
    pub train_count: usize,
    pub valid_count: usize,
}

/// Train, export and validate a model as described by `config`.
#[instrument(level = "debug", skip_all, fields(run_label = %config.run_label))]
pub async fn train(ui: &Ui, config: &TrainConfig) -> Result<PathBuf> {
    let backbone_path = std::path::absolute(&config.backbone).with_context(|| {
        format!("failed to resolve backbone path {:?}", config.backbone.display())
    })?;
    let backbone = {
        let path = backbone_path.clone();
        let input_name = config.input_name.clone();
        let output_name = config.output_name.clone();
        spawn_blocking_propagating_panics(move || {
            OnnxBackbone::load(&path, input_name.as_deref(), output_name.as_deref())
        })
        .await?
    };

    let trained = train_head(ui, config, Arc::new(backbone)).await?;
    if let Some(last) = trained.history.last() {
        info!(
            train = trained.train_count,
            valid = trained.valid_count,
            epochs = last.epoch,
            train_loss = last.train_loss,
            "Trained classification head"
        );
    }

    let manifest = ModelManifest {
        backbone: backbone_path,
        input_name: config.input_name.clone(),
        output_name: config.output_name.clone(),
        preprocessing: config.preprocessing.clone(),
        classes: Category::ALL.to_vec(),
        threshold: config.threshold,
        head: Some(trained.head),
    };
    let export_path = config.export_path();
    manifest.save(&export_path).await?;
    ui.display_message(
        "💾",
        &format!("Exported model to {}", export_path.display()),
    );

    let classifier = PageClassifier::load(&export_path).await?;
    validate_folder(ui, classifier, &config.valid_folder(), &config.results_path()).await?;
    Ok(export_path)
}

/// Read labels, extract features with `backbone`, and fit a head.
pub async fn train_head(
    ui: &Ui,
    config: &TrainConfig,
    backbone: Arc<dyn Backbone>,
) -> Result<TrainedHead> {
    let mut images = read_labels(
        &config.label_path(),
        &config.image_root,
        &config.label_delimiter,
    )?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    images.shuffle(&mut rng);

    let (valid, train): (Vec<&LabeledImage>, Vec<&LabeledImage>) =
        images.iter().partition(|image| image.is_valid);
    if train.is_empty() {
        return Err(anyhow!(
            "{:?} has no training rows (every row has is_valid set)",
            config.label_path().display()
        ));
    }
    info!(train = train.len(), valid = valid.len(), "Loaded labels");

    let classes = Category::ALL;
    let train_y = multi_hot(&train, &classes);
    let valid_y = multi_hot(&valid, &classes);

    let paths = images.iter().map(|image| image.path.clone()).collect::<Vec<_>>();
    let pb = ui.new_for_len(
        &ProgressConfig {
            emoji: "🧮",
            msg: "Extracting features",
            done_msg: "Extracted features",
        },
        paths.len(),
    );
    let features = {
        let backbone = backbone.clone();
        let preprocessing = config.preprocessing.clone();
        let batch_size = config.batch_size;
        let pb = pb.clone();
        spawn_blocking_propagating_panics(move || {
            extract_features(backbone.as_ref(), &preprocessing, &paths, batch_size, |n| {
                pb.inc(n as u64)
            })
        })
        .await?
    };
    pb.finish_using_style();

    // `features` is in `images` order, so split it the same way.
    let (valid_idx, train_idx): (Vec<usize>, Vec<usize>) =
        (0..images.len()).partition(|&i| images[i].is_valid);
    let train_x = features.select(Axis(0), &train_idx);
    let valid_x = features.select(Axis(0), &valid_idx);

    let opts = FitOptions {
        batch_size: config.batch_size,
        epochs: config.epochs,
        learning_rate: config.learning_rate,
        weight_decay: config.weight_decay,
        seed: config.seed,
    };
    let train_count = train.len();
    let valid_count = valid.len();
    let (head, history) = spawn_blocking_propagating_panics(move || {
        let train = Dataset {
            features: train_x.view(),
            targets: train_y.view(),
        };
        let valid = Dataset {
            features: valid_x.view(),
            targets: valid_y.view(),
        };
        fit_head(train, Some(valid), &opts, log_epoch)
    })
    .await?;

    Ok(TrainedHead {
        head,
        history,
        train_count,
        valid_count,
    })
}

fn log_epoch(stats: &EpochStats) {
    match (stats.valid_loss, stats.accuracy_multi) {
        (Some(valid_loss), Some(accuracy)) => info!(
            epoch = stats.epoch,
            train_loss = stats.train_loss,
            valid_loss,
            accuracy_multi = accuracy,
            "Finished epoch"
        ),
        _ => info!(
            epoch = stats.epoch,
            train_loss = stats.train_loss,
            "Finished epoch"
        ),
    }
}

/// Run every image through the backbone, returning one feature row per
/// path.
fn extract_features(
    backbone: &dyn Backbone,
    preprocessing: &Preprocessing,
    paths: &[PathBuf],
    batch_size: usize,
    mut on_batch: impl FnMut(usize),
) -> Result<Array2<f32>> {
    let mut chunks = vec![];
    for chunk in paths.chunks(batch_size.max(1)) {
        let batch = preprocessing.load_batch(chunk)?;
        chunks.push(backbone.forward(batch.view())?);
        on_batch(chunk.len());
    }
    if chunks.is_empty() {
        return Err(anyhow!("no images to extract features from"));
    }
    let views = chunks.iter().map(|c| c.view()).collect::<Vec<_>>();
    concatenate(Axis(0), &views).context("backbone feature widths differ between batches")
}

/// Classify every image in `valid_folder` and write the predictions to
/// `results_path`.
pub async fn validate_folder(
    ui: &Ui,
    classifier: PageClassifier,
    valid_folder: &Path,
    results_path: &Path,
) -> Result<()> {
    let tool = ScreeningTool::new(classifier, RasterizeOptions::default(), None)?;
    let results = tool.classify_image_folder(valid_folder).await?;
    let rows = results.iter().map(|(path, prediction)| {
        let name = path.strip_prefix(valid_folder).unwrap_or(path.as_path());
        (name.display().to_string(), prediction)
    });
    write_page_predictions(Some(results_path), tool.classes(), rows).await?;
    ui.display_message(
        "📊",
        &format!(
            "Wrote {} validation predictions to {}",
            results.len(),
            results_path.display()
        ),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use image::{DynamicImage, Rgb, RgbImage};

    use super::*;
    use crate::model::backbone::tests::ChannelMeanBackbone;

    const RED: [u8; 3] = [255, 0, 0];
    const WHITE: [u8; 3] = [255, 255, 255];

    fn save_solid(path: &Path, color: [u8; 3]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb(color))).save(path)?;
        Ok(())
    }

    /// Red images are blots, white images are text.
    fn write_training_set(root: &Path) -> Result<()> {
        let mut csv = String::from("fname,labels,is_valid\n");
        for i in 0..12 {
            let (color, label) = if i % 2 == 0 { (RED, "Blot") } else { (WHITE, "Text") };
            let name = format!("train/{i}.png");
            save_solid(&root.join(&name), color)?;
            csv.push_str(&format!("{name},{label},{}\n", i >= 10));
        }
        save_solid(&root.join("valid/red.png"), RED)?;
        save_solid(&root.join("valid/white.png"), WHITE)?;
        fs::write(root.join("labels.csv"), csv)?;
        Ok(())
    }

    fn test_config(root: &Path) -> TrainConfig {
        TrainConfig {
            image_root: root.to_owned(),
            label_file: PathBuf::from("labels.csv"),
            backbone: PathBuf::from("unused.onnx"),
            input_name: None,
            output_name: None,
            run_label: "unit".to_owned(),
            seed: 42,
            batch_size: 4,
            epochs: 60,
            learning_rate: 0.3,
            weight_decay: 0.0,
            label_delimiter: "_".to_owned(),
            threshold: 0.5,
            preprocessing: Preprocessing {
                size: 8,
                mean: [0.0; 3],
                std: [1.0; 3],
                ..Preprocessing::default()
            },
            valid_folder: None,
            results_dir: root.join("results"),
        }
    }

    #[tokio::test]
    async fn trains_and_validates_a_toy_model() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("training-test")?;
        write_training_set(dir.path())?;
        let config = test_config(dir.path());
        let ui = Ui::init_for_tests();

        let trained = train_head(&ui, &config, Arc::new(ChannelMeanBackbone)).await?;
        assert_eq!(trained.train_count, 10);
        assert_eq!(trained.valid_count, 2);
        assert_eq!(trained.head.n_classes(), Category::ALL.len());
        assert_eq!(trained.head.n_features(), 3);
        let last = trained.history.last().expect("history should not be empty");
        assert_eq!(last.accuracy_multi, Some(1.0));

        let classifier = PageClassifier::new(
            Arc::new(ChannelMeanBackbone),
            Some(trained.head),
            Category::ALL.to_vec(),
            config.threshold,
            config.preprocessing.clone(),
        );
        validate_folder(&ui, classifier, &config.valid_folder(), &config.results_path())
            .await?;

        let results = fs::read_to_string(config.results_path())?;
        let lines = results.lines().collect::<Vec<_>>();
        assert_eq!(
            lines[0],
            "index,image,labels,Blot,EM,Medical,MicroPhoto,Other,Photo,Text"
        );
        assert!(lines[1].starts_with("0,red.png,Blot,"), "{}", lines[1]);
        assert!(lines[2].starts_with("1,white.png,Text,"), "{}", lines[2]);
        Ok(())
    }

    #[tokio::test]
    async fn all_rows_valid_is_an_error() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("training-test")?;
        save_solid(&dir.path().join("a.png"), RED)?;
        fs::write(
            dir.path().join("labels.csv"),
            "fname,labels,is_valid\na.png,Blot,True\n",
        )?;
        let ui = Ui::init_for_tests();
        let err = train_head(&ui, &test_config(dir.path()), Arc::new(ChannelMeanBackbone))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no training rows"));
        Ok(())
    }

    #[test]
    fn features_are_stacked_in_path_order() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("training-test")?;
        let mut paths = vec![];
        for (i, color) in [RED, WHITE, RED].into_iter().enumerate() {
            let path = dir.path().join(format!("{i}.png"));
            save_solid(&path, color)?;
            paths.push(path);
        }
        let preprocessing = test_config(dir.path()).preprocessing;
        let mut seen = 0;
        let features =
            extract_features(&ChannelMeanBackbone, &preprocessing, &paths, 2, |n| seen += n)?;
        assert_eq!(seen, 3);
        assert_eq!(features.shape(), &[3, 3]);
        assert!(features[[0, 1]] < 0.1);
        assert!(features[[1, 1]] > 0.9);
        assert!(features[[2, 1]] < 0.1);
        Ok(())
    }
}
