//! Reading labeled training images from CSV.

use ndarray::Array2;

use crate::{categories::Category, prelude::*};

/// The column marking rows that belong to the validation split.
const IS_VALID_COLUMN: &str = "is_valid";

/// A training image and its labels.
#[derive(Clone, Debug, PartialEq)]
pub struct LabeledImage {
    /// Path to the image, already joined to the image root.
    pub path: PathBuf,
    /// Every category present in the image. May be empty.
    pub labels: Vec<Category>,
    /// Does this image belong to the validation split?
    pub is_valid: bool,
}

/// Read a label file.
///
/// The first column is an image path relative to `image_root`, the second
/// holds the labels joined by `delimiter`, and an `is_valid` column selects
/// the validation split.
pub fn read_labels(
    label_path: &Path,
    image_root: &Path,
    delimiter: &str,
) -> Result<Vec<LabeledImage>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(label_path)
        .with_context(|| format!("failed to open label file {:?}", label_path.display()))?;

    let headers = rdr
        .headers()
        .with_context(|| format!("failed to read header of {:?}", label_path.display()))?;
    if headers.len() < 2 {
        return Err(anyhow!(
            "label file {:?} needs an image column and a label column",
            label_path.display()
        ));
    }
    let is_valid_idx = headers
        .iter()
        .position(|h| h == IS_VALID_COLUMN)
        .ok_or_else(|| {
            anyhow!(
                "label file {:?} has no {:?} column",
                label_path.display(),
                IS_VALID_COLUMN
            )
        })?;

    let mut images = vec![];
    for (idx, record) in rdr.records().enumerate() {
        // Row 1 is the header.
        let row = idx + 2;
        let record = record.with_context(|| {
            format!("failed to read row {} of {:?}", row, label_path.display())
        })?;
        let image = parse_record(&record, is_valid_idx, image_root, delimiter)
            .with_context(|| format!("bad row {} of {:?}", row, label_path.display()))?;
        images.push(image);
    }
    debug!(count = images.len(), "Read labeled images");
    Ok(images)
}

fn parse_record(
    record: &csv::StringRecord,
    is_valid_idx: usize,
    image_root: &Path,
    delimiter: &str,
) -> Result<LabeledImage> {
    let path = record.get(0).unwrap_or_default();
    if path.is_empty() {
        return Err(anyhow!("missing image path"));
    }
    let labels = parse_labels(record.get(1).unwrap_or_default(), delimiter)?;
    let is_valid = parse_bool(record.get(is_valid_idx).unwrap_or_default())?;
    Ok(LabeledImage {
        path: image_root.join(path),
        labels,
        is_valid,
    })
}

/// Split a label string like `Blot_Text` into categories.
pub fn parse_labels(labels: &str, delimiter: &str) -> Result<Vec<Category>> {
    let mut parsed = labels
        .split(delimiter)
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .map(|label| label.parse::<Category>())
        .collect::<Result<Vec<_>>>()?;
    parsed.sort();
    parsed.dedup();
    Ok(parsed)
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(anyhow!("expected {} to be True or False, got {:?}", IS_VALID_COLUMN, value)),
    }
}

/// Build a multi-hot target matrix with one row per image and one column per
/// class.
pub fn multi_hot(images: &[&LabeledImage], classes: &[Category]) -> Array2<f32> {
    let mut targets = Array2::zeros((images.len(), classes.len()));
    for (i, image) in images.iter().enumerate() {
        for (j, class) in classes.iter().enumerate() {
            if image.labels.contains(class) {
                targets[[i, j]] = 1.0;
            }
        }
    }
    targets
}
