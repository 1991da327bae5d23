//! Turning page images into model input tensors.

use image::{DynamicImage, imageops::FilterType};
use ndarray::{Array4, ArrayViewMut3, Axis};
use schemars::JsonSchema;

use crate::prelude::*;

/// ImageNet channel means, which most pretrained backbones expect.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet channel standard deviations.
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// How to fit an image into the square model input.
#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeMethod {
    /// Scale so the image covers the square, then crop the center.
    #[default]
    Crop,
    /// Stretch the image to the square, ignoring aspect ratio.
    Squish,
}

/// Image preprocessing parameters. These must match whatever the backbone
/// was trained with.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Preprocessing {
    /// Side length of the square model input, in pixels.
    #[serde(default = "default_size")]
    pub size: u32,

    /// How to fit images into the square.
    #[serde(default)]
    pub resize: ResizeMethod,

    /// Per-channel RGB mean, applied after scaling pixels to `[0, 1]`.
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],

    /// Per-channel RGB standard deviation.
    #[serde(default = "default_std")]
    pub std: [f32; 3],
}

fn default_size() -> u32 {
    560
}

fn default_mean() -> [f32; 3] {
    IMAGENET_MEAN
}

fn default_std() -> [f32; 3] {
    IMAGENET_STD
}

impl Default for Preprocessing {
    fn default() -> Self {
        Self {
            size: default_size(),
            resize: ResizeMethod::default(),
            mean: default_mean(),
            std: default_std(),
        }
    }
}

impl Preprocessing {
    /// Check that these parameters make sense.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(anyhow!("preprocessing size must be positive"));
        }
        if self.std.iter().any(|&s| s.is_nan() || s <= 0.0) {
            return Err(anyhow!(
                "preprocessing std must be positive, got {:?}",
                self.std
            ));
        }
        Ok(())
    }

    /// Load and preprocess a batch of images from disk.
    pub fn load_batch(&self, paths: &[PathBuf]) -> Result<Array4<f32>> {
        let images = paths
            .iter()
            .map(|path| load_image(path))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.batch(&images))
    }

    /// Convert a batch of images to an NCHW tensor.
    pub fn batch(&self, images: &[DynamicImage]) -> Array4<f32> {
        let size = self.size as usize;
        let mut batch = Array4::<f32>::zeros((images.len(), 3, size, size));
        for (image, out) in images.iter().zip(batch.axis_iter_mut(Axis(0))) {
            self.write_image(image, out);
        }
        batch
    }

    /// Resize, normalize and write a single image into a CHW slot.
    fn write_image(&self, image: &DynamicImage, mut out: ArrayViewMut3<'_, f32>) {
        let resized = match self.resize {
            ResizeMethod::Crop => {
                image.resize_to_fill(self.size, self.size, FilterType::Triangle)
            }
            ResizeMethod::Squish => {
                image.resize_exact(self.size, self.size, FilterType::Triangle)
            }
        };
        let rgb = resized.to_rgb8();
        for (x, y, pixel) in rgb.enumerate_pixels() {
            for c in 0..3 {
                let value = f32::from(pixel[c]) / 255.0;
                out[[c, y as usize, x as usize]] = (value - self.mean[c]) / self.std[c];
            }
        }
    }
}

/// Decode an image file.
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).with_context(|| format!("failed to read image {:?}", path.display()))
}
