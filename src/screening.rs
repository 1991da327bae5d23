//! Screening PDFs: rasterize each paper, classify its pages, and tally the
//! results into one CSV row per paper.

use std::sync::Arc;

use futures::{FutureExt as _, StreamExt as _, stream};

use crate::{
    async_utils::{
        blocking::spawn_blocking_propagating_panics,
        io::{CsvOutput, find_files_with_extensions},
    },
    categories::{Category, CategoryCounts},
    cmd::StreamOpts,
    model::{PageClassifier, PagePrediction},
    paper_id::PaperId,
    prelude::*,
    rasterize::{PageImages, RasterizeOptions},
    ui::{ProgressConfig, Ui},
};

/// File extensions we treat as images when classifying a folder.
pub const IMAGE_EXTENSIONS: &[&str] =
    &["jpg", "jpeg", "png", "bmp", "gif", "tif", "tiff", "webp"];

/// Separator between labels in per-image CSV output. This matches the label
/// delimiter of our training CSVs.
pub const LABEL_SEPARATOR: &str = "_";

/// One output row: a paper and how many of its pages fell into each category.
#[derive(Clone, Debug, PartialEq)]
pub struct ScreeningRow {
    pub paper_id: PaperId,
    pub counts: CategoryCounts,
}

impl ScreeningRow {
    /// The CSV header: one column per category, then `paper_id`.
    pub fn csv_headers() -> Vec<String> {
        Category::ALL
            .iter()
            .map(|c| c.to_string())
            .chain(["paper_id".to_owned()])
            .collect()
    }

    /// This row as CSV fields, matching [`ScreeningRow::csv_headers`].
    pub fn to_record(&self) -> Vec<String> {
        Category::ALL
            .iter()
            .map(|&category| self.counts.get(category).to_string())
            .chain([self.paper_id.to_string()])
            .collect()
    }
}

/// Everything we learned about one paper.
#[derive(Clone, Debug)]
pub struct ScreenedPaper {
    /// The per-paper tally.
    pub row: ScreeningRow,
    /// One prediction per rasterized page, in page order.
    pub pages: Vec<PagePrediction>,
    /// Non-fatal problems, such as rasterizer warnings or truncation.
    pub warnings: Vec<String>,
}

/// Screens PDFs and images with a single loaded model.
#[derive(Clone)]
pub struct ScreeningTool {
    classifier: Arc<PageClassifier>,
    rasterize: RasterizeOptions,
    scratch_dir: Option<PathBuf>,
}

impl ScreeningTool {
    /// Create a new screening tool. Page images are written to private
    /// subdirectories of `scratch_dir`, which is created if needed.
    pub fn new(
        classifier: PageClassifier,
        rasterize: RasterizeOptions,
        scratch_dir: Option<PathBuf>,
    ) -> Result<Self> {
        prepare_scratch_dir(scratch_dir.as_deref())?;
        Ok(Self {
            classifier: Arc::new(classifier),
            rasterize,
            scratch_dir,
        })
    }

    /// The categories our model predicts.
    pub fn classes(&self) -> &[Category] {
        self.classifier.classes()
    }

    /// Screen a single PDF. Page images are deleted before this returns,
    /// whether or not screening succeeded.
    #[instrument(level = "debug", skip_all, fields(path = %pdf.display()))]
    pub async fn screen_file(&self, pdf: &Path) -> Result<ScreenedPaper> {
        let paper_id = PaperId::from_pdf_path(pdf)?;
        let images =
            PageImages::from_pdf(pdf, &self.rasterize, self.scratch_dir.as_deref()).await?;

        let pages = self.predict_paths(images.paths().to_vec()).await?;

        let mut warnings = images.warnings().to_vec();
        if images.is_incomplete() {
            warnings.push(format!(
                "only {}/{} pages screened (because of --max-pages)",
                pages.len(),
                images.total_pages()
            ));
        }
        images.close()?;

        let counts = CategoryCounts::tally(pages.iter().map(|p| p.labels.as_slice()));
        debug!(%paper_id, pages = pages.len(), "Screened paper");
        Ok(ScreenedPaper {
            row: ScreeningRow { paper_id, counts },
            pages,
            warnings,
        })
    }

    /// Classify a list of image files.
    pub async fn classify_images(
        &self,
        paths: Vec<PathBuf>,
    ) -> Result<Vec<(PathBuf, PagePrediction)>> {
        let predictions = self.predict_paths(paths.clone()).await?;
        Ok(paths.into_iter().zip(predictions).collect())
    }

    /// Classify every image found under `dir`, in path order.
    pub async fn classify_image_folder(
        &self,
        dir: &Path,
    ) -> Result<Vec<(PathBuf, PagePrediction)>> {
        let paths = find_files_with_extensions(dir, IMAGE_EXTENSIONS)?;
        if paths.is_empty() {
            warn!(dir = %dir.display(), "No images found");
        }
        self.classify_images(paths).await
    }

    /// Run the classifier on the blocking pool.
    async fn predict_paths(&self, paths: Vec<PathBuf>) -> Result<Vec<PagePrediction>> {
        let classifier = self.classifier.clone();
        spawn_blocking_propagating_panics(move || classifier.predict_paths(&paths)).await
    }

    /// Screen every PDF under `folder`, writing one CSV row per paper.
    ///
    /// Papers that fail are logged and skipped. Once the CSV is complete,
    /// we return an error if too many papers failed.
    #[instrument(level = "debug", skip_all, fields(folder = %folder.display()))]
    pub async fn screen_folder(
        &self,
        ui: &Ui,
        folder: &Path,
        output_path: Option<&Path>,
        stream_opts: &StreamOpts,
    ) -> Result<ScreeningCounters> {
        let mut pdfs = find_files_with_extensions(folder, &["pdf"])?;
        if let Some(take_first) = stream_opts.take_first {
            pdfs.truncate(take_first);
        }
        info!(count = pdfs.len(), "Found PDFs to screen");

        let mut output = CsvOutput::create(output_path, ScreeningRow::csv_headers()).await?;

        let pb = ui.new_for_len(
            &ProgressConfig {
                emoji: "📄",
                msg: "Screening PDFs",
                done_msg: "Screened PDFs",
            },
            pdfs.len(),
        );

        let tool = self.clone();
        let results = stream::iter(pdfs).map(move |path| {
            let tool = tool.clone();
            async move {
                let result = tool.screen_file(&path).await;
                (path, result)
            }
            .boxed()
        });
        let mut results = pb
            .clone()
            .wrap_stream(results.buffered(stream_opts.job_count.max(1)));

        let mut counters = ScreeningCounters::default();
        while let Some((path, result)) = results.next().await {
            match result {
                Ok(paper) => {
                    for warning in &paper.warnings {
                        warn!(paper_id = %paper.row.paper_id, "{}", warning);
                    }
                    if !paper.warnings.is_empty() {
                        counters.papers_with_warnings += 1;
                    }
                    output.write_record(paper.row.to_record()).await?;
                    counters.screened += 1;
                }
                Err(err) => {
                    let paper_id = PaperId::from_pdf_path(&path)
                        .map(|id| id.to_string())
                        .unwrap_or_else(|_| path.display().to_string());
                    error!(paper_id = %paper_id, "could not screen pdf: {:#}", err);
                    counters.failed += 1;
                }
            }
        }
        pb.finish_using_style();
        output.finish().await?;

        counters.finish(ui, stream_opts.allowed_failure_rate)?;
        Ok(counters)
    }
}

/// Make sure a user-supplied scratch directory is usable, creating it if
/// needed.
pub fn prepare_scratch_dir(dir: Option<&Path>) -> Result<()> {
    if let Some(dir) = dir {
        if dir.as_os_str().is_empty() {
            return Err(anyhow!("tmp folder argument missing"));
        }
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create tmp folder {:?}", dir.display()))?;
    }
    Ok(())
}

/// Running totals for a batch screening run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScreeningCounters {
    /// Papers with a row in the output.
    pub screened: usize,
    /// Papers that could not be screened.
    pub failed: usize,
    /// Screened papers that reported non-fatal warnings.
    pub papers_with_warnings: usize,
}

impl ScreeningCounters {
    /// Report totals to the user, and fail if too many papers failed.
    pub fn finish(&self, ui: &Ui, allowed_failure_rate: f32) -> Result<()> {
        let total = self.screened + self.failed;
        ui.display_message("✅", &format!("{} of {} papers screened", self.screened, total));
        if self.papers_with_warnings > 0 {
            ui.display_message(
                "⚠️",
                &format!("{} papers screened with warnings", self.papers_with_warnings),
            );
        }
        if self.failed > 0 {
            ui.display_message("❌", &format!("{} papers could not be screened", self.failed));
        }
        if total == 0 {
            return Ok(());
        }
        let failure_rate = self.failed as f32 / total as f32;
        if failure_rate > allowed_failure_rate {
            Err(anyhow!(
                "{}/{} ({:.2}%) of papers failed, but only {:.2}% were allowed",
                self.failed,
                total,
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ))
        } else {
            Ok(())
        }
    }
}

/// Write per-image predictions as CSV: `index,image,labels`, then one
/// probability column per class.
pub async fn write_page_predictions<'a, I>(
    output_path: Option<&Path>,
    classes: &[Category],
    rows: I,
) -> Result<()>
where
    I: IntoIterator<Item = (String, &'a PagePrediction)>,
{
    let headers = ["index", "image", "labels"]
        .into_iter()
        .map(str::to_owned)
        .chain(classes.iter().map(|c| c.to_string()))
        .collect::<Vec<_>>();
    let mut output = CsvOutput::create(output_path, headers).await?;
    for (index, (image, prediction)) in rows.into_iter().enumerate() {
        output.write_record(page_record(index, image, classes, prediction)).await?;
    }
    output.finish().await
}

/// A single row for [`write_page_predictions`].
fn page_record(
    index: usize,
    image: String,
    classes: &[Category],
    prediction: &PagePrediction,
) -> Vec<String> {
    let labels = prediction
        .labels
        .iter()
        .map(|c| c.name())
        .collect::<Vec<_>>()
        .join(LABEL_SEPARATOR);
    [index.to_string(), image, labels]
        .into_iter()
        .chain(classes.iter().map(|&c| {
            prediction
                .probability(c)
                .map(|p| format!("{:.6}", p))
                .unwrap_or_default()
        }))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use image::{DynamicImage, Rgb, RgbImage};
    use ndarray::array;

    use super::*;
    use crate::model::{
        backbone::tests::ChannelMeanBackbone, head::LinearHead,
        preprocess::Preprocessing,
    };

    fn toy_tool(scratch: Option<PathBuf>) -> Result<ScreeningTool> {
        toy_tool_with(scratch, RasterizeOptions::default())
    }

    fn toy_tool_with(
        scratch: Option<PathBuf>,
        rasterize: RasterizeOptions,
    ) -> Result<ScreeningTool> {
        let head = LinearHead {
            weights: array![[10.0, -10.0, -10.0], [10.0, 10.0, 10.0]],
            bias: array![-5.0, -25.0],
        };
        let classifier = PageClassifier::new(
            Arc::new(ChannelMeanBackbone),
            Some(head),
            vec![Category::Blot, Category::Text],
            0.5,
            Preprocessing {
                size: 8,
                mean: [0.0; 3],
                std: [1.0; 3],
                ..Preprocessing::default()
            },
        );
        ScreeningTool::new(classifier, rasterize, scratch)
    }

    /// Install stand-ins for `pdfinfo` and `pdftocairo` in `dir/bin`. Every
    /// PDF has two white pages. PDFs with `corrupt` in their name render
    /// unreadable images, and those with `slow` in their name take a while.
    #[cfg(unix)]
    fn fake_poppler(dir: &Path) -> Result<RasterizeOptions> {
        use std::os::unix::fs::PermissionsExt as _;

        let bin = dir.join("bin");
        fs::create_dir(&bin)?;
        let page = bin.join("page.jpg");
        DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([255, 255, 255])))
            .save(&page)?;
        let corrupt = bin.join("corrupt.jpg");
        fs::write(&corrupt, "not a jpeg")?;

        let pdftocairo = format!(
            r#"#!/bin/sh
for arg in "$@"; do out="$arg"; done
name=$(basename "$out")
case "$name" in *slow*) sleep 0.3 ;; esac
case "$name" in
  *corrupt*) src="{}" ;;
  *) src="{}" ;;
esac
cp "$src" "$out-1.jpg" && cp "$src" "$out-2.jpg"
"#,
            corrupt.display(),
            page.display()
        );
        let scripts = [
            ("pdfinfo", "#!/bin/sh\necho 'Pages:          2'\n".to_owned()),
            ("pdftocairo", pdftocairo),
        ];
        for (name, script) in scripts {
            let path = bin.join(name);
            fs::write(&path, script)?;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }
        Ok(RasterizeOptions {
            poppler_dir: Some(bin),
            ..RasterizeOptions::default()
        })
    }

    fn stream_opts() -> StreamOpts {
        StreamOpts {
            take_first: None,
            job_count: 2,
            allowed_failure_rate: 1.0,
        }
    }

    #[test]
    fn header_and_record_line_up() {
        let row = ScreeningRow {
            paper_id: PaperId::from_pdf_path(Path::new("10.1+x.pdf")).unwrap(),
            counts: CategoryCounts::tally([
                [Category::Text].as_slice(),
                [Category::Text, Category::Blot].as_slice(),
            ]),
        };
        assert_eq!(
            ScreeningRow::csv_headers().join(","),
            "Blot,EM,Medical,MicroPhoto,Other,Photo,Text,paper_id"
        );
        assert_eq!(row.to_record().join(","), "1,0,0,0,0,0,2,10.1/x");
    }

    #[test]
    fn empty_scratch_dir_is_rejected() {
        let err = toy_tool(Some(PathBuf::new())).err().expect("should fail");
        assert!(err.to_string().contains("tmp folder argument missing"));
    }

    #[test]
    fn missing_scratch_dir_is_created() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("screening-test")?;
        let scratch = dir.path().join("tmp");
        toy_tool(Some(scratch.clone()))?;
        assert!(scratch.is_dir());
        Ok(())
    }

    #[tokio::test]
    async fn classifies_image_folder_in_path_order() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("screening-test")?;
        let red = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([255, 0, 0])));
        let white =
            DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([255, 255, 255])));
        white.save(dir.path().join("a.png"))?;
        red.save(dir.path().join("b.png"))?;
        fs::write(dir.path().join("notes.txt"), "not an image")?;

        let tool = toy_tool(None)?;
        let results = tool.classify_image_folder(dir.path()).await?;
        assert_eq!(results.len(), 2);
        assert!(results[0].0.ends_with("a.png"));
        assert_eq!(results[0].1.labels, vec![Category::Text]);
        assert_eq!(results[1].1.labels, vec![Category::Blot]);
        Ok(())
    }

    #[tokio::test]
    async fn page_predictions_are_written_as_csv() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("screening-test")?;
        let out = dir.path().join("pages.csv");
        let prediction = PagePrediction {
            labels: vec![Category::Blot, Category::Text],
            probabilities: vec![(Category::Blot, 0.75), (Category::Text, 0.5)],
        };
        write_page_predictions(
            Some(&out),
            &[Category::Blot, Category::Text],
            [("page-1.jpg".to_owned(), &prediction)],
        )
        .await?;
        assert_eq!(
            fs::read_to_string(&out)?,
            "index,image,labels,Blot,Text\n0,page-1.jpg,Blot_Text,0.750000,0.500000\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn failed_papers_are_skipped_and_counted() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("screening-test")?;
        let pdfs = dir.path().join("pdfs");
        fs::create_dir(&pdfs)?;
        // Not actually a PDF, so rasterizing fails before any tool runs.
        fs::write(pdfs.join("10.1+broken.pdf"), "plain text")?;
        let out = dir.path().join("out.csv");

        let tool = toy_tool(Some(dir.path().join("tmp")))?;
        let ui = Ui::init_for_tests();
        let counters = tool
            .screen_folder(&ui, &pdfs, Some(&out), &stream_opts())
            .await?;
        assert_eq!(counters.screened, 0);
        assert_eq!(counters.failed, 1);
        assert_eq!(
            fs::read_to_string(&out)?,
            "Blot,EM,Medical,MicroPhoto,Other,Photo,Text,paper_id\n"
        );
        // No page images are left behind.
        assert_eq!(fs::read_dir(dir.path().join("tmp"))?.count(), 0);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rows_follow_discovery_order_and_pages_are_cleaned_up() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("screening-test")?;
        let rasterize = fake_poppler(dir.path())?;
        let pdfs = dir.path().join("pdfs");
        fs::create_dir(&pdfs)?;
        for name in ["10.1+a-slow", "10.1+b", "10.1+c-corrupt", "10.1+d"] {
            fs::write(pdfs.join(format!("{name}.pdf")), "%PDF-1.4\n%%EOF\n")?;
        }
        let out = dir.path().join("out.csv");
        let scratch = dir.path().join("tmp");

        let tool = toy_tool_with(Some(scratch.clone()), rasterize)?;
        let ui = Ui::init_for_tests();
        let opts = StreamOpts {
            job_count: 3,
            ..stream_opts()
        };
        let counters = tool.screen_folder(&ui, &pdfs, Some(&out), &opts).await?;
        assert_eq!(counters.screened, 3);
        assert_eq!(counters.failed, 1);
        assert_eq!(
            fs::read_to_string(&out)?,
            "Blot,EM,Medical,MicroPhoto,Other,Photo,Text,paper_id\n\
             0,0,0,0,0,0,2,10.1/a-slow\n\
             0,0,0,0,0,0,2,10.1/b\n\
             0,0,0,0,0,0,2,10.1/d\n"
        );
        assert_eq!(fs::read_dir(&scratch)?.count(), 0);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn page_images_are_removed_when_classification_fails() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("screening-test")?;
        let rasterize = fake_poppler(dir.path())?;
        let pdf = dir.path().join("corrupt.pdf");
        fs::write(&pdf, "%PDF-1.4\n%%EOF\n")?;
        let scratch = dir.path().join("tmp");

        let tool = toy_tool_with(Some(scratch.clone()), rasterize)?;
        assert!(tool.screen_file(&pdf).await.is_err());
        assert_eq!(fs::read_dir(&scratch)?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn too_many_failures_is_an_error() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("screening-test")?;
        fs::write(dir.path().join("broken.pdf"), "plain text")?;
        let out = dir.path().join("out.csv");
        let tool = toy_tool(None)?;
        let ui = Ui::init_for_tests();
        let opts = StreamOpts {
            allowed_failure_rate: 0.0,
            ..stream_opts()
        };
        let result = tool.screen_folder(&ui, dir.path(), Some(&out), &opts).await;
        assert!(result.is_err());
        // The CSV is still complete.
        assert!(out.exists());
        Ok(())
    }

    #[test]
    fn counters_allow_configured_failure_rate() {
        let ui = Ui::init_for_tests();
        let counters = ScreeningCounters {
            screened: 99,
            failed: 1,
            papers_with_warnings: 0,
        };
        assert!(counters.finish(&ui, 0.01).is_ok());
        assert!(counters.finish(&ui, 0.005).is_err());
        assert!(ScreeningCounters::default().finish(&ui, 0.0).is_ok());
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn screens_a_real_pdf() -> Result<()> {
        let tool = toy_tool(None)?;
        let paper = tool
            .screen_file(Path::new("tests/fixtures/two_pages.pdf"))
            .await?;
        assert_eq!(paper.pages.len(), 2);
        assert_eq!(paper.row.paper_id.to_string(), "two_pages");
        // Mostly-white pages of text.
        assert_eq!(paper.row.counts.get(Category::Text), 2);
        Ok(())
    }
}
