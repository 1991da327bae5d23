//! Rasterize PDF pages to images using Poppler's command-line tools.

use std::{collections::BTreeMap, num::NonZeroUsize, process::Output, sync::LazyLock};

use clap::Args;
use regex::Regex;
use tokio::process::Command;

use crate::{
    async_utils::{check_for_command_failure, io::has_extension},
    cpu_limit::with_cpu_semaphore,
    prelude::*,
};

/// The MIME type we accept as input.
const PDF_MIME_TYPE: &str = "application/pdf";

/// A default error regex for checking command output.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// The page number suffix `pdftocairo` appends to its output files.
static PAGE_NUMBER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-(\d+)$").expect("failed to compile regex"));

/// Does this line contain an error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Options controlling how PDF pages are rasterized.
#[derive(Args, Clone, Debug)]
pub struct RasterizeOptions {
    /// Scale every page to this many pixels wide and high. Pages are
    /// stretched to a square, which is what our models are trained on.
    #[clap(long, default_value = "560")]
    pub scale_to: u32,

    /// The maximum number of pages to process per PDF. Longer PDFs are
    /// truncated and reported with a warning.
    #[clap(long)]
    pub max_pages: Option<NonZeroUsize>,

    /// The directory containing `pdfinfo` and `pdftocairo`. By default, we
    /// look for them on the `PATH`.
    #[clap(long)]
    pub poppler_dir: Option<PathBuf>,
}

impl Default for RasterizeOptions {
    fn default() -> Self {
        Self {
            scale_to: 560,
            max_pages: None,
            poppler_dir: None,
        }
    }
}

impl RasterizeOptions {
    /// Build a [`Command`] for one of the Poppler tools.
    fn poppler_command(&self, tool: &str) -> Command {
        match &self.poppler_dir {
            Some(dir) => Command::new(dir.join(tool)),
            None => Command::new(tool),
        }
    }
}

/// The rasterized pages of a single PDF, stored as JPEG files in a private
/// temporary directory.
///
/// The directory and every image in it are deleted when this is dropped.
pub struct PageImages {
    /// The directory holding our page images.
    ///
    /// This is released by [`Drop`] or [`PageImages::close`].
    tmpdir: Option<tempfile::TempDir>,
    /// Page image paths, in page order.
    pages: Vec<PathBuf>,
    /// Number of pages in the document.
    total_pages: usize,
    /// The maximum number of pages we were allowed to rasterize.
    max_pages: Option<NonZeroUsize>,
    /// Any warnings printed while rasterizing.
    warnings: Vec<String>,
}

impl PageImages {
    /// Rasterize a PDF into a fresh temporary directory created inside
    /// `scratch_parent`, or inside the system temporary directory.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn from_pdf(
        path: &Path,
        options: &RasterizeOptions,
        scratch_parent: Option<&Path>,
    ) -> Result<Self> {
        let mime_type = get_mime_type(path)?;
        if mime_type != PDF_MIME_TYPE {
            return Err(anyhow!(
                "expected a PDF, but {:?} has MIME type {}",
                path.display(),
                mime_type
            ));
        }

        let total_pages = get_pdf_page_count(path, options).await?;

        // Construct an output prefix. pdftocairo will append `-N.jpg` to it
        // for every page.
        let stem = path
            .file_stem()
            .context("failed to get filename from PDF path")?;

        let tmpdir = match scratch_parent {
            Some(parent) => tempfile::TempDir::with_prefix_in("pages", parent),
            None => tempfile::TempDir::with_prefix("pages"),
        }
        .context("failed to create temporary directory for page images")?;
        let out_prefix = tmpdir.path().join(stem);

        // We use `with_cpu_semaphore` because `pdftocairo` will use _at least_
        // 100% of a CPU.
        let mut cmd = options.poppler_command("pdftocairo");
        let scale = options.scale_to.to_string();
        cmd.arg("-jpeg")
            .arg("-scale-to-x")
            .arg(&scale)
            .arg("-scale-to-y")
            .arg(&scale);
        add_last_page_arg_if_needed(options, total_pages, &mut cmd);
        let output = with_cpu_semaphore(|| async {
            cmd.arg(path).arg(&out_prefix).output().await.with_context(|| {
                format!("failed to run pdftocairo on {:?}", path.display())
            })
        })
        .await?;
        check_for_command_failure("pdftocairo", &output, Some(&is_error_line))?;

        Self::from_tempdir(options, tmpdir, total_pages, &output)
    }

    /// Collect the page images `pdftocairo` left in `tmpdir`.
    fn from_tempdir(
        options: &RasterizeOptions,
        tmpdir: tempfile::TempDir,
        total_pages: usize,
        output: &Output,
    ) -> Result<Self> {
        let tmpdir_path = tmpdir.path();
        let mut pages = tmpdir_path
            .read_dir()
            .with_context(|| {
                format!(
                    "failed to read temporary directory {:?}",
                    tmpdir_path.display()
                )
            })?
            .map(|entry| {
                let entry = entry.with_context(|| {
                    format!(
                        "failed to read entry in temporary directory {:?}",
                        tmpdir_path.display()
                    )
                })?;
                Ok(entry.path())
            })
            .filter(|path: &Result<PathBuf>| {
                path.as_ref()
                    .map(|p| has_extension(p, &["jpg", "jpeg"]))
                    .unwrap_or(true)
            })
            .collect::<Result<Vec<_>>>()?;
        pages.sort_by_key(|path| (page_number(path), path.clone()));

        if pages.is_empty() && total_pages > 0 {
            return Err(anyhow!(
                "pdftocairo produced no images for a {}-page PDF",
                total_pages
            ));
        }

        let mut warnings = vec![];
        for stream in [&output.stdout, &output.stderr] {
            for line in String::from_utf8_lossy(stream).lines() {
                let line = line.trim();
                if !line.is_empty() {
                    warnings.push(line.to_string());
                }
            }
        }

        Ok(Self {
            tmpdir: Some(tmpdir),
            pages,
            total_pages,
            max_pages: options.max_pages,
            warnings,
        })
    }

    /// The page image paths, in page order.
    pub fn paths(&self) -> &[PathBuf] {
        &self.pages
    }

    /// The number of pages in the original PDF.
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Get any warnings printed while rasterizing.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Did `max_pages` stop us from rasterizing every page?
    pub fn is_incomplete(&self) -> bool {
        if let Some(max_pages) = self.max_pages {
            self.total_pages > max_pages.get()
        } else {
            false
        }
    }

    /// Delete our page images now, reporting any failure.
    pub fn close(mut self) -> Result<()> {
        if let Some(tmpdir) = self.tmpdir.take() {
            let tmpdir_path = tmpdir.path().to_owned();
            tmpdir.close().with_context(|| {
                format!(
                    "failed to delete temporary directory {:?}",
                    tmpdir_path.display()
                )
            })?;
        }
        Ok(())
    }
}

impl Drop for PageImages {
    fn drop(&mut self) {
        if let Some(tmpdir) = self.tmpdir.take() {
            let tmpdir_path = tmpdir.path().to_owned();
            if let Err(err) = tmpdir.close() {
                error!(
                    directory = ?tmpdir_path.display(),
                    "failed to delete temporary directory: {}",
                    err
                );
            }
        }
    }
}

/// Extract the page number from a `pdftocairo` output filename like
/// `paper-07.jpg`. Files without one sort last.
fn page_number(path: &Path) -> usize {
    path.file_stem()
        .and_then(|stem| {
            let stem = stem.to_string_lossy();
            PAGE_NUMBER_REGEX
                .captures(&stem)
                .and_then(|caps| caps[1].parse::<usize>().ok())
        })
        .unwrap_or(usize::MAX)
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path, options: &RasterizeOptions) -> Result<usize> {
    let mut cmd = options.poppler_command("pdfinfo");
    let output = cmd
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output, None)?;

    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    parse_pdfinfo_page_count(&output)
        .with_context(|| format!("failed to get page count for {:?}", path.display()))
}

/// Parse the `Pages:` property out of `pdfinfo` output.
fn parse_pdfinfo_page_count(output: &str) -> Result<usize> {
    let mut properties = BTreeMap::new();
    for line in output.lines() {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();
        properties.insert(key, value);
    }
    let page_count_str = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    page_count_str
        .parse::<usize>()
        .with_context(|| format!("invalid page count {:?}", page_count_str))
}

/// Add a "last page" argument to a [`Command`].
fn add_last_page_arg_if_needed(
    options: &RasterizeOptions,
    total_pages: usize,
    cmd: &mut Command,
) {
    if let Some(max_pages) = options.max_pages
        && total_pages > max_pages.get()
    {
        // The command-line tools use 1-based page numbers and an inclusive
        // range, so the last page is just `max_pages`.
        cmd.arg("-l").arg(max_pages.to_string());
    }
}

/// Get the MIME type of a file.
pub fn get_mime_type(path: &Path) -> Result<String> {
    Ok(infer::get_from_path(path)
        .with_context(|| format!("failed to get MIME type for {:?}", path.display()))?
        .ok_or_else(|| anyhow!("unknown MIME type for {:?}", path.display()))?
        .mime_type()
        .to_string())
}

#[cfg(test)]
mod tests {
    use std::{fs, process::ExitStatus};

    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[clap(flatten)]
        rasterize: RasterizeOptions,
    }

    /// The output of a quiet, successful command.
    fn quiet_output() -> Output {
        Output {
            status: ExitStatus::default(),
            stdout: vec![],
            stderr: vec![],
        }
    }

    static TEST_PDF_PATH: &str = "tests/fixtures/two_pages.pdf";

    #[test]
    fn is_error_line_works() {
        assert!(is_error_line("error: something went wrong"));
        assert!(is_error_line("ERROR: something went wrong"));
        assert!(!is_error_line("Warning: something is odd"));
        assert!(!is_error_line(
            "Internal Error: xref num 1234 not found but needed, document has changes, reconstruct aborted"
        ));
    }

    #[test]
    fn page_numbers_sort_numerically() {
        let mut paths = vec![
            PathBuf::from("/tmp/x/paper-10.jpg"),
            PathBuf::from("/tmp/x/paper-9.jpg"),
            PathBuf::from("/tmp/x/paper-1.jpg"),
        ];
        paths.sort_by_key(|path| (page_number(path), path.clone()));
        assert_eq!(page_number(&paths[0]), 1);
        assert_eq!(page_number(&paths[1]), 9);
        assert_eq!(page_number(&paths[2]), 10);
        assert_eq!(page_number(Path::new("cover.jpg")), usize::MAX);
    }

    #[test]
    fn pdfinfo_page_count_is_parsed() {
        let output = "Title:          Example\nPages:          12\nEncrypted:      no\n";
        assert_eq!(parse_pdfinfo_page_count(output).unwrap(), 12);
        assert!(parse_pdfinfo_page_count("Title: x\n").is_err());
    }

    #[test]
    fn max_pages_must_be_positive() {
        assert!(TestCli::try_parse_from(["test", "--max-pages", "0"]).is_err());
        let cli = TestCli::try_parse_from(["test", "--max-pages", "2"]).unwrap();
        assert_eq!(cli.rasterize.max_pages, NonZeroUsize::new(2));
        let cli = TestCli::try_parse_from(["test"]).unwrap();
        assert_eq!(cli.rasterize.max_pages, None);
        assert_eq!(cli.rasterize.scale_to, 560);
    }

    #[test]
    fn last_page_arg_only_when_truncating() {
        let options = RasterizeOptions {
            max_pages: NonZeroUsize::new(3),
            ..RasterizeOptions::default()
        };
        let mut cmd = Command::new("pdftocairo");
        add_last_page_arg_if_needed(&options, 3, &mut cmd);
        assert_eq!(cmd.as_std().get_args().count(), 0);
        add_last_page_arg_if_needed(&options, 5, &mut cmd);
        let args = cmd.as_std().get_args().collect::<Vec<_>>();
        assert_eq!(args, ["-l", "3"]);
    }

    #[test]
    fn page_images_are_collected_in_order() -> Result<()> {
        let scratch = tempfile::TempDir::with_prefix("rasterize-test")?;
        let tmpdir = tempfile::TempDir::with_prefix_in("pages", scratch.path())?;
        for name in ["paper-10.jpg", "paper-2.jpg", "paper-1.jpg", "paper.txt"] {
            fs::write(tmpdir.path().join(name), b"")?;
        }
        let page_dir = tmpdir.path().to_owned();
        let options = RasterizeOptions {
            max_pages: NonZeroUsize::new(3),
            ..RasterizeOptions::default()
        };
        let mut output = quiet_output();
        output.stderr = b"Syntax Warning: odd font\n\n".to_vec();
        let pages = PageImages::from_tempdir(&options, tmpdir, 12, &output)?;

        let names = pages
            .paths()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(names, ["paper-1.jpg", "paper-2.jpg", "paper-10.jpg"]);
        assert_eq!(pages.warnings(), ["Syntax Warning: odd font"]);
        assert!(pages.is_incomplete());

        pages.close()?;
        assert!(!page_dir.exists());
        Ok(())
    }

    #[test]
    fn dropping_page_images_deletes_them() -> Result<()> {
        let scratch = tempfile::TempDir::with_prefix("rasterize-test")?;
        let tmpdir = tempfile::TempDir::with_prefix_in("pages", scratch.path())?;
        fs::write(tmpdir.path().join("paper-1.jpg"), b"")?;
        let pages =
            PageImages::from_tempdir(&RasterizeOptions::default(), tmpdir, 1, &quiet_output())?;
        assert!(!pages.is_incomplete());
        let page_dir = pages.paths()[0].parent().unwrap().to_owned();
        assert!(page_dir.exists());

        drop(pages);
        assert!(!page_dir.exists());
        assert_eq!(fs::read_dir(scratch.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn missing_page_images_are_an_error() -> Result<()> {
        let tmpdir = tempfile::TempDir::with_prefix("pages")?;
        let page_dir = tmpdir.path().to_owned();
        let result =
            PageImages::from_tempdir(&RasterizeOptions::default(), tmpdir, 2, &quiet_output());
        let err = result.err().expect("no images should fail");
        assert!(err.to_string().contains("no images for a 2-page PDF"));
        assert!(!page_dir.exists());
        Ok(())
    }

    #[tokio::test]
    async fn non_pdf_input_is_rejected() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("rasterize-test")?;
        let path = dir.path().join("fake.pdf");
        // A PNG signature, whatever the extension says.
        fs::write(&path, b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR")?;
        let result =
            PageImages::from_pdf(&path, &RasterizeOptions::default(), Some(dir.path()))
                .await;
        let err = result.err().expect("non-PDF input should fail");
        assert!(err.to_string().contains("expected a PDF"));
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn page_count_returns_correct_number_of_pages() -> Result<()> {
        let page_count = get_pdf_page_count(Path::new(TEST_PDF_PATH), &RasterizeOptions::default()).await?;
        assert_eq!(page_count, 2);
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn rasterizes_every_page_and_cleans_up() -> Result<()> {
        let scratch = tempfile::TempDir::with_prefix("rasterize-test")?;
        let pages = PageImages::from_pdf(
            Path::new(TEST_PDF_PATH),
            &RasterizeOptions::default(),
            Some(scratch.path()),
        )
        .await?;
        assert_eq!(pages.paths().len(), 2);
        let image = image::open(&pages.paths()[0])?;
        assert_eq!((image.width(), image.height()), (560, 560));
        let page_dir = pages.paths()[0].parent().unwrap().to_owned();
        pages.close()?;
        assert!(!page_dir.exists());
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn rasterize_obeys_max_pages() -> Result<()> {
        let pages = PageImages::from_pdf(
            Path::new(TEST_PDF_PATH),
            &RasterizeOptions {
                scale_to: 100,
                max_pages: NonZeroUsize::new(1),
                ..RasterizeOptions::default()
            },
            None,
        )
        .await?;
        assert_eq!(pages.paths().len(), 1);
        assert_eq!(pages.total_pages(), 2);
        assert!(pages.is_incomplete());
        Ok(())
    }
}
