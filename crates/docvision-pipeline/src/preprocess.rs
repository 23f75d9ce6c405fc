//! Preprocessor: raw document to ordered, normalized page images.
//!
//! Pipeline: detect type (magic bytes) → render (PDF via `pdftoppm`, raster
//! images decoded directly) → grayscale + downscale → PNG in a scoped
//! working directory.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::{Duration, Instant};

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use docvision_core::defaults::WORKDIR_PREFIX;
use docvision_core::{Error, PageImage, PreprocessConfig, Result};

/// Raster formats accepted as-is (single page).
const IMAGE_MIME_TYPES: &[&str] = &["image/png", "image/jpeg", "image/tiff"];

const PDF_MIME_TYPE: &str = "application/pdf";

/// Timeout for reading the PDF text layer.
const TEXT_LAYER_TIMEOUT_SECS: u64 = 30;

/// Output of [`Preprocessor::prepare`].
///
/// Page files live in `workdir`; dropping the document removes them.
#[derive(Debug)]
pub struct PreparedDocument {
    pub pages: Vec<PageImage>,
    /// PDF text layer, if any.
    pub text: Option<String>,
    pub workdir: TempDir,
}

impl PreparedDocument {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

/// Detected input type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Pdf,
    Image,
}

fn detect(bytes: &[u8], path: &Path) -> Result<SourceKind> {
    match infer::get(bytes).map(|t| t.mime_type()) {
        Some(PDF_MIME_TYPE) => Ok(SourceKind::Pdf),
        Some(mime) if IMAGE_MIME_TYPES.contains(&mime) => Ok(SourceKind::Image),
        Some(mime) => Err(Error::UnsupportedFormat(mime.to_string())),
        None => {
            let ext = path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_else(|| "unknown".to_string());
            Err(Error::UnsupportedFormat(format!(
                "unrecognized content (extension: {ext})"
            )))
        }
    }
}

/// Grayscale, fit within `max_dimension`, PNG-encode.
///
/// Deterministic for identical input.
pub fn normalize_page(img: DynamicImage, max_dimension: u32) -> Result<(Vec<u8>, u32, u32)> {
    let mut gray = img.grayscale();
    if gray.width().max(gray.height()) > max_dimension {
        gray = gray.resize(max_dimension, max_dimension, FilterType::Triangle);
    }
    let (width, height) = (gray.width(), gray.height());
    let mut png = Vec::new();
    gray.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| Error::Internal(format!("PNG encoding failed: {e}")))?;
    Ok((png, width, height))
}

/// Decode each source image, normalize it, and write `page-NNN.png` into
/// `dir`. Runs on the blocking pool.
fn normalize_pages(
    sources: Vec<Vec<u8>>,
    dir: PathBuf,
    max_dimension: u32,
) -> Result<Vec<PageImage>> {
    sources
        .into_iter()
        .enumerate()
        .map(|(index, bytes)| {
            let img = image::load_from_memory(&bytes).map_err(|e| {
                Error::UnreadableDocument(format!("page {} could not be decoded: {e}", index + 1))
            })?;
            let (png, width, height) = normalize_page(img, max_dimension)?;
            let path = dir.join(format!("page-{index:03}.png"));
            std::fs::write(&path, &png)?;
            Ok(PageImage {
                index,
                path,
                png,
                width,
                height,
            })
        })
        .collect()
}

async fn run_tool(cmd: &mut Command, timeout_secs: u64, tool: &str) -> Result<Output> {
    tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.kill_on_drop(true).output())
        .await
        .map_err(|_| Error::UnreadableDocument(format!("{tool} timed out after {timeout_secs}s")))?
        .map_err(|e| Error::Internal(format!("failed to execute {tool}: {e}")))
}

/// Turns raw documents into page images.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Fresh scoped working directory under the configured parent.
    pub fn create_workdir(&self) -> Result<TempDir> {
        let parent = self.config.work_dir();
        std::fs::create_dir_all(&parent)?;
        tempfile::Builder::new()
            .prefix(WORKDIR_PREFIX)
            .tempdir_in(&parent)
            .map_err(|e| Error::Internal(format!("Failed to create working directory: {e}")))
    }

    /// Render `raw_path` into a new working directory.
    pub async fn prepare(&self, raw_path: &Path) -> Result<PreparedDocument> {
        let workdir = self.create_workdir()?;
        self.prepare_in(raw_path, workdir).await
    }

    /// Render `raw_path` into `workdir`. The directory is removed when the
    /// returned document (or the error path) drops it.
    #[instrument(skip(self, workdir), fields(subsystem = "pipeline", component = "preprocessor", op = "prepare", path = %raw_path.display()))]
    pub async fn prepare_in(&self, raw_path: &Path, workdir: TempDir) -> Result<PreparedDocument> {
        let start = Instant::now();
        let bytes = tokio::fs::read(raw_path).await.map_err(|e| {
            Error::UnreadableDocument(format!("cannot read {}: {e}", raw_path.display()))
        })?;
        if bytes.is_empty() {
            return Err(Error::UnreadableDocument(format!(
                "{} is empty",
                raw_path.display()
            )));
        }

        let kind = detect(&bytes, raw_path)?;
        let (sources, text) = match kind {
            SourceKind::Pdf => {
                let sources = self.render_pdf(raw_path, workdir.path()).await?;
                let text = self.read_text_layer(raw_path).await;
                (sources, text)
            }
            SourceKind::Image => (vec![bytes], None),
        };

        let dir = workdir.path().to_path_buf();
        let max_dimension = self.config.max_dimension;
        let pages = tokio::task::spawn_blocking(move || normalize_pages(sources, dir, max_dimension))
            .await
            .map_err(|e| Error::Internal(format!("page normalization task failed: {e}")))??;

        debug!(
            page_count = pages.len(),
            has_text = text.is_some(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Document prepared"
        );
        Ok(PreparedDocument {
            pages,
            text,
            workdir,
        })
    }

    /// Rasterize up to `max_pages` pages; returns the PNG bytes in page order.
    async fn render_pdf(&self, pdf: &Path, dir: &Path) -> Result<Vec<Vec<u8>>> {
        let render_dir = dir.join("render");
        tokio::fs::create_dir_all(&render_dir).await?;
        let prefix = render_dir.join("render");

        let mut cmd = Command::new("pdftoppm");
        cmd.arg("-png")
            .arg("-r")
            .arg(self.config.dpi.to_string())
            .arg("-l")
            .arg(self.config.max_pages.max(1).to_string())
            .arg(pdf)
            .arg(&prefix);
        let output = run_tool(&mut cmd, self.config.render_timeout_secs, "pdftoppm").await?;
        if !output.status.success() {
            return Err(Error::UnreadableDocument(format!(
                "pdftoppm failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // pdftoppm zero-pads page numbers to a common width, so name order
        // is page order.
        let mut rendered = Vec::new();
        let mut entries = tokio::fs::read_dir(&render_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("png") {
                rendered.push(path);
            }
        }
        rendered.sort();

        if rendered.is_empty() {
            return Err(Error::UnreadableDocument("PDF has no pages".to_string()));
        }

        let mut sources = Vec::with_capacity(rendered.len());
        for path in &rendered {
            sources.push(tokio::fs::read(path).await?);
        }
        tokio::fs::remove_dir_all(&render_dir).await?;
        Ok(sources)
    }

    /// Text layer of the first `max_pages` pages; `None` when absent or
    /// `pdftotext` fails.
    async fn read_text_layer(&self, pdf: &Path) -> Option<String> {
        let mut cmd = Command::new("pdftotext");
        cmd.arg("-l")
            .arg(self.config.max_pages.max(1).to_string())
            .arg("-layout")
            .arg(pdf)
            .arg("-");
        match run_tool(&mut cmd, TEXT_LAYER_TIMEOUT_SECS, "pdftotext").await {
            Ok(output) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
                (!text.is_empty()).then_some(text)
            }
            Ok(output) => {
                warn!(status = %output.status, "pdftotext failed, continuing without text layer");
                None
            }
            Err(e) => {
                warn!(error = %e, "pdftotext unavailable, continuing without text layer");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, RgbImage};

    fn png_bytes(img: DynamicImage) -> Vec<u8> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn preprocessor(dir: &Path) -> Preprocessor {
        Preprocessor::new(
            PreprocessConfig::default()
                .with_work_dir(dir)
                .with_max_pages(2),
        )
    }

    #[test]
    fn test_detect_by_magic_bytes() {
        let png = png_bytes(DynamicImage::ImageLuma8(GrayImage::new(2, 2)));
        assert_eq!(detect(&png, Path::new("x.bin")).unwrap(), SourceKind::Image);
        assert_eq!(
            detect(b"%PDF-1.7\n...", Path::new("x")).unwrap(),
            SourceKind::Pdf
        );
    }

    #[test]
    fn test_detect_rejects_other_content() {
        let err = detect(b"PK\x03\x04zipdata", Path::new("letter.docx")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));

        let err = detect(b"plain text", Path::new("notes.txt")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(msg) if msg.contains("txt")));
    }

    #[test]
    fn test_normalize_page_downscales_longest_side() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(400, 100));
        let (png, w, h) = normalize_page(img, 200).unwrap();
        assert_eq!((w, h), (200, 50));
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!(decoded.color(), image::ColorType::L8);
    }

    #[test]
    fn test_normalize_page_keeps_small_pages() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(30, 40, Luma([7])));
        let (_, w, h) = normalize_page(img, 3072).unwrap();
        assert_eq!((w, h), (30, 40));
    }

    #[test]
    fn test_normalize_page_is_deterministic() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(64, 48, |x, y| {
            image::Rgb([(x * 3) as u8, (y * 5) as u8, 90])
        }));
        let a = normalize_page(img.clone(), 32).unwrap();
        let b = normalize_page(img, 32).unwrap();
        assert_eq!(a.0, b.0);
    }

    #[tokio::test]
    async fn test_prepare_image_writes_page_into_workdir() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("scan.png");
        std::fs::write(
            &src,
            png_bytes(DynamicImage::ImageRgb8(RgbImage::new(10, 20))),
        )
        .unwrap();

        let pre = preprocessor(tmp.path());
        let doc = pre.prepare(&src).await.unwrap();
        assert_eq!(doc.page_count(), 1);
        assert!(doc.text.is_none());
        assert!(doc.pages[0].path.starts_with(doc.workdir.path()));
        assert!(doc.pages[0].path.exists());

        let workdir = doc.workdir.path().to_path_buf();
        assert!(workdir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(WORKDIR_PREFIX));
        drop(doc);
        assert!(!workdir.exists());
    }

    #[tokio::test]
    async fn test_missing_file_is_unreadable_and_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let pre = preprocessor(tmp.path());
        let err = pre.prepare(&tmp.path().join("nope.pdf")).await.unwrap_err();
        assert!(matches!(err, Error::UnreadableDocument(_)));
        // Only the missing-file path itself was referenced; no workdir left.
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_empty_file_is_unreadable() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("empty.pdf");
        std::fs::write(&src, b"").unwrap();
        let err = preprocessor(tmp.path()).prepare(&src).await.unwrap_err();
        assert!(matches!(err, Error::UnreadableDocument(_)));
    }

    #[tokio::test]
    async fn test_truncated_image_is_unreadable() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("cut.png");
        let png = png_bytes(DynamicImage::ImageRgb8(RgbImage::new(50, 50)));
        std::fs::write(&src, &png[..png.len() / 2]).unwrap();
        let err = preprocessor(tmp.path()).prepare(&src).await.unwrap_err();
        assert!(matches!(err, Error::UnreadableDocument(_)));
    }

    #[tokio::test]
    async fn test_unsupported_content() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("letter.txt");
        std::fs::write(&src, b"Dear Sir or Madam").unwrap();
        let err = preprocessor(tmp.path()).prepare(&src).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[tokio::test]
    #[ignore = "requires poppler-utils"]
    async fn test_corrupt_pdf_is_unreadable() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("broken.pdf");
        std::fs::write(&src, b"%PDF-1.4\n%broken").unwrap();
        let err = preprocessor(tmp.path()).prepare(&src).await.unwrap_err();
        assert!(matches!(err, Error::UnreadableDocument(_)));
    }
}
