use crate::error::{EbookError, Result};
use crate::services::document::{has_extension, DocumentBackend};
use crate::services::mobi::{image_extension, MobiBackend, MobiBook};
use crate::services::package::{open_package, parent_dir, read_entry, resolve_href};
use crate::types::CoverOutcome;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use zip::ZipArchive;

/// Result of a single cover strategy.
#[derive(Debug)]
pub enum StrategyOutcome {
    Found(PathBuf),
    /// The strategy could inspect the book and it declares no cover.
    NoCover,
    /// The strategy could not run; the next one is tried.
    Failed(EbookError),
}

pub trait CoverStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Strategies that only understand one container format skip the rest.
    fn applies_to(&self, _source: &Path) -> bool {
        true
    }

    fn extract(&self, source: &Path, output_dir: &Path) -> StrategyOutcome;
}

/// Tries cover strategies in order until one produces a file.
pub struct CoverResolver {
    strategies: Vec<Box<dyn CoverStrategy>>,
}

impl CoverResolver {
    /// Raster rendering of the first page, then the cover the container
    /// itself declares (EPUB manifest or MOBI EXTH record).
    pub fn new(backend: Arc<dyn DocumentBackend>, jpeg_quality: u8) -> Self {
        Self::with_strategies(vec![
            Box::new(RasterCover {
                backend,
                jpeg_quality,
            }),
            Box::new(ArchiveCover),
            Box::new(MobiCover),
        ])
    }

    pub fn with_strategies(strategies: Vec<Box<dyn CoverStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn resolve(&self, source: &Path, output_dir: &Path) -> Result<CoverOutcome> {
        if !source.is_file() {
            return Err(EbookError::FileNotFound {
                path: source.display().to_string(),
            });
        }

        let mut failures = Vec::new();
        let mut declared_no_cover = false;

        for strategy in self.strategies.iter().filter(|s| s.applies_to(source)) {
            match strategy.extract(source, output_dir) {
                StrategyOutcome::Found(path) => {
                    info!(
                        "Extracted cover of {} via {} strategy: {}",
                        source.display(),
                        strategy.name(),
                        path.display()
                    );
                    return Ok(CoverOutcome::Extracted(path));
                }
                StrategyOutcome::NoCover => {
                    debug!("{} strategy found no cover in {}", strategy.name(), source.display());
                    declared_no_cover = true;
                }
                StrategyOutcome::Failed(e) => {
                    warn!("{} cover strategy failed for {}: {}", strategy.name(), source.display(), e);
                    failures.push(format!("{}: {}", strategy.name(), e));
                }
            }
        }

        if declared_no_cover {
            return Ok(CoverOutcome::NoCover);
        }

        Err(EbookError::CoverExtraction {
            reason: if failures.is_empty() {
                "no cover strategies configured".to_string()
            } else {
                failures.join("; ")
            },
        })
    }
}

/// Renders page 0 through the document backend and saves it as JPEG.
pub struct RasterCover {
    pub backend: Arc<dyn DocumentBackend>,
    pub jpeg_quality: u8,
}

impl RasterCover {
    fn render(&self, source: &Path, output_dir: &Path) -> Result<PathBuf> {
        let image = {
            let mut document = self.backend.open(source)?;
            document.image(0)?
        };

        ensure_output_directory(output_dir)?;
        let output_path = output_dir.join(cover_file_name(source, "jpg"));

        let mut writer = BufWriter::new(File::create(&output_path)?);
        let rgb = image.to_rgb8();
        JpegEncoder::new_with_quality(&mut writer, self.jpeg_quality).write_image(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            ExtendedColorType::Rgb8,
        )?;
        writer.flush()?;

        Ok(output_path)
    }
}

impl CoverStrategy for RasterCover {
    fn name(&self) -> &'static str {
        "raster"
    }

    fn extract(&self, source: &Path, output_dir: &Path) -> StrategyOutcome {
        match self.render(source, output_dir) {
            Ok(path) => StrategyOutcome::Found(path),
            Err(e) => StrategyOutcome::Failed(e),
        }
    }
}

/// Reads the cover declared by the package manifest of a zip container and
/// copies it out unchanged.
pub struct ArchiveCover;

impl ArchiveCover {
    fn copy_cover(&self, source: &Path, output_dir: &Path) -> Result<Option<PathBuf>> {
        let mut archive = ZipArchive::new(BufReader::new(File::open(source)?))?;
        let (opf_path, package) = open_package(&mut archive)?;

        let Some(href) = package.cover_href() else {
            return Ok(None);
        };

        let entry_path = resolve_href(parent_dir(&opf_path), href);
        debug!("Cover entry resolved to {}", entry_path);
        let bytes = read_entry(&mut archive, &entry_path)?;

        ensure_output_directory(output_dir)?;
        let extension = Path::new(&entry_path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("jpg");
        let output_path = output_dir.join(cover_file_name(source, extension));
        fs::write(&output_path, bytes)?;

        Ok(Some(output_path))
    }
}

impl CoverStrategy for ArchiveCover {
    fn name(&self) -> &'static str {
        "archive"
    }

    fn applies_to(&self, source: &Path) -> bool {
        has_extension(source, "epub")
    }

    fn extract(&self, source: &Path, output_dir: &Path) -> StrategyOutcome {
        match self.copy_cover(source, output_dir) {
            Ok(Some(path)) => StrategyOutcome::Found(path),
            Ok(None) => StrategyOutcome::NoCover,
            Err(e) => StrategyOutcome::Failed(e),
        }
    }
}

/// Copies the image record named by the EXTH cover offset of a MOBI book.
pub struct MobiCover;

impl MobiCover {
    fn copy_cover(&self, source: &Path, output_dir: &Path) -> Result<Option<PathBuf>> {
        let book = MobiBook::parse(fs::read(source)?)?;
        let Some(bytes) = book.declared_cover() else {
            return Ok(None);
        };

        ensure_output_directory(output_dir)?;
        let extension = image_extension(bytes).unwrap_or("jpg");
        let output_path = output_dir.join(cover_file_name(source, extension));
        fs::write(&output_path, bytes)?;

        Ok(Some(output_path))
    }
}

impl CoverStrategy for MobiCover {
    fn name(&self) -> &'static str {
        "exth"
    }

    fn applies_to(&self, source: &Path) -> bool {
        MobiBackend::accepts(source)
    }

    fn extract(&self, source: &Path, output_dir: &Path) -> StrategyOutcome {
        match self.copy_cover(source, output_dir) {
            Ok(Some(path)) => StrategyOutcome::Found(path),
            Ok(None) => StrategyOutcome::NoCover,
            Err(e) => StrategyOutcome::Failed(e),
        }
    }
}

/// `<stem>_cover.<extension>` for every strategy.
pub fn cover_file_name(source: &Path, extension: &str) -> String {
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("book");
    format!("{}_cover.{}", stem, extension)
}

fn ensure_output_directory(output_dir: &Path) -> Result<()> {
    fs::create_dir_all(output_dir).map_err(|e| EbookError::OutputDirectory {
        reason: format!("Failed to create {}: {}", output_dir.display(), e),
    })
}
