use crate::error::Result;
use crate::services::classifier::ContentClassifier;
use crate::services::cover::CoverResolver;
use crate::services::document::{BackendRegistry, DocumentBackend};
use crate::services::metadata::normalize_metadata;
use crate::services::segmenter::ChapterSegmenter;
use crate::types::{Chapter, ChapterStructure, CoverOutcome, ExtractConfig, TocEntry};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Entry points of the structuring pipeline over one document backend.
///
/// Every call opens the document, processes it completely and releases it
/// before returning; no state is shared between calls.
pub struct BookExtractor {
    backend: Arc<dyn DocumentBackend>,
    classifier: ContentClassifier,
    config: ExtractConfig,
}

impl BookExtractor {
    pub fn new(config: ExtractConfig) -> Result<Self> {
        Self::with_backend(Arc::new(BackendRegistry::default()), config)
    }

    pub fn with_backend(backend: Arc<dyn DocumentBackend>, config: ExtractConfig) -> Result<Self> {
        Ok(Self {
            backend,
            classifier: ContentClassifier::new()?,
            config,
        })
    }

    pub fn config(&self) -> &ExtractConfig {
        &self.config
    }

    pub fn supports(&self, path: &Path) -> bool {
        self.backend.supports(path)
    }

    /// Segments the document by its table of contents and classifies each
    /// chapter. A document without a table of contents yields no chapters.
    pub fn extract_chapters(&self, path: &Path) -> Result<Vec<Chapter>> {
        info!("Extracting chapters from {}", path.display());

        let mut document = self.backend.open(path)?;
        let toc = document.table_of_contents()?;
        if toc.is_empty() {
            info!("{} has no table of contents", path.display());
            return Ok(Vec::new());
        }

        let chapters: Vec<Chapter> = ChapterSegmenter::segment(document.as_mut(), &toc)
            .into_iter()
            .map(|(entry, text)| self.build_chapter(entry, &text))
            .collect();

        info!(
            "Extracted {} chapters from {} ({} pages)",
            chapters.len(),
            path.display(),
            document.page_count()
        );
        Ok(chapters)
    }

    fn build_chapter(&self, entry: &TocEntry, text: &str) -> Chapter {
        let structured_content = self.classifier.classify(text);
        let raw_content: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        debug!(
            "Chapter '{}': {} lines, {} blocks",
            entry.title,
            raw_content.len(),
            structured_content.len()
        );

        Chapter {
            title: entry.title.clone(),
            raw_content,
            structured_content,
            level: entry.level + 1,
        }
    }

    /// Titles, levels and locations only; no page text is read.
    pub fn extract_chapter_list(&self, path: &Path) -> Result<Vec<ChapterStructure>> {
        let mut document = self.backend.open(path)?;
        let toc = document.table_of_contents()?;

        Ok(toc.into_iter().map(chapter_structure).collect())
    }

    pub fn extract_metadata(&self, path: &Path) -> Result<BTreeMap<String, String>> {
        let document = self.backend.open(path)?;
        Ok(normalize_metadata(&document.metadata()))
    }

    pub fn extract_cover(&self, path: &Path, output_dir: &Path) -> Result<CoverOutcome> {
        CoverResolver::new(Arc::clone(&self.backend), self.config.jpeg_quality)
            .resolve(path, output_dir)
    }
}

fn chapter_structure(entry: TocEntry) -> ChapterStructure {
    let location = entry
        .location
        .unwrap_or_else(|| format!("#page={}", entry.page));

    ChapterStructure {
        title: entry.title,
        level: entry.level,
        location,
    }
}
