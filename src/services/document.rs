use crate::error::{EbookError, Result};
use crate::types::TocEntry;
use image::DynamicImage;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// An opened, page-oriented document.
///
/// The handle is released when dropped, so every exit path of a caller
/// closes it exactly once.
pub trait RenderableDocument {
    fn page_count(&self) -> usize;

    /// Plain text of the 0-based page `page`.
    fn text(&mut self, page: usize) -> Result<String>;

    fn table_of_contents(&mut self) -> Result<Vec<TocEntry>>;

    /// Raster image of the 0-based page `page`.
    fn image(&mut self, page: usize) -> Result<DynamicImage>;

    /// Raw metadata exactly as stored in the document.
    fn metadata(&self) -> HashMap<String, String>;
}

/// Opens documents of one or more formats.
pub trait DocumentBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, path: &Path) -> bool;

    fn open(&self, path: &Path) -> Result<Box<dyn RenderableDocument>>;
}

/// Dispatches `open` to the first backend that supports the path.
pub struct BackendRegistry {
    backends: Vec<Box<dyn DocumentBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
        }
    }

    pub fn with_backend(mut self, backend: Box<dyn DocumentBackend>) -> Self {
        self.backends.push(backend);
        self
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
            .with_backend(Box::new(super::epub::EpubBackend))
            .with_backend(Box::new(super::mobi::MobiBackend))
    }
}

impl DocumentBackend for BackendRegistry {
    fn name(&self) -> &'static str {
        "registry"
    }

    fn supports(&self, path: &Path) -> bool {
        self.backends.iter().any(|b| b.supports(path))
    }

    fn open(&self, path: &Path) -> Result<Box<dyn RenderableDocument>> {
        if !path.is_file() {
            return Err(EbookError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let backend = self
            .backends
            .iter()
            .find(|b| b.supports(path))
            .ok_or_else(|| EbookError::UnsupportedFormat {
                path: path.display().to_string(),
            })?;

        debug!("Opening {} with {} backend", path.display(), backend.name());
        backend.open(path)
    }
}

/// Case-insensitive extension check shared by backends.
pub fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(extension))
}
