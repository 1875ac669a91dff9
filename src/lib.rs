//! # Ebook Structurer Library
//!
//! Turns page-oriented ebooks into chapter-segmented, typed content.
//! Chapters follow the book's table of contents; each chapter's text is
//! classified into headings, lists, quotes, code blocks, tables, images and
//! plain text. EPUB and MOBI books are supported. Covers are resolved by
//! rendering the first page or, failing that, from the cover the container
//! declares.
//!
//! ## Example Usage
//!
//! ```no_run
//! use ebook_structurer::{BookExtractor, CoverOutcome, ExtractConfig};
//! use std::path::Path;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let extractor = BookExtractor::new(ExtractConfig::default())?;
//!     let book = Path::new("book.epub");
//!
//!     for chapter in extractor.extract_chapters(book)? {
//!         println!("{} ({} blocks)", chapter.title, chapter.structured_content.len());
//!     }
//!
//!     match extractor.extract_cover(book, Path::new("./covers"))? {
//!         CoverOutcome::Extracted(path) => println!("Cover saved to {}", path.display()),
//!         CoverOutcome::NoCover => println!("Book has no cover"),
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod services;
pub mod types;

#[cfg(test)]
mod test_support;

pub use error::{EbookError, Result};
pub use services::{
    BackendRegistry, BookExtractor, ChapterSegmenter, ContentClassifier, CoverResolver,
    DocumentBackend, EpubBackend, MobiBackend, RenderableDocument, SourceResolver,
};
pub use types::{
    Chapter, ChapterRange, ChapterReport, ChapterStructure, ContentBlock, ContentType,
    CoverOutcome, ExtractConfig, TocEntry,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
