pub mod classifier;
pub mod compression;
pub mod cover;
pub mod document;
pub mod epub;
pub mod extractor;
pub mod metadata;
pub mod mobi;
pub mod package;
pub mod reflow;
pub mod segmenter;
pub mod sources;

pub use classifier::ContentClassifier;
pub use cover::{CoverResolver, CoverStrategy, StrategyOutcome};
pub use document::{BackendRegistry, DocumentBackend, RenderableDocument};
pub use epub::{EpubBackend, EpubDocument};
pub use extractor::BookExtractor;
pub use metadata::normalize_metadata;
pub use mobi::{clean_mobi_title, MobiBackend, MobiDocument};
pub use segmenter::ChapterSegmenter;
pub use sources::SourceResolver;
