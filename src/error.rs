use thiserror::Error;

#[derive(Error, Debug)]
pub enum EbookError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("XML parsing error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Unsupported document format: {path}")]
    UnsupportedFormat { path: String },

    #[error("Invalid container: {reason}")]
    InvalidContainer { reason: String },

    #[error("Archive entry not found: {path}")]
    MissingEntry { path: String },

    #[error("Page {page} out of range (document has {page_count} pages)")]
    PageOutOfRange { page: usize, page_count: usize },

    #[error("Cannot render page {page}: {reason}")]
    Render { page: usize, reason: String },

    #[error("Output directory error: {reason}")]
    OutputDirectory { reason: String },

    #[error("Cover extraction failed: {reason}")]
    CoverExtraction { reason: String },
}

pub type Result<T> = std::result::Result<T, EbookError>;
