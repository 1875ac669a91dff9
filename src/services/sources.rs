use crate::error::{EbookError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

pub struct SourceResolver;

impl SourceResolver {
    /// Expands the given sources into book files. Files are taken as-is;
    /// directories are walked for files accepted by `is_book`.
    pub fn resolve_sources<F>(sources: &[String], is_book: F) -> Result<Vec<PathBuf>>
    where
        F: Fn(&Path) -> bool,
    {
        let mut resolved = Vec::new();

        for source in sources {
            let path = Path::new(source);

            if path.is_file() {
                resolved.push(path.to_path_buf());
            } else if path.is_dir() {
                let found = Self::walk_directory(path, &is_book);
                info!("Found {} books in {}", found.len(), path.display());
                resolved.extend(found);
            } else {
                return Err(EbookError::FileNotFound {
                    path: source.clone(),
                });
            }
        }

        Ok(resolved)
    }

    fn walk_directory<F>(dir: &Path, is_book: &F) -> Vec<PathBuf>
    where
        F: Fn(&Path) -> bool,
    {
        let mut books: Vec<PathBuf> = WalkDir::new(dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!("Skipping unreadable entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file() && is_book(entry.path()))
            .map(|entry| entry.into_path())
            .collect();

        books.sort();
        books
    }

    /// File name used for outputs derived from `source`.
    pub fn display_name(source: &Path) -> String {
        source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string()
    }
}
