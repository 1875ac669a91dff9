use crate::services::document::RenderableDocument;
use crate::types::{ChapterRange, TocEntry};
use tracing::{debug, warn};

pub struct ChapterSegmenter;

impl ChapterSegmenter {
    /// One range per ToC entry. Entry `i` spans from its own page up to the
    /// page of entry `i + 1`; the last entry runs to the end of the document.
    pub fn calculate_ranges(toc: &[TocEntry], page_count: usize) -> Vec<ChapterRange> {
        let start_of = |entry: &TocEntry| entry.page.saturating_sub(1).min(page_count);

        toc.iter()
            .enumerate()
            .map(|(idx, entry)| {
                let start_page = start_of(entry);
                let end_page = toc
                    .get(idx + 1)
                    .map(start_of)
                    .unwrap_or(page_count)
                    .max(start_page);

                ChapterRange {
                    start_page,
                    end_page,
                }
            })
            .collect()
    }

    /// Text of every page in the range joined by newlines. Pages that fail
    /// to extract are skipped.
    pub fn range_text(document: &mut dyn RenderableDocument, range: ChapterRange) -> String {
        let mut pages = Vec::with_capacity(range.len());

        for page in range.start_page..range.end_page {
            match document.text(page) {
                Ok(text) => pages.push(text),
                Err(e) => warn!("Skipping page {}: {}", page, e),
            }
        }

        pages.join("\n")
    }

    /// Pairs each ToC entry with the concatenated text of its page range.
    pub fn segment<'a>(
        document: &mut dyn RenderableDocument,
        toc: &'a [TocEntry],
    ) -> Vec<(&'a TocEntry, String)> {
        let ranges = Self::calculate_ranges(toc, document.page_count());

        toc.iter()
            .zip(ranges)
            .map(|(entry, range)| {
                debug!(
                    "Chapter '{}' covers pages {}..{}",
                    entry.title, range.start_page, range.end_page
                );
                (entry, Self::range_text(document, range))
            })
            .collect()
    }
}
