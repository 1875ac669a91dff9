use crate::error::{EbookError, Result};
use crate::services::document::{has_extension, DocumentBackend, RenderableDocument};
use crate::services::package::{
    open_package, parent_dir, parse_ncx, read_entry, resolve_href, Package,
};
use crate::services::reflow;
use crate::types::TocEntry;
use image::DynamicImage;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use tracing::{debug, info};
use zip::ZipArchive;

/// Opens `.epub` files. Each spine document is one page.
pub struct EpubBackend;

impl DocumentBackend for EpubBackend {
    fn name(&self) -> &'static str {
        "epub"
    }

    fn supports(&self, path: &Path) -> bool {
        has_extension(path, "epub")
    }

    fn open(&self, path: &Path) -> Result<Box<dyn RenderableDocument>> {
        let file = File::open(path)?;
        let document = EpubDocument::from_reader(BufReader::new(file))?;
        info!(
            "Opened EPUB {} ({} pages)",
            path.display(),
            document.page_count()
        );
        Ok(Box::new(document))
    }
}

pub struct EpubDocument<R: Read + Seek> {
    archive: ZipArchive<R>,
    opf_path: String,
    package: Package,
    /// Archive paths of the spine documents, in reading order.
    pages: Vec<String>,
}

impl<R: Read + Seek> EpubDocument<R> {
    pub fn from_reader(reader: R) -> Result<Self> {
        let mut archive = ZipArchive::new(reader)?;
        let (opf_path, package) = open_package(&mut archive)?;

        let opf_dir = parent_dir(&opf_path);
        let pages: Vec<String> = package
            .spine_items()
            .map(|item| resolve_href(opf_dir, &item.href))
            .collect();

        debug!(
            "Package {} lists {} manifest items, {} spine pages",
            opf_path,
            package.manifest.len(),
            pages.len()
        );

        Ok(Self {
            archive,
            opf_path,
            package,
            pages,
        })
    }

    fn page_path(&self, page: usize) -> Result<&str> {
        self.pages
            .get(page)
            .map(String::as_str)
            .ok_or(EbookError::PageOutOfRange {
                page,
                page_count: self.pages.len(),
            })
    }

    fn page_html(&mut self, page: usize) -> Result<(String, String)> {
        let path = self.page_path(page)?.to_string();
        let bytes = read_entry(&mut self.archive, &path)?;
        Ok((path, String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// 1-based page of an archive path; `None` when it is not in the spine.
    fn page_of(&self, path: &str) -> Option<usize> {
        self.pages.iter().position(|p| p == path).map(|idx| idx + 1)
    }

    fn nav_targets(&mut self) -> Result<Vec<(String, String, usize)>> {
        let opf_dir = parent_dir(&self.opf_path).to_string();

        if let Some(ncx) = self.package.ncx_item().cloned() {
            let ncx_path = resolve_href(&opf_dir, &ncx.href);
            let points = parse_ncx(&read_entry(&mut self.archive, &ncx_path)?)?;
            let ncx_dir = parent_dir(&ncx_path);
            return Ok(points
                .into_iter()
                .map(|p| (p.title, resolve_href(ncx_dir, &p.href), p.level))
                .collect());
        }

        if let Some(nav) = self.package.nav_item().cloned() {
            let nav_path = resolve_href(&opf_dir, &nav.href);
            let bytes = read_entry(&mut self.archive, &nav_path)?;
            let nav_dir = parent_dir(&nav_path);
            return Ok(parse_nav_document(&String::from_utf8_lossy(&bytes))
                .into_iter()
                .map(|(title, href, level)| (title, resolve_href(nav_dir, &href), level))
                .collect());
        }

        Ok(Vec::new())
    }
}

impl<R: Read + Seek> RenderableDocument for EpubDocument<R> {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn text(&mut self, page: usize) -> Result<String> {
        let (_, html) = self.page_html(page)?;
        Ok(reflow::page_text(&html))
    }

    fn table_of_contents(&mut self) -> Result<Vec<TocEntry>> {
        let targets = self.nav_targets()?;
        let mut entries = Vec::with_capacity(targets.len());
        let mut last_page = 1;

        for (title, target, level) in targets {
            let page = match self.page_of(&target) {
                Some(page) => page,
                None => {
                    debug!("ToC target {} is not in the spine", target);
                    last_page
                }
            };
            last_page = page;

            entries.push(TocEntry {
                title,
                level,
                page,
                location: Some(target),
            });
        }

        Ok(entries)
    }

    fn image(&mut self, page: usize) -> Result<DynamicImage> {
        let (path, html) = self.page_html(page)?;
        let src = first_image_source(&html).ok_or_else(|| EbookError::Render {
            page,
            reason: "page references no image".to_string(),
        })?;

        let image_path = resolve_href(parent_dir(&path), &src);
        let bytes = read_entry(&mut self.archive, &image_path)?;
        Ok(image::load_from_memory(&bytes)?)
    }

    fn metadata(&self) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        let format = format!("EPUB {}", self.package.version);
        metadata.insert("format".to_string(), format.trim().to_string());

        let fields = [
            ("title", "title"),
            ("creator", "author"),
            ("subject", "subject"),
            ("language", "language"),
            ("publisher", "publisher"),
            ("identifier", "identifier"),
            ("date", "date"),
            ("description", "description"),
            ("rights", "rights"),
        ];

        for (element, key) in fields {
            let values = self.package.dublin_core_values(element);
            if !values.is_empty() {
                metadata.insert(key.to_string(), values.join(", "));
            }
        }

        metadata
    }
}

fn first_image_source(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("img, image").ok()?;

    document.select(&selector).find_map(|el| {
        let element = el.value();
        element
            .attr("src")
            .or_else(|| element.attr("href"))
            .or_else(|| element.attr("xlink:href"))
            .map(str::to_string)
    })
}

/// Flattens the `toc` nav of an EPUB 3 navigation document into
/// (title, href, level) triples.
fn parse_nav_document(html: &str) -> Vec<(String, String, usize)> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("nav") else {
        return Vec::new();
    };

    let navs: Vec<ElementRef<'_>> = document.select(&selector).collect();
    let toc = navs
        .iter()
        .find(|nav| nav.value().attr("epub:type") == Some("toc"))
        .or_else(|| navs.first());

    let mut entries = Vec::new();
    if let Some(nav) = toc {
        for list in nav.children().filter_map(ElementRef::wrap) {
            if list.value().name() == "ol" {
                nav_list(list, 0, &mut entries);
            }
        }
    }
    entries
}

fn nav_list(list: ElementRef<'_>, level: usize, out: &mut Vec<(String, String, usize)>) {
    for item in list
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|c| c.value().name() == "li")
    {
        for child in item.children().filter_map(ElementRef::wrap) {
            match child.value().name() {
                "a" | "span" => {
                    let title = child.text().collect::<Vec<_>>().join(" ");
                    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
                    if !title.is_empty() {
                        let href = child.value().attr("href").unwrap_or_default().to_string();
                        out.push((title, href, level));
                    }
                }
                "ol" => nav_list(child, level + 1, out),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{chapter, png_bytes, EpubFixture};
    use std::io::Cursor;

    fn open(fixture: &EpubFixture) -> EpubDocument<Cursor<Vec<u8>>> {
        EpubDocument::from_reader(Cursor::new(fixture.build())).unwrap()
    }

    #[test]
    fn test_pages_follow_spine() {
        let mut doc = open(&EpubFixture::sample());

        assert_eq!(doc.page_count(), 3);
        assert_eq!(doc.text(0).unwrap(), "# Chapter 1\nFirst line.\nSecond line.");
        assert_eq!(doc.text(1).unwrap(), "# Chapter 2\n- alpha\n- beta");
        assert!(matches!(
            doc.text(3),
            Err(EbookError::PageOutOfRange { page: 3, page_count: 3 })
        ));
    }

    #[test]
    fn test_percent_encoded_spine_href() {
        let mut fixture = EpubFixture::sample();
        fixture.chapters[1] = chapter("text/chapter%20two.xhtml", "Chapter 2", "<p>Second body.</p>");
        let mut doc = open(&fixture);

        assert_eq!(doc.text(1).unwrap(), "Second body.");
        let toc = doc.table_of_contents().unwrap();
        assert_eq!(toc[1].page, 2);
    }

    #[test]
    fn test_toc_from_ncx() {
        let mut doc = open(&EpubFixture::sample());
        let toc = doc.table_of_contents().unwrap();

        let summary: Vec<_> = toc.iter().map(|e| (e.title.as_str(), e.level, e.page)).collect();
        assert_eq!(
            summary,
            vec![("Chapter 1", 0, 1), ("Chapter 2", 0, 2), ("Chapter 3", 0, 3)]
        );
        assert_eq!(toc[1].location.as_deref(), Some("OEBPS/text/ch2.xhtml"));
    }

    #[test]
    fn test_toc_from_nav_document() {
        let mut fixture = EpubFixture::sample();
        fixture.use_nav = true;
        let mut doc = open(&fixture);

        let toc = doc.table_of_contents().unwrap();
        assert_eq!(toc.len(), 3);
        assert_eq!(toc[2].title, "Chapter 3");
        assert_eq!(toc[2].page, 3);
    }

    #[test]
    fn test_nested_nav_levels() {
        let html = r#"<html><body><nav epub:type="landmarks"><ol><li><a href="x">Skip</a></li></ol></nav>
<nav epub:type="toc"><ol>
  <li><a href="p1.xhtml">Part</a><ol><li><a href="c1.xhtml#s">Chapter</a></li></ol></li>
  <li><span>Heading only</span></li>
</ol></nav></body></html>"#;

        assert_eq!(
            parse_nav_document(html),
            vec![
                ("Part".to_string(), "p1.xhtml".to_string(), 0),
                ("Chapter".to_string(), "c1.xhtml#s".to_string(), 1),
                ("Heading only".to_string(), String::new(), 0),
            ]
        );
    }

    #[test]
    fn test_unknown_toc_target_reuses_previous_page() {
        let mut fixture = EpubFixture::sample();
        fixture.chapters.push(chapter("text/ch4.xhtml", "Appendix", "<p>a</p>"));

        let mut doc = open(&fixture);
        // Appendix stays in the NCX but leaves the reading order.
        doc.pages.pop();
        let toc = doc.table_of_contents().unwrap();
        assert_eq!(toc.last().map(|e| e.page), Some(3));
    }

    #[test]
    fn test_metadata_fields() {
        let doc = open(&EpubFixture::sample());
        let metadata = doc.metadata();

        assert_eq!(metadata.get("title").map(String::as_str), Some("A Sample Book"));
        assert_eq!(metadata.get("author").map(String::as_str), Some("Jane Doe"));
        assert_eq!(metadata.get("language").map(String::as_str), Some("en"));
        assert_eq!(metadata.get("format").map(String::as_str), Some("EPUB 2.0"));
        assert!(!metadata.contains_key("publisher"));
    }

    #[test]
    fn test_image_of_first_page() {
        let mut fixture = EpubFixture::sample();
        fixture.chapters.insert(
            0,
            chapter("text/cover.xhtml", "Cover", r#"<div><img src="../images/cover.png" alt="cover"/></div>"#),
        );
        let fixture = fixture.with_image("cover-img", "images/cover.png", None, png_bytes(8, 12));
        let mut doc = open(&fixture);

        let img = doc.image(0).unwrap();
        assert_eq!((img.width(), img.height()), (8, 12));
        assert!(matches!(doc.image(1), Err(EbookError::Render { page: 1, .. })));
    }

    #[test]
    fn test_missing_container_fails_to_open() {
        let mut fixture = EpubFixture::sample();
        fixture.include_container = false;

        let result = EpubDocument::from_reader(Cursor::new(fixture.build()));
        assert!(matches!(result, Err(EbookError::MissingEntry { .. })));
    }
}
